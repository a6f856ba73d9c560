pub(crate) mod common;

mod bidding;
