//! Application lifecycle and installer bidding engine for rooftop solar programmes.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
