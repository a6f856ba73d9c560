use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::bidding::BidSubmission;
use super::domain::{
    Actor, ActorId, ApplicationId, ApplicationSubmission, AuctionId, BidId, PackageId, PaymentId,
    Role,
};
use super::error::{ErrorKind, ProcurementError};
use super::installers::{InstallerRegistration, PackageDraft, VerificationDecision};
use super::lifecycle::ReviewDecision;
use super::payments::{PaymentOutcome, PaymentRequest, PaymentType};
use super::service::ProcurementService;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
/// Only identity allowed to present the system role over HTTP.
pub const PAYMENT_GATEWAY_ID: &str = "payment-gateway";

type Shared = State<Arc<ProcurementService>>;

/// HTTP endpoints for the application lifecycle, auctions, payments, and installers.
pub fn procurement_router(service: Arc<ProcurementService>) -> Router {
    Router::new()
        .route(
            "/api/v1/applications",
            post(submit_handler).get(my_applications_handler),
        )
        .route("/api/v1/applications/:id", get(application_handler))
        .route("/api/v1/applications/:id/audit", get(audit_handler))
        .route("/api/v1/applications/:id/review", post(review_handler))
        .route("/api/v1/applications/:id/site-visit", post(site_visit_handler))
        .route("/api/v1/applications/:id/decision", post(decision_handler))
        .route("/api/v1/applications/:id/package", post(package_handler))
        .route(
            "/api/v1/applications/:id/auction",
            post(open_auction_handler).get(auction_handler),
        )
        .route("/api/v1/applications/:id/installed", post(installed_handler))
        .route(
            "/api/v1/applications/:id/payments/authorization",
            get(authorization_handler),
        )
        .route("/api/v1/applications/:id/payments", post(create_payment_handler))
        .route("/api/v1/auctions/:id/bids", post(bid_handler))
        .route("/api/v1/auctions/:id/close", post(close_handler))
        .route("/api/v1/auctions/:id/accept", post(accept_handler))
        .route("/api/v1/payments/:id/outcome", post(outcome_handler))
        .route("/api/v1/customers/:id/payments", get(payments_handler))
        .route("/api/v1/installers", post(register_installer_handler))
        .route(
            "/api/v1/installers/:id/verification",
            post(verify_installer_handler),
        )
        .route("/api/v1/installers/:id/packages", post(publish_package_handler))
        .route("/api/v1/packages", get(packages_handler))
        .route("/api/v1/packages/:id/active", post(package_active_handler))
        .with_state(service)
}

/// Error surface of the procurement endpoints.
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated(String),
    Procurement(ProcurementError),
}

impl From<ProcurementError> for ApiError {
    fn from(value: ProcurementError) -> Self {
        Self::Procurement(value)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidTransition | ErrorKind::AuctionClosed | ErrorKind::Conflict => {
            StatusCode::CONFLICT
        }
        ErrorKind::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            ApiError::Unauthenticated(reason) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": reason, "kind": "unauthenticated" }),
            ),
            ApiError::Procurement(err) => {
                let kind = err.kind();
                (
                    status_for(kind),
                    json!({ "error": err.to_string(), "kind": kind.label() }),
                )
            }
        };
        (status, Json(payload)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Resolve the caller from the session headers.
pub fn actor_from(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let id = header(ACTOR_ID_HEADER)
        .ok_or_else(|| ApiError::Unauthenticated(format!("missing {ACTOR_ID_HEADER} header")))?;
    let role = header(ACTOR_ROLE_HEADER)
        .ok_or_else(|| ApiError::Unauthenticated(format!("missing {ACTOR_ROLE_HEADER} header")))?;
    let role = Role::from_str(role)
        .map_err(|_| ApiError::Unauthenticated(format!("unknown role '{role}'")))?;
    if role == Role::System && id != PAYMENT_GATEWAY_ID {
        return Err(ApiError::Unauthenticated(
            "system role is reserved for the payment gateway".to_string(),
        ));
    }
    Ok(Actor::new(id, role))
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse::<T>()
        .map_err(|_| ProcurementError::NotFound(format!("{what} {raw}")).into())
}

fn ok<T: serde::Serialize>(status: StatusCode, body: T) -> ApiResult {
    Ok((status, Json(body)).into_response())
}

async fn submit_handler(
    State(service): Shared,
    headers: HeaderMap,
    Json(submission): Json<ApplicationSubmission>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let application = service.submit_application(&actor, submission).await?;
    ok(StatusCode::CREATED, application)
}

async fn application_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    ok(StatusCode::OK, service.application(&actor, &id)?)
}

/// The caller's own applications, oldest first.
async fn my_applications_handler(State(service): Shared, headers: HeaderMap) -> ApiResult {
    let actor = actor_from(&headers)?;
    ok(StatusCode::OK, service.applications_for(&actor)?)
}

async fn audit_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    ok(StatusCode::OK, service.audit_trail(&actor, &id)?)
}

async fn review_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    let key = request_id(&headers);
    ok(
        StatusCode::OK,
        service.begin_review(&actor, &id, key.as_deref()).await?,
    )
}

#[derive(Debug, Deserialize)]
struct SiteVisitBody {
    visit_at: DateTime<Utc>,
}

async fn site_visit_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SiteVisitBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    let key = request_id(&headers);
    let application = service
        .schedule_site_visit(&actor, &id, body.visit_at, key.as_deref())
        .await?;
    ok(StatusCode::OK, application)
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    decision: ReviewDecision,
    #[serde(default)]
    notes: Option<String>,
}

async fn decision_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    let key = request_id(&headers);
    let application = service
        .decide(&actor, &id, body.decision, body.notes, key.as_deref())
        .await?;
    ok(StatusCode::OK, application)
}

#[derive(Debug, Deserialize)]
struct PackageBody {
    package_id: PackageId,
}

async fn package_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PackageBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    let key = request_id(&headers);
    let application = service
        .select_package(&actor, &id, &body.package_id, key.as_deref())
        .await?;
    ok(StatusCode::OK, application)
}

#[derive(Debug, Deserialize)]
struct OpenAuctionBody {
    #[serde(default)]
    window_hours: Option<u32>,
}

async fn open_auction_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<OpenAuctionBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    let key = request_id(&headers);
    let window = body.window_hours.map(|hours| Duration::hours(i64::from(hours)));
    let auction = service
        .open_auction(&actor, &id, window, key.as_deref())
        .await?;
    ok(StatusCode::CREATED, auction)
}

async fn auction_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    ok(StatusCode::OK, service.auction_for(&actor, &id)?)
}

async fn installed_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    let key = request_id(&headers);
    ok(
        StatusCode::OK,
        service.confirm_installed(&actor, &id, key.as_deref()).await?,
    )
}

#[derive(Debug, Deserialize)]
struct AuthorizationQuery {
    #[serde(rename = "type")]
    payment_type: PaymentType,
}

async fn authorization_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<AuthorizationQuery>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    ok(
        StatusCode::OK,
        service.authorize_payment_as(&actor, &id, query.payment_type)?,
    )
}

async fn create_payment_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<PaymentRequest>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: ApplicationId = parse_id(&id, "application")?;
    ok(
        StatusCode::CREATED,
        service.create_payment(&actor, &id, request).await?,
    )
}

async fn bid_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(submission): Json<BidSubmission>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: AuctionId = parse_id(&id, "auction")?;
    ok(
        StatusCode::CREATED,
        service.submit_bid(&actor, &id, submission).await?,
    )
}

async fn close_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: AuctionId = parse_id(&id, "auction")?;
    ok(StatusCode::OK, service.close_bidding(&actor, &id).await?)
}

#[derive(Debug, Deserialize)]
struct AcceptBody {
    bid_id: BidId,
}

async fn accept_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AcceptBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: AuctionId = parse_id(&id, "auction")?;
    ok(
        StatusCode::OK,
        service.accept_bid(&actor, &id, &body.bid_id).await?,
    )
}

#[derive(Debug, Deserialize)]
struct OutcomeBody {
    outcome: PaymentOutcome,
}

async fn outcome_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<OutcomeBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: PaymentId = parse_id(&id, "payment")?;
    ok(
        StatusCode::OK,
        service.record_payment_outcome(&actor, &id, body.outcome).await?,
    )
}

async fn payments_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(customer): Path<String>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    ok(
        StatusCode::OK,
        service.payments_for(&actor, &ActorId(customer))?,
    )
}

async fn register_installer_handler(
    State(service): Shared,
    headers: HeaderMap,
    Json(registration): Json<InstallerRegistration>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    ok(
        StatusCode::CREATED,
        service.register_installer(&actor, registration).await?,
    )
}

#[derive(Debug, Deserialize)]
struct VerificationBody {
    decision: VerificationDecision,
}

async fn verify_installer_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(installer): Path<String>,
    Json(body): Json<VerificationBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let profile = service
        .verify_installer(&actor, &ActorId(installer), body.decision)
        .await?;
    ok(StatusCode::OK, profile)
}

async fn publish_package_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(installer): Path<String>,
    Json(draft): Json<PackageDraft>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    if actor.id.0 != installer {
        return Err(ProcurementError::Unauthorized(
            "installers publish packages only under their own id".to_string(),
        )
        .into());
    }
    ok(
        StatusCode::CREATED,
        service.publish_package(&actor, draft).await?,
    )
}

async fn packages_handler(State(service): Shared) -> ApiResult {
    ok(StatusCode::OK, service.packages()?)
}

#[derive(Debug, Deserialize)]
struct PackageActiveBody {
    active: bool,
}

async fn package_active_handler(
    State(service): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PackageActiveBody>,
) -> ApiResult {
    let actor = actor_from(&headers)?;
    let id: PackageId = parse_id(&id, "package")?;
    ok(
        StatusCode::OK,
        service.set_package_active(&actor, &id, body.active).await?,
    )
}
