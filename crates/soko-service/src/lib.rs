#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use soko_adapters::MockPaystackGateway;
use soko_core::{
    CheckoutRequest, CheckoutResult, CommissionPayment, CommissionSettings, DeliveryConfirmation,
    DeliveryUpdate, Dispute, DisputeKind, DisputeRuling, EngineConfig, EscrowTransaction,
    FilerType, JournalEntry, JournalKind, MarketError, MarketerProfile, Order,
    PaymentConfirmation, PaymentInit, PendingCommission, Referral, ReferralCodeValidation,
    ReferrerType, ReleaseType, SokoEngine, VendorProfile, VendorWallet,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<SokoEngine>,
    pub gateway: Arc<MockPaystackGateway>,
}

impl ServiceState {
    /// Bootstrap the engine with the sandbox gateway adapter. A production
    /// deployment swaps in a live Paystack implementation of the same trait.
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, MarketError> {
        let gateway = Arc::new(MockPaystackGateway::new());
        let engine = SokoEngine::bootstrap(gateway.clone(), config.engine).await?;
        Ok(Self {
            engine: Arc::new(engine),
            gateway,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/vendors", post(register_vendor))
        .route("/v1/marketers", post(register_marketer))
        .route("/v1/checkout", post(checkout))
        .route("/v1/payments/initialize", post(initialize_payment))
        .route("/v1/orders/:order_id", get(get_order))
        .route("/v1/orders/:order_id/escrow", get(get_order_escrow))
        .route("/v1/orders/:order_id/payment/confirm", post(confirm_payment))
        .route("/v1/orders/:order_id/processing", post(mark_processing))
        .route("/v1/orders/:order_id/delivery", post(delivery_update))
        .route("/v1/orders/:order_id/delivery/confirm", post(confirm_delivery))
        .route("/v1/buyers/:buyer_id/orders", get(buyer_orders))
        .route("/v1/escrows/:escrow_id/release", post(release_escrow))
        .route("/v1/escrows/:escrow_id/refund", post(refund_escrow))
        .route("/v1/disputes", post(file_dispute))
        .route("/v1/disputes/:dispute_id", get(get_dispute))
        .route("/v1/disputes/:dispute_id/review", post(review_dispute))
        .route("/v1/disputes/:dispute_id/resolve", post(resolve_dispute))
        .route("/v1/vendors/:vendor_id/wallet", get(vendor_wallet))
        .route("/v1/referrals/validate", post(validate_referral_code))
        .route("/v1/referrals", post(record_referral))
        .route("/v1/commissions/pending", get(pending_commissions))
        .route("/v1/commissions/payments", post(pay_commission))
        .route(
            "/v1/settings/commissions",
            get(get_commission_settings).put(update_commission_settings),
        )
        .route("/v1/journal/entries", get(list_journal_entries))
        .with_state(state)
}

/// API error with the engine taxonomy mapped onto HTTP statuses. Guard
/// violations come back as 409 so clients treat them as settled no-ops
/// instead of retrying into a double execution.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        let status = match &err {
            MarketError::Validation(_) => StatusCode::BAD_REQUEST,
            MarketError::NotFound { .. } => StatusCode::NOT_FOUND,
            MarketError::InvalidState(_) | MarketError::Conflict(_) => StatusCode::CONFLICT,
            MarketError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            MarketError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    currency: String,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "soko-service",
        storage_backend: state.engine.storage_backend(),
        currency: state.engine.config().currency.clone(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterVendorRequest {
    vendor_id: String,
    name: String,
    email: String,
    referral_code: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

async fn register_vendor(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterVendorRequest>,
) -> Result<Json<VendorProfile>, ApiError> {
    let vendor = state
        .engine
        .register_vendor(VendorProfile {
            vendor_id: request.vendor_id,
            name: request.name,
            email: request.email,
            referral_code: request.referral_code,
            active: request.active,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(vendor))
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterMarketerRequest {
    marketer_id: String,
    name: String,
    email: String,
    referral_code: String,
    #[serde(default = "default_active")]
    active: bool,
}

async fn register_marketer(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterMarketerRequest>,
) -> Result<Json<MarketerProfile>, ApiError> {
    let marketer = state
        .engine
        .register_marketer(MarketerProfile {
            marketer_id: request.marketer_id,
            name: request.name,
            email: request.email,
            referral_code: request.referral_code,
            active: request.active,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(marketer))
}

async fn checkout(
    State(state): State<ServiceState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResult>, ApiError> {
    Ok(Json(state.engine.create_orders(request).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct InitializePaymentRequest {
    email: String,
    amount_minor: u64,
    order_ref: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

async fn initialize_payment(
    State(state): State<ServiceState>,
    Json(request): Json<InitializePaymentRequest>,
) -> Result<Json<PaymentInit>, ApiError> {
    let init = state
        .engine
        .initialize_payment(
            &request.email,
            request.amount_minor,
            &request.order_ref,
            request.metadata,
        )
        .await?;
    Ok(Json(init))
}

async fn get_order(
    Path(order_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Order>, ApiError> {
    state
        .engine
        .order(&order_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("order '{order_id}' not found")))
}

async fn get_order_escrow(
    Path(order_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<EscrowTransaction>, ApiError> {
    state
        .engine
        .escrow_for_order(&order_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("order '{order_id}' has no escrow")))
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmPaymentRequest {
    reference: String,
    channel: Option<String>,
}

async fn confirm_payment(
    Path(order_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<PaymentConfirmation>, ApiError> {
    let confirmation = state
        .engine
        .confirm_payment(&order_id, &request.reference, request.channel)
        .await?;
    Ok(Json(confirmation))
}

#[derive(Debug, Clone, Deserialize)]
struct MarkProcessingRequest {
    vendor_id: String,
}

async fn mark_processing(
    Path(order_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<MarkProcessingRequest>,
) -> Result<Json<Order>, ApiError> {
    let order = state
        .engine
        .mark_order_processing(&order_id, &request.vendor_id)
        .await?;
    Ok(Json(order))
}

async fn delivery_update(
    Path(order_id): Path<String>,
    State(state): State<ServiceState>,
    Json(update): Json<DeliveryUpdate>,
) -> Result<Json<DeliveryConfirmation>, ApiError> {
    let confirmation = state.engine.record_delivery_update(&order_id, update).await?;
    Ok(Json(confirmation))
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmDeliveryRequest {
    buyer_id: String,
}

async fn confirm_delivery(
    Path(order_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ConfirmDeliveryRequest>,
) -> Result<Json<DeliveryConfirmation>, ApiError> {
    let confirmation = state
        .engine
        .confirm_delivery(&order_id, &request.buyer_id)
        .await?;
    Ok(Json(confirmation))
}

async fn buyer_orders(
    Path(buyer_id): Path<String>,
    State(state): State<ServiceState>,
) -> Json<Vec<Order>> {
    Json(state.engine.orders_for_buyer(&buyer_id).await)
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseRequest {
    release_type: ReleaseType,
    requested_by: String,
    notes: Option<String>,
}

async fn release_escrow(
    Path(escrow_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ReleaseRequest>,
) -> Result<Json<EscrowTransaction>, ApiError> {
    let escrow = state
        .engine
        .release_escrow(
            &escrow_id,
            request.release_type,
            &request.requested_by,
            request.notes,
        )
        .await?;
    Ok(Json(escrow))
}

#[derive(Debug, Clone, Deserialize)]
struct RefundRequest {
    reason: String,
}

async fn refund_escrow(
    Path(escrow_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<EscrowTransaction>, ApiError> {
    let escrow = state.engine.refund_escrow(&escrow_id, &request.reason).await?;
    Ok(Json(escrow))
}

#[derive(Debug, Clone, Deserialize)]
struct FileDisputeRequest {
    order_id: String,
    filed_by: String,
    filer_type: FilerType,
    kind: DisputeKind,
    description: String,
    #[serde(default)]
    evidence: Vec<String>,
}

async fn file_dispute(
    State(state): State<ServiceState>,
    Json(request): Json<FileDisputeRequest>,
) -> Result<Json<Dispute>, ApiError> {
    let dispute = state
        .engine
        .file_dispute(
            &request.order_id,
            &request.filed_by,
            request.filer_type,
            request.kind,
            &request.description,
            request.evidence,
        )
        .await?;
    Ok(Json(dispute))
}

async fn get_dispute(
    Path(dispute_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Dispute>, ApiError> {
    state
        .engine
        .dispute(&dispute_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("dispute '{dispute_id}' not found")))
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewDisputeRequest {
    admin_id: String,
}

async fn review_dispute(
    Path(dispute_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ReviewDisputeRequest>,
) -> Result<Json<Dispute>, ApiError> {
    let dispute = state
        .engine
        .review_dispute(&dispute_id, &request.admin_id)
        .await?;
    Ok(Json(dispute))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveDisputeRequest {
    ruling: DisputeRuling,
    admin_id: String,
    notes: Option<String>,
}

async fn resolve_dispute(
    Path(dispute_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ResolveDisputeRequest>,
) -> Result<Json<Dispute>, ApiError> {
    let dispute = state
        .engine
        .resolve_dispute(&dispute_id, request.ruling, &request.admin_id, request.notes)
        .await?;
    Ok(Json(dispute))
}

async fn vendor_wallet(
    Path(vendor_id): Path<String>,
    State(state): State<ServiceState>,
) -> Json<VendorWallet> {
    Json(state.engine.vendor_wallet(&vendor_id).await)
}

#[derive(Debug, Clone, Deserialize)]
struct ValidateCodeRequest {
    code: String,
}

async fn validate_referral_code(
    State(state): State<ServiceState>,
    Json(request): Json<ValidateCodeRequest>,
) -> Json<ReferralCodeValidation> {
    Json(state.engine.validate_referral_code(&request.code).await)
}

#[derive(Debug, Clone, Deserialize)]
struct RecordReferralRequest {
    referrer_type: ReferrerType,
    referrer_id: String,
    new_vendor_id: String,
    code: String,
}

async fn record_referral(
    State(state): State<ServiceState>,
    Json(request): Json<RecordReferralRequest>,
) -> Result<Json<Referral>, ApiError> {
    let referral = state
        .engine
        .record_referral(
            request.referrer_type,
            &request.referrer_id,
            &request.new_vendor_id,
            &request.code,
        )
        .await?;
    Ok(Json(referral))
}

#[derive(Debug, Clone, Deserialize)]
struct PendingCommissionsQuery {
    referrer_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct PendingCommissionsResponse {
    items: Vec<PendingCommission>,
}

fn parse_referrer_type(value: &str) -> Result<ReferrerType, ApiError> {
    match value {
        "vendor" => Ok(ReferrerType::Vendor),
        "marketer" => Ok(ReferrerType::Marketer),
        other => Err(ApiError::bad_request(format!(
            "invalid referrer_type '{other}'; expected vendor or marketer"
        ))),
    }
}

async fn pending_commissions(
    State(state): State<ServiceState>,
    Query(query): Query<PendingCommissionsQuery>,
) -> Result<Json<PendingCommissionsResponse>, ApiError> {
    let filter = query
        .referrer_type
        .as_deref()
        .map(parse_referrer_type)
        .transpose()?;
    Ok(Json(PendingCommissionsResponse {
        items: state.engine.pending_commissions(filter).await,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct PayCommissionRequest {
    referral_ids: Vec<String>,
    amount_minor: u64,
    method: String,
    reference: String,
    processed_by: String,
    notes: Option<String>,
}

async fn pay_commission(
    State(state): State<ServiceState>,
    Json(request): Json<PayCommissionRequest>,
) -> Result<Json<CommissionPayment>, ApiError> {
    let payment = state
        .engine
        .pay_commission(
            &request.referral_ids,
            request.amount_minor,
            &request.method,
            &request.reference,
            &request.processed_by,
            request.notes,
        )
        .await?;
    Ok(Json(payment))
}

#[derive(Debug, Clone, Serialize)]
struct CommissionSettingsResponse {
    items: Vec<CommissionSettings>,
}

async fn get_commission_settings(
    State(state): State<ServiceState>,
) -> Json<CommissionSettingsResponse> {
    Json(CommissionSettingsResponse {
        items: state.engine.commission_settings().await,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateSettingsRequest {
    referrer_type: ReferrerType,
    amount_minor: u64,
    active: bool,
    updated_by: String,
}

async fn update_commission_settings(
    State(state): State<ServiceState>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<CommissionSettings>, ApiError> {
    let settings = state
        .engine
        .update_commission_settings(
            request.referrer_type,
            request.amount_minor,
            request.active,
            &request.updated_by,
        )
        .await?;
    Ok(Json(settings))
}

#[derive(Debug, Clone, Deserialize)]
struct JournalEntriesQuery {
    kind: Option<String>,
    order_id: Option<String>,
    escrow_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct JournalEntriesResponse {
    backend: &'static str,
    total: usize,
    returned: usize,
    items: Vec<JournalEntry>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<JournalKind>, ApiError> {
    match kind {
        None => Ok(None),
        Some(value) => soko_core::journal::parse_kind(value).map(Some).map_err(|_| {
            ApiError::bad_request(format!(
                "invalid kind '{value}'; expected one of: escrow_held, escrow_released, \
                 escrow_refunded, escrow_frozen, commission_paid"
            ))
        }),
    }
}

async fn list_journal_entries(
    State(state): State<ServiceState>,
    Query(query): Query<JournalEntriesQuery>,
) -> Result<Json<JournalEntriesResponse>, ApiError> {
    let kind_filter = parse_kind_filter(query.kind.as_deref())?;

    let mut entries = state.engine.journal_entries().await;

    if let Some(order_id) = query.order_id.as_deref() {
        entries.retain(|entry| entry.order_id.as_deref() == Some(order_id));
    }
    if let Some(escrow_id) = query.escrow_id.as_deref() {
        entries.retain(|entry| entry.escrow_id.as_deref() == Some(escrow_id));
    }
    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }

    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    if order == "desc" {
        entries.reverse();
    } else if order != "asc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{order}'; expected asc or desc"
        )));
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();
    let returned = items.len();

    Ok(Json(JournalEntriesResponse {
        backend: state.engine.storage_backend(),
        total,
        returned,
        items,
    }))
}
