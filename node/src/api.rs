//! # REST API
//!
//! The marketplace's two-phase flows over HTTP. The node never holds an
//! account key: every `prepare` endpoint returns an unsigned descriptor, the
//! caller signs it with their wallet and posts the signed bytes back (hex,
//! one string per group member).
//!
//! ## Endpoints
//!
//! | Method | Path                              | Description                               |
//! |--------|-----------------------------------|-------------------------------------------|
//! | GET    | `/health`                         | Liveness check                            |
//! | GET    | `/status`                         | Round, model count, escrow tallies        |
//! | GET    | `/models`                         | Published models                          |
//! | POST   | `/models`                         | Seal + store an artifact, prepare register|
//! | GET    | `/models/:id`                     | One published model                       |
//! | POST   | `/models/pending/:id/confirm`     | Submit the signed register, await id      |
//! | POST   | `/models/pending/:id/resume`      | Poll an in-flight register again          |
//! | POST   | `/purchases`                      | Prepare a purchase group                  |
//! | POST   | `/purchases/open`                 | Submit the signed group, open escrow      |
//! | GET    | `/purchases/:escrow_id`           | Purchase record                           |
//! | GET    | `/escrows`                        | Escrows, filtered by query string         |
//! | GET    | `/escrows/stats`                  | Escrow tallies                            |
//! | GET    | `/escrows/:id`                    | One escrow                                |
//! | POST   | `/escrows/:id/confirm`            | Wait for the purchase payment             |
//! | POST   | `/escrows/:id/release/prepare`    | Release descriptor (publisher signs)      |
//! | POST   | `/escrows/:id/release`            | Submit signed release with the key        |
//! | POST   | `/escrows/:id/refund/prepare`     | Refund descriptor (buyer signs)           |
//! | POST   | `/escrows/:id/refund`             | Submit signed refund                      |
//! | POST   | `/escrows/:id/settlement/resume`  | Poll an in-flight release or refund again |
//! | GET    | `/escrows/:id/key`                | Released key, optionally wrapped          |
//! | POST   | `/escrows/:id/verify-key`         | Check a candidate key against the hash    |
//! | POST   | `/escrows/:id/download`           | Unsealed (still watermarked) artifact     |
//! | POST   | `/names/prepare`                  | Name registry call descriptor             |
//! | POST   | `/names/submit`                   | Submit a signed name call, await answer   |
//! | POST   | `/devnet/fund`                    | Credit an account (faucet mode only)      |

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use desci_contracts::SimulatedLedger;
use desci_protocol::crypto::hybrid::parse_public_key;
use desci_protocol::crypto::keys::{is_valid_address, EncryptionKey};
use desci_protocol::escrow::{EscrowError, EscrowFilter, EscrowState, EscrowStatistics, EscrowStatus, PurchaseRequest};
use desci_protocol::market::{MarketError, Marketplace, NameCall, NameReceipt, PublishError, PublishRequest};
use desci_protocol::transaction::{ProtocolError, SignedSubmission, UnsignedTransactionDescriptor};
use desci_protocol::watermark::WatermarkPosition;

use crate::metrics::{self, SharedMetrics};

/// Largest request body accepted. Artifacts arrive hex-encoded.
pub const MAX_REQUEST_BYTES: usize = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub network: String,
    pub market: Arc<Marketplace>,
    /// The devnet ledger the marketplace submits to.
    pub ledger: Arc<SimulatedLedger>,
    pub metrics: SharedMetrics,
    /// Whether `/devnet/fund` is enabled.
    pub faucet: bool,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/models", get(list_models_handler).post(prepare_publish_handler))
        .route("/models/:model_id", get(model_handler))
        .route("/models/pending/:pending_id/confirm", post(confirm_publish_handler))
        .route("/models/pending/:pending_id/resume", post(resume_publish_handler))
        .route("/purchases", post(prepare_purchase_handler))
        .route("/purchases/open", post(open_purchase_handler))
        .route("/purchases/:escrow_id", get(purchase_handler))
        .route("/escrows", get(list_escrows_handler))
        .route("/escrows/stats", get(escrow_stats_handler))
        .route("/escrows/:escrow_id", get(escrow_handler))
        .route("/escrows/:escrow_id/confirm", post(confirm_funding_handler))
        .route("/escrows/:escrow_id/release/prepare", post(prepare_release_handler))
        .route("/escrows/:escrow_id/release", post(release_handler))
        .route("/escrows/:escrow_id/refund/prepare", post(prepare_refund_handler))
        .route("/escrows/:escrow_id/refund", post(refund_handler))
        .route("/escrows/:escrow_id/settlement/resume", post(resume_settlement_handler))
        .route("/escrows/:escrow_id/key", get(released_key_handler))
        .route("/escrows/:escrow_id/verify-key", post(verify_key_handler))
        .route("/escrows/:escrow_id/download", post(download_handler))
        .route("/names/prepare", post(prepare_name_handler))
        .route("/names/submit", post(submit_name_handler))
        .route("/devnet/fund", post(fund_handler))
        .route_layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics::track_latency,
        ))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Generic error body returned on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Whether the same request may succeed later.
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retryable: bool,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retryable: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                retryable: self.retryable,
            }),
        )
            .into_response()
    }
}

fn protocol_status(e: &ProtocolError) -> StatusCode {
    match e {
        ProtocolError::Validation(_) | ProtocolError::FieldAbsent(_) => StatusCode::BAD_REQUEST,
        ProtocolError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        ProtocolError::Submission(_) | ProtocolError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ProtocolError::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProtocolError::Gateway(_) => StatusCode::BAD_GATEWAY,
        ProtocolError::Signer(_) => StatusCode::BAD_REQUEST,
        ProtocolError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn escrow_status(e: &EscrowError) -> StatusCode {
    match e {
        EscrowError::StateConflict { .. } | EscrowError::SettlementInFlight { .. } => StatusCode::CONFLICT,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::Protocol(p) => protocol_status(p),
        EscrowError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn timed_out(e: &MarketError) -> bool {
    matches!(
        e,
        MarketError::Protocol(ProtocolError::ConfirmationTimeout { .. })
            | MarketError::Escrow(EscrowError::Protocol(ProtocolError::ConfirmationTimeout { .. }))
            | MarketError::Publish(PublishError::Protocol(ProtocolError::ConfirmationTimeout { .. }))
            | MarketError::Publish(PublishError::Escrow(EscrowError::Protocol(
                ProtocolError::ConfirmationTimeout { .. }
            )))
    )
}

impl From<MarketError> for ApiError {
    fn from(e: MarketError) -> Self {
        let status = match &e {
            MarketError::Validation(_) | MarketError::Layer(_) => StatusCode::BAD_REQUEST,
            MarketError::NotFound(_) => StatusCode::NOT_FOUND,
            MarketError::Publish(p) => match p {
                PublishError::Validation(_) | PublishError::Layer(_) => StatusCode::BAD_REQUEST,
                PublishError::NotFound(_) => StatusCode::NOT_FOUND,
                PublishError::RegisterInFlight { .. } => StatusCode::CONFLICT,
                PublishError::Protocol(inner) => protocol_status(inner),
                PublishError::Escrow(inner) => escrow_status(inner),
                PublishError::Store(_) | PublishError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            MarketError::Escrow(inner) => escrow_status(inner),
            MarketError::Protocol(inner) => protocol_status(inner),
            MarketError::Store(_) | MarketError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "request failed");
        }
        Self {
            status,
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        MarketError::from(e).into()
    }
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        MarketError::from(e).into()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Record a confirmation timeout before converting.
fn observe<T>(metrics: &SharedMetrics, result: Result<T, MarketError>) -> ApiResult<T> {
    result.map_err(|e| {
        if timed_out(&e) {
            metrics.confirmations_timed_out_total.inc();
        }
        ApiError::from(e)
    })
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Signed bytes from a wallet: one hex string per transaction, in
/// descriptor order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBody {
    pub transactions: Vec<String>,
}

impl SignedBody {
    fn submission(&self) -> ApiResult<SignedSubmission> {
        let mut decoded = self
            .transactions
            .iter()
            .map(|t| hex::decode(t).map_err(|e| ApiError::bad_request(format!("signed transaction: {e}"))))
            .collect::<ApiResult<Vec<_>>>()?;
        match decoded.len() {
            0 => Err(ApiError::bad_request("no signed transactions")),
            1 => Ok(SignedSubmission::Single(decoded.remove(0))),
            _ => Ok(SignedSubmission::Group(decoded)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    /// Last confirmed ledger round.
    pub round: u64,
    pub models: usize,
    pub escrows: EscrowStatistics,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub license: String,
    pub price: u64,
    pub publisher: String,
    /// Hex artifact bytes.
    pub data: String,
    #[serde(default)]
    pub watermark_owner: Option<String>,
    #[serde(default)]
    pub watermark_position: WatermarkPosition,
}

/// Returned once by `POST /models`. `key` is never shown again.
#[derive(Debug, Serialize, Deserialize)]
pub struct PreparedPublishResponse {
    pub pending_id: String,
    pub cid: String,
    pub key: String,
    pub key_hash: String,
    pub watermark: Option<String>,
    pub descriptor: UnsignedTransactionDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseBody {
    pub model_id: u64,
    pub buyer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreparedPurchaseResponse {
    pub request: PurchaseRequest,
    pub descriptor: UnsignedTransactionDescriptor,
}

/// The price and publisher come from the catalogue, not from here.
#[derive(Debug, Deserialize)]
pub struct OpenPurchaseBody {
    pub model_id: u64,
    pub buyer: String,
    pub signed: SignedBody,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    /// Hex symmetric key from publish time.
    pub key: String,
    pub signed: SignedBody,
}

#[derive(Debug, Deserialize)]
pub struct KeyBody {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    /// Hex X25519 public key to wrap the released key for.
    pub buyer_public: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NameSubmitBody {
    #[serde(flatten)]
    pub call: NameCall,
    pub signed: SignedBody,
}

#[derive(Debug, Deserialize)]
pub struct FundBody {
    pub address: String,
    pub amount: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let escrows = state.market.escrow().statistics()?;
    let models = state.market.list_models()?.len();
    Ok(Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        round: state.ledger.round(),
        models,
        escrows,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_models_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.market.list_models()?))
}

async fn model_handler(State(state): State<AppState>, Path(model_id): Path<u64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.market.get_model(model_id)?))
}

/// `POST /models`: seal, store, and prepare the register transaction.
async fn prepare_publish_handler(
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> ApiResult<Json<PreparedPublishResponse>> {
    let data = hex::decode(&body.data).map_err(|e| ApiError::bad_request(format!("data: {e}")))?;
    let request = PublishRequest {
        name: body.name,
        description: body.description,
        license: body.license,
        price: body.price,
        publisher: body.publisher,
        data,
        watermark_owner: body.watermark_owner,
        watermark_position: body.watermark_position,
    };
    let prepared = state.market.publisher().prepare_publish(request).await?;
    Ok(Json(PreparedPublishResponse {
        pending_id: prepared.pending_id,
        cid: prepared.cid,
        key: prepared.key.to_hex(),
        key_hash: prepared.key_hash,
        watermark: prepared.watermark,
        descriptor: prepared.descriptor,
    }))
}

/// `POST /models/pending/:pending_id/confirm`
async fn confirm_publish_handler(
    State(state): State<AppState>,
    Path(pending_id): Path<String>,
    Json(body): Json<SignedBody>,
) -> ApiResult<impl IntoResponse> {
    let signed = body.submission()?;
    let timeout = state.market.config().protocol.confirmation_timeout;
    let result = state
        .market
        .publisher()
        .confirm_publish(&pending_id, &signed, timeout, None)
        .await
        .map_err(MarketError::from);
    let published = observe(&state.metrics, result)?;
    state.metrics.models_published_total.inc();
    Ok(Json(published))
}

/// `POST /models/pending/:pending_id/resume`
async fn resume_publish_handler(
    State(state): State<AppState>,
    Path(pending_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let timeout = state.market.config().protocol.confirmation_timeout;
    let result = state
        .market
        .publisher()
        .resume_publish(&pending_id, timeout, None)
        .await
        .map_err(MarketError::from);
    let published = observe(&state.metrics, result)?;
    state.metrics.models_published_total.inc();
    Ok(Json(published))
}

/// `POST /purchases`
async fn prepare_purchase_handler(
    State(state): State<AppState>,
    Json(body): Json<PurchaseBody>,
) -> ApiResult<Json<PreparedPurchaseResponse>> {
    if !is_valid_address(&body.buyer) {
        return Err(ApiError::bad_request(format!("invalid buyer address {}", body.buyer)));
    }
    let prepared = state.market.prepare_purchase(body.model_id, &body.buyer).await?;
    Ok(Json(PreparedPurchaseResponse {
        request: prepared.request,
        descriptor: prepared.descriptor,
    }))
}

/// `POST /purchases/open`
async fn open_purchase_handler(
    State(state): State<AppState>,
    Json(body): Json<OpenPurchaseBody>,
) -> ApiResult<impl IntoResponse> {
    let signed = body.signed.submission()?;
    let escrow = state
        .market
        .open_purchase(body.model_id, &body.buyer, &signed)
        .await?;
    state.metrics.escrows_opened_total.inc();
    Ok((StatusCode::CREATED, Json(escrow)))
}

async fn purchase_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .market
        .get_purchase(&escrow_id)?
        .ok_or_else(|| MarketError::NotFound(format!("purchase {escrow_id}")))?;
    Ok(Json(record))
}

/// `GET /escrows?status=pending&buyer=...`
async fn list_escrows_handler(
    State(state): State<AppState>,
    Query(filter): Query<EscrowFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.market.escrow().list_escrows(&filter)?))
}

async fn escrow_stats_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.market.escrow().statistics()?))
}

fn load_escrow(state: &AppState, escrow_id: &str) -> ApiResult<EscrowState> {
    state
        .market
        .escrow()
        .get_escrow(escrow_id)?
        .ok_or_else(|| EscrowError::NotFound(escrow_id.to_owned()).into())
}

async fn escrow_handler(State(state): State<AppState>, Path(escrow_id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(load_escrow(&state, &escrow_id)?))
}

/// `POST /escrows/:id/confirm`: poll until the purchase payment lands.
/// A timeout or rejection comes back as a `failed` escrow, not an error.
async fn confirm_funding_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
) -> ApiResult<Json<EscrowState>> {
    let escrow = observe(
        &state.metrics,
        state
            .market
            .escrow()
            .confirm_funding(&escrow_id, None)
            .await
            .map_err(MarketError::from),
    )?;
    if escrow.status == EscrowStatus::Failed
        && escrow
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("not confirmed"))
    {
        state.metrics.confirmations_timed_out_total.inc();
    }
    Ok(Json(escrow))
}

async fn prepare_release_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
) -> ApiResult<Json<UnsignedTransactionDescriptor>> {
    Ok(Json(state.market.escrow().prepare_release(&escrow_id).await?))
}

/// `POST /escrows/:id/release`: submit the publisher's release and hand
/// over the key.
async fn release_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    Json(body): Json<ReleaseBody>,
) -> ApiResult<Json<EscrowState>> {
    let key = EncryptionKey::from_hex(&body.key).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let signed = body.signed.submission()?;
    let escrow = observe(
        &state.metrics,
        state
            .market
            .escrow()
            .finish_release(&escrow_id, Some(&key), &signed)
            .await
            .map_err(MarketError::from),
    )?;
    state.market.record_completion(&escrow)?;
    Ok(Json(escrow))
}

async fn prepare_refund_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
) -> ApiResult<Json<UnsignedTransactionDescriptor>> {
    Ok(Json(state.market.escrow().prepare_refund(&escrow_id).await?))
}

async fn refund_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    Json(body): Json<SignedBody>,
) -> ApiResult<Json<EscrowState>> {
    let signed = body.submission()?;
    let escrow = observe(
        &state.metrics,
        state
            .market
            .escrow()
            .finish_refund(&escrow_id, &signed)
            .await
            .map_err(MarketError::from),
    )?;
    Ok(Json(escrow))
}

/// `POST /escrows/:id/settlement/resume`
async fn resume_settlement_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
) -> ApiResult<Json<EscrowState>> {
    let escrow = observe(
        &state.metrics,
        state
            .market
            .escrow()
            .resume_settlement(&escrow_id, None)
            .await
            .map_err(MarketError::from),
    )?;
    Ok(Json(escrow))
}

/// `GET /escrows/:id/key?buyer_public=<hex>`
async fn released_key_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<impl IntoResponse> {
    let public = query
        .buyer_public
        .as_deref()
        .map(parse_public_key)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(state.market.escrow().released_key(&escrow_id, public.as_ref())?))
}

async fn verify_key_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    Json(body): Json<KeyBody>,
) -> ApiResult<impl IntoResponse> {
    let valid = state.market.escrow().verify_encryption_key(&escrow_id, &body.key)?;
    Ok(Json(serde_json::json!({ "valid": valid })))
}

/// `POST /escrows/:id/download`: raw bytes, watermark intact.
async fn download_handler(
    State(state): State<AppState>,
    Path(escrow_id): Path<String>,
    Json(body): Json<KeyBody>,
) -> ApiResult<impl IntoResponse> {
    let bytes = state.market.download(&escrow_id, &body.key).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

/// `POST /names/prepare`
async fn prepare_name_handler(
    State(state): State<AppState>,
    Json(call): Json<NameCall>,
) -> ApiResult<Json<UnsignedTransactionDescriptor>> {
    Ok(Json(state.market.names().prepare(&call).await?))
}

/// `POST /names/submit`: the call the signature was made for, plus the
/// signed bytes.
async fn submit_name_handler(
    State(state): State<AppState>,
    Json(body): Json<NameSubmitBody>,
) -> ApiResult<Json<NameReceipt>> {
    let signed = body.signed.submission()?;
    let timeout = state.market.config().protocol.confirmation_timeout;
    let receipt = observe(
        &state.metrics,
        state.market.names().submit(&body.call, &signed, timeout, None).await,
    )?;
    Ok(Json(receipt))
}

/// `POST /devnet/fund`
async fn fund_handler(State(state): State<AppState>, Json(body): Json<FundBody>) -> ApiResult<impl IntoResponse> {
    if !state.faucet {
        return Err(ApiError {
            status: StatusCode::FORBIDDEN,
            message: "faucet is disabled".into(),
            retryable: false,
        });
    }
    if !is_valid_address(&body.address) {
        return Err(ApiError::bad_request(format!("invalid address {}", body.address)));
    }
    state.ledger.fund(&body.address, body.amount);
    tracing::info!(address = %body.address, amount = body.amount, "devnet account funded");
    Ok(Json(serde_json::json!({
        "address": body.address,
        "balance": state.ledger.balance(&body.address),
    })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
