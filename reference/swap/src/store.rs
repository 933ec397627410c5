//! Durable exchange request records.
//!
//! Each node keeps its own copy of every request it takes part in. Updates go
//! through [`ExchangeRequestStore::update`], which applies a mutation to the
//! current record and persists the result only if the mutation succeeds, so a
//! rejected transition leaves the stored record untouched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossnotary_common::{
    AssetRequest, ExchangeRequest, Party, RequestId, RequestStatus, Result, SwapError,
};
use crossnotary_crypto::{PublicKey, SecureHash};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::SwapConfig;

/// A change applied to a stored request.
pub type RequestMutation = Box<dyn FnOnce(&mut ExchangeRequest) -> Result<()> + Send>;

/// Storage of exchange requests, keyed by request id.
#[async_trait]
pub trait ExchangeRequestStore: Send + Sync {
    /// Store a new request. Fails if the id is already present.
    async fn insert(&self, request: ExchangeRequest) -> Result<()>;

    /// Load a request.
    async fn get(&self, id: &RequestId) -> Result<ExchangeRequest>;

    /// Apply `mutation` and persist the result atomically.
    async fn update(&self, id: &RequestId, mutation: RequestMutation) -> Result<ExchangeRequest>;

    /// All requests, oldest first.
    async fn list(&self) -> Result<Vec<ExchangeRequest>>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn ExchangeRequestStore>;

/// Store for the given configuration: PostgreSQL when a database URL is set,
/// in-memory otherwise.
pub async fn connect_store(config: &SwapConfig) -> Result<SharedStore> {
    match &config.database_url {
        Some(url) => {
            let store = PgRequestStore::connect(url).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryRequestStore::new())),
    }
}

fn not_found(id: &RequestId) -> SwapError {
    SwapError::NotFound(format!("request {}", id))
}

/// In-memory request store.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    requests: DashMap<RequestId, ExchangeRequest>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExchangeRequestStore for InMemoryRequestStore {
    async fn insert(&self, request: ExchangeRequest) -> Result<()> {
        match self.requests.entry(request.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SwapError::ValidationFailure(
                format!("request {} already exists", request.id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(request_id = %request.id, "Request stored");
                slot.insert(request);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &RequestId) -> Result<ExchangeRequest> {
        self.requests
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(id))
    }

    async fn update(&self, id: &RequestId, mutation: RequestMutation) -> Result<ExchangeRequest> {
        let mut entry = self.requests.get_mut(id).ok_or_else(|| not_found(id))?;
        let mut updated = entry.value().clone();
        mutation(&mut updated)?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<ExchangeRequest>> {
        let mut requests: Vec<ExchangeRequest> =
            self.requests.iter().map(|entry| entry.value().clone()).collect();
        requests.sort_by_key(|request| request.created_at);
        Ok(requests)
    }
}

/// Flat row layout of an [`ExchangeRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub buyer: String,
    pub buyer_key: String,
    pub seller: String,
    pub seller_key: String,
    pub buyer_asset_kind: String,
    pub buyer_asset_qty: Option<Decimal>,
    pub buyer_asset_id: Option<String>,
    pub seller_asset_kind: String,
    pub seller_asset_qty: Option<Decimal>,
    pub seller_asset_id: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub draft_transfer_id: Option<String>,
    pub escrow_tx_id: Option<String>,
    pub settlement_tx_id: Option<String>,
    pub unsigned_transfer_bytes: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn asset_columns(asset: &AssetRequest) -> (String, Option<Decimal>, Option<String>) {
    match asset {
        AssetRequest::Fungible { kind, amount } => (kind.to_string(), Some(*amount), None),
        AssetRequest::NonFungible { kind, asset_id } => {
            (kind.to_string(), None, Some(asset_id.to_string()))
        }
    }
}

fn asset_from_columns(
    kind: String,
    quantity: Option<Decimal>,
    asset_id: Option<String>,
) -> Result<AssetRequest> {
    match (quantity, asset_id) {
        (Some(quantity), None) => Ok(AssetRequest::fungible(kind, quantity)),
        (None, Some(asset_id)) => Ok(AssetRequest::non_fungible(kind, asset_id)),
        _ => Err(SwapError::Store(format!(
            "asset {} must have exactly one of quantity or id",
            kind
        ))),
    }
}

fn parse_key(hex: &str) -> Result<PublicKey> {
    PublicKey::from_hex(hex).map_err(|e| SwapError::Store(format!("bad key column: {}", e)))
}

fn parse_hash(hex: Option<String>) -> Result<Option<SecureHash>> {
    hex.map(|value| {
        SecureHash::parse(&value).map_err(|e| SwapError::Store(format!("bad hash column: {}", e)))
    })
    .transpose()
}

impl From<&ExchangeRequest> for RequestRecord {
    fn from(request: &ExchangeRequest) -> Self {
        let (buyer_asset_kind, buyer_asset_qty, buyer_asset_id) =
            asset_columns(&request.buyer_asset);
        let (seller_asset_kind, seller_asset_qty, seller_asset_id) =
            asset_columns(&request.seller_asset);

        Self {
            request_id: *request.id.as_uuid(),
            buyer: request.buyer.name.to_string(),
            buyer_key: request.buyer.key.to_hex(),
            seller: request.seller.name.to_string(),
            seller_key: request.seller.key.to_hex(),
            buyer_asset_kind,
            buyer_asset_qty,
            buyer_asset_id,
            seller_asset_kind,
            seller_asset_qty,
            seller_asset_id,
            status: request.status.as_str().to_string(),
            reason: request.reason.clone(),
            draft_transfer_id: request.draft_transfer_id.map(|id| id.to_hex()),
            escrow_tx_id: request.escrow_tx_id.map(|id| id.to_hex()),
            settlement_tx_id: request.settlement_tx_id.map(|id| id.to_hex()),
            unsigned_transfer_bytes: request.unsigned_transfer.clone(),
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

impl TryFrom<RequestRecord> for ExchangeRequest {
    type Error = SwapError;

    fn try_from(record: RequestRecord) -> Result<Self> {
        let status = RequestStatus::parse(&record.status)
            .ok_or_else(|| SwapError::Store(format!("unknown status {}", record.status)))?;

        Ok(ExchangeRequest {
            id: RequestId::from_uuid(record.request_id),
            buyer: Party::new(record.buyer, parse_key(&record.buyer_key)?),
            seller: Party::new(record.seller, parse_key(&record.seller_key)?),
            buyer_asset: asset_from_columns(
                record.buyer_asset_kind,
                record.buyer_asset_qty,
                record.buyer_asset_id,
            )?,
            seller_asset: asset_from_columns(
                record.seller_asset_kind,
                record.seller_asset_qty,
                record.seller_asset_id,
            )?,
            status,
            reason: record.reason,
            draft_transfer_id: parse_hash(record.draft_transfer_id)?,
            unsigned_transfer: record.unsigned_transfer_bytes,
            escrow_tx_id: parse_hash(record.escrow_tx_id)?,
            settlement_tx_id: parse_hash(record.settlement_tx_id)?,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl RequestRecord {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            request_id: row.try_get("request_id")?,
            buyer: row.try_get("buyer")?,
            buyer_key: row.try_get("buyer_key")?,
            seller: row.try_get("seller")?,
            seller_key: row.try_get("seller_key")?,
            buyer_asset_kind: row.try_get("buyer_asset_kind")?,
            buyer_asset_qty: row.try_get("buyer_asset_qty")?,
            buyer_asset_id: row.try_get("buyer_asset_id")?,
            seller_asset_kind: row.try_get("seller_asset_kind")?,
            seller_asset_qty: row.try_get("seller_asset_qty")?,
            seller_asset_id: row.try_get("seller_asset_id")?,
            status: row.try_get("status")?,
            reason: row.try_get("reason")?,
            draft_transfer_id: row.try_get("draft_transfer_id")?,
            escrow_tx_id: row.try_get("escrow_tx_id")?,
            settlement_tx_id: row.try_get("settlement_tx_id")?,
            unsigned_transfer_bytes: row.try_get("unsigned_transfer_bytes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn store_err(err: sqlx::Error) -> SwapError {
    SwapError::Store(err.to_string())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS exchange_requests (
    request_id UUID PRIMARY KEY,
    buyer TEXT NOT NULL,
    buyer_key TEXT NOT NULL,
    seller TEXT NOT NULL,
    seller_key TEXT NOT NULL,
    buyer_asset_kind TEXT NOT NULL,
    buyer_asset_qty NUMERIC,
    buyer_asset_id TEXT,
    seller_asset_kind TEXT NOT NULL,
    seller_asset_qty NUMERIC,
    seller_asset_id TEXT,
    status TEXT NOT NULL,
    reason TEXT,
    draft_transfer_id TEXT,
    escrow_tx_id TEXT,
    settlement_tx_id TEXT,
    unsigned_transfer_bytes BYTEA,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

/// Tables created before escrow ids were recorded.
const ADD_ESCROW_COLUMN: &str =
    "ALTER TABLE exchange_requests ADD COLUMN IF NOT EXISTS escrow_tx_id TEXT";

const INSERT: &str = r#"
INSERT INTO exchange_requests (
    request_id, buyer, buyer_key, seller, seller_key,
    buyer_asset_kind, buyer_asset_qty, buyer_asset_id,
    seller_asset_kind, seller_asset_qty, seller_asset_id,
    status, reason, draft_transfer_id, escrow_tx_id, settlement_tx_id,
    unsigned_transfer_bytes, created_at, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
ON CONFLICT (request_id) DO NOTHING
"#;

const UPDATE: &str = r#"
UPDATE exchange_requests SET
    status = $2, reason = $3, draft_transfer_id = $4, escrow_tx_id = $5,
    settlement_tx_id = $6, unsigned_transfer_bytes = $7, updated_at = $8
WHERE request_id = $1
"#;

/// PostgreSQL request store.
#[derive(Debug, Clone)]
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(store_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the requests table if it is missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query(ADD_ESCROW_COLUMN)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        info!("Request store schema ready");
        Ok(())
    }
}

#[async_trait]
impl ExchangeRequestStore for PgRequestStore {
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn insert(&self, request: ExchangeRequest) -> Result<()> {
        let record = RequestRecord::from(&request);
        let result = sqlx::query(INSERT)
            .bind(record.request_id)
            .bind(record.buyer)
            .bind(record.buyer_key)
            .bind(record.seller)
            .bind(record.seller_key)
            .bind(record.buyer_asset_kind)
            .bind(record.buyer_asset_qty)
            .bind(record.buyer_asset_id)
            .bind(record.seller_asset_kind)
            .bind(record.seller_asset_qty)
            .bind(record.seller_asset_id)
            .bind(record.status)
            .bind(record.reason)
            .bind(record.draft_transfer_id)
            .bind(record.escrow_tx_id)
            .bind(record.settlement_tx_id)
            .bind(record.unsigned_transfer_bytes)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(SwapError::ValidationFailure(format!(
                "request {} already exists",
                request.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: &RequestId) -> Result<ExchangeRequest> {
        let row = sqlx::query("SELECT * FROM exchange_requests WHERE request_id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| not_found(id))?;

        ExchangeRequest::try_from(RequestRecord::from_row(&row).map_err(store_err)?)
    }

    #[instrument(skip(self, mutation), fields(request_id = %id))]
    async fn update(&self, id: &RequestId, mutation: RequestMutation) -> Result<ExchangeRequest> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row = sqlx::query("SELECT * FROM exchange_requests WHERE request_id = $1 FOR UPDATE")
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?
            .ok_or_else(|| not_found(id))?;

        let mut request =
            ExchangeRequest::try_from(RequestRecord::from_row(&row).map_err(store_err)?)?;
        // Dropping `tx` on error rolls back and releases the row lock.
        mutation(&mut request)?;

        let record = RequestRecord::from(&request);
        sqlx::query(UPDATE)
            .bind(record.request_id)
            .bind(record.status)
            .bind(record.reason)
            .bind(record.draft_transfer_id)
            .bind(record.escrow_tx_id)
            .bind(record.settlement_tx_id)
            .bind(record.unsigned_transfer_bytes)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(request)
    }

    async fn list(&self) -> Result<Vec<ExchangeRequest>> {
        let rows = sqlx::query("SELECT * FROM exchange_requests ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|row| ExchangeRequest::try_from(RequestRecord::from_row(row).map_err(store_err)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossnotary_crypto::SigningKey;

    fn create_test_request() -> ExchangeRequest {
        ExchangeRequest::new(
            Party::new("alice", SigningKey::generate().public_key()),
            Party::new("bob", SigningKey::generate().public_key()),
            AssetRequest::fungible("USD", Decimal::new(10050, 2)),
            AssetRequest::non_fungible("ART", "sunflowers"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryRequestStore::new();
        let request = create_test_request();
        store.insert(request.clone()).await.unwrap();

        assert_eq!(store.get(&request.id).await.unwrap(), request);
        assert!(store.insert(request.clone()).await.is_err());
        assert!(matches!(
            store.get(&RequestId::new()).await,
            Err(SwapError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_persisted() {
        let store = InMemoryRequestStore::new();
        let request = create_test_request();
        let id = request.id;
        store.insert(request).await.unwrap();

        store.update(&id, Box::new(|r| r.approve())).await.unwrap();
        let result = store.update(&id, Box::new(|r| r.approve())).await;
        assert!(matches!(result, Err(SwapError::InvalidTransition { .. })));

        let draft = SecureHash::of(b"draft");
        store
            .update(&id, Box::new(move |r| r.record_draft_id(draft)))
            .await
            .unwrap();
        let other = SecureHash::of(b"other draft");
        let result = store
            .update(&id, Box::new(move |r| r.record_draft_id(other)))
            .await;
        assert!(matches!(result, Err(SwapError::ConsistencyFault(_))));

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Approved);
        assert_eq!(stored.draft_transfer_id, Some(draft));
    }

    #[test]
    fn test_record_columns() {
        let mut request = create_test_request();
        request.escrow_tx_id = Some(SecureHash::of(b"escrow"));
        request.settlement_tx_id = Some(SecureHash::of(b"settlement"));
        let record = RequestRecord::from(&request);

        assert_eq!(record.buyer_asset_qty, Some(Decimal::new(10050, 2)));
        assert_eq!(record.buyer_asset_id, None);
        assert_eq!(record.seller_asset_qty, None);
        assert_eq!(record.seller_asset_id.as_deref(), Some("sunflowers"));
        assert_eq!(record.status, "REQUESTED");

        assert_eq!(ExchangeRequest::try_from(record).unwrap(), request);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let mut record = RequestRecord::from(&create_test_request());
        record.status = "PENDING".to_string();
        assert!(matches!(
            ExchangeRequest::try_from(record),
            Err(SwapError::Store(_))
        ));

        let mut record = RequestRecord::from(&create_test_request());
        record.buyer_asset_id = Some("both".to_string());
        assert!(ExchangeRequest::try_from(record).is_err());
    }
}
