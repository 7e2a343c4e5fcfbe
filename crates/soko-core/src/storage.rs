use crate::error::MarketError;
use crate::journal::{kind_to_str, JournalEntry, SettlementJournal};
use crate::types::{
    CommissionPayment, CommissionSettings, DeliveryRecord, Dispute, DisputeStatus,
    EscrowTransaction, MarketerProfile, Order, Referral, ReferrerType, VendorProfile,
    WalletTransaction,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Store persistence backend configuration.
#[derive(Debug, Clone)]
pub enum MarketStoreConfig {
    /// Keep every record in process memory only.
    Memory,
    /// Mirror every write batch to PostgreSQL and hydrate state on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl MarketStoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for MarketStoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// One record mutation inside an atomic write batch.
#[derive(Debug, Clone)]
pub enum StoreWrite {
    PutOrder(Order),
    PutEscrow(EscrowTransaction),
    PutDelivery(DeliveryRecord),
    PutDispute(Dispute),
    AppendWalletTxn(WalletTransaction),
    PutReferral(Referral),
    PutCommissionPayment(CommissionPayment),
    PutCommissionSettings(CommissionSettings),
    PutVendor(VendorProfile),
    PutMarketer(MarketerProfile),
    AppendJournal(JournalEntry),
}

/// The unit of atomic multi-record mutation. Under Postgres the whole batch
/// is one ACID transaction; under memory it commits inside one uninterrupted
/// critical section. Either way there are no partial writes.
pub type WriteBatch = Vec<StoreWrite>;

/// Authoritative in-memory state. All writes go through `commit`, which is
/// only reachable via `MarketStore::persist_and_commit`.
#[derive(Debug, Default)]
pub struct StoreState {
    pub(crate) orders: HashMap<String, Order>,
    pub(crate) escrows: HashMap<String, EscrowTransaction>,
    pub(crate) escrow_by_order: HashMap<String, String>,
    pub(crate) deliveries: HashMap<String, DeliveryRecord>,
    pub(crate) disputes: HashMap<String, Dispute>,
    pub(crate) wallet_txns: Vec<WalletTransaction>,
    pub(crate) wallet_balances: HashMap<String, u64>,
    pub(crate) referrals: HashMap<String, Referral>,
    pub(crate) commission_payments: HashMap<String, CommissionPayment>,
    pub(crate) commission_settings: HashMap<ReferrerType, CommissionSettings>,
    pub(crate) vendors: HashMap<String, VendorProfile>,
    pub(crate) marketers: HashMap<String, MarketerProfile>,
    pub(crate) journal: SettlementJournal,
}

impl StoreState {
    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn orders_by_buyer(&self, buyer_id: &str) -> Vec<&Order> {
        let mut orders: Vec<&Order> = self
            .orders
            .values()
            .filter(|order| order.buyer_id == buyer_id)
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    pub fn escrow(&self, escrow_id: &str) -> Option<&EscrowTransaction> {
        self.escrows.get(escrow_id)
    }

    pub fn escrow_for_order(&self, order_id: &str) -> Option<&EscrowTransaction> {
        self.escrow_by_order
            .get(order_id)
            .and_then(|escrow_id| self.escrows.get(escrow_id))
    }

    pub fn delivery(&self, order_id: &str) -> Option<&DeliveryRecord> {
        self.deliveries.get(order_id)
    }

    pub fn dispute(&self, dispute_id: &str) -> Option<&Dispute> {
        self.disputes.get(dispute_id)
    }

    pub fn unresolved_dispute_for_order(&self, order_id: &str) -> Option<&Dispute> {
        self.disputes
            .values()
            .find(|d| d.order_id == order_id && d.status != DisputeStatus::Resolved)
    }

    pub fn wallet_balance(&self, vendor_id: &str) -> u64 {
        self.wallet_balances.get(vendor_id).copied().unwrap_or(0)
    }

    pub fn wallet_txns_for(&self, vendor_id: &str) -> Vec<&WalletTransaction> {
        self.wallet_txns
            .iter()
            .filter(|txn| txn.vendor_id == vendor_id)
            .collect()
    }

    pub fn referral(&self, referral_id: &str) -> Option<&Referral> {
        self.referrals.get(referral_id)
    }

    pub fn referral_for_vendor(&self, referred_vendor_id: &str) -> Option<&Referral> {
        self.referrals
            .values()
            .find(|r| r.referred_vendor_id == referred_vendor_id)
    }

    pub fn referrals(&self) -> impl Iterator<Item = &Referral> {
        self.referrals.values()
    }

    pub fn vendor(&self, vendor_id: &str) -> Option<&VendorProfile> {
        self.vendors.get(vendor_id)
    }

    pub fn vendor_by_code(&self, code: &str) -> Option<&VendorProfile> {
        self.vendors.values().find(|v| v.referral_code == code)
    }

    pub fn marketer(&self, marketer_id: &str) -> Option<&MarketerProfile> {
        self.marketers.get(marketer_id)
    }

    pub fn marketer_by_code(&self, code: &str) -> Option<&MarketerProfile> {
        self.marketers.values().find(|m| m.referral_code == code)
    }

    pub fn commission_settings(&self, referrer_type: ReferrerType) -> Option<&CommissionSettings> {
        self.commission_settings.get(&referrer_type)
    }

    pub fn all_commission_settings(&self) -> Vec<&CommissionSettings> {
        let mut settings: Vec<&CommissionSettings> = self.commission_settings.values().collect();
        settings.sort_by_key(|s| s.referrer_type);
        settings
    }

    pub fn journal(&self) -> &SettlementJournal {
        &self.journal
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), MarketError> {
        for write in batch {
            match write {
                StoreWrite::PutOrder(order) => {
                    self.orders.insert(order.order_id.clone(), order);
                }
                StoreWrite::PutEscrow(escrow) => {
                    self.escrow_by_order
                        .insert(escrow.order_id.clone(), escrow.escrow_id.clone());
                    self.escrows.insert(escrow.escrow_id.clone(), escrow);
                }
                StoreWrite::PutDelivery(delivery) => {
                    self.deliveries.insert(delivery.order_id.clone(), delivery);
                }
                StoreWrite::PutDispute(dispute) => {
                    self.disputes.insert(dispute.dispute_id.clone(), dispute);
                }
                StoreWrite::AppendWalletTxn(txn) => {
                    self.wallet_balances
                        .insert(txn.vendor_id.clone(), txn.balance_after_minor);
                    self.wallet_txns.push(txn);
                }
                StoreWrite::PutReferral(referral) => {
                    self.referrals.insert(referral.referral_id.clone(), referral);
                }
                StoreWrite::PutCommissionPayment(payment) => {
                    self.commission_payments
                        .insert(payment.payment_id.clone(), payment);
                }
                StoreWrite::PutCommissionSettings(settings) => {
                    self.commission_settings
                        .insert(settings.referrer_type, settings);
                }
                StoreWrite::PutVendor(vendor) => {
                    self.vendors.insert(vendor.vendor_id.clone(), vendor);
                }
                StoreWrite::PutMarketer(marketer) => {
                    self.marketers.insert(marketer.marketer_id.clone(), marketer);
                }
                StoreWrite::AppendJournal(entry) => {
                    self.journal.commit_entry(entry)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum StoreBackend {
    Memory,
    Postgres(PostgresMarketStore),
}

/// Durable record store: an authoritative in-memory state guarded by an
/// `RwLock`, optionally mirrored to PostgreSQL.
///
/// Invariant handling:
/// - A write batch is persisted before it is committed in-memory.
/// - Under Postgres the batch is one transaction; a failed write aborts the
///   whole batch and the in-memory state is untouched.
/// - On startup, Postgres records are hydrated and the settlement journal
///   hash-chain is verified.
#[derive(Debug)]
pub struct MarketStore {
    state: RwLock<StoreState>,
    backend: StoreBackend,
}

impl MarketStore {
    pub async fn bootstrap(config: MarketStoreConfig) -> Result<Self, MarketError> {
        match config {
            MarketStoreConfig::Memory => Ok(Self {
                state: RwLock::new(StoreState::default()),
                backend: StoreBackend::Memory,
            }),
            MarketStoreConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresMarketStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                let state = store.load_state().await?;
                Ok(Self {
                    state: RwLock::new(state),
                    backend: StoreBackend::Postgres(store),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres(_) => "postgres",
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().await
    }

    /// Persist a batch to the durable backend, then commit it in-memory.
    /// Callers hold the write guard across the call, so guard checks and the
    /// mutation are one critical section.
    pub async fn persist_and_commit(
        &self,
        state: &mut StoreState,
        batch: WriteBatch,
    ) -> Result<(), MarketError> {
        if let StoreBackend::Postgres(store) = &self.backend {
            store.apply_batch(&batch).await?;
        }
        state.commit(batch)
    }
}

#[derive(Debug)]
struct PostgresMarketStore {
    pool: PgPool,
}

impl PostgresMarketStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, MarketError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| MarketError::persistence(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), MarketError> {
        // One JSONB document table per record type; the application controls
        // id generation and the journal's deterministic index/hash chain.
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS soko_orders (
                order_id TEXT PRIMARY KEY,
                buyer_id TEXT NOT NULL,
                vendor_id TEXT NOT NULL,
                doc JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_soko_orders_buyer ON soko_orders (buyer_id)",
            "CREATE INDEX IF NOT EXISTS idx_soko_orders_vendor ON soko_orders (vendor_id)",
            r#"
            CREATE TABLE IF NOT EXISTS soko_escrows (
                escrow_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL UNIQUE,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_deliveries (
                order_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_disputes (
                dispute_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                doc JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_soko_disputes_order ON soko_disputes (order_id)",
            r#"
            CREATE TABLE IF NOT EXISTS soko_wallet_txns (
                seq BIGSERIAL PRIMARY KEY,
                txn_id TEXT NOT NULL UNIQUE,
                vendor_id TEXT NOT NULL,
                doc JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_soko_wallet_txns_vendor ON soko_wallet_txns (vendor_id)",
            r#"
            CREATE TABLE IF NOT EXISTS soko_referrals (
                referral_id TEXT PRIMARY KEY,
                referred_vendor_id TEXT NOT NULL UNIQUE,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_commission_payments (
                payment_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_commission_settings (
                referrer_type TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_vendors (
                vendor_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_marketers (
                marketer_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS soko_journal_entries (
                journal_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                order_id TEXT NULL,
                escrow_id TEXT NULL,
                doc JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_soko_journal_escrow ON soko_journal_entries (escrow_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    MarketError::persistence(format!("postgres schema create failed: {e}"))
                })?;
        }

        Ok(())
    }

    /// Apply one write batch inside a single transaction.
    async fn apply_batch(&self, batch: &WriteBatch) -> Result<(), MarketError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MarketError::persistence(format!("postgres begin failed: {e}")))?;

        for write in batch {
            match write {
                StoreWrite::PutOrder(order) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_orders (order_id, buyer_id, vendor_id, doc)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (order_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&order.order_id)
                    .bind(&order.buyer_id)
                    .bind(&order.vendor_id)
                    .bind(to_doc(order)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("order"))?;
                }
                StoreWrite::PutEscrow(escrow) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_escrows (escrow_id, order_id, doc)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (escrow_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&escrow.escrow_id)
                    .bind(&escrow.order_id)
                    .bind(to_doc(escrow)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("escrow"))?;
                }
                StoreWrite::PutDelivery(delivery) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_deliveries (order_id, doc)
                        VALUES ($1, $2)
                        ON CONFLICT (order_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&delivery.order_id)
                    .bind(to_doc(delivery)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("delivery"))?;
                }
                StoreWrite::PutDispute(dispute) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_disputes (dispute_id, order_id, doc)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (dispute_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&dispute.dispute_id)
                    .bind(&dispute.order_id)
                    .bind(to_doc(dispute)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("dispute"))?;
                }
                StoreWrite::AppendWalletTxn(txn) => {
                    sqlx::query(
                        "INSERT INTO soko_wallet_txns (txn_id, vendor_id, doc) VALUES ($1, $2, $3)",
                    )
                    .bind(&txn.txn_id)
                    .bind(&txn.vendor_id)
                    .bind(to_doc(txn)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("wallet txn"))?;
                }
                StoreWrite::PutReferral(referral) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_referrals (referral_id, referred_vendor_id, doc)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (referral_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&referral.referral_id)
                    .bind(&referral.referred_vendor_id)
                    .bind(to_doc(referral)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("referral"))?;
                }
                StoreWrite::PutCommissionPayment(payment) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_commission_payments (payment_id, doc)
                        VALUES ($1, $2)
                        ON CONFLICT (payment_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&payment.payment_id)
                    .bind(to_doc(payment)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("commission payment"))?;
                }
                StoreWrite::PutCommissionSettings(settings) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_commission_settings (referrer_type, doc)
                        VALUES ($1, $2)
                        ON CONFLICT (referrer_type) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(referrer_type_to_str(settings.referrer_type))
                    .bind(to_doc(settings)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("commission settings"))?;
                }
                StoreWrite::PutVendor(vendor) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_vendors (vendor_id, doc)
                        VALUES ($1, $2)
                        ON CONFLICT (vendor_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&vendor.vendor_id)
                    .bind(to_doc(vendor)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("vendor"))?;
                }
                StoreWrite::PutMarketer(marketer) => {
                    sqlx::query(
                        r#"
                        INSERT INTO soko_marketers (marketer_id, doc)
                        VALUES ($1, $2)
                        ON CONFLICT (marketer_id) DO UPDATE SET doc = EXCLUDED.doc
                        "#,
                    )
                    .bind(&marketer.marketer_id)
                    .bind(to_doc(marketer)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("marketer"))?;
                }
                StoreWrite::AppendJournal(entry) => {
                    let index: i64 = entry.index.try_into().map_err(|_| {
                        MarketError::persistence("journal index exceeds postgres BIGINT range")
                    })?;
                    sqlx::query(
                        r#"
                        INSERT INTO soko_journal_entries
                            (journal_index, entry_id, kind, order_id, escrow_id, doc)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(index)
                    .bind(&entry.entry_id)
                    .bind(kind_to_str(&entry.kind))
                    .bind(&entry.order_id)
                    .bind(&entry.escrow_id)
                    .bind(to_doc(entry)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(persist_err("journal entry"))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| MarketError::persistence(format!("postgres commit failed: {e}")))
    }

    async fn load_state(&self) -> Result<StoreState, MarketError> {
        let mut state = StoreState::default();

        for order in self.load_docs::<Order>("soko_orders", "order_id").await? {
            state.orders.insert(order.order_id.clone(), order);
        }
        for escrow in self
            .load_docs::<EscrowTransaction>("soko_escrows", "escrow_id")
            .await?
        {
            state
                .escrow_by_order
                .insert(escrow.order_id.clone(), escrow.escrow_id.clone());
            state.escrows.insert(escrow.escrow_id.clone(), escrow);
        }
        for delivery in self
            .load_docs::<DeliveryRecord>("soko_deliveries", "order_id")
            .await?
        {
            state.deliveries.insert(delivery.order_id.clone(), delivery);
        }
        for dispute in self
            .load_docs::<Dispute>("soko_disputes", "dispute_id")
            .await?
        {
            state.disputes.insert(dispute.dispute_id.clone(), dispute);
        }
        for txn in self
            .load_docs::<WalletTransaction>("soko_wallet_txns", "seq")
            .await?
        {
            state
                .wallet_balances
                .insert(txn.vendor_id.clone(), txn.balance_after_minor);
            state.wallet_txns.push(txn);
        }
        for referral in self
            .load_docs::<Referral>("soko_referrals", "referral_id")
            .await?
        {
            state.referrals.insert(referral.referral_id.clone(), referral);
        }
        for payment in self
            .load_docs::<CommissionPayment>("soko_commission_payments", "payment_id")
            .await?
        {
            state
                .commission_payments
                .insert(payment.payment_id.clone(), payment);
        }
        for settings in self
            .load_docs::<CommissionSettings>("soko_commission_settings", "referrer_type")
            .await?
        {
            state
                .commission_settings
                .insert(settings.referrer_type, settings);
        }
        for vendor in self
            .load_docs::<VendorProfile>("soko_vendors", "vendor_id")
            .await?
        {
            state.vendors.insert(vendor.vendor_id.clone(), vendor);
        }
        for marketer in self
            .load_docs::<MarketerProfile>("soko_marketers", "marketer_id")
            .await?
        {
            state.marketers.insert(marketer.marketer_id.clone(), marketer);
        }

        let entries = self
            .load_docs::<JournalEntry>("soko_journal_entries", "journal_index")
            .await?;
        state.journal = SettlementJournal::from_entries(entries)?;

        Ok(state)
    }

    async fn load_docs<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        order_by: &str,
    ) -> Result<Vec<T>, MarketError> {
        let rows = sqlx::query(&format!("SELECT doc FROM {table} ORDER BY {order_by} ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MarketError::persistence(format!("postgres load {table} failed: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: serde_json::Value = row.try_get("doc").map_err(|e| {
                MarketError::persistence(format!("postgres decode {table} doc failed: {e}"))
            })?;
            records.push(serde_json::from_value(doc).map_err(|e| {
                MarketError::persistence(format!("postgres parse {table} doc failed: {e}"))
            })?);
        }
        Ok(records)
    }
}

fn to_doc<T: serde::Serialize>(record: &T) -> Result<serde_json::Value, MarketError> {
    serde_json::to_value(record)
        .map_err(|e| MarketError::persistence(format!("record serialization failed: {e}")))
}

fn persist_err(what: &'static str) -> impl Fn(sqlx::Error) -> MarketError {
    move |e| MarketError::persistence(format!("postgres insert {what} failed: {e}"))
}

fn referrer_type_to_str(referrer_type: ReferrerType) -> &'static str {
    match referrer_type {
        ReferrerType::Vendor => "vendor",
        ReferrerType::Marketer => "marketer",
    }
}
