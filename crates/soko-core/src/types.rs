use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Order lifecycle status.
///
/// `delivered` and `cancelled` are terminal for the order itself; the linked
/// escrow may still settle after `delivered`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Disputed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    Pickup,
    HomeDelivery,
}

/// Denormalized line-item snapshot carried by the order, so later catalog
/// edits never change what the buyer purchased.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItem {
    pub product_id: String,
    pub title: String,
    pub image_url: Option<String>,
    pub quantity: u32,
    pub unit_price_minor: u64,
}

impl OrderItem {
    pub fn line_total_minor(&self) -> Option<u64> {
        self.unit_price_minor.checked_mul(u64::from(self.quantity))
    }
}

/// One order per (checkout, vendor) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    /// Human-readable unique number used for display and search, distinct
    /// from the storage key.
    pub order_number: String,
    pub buyer_id: String,
    pub vendor_id: String,
    pub items: Vec<OrderItem>,
    pub delivery_address_id: String,
    pub delivery_type: DeliveryType,
    pub subtotal_minor: u64,
    pub shipping_fee_minor: u64,
    pub total_minor: u64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub payment_channel: Option<String>,
    pub tracking_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
    Disputed,
}

impl EscrowStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    AutoDelivery,
    ManualBuyer,
    AdminOverride,
    DisputeResolution,
}

/// Buyer funds earmarked for a vendor, created only after the payment has
/// been verified. `vendor_amount_minor + platform_fee_minor` always equals
/// `amount_minor` exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub escrow_id: String,
    pub order_id: String,
    pub buyer_id: String,
    pub vendor_id: String,
    pub amount_minor: u64,
    pub platform_fee_minor: u64,
    pub vendor_amount_minor: u64,
    pub status: EscrowStatus,
    pub held_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InTransit,
    Delivered,
    Failed,
}

/// Per-order snapshot of the delivery collaborator's view. `actual_date` is
/// set by the first confirmation and guards auto-release re-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub order_id: String,
    pub status: DeliveryStatus,
    pub estimated_date: Option<DateTime<Utc>>,
    pub actual_date: Option<DateTime<Utc>>,
    pub proof_url: Option<String>,
    pub recipient_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Status update pushed by the delivery collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub estimated_date: Option<DateTime<Utc>>,
    pub proof_url: Option<String>,
    pub recipient_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilerType {
    Buyer,
    Vendor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeKind {
    NotDelivered,
    DamagedItem,
    WrongItem,
    QualityIssue,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeRuling {
    ReleaseToVendor,
    RefundToBuyer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: String,
    pub order_id: String,
    pub escrow_id: Option<String>,
    pub filed_by: String,
    pub filer_type: FilerType,
    pub kind: DisputeKind,
    pub description: String,
    pub evidence: Vec<String>,
    pub status: DisputeStatus,
    pub ruling: Option<DisputeRuling>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletTxnKind {
    Sale,
    Refund,
    Payout,
    Fee,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletTxnStatus {
    Completed,
    Pending,
    Reversed,
}

/// Immutable ledger line for a vendor wallet. The vendor's cached balance is
/// kept in sync with `balance_after_minor` by every commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub txn_id: String,
    pub vendor_id: String,
    pub kind: WalletTxnKind,
    pub amount_minor: u64,
    pub balance_after_minor: u64,
    pub reference: String,
    pub status: WalletTxnStatus,
    pub created_at: DateTime<Utc>,
}

/// Referrer kind carried explicitly as a tagged variant; codes are never
/// classified by string prefix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReferrerType {
    Vendor,
    Marketer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Completed,
    Rejected,
}

/// Attribution of a new vendor signup to a referring vendor or marketer.
/// `commission_minor` is snapshotted from the settings at creation time and
/// never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub referral_id: String,
    pub referrer_type: ReferrerType,
    pub referrer_id: String,
    pub referred_vendor_id: String,
    pub code: String,
    pub status: ReferralStatus,
    pub commission_minor: u64,
    pub commission_paid: bool,
    pub commission_paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommissionPaymentStatus {
    Completed,
    Reversed,
}

/// Admin "mark as paid" record. Creating one flips `commission_paid` on every
/// referenced referral in the same write batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionPayment {
    pub payment_id: String,
    pub referrer_type: ReferrerType,
    pub referrer_id: String,
    pub amount_minor: u64,
    pub method: String,
    pub reference: String,
    pub notes: Option<String>,
    pub referral_ids: Vec<String>,
    pub status: CommissionPaymentStatus,
    pub processed_by: String,
    pub processed_at: DateTime<Utc>,
}

/// Singleton-per-type commission configuration, writable only by the admin
/// settings update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionSettings {
    pub referrer_type: ReferrerType,
    pub amount_minor: u64,
    pub active: bool,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Referrer registry entry for a vendor account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorProfile {
    pub vendor_id: String,
    pub name: String,
    pub email: String,
    pub referral_code: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Referrer registry entry for a marketer account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketerProfile {
    pub marketer_id: String,
    pub name: String,
    pub email: String,
    pub referral_code: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Cart line entering checkout. The cart itself is owned by the storefront;
/// the engine only consumes this flat list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    pub title: String,
    pub image_url: Option<String>,
    pub vendor_id: String,
    pub quantity: u32,
    pub unit_price_minor: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub buyer_id: String,
    pub items: Vec<CartItem>,
    pub delivery_address_id: String,
    pub delivery_type: DeliveryType,
    /// Delivery cost per vendor as estimated by the delivery collaborator.
    pub shipping_by_vendor: BTreeMap<String, u64>,
}

/// Reference to one created per-vendor order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: String,
    pub order_number: String,
    pub vendor_id: String,
    pub total_minor: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResult {
    pub orders: Vec<OrderRef>,
    pub grand_total_minor: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Confirmed,
    AlreadyConfirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub order_id: String,
    pub outcome: PaymentOutcome,
    pub escrow_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfirmation {
    pub order_id: String,
    pub outcome: ConfirmOutcome,
    pub escrow_id: Option<String>,
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralCodeValidation {
    pub valid: bool,
    pub referrer_type: Option<ReferrerType>,
    pub referrer_id: Option<String>,
}

impl ReferralCodeValidation {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            referrer_type: None,
            referrer_id: None,
        }
    }

    pub fn matched(referrer_type: ReferrerType, referrer_id: impl Into<String>) -> Self {
        Self {
            valid: true,
            referrer_type: Some(referrer_type),
            referrer_id: Some(referrer_id.into()),
        }
    }
}

pub fn record_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Human order number. UUID-backed rather than timestamp-based so concurrent
/// checkouts cannot collide.
pub fn order_number() -> String {
    format!("SO-{}", Uuid::new_v4().simple().to_string().to_uppercase())
}
