//! Core order / escrow / commission settlement engine for the soko
//! marketplace.
//!
//! This crate enforces the money-movement invariants of the platform: escrow
//! is created only after a verified payment, settles exactly once, wallet
//! credits land in the same atomic write batch as the escrow transition, and
//! every settlement decision is recorded in an append-only hash-chained
//! journal.

#![deny(unsafe_code)]

pub mod error;
pub mod escrow;
pub mod gateway;
pub mod journal;
pub mod orders;
pub mod referral;
pub mod runtime;
pub mod storage;
pub mod types;

pub use error::MarketError;
pub use escrow::{auto_release_eligible, platform_fee_minor};
pub use gateway::{PaymentGateway, PaymentInit, PaymentVerification, VerifiedStatus};
pub use journal::{EscrowReleaseRecord, JournalEntry, JournalKind, SettlementJournal};
pub use referral::PendingCommission;
pub use runtime::{EngineConfig, SokoEngine, VendorWallet};
pub use storage::{MarketStore, MarketStoreConfig, StoreWrite, WriteBatch};
pub use types::{
    CartItem, CheckoutRequest, CheckoutResult, CommissionPayment, CommissionPaymentStatus,
    CommissionSettings, ConfirmOutcome, DeliveryConfirmation, DeliveryRecord, DeliveryStatus,
    DeliveryType, DeliveryUpdate, Dispute, DisputeKind, DisputeRuling, DisputeStatus,
    EscrowStatus, EscrowTransaction, FilerType, MarketerProfile, Order, OrderItem, OrderRef,
    OrderStatus, PaymentConfirmation, PaymentOutcome, PaymentStatus, Referral,
    ReferralCodeValidation, ReferralStatus, ReferrerType, ReleaseType, VendorProfile,
    WalletTransaction, WalletTxnKind, WalletTxnStatus,
};
