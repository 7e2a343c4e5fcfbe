use crate::error::MarketError;
use crate::escrow::{auto_release_eligible, build_hold, check_freezable, check_refundable, check_releasable};
use crate::gateway::{with_deadline, PaymentGateway, PaymentInit, VerifiedStatus};
use crate::journal::{EscrowReleaseRecord, JournalKind};
use crate::orders::{build_orders, can_transition};
use crate::referral::{pending_by_recipient, PendingCommission};
use crate::storage::{MarketStore, MarketStoreConfig, StoreState, StoreWrite, WriteBatch};
use crate::types::{
    record_id, CheckoutRequest, CheckoutResult, CommissionPayment, CommissionPaymentStatus,
    CommissionSettings, ConfirmOutcome, DeliveryConfirmation, DeliveryRecord, DeliveryStatus,
    DeliveryUpdate, Dispute, DisputeKind, DisputeRuling, DisputeStatus, EscrowStatus,
    EscrowTransaction, FilerType, MarketerProfile, Order, OrderRef, OrderStatus,
    PaymentConfirmation, PaymentOutcome, PaymentStatus, Referral, ReferralCodeValidation,
    ReferralStatus, ReferrerType, ReleaseType, VendorProfile, WalletTransaction, WalletTxnKind,
    WalletTxnStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Settlement engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Platform fee retained from every escrow, in basis points.
    pub platform_fee_bps: u32,
    pub currency: String,
    /// Deadline for payment gateway calls. On elapse the order stays pending
    /// and reconciliation happens through a later explicit verify.
    pub payment_timeout: Duration,
    pub storage: MarketStoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 1_000,
            currency: "NGN".to_string(),
            payment_timeout: Duration::from_secs(15),
            storage: MarketStoreConfig::Memory,
        }
    }
}

/// Read model for a vendor wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorWallet {
    pub vendor_id: String,
    pub balance_minor: u64,
    pub transactions: Vec<WalletTransaction>,
}

/// The order / escrow / commission settlement engine.
///
/// Invariant handling:
/// - Escrow exists only after a verified payment, and only once per order.
/// - Escrow settles exactly once; the wallet credit lands in the same write
///   batch as the escrow transition.
/// - Gateway I/O runs outside the store lock; state-machine guards are
///   re-checked inside the critical section that mutates.
#[derive(Debug)]
pub struct SokoEngine {
    store: MarketStore,
    gateway: Arc<dyn PaymentGateway>,
    config: EngineConfig,
}

impl SokoEngine {
    pub async fn bootstrap(
        gateway: Arc<dyn PaymentGateway>,
        config: EngineConfig,
    ) -> Result<Self, MarketError> {
        let store = MarketStore::bootstrap(config.storage.clone()).await?;
        Ok(Self {
            store,
            gateway,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage_backend(&self) -> &'static str {
        self.store.backend_label()
    }

    // ---- referrer registry -------------------------------------------------

    pub async fn register_vendor(
        &self,
        vendor: VendorProfile,
    ) -> Result<VendorProfile, MarketError> {
        if vendor.vendor_id.trim().is_empty() || vendor.referral_code.trim().is_empty() {
            return Err(MarketError::validation(
                "vendor id and referral code are required",
            ));
        }

        let mut state = self.store.write().await;
        let code_taken = state
            .vendor_by_code(&vendor.referral_code)
            .map(|v| v.vendor_id != vendor.vendor_id)
            .unwrap_or(false)
            || state.marketer_by_code(&vendor.referral_code).is_some();
        if code_taken {
            return Err(MarketError::conflict(format!(
                "referral code '{}' is already issued",
                vendor.referral_code
            )));
        }

        self.store
            .persist_and_commit(&mut state, vec![StoreWrite::PutVendor(vendor.clone())])
            .await?;
        Ok(vendor)
    }

    pub async fn register_marketer(
        &self,
        marketer: MarketerProfile,
    ) -> Result<MarketerProfile, MarketError> {
        if marketer.marketer_id.trim().is_empty() || marketer.referral_code.trim().is_empty() {
            return Err(MarketError::validation(
                "marketer id and referral code are required",
            ));
        }

        let mut state = self.store.write().await;
        let code_taken = state.vendor_by_code(&marketer.referral_code).is_some()
            || state
                .marketer_by_code(&marketer.referral_code)
                .map(|m| m.marketer_id != marketer.marketer_id)
                .unwrap_or(false);
        if code_taken {
            return Err(MarketError::conflict(format!(
                "referral code '{}' is already issued",
                marketer.referral_code
            )));
        }

        self.store
            .persist_and_commit(&mut state, vec![StoreWrite::PutMarketer(marketer.clone())])
            .await?;
        Ok(marketer)
    }

    // ---- order lifecycle ---------------------------------------------------

    /// Split a cart into one order per vendor and persist them as one atomic
    /// batch. A multi-vendor checkout either fully succeeds or fully rolls
    /// back; the buyer never ends up believing in an order that was dropped.
    pub async fn create_orders(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutResult, MarketError> {
        let orders = build_orders(&request)?;

        let mut state = self.store.write().await;
        for order in &orders {
            if state.vendor(&order.vendor_id).is_none() {
                return Err(MarketError::not_found("vendor", &order.vendor_id));
            }
        }

        let mut grand_total_minor: u64 = 0;
        for order in &orders {
            grand_total_minor = grand_total_minor
                .checked_add(order.total_minor)
                .ok_or_else(|| MarketError::validation("checkout grand total overflows"))?;
        }

        let refs: Vec<OrderRef> = orders
            .iter()
            .map(|order| OrderRef {
                order_id: order.order_id.clone(),
                order_number: order.order_number.clone(),
                vendor_id: order.vendor_id.clone(),
                total_minor: order.total_minor,
            })
            .collect();

        let batch: WriteBatch = orders.into_iter().map(StoreWrite::PutOrder).collect();
        self.store.persist_and_commit(&mut state, batch).await?;

        info!(
            buyer_id = %request.buyer_id,
            orders = refs.len(),
            grand_total_minor,
            "checkout split into per-vendor orders"
        );

        Ok(CheckoutResult {
            orders: refs,
            grand_total_minor,
        })
    }

    /// Initialize a gateway charge. Pure passthrough to the processor; no
    /// engine state changes until the payment is verified.
    pub async fn initialize_payment(
        &self,
        email: &str,
        amount_minor: u64,
        order_ref: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentInit, MarketError> {
        if email.trim().is_empty() {
            return Err(MarketError::validation("payer email is required"));
        }
        if amount_minor == 0 {
            return Err(MarketError::validation("payment amount must be positive"));
        }

        with_deadline(
            self.gateway.provider(),
            self.config.payment_timeout,
            self.gateway
                .initialize_payment(email, amount_minor, order_ref, metadata),
        )
        .await
    }

    /// Verify a payment reference and apply the paid transition. Safe against
    /// at-least-once webhook delivery: a repeat confirmation is a no-op and
    /// never creates a second escrow.
    pub async fn confirm_payment(
        &self,
        order_id: &str,
        reference: &str,
        channel: Option<String>,
    ) -> Result<PaymentConfirmation, MarketError> {
        if reference.trim().is_empty() {
            return Err(MarketError::validation("payment reference is required"));
        }

        // Cheap pre-check so a replayed webhook never pays for a gateway
        // round-trip. The authoritative guard runs again under the write lock.
        {
            let state = self.store.read().await;
            let order = state
                .order(order_id)
                .ok_or_else(|| MarketError::not_found("order", order_id))?;
            if order.payment_status == PaymentStatus::Paid {
                return Ok(PaymentConfirmation {
                    order_id: order_id.to_string(),
                    outcome: PaymentOutcome::AlreadyConfirmed,
                    escrow_id: state.escrow_for_order(order_id).map(|e| e.escrow_id.clone()),
                });
            }
            if order.status == OrderStatus::Cancelled {
                return Err(MarketError::invalid_state(format!(
                    "order '{order_id}' is cancelled"
                )));
            }
        }

        let verification = with_deadline(
            self.gateway.provider(),
            self.config.payment_timeout,
            self.gateway.verify_payment(reference),
        )
        .await?;

        let mut state = self.store.write().await;
        let order = state
            .order(order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))?;

        if order.payment_status == PaymentStatus::Paid {
            return Ok(PaymentConfirmation {
                order_id: order_id.to_string(),
                outcome: PaymentOutcome::AlreadyConfirmed,
                escrow_id: state.escrow_for_order(order_id).map(|e| e.escrow_id.clone()),
            });
        }

        let mut order = order.clone();
        let now = Utc::now();

        if verification.status != VerifiedStatus::Success {
            warn!(
                order_id,
                reference,
                status = ?verification.status,
                "payment verification reported non-success; cancelling order"
            );
            if !can_transition(order.status, OrderStatus::Cancelled) {
                return Err(MarketError::invalid_state(format!(
                    "order '{order_id}' cannot be cancelled from its current state"
                )));
            }
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
            self.store
                .persist_and_commit(&mut state, vec![StoreWrite::PutOrder(order)])
                .await?;
            return Ok(PaymentConfirmation {
                order_id: order_id.to_string(),
                outcome: PaymentOutcome::Failed,
                escrow_id: None,
            });
        }

        if !can_transition(order.status, OrderStatus::Confirmed) {
            return Err(MarketError::invalid_state(format!(
                "order '{order_id}' cannot be confirmed from its current state"
            )));
        }
        if state.escrow_for_order(order_id).is_some() {
            return Err(MarketError::conflict(format!(
                "order '{order_id}' already has an escrow hold"
            )));
        }

        order.status = OrderStatus::Confirmed;
        order.payment_status = PaymentStatus::Paid;
        order.payment_reference = Some(verification.reference.clone());
        order.payment_channel = if verification.channel.is_empty() {
            channel
        } else {
            Some(verification.channel.clone())
        };
        order.updated_at = now;

        let escrow = build_hold(&order, self.config.platform_fee_bps)?;
        let entry = state.journal().build_entry(
            JournalKind::EscrowHeld,
            Some(order.order_id.clone()),
            Some(escrow.escrow_id.clone()),
            serde_json::json!({
                "amount_minor": escrow.amount_minor,
                "platform_fee_minor": escrow.platform_fee_minor,
                "vendor_amount_minor": escrow.vendor_amount_minor,
                "reference": verification.reference,
            }),
        );

        let escrow_id = escrow.escrow_id.clone();
        self.store
            .persist_and_commit(
                &mut state,
                vec![
                    StoreWrite::PutOrder(order),
                    StoreWrite::PutEscrow(escrow),
                    StoreWrite::AppendJournal(entry),
                ],
            )
            .await?;

        info!(order_id, reference, escrow_id = %escrow_id, "payment confirmed; escrow held");

        Ok(PaymentConfirmation {
            order_id: order_id.to_string(),
            outcome: PaymentOutcome::Confirmed,
            escrow_id: Some(escrow_id),
        })
    }

    /// Vendor accepts a confirmed order for fulfilment.
    pub async fn mark_order_processing(
        &self,
        order_id: &str,
        vendor_id: &str,
    ) -> Result<Order, MarketError> {
        let mut state = self.store.write().await;
        let order = state
            .order(order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))?;
        if order.vendor_id != vendor_id {
            return Err(MarketError::validation(format!(
                "order '{order_id}' does not belong to vendor '{vendor_id}'"
            )));
        }
        if !can_transition(order.status, OrderStatus::Processing) {
            return Err(MarketError::invalid_state(format!(
                "order '{order_id}' cannot start processing from its current state"
            )));
        }

        let mut order = order.clone();
        order.status = OrderStatus::Processing;
        order.updated_at = Utc::now();
        let updated = order.clone();
        self.store
            .persist_and_commit(&mut state, vec![StoreWrite::PutOrder(order)])
            .await?;
        Ok(updated)
    }

    // ---- delivery confirmation gateway ------------------------------------

    /// Consume a delivery-provider status update. The first `delivered`
    /// report stamps the actual delivery date and auto-releases the escrow;
    /// replayed webhooks surface `already_confirmed` and change nothing.
    pub async fn record_delivery_update(
        &self,
        order_id: &str,
        update: DeliveryUpdate,
    ) -> Result<DeliveryConfirmation, MarketError> {
        let mut state = self.store.write().await;
        let order = state
            .order(order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))?
            .clone();

        let now = Utc::now();
        let mut delivery = state.delivery(order_id).cloned().unwrap_or(DeliveryRecord {
            order_id: order_id.to_string(),
            status: DeliveryStatus::Pending,
            estimated_date: None,
            actual_date: None,
            proof_url: None,
            recipient_name: None,
            updated_at: now,
        });

        if update.status == DeliveryStatus::Delivered && delivery.actual_date.is_some() {
            return Ok(DeliveryConfirmation {
                order_id: order_id.to_string(),
                outcome: ConfirmOutcome::AlreadyConfirmed,
                escrow_id: state.escrow_for_order(order_id).map(|e| e.escrow_id.clone()),
                released: false,
            });
        }

        delivery.status = update.status;
        delivery.estimated_date = update.estimated_date.or(delivery.estimated_date);
        delivery.proof_url = update.proof_url.or(delivery.proof_url);
        delivery.recipient_name = update.recipient_name.or(delivery.recipient_name);
        delivery.updated_at = now;

        let mut batch: WriteBatch = Vec::new();
        let mut released = false;
        let mut escrow_id = state.escrow_for_order(order_id).map(|e| e.escrow_id.clone());

        let mut order = order;
        match update.status {
            DeliveryStatus::InTransit => {
                // The provider picking the parcel up implies fulfilment started.
                if matches!(order.status, OrderStatus::Confirmed | OrderStatus::Processing) {
                    order.status = OrderStatus::Shipped;
                    order.updated_at = now;
                    batch.push(StoreWrite::PutOrder(order.clone()));
                }
            }
            DeliveryStatus::Delivered => {
                // Eligibility is judged before the actual date is stamped, so
                // this is provably the first confirmation.
                let eligible = auto_release_eligible(&delivery);
                delivery.actual_date = Some(now);
                if matches!(
                    order.status,
                    OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::Shipped
                ) {
                    order.status = OrderStatus::Delivered;
                    order.updated_at = now;
                    batch.push(StoreWrite::PutOrder(order.clone()));
                }

                if let Some(escrow) = state.escrow_for_order(order_id).cloned() {
                    escrow_id = Some(escrow.escrow_id.clone());
                    if eligible && escrow.status == EscrowStatus::Held {
                        let writes = self.build_release_writes(
                            &state,
                            escrow,
                            ReleaseType::AutoDelivery,
                            "delivery-provider",
                            None,
                            Some(now),
                        )?;
                        batch.extend(writes);
                        released = true;
                    } else {
                        warn!(
                            order_id,
                            escrow_status = ?escrow.status,
                            "delivery confirmed but escrow is not held; skipping auto-release"
                        );
                    }
                }
            }
            DeliveryStatus::Pending | DeliveryStatus::Failed => {}
        }

        batch.push(StoreWrite::PutDelivery(delivery));
        self.store.persist_and_commit(&mut state, batch).await?;

        if released {
            info!(order_id, "delivery confirmed by provider; escrow auto-released");
        }

        Ok(DeliveryConfirmation {
            order_id: order_id.to_string(),
            outcome: ConfirmOutcome::Confirmed,
            escrow_id,
            released,
        })
    }

    /// Buyer manually confirms receipt. The first confirmation releases the
    /// escrow; a double-click surfaces `already_confirmed`.
    pub async fn confirm_delivery(
        &self,
        order_id: &str,
        buyer_id: &str,
    ) -> Result<DeliveryConfirmation, MarketError> {
        let mut state = self.store.write().await;
        let order = state
            .order(order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))?
            .clone();
        if order.buyer_id != buyer_id {
            return Err(MarketError::validation(format!(
                "order '{order_id}' does not belong to buyer '{buyer_id}'"
            )));
        }

        let escrow = state.escrow_for_order(order_id).cloned().ok_or_else(|| {
            MarketError::invalid_state(format!(
                "order '{order_id}' has no confirmed payment to release"
            ))
        })?;

        let now = Utc::now();
        let mut delivery = state.delivery(order_id).cloned().unwrap_or(DeliveryRecord {
            order_id: order_id.to_string(),
            status: DeliveryStatus::Pending,
            estimated_date: None,
            actual_date: None,
            proof_url: None,
            recipient_name: None,
            updated_at: now,
        });

        if delivery.actual_date.is_some() {
            return Ok(DeliveryConfirmation {
                order_id: order_id.to_string(),
                outcome: ConfirmOutcome::AlreadyConfirmed,
                escrow_id: Some(escrow.escrow_id),
                released: false,
            });
        }

        let writes = self.build_release_writes(
            &state,
            escrow.clone(),
            ReleaseType::ManualBuyer,
            buyer_id,
            None,
            Some(now),
        )?;

        delivery.status = DeliveryStatus::Delivered;
        delivery.actual_date = Some(now);
        delivery.updated_at = now;

        let mut order = order;
        let mut batch: WriteBatch = Vec::new();
        if matches!(
            order.status,
            OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::Shipped
        ) {
            order.status = OrderStatus::Delivered;
            order.updated_at = now;
            batch.push(StoreWrite::PutOrder(order));
        }
        batch.push(StoreWrite::PutDelivery(delivery));
        batch.extend(writes);

        self.store.persist_and_commit(&mut state, batch).await?;

        info!(order_id, buyer_id, "buyer confirmed delivery; escrow released");

        Ok(DeliveryConfirmation {
            order_id: order_id.to_string(),
            outcome: ConfirmOutcome::Confirmed,
            escrow_id: Some(escrow.escrow_id),
            released: true,
        })
    }

    // ---- escrow ledger -----------------------------------------------------

    /// Admin release of a held escrow. Exactly-once: repeating the call is
    /// rejected without writing anything.
    pub async fn release_escrow(
        &self,
        escrow_id: &str,
        release_type: ReleaseType,
        requested_by: &str,
        notes: Option<String>,
    ) -> Result<EscrowTransaction, MarketError> {
        if release_type == ReleaseType::DisputeResolution {
            return Err(MarketError::validation(
                "dispute rulings settle through dispute resolution",
            ));
        }

        let mut state = self.store.write().await;
        let escrow = state
            .escrow(escrow_id)
            .ok_or_else(|| MarketError::not_found("escrow", escrow_id))?
            .clone();

        let delivery_confirmed_at = state.delivery(&escrow.order_id).and_then(|d| d.actual_date);
        let writes = self.build_release_writes(
            &state,
            escrow,
            release_type,
            requested_by,
            notes,
            delivery_confirmed_at,
        )?;
        self.store.persist_and_commit(&mut state, writes).await?;

        let released = state
            .escrow(escrow_id)
            .cloned()
            .ok_or_else(|| MarketError::persistence("released escrow vanished from state"))?;

        info!(escrow_id, requested_by, ?release_type, "escrow released");
        Ok(released)
    }

    /// Refund a held escrow to the buyer. Credits no vendor wallet; the
    /// linked order is cancelled and its payment marked refunded.
    pub async fn refund_escrow(
        &self,
        escrow_id: &str,
        reason: &str,
    ) -> Result<EscrowTransaction, MarketError> {
        let mut state = self.store.write().await;
        let escrow = state
            .escrow(escrow_id)
            .ok_or_else(|| MarketError::not_found("escrow", escrow_id))?
            .clone();

        let writes = self.build_refund_writes(&state, escrow, reason, false)?;
        self.store.persist_and_commit(&mut state, writes).await?;

        let refunded = state
            .escrow(escrow_id)
            .cloned()
            .ok_or_else(|| MarketError::persistence("refunded escrow vanished from state"))?;

        info!(escrow_id, reason, "escrow refunded to buyer");
        Ok(refunded)
    }

    // ---- dispute manager ---------------------------------------------------

    /// File a dispute: creates the dispute, freezes the escrow, and marks the
    /// order disputed as one unit.
    pub async fn file_dispute(
        &self,
        order_id: &str,
        filed_by: &str,
        filer_type: FilerType,
        kind: DisputeKind,
        description: &str,
        evidence: Vec<String>,
    ) -> Result<Dispute, MarketError> {
        if description.trim().is_empty() {
            return Err(MarketError::validation("dispute description is required"));
        }

        let mut state = self.store.write().await;
        let order = state
            .order(order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))?
            .clone();
        if order.status.is_terminal() {
            return Err(MarketError::invalid_state(format!(
                "order '{order_id}' is already settled"
            )));
        }
        if let Some(existing) = state.unresolved_dispute_for_order(order_id) {
            return Err(MarketError::conflict(format!(
                "order '{order_id}' already has dispute '{}'",
                existing.dispute_id
            )));
        }

        let now = Utc::now();
        let mut batch: WriteBatch = Vec::new();

        let escrow = state.escrow_for_order(order_id).cloned();
        let escrow_id = escrow.as_ref().map(|e| e.escrow_id.clone());
        let dispute = Dispute {
            dispute_id: record_id("dsp"),
            order_id: order_id.to_string(),
            escrow_id: escrow_id.clone(),
            filed_by: filed_by.to_string(),
            filer_type,
            kind,
            description: description.to_string(),
            evidence,
            status: DisputeStatus::Open,
            ruling: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: now,
            resolved_at: None,
        };

        if let Some(mut escrow) = escrow {
            check_freezable(&escrow)?;
            escrow.status = EscrowStatus::Disputed;
            let entry = state.journal().build_entry(
                JournalKind::EscrowFrozen,
                Some(order_id.to_string()),
                Some(escrow.escrow_id.clone()),
                serde_json::json!({
                    "dispute_id": dispute.dispute_id,
                    "filed_by": filed_by,
                }),
            );
            batch.push(StoreWrite::PutEscrow(escrow));
            batch.push(StoreWrite::AppendJournal(entry));
        }

        let mut order = order;
        order.status = OrderStatus::Disputed;
        order.updated_at = now;
        batch.push(StoreWrite::PutOrder(order));
        batch.push(StoreWrite::PutDispute(dispute.clone()));

        self.store.persist_and_commit(&mut state, batch).await?;

        info!(
            order_id,
            dispute_id = %dispute.dispute_id,
            filed_by,
            "dispute filed; escrow frozen"
        );
        Ok(dispute)
    }

    /// Move an open dispute into admin review.
    pub async fn review_dispute(
        &self,
        dispute_id: &str,
        admin_id: &str,
    ) -> Result<Dispute, MarketError> {
        let mut state = self.store.write().await;
        let dispute = state
            .dispute(dispute_id)
            .ok_or_else(|| MarketError::not_found("dispute", dispute_id))?;
        if dispute.status != DisputeStatus::Open {
            return Err(MarketError::invalid_state(format!(
                "dispute '{dispute_id}' is not open"
            )));
        }

        let mut dispute = dispute.clone();
        dispute.status = DisputeStatus::UnderReview;
        dispute.resolved_by = Some(admin_id.to_string());
        let updated = dispute.clone();
        self.store
            .persist_and_commit(&mut state, vec![StoreWrite::PutDispute(dispute)])
            .await?;
        Ok(updated)
    }

    /// Admin ruling. The only path that moves an escrow out of `disputed`.
    pub async fn resolve_dispute(
        &self,
        dispute_id: &str,
        ruling: DisputeRuling,
        admin_id: &str,
        notes: Option<String>,
    ) -> Result<Dispute, MarketError> {
        let mut state = self.store.write().await;
        let dispute = state
            .dispute(dispute_id)
            .ok_or_else(|| MarketError::not_found("dispute", dispute_id))?
            .clone();
        if dispute.status == DisputeStatus::Resolved {
            return Err(MarketError::conflict(format!(
                "dispute '{dispute_id}' is already resolved"
            )));
        }

        let now = Utc::now();
        let mut resolved = dispute.clone();
        resolved.status = DisputeStatus::Resolved;
        resolved.ruling = Some(ruling);
        resolved.resolved_by = Some(admin_id.to_string());
        resolved.resolution_notes = notes.clone();
        resolved.resolved_at = Some(now);

        let mut batch: WriteBatch = vec![StoreWrite::PutDispute(resolved.clone())];

        if let Some(escrow_id) = &dispute.escrow_id {
            let escrow = state
                .escrow(escrow_id)
                .ok_or_else(|| MarketError::not_found("escrow", escrow_id))?
                .clone();
            match ruling {
                DisputeRuling::ReleaseToVendor => {
                    let delivery_confirmed_at =
                        state.delivery(&escrow.order_id).and_then(|d| d.actual_date);
                    let writes = self.build_release_writes(
                        &state,
                        escrow,
                        ReleaseType::DisputeResolution,
                        admin_id,
                        notes,
                        delivery_confirmed_at,
                    )?;
                    batch.extend(writes);
                    if let Some(order) = state.order(&dispute.order_id) {
                        if can_transition(order.status, OrderStatus::Delivered) {
                            let mut order = order.clone();
                            order.status = OrderStatus::Delivered;
                            order.updated_at = now;
                            batch.push(StoreWrite::PutOrder(order));
                        }
                    }
                }
                DisputeRuling::RefundToBuyer => {
                    let reason =
                        notes.unwrap_or_else(|| "dispute resolved in buyer's favor".to_string());
                    let writes = self.build_refund_writes(&state, escrow, &reason, true)?;
                    batch.extend(writes);
                }
            }
        } else {
            warn!(dispute_id, "dispute resolved without an escrow hold");
        }

        self.store.persist_and_commit(&mut state, batch).await?;

        info!(dispute_id, ?ruling, admin_id, "dispute resolved");
        Ok(resolved)
    }

    // ---- referral & commission engine --------------------------------------

    /// Match a referral code against active referrers. The referrer type is
    /// the tagged result of which registry matched, never a string prefix.
    pub async fn validate_referral_code(&self, code: &str) -> ReferralCodeValidation {
        let code = code.trim();
        if code.is_empty() {
            return ReferralCodeValidation::invalid();
        }

        let state = self.store.read().await;
        if let Some(vendor) = state.vendor_by_code(code).filter(|v| v.active) {
            return ReferralCodeValidation::matched(ReferrerType::Vendor, &vendor.vendor_id);
        }
        if let Some(marketer) = state.marketer_by_code(code).filter(|m| m.active) {
            return ReferralCodeValidation::matched(ReferrerType::Marketer, &marketer.marketer_id);
        }
        ReferralCodeValidation::invalid()
    }

    /// Record a referral at vendor-onboarding completion. The commission
    /// amount is snapshotted from the current settings; later settings
    /// changes never alter an existing referral.
    pub async fn record_referral(
        &self,
        referrer_type: ReferrerType,
        referrer_id: &str,
        new_vendor_id: &str,
        code: &str,
    ) -> Result<Referral, MarketError> {
        if referrer_id == new_vendor_id {
            return Err(MarketError::validation("a vendor cannot refer itself"));
        }

        let mut state = self.store.write().await;

        let (registered_code, referrer_active) = match referrer_type {
            ReferrerType::Vendor => state
                .vendor(referrer_id)
                .map(|v| (v.referral_code.clone(), v.active))
                .ok_or_else(|| MarketError::not_found("vendor", referrer_id))?,
            ReferrerType::Marketer => state
                .marketer(referrer_id)
                .map(|m| (m.referral_code.clone(), m.active))
                .ok_or_else(|| MarketError::not_found("marketer", referrer_id))?,
        };
        if !referrer_active {
            return Err(MarketError::validation(format!(
                "referrer '{referrer_id}' is not active"
            )));
        }
        if registered_code != code {
            return Err(MarketError::validation(format!(
                "code '{code}' was not issued to referrer '{referrer_id}'"
            )));
        }

        let referred = state
            .vendor(new_vendor_id)
            .ok_or_else(|| MarketError::not_found("vendor", new_vendor_id))?;
        if state.referral_for_vendor(new_vendor_id).is_some() {
            return Err(MarketError::conflict(format!(
                "vendor '{new_vendor_id}' is already attributed to a referrer"
            )));
        }

        let commission_minor = state
            .commission_settings(referrer_type)
            .filter(|s| s.active)
            .map(|s| s.amount_minor)
            .unwrap_or(0);

        let referral = Referral {
            referral_id: record_id("ref"),
            referrer_type,
            referrer_id: referrer_id.to_string(),
            referred_vendor_id: new_vendor_id.to_string(),
            code: code.to_string(),
            status: if referred.active {
                ReferralStatus::Completed
            } else {
                ReferralStatus::Pending
            },
            commission_minor,
            commission_paid: false,
            commission_paid_at: None,
            created_at: Utc::now(),
        };

        self.store
            .persist_and_commit(&mut state, vec![StoreWrite::PutReferral(referral.clone())])
            .await?;

        info!(
            referral_id = %referral.referral_id,
            referrer_id,
            new_vendor_id,
            commission_minor,
            "referral recorded"
        );
        Ok(referral)
    }

    /// Admin marks commission paid. One payment row covers every referenced
    /// referral and flips their paid flags in the same batch; a referral is
    /// never paid twice.
    pub async fn pay_commission(
        &self,
        referral_ids: &[String],
        amount_minor: u64,
        method: &str,
        reference: &str,
        processed_by: &str,
        notes: Option<String>,
    ) -> Result<CommissionPayment, MarketError> {
        if referral_ids.is_empty() {
            return Err(MarketError::validation("no referrals to pay"));
        }
        let mut deduped = referral_ids.to_vec();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != referral_ids.len() {
            return Err(MarketError::validation("duplicate referral ids in payout"));
        }

        let mut state = self.store.write().await;

        let mut referrals: Vec<Referral> = Vec::with_capacity(referral_ids.len());
        for referral_id in referral_ids {
            let referral = state
                .referral(referral_id)
                .ok_or_else(|| MarketError::not_found("referral", referral_id))?;
            referrals.push(referral.clone());
        }

        let recipient = (referrals[0].referrer_type, referrals[0].referrer_id.clone());
        if referrals
            .iter()
            .any(|r| (r.referrer_type, r.referrer_id.clone()) != recipient)
        {
            return Err(MarketError::validation(
                "all referrals in one payout must share a recipient",
            ));
        }
        for referral in &referrals {
            if referral.commission_paid {
                return Err(MarketError::conflict(format!(
                    "referral '{}' is already paid",
                    referral.referral_id
                )));
            }
            if referral.status != ReferralStatus::Completed {
                return Err(MarketError::invalid_state(format!(
                    "referral '{}' is not completed",
                    referral.referral_id
                )));
            }
        }

        let owed: u64 = referrals.iter().map(|r| r.commission_minor).sum();
        if owed != amount_minor {
            return Err(MarketError::validation(format!(
                "payout amount {amount_minor} does not match owed commission {owed}"
            )));
        }

        let now = Utc::now();
        let payment = CommissionPayment {
            payment_id: record_id("cpy"),
            referrer_type: recipient.0,
            referrer_id: recipient.1.clone(),
            amount_minor,
            method: method.to_string(),
            reference: reference.to_string(),
            notes,
            referral_ids: referral_ids.to_vec(),
            status: CommissionPaymentStatus::Completed,
            processed_by: processed_by.to_string(),
            processed_at: now,
        };

        let entry = state.journal().build_entry(
            JournalKind::CommissionPaid,
            None,
            None,
            serde_json::json!({
                "payment_id": payment.payment_id,
                "referrer_type": payment.referrer_type,
                "referrer_id": payment.referrer_id,
                "amount_minor": amount_minor,
                "referral_ids": referral_ids,
            }),
        );

        let mut batch: WriteBatch = vec![StoreWrite::PutCommissionPayment(payment.clone())];
        for mut referral in referrals {
            referral.commission_paid = true;
            referral.commission_paid_at = Some(now);
            batch.push(StoreWrite::PutReferral(referral));
        }
        batch.push(StoreWrite::AppendJournal(entry));

        self.store.persist_and_commit(&mut state, batch).await?;

        info!(
            payment_id = %payment.payment_id,
            referrer_id = %payment.referrer_id,
            amount_minor,
            referrals = referral_ids.len(),
            "commission paid"
        );
        Ok(payment)
    }

    /// Unpaid completed commission grouped by recipient.
    pub async fn pending_commissions(
        &self,
        referrer_type: Option<ReferrerType>,
    ) -> Vec<PendingCommission> {
        let state = self.store.read().await;
        pending_by_recipient(state.referrals())
            .into_iter()
            .filter(|p| referrer_type.map(|t| p.referrer_type == t).unwrap_or(true))
            .collect()
    }

    pub async fn update_commission_settings(
        &self,
        referrer_type: ReferrerType,
        amount_minor: u64,
        active: bool,
        updated_by: &str,
    ) -> Result<CommissionSettings, MarketError> {
        let settings = CommissionSettings {
            referrer_type,
            amount_minor,
            active,
            updated_by: updated_by.to_string(),
            updated_at: Utc::now(),
        };

        let mut state = self.store.write().await;
        self.store
            .persist_and_commit(
                &mut state,
                vec![StoreWrite::PutCommissionSettings(settings.clone())],
            )
            .await?;
        Ok(settings)
    }

    pub async fn commission_settings(&self) -> Vec<CommissionSettings> {
        let state = self.store.read().await;
        state
            .all_commission_settings()
            .into_iter()
            .cloned()
            .collect()
    }

    // ---- read queries ------------------------------------------------------

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.store.read().await.order(order_id).cloned()
    }

    pub async fn orders_for_buyer(&self, buyer_id: &str) -> Vec<Order> {
        self.store
            .read()
            .await
            .orders_by_buyer(buyer_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn escrow(&self, escrow_id: &str) -> Option<EscrowTransaction> {
        self.store.read().await.escrow(escrow_id).cloned()
    }

    pub async fn escrow_for_order(&self, order_id: &str) -> Option<EscrowTransaction> {
        self.store.read().await.escrow_for_order(order_id).cloned()
    }

    pub async fn dispute(&self, dispute_id: &str) -> Option<Dispute> {
        self.store.read().await.dispute(dispute_id).cloned()
    }

    pub async fn vendor_wallet(&self, vendor_id: &str) -> VendorWallet {
        let state = self.store.read().await;
        VendorWallet {
            vendor_id: vendor_id.to_string(),
            balance_minor: state.wallet_balance(vendor_id),
            transactions: state
                .wallet_txns_for(vendor_id)
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    pub async fn journal_entries(&self) -> Vec<crate::journal::JournalEntry> {
        self.store.read().await.journal().entries().to_vec()
    }

    // ---- internal write builders -------------------------------------------

    /// Writes for releasing one escrow: the settled escrow, exactly one
    /// wallet credit with the resulting balance, and the release audit entry.
    fn build_release_writes(
        &self,
        state: &StoreState,
        mut escrow: EscrowTransaction,
        release_type: ReleaseType,
        requested_by: &str,
        notes: Option<String>,
        delivery_confirmed_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<WriteBatch, MarketError> {
        check_releasable(&escrow, release_type)?;

        let now = Utc::now();
        escrow.status = EscrowStatus::Released;
        escrow.released_at = Some(now);
        escrow.release_reason = Some(
            notes
                .clone()
                .unwrap_or_else(|| release_reason_label(release_type).to_string()),
        );

        let balance_after = state
            .wallet_balance(&escrow.vendor_id)
            .checked_add(escrow.vendor_amount_minor)
            .ok_or_else(|| MarketError::validation("vendor wallet balance overflows"))?;
        let txn = WalletTransaction {
            txn_id: record_id("wtx"),
            vendor_id: escrow.vendor_id.clone(),
            kind: WalletTxnKind::Sale,
            amount_minor: escrow.vendor_amount_minor,
            balance_after_minor: balance_after,
            reference: escrow.escrow_id.clone(),
            status: WalletTxnStatus::Completed,
            created_at: now,
        };

        let record = EscrowReleaseRecord {
            escrow_id: escrow.escrow_id.clone(),
            release_type,
            requested_by: requested_by.to_string(),
            delivery_confirmed_at,
            notes,
        };
        let entry = state.journal().build_entry(
            JournalKind::EscrowReleased,
            Some(escrow.order_id.clone()),
            Some(escrow.escrow_id.clone()),
            serde_json::to_value(&record)
                .map_err(|e| MarketError::persistence(format!("release record failed: {e}")))?,
        );

        Ok(vec![
            StoreWrite::PutEscrow(escrow),
            StoreWrite::AppendWalletTxn(txn),
            StoreWrite::AppendJournal(entry),
        ])
    }

    /// Writes for refunding one escrow: the settled escrow, the cancelled
    /// order with its payment marked refunded, and the refund audit entry.
    /// No vendor wallet is touched.
    fn build_refund_writes(
        &self,
        state: &StoreState,
        mut escrow: EscrowTransaction,
        reason: &str,
        via_resolution: bool,
    ) -> Result<WriteBatch, MarketError> {
        check_refundable(&escrow, via_resolution)?;

        let now = Utc::now();
        escrow.status = EscrowStatus::Refunded;
        escrow.released_at = Some(now);
        escrow.release_reason = Some(reason.to_string());

        let mut batch: WriteBatch = Vec::new();
        if let Some(order) = state.order(&escrow.order_id) {
            let mut order = order.clone();
            // Delivered orders keep their terminal status; the refund still
            // settles the money side.
            if can_transition(order.status, OrderStatus::Cancelled) {
                order.status = OrderStatus::Cancelled;
            }
            order.payment_status = PaymentStatus::Refunded;
            order.updated_at = now;
            batch.push(StoreWrite::PutOrder(order));
        }

        let entry = state.journal().build_entry(
            JournalKind::EscrowRefunded,
            Some(escrow.order_id.clone()),
            Some(escrow.escrow_id.clone()),
            serde_json::json!({
                "reason": reason,
                "amount_minor": escrow.amount_minor,
                "via_resolution": via_resolution,
            }),
        );
        batch.push(StoreWrite::PutEscrow(escrow));
        batch.push(StoreWrite::AppendJournal(entry));
        Ok(batch)
    }
}

fn release_reason_label(release_type: ReleaseType) -> &'static str {
    match release_type {
        ReleaseType::AutoDelivery => "delivery confirmed by provider",
        ReleaseType::ManualBuyer => "delivery confirmed by buyer",
        ReleaseType::AdminOverride => "released by admin override",
        ReleaseType::DisputeResolution => "dispute resolved in vendor's favor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaymentVerification;
    use crate::types::CartItem;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Deterministic gateway fixture: tests script each reference's verdict.
    #[derive(Debug, Default)]
    struct ScriptedGateway {
        verdicts: Mutex<HashMap<String, PaymentVerification>>,
    }

    impl ScriptedGateway {
        fn succeed(&self, reference: &str, amount_minor: u64) {
            self.verdicts.lock().unwrap().insert(
                reference.to_string(),
                PaymentVerification {
                    reference: reference.to_string(),
                    status: VerifiedStatus::Success,
                    amount_minor,
                    channel: "card".to_string(),
                    paid_at: Some(Utc::now()),
                    payer_email: "buyer@soko.test".to_string(),
                },
            );
        }

        fn fail(&self, reference: &str) {
            self.verdicts.lock().unwrap().insert(
                reference.to_string(),
                PaymentVerification {
                    reference: reference.to_string(),
                    status: VerifiedStatus::Failed,
                    amount_minor: 0,
                    channel: String::new(),
                    paid_at: None,
                    payer_email: "buyer@soko.test".to_string(),
                },
            );
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        async fn initialize_payment(
            &self,
            _email: &str,
            _amount_minor: u64,
            order_ref: &str,
            _metadata: BTreeMap<String, String>,
        ) -> Result<PaymentInit, MarketError> {
            Ok(PaymentInit {
                authorization_url: format!("https://checkout.test/{order_ref}"),
                access_code: "access-test".to_string(),
                reference: format!("PS-{order_ref}"),
            })
        }

        async fn verify_payment(
            &self,
            reference: &str,
        ) -> Result<PaymentVerification, MarketError> {
            self.verdicts
                .lock()
                .unwrap()
                .get(reference)
                .cloned()
                .ok_or_else(|| MarketError::upstream("scripted", "unknown reference"))
        }
    }

    /// Gateway that never answers, for deadline tests.
    #[derive(Debug)]
    struct StallingGateway;

    #[async_trait]
    impl PaymentGateway for StallingGateway {
        fn provider(&self) -> &'static str {
            "stalling"
        }

        async fn initialize_payment(
            &self,
            _email: &str,
            _amount_minor: u64,
            _order_ref: &str,
            _metadata: BTreeMap<String, String>,
        ) -> Result<PaymentInit, MarketError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(MarketError::upstream("stalling", "unreachable"))
        }

        async fn verify_payment(
            &self,
            _reference: &str,
        ) -> Result<PaymentVerification, MarketError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(MarketError::upstream("stalling", "unreachable"))
        }
    }

    fn vendor(id: &str, code: &str) -> VendorProfile {
        VendorProfile {
            vendor_id: id.to_string(),
            name: format!("{id} stores"),
            email: format!("{id}@soko.test"),
            referral_code: code.to_string(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn marketer(id: &str, code: &str, active: bool) -> MarketerProfile {
        MarketerProfile {
            marketer_id: id.to_string(),
            name: format!("{id} media"),
            email: format!("{id}@soko.test"),
            referral_code: code.to_string(),
            active,
            created_at: Utc::now(),
        }
    }

    fn cart_item(vendor: &str, product: &str, quantity: u32, unit_price: u64) -> CartItem {
        CartItem {
            product_id: product.to_string(),
            title: format!("product {product}"),
            image_url: None,
            vendor_id: vendor.to_string(),
            quantity,
            unit_price_minor: unit_price,
        }
    }

    fn two_vendor_checkout() -> CheckoutRequest {
        CheckoutRequest {
            buyer_id: "buyer-1".to_string(),
            items: vec![
                cart_item("vendor-a", "p-1", 3, 5_000),
                cart_item("vendor-b", "p-2", 1, 8_000),
            ],
            delivery_address_id: "addr-1".to_string(),
            delivery_type: DeliveryType::HomeDelivery,
            shipping_by_vendor: BTreeMap::from([
                ("vendor-a".to_string(), 1_200),
                ("vendor-b".to_string(), 800),
            ]),
        }
    }

    use crate::types::DeliveryType;

    async fn engine_with(gateway: Arc<ScriptedGateway>) -> SokoEngine {
        let engine = SokoEngine::bootstrap(gateway, EngineConfig::default())
            .await
            .unwrap();
        engine.register_vendor(vendor("vendor-a", "AAAA11")).await.unwrap();
        engine.register_vendor(vendor("vendor-b", "BBBB22")).await.unwrap();
        engine
    }

    /// Checkout, confirm payment, return the order and its escrow.
    async fn paid_single_order(
        engine: &SokoEngine,
        gateway: &ScriptedGateway,
        total_expected: u64,
    ) -> (OrderRef, EscrowTransaction) {
        let request = CheckoutRequest {
            buyer_id: "buyer-1".to_string(),
            items: vec![cart_item("vendor-a", "p-1", 2, 5_000)],
            delivery_address_id: "addr-1".to_string(),
            delivery_type: DeliveryType::HomeDelivery,
            shipping_by_vendor: BTreeMap::new(),
        };
        let checkout = engine.create_orders(request).await.unwrap();
        let order_ref = checkout.orders[0].clone();
        assert_eq!(order_ref.total_minor, total_expected);

        gateway.succeed("PS-1", checkout.grand_total_minor);
        let confirmation = engine
            .confirm_payment(&order_ref.order_id, "PS-1", None)
            .await
            .unwrap();
        assert_eq!(confirmation.outcome, PaymentOutcome::Confirmed);
        let escrow = engine
            .escrow_for_order(&order_ref.order_id)
            .await
            .expect("escrow held after verified payment");
        (order_ref, escrow)
    }

    #[tokio::test]
    async fn two_vendor_checkout_creates_independent_orders_and_escrows() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;

        let checkout = engine.create_orders(two_vendor_checkout()).await.unwrap();
        assert_eq!(checkout.orders.len(), 2);
        assert_eq!(checkout.grand_total_minor, 15_000 + 8_000 + 1_200 + 800);

        gateway.succeed("PS-MULTI", checkout.grand_total_minor);
        for order_ref in &checkout.orders {
            let confirmation = engine
                .confirm_payment(&order_ref.order_id, "PS-MULTI", None)
                .await
                .unwrap();
            assert_eq!(confirmation.outcome, PaymentOutcome::Confirmed);
        }

        for order_ref in &checkout.orders {
            let order = engine.order(&order_ref.order_id).await.unwrap();
            assert_eq!(order.status, OrderStatus::Confirmed);
            assert_eq!(order.payment_status, PaymentStatus::Paid);
            assert_eq!(order.total_minor, order.subtotal_minor + order.shipping_fee_minor);

            let escrow = engine.escrow_for_order(&order_ref.order_id).await.unwrap();
            assert_eq!(escrow.amount_minor, order.total_minor);
            assert_eq!(
                escrow.platform_fee_minor + escrow.vendor_amount_minor,
                escrow.amount_minor
            );
            assert_eq!(escrow.status, EscrowStatus::Held);
        }
    }

    #[tokio::test]
    async fn repeated_payment_confirmation_never_creates_second_escrow() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, escrow) = paid_single_order(&engine, &gateway, 10_000).await;

        let replay = engine
            .confirm_payment(&order_ref.order_id, "PS-1", None)
            .await
            .unwrap();
        assert_eq!(replay.outcome, PaymentOutcome::AlreadyConfirmed);
        assert_eq!(replay.escrow_id.as_deref(), Some(escrow.escrow_id.as_str()));

        let held_entries = engine
            .journal_entries()
            .await
            .into_iter()
            .filter(|e| e.kind == JournalKind::EscrowHeld)
            .count();
        assert_eq!(held_entries, 1);
    }

    #[tokio::test]
    async fn failed_verification_cancels_order_and_holds_nothing() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;

        let checkout = engine.create_orders(two_vendor_checkout()).await.unwrap();
        let order_ref = checkout.orders[0].clone();

        gateway.fail("PS-BAD");
        let confirmation = engine
            .confirm_payment(&order_ref.order_id, "PS-BAD", None)
            .await
            .unwrap();
        assert_eq!(confirmation.outcome, PaymentOutcome::Failed);

        let order = engine.order(&order_ref.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert!(engine.escrow_for_order(&order_ref.order_id).await.is_none());
    }

    #[tokio::test]
    async fn gateway_timeout_leaves_order_pending() {
        let engine = SokoEngine::bootstrap(
            Arc::new(StallingGateway),
            EngineConfig {
                payment_timeout: Duration::from_millis(20),
                ..EngineConfig::default()
            },
        )
        .await
        .unwrap();
        engine.register_vendor(vendor("vendor-a", "AAAA11")).await.unwrap();

        let request = CheckoutRequest {
            buyer_id: "buyer-1".to_string(),
            items: vec![cart_item("vendor-a", "p-1", 1, 6_000)],
            delivery_address_id: "addr-1".to_string(),
            delivery_type: DeliveryType::Pickup,
            shipping_by_vendor: BTreeMap::new(),
        };
        let checkout = engine.create_orders(request).await.unwrap();
        let order_ref = checkout.orders[0].clone();

        let err = engine
            .confirm_payment(&order_ref.order_id, "PS-SLOW", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Upstream { .. }));

        let order = engine.order(&order_ref.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert!(engine.escrow_for_order(&order_ref.order_id).await.is_none());
    }

    #[tokio::test]
    async fn release_credits_vendor_exactly_once() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (_, escrow) = paid_single_order(&engine, &gateway, 10_000).await;

        // 10% platform fee on 10,000.
        assert_eq!(escrow.amount_minor, 10_000);
        assert_eq!(escrow.platform_fee_minor, 1_000);
        assert_eq!(escrow.vendor_amount_minor, 9_000);

        let released = engine
            .release_escrow(&escrow.escrow_id, ReleaseType::AdminOverride, "admin-1", None)
            .await
            .unwrap();
        assert_eq!(released.status, EscrowStatus::Released);

        let err = engine
            .release_escrow(&escrow.escrow_id, ReleaseType::AdminOverride, "admin-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidState(_)));

        let wallet = engine.vendor_wallet("vendor-a").await;
        assert_eq!(wallet.balance_minor, 9_000);
        assert_eq!(wallet.transactions.len(), 1);
        assert_eq!(wallet.transactions[0].amount_minor, 9_000);
    }

    #[tokio::test]
    async fn refund_cancels_order_without_touching_wallet() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, escrow) = paid_single_order(&engine, &gateway, 10_000).await;

        let refunded = engine
            .refund_escrow(&escrow.escrow_id, "buyer changed their mind")
            .await
            .unwrap();
        assert_eq!(refunded.status, EscrowStatus::Refunded);

        let order = engine.order(&order_ref.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status, PaymentStatus::Refunded);

        let wallet = engine.vendor_wallet("vendor-a").await;
        assert_eq!(wallet.balance_minor, 0);
        assert!(wallet.transactions.is_empty());

        let err = engine
            .refund_escrow(&escrow.escrow_id, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidState(_)));
    }

    #[tokio::test]
    async fn dispute_freezes_escrow_until_resolution() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, escrow) = paid_single_order(&engine, &gateway, 10_000).await;

        let dispute = engine
            .file_dispute(
                &order_ref.order_id,
                "buyer-1",
                FilerType::Buyer,
                DisputeKind::DamagedItem,
                "screen arrived cracked",
                vec!["https://evidence.test/1.jpg".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(dispute.status, DisputeStatus::Open);

        let order = engine.order(&order_ref.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Disputed);
        let frozen = engine.escrow(&escrow.escrow_id).await.unwrap();
        assert_eq!(frozen.status, EscrowStatus::Disputed);

        let err = engine
            .release_escrow(&escrow.escrow_id, ReleaseType::AdminOverride, "admin-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::InvalidState(_)));

        let err = engine
            .file_dispute(
                &order_ref.order_id,
                "vendor-a",
                FilerType::Vendor,
                DisputeKind::Other,
                "counter claim",
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));

        let resolved = engine
            .resolve_dispute(
                &dispute.dispute_id,
                DisputeRuling::ReleaseToVendor,
                "admin-1",
                Some("buyer accepted replacement".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, DisputeStatus::Resolved);

        let settled = engine.escrow(&escrow.escrow_id).await.unwrap();
        assert_eq!(settled.status, EscrowStatus::Released);
        assert_eq!(engine.vendor_wallet("vendor-a").await.balance_minor, 9_000);

        let err = engine
            .resolve_dispute(&dispute.dispute_id, DisputeRuling::RefundToBuyer, "admin-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));
    }

    #[tokio::test]
    async fn dispute_refund_ruling_returns_funds_to_buyer() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, escrow) = paid_single_order(&engine, &gateway, 10_000).await;

        let dispute = engine
            .file_dispute(
                &order_ref.order_id,
                "buyer-1",
                FilerType::Buyer,
                DisputeKind::NotDelivered,
                "parcel never arrived",
                Vec::new(),
            )
            .await
            .unwrap();

        engine
            .review_dispute(&dispute.dispute_id, "admin-1")
            .await
            .unwrap();
        engine
            .resolve_dispute(&dispute.dispute_id, DisputeRuling::RefundToBuyer, "admin-1", None)
            .await
            .unwrap();

        let settled = engine.escrow(&escrow.escrow_id).await.unwrap();
        assert_eq!(settled.status, EscrowStatus::Refunded);
        let order = engine.order(&order_ref.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert!(engine.vendor_wallet("vendor-a").await.transactions.is_empty());
    }

    #[tokio::test]
    async fn delivery_webhook_auto_releases_once() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, escrow) = paid_single_order(&engine, &gateway, 10_000).await;

        let in_transit = DeliveryUpdate {
            status: DeliveryStatus::InTransit,
            estimated_date: Some(Utc::now()),
            proof_url: None,
            recipient_name: None,
        };
        engine
            .record_delivery_update(&order_ref.order_id, in_transit)
            .await
            .unwrap();
        assert_eq!(
            engine.order(&order_ref.order_id).await.unwrap().status,
            OrderStatus::Shipped
        );

        let delivered = DeliveryUpdate {
            status: DeliveryStatus::Delivered,
            estimated_date: None,
            proof_url: Some("https://pod.test/1.jpg".to_string()),
            recipient_name: Some("Adaeze".to_string()),
        };
        let first = engine
            .record_delivery_update(&order_ref.order_id, delivered.clone())
            .await
            .unwrap();
        assert_eq!(first.outcome, ConfirmOutcome::Confirmed);
        assert!(first.released);

        let replay = engine
            .record_delivery_update(&order_ref.order_id, delivered)
            .await
            .unwrap();
        assert_eq!(replay.outcome, ConfirmOutcome::AlreadyConfirmed);
        assert!(!replay.released);

        assert_eq!(
            engine.escrow(&escrow.escrow_id).await.unwrap().status,
            EscrowStatus::Released
        );
        let wallet = engine.vendor_wallet("vendor-a").await;
        assert_eq!(wallet.transactions.len(), 1);
        assert_eq!(wallet.balance_minor, 9_000);
        assert_eq!(
            engine.order(&order_ref.order_id).await.unwrap().status,
            OrderStatus::Delivered
        );
    }

    #[tokio::test]
    async fn buyer_confirmation_guards_webhook_replay() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, _) = paid_single_order(&engine, &gateway, 10_000).await;

        let first = engine
            .confirm_delivery(&order_ref.order_id, "buyer-1")
            .await
            .unwrap();
        assert_eq!(first.outcome, ConfirmOutcome::Confirmed);
        assert!(first.released);

        let double_click = engine
            .confirm_delivery(&order_ref.order_id, "buyer-1")
            .await
            .unwrap();
        assert_eq!(double_click.outcome, ConfirmOutcome::AlreadyConfirmed);

        let webhook = engine
            .record_delivery_update(
                &order_ref.order_id,
                DeliveryUpdate {
                    status: DeliveryStatus::Delivered,
                    estimated_date: None,
                    proof_url: None,
                    recipient_name: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(webhook.outcome, ConfirmOutcome::AlreadyConfirmed);

        let wallet = engine.vendor_wallet("vendor-a").await;
        assert_eq!(wallet.transactions.len(), 1);

        let err = engine
            .confirm_delivery(&order_ref.order_id, "buyer-2")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[tokio::test]
    async fn wallet_balance_equals_sum_of_transactions() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;

        for i in 0..3u32 {
            let request = CheckoutRequest {
                buyer_id: format!("buyer-{i}"),
                items: vec![cart_item("vendor-a", &format!("p-{i}"), 1, 4_000 + u64::from(i))],
                delivery_address_id: "addr-1".to_string(),
                delivery_type: DeliveryType::Pickup,
                shipping_by_vendor: BTreeMap::new(),
            };
            let checkout = engine.create_orders(request).await.unwrap();
            let order_ref = &checkout.orders[0];
            let reference = format!("PS-R{i}");
            gateway.succeed(&reference, order_ref.total_minor);
            engine
                .confirm_payment(&order_ref.order_id, &reference, None)
                .await
                .unwrap();
            let escrow = engine.escrow_for_order(&order_ref.order_id).await.unwrap();
            engine
                .release_escrow(&escrow.escrow_id, ReleaseType::AdminOverride, "admin-1", None)
                .await
                .unwrap();
        }

        let wallet = engine.vendor_wallet("vendor-a").await;
        let sum: u64 = wallet.transactions.iter().map(|t| t.amount_minor).sum();
        assert_eq!(wallet.balance_minor, sum);
        assert_eq!(wallet.transactions.len(), 3);

        let entries = engine.journal_entries().await;
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.kind == JournalKind::EscrowReleased)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn referral_snapshot_survives_settings_change() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        engine
            .update_commission_settings(ReferrerType::Vendor, 5_000, true, "admin-1")
            .await
            .unwrap();
        engine.register_vendor(vendor("vendor-new", "NEWV77")).await.unwrap();

        let validation = engine.validate_referral_code("AAAA11").await;
        assert!(validation.valid);
        assert_eq!(validation.referrer_type, Some(ReferrerType::Vendor));
        assert_eq!(validation.referrer_id.as_deref(), Some("vendor-a"));

        let referral = engine
            .record_referral(ReferrerType::Vendor, "vendor-a", "vendor-new", "AAAA11")
            .await
            .unwrap();
        assert_eq!(referral.status, ReferralStatus::Completed);
        assert_eq!(referral.commission_minor, 5_000);
        assert!(!referral.commission_paid);

        engine
            .update_commission_settings(ReferrerType::Vendor, 7_000, true, "admin-1")
            .await
            .unwrap();

        let pending = engine.pending_commissions(Some(ReferrerType::Vendor)).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].total_minor, 5_000);
        assert_eq!(pending[0].referral_ids, vec![referral.referral_id.clone()]);
    }

    #[tokio::test]
    async fn commission_payment_is_exactly_once() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        engine
            .update_commission_settings(ReferrerType::Marketer, 7_000, true, "admin-1")
            .await
            .unwrap();
        engine
            .register_marketer(marketer("mkt-1", "MKTA01", true))
            .await
            .unwrap();
        engine.register_vendor(vendor("vendor-new", "NEWV77")).await.unwrap();

        let referral = engine
            .record_referral(ReferrerType::Marketer, "mkt-1", "vendor-new", "MKTA01")
            .await
            .unwrap();

        let ids = vec![referral.referral_id.clone()];
        let payment = engine
            .pay_commission(&ids, 7_000, "bank_transfer", "TRF-88", "admin-1", None)
            .await
            .unwrap();
        assert_eq!(payment.amount_minor, 7_000);
        assert_eq!(payment.referral_ids, ids);

        let paid = engine
            .pending_commissions(Some(ReferrerType::Marketer))
            .await;
        assert!(paid.is_empty());

        let err = engine
            .pay_commission(&ids, 7_000, "bank_transfer", "TRF-89", "admin-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));

        let err = engine
            .pay_commission(&ids, 6_000, "bank_transfer", "TRF-90", "admin-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Conflict(_)));
    }

    #[tokio::test]
    async fn inactive_referrers_never_validate() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        engine
            .register_marketer(marketer("mkt-dormant", "MKTD09", false))
            .await
            .unwrap();

        assert!(!engine.validate_referral_code("MKTD09").await.valid);
        assert!(!engine.validate_referral_code("NOPE00").await.valid);
        assert!(!engine.validate_referral_code("  ").await.valid);
    }

    #[tokio::test]
    async fn payout_amount_must_match_snapshots() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        engine
            .update_commission_settings(ReferrerType::Vendor, 5_000, true, "admin-1")
            .await
            .unwrap();
        engine.register_vendor(vendor("vendor-new", "NEWV77")).await.unwrap();
        let referral = engine
            .record_referral(ReferrerType::Vendor, "vendor-a", "vendor-new", "AAAA11")
            .await
            .unwrap();

        let err = engine
            .pay_commission(
                &[referral.referral_id.clone()],
                4_999,
                "bank_transfer",
                "TRF-1",
                "admin-1",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[tokio::test]
    async fn journal_chain_survives_full_settlement_flow() {
        let gateway = Arc::new(ScriptedGateway::default());
        let engine = engine_with(gateway.clone()).await;
        let (order_ref, _) = paid_single_order(&engine, &gateway, 10_000).await;
        engine
            .confirm_delivery(&order_ref.order_id, "buyer-1")
            .await
            .unwrap();

        let entries = engine.journal_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, JournalKind::EscrowHeld);
        assert_eq!(entries[1].kind, JournalKind::EscrowReleased);
        let rebuilt = crate::journal::SettlementJournal::from_entries(entries).unwrap();
        assert!(rebuilt.verify_chain());
    }
}
