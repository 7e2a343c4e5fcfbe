use crate::error::MarketError;
use crate::types::{
    record_id, DeliveryRecord, DeliveryStatus, EscrowStatus, EscrowTransaction, Order, ReleaseType,
};
use chrono::Utc;

/// Platform fee for a gross amount, in round-half-up basis points.
///
/// Deterministic rounding keeps `fee + vendor_amount == amount` exact for
/// every input; the vendor amount is always the remainder.
pub fn platform_fee_minor(amount_minor: u64, fee_bps: u32) -> u64 {
    let numerator = u128::from(amount_minor) * u128::from(fee_bps);
    let fee = (numerator + 5_000) / 10_000;
    // fee_bps is validated <= 10_000, so the fee always fits the gross amount.
    fee.min(u128::from(amount_minor)) as u64
}

/// Build the escrow hold for a verified payment.
pub fn build_hold(order: &Order, fee_bps: u32) -> Result<EscrowTransaction, MarketError> {
    if fee_bps > 10_000 {
        return Err(MarketError::validation(format!(
            "platform fee rate {fee_bps}bps exceeds 100%"
        )));
    }
    if order.total_minor == 0 {
        return Err(MarketError::validation("cannot hold a zero amount"));
    }

    let platform_fee = platform_fee_minor(order.total_minor, fee_bps);
    Ok(EscrowTransaction {
        escrow_id: record_id("esc"),
        order_id: order.order_id.clone(),
        buyer_id: order.buyer_id.clone(),
        vendor_id: order.vendor_id.clone(),
        amount_minor: order.total_minor,
        platform_fee_minor: platform_fee,
        vendor_amount_minor: order.total_minor - platform_fee,
        status: EscrowStatus::Held,
        held_at: Utc::now(),
        released_at: None,
        release_reason: None,
    })
}

/// Guard for moving an escrow to `released`.
///
/// Held escrows release through any path; a disputed escrow only settles
/// through the dispute-resolution ruling.
pub fn check_releasable(
    escrow: &EscrowTransaction,
    release_type: ReleaseType,
) -> Result<(), MarketError> {
    match escrow.status {
        EscrowStatus::Held => Ok(()),
        EscrowStatus::Disputed if release_type == ReleaseType::DisputeResolution => Ok(()),
        EscrowStatus::Disputed => Err(MarketError::invalid_state(format!(
            "escrow '{}' is frozen by an open dispute",
            escrow.escrow_id
        ))),
        EscrowStatus::Released | EscrowStatus::Refunded => Err(MarketError::invalid_state(
            format!("escrow '{}' is already settled", escrow.escrow_id),
        )),
    }
}

/// Guard for moving an escrow to `refunded`. Same gating as release.
pub fn check_refundable(
    escrow: &EscrowTransaction,
    via_resolution: bool,
) -> Result<(), MarketError> {
    match escrow.status {
        EscrowStatus::Held => Ok(()),
        EscrowStatus::Disputed if via_resolution => Ok(()),
        EscrowStatus::Disputed => Err(MarketError::invalid_state(format!(
            "escrow '{}' is frozen by an open dispute",
            escrow.escrow_id
        ))),
        EscrowStatus::Released | EscrowStatus::Refunded => Err(MarketError::invalid_state(
            format!("escrow '{}' is already settled", escrow.escrow_id),
        )),
    }
}

/// Guard for freezing an escrow on dispute filing. Only legal from `held`.
pub fn check_freezable(escrow: &EscrowTransaction) -> Result<(), MarketError> {
    match escrow.status {
        EscrowStatus::Held => Ok(()),
        EscrowStatus::Disputed => Err(MarketError::conflict(format!(
            "escrow '{}' is already disputed",
            escrow.escrow_id
        ))),
        EscrowStatus::Released | EscrowStatus::Refunded => Err(MarketError::invalid_state(
            format!("escrow '{}' is already settled", escrow.escrow_id),
        )),
    }
}

/// Auto-release eligibility for the delivery-confirmation path: the delivery
/// must report `delivered` and this must be the first confirmation (no actual
/// delivery date yet), which shields against re-processed provider webhooks.
pub fn auto_release_eligible(delivery: &DeliveryRecord) -> bool {
    delivery.status == DeliveryStatus::Delivered && delivery.actual_date.is_none()
}
