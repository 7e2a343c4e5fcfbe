use crate::types::{Referral, ReferralStatus, ReferrerType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pending commission owed to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingCommission {
    pub referrer_type: ReferrerType,
    pub referrer_id: String,
    pub referral_count: usize,
    pub total_minor: u64,
    pub referral_ids: Vec<String>,
}

/// A referral is payable once completed and not yet paid out.
pub fn is_payable(referral: &Referral) -> bool {
    referral.status == ReferralStatus::Completed && !referral.commission_paid
}

/// Unpaid completed commission grouped by recipient, in deterministic
/// recipient order. This is what an admin payout should cover.
pub fn pending_by_recipient<'a, I>(referrals: I) -> Vec<PendingCommission>
where
    I: IntoIterator<Item = &'a Referral>,
{
    let mut groups: BTreeMap<(ReferrerType, String), PendingCommission> = BTreeMap::new();
    for referral in referrals.into_iter().filter(|r| is_payable(r)) {
        let entry = groups
            .entry((referral.referrer_type, referral.referrer_id.clone()))
            .or_insert_with(|| PendingCommission {
                referrer_type: referral.referrer_type,
                referrer_id: referral.referrer_id.clone(),
                referral_count: 0,
                total_minor: 0,
                referral_ids: Vec::new(),
            });
        entry.referral_count += 1;
        entry.total_minor = entry.total_minor.saturating_add(referral.commission_minor);
        entry.referral_ids.push(referral.referral_id.clone());
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn referral(
        id: &str,
        referrer_type: ReferrerType,
        referrer_id: &str,
        commission: u64,
        status: ReferralStatus,
        paid: bool,
    ) -> Referral {
        Referral {
            referral_id: id.to_string(),
            referrer_type,
            referrer_id: referrer_id.to_string(),
            referred_vendor_id: format!("vendor-for-{id}"),
            code: "AB12CD".to_string(),
            status,
            commission_minor: commission,
            commission_paid: paid,
            commission_paid_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn groups_unpaid_completed_referrals_by_recipient() {
        let referrals = vec![
            referral("r-1", ReferrerType::Vendor, "vendor-a", 5_000, ReferralStatus::Completed, false),
            referral("r-2", ReferrerType::Vendor, "vendor-a", 5_000, ReferralStatus::Completed, false),
            referral("r-3", ReferrerType::Marketer, "mkt-1", 7_000, ReferralStatus::Completed, false),
            // Already paid and non-completed rows never count.
            referral("r-4", ReferrerType::Vendor, "vendor-a", 5_000, ReferralStatus::Completed, true),
            referral("r-5", ReferrerType::Marketer, "mkt-1", 7_000, ReferralStatus::Pending, false),
            referral("r-6", ReferrerType::Marketer, "mkt-2", 7_000, ReferralStatus::Rejected, false),
        ];

        let pending = pending_by_recipient(referrals.iter());
        assert_eq!(pending.len(), 2);

        let vendor = pending
            .iter()
            .find(|p| p.referrer_id == "vendor-a")
            .unwrap();
        assert_eq!(vendor.referral_count, 2);
        assert_eq!(vendor.total_minor, 10_000);
        assert_eq!(vendor.referral_ids, vec!["r-1", "r-2"]);

        let marketer = pending.iter().find(|p| p.referrer_id == "mkt-1").unwrap();
        assert_eq!(marketer.total_minor, 7_000);
    }

    #[test]
    fn payable_requires_completed_and_unpaid() {
        let payable = referral("r-1", ReferrerType::Vendor, "v", 1, ReferralStatus::Completed, false);
        assert!(is_payable(&payable));
        let paid = referral("r-2", ReferrerType::Vendor, "v", 1, ReferralStatus::Completed, true);
        assert!(!is_payable(&paid));
        let pending = referral("r-3", ReferrerType::Vendor, "v", 1, ReferralStatus::Pending, false);
        assert!(!is_payable(&pending));
    }
}
