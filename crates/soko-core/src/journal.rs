use crate::error::MarketError;
use crate::types::ReleaseType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Settlement journal entry kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    EscrowHeld,
    EscrowReleased,
    EscrowRefunded,
    EscrowFrozen,
    CommissionPaid,
}

/// Hash-chained settlement journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub kind: JournalKind,
    pub order_id: Option<String>,
    pub escrow_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Audit payload for a release decision. This is the durable record of who
/// moved held funds and under which policy path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowReleaseRecord {
    pub escrow_id: String,
    pub release_type: ReleaseType,
    pub requested_by: String,
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Append-only settlement journal with hash-chain proofs.
///
/// No in-place mutation APIs are exposed. Every escrow or commission
/// settlement becomes an additional record, which preserves full historical
/// accountability for money movements.
#[derive(Debug, Default, Clone)]
pub struct SettlementJournal {
    entries: Vec<JournalEntry>,
}

impl SettlementJournal {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a journal from persisted entries and verify chain integrity.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, MarketError> {
        let journal = Self { entries };

        for (expected_index, entry) in journal.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(MarketError::persistence(format!(
                    "journal index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !journal.verify_chain() {
            return Err(MarketError::persistence(
                "persisted settlement journal hash-chain verification failed",
            ));
        }

        Ok(journal)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn entries_for_escrow(&self, escrow_id: &str) -> Vec<&JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.escrow_id.as_deref() == Some(escrow_id))
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected_hash = compute_entry_hash(
                entry.index,
                &entry.kind,
                entry.order_id.as_deref(),
                entry.escrow_id.as_deref(),
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash {
                return false;
            }
            if entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    /// Build the next deterministic entry without mutating the chain.
    pub fn build_entry(
        &self,
        kind: JournalKind,
        order_id: Option<String>,
        escrow_id: Option<String>,
        payload: Value,
    ) -> JournalEntry {
        let index = self.entries.len() as u64;
        let timestamp = Utc::now();
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            &kind,
            order_id.as_deref(),
            escrow_id.as_deref(),
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );

        JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            kind,
            order_id,
            escrow_id,
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        }
    }

    /// Commit a pre-built entry after external durability succeeds.
    pub fn commit_entry(&mut self, entry: JournalEntry) -> Result<(), MarketError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(MarketError::persistence(format!(
                "journal commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous_hash = self.entries.last().map(|e| e.entry_hash.clone());
        if entry.previous_hash != expected_previous_hash {
            return Err(MarketError::persistence(
                "journal commit previous hash mismatch",
            ));
        }

        let expected_hash = compute_entry_hash(
            entry.index,
            &entry.kind,
            entry.order_id.as_deref(),
            entry.escrow_id.as_deref(),
            entry.timestamp,
            &entry.payload,
            entry.previous_hash.as_deref(),
        );

        if entry.entry_hash != expected_hash {
            return Err(MarketError::persistence(
                "journal commit hash mismatch for entry",
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(
    index: u64,
    kind: &JournalKind,
    order_id: Option<&str>,
    escrow_id: Option<&str>,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "kind": kind,
        "order_id": order_id,
        "escrow_id": escrow_id,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

pub fn kind_to_str(kind: &JournalKind) -> &'static str {
    match kind {
        JournalKind::EscrowHeld => "escrow_held",
        JournalKind::EscrowReleased => "escrow_released",
        JournalKind::EscrowRefunded => "escrow_refunded",
        JournalKind::EscrowFrozen => "escrow_frozen",
        JournalKind::CommissionPaid => "commission_paid",
    }
}

pub fn parse_kind(value: &str) -> Result<JournalKind, MarketError> {
    match value {
        "escrow_held" => Ok(JournalKind::EscrowHeld),
        "escrow_released" => Ok(JournalKind::EscrowReleased),
        "escrow_refunded" => Ok(JournalKind::EscrowRefunded),
        "escrow_frozen" => Ok(JournalKind::EscrowFrozen),
        "commission_paid" => Ok(JournalKind::CommissionPaid),
        other => Err(MarketError::persistence(format!(
            "unknown journal kind '{other}' in storage"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_entry(journal: &SettlementJournal) -> JournalEntry {
        journal.build_entry(
            JournalKind::EscrowHeld,
            Some("order-1".to_string()),
            Some("esc-1".to_string()),
            serde_json::json!({ "amount_minor": 10_000 }),
        )
    }

    #[test]
    fn verifies_hash_chain() {
        let mut journal = SettlementJournal::new();
        let first = held_entry(&journal);
        journal.commit_entry(first).expect("held committed");

        let release = journal.build_entry(
            JournalKind::EscrowReleased,
            Some("order-1".to_string()),
            Some("esc-1".to_string()),
            serde_json::to_value(EscrowReleaseRecord {
                escrow_id: "esc-1".to_string(),
                release_type: ReleaseType::ManualBuyer,
                requested_by: "buyer-1".to_string(),
                delivery_confirmed_at: Some(Utc::now()),
                notes: None,
            })
            .unwrap(),
        );
        journal.commit_entry(release).expect("release committed");

        assert!(journal.verify_chain());
        assert_eq!(journal.entries_for_escrow("esc-1").len(), 2);
    }

    #[test]
    fn detects_tampered_entries() {
        let mut journal = SettlementJournal::new();
        let entry = held_entry(&journal);
        journal.commit_entry(entry).expect("held committed");

        let mut tampered = journal.clone();
        tampered.entries[0].payload = serde_json::json!({ "amount_minor": 1 });

        assert!(!tampered.verify_chain());
    }

    #[test]
    fn rejects_out_of_order_commit() {
        let mut journal = SettlementJournal::new();
        let first = held_entry(&journal);
        let stale = first.clone();
        journal.commit_entry(first).expect("held committed");

        let err = journal.commit_entry(stale).unwrap_err();
        assert!(matches!(err, MarketError::Persistence(_)));
    }

    #[test]
    fn from_entries_rehydrates_verified_chain() {
        let mut journal = SettlementJournal::new();
        let first = held_entry(&journal);
        journal.commit_entry(first.clone()).expect("held committed");

        let rehydrated = SettlementJournal::from_entries(journal.entries().to_vec()).unwrap();
        assert_eq!(rehydrated.entries().len(), 1);
        assert_eq!(rehydrated.entries()[0].entry_id, first.entry_id);
        assert!(rehydrated.verify_chain());
    }

    #[test]
    fn kind_string_roundtrip() {
        let kinds = [
            JournalKind::EscrowHeld,
            JournalKind::EscrowReleased,
            JournalKind::EscrowRefunded,
            JournalKind::EscrowFrozen,
            JournalKind::CommissionPaid,
        ];

        for kind in kinds {
            let parsed = parse_kind(kind_to_str(&kind)).unwrap();
            assert_eq!(kind, parsed);
        }
    }
}
