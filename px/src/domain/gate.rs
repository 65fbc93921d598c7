//! GateRecord domain type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionstore::Record;

use super::naming::validate_branch_name;
use super::phase::Phase;

/// One gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEntry {
    pub phase: Phase,
    pub gate: String,
    pub passed: bool,
    /// Measured value where the gate has one (score, percent, count)
    #[serde(default)]
    pub value: Option<f64>,
    pub detail: String,
    /// Branch head the evaluation ran against
    #[serde(default)]
    pub head: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Append-only history of gate evaluations for one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub branch: String,
    #[serde(default)]
    pub entries: Vec<GateEntry>,
}

impl GateRecord {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            entries: Vec::new(),
        }
    }

    /// The authoritative (latest) entry for a phase and gate
    pub fn latest(&self, phase: Phase, gate: &str) -> Option<&GateEntry> {
        self.entries.iter().rev().find(|e| e.phase == phase && e.gate == gate)
    }
}

impl Record for GateRecord {
    fn id(&self) -> &str {
        &self.branch
    }

    fn collection_name() -> &'static str {
        "gates"
    }

    fn validate(&self) -> Result<(), String> {
        validate_branch_name(&self.branch)?;
        if self.entries.windows(2).any(|w| w[1].checked_at < w[0].checked_at) {
            return Err("gate entries out of order".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{assert_corrupt_on_disk, at, temp_store};
    use proptest::prelude::*;

    fn entry(gate: &str, passed: bool, at: DateTime<Utc>) -> GateEntry {
        GateEntry {
            phase: Phase::P3,
            gate: gate.to_string(),
            passed,
            value: None,
            detail: String::new(),
            head: None,
            checked_at: at,
        }
    }

    #[test]
    fn test_latest_entry_wins() {
        let now = Utc::now();
        let mut record = GateRecord::new("feature/x1");
        record.entries.push(entry("score", false, now));
        record.entries.push(entry("coverage", true, now));
        record.entries.push(entry("score", true, now + chrono::Duration::seconds(1)));

        assert!(record.latest(Phase::P3, "score").unwrap().passed);
        assert!(record.latest(Phase::P4, "score").is_none());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_out_of_order_entries_invalid() {
        let now = Utc::now();
        let mut record = GateRecord::new("feature/x1");
        record.entries.push(entry("score", true, now));
        record.entries.push(entry("score", true, now - chrono::Duration::seconds(5)));
        assert!(record.validate().is_err());
    }

    fn record_strategy() -> impl Strategy<Value = GateRecord> {
        (
            "[a-z0-9]{2,12}",
            proptest::collection::vec(
                (0u8..8, "[a-z]{3,10}", any::<bool>(), proptest::option::of(0u32..100), 0i64..600),
                0..6,
            ),
        )
            .prop_map(|(leaf, raw)| {
                let mut record = GateRecord::new(format!("feature/{}", leaf));
                let mut elapsed = 0;
                for (phase, gate, passed, value, step) in raw {
                    elapsed += step;
                    record.entries.push(GateEntry {
                        phase: Phase::from_index(phase).unwrap(),
                        gate,
                        passed,
                        value: value.map(f64::from),
                        detail: String::new(),
                        head: None,
                        checked_at: at(elapsed),
                    });
                }
                record
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_gate_record_round_trips_through_store(record in record_strategy()) {
            let (_temp, store) = temp_store();
            let branch = record.branch.clone();
            store.save(&record).unwrap();
            prop_assert_eq!(store.load::<GateRecord>(&branch).unwrap(), Some(record));
        }

        #[test]
        fn prop_gate_record_out_of_order_is_corrupt(record in record_strategy()) {
            let last = record.entries.last().map_or(at(0), |e| e.checked_at);
            let mut broken = record.clone();
            broken.entries.push(entry("score", true, last + chrono::Duration::seconds(10)));
            broken.entries.push(entry("score", false, last + chrono::Duration::seconds(5)));
            prop_assert!(broken.validate().is_err());

            let (_temp, store) = temp_store();
            assert_corrupt_on_disk(&store, &broken, &record);
        }
    }
}
