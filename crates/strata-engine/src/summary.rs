use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::ChangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Preview,
    Destroy,
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    /// Nothing failed, but some steps never ran.
    PartiallySucceeded,
    Failed,
}

/// Outcome of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub operation: Operation,
    pub result: RunResult,
    pub counts: BTreeMap<ChangeKind, usize>,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn has_changes(&self) -> bool {
        self.counts
            .iter()
            .any(|(kind, n)| *kind != ChangeKind::Same && *n > 0)
    }
}

pub(crate) fn result_for(failed: usize, skipped: usize) -> RunResult {
    if failed > 0 {
        RunResult::Failed
    } else if skipped > 0 {
        RunResult::PartiallySucceeded
    } else {
        RunResult::Succeeded
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
