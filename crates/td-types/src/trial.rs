//! Study and trial records shared by the ledger and the coordination layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::distribution::{Distribution, ParamValue};

/// Storage-assigned study identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudyId(pub u64);

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-assigned trial identifier, unique across every study of a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId(pub u64);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a study minimizes or maximizes the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyDirection {
    #[default]
    Minimize,
    Maximize,
}

impl StudyDirection {
    /// True when `candidate` is strictly better than `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Running,
    Complete,
    Fail,
}

impl TrialState {
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// System attribute holding the reason a trial failed.
pub const FAIL_REASON_ATTR: &str = "fail_reason";

/// Snapshot of a single trial as recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub trial_id: TrialId,
    pub study_id: StudyId,
    /// Zero-based position of the trial within its study.
    pub number: usize,
    pub state: TrialState,
    pub value: Option<f64>,
    pub params: BTreeMap<String, ParamValue>,
    pub distributions: BTreeMap<String, Distribution>,
    pub intermediate_values: BTreeMap<u64, f64>,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub system_attrs: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FrozenTrial {
    pub fn new(trial_id: TrialId, study_id: StudyId, number: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            trial_id,
            study_id,
            number,
            state: TrialState::Running,
            value: None,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            user_attrs: BTreeMap::new(),
            system_attrs: BTreeMap::new(),
            started_at,
            finished_at: None,
        }
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.system_attrs
            .get(FAIL_REASON_ATTR)
            .and_then(|value| value.as_str())
    }

    /// Wall-clock duration, once the trial has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
