//! Journal operations and the ledger state they replay into.
//!
//! Every storage in this crate is an append-only log of [`JournalOp`]s.
//! Identifiers and conflicts are resolved purely by log order while
//! replaying, so any two replicas that have read the same prefix of the log
//! hold identical state:
//!
//! - study and trial ids are the position of their creation op among ops of
//!   the same kind;
//! - a study name belongs to the first `CreateStudy` that used it;
//! - a parameter keeps the first value written for it;
//! - ops against finished trials are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

use td_types::{
    Distribution, FrozenTrial, ParamValue, StudyDirection, StudyId, TrialId, TrialState,
};

/// One record of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    CreateStudy {
        nonce: Uuid,
        name: String,
        direction: StudyDirection,
    },
    SetStudyUserAttr {
        study_id: StudyId,
        key: String,
        value: serde_json::Value,
    },
    CreateTrial {
        nonce: Uuid,
        study_id: StudyId,
        at: DateTime<Utc>,
    },
    SetTrialParam {
        trial_id: TrialId,
        name: String,
        distribution: Distribution,
        value: ParamValue,
    },
    ReportIntermediateValue {
        trial_id: TrialId,
        step: u64,
        value: f64,
    },
    SetTrialUserAttr {
        trial_id: TrialId,
        key: String,
        value: serde_json::Value,
    },
    SetTrialSystemAttr {
        trial_id: TrialId,
        key: String,
        value: serde_json::Value,
    },
    FinishTrial {
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct StudyRecord {
    pub name: String,
    pub direction: StudyDirection,
    pub user_attrs: BTreeMap<String, serde_json::Value>,
    pub trial_ids: Vec<TrialId>,
}

/// Materialized view of a journal prefix.
#[derive(Debug, Default)]
pub struct LedgerState {
    studies: Vec<StudyRecord>,
    study_names: HashMap<String, StudyId>,
    trials: Vec<FrozenTrial>,
    study_nonces: HashMap<Uuid, StudyId>,
    trial_nonces: HashMap<Uuid, TrialId>,
}

impl LedgerState {
    pub fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::CreateStudy {
                nonce,
                name,
                direction,
            } => {
                if self.study_names.contains_key(&name) {
                    debug!("Dropping duplicate study creation for {}", name);
                    return;
                }
                let study_id = StudyId(self.studies.len() as u64);
                self.study_names.insert(name.clone(), study_id);
                self.study_nonces.insert(nonce, study_id);
                self.studies.push(StudyRecord {
                    name,
                    direction,
                    user_attrs: BTreeMap::new(),
                    trial_ids: Vec::new(),
                });
            }
            JournalOp::SetStudyUserAttr {
                study_id,
                key,
                value,
            } => {
                if let Some(study) = self.studies.get_mut(study_id.0 as usize) {
                    study.user_attrs.insert(key, value);
                }
            }
            JournalOp::CreateTrial {
                nonce,
                study_id,
                at,
            } => {
                let Some(study) = self.studies.get_mut(study_id.0 as usize) else {
                    debug!("Dropping trial creation for unknown study {}", study_id);
                    return;
                };
                let trial_id = TrialId(self.trials.len() as u64);
                let number = study.trial_ids.len();
                study.trial_ids.push(trial_id);
                self.trial_nonces.insert(nonce, trial_id);
                self.trials
                    .push(FrozenTrial::new(trial_id, study_id, number, at));
            }
            JournalOp::SetTrialParam {
                trial_id,
                name,
                distribution,
                value,
            } => {
                if let Some(trial) = self.running_trial_mut(trial_id) {
                    if !trial.params.contains_key(&name) {
                        trial.distributions.insert(name.clone(), distribution);
                        trial.params.insert(name, value);
                    }
                }
            }
            JournalOp::ReportIntermediateValue {
                trial_id,
                step,
                value,
            } => {
                if let Some(trial) = self.running_trial_mut(trial_id) {
                    trial.intermediate_values.entry(step).or_insert(value);
                }
            }
            JournalOp::SetTrialUserAttr {
                trial_id,
                key,
                value,
            } => {
                if let Some(trial) = self.running_trial_mut(trial_id) {
                    trial.user_attrs.insert(key, value);
                }
            }
            JournalOp::SetTrialSystemAttr {
                trial_id,
                key,
                value,
            } => {
                if let Some(trial) = self.running_trial_mut(trial_id) {
                    trial.system_attrs.insert(key, value);
                }
            }
            JournalOp::FinishTrial {
                trial_id,
                state,
                value,
                at,
            } => {
                if let Some(trial) = self.running_trial_mut(trial_id) {
                    trial.state = state;
                    trial.value = value;
                    trial.finished_at = Some(at);
                }
            }
        }
    }

    fn running_trial_mut(&mut self, trial_id: TrialId) -> Option<&mut FrozenTrial> {
        match self.trials.get_mut(trial_id.0 as usize) {
            Some(trial) if trial.state == TrialState::Running => Some(trial),
            Some(_) => {
                debug!("Dropping update for finished trial {}", trial_id);
                None
            }
            None => {
                debug!("Dropping update for unknown trial {}", trial_id);
                None
            }
        }
    }

    pub(crate) fn study(&self, study_id: StudyId) -> Option<&StudyRecord> {
        self.studies.get(study_id.0 as usize)
    }

    pub(crate) fn study_id_by_name(&self, name: &str) -> Option<StudyId> {
        self.study_names.get(name).copied()
    }

    pub(crate) fn study_id_by_nonce(&self, nonce: &Uuid) -> Option<StudyId> {
        self.study_nonces.get(nonce).copied()
    }

    pub(crate) fn trial_id_by_nonce(&self, nonce: &Uuid) -> Option<TrialId> {
        self.trial_nonces.get(nonce).copied()
    }

    pub(crate) fn trial(&self, trial_id: TrialId) -> Option<&FrozenTrial> {
        self.trials.get(trial_id.0 as usize)
    }

    pub(crate) fn study_names(&self) -> Vec<String> {
        self.studies.iter().map(|study| study.name.clone()).collect()
    }

    pub(crate) fn trials_of(&self, study: &StudyRecord) -> Vec<FrozenTrial> {
        study
            .trial_ids
            .iter()
            .filter_map(|id| self.trial(*id).cloned())
            .collect()
    }
}
