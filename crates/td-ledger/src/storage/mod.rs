//! Study storage: the trait the rest of the workspace talks to and the
//! journal-backed implementations shipped with the ledger.

mod file;
mod memory;
mod state;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use td_types::{
    Distribution, FrozenTrial, LedgerError, LedgerResult, ParamValue, StudyDirection, StudyId,
    TrialId, TrialState,
};

pub use file::FileLog;
pub use memory::MemoryLog;
pub use state::JournalOp;

use state::LedgerState;

/// Where a storage keeps its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StorageKind {
    /// Lives inside one process; other processes cannot see it.
    InMemory,
    /// Append-only journal file that any process with access to the path can
    /// open.
    JournalFile,
}

impl StorageKind {
    /// Whether the records are only visible to the process that holds them.
    pub fn is_process_local(self) -> bool {
        matches!(self, Self::InMemory)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => write!(f, "in-memory"),
            Self::JournalFile => write!(f, "journal-file"),
        }
    }
}

/// Persistent record of studies and their trials.
///
/// Implementations must be safe to share between threads; trial-id
/// assignment and result recording are the storage's responsibility.
pub trait Storage: Send + Sync + fmt::Debug {
    fn kind(&self) -> StorageKind;

    // -- Studies ------------------------------------------------------------

    /// Create a study. Names are unique within a storage.
    fn create_study(&self, name: &str, direction: StudyDirection) -> LedgerResult<StudyId>;

    fn study_id(&self, name: &str) -> LedgerResult<StudyId>;

    fn study_name(&self, study_id: StudyId) -> LedgerResult<String>;

    fn study_direction(&self, study_id: StudyId) -> LedgerResult<StudyDirection>;

    fn study_names(&self) -> LedgerResult<Vec<String>>;

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> LedgerResult<()>;

    fn study_user_attrs(&self, study_id: StudyId) -> LedgerResult<BTreeMap<String, serde_json::Value>>;

    // -- Trials -------------------------------------------------------------

    /// Create a running trial and return its storage-wide id.
    fn create_trial(&self, study_id: StudyId) -> LedgerResult<TrialId>;

    /// Record a parameter value. If the parameter already has a value, that
    /// value is kept and returned instead of `value`.
    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        distribution: &Distribution,
        value: ParamValue,
    ) -> LedgerResult<ParamValue>;

    fn trial_param(&self, trial_id: TrialId, name: &str) -> LedgerResult<Option<ParamValue>>;

    fn report_intermediate_value(&self, trial_id: TrialId, step: u64, value: f64) -> LedgerResult<()>;

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> LedgerResult<()>;

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> LedgerResult<()>;

    /// Move a running trial to a terminal state.
    fn finish_trial(&self, trial_id: TrialId, state: TrialState, value: Option<f64>) -> LedgerResult<()>;

    fn trial(&self, trial_id: TrialId) -> LedgerResult<FrozenTrial>;

    fn trials(&self, study_id: StudyId) -> LedgerResult<Vec<FrozenTrial>>;
}

/// Append-only log a [`JournalStorage`] replays from.
pub trait JournalBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> StorageKind;

    /// Append a single op. The op must become visible to readers atomically.
    fn append(&self, op: &JournalOp) -> LedgerResult<()>;

    /// Read every complete op after `cursor`, returning them with the cursor
    /// to resume from.
    fn read_from(&self, cursor: u64) -> LedgerResult<(Vec<JournalOp>, u64)>;
}

#[derive(Debug, Default)]
struct Replica {
    cursor: u64,
    state: LedgerState,
}

/// A [`Storage`] that keeps a local replica of a journal up to date.
#[derive(Debug)]
pub struct JournalStorage<B> {
    backend: B,
    replica: Mutex<Replica>,
}

/// Process-local storage.
pub type InMemoryStorage = JournalStorage<MemoryLog>;

/// Storage shared through a journal file.
pub type JournalFileStorage = JournalStorage<FileLog>;

impl<B: JournalBackend> JournalStorage<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            replica: Mutex::new(Replica::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Catch the replica up with the journal and inspect it.
    fn read<R>(&self, f: impl FnOnce(&LedgerState) -> LedgerResult<R>) -> LedgerResult<R> {
        let mut replica = self.replica.lock();
        let (ops, cursor) = self.backend.read_from(replica.cursor)?;
        if !ops.is_empty() {
            debug!("Replaying {} journal ops from cursor {}", ops.len(), replica.cursor);
        }
        for op in ops {
            replica.state.apply(op);
        }
        replica.cursor = cursor;
        f(&replica.state)
    }

    fn running_trial(state: &LedgerState, trial_id: TrialId) -> LedgerResult<&FrozenTrial> {
        match state.trial(trial_id) {
            Some(trial) if trial.state.is_finished() => Err(LedgerError::TrialFinished { trial_id }),
            Some(trial) => Ok(trial),
            None => Err(LedgerError::TrialNotFound { trial_id }),
        }
    }

    fn check_study(state: &LedgerState, study_id: StudyId) -> LedgerResult<()> {
        state
            .study(study_id)
            .map(|_| ())
            .ok_or(LedgerError::UnknownStudy { study_id })
    }

    fn existing_param(
        trial: &FrozenTrial,
        name: &str,
        distribution: &Distribution,
    ) -> LedgerResult<Option<ParamValue>> {
        match (trial.params.get(name), trial.distributions.get(name)) {
            (Some(value), Some(recorded)) if recorded == distribution => Ok(Some(value.clone())),
            (Some(_), _) => Err(LedgerError::IncompatibleDistribution {
                trial_id: trial.trial_id,
                name: name.to_string(),
            }),
            (None, _) => Ok(None),
        }
    }
}

impl<B: JournalBackend> Storage for JournalStorage<B> {
    fn kind(&self) -> StorageKind {
        self.backend.kind()
    }

    fn create_study(&self, name: &str, direction: StudyDirection) -> LedgerResult<StudyId> {
        let duplicate = || LedgerError::DuplicatedStudy {
            name: name.to_string(),
        };
        if self.read(|state| Ok(state.study_id_by_name(name).is_some()))? {
            return Err(duplicate());
        }

        let nonce = Uuid::new_v4();
        self.backend.append(&JournalOp::CreateStudy {
            nonce,
            name: name.to_string(),
            direction,
        })?;

        // Another writer may have claimed the name between the check and the
        // append; the journal order decides.
        self.read(|state| state.study_id_by_nonce(&nonce).ok_or_else(duplicate))
    }

    fn study_id(&self, name: &str) -> LedgerResult<StudyId> {
        self.read(|state| {
            state
                .study_id_by_name(name)
                .ok_or_else(|| LedgerError::StudyNotFound {
                    name: name.to_string(),
                })
        })
    }

    fn study_name(&self, study_id: StudyId) -> LedgerResult<String> {
        self.read(|state| {
            state
                .study(study_id)
                .map(|study| study.name.clone())
                .ok_or(LedgerError::UnknownStudy { study_id })
        })
    }

    fn study_direction(&self, study_id: StudyId) -> LedgerResult<StudyDirection> {
        self.read(|state| {
            state
                .study(study_id)
                .map(|study| study.direction)
                .ok_or(LedgerError::UnknownStudy { study_id })
        })
    }

    fn study_names(&self) -> LedgerResult<Vec<String>> {
        self.read(|state| Ok(state.study_names()))
    }

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> LedgerResult<()> {
        self.read(|state| Self::check_study(state, study_id))?;
        self.backend.append(&JournalOp::SetStudyUserAttr {
            study_id,
            key: key.to_string(),
            value,
        })
    }

    fn study_user_attrs(&self, study_id: StudyId) -> LedgerResult<BTreeMap<String, serde_json::Value>> {
        self.read(|state| {
            state
                .study(study_id)
                .map(|study| study.user_attrs.clone())
                .ok_or(LedgerError::UnknownStudy { study_id })
        })
    }

    fn create_trial(&self, study_id: StudyId) -> LedgerResult<TrialId> {
        self.read(|state| Self::check_study(state, study_id))?;

        let nonce = Uuid::new_v4();
        self.backend.append(&JournalOp::CreateTrial {
            nonce,
            study_id,
            at: chrono::Utc::now(),
        })?;

        self.read(|state| {
            state
                .trial_id_by_nonce(&nonce)
                .ok_or(LedgerError::UnknownStudy { study_id })
        })
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        distribution: &Distribution,
        value: ParamValue,
    ) -> LedgerResult<ParamValue> {
        let existing = self.read(|state| {
            let trial = state
                .trial(trial_id)
                .ok_or(LedgerError::TrialNotFound { trial_id })?;
            if let Some(existing) = Self::existing_param(trial, name, distribution)? {
                return Ok(Some(existing));
            }
            Self::running_trial(state, trial_id)?;
            Ok(None)
        })?;
        if let Some(existing) = existing {
            return Ok(existing);
        }

        self.backend.append(&JournalOp::SetTrialParam {
            trial_id,
            name: name.to_string(),
            distribution: distribution.clone(),
            value,
        })?;

        self.read(|state| {
            let trial = state
                .trial(trial_id)
                .ok_or(LedgerError::TrialNotFound { trial_id })?;
            Self::existing_param(trial, name, distribution)?
                .ok_or(LedgerError::TrialFinished { trial_id })
        })
    }

    fn trial_param(&self, trial_id: TrialId, name: &str) -> LedgerResult<Option<ParamValue>> {
        self.read(|state| {
            state
                .trial(trial_id)
                .map(|trial| trial.params.get(name).cloned())
                .ok_or(LedgerError::TrialNotFound { trial_id })
        })
    }

    fn report_intermediate_value(&self, trial_id: TrialId, step: u64, value: f64) -> LedgerResult<()> {
        self.read(|state| Self::running_trial(state, trial_id).map(|_| ()))?;
        self.backend.append(&JournalOp::ReportIntermediateValue {
            trial_id,
            step,
            value,
        })
    }

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> LedgerResult<()> {
        self.read(|state| Self::running_trial(state, trial_id).map(|_| ()))?;
        self.backend.append(&JournalOp::SetTrialUserAttr {
            trial_id,
            key: key.to_string(),
            value,
        })
    }

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> LedgerResult<()> {
        self.read(|state| Self::running_trial(state, trial_id).map(|_| ()))?;
        self.backend.append(&JournalOp::SetTrialSystemAttr {
            trial_id,
            key: key.to_string(),
            value,
        })
    }

    fn finish_trial(&self, trial_id: TrialId, state: TrialState, value: Option<f64>) -> LedgerResult<()> {
        self.read(|ledger| Self::running_trial(ledger, trial_id).map(|_| ()))?;
        self.backend.append(&JournalOp::FinishTrial {
            trial_id,
            state,
            value,
            at: chrono::Utc::now(),
        })
    }

    fn trial(&self, trial_id: TrialId) -> LedgerResult<FrozenTrial> {
        self.read(|state| {
            state
                .trial(trial_id)
                .cloned()
                .ok_or(LedgerError::TrialNotFound { trial_id })
        })
    }

    fn trials(&self, study_id: StudyId) -> LedgerResult<Vec<FrozenTrial>> {
        self.read(|state| {
            state
                .study(study_id)
                .map(|study| state.trials_of(study))
                .ok_or(LedgerError::UnknownStudy { study_id })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_trial() -> (InMemoryStorage, StudyId, TrialId) {
        let storage = InMemoryStorage::new();
        let study_id = storage
            .create_study("cifar", StudyDirection::Maximize)
            .unwrap();
        let trial_id = storage.create_trial(study_id).unwrap();
        (storage, study_id, trial_id)
    }

    #[test]
    fn duplicate_study_names_are_rejected() {
        let storage = InMemoryStorage::new();
        storage.create_study("cifar", StudyDirection::Minimize).unwrap();

        let err = storage
            .create_study("cifar", StudyDirection::Maximize)
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicatedStudy { name } if name == "cifar"));
        assert_eq!(storage.study_names().unwrap(), vec!["cifar".to_string()]);
    }

    #[test]
    fn study_lookup_by_name() {
        let (storage, study_id, _) = storage_with_trial();
        assert_eq!(storage.study_id("cifar").unwrap(), study_id);
        assert_eq!(storage.study_name(study_id).unwrap(), "cifar");
        assert_eq!(
            storage.study_direction(study_id).unwrap(),
            StudyDirection::Maximize
        );
        assert!(matches!(
            storage.study_id("imagenet"),
            Err(LedgerError::StudyNotFound { .. })
        ));
    }

    #[test]
    fn set_trial_param_returns_the_recorded_value() {
        let (storage, _, trial_id) = storage_with_trial();
        let dist = Distribution::Float { low: 0.0, high: 1.0 };

        let first = storage
            .set_trial_param(trial_id, "momentum", &dist, ParamValue::Float(0.9))
            .unwrap();
        let second = storage
            .set_trial_param(trial_id, "momentum", &dist, ParamValue::Float(0.1))
            .unwrap();

        assert_eq!(first, ParamValue::Float(0.9));
        assert_eq!(second, ParamValue::Float(0.9));
        assert_eq!(
            storage.trial_param(trial_id, "momentum").unwrap(),
            Some(ParamValue::Float(0.9))
        );
    }

    #[test]
    fn set_trial_param_rejects_a_different_distribution() {
        let (storage, _, trial_id) = storage_with_trial();
        storage
            .set_trial_param(
                trial_id,
                "layers",
                &Distribution::Int { low: 1, high: 3 },
                ParamValue::Int(2),
            )
            .unwrap();

        let err = storage
            .set_trial_param(
                trial_id,
                "layers",
                &Distribution::Int { low: 1, high: 8 },
                ParamValue::Int(5),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::IncompatibleDistribution { .. }));
    }

    #[test]
    fn finished_trials_keep_recorded_params_readable() {
        let (storage, _, trial_id) = storage_with_trial();
        let dist = Distribution::Int { low: 0, high: 10 };
        storage
            .set_trial_param(trial_id, "depth", &dist, ParamValue::Int(4))
            .unwrap();
        storage
            .finish_trial(trial_id, TrialState::Complete, Some(0.8))
            .unwrap();

        let recorded = storage
            .set_trial_param(trial_id, "depth", &dist, ParamValue::Int(9))
            .unwrap();
        assert_eq!(recorded, ParamValue::Int(4));

        let err = storage
            .set_trial_param(trial_id, "width", &dist, ParamValue::Int(9))
            .unwrap_err();
        assert!(matches!(err, LedgerError::TrialFinished { .. }));

        let err = storage
            .finish_trial(trial_id, TrialState::Fail, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::TrialFinished { .. }));
    }

    #[test]
    fn trial_records_collect_reports_and_attrs() {
        let (storage, study_id, trial_id) = storage_with_trial();
        storage.report_intermediate_value(trial_id, 0, 0.3).unwrap();
        storage.report_intermediate_value(trial_id, 1, 0.5).unwrap();
        storage
            .set_trial_user_attr(trial_id, "node", serde_json::json!("gpu-3"))
            .unwrap();
        storage
            .finish_trial(trial_id, TrialState::Complete, Some(0.5))
            .unwrap();

        let trials = storage.trials(study_id).unwrap();
        assert_eq!(trials.len(), 1);
        let trial = &trials[0];
        assert_eq!(trial.state, TrialState::Complete);
        assert_eq!(trial.value, Some(0.5));
        assert_eq!(trial.intermediate_values.len(), 2);
        assert_eq!(trial.user_attrs["node"], serde_json::json!("gpu-3"));
        assert!(trial.finished_at.is_some());
    }

    #[test]
    fn unknown_ids_are_reported() {
        let storage = InMemoryStorage::new();
        assert!(matches!(
            storage.create_trial(StudyId(4)),
            Err(LedgerError::UnknownStudy { .. })
        ));
        assert!(matches!(
            storage.trial(TrialId(0)),
            Err(LedgerError::TrialNotFound { .. })
        ));
    }

    #[test]
    fn storage_kinds() {
        assert!(InMemoryStorage::new().kind().is_process_local());
        assert!(!StorageKind::JournalFile.is_process_local());
        assert_eq!(StorageKind::JournalFile.to_string(), "journal-file");
    }
}
