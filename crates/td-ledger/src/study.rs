//! Study handle and its run loop.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use td_types::{
    FrozenTrial, LedgerError, ParamValue, StudyDirection, StudyId, TdError, TdResult,
    TrialState, FAIL_REASON_ATTR,
};

use crate::run::{CatchPolicy, RunConfig};
use crate::sampler::{RandomSampler, Sampler};
use crate::storage::{Storage, StorageKind};
use crate::trial::Trial;

/// A named study recorded in a storage.
///
/// Cloning is cheap; clones share the storage and sampler.
#[derive(Debug, Clone)]
pub struct Study {
    study_id: StudyId,
    study_name: String,
    storage: Arc<dyn Storage>,
    sampler: Arc<dyn Sampler>,
}

impl Study {
    /// Create a new study; fails if the name is taken in `storage`.
    pub fn create(
        study_name: &str,
        storage: Arc<dyn Storage>,
        direction: StudyDirection,
    ) -> TdResult<Self> {
        let study_id = storage.create_study(study_name, direction)?;
        info!("Created study {} ({:?}) in {} storage", study_name, direction, storage.kind());
        Ok(Self::bind(study_id, study_name, storage))
    }

    /// Attach to an existing study.
    pub fn load(study_name: &str, storage: Arc<dyn Storage>) -> TdResult<Self> {
        let study_id = storage.study_id(study_name)?;
        debug!("Loaded study {} (id {})", study_name, study_id);
        Ok(Self::bind(study_id, study_name, storage))
    }

    /// Create the study, or attach to it if another writer created it first.
    pub fn create_or_load(
        study_name: &str,
        storage: Arc<dyn Storage>,
        direction: StudyDirection,
    ) -> TdResult<Self> {
        match storage.create_study(study_name, direction) {
            Ok(study_id) => Ok(Self::bind(study_id, study_name, storage)),
            Err(LedgerError::DuplicatedStudy { .. }) => Self::load(study_name, storage),
            Err(err) => Err(err.into()),
        }
    }

    fn bind(study_id: StudyId, study_name: &str, storage: Arc<dyn Storage>) -> Self {
        Self {
            study_id,
            study_name: study_name.to_string(),
            storage,
            sampler: Arc::new(RandomSampler::new()),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn set_sampler(&mut self, sampler: Arc<dyn Sampler>) {
        self.sampler = sampler;
    }

    pub fn sampler(&self) -> &Arc<dyn Sampler> {
        &self.sampler
    }

    pub fn study_id(&self) -> StudyId {
        self.study_id
    }

    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }

    pub fn direction(&self) -> TdResult<StudyDirection> {
        Ok(self.storage.study_direction(self.study_id)?)
    }

    pub fn trials(&self) -> TdResult<Vec<FrozenTrial>> {
        Ok(self.storage.trials(self.study_id)?)
    }

    /// Best completed trial according to the study direction.
    pub fn best_trial(&self) -> TdResult<FrozenTrial> {
        let direction = self.direction()?;
        let mut best: Option<FrozenTrial> = None;
        for trial in self.trials()? {
            let Some(value) = trial.value.filter(|_| trial.state == TrialState::Complete) else {
                continue;
            };
            let improves = match best.as_ref().and_then(|b| b.value) {
                None => true,
                Some(incumbent) => direction.improves(value, incumbent),
            };
            if improves {
                best = Some(trial);
            }
        }
        best.ok_or_else(|| {
            LedgerError::NoCompletedTrials {
                study_name: self.study_name.clone(),
            }
            .into()
        })
    }

    pub fn best_value(&self) -> TdResult<f64> {
        self.best_trial()?
            .value
            .ok_or_else(|| td_types::internal_error!("completed trial without a value"))
    }

    pub fn best_params(&self) -> TdResult<BTreeMap<String, ParamValue>> {
        Ok(self.best_trial()?.params)
    }

    pub fn user_attrs(&self) -> TdResult<BTreeMap<String, serde_json::Value>> {
        Ok(self.storage.study_user_attrs(self.study_id)?)
    }

    pub fn set_user_attr(&self, key: &str, value: impl Into<serde_json::Value>) -> TdResult<()> {
        Ok(self
            .storage
            .set_study_user_attr(self.study_id, key, value.into())?)
    }

    /// Evaluate `objective` on new trials until the budget in `config` is
    /// spent.
    ///
    /// Each trial is created in the storage, handed to the objective, and
    /// finished as `Complete` (finite value) or `Fail`. Objective errors
    /// accepted by `catch` only fail their trial; any other error fails the
    /// trial and ends the run.
    pub fn run<F>(&self, objective: F, config: &RunConfig, catch: &CatchPolicy) -> TdResult<()>
    where
        F: Fn(&mut Trial) -> anyhow::Result<f64> + Sync,
    {
        let started = Instant::now();
        let timeout = config.timeout();
        let jobs = config.effective_jobs();
        let issued = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let first_error: Mutex<Option<TdError>> = Mutex::new(None);

        info!(
            "Running study {} (n_trials: {:?}, timeout: {:?}, jobs: {})",
            self.study_name, config.n_trials, timeout, jobs
        );

        let worker = || loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if let Some(n_trials) = config.n_trials {
                if issued.fetch_add(1, Ordering::SeqCst) >= n_trials {
                    break;
                }
            }
            if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                debug!("Study {} reached its timeout", self.study_name);
                break;
            }
            if let Err(err) = self.run_trial(&objective, catch) {
                stop.store(true, Ordering::SeqCst);
                first_error.lock().get_or_insert(err);
                break;
            }
        };

        if jobs <= 1 {
            worker();
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .build()
                .map_err(|err| td_types::internal_error!("failed to start {jobs} workers: {err}"))?;
            pool.scope(|scope| {
                for _ in 0..jobs {
                    scope.spawn(|_| worker());
                }
            });
        }

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => {
                info!(
                    "Study {} finished its run in {:.2?}",
                    self.study_name,
                    started.elapsed()
                );
                Ok(())
            }
        }
    }

    fn run_trial<F>(&self, objective: &F, catch: &CatchPolicy) -> TdResult<()>
    where
        F: Fn(&mut Trial) -> anyhow::Result<f64>,
    {
        let trial_id = self.storage.create_trial(self.study_id)?;
        let mut trial = Trial::new(self, trial_id);
        debug!("Trial {} started", trial_id);

        match objective(&mut trial) {
            Ok(value) if value.is_finite() => {
                self.storage
                    .finish_trial(trial_id, TrialState::Complete, Some(value))?;
                info!("Trial {} finished with value {}", trial_id, value);
                Ok(())
            }
            Ok(value) => {
                let reason = format!("objective returned a non-finite value: {value}");
                warn!("Trial {} failed: {}", trial_id, reason);
                self.fail_trial(trial_id, &reason)
            }
            Err(err) if catch.catches(&err) => {
                warn!("Trial {} failed with a caught error: {:#}", trial_id, err);
                self.fail_trial(trial_id, &format!("{err:#}"))
            }
            Err(err) => {
                warn!("Trial {} failed, aborting the run: {:#}", trial_id, err);
                // A failed finish must not hide the objective's error.
                if let Err(record_err) = self.fail_trial(trial_id, &format!("{err:#}")) {
                    warn!("Could not record failure of trial {}: {}", trial_id, record_err);
                }
                Err(TdError::from_objective(trial_id, err))
            }
        }
    }

    fn fail_trial(&self, trial_id: td_types::TrialId, reason: &str) -> TdResult<()> {
        self.storage.set_trial_system_attr(
            trial_id,
            FAIL_REASON_ATTR,
            serde_json::Value::String(reason.to_string()),
        )?;
        self.storage.finish_trial(trial_id, TrialState::Fail, None)?;
        Ok(())
    }
}
