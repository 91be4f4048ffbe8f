//! Trial handle handed to objectives.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use td_types::{
    Distribution, FrozenTrial, LedgerError, LedgerResult, ParamValue, StudyId, TdError, TdResult,
    TrialId,
};

use crate::sampler::Sampler;
use crate::storage::Storage;
use crate::study::Study;

/// A live trial bound to a study's storage.
///
/// Several handles (possibly in different processes) may be bound to the same
/// trial id. Parameter values are settled by the storage, so every handle
/// suggesting the same parameter gets the same value.
///
/// A mirrored handle evaluates a trial that another participant records.
/// That participant may finish the trial first; writes a mirrored handle
/// makes after that point are dropped, as the journal drops them on replay.
#[derive(Debug, Clone)]
pub struct Trial {
    trial_id: TrialId,
    study_id: StudyId,
    storage: Arc<dyn Storage>,
    sampler: Arc<dyn Sampler>,
    mirrored: bool,
}

impl Trial {
    pub fn new(study: &Study, trial_id: TrialId) -> Self {
        Self {
            trial_id,
            study_id: study.study_id(),
            storage: Arc::clone(study.storage()),
            sampler: Arc::clone(study.sampler()),
            mirrored: false,
        }
    }

    /// Handle on a trial owned by another participant.
    pub fn mirror(study: &Study, trial_id: TrialId) -> Self {
        Self {
            mirrored: true,
            ..Self::new(study, trial_id)
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    /// Drop the write if a mirrored handle's trial was finished by its owner.
    fn tolerate_finished<T>(&self, result: LedgerResult<T>, fallback: impl FnOnce() -> T) -> LedgerResult<T> {
        match result {
            Err(LedgerError::TrialFinished { trial_id }) if self.mirrored => {
                debug!("Trial {} already finished, dropping mirrored write", trial_id);
                Ok(fallback())
            }
            other => other,
        }
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    pub fn study_id(&self) -> StudyId {
        self.study_id
    }

    /// Position of the trial within its study.
    pub fn number(&self) -> TdResult<usize> {
        Ok(self.storage.trial(self.trial_id)?.number)
    }

    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64) -> TdResult<f64> {
        let value = self.suggest(name, Distribution::Float { low, high })?;
        Self::expect_float(name, value)
    }

    pub fn suggest_log_float(&mut self, name: &str, low: f64, high: f64) -> TdResult<f64> {
        let value = self.suggest(name, Distribution::LogFloat { low, high })?;
        Self::expect_float(name, value)
    }

    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> TdResult<i64> {
        match self.suggest(name, Distribution::Int { low, high })? {
            ParamValue::Int(v) => Ok(v),
            other => Err(TdError::Internal(format!(
                "parameter {name} holds {other}, expected an integer"
            ))),
        }
    }

    pub fn suggest_categorical(
        &mut self,
        name: &str,
        choices: &[serde_json::Value],
    ) -> TdResult<serde_json::Value> {
        let distribution = Distribution::Categorical {
            choices: choices.to_vec(),
        };
        match self.suggest(name, distribution)? {
            ParamValue::Json(v) => Ok(v),
            other => Err(TdError::Internal(format!(
                "parameter {name} holds {other}, expected a categorical choice"
            ))),
        }
    }

    fn suggest(&mut self, name: &str, distribution: Distribution) -> TdResult<ParamValue> {
        distribution
            .validate()
            .map_err(|reason| TdError::InvalidConfiguration(format!("{name}: {reason}")))?;

        if let Some(existing) = self.storage.trial_param(self.trial_id, name)? {
            // Goes through the storage so a mismatched distribution is reported.
            return Ok(self
                .storage
                .set_trial_param(self.trial_id, name, &distribution, existing)?);
        }

        let candidate = self.sampler.sample(name, &distribution);
        let stored = self
            .storage
            .set_trial_param(self.trial_id, name, &distribution, candidate.clone());
        Ok(self.tolerate_finished(stored, || candidate)?)
    }

    fn expect_float(name: &str, value: ParamValue) -> TdResult<f64> {
        match value {
            ParamValue::Float(v) => Ok(v),
            other => Err(TdError::Internal(format!(
                "parameter {name} holds {other}, expected a float"
            ))),
        }
    }

    /// Record an intermediate objective value (e.g. per-epoch accuracy).
    pub fn report(&mut self, step: u64, value: f64) -> TdResult<()> {
        let result = self
            .storage
            .report_intermediate_value(self.trial_id, step, value);
        Ok(self.tolerate_finished(result, || ())?)
    }

    pub fn set_user_attr(&mut self, key: &str, value: impl Into<serde_json::Value>) -> TdResult<()> {
        let result = self
            .storage
            .set_trial_user_attr(self.trial_id, key, value.into());
        Ok(self.tolerate_finished(result, || ())?)
    }

    pub fn params(&self) -> TdResult<BTreeMap<String, ParamValue>> {
        Ok(self.storage.trial(self.trial_id)?.params)
    }

    /// Current ledger record of this trial.
    pub fn snapshot(&self) -> TdResult<FrozenTrial> {
        Ok(self.storage.trial(self.trial_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::RandomSampler;
    use crate::storage::InMemoryStorage;
    use td_types::{StudyDirection, TrialState};

    fn study() -> Study {
        Study::create(
            "trial-tests",
            Arc::new(InMemoryStorage::new()),
            StudyDirection::Minimize,
        )
        .unwrap()
        .with_sampler(Arc::new(RandomSampler::seeded(1)))
    }

    #[test]
    fn suggestions_are_stable_per_trial() {
        let study = study();
        let trial_id = study.storage().create_trial(study.study_id()).unwrap();
        let mut first = Trial::new(&study, trial_id);
        let mut second = Trial::new(&study, trial_id);

        let lr = first.suggest_log_float("lr", 1e-4, 1e-1).unwrap();
        assert_eq!(second.suggest_log_float("lr", 1e-4, 1e-1).unwrap(), lr);

        let layers = second.suggest_int("layers", 1, 8).unwrap();
        assert_eq!(first.suggest_int("layers", 1, 8).unwrap(), layers);
        assert!((1..=8).contains(&layers));

        let choices = [serde_json::json!("adam"), serde_json::json!("sgd")];
        let optimizer = first.suggest_categorical("optimizer", &choices).unwrap();
        assert!(choices.contains(&optimizer));

        let params = second.params().unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params["lr"], ParamValue::Float(lr));
    }

    #[test]
    fn mismatched_redefinition_is_rejected() {
        let study = study();
        let trial_id = study.storage().create_trial(study.study_id()).unwrap();
        let mut trial = Trial::new(&study, trial_id);

        trial.suggest_float("dropout", 0.0, 0.5).unwrap();
        let err = trial.suggest_float("dropout", 0.0, 0.9).unwrap_err();
        assert!(matches!(
            err,
            TdError::Ledger(LedgerError::IncompatibleDistribution { .. })
        ));
    }

    #[test]
    fn empty_range_is_a_configuration_error() {
        let study = study();
        let trial_id = study.storage().create_trial(study.study_id()).unwrap();
        let mut trial = Trial::new(&study, trial_id);
        assert!(matches!(
            trial.suggest_int("batch", 64, 32),
            Err(TdError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn reports_and_attrs_reach_the_ledger() {
        let study = study();
        let trial_id = study.storage().create_trial(study.study_id()).unwrap();
        let mut trial = Trial::new(&study, trial_id);

        trial.report(0, 0.9).unwrap();
        trial.report(1, 0.7).unwrap();
        trial.set_user_attr("host", "node-2").unwrap();

        let snapshot = trial.snapshot().unwrap();
        assert_eq!(snapshot.state, TrialState::Running);
        assert_eq!(snapshot.intermediate_values[&1], 0.7);
        assert_eq!(snapshot.user_attrs["host"], serde_json::json!("node-2"));
        assert_eq!(trial.number().unwrap(), 0);
    }

    #[test]
    fn mirrored_writes_after_finish_are_dropped() {
        let study = study();
        let trial_id = study.storage().create_trial(study.study_id()).unwrap();
        let mut owner = Trial::new(&study, trial_id);
        let mut mirror = Trial::mirror(&study, trial_id);
        assert!(mirror.is_mirrored());

        let x = owner.suggest_float("x", 0.0, 1.0).unwrap();
        study
            .storage()
            .finish_trial(trial_id, TrialState::Complete, Some(x))
            .unwrap();

        assert_eq!(mirror.suggest_float("x", 0.0, 1.0).unwrap(), x);
        let late = mirror.suggest_int("late", 1, 3).unwrap();
        assert!((1..=3).contains(&late));
        mirror.report(0, x).unwrap();
        mirror.set_user_attr("host", "node-1").unwrap();

        let snapshot = mirror.snapshot().unwrap();
        assert!(snapshot.intermediate_values.is_empty());
        assert!(snapshot.user_attrs.is_empty());
        assert!(!snapshot.params.contains_key("late"));

        assert!(matches!(
            owner.report(0, x),
            Err(TdError::Ledger(LedgerError::TrialFinished { .. }))
        ));
    }
}
