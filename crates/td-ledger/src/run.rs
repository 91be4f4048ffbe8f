//! Run-loop configuration: trial budget, wall-clock budget, parallelism and
//! which objective errors are recorded instead of aborting the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use td_types::TdError;

/// Budget and parallelism for [`crate::Study::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of trials to start. `None` = unbounded.
    pub n_trials: Option<usize>,

    /// Stop starting new trials once this many seconds have elapsed.
    pub timeout_seconds: Option<f64>,

    /// Number of trials evaluated concurrently by this process.
    /// `0` uses the available parallelism.
    pub n_jobs: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_trials: None,
            timeout_seconds: None,
            n_jobs: 1,
        }
    }
}

impl RunConfig {
    pub fn with_n_trials(mut self, n: usize) -> Self {
        self.n_trials = Some(n);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_n_jobs(mut self, n: usize) -> Self {
        self.n_jobs = n;
        self
    }

    /// Wall-clock budget. A budget too large (or not a number) to represent
    /// as a `Duration` means no timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|seconds| !seconds.is_nan())
            .and_then(|seconds| Duration::try_from_secs_f64(seconds.max(0.0)).ok())
    }

    /// Worker count after resolving `0` to the machine's parallelism.
    pub fn effective_jobs(&self) -> usize {
        match self.n_jobs {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

type Matcher = fn(&anyhow::Error) -> bool;

fn matches_type<E>(error: &anyhow::Error) -> bool
where
    E: fmt::Display + fmt::Debug + Send + Sync + 'static,
{
    error.is::<E>()
}

#[derive(Clone)]
enum CatchMode {
    All,
    Only(Vec<(&'static str, Matcher)>),
}

/// Which objective errors the run loop records as failed trials.
///
/// Errors not caught abort the run. Ledger and transport failures are never
/// caught, whatever the policy.
#[derive(Clone)]
pub struct CatchPolicy {
    mode: CatchMode,
}

impl CatchPolicy {
    /// Record every objective error as a failed trial.
    pub fn all() -> Self {
        Self {
            mode: CatchMode::All,
        }
    }

    /// Abort on every objective error.
    pub fn none() -> Self {
        Self {
            mode: CatchMode::Only(Vec::new()),
        }
    }

    /// Catch only errors of type `E`.
    pub fn only<E>() -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::none().and::<E>()
    }

    /// Additionally catch errors of type `E`.
    pub fn and<E>(self) -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self.mode {
            CatchMode::All => self,
            CatchMode::Only(mut matchers) => {
                matchers.push((std::any::type_name::<E>(), matches_type::<E> as Matcher));
                Self {
                    mode: CatchMode::Only(matchers),
                }
            }
        }
    }

    pub fn catches(&self, error: &anyhow::Error) -> bool {
        if TdError::is_infrastructure(error) {
            return false;
        }
        match &self.mode {
            CatchMode::All => true,
            CatchMode::Only(matchers) => matchers.iter().any(|(_, matches)| matches(error)),
        }
    }
}

impl Default for CatchPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for CatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            CatchMode::All => write!(f, "CatchPolicy::All"),
            CatchMode::Only(matchers) => f
                .debug_tuple("CatchPolicy::Only")
                .field(&matchers.iter().map(|(name, _)| *name).collect::<Vec<_>>())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_types::{LedgerError, TrialId};

    #[derive(Debug, thiserror::Error)]
    #[error("loss diverged")]
    struct Diverged;

    #[derive(Debug, thiserror::Error)]
    #[error("out of memory")]
    struct OutOfMemory;

    #[test]
    fn run_config_builder_chain() {
        let config = RunConfig::default()
            .with_n_trials(20)
            .with_timeout_seconds(1.5)
            .with_n_jobs(4);
        assert_eq!(config.n_trials, Some(20));
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.effective_jobs(), 4);
        assert!(RunConfig::default().with_n_jobs(0).effective_jobs() >= 1);
    }

    #[test]
    fn unrepresentable_timeout_means_no_timeout() {
        assert_eq!(RunConfig::default().with_timeout_seconds(f64::INFINITY).timeout(), None);
        assert_eq!(RunConfig::default().with_timeout_seconds(1e20).timeout(), None);
        assert_eq!(RunConfig::default().with_timeout_seconds(f64::NAN).timeout(), None);
        assert_eq!(
            RunConfig::default().with_timeout_seconds(-3.0).timeout(),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn run_config_round_trip() {
        let config = RunConfig::default().with_n_trials(3);
        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn policy_matches_by_type() {
        let policy = CatchPolicy::only::<Diverged>();
        assert!(policy.catches(&anyhow::Error::new(Diverged)));
        assert!(policy.catches(&anyhow::Error::new(Diverged).context("epoch 3")));
        assert!(!policy.catches(&anyhow::Error::new(OutOfMemory)));

        let widened = policy.and::<OutOfMemory>();
        assert!(widened.catches(&anyhow::Error::new(OutOfMemory)));
        assert!(!CatchPolicy::none().catches(&anyhow::anyhow!("boom")));
        assert!(CatchPolicy::all().catches(&anyhow::anyhow!("boom")));
    }

    #[test]
    fn infrastructure_errors_are_never_caught() {
        let ledger = anyhow::Error::new(LedgerError::TrialNotFound {
            trial_id: TrialId(0),
        });
        assert!(!CatchPolicy::all().catches(&ledger));
        assert!(!CatchPolicy::only::<LedgerError>().catches(&ledger));
    }

    #[test]
    fn debug_lists_caught_types() {
        let rendered = format!("{:?}", CatchPolicy::only::<Diverged>());
        assert!(rendered.contains("Diverged"));
        assert_eq!(format!("{:?}", CatchPolicy::default()), "CatchPolicy::All");
    }
}
