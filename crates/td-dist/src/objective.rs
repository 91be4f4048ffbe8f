//! Leader-side objective adapter.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use td_ledger::Trial;
use td_types::TrialId;

use crate::comm::{Communicator, CommunicatorExt, LEADER_RANK};

/// What the leader tells the followers before each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialSignal {
    /// Evaluate this trial.
    Next(TrialId),
    /// The leader's run is over.
    Stop,
}

/// Wraps a user objective so that every trial the leader evaluates is
/// first announced to the followers.
///
/// Announcements from concurrent leader workers are serialized, so every
/// follower receives the trial ids in the same order.
pub struct DistributedObjective<'a, F, C> {
    objective: &'a F,
    comm: &'a C,
    announce: Mutex<()>,
}

impl<'a, F, C> DistributedObjective<'a, F, C>
where
    F: Fn(&mut Trial, &C) -> anyhow::Result<f64>,
    C: Communicator,
{
    pub fn new(objective: &'a F, comm: &'a C) -> Self {
        Self {
            objective,
            comm,
            announce: Mutex::new(()),
        }
    }

    /// Broadcast the trial id, then evaluate. The objective's result is
    /// returned unchanged.
    pub fn call(&self, trial: &mut Trial) -> anyhow::Result<f64> {
        let signal = TrialSignal::Next(trial.trial_id());
        {
            let _announcing = self.announce.lock();
            self.comm.broadcast(Some(&signal), LEADER_RANK)?;
        }
        debug!("Leader announced trial {}", trial.trial_id());
        (self.objective)(trial, self.comm)
    }
}
