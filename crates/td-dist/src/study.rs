//! A study shared by every participant of a process group.
//!
//! The leader runs the ordinary study loop and announces each trial before
//! evaluating it. Followers wait for the announcements and evaluate the same
//! trials against the shared storage, so collective operations inside the
//! objective line up across the group.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use tracing::{debug, info, warn};

use td_ledger::{CatchPolicy, RunConfig, Study, Trial};
use td_types::{invalid_config, TdError, TdResult};

use crate::availability::ensure_backend;
use crate::comm::{Communicator, CommunicatorExt, LEADER_RANK};
use crate::objective::{DistributedObjective, TrialSignal};

/// Part a participant plays in a coordinated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Picks trials and records their results.
    Leader,
    /// Mirrors the leader's trials.
    Follower { rank: usize },
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        if rank == LEADER_RANK {
            Self::Leader
        } else {
            Self::Follower { rank }
        }
    }
}

/// A [`Study`] bound to a communicator.
///
/// Everything other than [`CoordinatedStudy::run`] is forwarded to the
/// wrapped study through `Deref`/`DerefMut`.
#[derive(Debug)]
pub struct CoordinatedStudy<C> {
    study: Study,
    comm: C,
}

impl<C: Communicator> CoordinatedStudy<C> {
    /// Join a coordinated study. Every participant must call this, since the
    /// study names are exchanged collectively.
    ///
    /// Fails when `comm` has no usable transport backend, when the study lives in
    /// process-local storage, or when the participants passed studies with
    /// different names.
    pub fn new(study: Study, comm: C) -> TdResult<Self> {
        ensure_backend(&comm)?;

        let kind = study.storage_kind();
        if kind.is_process_local() {
            return Err(invalid_config!(
                "study {} uses {} storage, which other processes cannot see; use a shared storage such as a journal file",
                study.study_name(),
                kind
            ));
        }

        let names: Vec<String> = comm.all_gather(&study.study_name().to_string())?;
        let distinct: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        if distinct.len() > 1 {
            return Err(invalid_config!(
                "participants passed different studies: {:?}",
                distinct
            ));
        }

        info!(
            "Rank {} of {} joined coordinated study {}",
            comm.rank(),
            comm.size(),
            study.study_name()
        );
        Ok(Self { study, comm })
    }

    pub fn role(&self) -> Role {
        Role::from_rank(self.comm.rank())
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    pub fn inner(&self) -> &Study {
        &self.study
    }

    pub fn inner_mut(&mut self) -> &mut Study {
        &mut self.study
    }

    pub fn into_parts(self) -> (Study, C) {
        (self.study, self.comm)
    }

    /// Run the study on every participant.
    ///
    /// The leader evaluates up to `config.n_trials` trials, applying `catch`
    /// to objective errors, and then tells the followers to stop. Followers
    /// evaluate each announced trial and discard the value; their writes to a
    /// trial the leader has already finished are dropped. A follower whose
    /// objective fails returns that error immediately; the leader is not told.
    ///
    /// If the leader's run ends with an error, no stop is announced and the
    /// followers keep waiting until the leader's communicator goes away.
    pub fn run<F>(&self, objective: F, config: &RunConfig, catch: &CatchPolicy) -> TdResult<()>
    where
        F: Fn(&mut Trial, &C) -> anyhow::Result<f64> + Sync,
    {
        match self.role() {
            Role::Leader => self.run_leader(&objective, config, catch),
            Role::Follower { rank } => self.run_follower(&objective, rank),
        }
    }

    fn run_leader<F>(&self, objective: &F, config: &RunConfig, catch: &CatchPolicy) -> TdResult<()>
    where
        F: Fn(&mut Trial, &C) -> anyhow::Result<f64> + Sync,
    {
        info!(
            "Leading study {} for {} participants",
            self.study.study_name(),
            self.comm.size()
        );
        let adapter = DistributedObjective::new(objective, &self.comm);
        self.study
            .run(|trial| adapter.call(trial), config, catch)
            .inspect_err(|err| warn!("Leader run ended without a stop signal: {}", err))?;

        self.comm.broadcast(Some(&TrialSignal::Stop), LEADER_RANK)?;
        info!("Leader released the followers of study {}", self.study.study_name());
        Ok(())
    }

    fn run_follower<F>(&self, objective: &F, rank: usize) -> TdResult<()>
    where
        F: Fn(&mut Trial, &C) -> anyhow::Result<f64>,
    {
        info!("Rank {} following study {}", rank, self.study.study_name());
        let mut evaluated = 0usize;
        loop {
            match self.comm.broadcast::<TrialSignal>(None, LEADER_RANK)? {
                TrialSignal::Stop => break,
                TrialSignal::Next(trial_id) => {
                    debug!("Rank {} evaluating trial {}", rank, trial_id);
                    let mut trial = Trial::mirror(&self.study, trial_id);
                    objective(&mut trial, &self.comm)
                        .map_err(|err| TdError::from_objective(trial_id, err))?;
                    evaluated += 1;
                }
            }
        }
        info!("Rank {} stopped after {} trials", rank, evaluated);
        Ok(())
    }
}

impl<C> Deref for CoordinatedStudy<C> {
    type Target = Study;

    fn deref(&self) -> &Study {
        &self.study
    }
}

impl<C> DerefMut for CoordinatedStudy<C> {
    fn deref_mut(&mut self) -> &mut Study {
        &mut self.study
    }
}
