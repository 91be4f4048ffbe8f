use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use td_dist::{Communicator, CoordinatedStudy, LocalCommunicator, LocalFabric};
use td_ledger::{CatchPolicy, JournalFileStorage, RunConfig, Storage, Study, Trial};
use td_types::StudyDirection;

const STUDY_NAME: &str = "lockstep-demo";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn objective(trial: &mut Trial, comm: &LocalCommunicator) -> anyhow::Result<f64> {
    let x = trial.suggest_float("x", -10.0, 10.0)?;
    let y = trial.suggest_int("y", -5, 5)?;
    let value = (x - 2.0).powi(2) + (y as f64 + 1.0).powi(2);
    tracing::debug!("Rank {} evaluated trial {}: {}", comm.rank(), trial.trial_id(), value);
    Ok(value)
}

fn participant(comm: LocalCommunicator, journal: PathBuf, n_trials: usize) -> anyhow::Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(JournalFileStorage::open(&journal)?);
    let study = Study::create_or_load(STUDY_NAME, storage, StudyDirection::Minimize)?;
    let coordinated = CoordinatedStudy::new(study, comm)?;
    coordinated.run(
        objective,
        &RunConfig::default().with_n_trials(n_trials),
        &CatchPolicy::default(),
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let world_size: usize = env_or("TANDEM_WORLD_SIZE", 3)?;
    let n_trials: usize = env_or("TANDEM_TRIALS", 10)?;
    let journal = std::env::var("TANDEM_JOURNAL")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join(format!("tandem-{}.jsonl", std::process::id())));

    if world_size == 0 {
        anyhow::bail!("TANDEM_WORLD_SIZE must be at least 1");
    }

    info!(
        "Starting {} participants on journal {} for {} trials",
        world_size,
        journal.display(),
        n_trials
    );

    // The study is created before the participants start so they all load it.
    let storage: Arc<dyn Storage> = Arc::new(JournalFileStorage::open(&journal)?);
    Study::create_or_load(STUDY_NAME, Arc::clone(&storage), StudyDirection::Minimize)?;

    let handles: Vec<_> = LocalFabric::spawn(world_size)
        .into_iter()
        .map(|comm| {
            let journal = journal.clone();
            std::thread::Builder::new()
                .name(format!("rank-{}", comm.rank()))
                .spawn(move || participant(comm, journal, n_trials))
        })
        .collect::<Result<_, _>>()?;

    for (rank, handle) in handles.into_iter().enumerate() {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("rank {rank} panicked"))?
            .with_context(|| format!("rank {rank} failed"))?;
    }

    let study = Study::load(STUDY_NAME, storage)?;
    let best = study.best_trial()?;
    info!(
        "Best trial {} of {}: value {:?}, params {:?}",
        best.number,
        study.trials()?.len(),
        best.value,
        best.params
    );
    Ok(())
}
