//! # td-dist
//!
//! Lockstep coordination of a shared study across a process group for Tandem.
//!
//! Rank 0 leads: it runs the study loop and broadcasts each trial id before
//! evaluating it. Every other rank follows, evaluating the same trials against
//! the shared storage until the leader broadcasts a stop. Provides the
//! [`Communicator`] transport seam, the availability guard, the leader-side
//! [`DistributedObjective`] adapter and [`CoordinatedStudy`]. The default
//! `fabric` feature adds an in-process transport where ranks are threads.

mod availability;
mod comm;
#[cfg(feature = "fabric")]
mod fabric;
mod objective;
mod study;

pub use availability::{availability, ensure_available, ensure_backend, is_available, Availability};
pub use comm::{Communicator, CommunicatorExt, LEADER_RANK};
#[cfg(feature = "fabric")]
pub use fabric::{FabricConfig, LocalCommunicator, LocalFabric};
pub use objective::{DistributedObjective, TrialSignal};
pub use study::{CoordinatedStudy, Role};
