//! In-process fabric: every rank is a thread, every ordered pair of ranks is
//! joined by an unbounded channel.
//!
//! Frames between two ranks arrive in the order they were sent, so a
//! sequence of collectives issued in the same order by every rank is
//! delivered in that order. Each frame carries the collective it belongs to,
//! and a receiver that finds a different collective reports a
//! [`TransportError::CollectiveMismatch`] instead of misreading the payload.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use td_types::TransportError;

use crate::comm::Communicator;

/// Configuration for an in-process group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Number of participants.
    pub size: usize,

    /// How long a participant waits for a peer before giving up.
    /// `None` waits until the peer sends or disconnects.
    pub recv_timeout_ms: Option<u64>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            size: 2,
            recv_timeout_ms: None,
        }
    }
}

impl FabricConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_recv_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.recv_timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    Broadcast { root: usize },
    AllGather,
}

impl fmt::Display for Collective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast { root } => write!(f, "broadcast from rank {root}"),
            Self::AllGather => write!(f, "all-gather"),
        }
    }
}

#[derive(Debug)]
struct Frame {
    collective: Collective,
    payload: Vec<u8>,
}

/// Builds groups of [`LocalCommunicator`]s.
pub struct LocalFabric;

impl LocalFabric {
    /// One communicator per rank, ordered by rank.
    pub fn spawn(size: usize) -> Vec<LocalCommunicator> {
        Self::spawn_with(FabricConfig::default().with_size(size))
    }

    pub fn spawn_with(config: FabricConfig) -> Vec<LocalCommunicator> {
        let size = config.size;
        let mut outbound: Vec<Vec<Option<Sender<Frame>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut inbound: Vec<Vec<Option<Receiver<Frame>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();

        for from in 0..size {
            for to in 0..size {
                if from != to {
                    let (tx, rx) = unbounded();
                    outbound[from][to] = Some(tx);
                    inbound[to][from] = Some(rx);
                }
            }
        }

        debug!("Built local fabric with {} ranks", size);
        outbound
            .into_iter()
            .zip(inbound)
            .enumerate()
            .map(|(rank, (outbound, inbound))| LocalCommunicator {
                rank,
                size,
                outbound,
                inbound,
                recv_timeout: config.recv_timeout_ms.map(Duration::from_millis),
            })
            .collect()
    }
}

/// One rank of a [`LocalFabric`] group.
///
/// Dropping a communicator disconnects it; peers waiting on it receive
/// [`TransportError::Disconnected`].
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    outbound: Vec<Option<Sender<Frame>>>,
    inbound: Vec<Option<Receiver<Frame>>>,
    recv_timeout: Option<Duration>,
}

impl LocalCommunicator {
    fn check_rank(&self, rank: usize) -> Result<(), TransportError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }

    fn send(&self, to: usize, collective: Collective, payload: Vec<u8>) -> Result<(), TransportError> {
        let Some(tx) = &self.outbound[to] else {
            return Err(TransportError::InvalidRank {
                rank: to,
                size: self.size,
            });
        };
        tx.send(Frame {
            collective,
            payload,
        })
        .map_err(|_| TransportError::Disconnected { peer: to })
    }

    fn recv(&self, from: usize, expected: Collective) -> Result<Vec<u8>, TransportError> {
        let Some(rx) = &self.inbound[from] else {
            return Err(TransportError::InvalidRank {
                rank: from,
                size: self.size,
            });
        };
        let frame = match self.recv_timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => TransportError::Timeout {
                    peer: from,
                    timeout_ms: timeout.as_millis() as u64,
                },
                RecvTimeoutError::Disconnected => TransportError::Disconnected { peer: from },
            })?,
            None => rx
                .recv()
                .map_err(|_| TransportError::Disconnected { peer: from })?,
        };

        if frame.collective != expected {
            return Err(TransportError::CollectiveMismatch {
                peer: from,
                expected: expected.to_string(),
                received: frame.collective.to_string(),
            });
        }
        Ok(frame.payload)
    }
}

impl fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("recv_timeout", &self.recv_timeout)
            .finish()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>, TransportError> {
        self.check_rank(root)?;
        let collective = Collective::Broadcast { root };

        if self.rank != root {
            return self.recv(root, collective);
        }

        let payload = payload.ok_or(TransportError::MissingPayload { root })?;
        for peer in (0..self.size).filter(|peer| *peer != self.rank) {
            self.send(peer, collective, payload.clone())?;
        }
        Ok(payload)
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        for peer in (0..self.size).filter(|peer| *peer != self.rank) {
            self.send(peer, Collective::AllGather, payload.clone())?;
        }

        let mut gathered = Vec::with_capacity(self.size);
        for peer in 0..self.size {
            if peer == self.rank {
                gathered.push(payload.clone());
            } else {
                gathered.push(self.recv(peer, Collective::AllGather)?);
            }
        }
        Ok(gathered)
    }
}
