//! Process-group transport seam.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use td_types::{ProbeError, TdResult, TransportError};

use crate::availability::availability;

/// Rank that selects trials and records results.
pub const LEADER_RANK: usize = 0;

/// Collective operations over a fixed group of participants.
///
/// Every participant must call the same collectives in the same order. Both
/// operations block until the participant has received its result.
/// Payloads are opaque bytes; see [`CommunicatorExt`] for typed values.
pub trait Communicator: Send + Sync {
    /// This participant's rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn size(&self) -> usize;

    /// Deliver the payload supplied by `root` to every participant.
    ///
    /// `root` passes `Some(payload)`; every other participant passes `None`.
    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>, TransportError>;

    /// Collect one payload from each participant, in rank order.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Whether this transport can run collectives in this process.
    ///
    /// Defaults to the cached probe of the built-in backend. Transports that
    /// do not depend on it override this.
    fn probe(&self) -> Result<(), ProbeError> {
        availability().probe()
    }
}

impl<T: Communicator + ?Sized> Communicator for &T {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>, TransportError> {
        (**self).broadcast_bytes(payload, root)
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        (**self).all_gather_bytes(payload)
    }

    fn probe(&self) -> Result<(), ProbeError> {
        (**self).probe()
    }
}

impl<T: Communicator + ?Sized> Communicator for Arc<T> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>, TransportError> {
        (**self).broadcast_bytes(payload, root)
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        (**self).all_gather_bytes(payload)
    }

    fn probe(&self) -> Result<(), ProbeError> {
        (**self).probe()
    }
}

/// Typed collectives; values travel as JSON.
pub trait CommunicatorExt: Communicator {
    fn is_leader(&self) -> bool {
        self.rank() == LEADER_RANK
    }

    fn broadcast<T>(&self, value: Option<&T>, root: usize) -> TdResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = value
            .map(serde_json::to_vec)
            .transpose()
            .map_err(TransportError::from)?;
        let bytes = self.broadcast_bytes(payload, root)?;
        Ok(serde_json::from_slice(&bytes).map_err(TransportError::from)?)
    }

    fn all_gather<T>(&self, value: &T) -> TdResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = serde_json::to_vec(value).map_err(TransportError::from)?;
        let mut values = Vec::with_capacity(self.size());
        for bytes in self.all_gather_bytes(payload)? {
            values.push(serde_json::from_slice(&bytes).map_err(TransportError::from)?);
        }
        Ok(values)
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}
