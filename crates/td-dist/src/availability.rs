//! Process-wide check that a transport backend is usable.
//!
//! Detection of the built-in backend runs once per process; every later
//! query reads the cached result. A communicator may answer for itself
//! through [`Communicator::probe`].

use std::sync::OnceLock;
use tracing::debug;

use td_types::{ProbeError, TdError, TdResult};

use crate::comm::Communicator;

static AVAILABILITY: OnceLock<Availability> = OnceLock::new();

const INSTALL_GUIDANCE: &str = "Coordinated studies need a transport backend, but none was \
compiled into td-dist. Rebuild with the `fabric` feature enabled (it is on by default), \
e.g. `td-dist = { version = \"0.1\", features = [\"fabric\"] }`, or pass a \
`Communicator` of your own that overrides `Communicator::probe`";

/// Outcome of the one-time transport probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    probe_error: Option<String>,
}

impl Availability {
    pub fn available() -> Self {
        Self { probe_error: None }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            probe_error: Some(reason.into()),
        }
    }

    fn detect() -> Self {
        let detected = if cfg!(feature = "fabric") {
            Self::available()
        } else {
            Self::unavailable("td-dist was built without the `fabric` feature")
        };
        debug!("Transport availability probed: {:?}", detected);
        detected
    }

    pub fn is_available(&self) -> bool {
        self.probe_error.is_none()
    }

    pub fn probe(&self) -> Result<(), ProbeError> {
        match &self.probe_error {
            None => Ok(()),
            Some(reason) => Err(ProbeError(reason.clone())),
        }
    }

    pub fn ensure(&self) -> TdResult<()> {
        self.probe().map_err(unavailable)
    }
}

fn unavailable(source: ProbeError) -> TdError {
    TdError::CapabilityUnavailable {
        guidance: INSTALL_GUIDANCE.to_string(),
        source,
    }
}

/// Cached probe result, computed on first use.
pub fn availability() -> &'static Availability {
    AVAILABILITY.get_or_init(Availability::detect)
}

pub fn is_available() -> bool {
    availability().is_available()
}

/// Fails with [`TdError::CapabilityUnavailable`] when no backend is usable.
pub fn ensure_available() -> TdResult<()> {
    availability().ensure()
}

/// Fails with [`TdError::CapabilityUnavailable`] when `comm` cannot run
/// collectives in this process.
pub fn ensure_backend<C: Communicator + ?Sized>(comm: &C) -> TdResult<()> {
    comm.probe().map_err(unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_types::TransportError;

    /// Transport that brings its own backend.
    struct Loopback {
        probe: Option<ProbeError>,
    }

    impl Communicator for Loopback {
        fn rank(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            1
        }

        fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>, TransportError> {
            payload.ok_or(TransportError::MissingPayload { root })
        }

        fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
            Ok(vec![payload])
        }

        fn probe(&self) -> Result<(), ProbeError> {
            self.probe.clone().map_or(Ok(()), Err)
        }
    }

    /// Transport that relies on the built-in backend.
    struct Delegating;

    impl Communicator for Delegating {
        fn rank(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            1
        }

        fn broadcast_bytes(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>, TransportError> {
            payload.ok_or(TransportError::MissingPayload { root })
        }

        fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
            Ok(vec![payload])
        }
    }

    #[test]
    fn probe_is_cached() {
        let first = availability() as *const Availability;
        let second = availability() as *const Availability;
        assert_eq!(first, second);
        assert_eq!(is_available(), cfg!(feature = "fabric"));
        assert_eq!(ensure_available().is_ok(), is_available());
    }

    #[test]
    fn unavailable_carries_guidance_and_cause() {
        let err = Availability::unavailable("no backend linked")
            .ensure()
            .unwrap_err();
        match err {
            TdError::CapabilityUnavailable { guidance, source } => {
                assert!(guidance.contains("`fabric` feature"));
                assert_eq!(source, ProbeError("no backend linked".to_string()));
            }
            other => panic!("expected CapabilityUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn available_passes() {
        assert!(Availability::available().ensure().is_ok());
        assert!(!Availability::unavailable("x").is_available());
    }

    #[test]
    fn communicator_can_answer_for_itself() {
        assert!(ensure_backend(&Loopback { probe: None }).is_ok());

        let err = ensure_backend(&Loopback {
            probe: Some(ProbeError("driver missing".to_string())),
        })
        .unwrap_err();
        match err {
            TdError::CapabilityUnavailable { guidance, source } => {
                assert!(guidance.contains("Communicator::probe"));
                assert_eq!(source.0, "driver missing");
            }
            other => panic!("expected CapabilityUnavailable, got {other:?}"),
        }

        assert_eq!(ensure_backend(&Delegating).is_ok(), is_available());
    }

    #[cfg(not(feature = "fabric"))]
    #[test]
    fn built_without_fabric() {
        assert!(!is_available());
        assert!(matches!(
            ensure_available(),
            Err(TdError::CapabilityUnavailable { .. })
        ));
        assert!(matches!(
            ensure_backend(&Delegating),
            Err(TdError::CapabilityUnavailable { .. })
        ));
        assert!(ensure_backend(&Loopback { probe: None }).is_ok());
    }
}
