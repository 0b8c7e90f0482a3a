//! Requester and provider state machines driving one pairing attempt each.

pub mod provider;
pub mod requester;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, PairingConfig};
use crate::enrollment::{EnrollmentApi, EnrollmentError};
use crate::protocol::ProtocolError;
use crate::signaling::{SignalingChannel, SignalingConnector};
use crate::transport::{PeerConnector, PeerTransport, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("no pairing attempt in progress")]
    NoTransport,
    #[error("no enrollment token has been received")]
    MissingToken,
    #[error("peer has not approved the enrollment")]
    ConsentRequired,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Self {
        SessionError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    Local,
    Remote,
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct PairingContext {
    pub config: PairingConfig,
    pub signaling: Arc<dyn SignalingConnector>,
    pub peers: Arc<dyn PeerConnector>,
    pub api: Arc<dyn EnrollmentApi>,
}

impl PairingContext {
    pub fn new(
        config: PairingConfig,
        signaling: Arc<dyn SignalingConnector>,
        peers: Arc<dyn PeerConnector>,
        api: Arc<dyn EnrollmentApi>,
    ) -> Self {
        Self {
            config,
            signaling,
            peers,
            api,
        }
    }

    async fn open_transport(&self) -> Result<PeerTransport, SessionError> {
        let peer = self.peers.new_peer().await?;
        let signaling = SignalingChannel::new(Arc::clone(&self.signaling));
        Ok(PeerTransport::new(signaling, peer))
    }
}

impl fmt::Debug for PairingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Resources owned by one pairing attempt plus role-specific progress.
pub(crate) struct Attempt<T> {
    pub(crate) id: u64,
    pub(crate) transport: Arc<PeerTransport>,
    pub(crate) driver: Option<JoinHandle<()>>,
    pub(crate) channel_open: bool,
    pub(crate) progress: T,
}

impl<T> Attempt<T> {
    pub(crate) fn new(id: u64, transport: Arc<PeerTransport>, progress: T) -> Self {
        Self {
            id,
            transport,
            driver: None,
            channel_open: false,
            progress,
        }
    }

    /// Closes the transport, then stops the driver. The driver may be the
    /// caller, so aborting comes last.
    pub(crate) async fn shutdown(mut self) {
        self.transport.close().await;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Relay trouble after the data channel is up does not affect the pairing;
/// negotiation and peer failures always do.
pub(crate) fn is_fatal(err: &TransportError, channel_open: bool) -> bool {
    match err {
        TransportError::Signaling(_) | TransportError::AlreadyConnected => !channel_open,
        _ => true,
    }
}
