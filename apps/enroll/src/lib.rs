pub mod config;
pub mod enrollment;
pub mod observer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{ConfigError, PairingConfig};
pub use enrollment::{
    Base64UrlCodec, CredentialCeremony, CredentialCodec, EnrollmentApi, EnrollmentError,
    HttpEnrollmentApi,
};
pub use observer::Observer;
pub use protocol::{Action, DataChannelMessage, PairingCode, PeerEvent, ProtocolError};
pub use session::provider::{ProviderEvents, ProviderSession, ProviderState};
pub use session::requester::{RequesterEvents, RequesterSession, RequesterState};
pub use session::{CancelOrigin, PairingContext, SessionError};
pub use signaling::{ConnectionState, SignalingChannel, SignalingMessage};
pub use transport::{PeerTransport, TransportError, TransportEvent};
