use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{is_fatal, Attempt, CancelOrigin, PairingContext, SessionError};
use crate::enrollment::{CredentialCeremony, CredentialCodec, EnrollmentError};
use crate::observer::Observer;
use crate::protocol::{Action, DataChannelMessage};
use crate::transport::{DataChannelOptions, PeerTransport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    Idle,
    AwaitingCode,
    AwaitingPeer,
    Negotiating,
    AwaitingConsent,
    AwaitingToken,
    Enrolling,
    Completed,
    Cancelled,
    Error,
}

impl RequesterState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequesterState::Completed | RequesterState::Cancelled | RequesterState::Error
        )
    }
}

impl fmt::Display for RequesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequesterState::Idle => "idle",
            RequesterState::AwaitingCode => "awaiting code",
            RequesterState::AwaitingPeer => "awaiting peer",
            RequesterState::Negotiating => "negotiating",
            RequesterState::AwaitingConsent => "awaiting consent",
            RequesterState::AwaitingToken => "awaiting token",
            RequesterState::Enrolling => "enrolling",
            RequesterState::Completed => "completed",
            RequesterState::Cancelled => "cancelled",
            RequesterState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Notifications raised by a [`RequesterSession`]; one subscriber each.
#[derive(Debug, Default)]
pub struct RequesterEvents {
    /// Room code to show to the user of the existing device.
    pub code: Observer<String>,
    /// A provider joined; ask the user whether to accept it.
    pub user: Observer<String>,
    pub state: Observer<RequesterState>,
    pub token_received: Observer<()>,
    pub consent_declined: Observer<()>,
    /// Body of the server's finish response.
    pub completed: Observer<Value>,
    pub cancelled: Observer<CancelOrigin>,
    pub error: Observer<String>,
}

#[derive(Default)]
struct Progress {
    code: Option<String>,
    consent_armed: bool,
    token: Option<String>,
    enrolling: bool,
}

struct RequesterInner {
    context: PairingContext,
    codec: Arc<dyn CredentialCodec>,
    ceremony: Arc<dyn CredentialCeremony>,
    events: RequesterEvents,
    state: Mutex<RequesterState>,
    attempt: Mutex<Option<Attempt<Progress>>>,
    next_attempt: AtomicU64,
}

/// The new device's side of the pairing: asks the relay for a code, offers
/// the peer connection, and once the user consents, trades the received
/// token for a registered credential.
pub struct RequesterSession {
    inner: Arc<RequesterInner>,
}

impl RequesterSession {
    pub fn new(
        context: PairingContext,
        codec: Arc<dyn CredentialCodec>,
        ceremony: Arc<dyn CredentialCeremony>,
    ) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                context,
                codec,
                ceremony,
                events: RequesterEvents::default(),
                state: Mutex::new(RequesterState::Idle),
                attempt: Mutex::new(None),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    pub fn events(&self) -> &RequesterEvents {
        &self.inner.events
    }

    pub fn state(&self) -> RequesterState {
        *self.inner.state.lock()
    }

    pub fn code(&self) -> Option<String> {
        self.inner
            .attempt
            .lock()
            .as_ref()
            .and_then(|attempt| attempt.progress.code.clone())
    }

    pub fn has_token(&self) -> bool {
        self.inner
            .attempt
            .lock()
            .as_ref()
            .is_some_and(|attempt| attempt.progress.token.is_some())
    }

    /// Starts a fresh attempt, closing any previous one, and asks the relay
    /// for a room code.
    pub async fn request_code(&self) -> Result<(), SessionError> {
        let previous = self.inner.attempt.lock().take();
        if let Some(previous) = previous {
            tracing::debug!(target = "requester", attempt = previous.id, "replacing attempt");
            previous.shutdown().await;
        }

        let transport = Arc::new(self.inner.context.open_transport().await?);
        transport.listen_for_data();
        let events = transport.take_events().ok_or(SessionError::NoTransport)?;
        let id = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        *self.inner.attempt.lock() = Some(Attempt::new(
            id,
            Arc::clone(&transport),
            Progress::default(),
        ));
        self.inner.set_state(RequesterState::AwaitingCode);

        let driver = tokio::spawn(drive(Arc::downgrade(&self.inner), id, events));
        if let Some(attempt) = self.inner.attempt.lock().as_mut().filter(|a| a.id == id) {
            attempt.driver = Some(driver);
        }

        let config = &self.inner.context.config;
        let setup = async {
            transport
                .create_data_channel(config.data_channel_label(), DataChannelOptions::default())
                .await?;
            transport.connect_signaling(config.signaling_url())
        };
        if let Err(err) = setup.await {
            let err = SessionError::from(err);
            self.inner.fail(id, err.to_string()).await;
            return Err(err);
        }
        tracing::info!(target = "requester", attempt = id, "requested pairing code");
        Ok(())
    }

    /// Tells the provider the user approved it. The first acceptance arms
    /// token capture; until then inbound tokens are ignored.
    pub async fn accept_consent(&self) -> Result<(), SessionError> {
        let (id, transport) = {
            let mut slot = self.inner.attempt.lock();
            let attempt = slot.as_mut().ok_or(SessionError::NoTransport)?;
            let state = *self.inner.state.lock();
            if !matches!(
                state,
                RequesterState::AwaitingConsent | RequesterState::AwaitingToken
            ) {
                return Err(SessionError::invalid_state("accept consent", state));
            }
            attempt.progress.consent_armed = true;
            (attempt.id, Arc::clone(&attempt.transport))
        };
        transport
            .send_data(&DataChannelMessage::add().encode())
            .await?;
        self.inner.advance(id, RequesterState::AwaitingToken);
        Ok(())
    }

    /// Records that the user turned the provider down. The transport stays
    /// open so the user can still accept or cancel.
    pub fn decline_consent(&self) {
        tracing::debug!(target = "requester", "consent declined");
        self.inner.events.consent_declined.publish(());
    }

    /// Abandons the attempt, telling the provider when a transport exists.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let attempt = {
            let mut slot = self.inner.attempt.lock();
            let attempt = slot.take();
            let mut state = self.inner.state.lock();
            *state = if attempt.is_some() {
                RequesterState::Cancelled
            } else {
                RequesterState::Idle
            };
            attempt
        };
        let Some(attempt) = attempt else {
            self.inner.events.state.publish(RequesterState::Idle);
            return Ok(());
        };
        if let Err(err) = attempt
            .transport
            .send_data(&DataChannelMessage::cancel().encode())
            .await
        {
            tracing::debug!(target = "requester", error = %err, "cancel notice not delivered");
        }
        tracing::info!(target = "requester", attempt = attempt.id, "pairing cancelled");
        self.inner.events.state.publish(RequesterState::Cancelled);
        self.inner.events.cancelled.publish(CancelOrigin::Local);
        attempt.shutdown().await;
        Ok(())
    }

    /// Runs start, ceremony and finish with the captured token.
    pub async fn complete_enrollment(&self) -> Result<Value, SessionError> {
        let (id, transport, token) = {
            let mut slot = self.inner.attempt.lock();
            let attempt = slot.as_mut().ok_or(SessionError::NoTransport)?;
            if attempt.progress.enrolling {
                return Err(SessionError::invalid_state(
                    "complete enrollment",
                    *self.inner.state.lock(),
                ));
            }
            let token = attempt
                .progress
                .token
                .take()
                .ok_or(SessionError::MissingToken)?;
            attempt.progress.enrolling = true;
            (attempt.id, Arc::clone(&attempt.transport), token)
        };
        self.inner.advance(id, RequesterState::Enrolling);

        match self.inner.enroll(token).await {
            Ok(finished) => {
                if let Err(err) = transport
                    .send_data(&DataChannelMessage::complete().encode())
                    .await
                {
                    tracing::warn!(target = "requester", error = %err, "completion notice not delivered");
                }
                let Some(attempt) = self.inner.finish(id, RequesterState::Completed) else {
                    return Err(SessionError::invalid_state(
                        "complete enrollment",
                        self.state(),
                    ));
                };
                tracing::info!(target = "requester", attempt = id, "enrollment completed");
                self.inner.events.completed.publish(finished.clone());
                attempt.shutdown().await;
                Ok(finished)
            }
            Err(err) => {
                self.inner.fail(id, err.to_string()).await;
                Err(err)
            }
        }
    }
}

impl fmt::Debug for RequesterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequesterSession")
            .field("state", &self.state())
            .finish()
    }
}

impl RequesterInner {
    fn set_state(&self, state: RequesterState) {
        *self.state.lock() = state;
        self.events.state.publish(state);
    }

    fn is_current(&self, id: u64) -> bool {
        self.attempt.lock().as_ref().is_some_and(|a| a.id == id)
    }

    fn transport(&self, id: u64) -> Option<Arc<PeerTransport>> {
        self.attempt
            .lock()
            .as_ref()
            .filter(|a| a.id == id)
            .map(|a| Arc::clone(&a.transport))
    }

    /// Moves to `state` only while attempt `id` is still live.
    fn advance(&self, id: u64, state: RequesterState) -> bool {
        {
            let slot = self.attempt.lock();
            if !slot.as_ref().is_some_and(|a| a.id == id) {
                return false;
            }
            *self.state.lock() = state;
        }
        tracing::debug!(target = "requester", attempt = id, %state, "state");
        self.events.state.publish(state);
        true
    }

    /// Ends attempt `id` in terminal `state`, handing back its resources.
    fn finish(&self, id: u64, state: RequesterState) -> Option<Attempt<Progress>> {
        let attempt = {
            let mut slot = self.attempt.lock();
            if !slot.as_ref().is_some_and(|a| a.id == id) {
                return None;
            }
            let attempt = slot.take();
            *self.state.lock() = state;
            attempt
        };
        self.events.state.publish(state);
        attempt
    }

    async fn fail(&self, id: u64, reason: String) {
        let Some(attempt) = self.finish(id, RequesterState::Error) else {
            return;
        };
        tracing::warn!(target = "requester", attempt = id, %reason, "pairing failed");
        if let Err(err) = attempt
            .transport
            .send_data(&DataChannelMessage::cancel().encode())
            .await
        {
            tracing::debug!(target = "requester", error = %err, "cancel notice not delivered");
        }
        self.events.error.publish(reason);
        attempt.shutdown().await;
    }

    async fn enroll(&self, token: String) -> Result<Value, SessionError> {
        if !self.ceremony.is_supported() {
            return Err(EnrollmentError::Unsupported.into());
        }
        let api = &self.context.api;
        let start = api.start_registration(&token).await?;
        drop(token);
        let options = self.codec.decode_creation_options(&start.creation_options)?;
        let credential = self.ceremony.create(options).await?;
        let encoded = self.codec.encode_credential(&credential)?;
        let finished = api
            .finish_registration(&start.registration_id, encoded)
            .await?;
        Ok(finished)
    }

    async fn handle(&self, id: u64, event: TransportEvent) {
        match event {
            TransportEvent::Code(code) => {
                let stored = {
                    let mut slot = self.attempt.lock();
                    match slot.as_mut().filter(|a| a.id == id) {
                        Some(attempt) if attempt.progress.code.is_none() => {
                            attempt.progress.code = Some(code.clone());
                            true
                        }
                        _ => false,
                    }
                };
                if stored {
                    tracing::info!(target = "requester", attempt = id, %code, "pairing code issued");
                    self.advance(id, RequesterState::AwaitingPeer);
                    self.events.code.publish(code);
                }
            }
            TransportEvent::User(user) => {
                let Some(transport) = self.transport(id) else {
                    return;
                };
                self.advance(id, RequesterState::Negotiating);
                if let Err(err) = transport.create_offer().await {
                    self.fail(id, err.to_string()).await;
                    return;
                }
                if self.advance(id, RequesterState::AwaitingConsent) {
                    self.events.user.publish(user);
                }
            }
            TransportEvent::ChannelOpen => {
                if let Some(attempt) = self.attempt.lock().as_mut().filter(|a| a.id == id) {
                    attempt.channel_open = true;
                }
            }
            TransportEvent::Data(text) => self.handle_data(id, &text).await,
            TransportEvent::ChannelClosed => {
                let state = *self.state.lock();
                if !state.is_terminal() && state != RequesterState::Enrolling {
                    self.fail(id, TransportError::ChannelClosed.to_string()).await;
                }
            }
            TransportEvent::SignalingClosed => {
                if !self.channel_open(id) {
                    self.fail(id, "relay closed before the peer connected".into())
                        .await;
                }
            }
            TransportEvent::Error(err) => {
                if is_fatal(&err, self.channel_open(id)) {
                    self.fail(id, err.to_string()).await;
                } else {
                    tracing::debug!(target = "requester", error = %err, "ignoring relay error");
                }
            }
            TransportEvent::Negotiation(state) => {
                tracing::trace!(target = "requester", attempt = id, ?state, "negotiation");
            }
        }
    }

    fn channel_open(&self, id: u64) -> bool {
        self.attempt
            .lock()
            .as_ref()
            .filter(|a| a.id == id)
            .is_some_and(|a| a.channel_open)
    }

    async fn handle_data(&self, id: u64, text: &str) {
        let message = match DataChannelMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(target = "requester", error = %err, "ignoring data channel frame");
                return;
            }
        };
        match message {
            DataChannelMessage::Token(token) => {
                let captured = {
                    let mut slot = self.attempt.lock();
                    match slot.as_mut().filter(|a| a.id == id) {
                        Some(attempt)
                            if attempt.progress.consent_armed
                                && attempt.progress.token.is_none()
                                && !attempt.progress.enrolling =>
                        {
                            attempt.progress.token = Some(token);
                            true
                        }
                        _ => false,
                    }
                };
                if captured {
                    tracing::info!(target = "requester", attempt = id, "enrollment token received");
                    self.events.token_received.publish(());
                } else {
                    tracing::debug!(target = "requester", attempt = id, "ignoring unsolicited token");
                }
            }
            DataChannelMessage::Action(Action::Cancel) => {
                if let Some(attempt) = self.finish(id, RequesterState::Cancelled) {
                    tracing::info!(target = "requester", attempt = id, "provider cancelled");
                    self.events.cancelled.publish(CancelOrigin::Remote);
                    attempt.shutdown().await;
                }
            }
            other => {
                tracing::debug!(target = "requester", frame = %other, "ignoring provider message");
            }
        }
    }
}

async fn drive(
    inner: Weak<RequesterInner>,
    id: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_current(id) {
            break;
        }
        inner.handle(id, event).await;
    }
}
