use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{is_fatal, Attempt, CancelOrigin, PairingContext, SessionError};
use crate::observer::Observer;
use crate::protocol::{Action, DataChannelMessage, PairingCode, PeerEvent};
use crate::signaling::SignalingMessage;
use crate::transport::{NegotiationState, SendOutcome, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Idle,
    Joining,
    Negotiating,
    AwaitingApproval,
    TokenSent,
    AwaitingCompletion,
    Completed,
    Cancelled,
    Error,
}

impl ProviderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProviderState::Completed | ProviderState::Cancelled | ProviderState::Error
        )
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderState::Idle => "idle",
            ProviderState::Joining => "joining",
            ProviderState::Negotiating => "negotiating",
            ProviderState::AwaitingApproval => "awaiting approval",
            ProviderState::TokenSent => "token sent",
            ProviderState::AwaitingCompletion => "awaiting completion",
            ProviderState::Completed => "completed",
            ProviderState::Cancelled => "cancelled",
            ProviderState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
pub struct ProviderEvents {
    pub state: Observer<ProviderState>,
    /// The requester asked to be enrolled; confirm before providing a token.
    pub approval_requested: Observer<()>,
    pub token_provided: Observer<()>,
    pub completed: Observer<()>,
    pub cancelled: Observer<CancelOrigin>,
    pub error: Observer<String>,
}

#[derive(Default)]
struct Progress {
    add_received: bool,
    token_requested: bool,
    token_sent: bool,
}

struct ProviderInner {
    context: PairingContext,
    events: ProviderEvents,
    state: Mutex<ProviderState>,
    attempt: Mutex<Option<Attempt<Progress>>>,
    next_attempt: AtomicU64,
}

/// The authenticated device's side of the pairing: joins the requester's
/// room by code, answers its offer, and hands over a one-time add token once
/// the requester asks for it.
pub struct ProviderSession {
    inner: Arc<ProviderInner>,
}

impl ProviderSession {
    pub fn new(context: PairingContext) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                context,
                events: ProviderEvents::default(),
                state: Mutex::new(ProviderState::Idle),
                attempt: Mutex::new(None),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    pub fn events(&self) -> &ProviderEvents {
        &self.inner.events
    }

    pub fn state(&self) -> ProviderState {
        *self.inner.state.lock()
    }

    /// Joins the room named by `code`. The code is trimmed and upper-cased
    /// before it goes on the wire.
    pub async fn connect_with_code(&self, code: &str) -> Result<(), SessionError> {
        let code = match PairingCode::parse(code) {
            Ok(code) => code,
            Err(err) => {
                self.inner.set_state(ProviderState::Error);
                self.inner.events.error.publish(err.to_string());
                return Err(err.into());
            }
        };

        let previous = self.inner.attempt.lock().take();
        if let Some(previous) = previous {
            tracing::debug!(target = "provider", attempt = previous.id, "replacing attempt");
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
        self.inner.set_state(ProviderState::Joining);

        let driver = tokio::spawn(drive(Arc::downgrade(&self.inner), id, events));
        if let Some(attempt) = self.inner.attempt.lock().as_mut().filter(|a| a.id == id) {
            attempt.driver = Some(driver);
        }

        let joined = transport
            .send_signal(&SignalingMessage::code(code.as_str()))
            .and_then(|()| transport.connect_signaling(self.inner.context.config.signaling_url()));
        if let Err(err) = joined {
            let err = SessionError::from(err);
            self.inner.fail(id, err.to_string()).await;
            return Err(err);
        }
        tracing::info!(target = "provider", attempt = id, %code, "joining pairing room");
        Ok(())
    }

    /// Fetches a one-time add token and sends it to the requester. Only valid
    /// once the requester asked to be added, and only once per attempt.
    pub async fn provide_token(&self) -> Result<(), SessionError> {
        let (id, transport) = {
            let mut slot = self.inner.attempt.lock();
            let attempt = slot.as_mut().ok_or(SessionError::NoTransport)?;
            if !attempt.progress.add_received {
                return Err(SessionError::ConsentRequired);
            }
            if attempt.progress.token_requested {
                return Err(SessionError::invalid_state(
                    "provide token",
                    *self.inner.state.lock(),
                ));
            }
            attempt.progress.token_requested = true;
            (attempt.id, Arc::clone(&attempt.transport))
        };

        let token = match self.inner.context.api.fetch_add_token().await {
            Ok(token) => token,
            Err(err) => {
                let err = SessionError::from(err);
                self.inner.fail(id, err.to_string()).await;
                return Err(err);
            }
        };
        if let Some(attempt) = self.inner.attempt.lock().as_mut().filter(|a| a.id == id) {
            attempt.progress.token_sent = true;
        }
        let outcome = match transport
            .send_data(&DataChannelMessage::token(token).encode())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = SessionError::from(err);
                self.inner.fail(id, err.to_string()).await;
                return Err(err);
            }
        };
        if !self.inner.advance(id, ProviderState::TokenSent) {
            return Err(SessionError::NoTransport);
        }
        tracing::info!(target = "provider", attempt = id, ?outcome, "enrollment token sent");
        self.inner.events.token_provided.publish(());
        if outcome == SendOutcome::Sent || self.inner.channel_open(id) {
            self.inner.advance(id, ProviderState::AwaitingCompletion);
        }
        Ok(())
    }

    /// Abandons the attempt and tells the requester.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let attempt = {
            let mut slot = self.inner.attempt.lock();
            let attempt = slot.take();
            let mut state = self.inner.state.lock();
            *state = if attempt.is_some() {
                ProviderState::Cancelled
            } else {
                ProviderState::Idle
            };
            attempt
        };
        let Some(attempt) = attempt else {
            self.inner.events.state.publish(ProviderState::Idle);
            return Ok(());
        };
        if let Err(err) = attempt
            .transport
            .send_data(&DataChannelMessage::cancel().encode())
            .await
        {
            tracing::debug!(target = "provider", error = %err, "cancel notice not delivered");
        }
        tracing::info!(target = "provider", attempt = attempt.id, "pairing cancelled");
        self.inner.events.state.publish(ProviderState::Cancelled);
        self.inner.events.cancelled.publish(CancelOrigin::Local);
        attempt.shutdown().await;
        Ok(())
    }
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSession")
            .field("state", &self.state())
            .finish()
    }
}

impl ProviderInner {
    fn set_state(&self, state: ProviderState) {
        *self.state.lock() = state;
        self.events.state.publish(state);
    }

    fn is_current(&self, id: u64) -> bool {
        self.attempt.lock().as_ref().is_some_and(|a| a.id == id)
    }

    fn channel_open(&self, id: u64) -> bool {
        self.attempt
            .lock()
            .as_ref()
            .filter(|a| a.id == id)
            .is_some_and(|a| a.channel_open)
    }

    fn advance(&self, id: u64, state: ProviderState) -> bool {
        {
            let slot = self.attempt.lock();
            if !slot.as_ref().is_some_and(|a| a.id == id) {
                return false;
            }
            *self.state.lock() = state;
        }
        tracing::debug!(target = "provider", attempt = id, %state, "state");
        self.events.state.publish(state);
        true
    }

    fn finish(&self, id: u64, state: ProviderState) -> Option<Attempt<Progress>> {
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
        let Some(attempt) = self.finish(id, ProviderState::Error) else {
            return;
        };
        tracing::warn!(target = "provider", attempt = id, %reason, "pairing failed");
        if let Err(err) = attempt
            .transport
            .send_data(&DataChannelMessage::cancel().encode())
            .await
        {
            tracing::debug!(target = "provider", error = %err, "cancel notice not delivered");
        }
        self.events.error.publish(reason);
        attempt.shutdown().await;
    }

    async fn handle(&self, id: u64, event: TransportEvent) {
        match event {
            TransportEvent::Negotiation(NegotiationState::HaveRemoteOffer) => {
                if *self.state.lock() == ProviderState::Joining {
                    self.advance(id, ProviderState::Negotiating);
                }
            }
            TransportEvent::Negotiation(state) => {
                tracing::trace!(target = "provider", attempt = id, ?state, "negotiation");
            }
            TransportEvent::ChannelOpen => {
                if let Some(attempt) = self.attempt.lock().as_mut().filter(|a| a.id == id) {
                    attempt.channel_open = true;
                }
                if *self.state.lock() == ProviderState::TokenSent {
                    self.advance(id, ProviderState::AwaitingCompletion);
                }
            }
            TransportEvent::Data(text) => self.handle_data(id, &text).await,
            TransportEvent::ChannelClosed => {
                if !self.state.lock().is_terminal() {
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
                    tracing::debug!(target = "provider", error = %err, "ignoring relay error");
                }
            }
            TransportEvent::Code(_) | TransportEvent::User(_) => {
                tracing::trace!(target = "provider", attempt = id, "ignoring relay notice");
            }
        }
    }

    async fn handle_data(&self, id: u64, text: &str) {
        let message = match DataChannelMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(target = "provider", error = %err, "ignoring data channel frame");
                return;
            }
        };
        match message {
            DataChannelMessage::Action(Action::Add) => {
                let first = {
                    let mut slot = self.attempt.lock();
                    match slot.as_mut().filter(|a| a.id == id) {
                        Some(attempt) if !attempt.progress.add_received => {
                            attempt.progress.add_received = true;
                            true
                        }
                        _ => false,
                    }
                };
                if first {
                    tracing::info!(target = "provider", attempt = id, "requester asked to be added");
                    self.advance(id, ProviderState::AwaitingApproval);
                    self.events.approval_requested.publish(());
                }
            }
            DataChannelMessage::Action(Action::Cancel) => {
                if let Some(attempt) = self.finish(id, ProviderState::Cancelled) {
                    tracing::info!(target = "provider", attempt = id, "requester cancelled");
                    self.events.cancelled.publish(CancelOrigin::Remote);
                    attempt.shutdown().await;
                }
            }
            DataChannelMessage::Event(PeerEvent::Complete) => {
                let token_sent = self
                    .attempt
                    .lock()
                    .as_ref()
                    .filter(|a| a.id == id)
                    .is_some_and(|a| a.progress.token_sent);
                if !token_sent {
                    tracing::warn!(target = "provider", attempt = id, "completion before token; ignoring");
                    return;
                }
                if let Some(attempt) = self.finish(id, ProviderState::Completed) {
                    tracing::info!(target = "provider", attempt = id, "requester enrolled");
                    self.events.completed.publish(());
                    attempt.shutdown().await;
                }
            }
            DataChannelMessage::Token(_) => {
                tracing::debug!(target = "provider", attempt = id, "ignoring token from requester");
            }
        }
    }
}

async fn drive(
    inner: Weak<ProviderInner>,
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
