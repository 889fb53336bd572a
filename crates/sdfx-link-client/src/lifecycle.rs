//! Connection lifecycle: open, authenticate, pump frames, recover.
//!
//! One spawned task per connection owns the transport handle and the
//! reconnection attempt counter. Everything that touches them (state
//! transitions, decoding, dispatch, the reconnection timer) happens on that
//! task, in frame-delivery order. Callers talk to it through a command
//! channel and a cancellation token.
//!
//! Close path for every transport, opened or not:
//! 1. `attempt += 1`
//! 2. if the transport had opened: dispatch `status` (null), then `reconnecting`
//! 3. dispatch `connectionAttempt` with the attempt number
//! 4. past the cap: `Failed`, no timer; otherwise `Recovering { attempt }` and
//!    wait the fixed delay before reopening.
//!
//! Cancellation wins over every await on the transport. Once cancelled, the
//! task spends at most [`CLOSE_TIMEOUT`] flushing and closing before it drops
//! the handle.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use sdfx_link_core::codec::{self, InboundMessage};
use sdfx_link_core::config::{Config, Endpoints};
use sdfx_link_core::events::{Event, EventKind};
use sdfx_link_core::identity::{ClientIdentity, IdentityStore};
use sdfx_link_core::protocol::{ControlEnvelope, Frame};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::stats::SessionStats;
use crate::transport::{Connector, Transport, TransportError};

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default number of reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Upper bound on flushing and closing a transport once the session is done with it.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed delay between attempts. No backoff, no jitter.
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delay: config.reconnect_delay(),
            max_attempts: config.max_reconnect_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to reopen after the `attempt`-th failure in a row.
    Recovering { attempt: u32 },
    /// Gave up. Only a new `connect` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// State shared between the session facade and its connection task.
pub(crate) struct Shared {
    pub dispatcher: Dispatcher,
    pub state: watch::Sender<ConnectionState>,
    pub identity: RwLock<ClientIdentity>,
    pub store: Arc<dyn IdentityStore>,
    pub stats: SessionStats,
}

impl Shared {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        let identity = ClientIdentity::resolve(None, store.load(), None);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            dispatcher: Dispatcher::new(),
            state,
            identity: RwLock::new(identity),
            store,
            stats: SessionStats::default(),
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_identity(&self, identity: ClientIdentity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
    }
}

pub(crate) enum Command {
    Send(Frame),
}

enum Exit {
    Cancelled,
    Closed,
}

pub(crate) struct Lifecycle {
    pub shared: Arc<Shared>,
    pub connector: Arc<dyn Connector>,
    pub endpoints: Endpoints,
    pub policy: ReconnectPolicy,
    pub cancel: CancellationToken,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

impl Lifecycle {
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let identity = self.shared.identity();
            let url = self.endpoints.ws_url(&identity.client_id);
            debug!(%url, attempt, "Opening connection");

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                opened = self.connector.open(&url) => opened,
            };

            let mut had_opened = false;
            match opened {
                Ok(mut transport) => {
                    had_opened = true;
                    if !self.on_open(&mut *transport, &identity, attempt).await {
                        close_within(&mut *transport).await;
                        break;
                    }
                    attempt = 0;
                    if let Exit::Cancelled = self.drive(&mut *transport).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Connection attempt failed");
                }
            }

            let dropped = self.drain_commands();
            if dropped > 0 {
                debug!(dropped, "Discarded sends queued for a closed connection");
            }

            attempt += 1;
            if had_opened {
                self.emit(Event::json(EventKind::Status, Value::Null));
                self.emit(Event::empty(EventKind::Reconnecting));
            }
            self.emit(Event::connection_attempt(attempt));

            if attempt > self.policy.max_attempts {
                warn!(attempt, "Max connection attempts reached, giving up");
                self.set_state(ConnectionState::Failed);
                return;
            }

            self.set_state(ConnectionState::Recovering { attempt });
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }

        // Cancelled: `disconnect` has already published `Disconnected`.
        debug!("Connection task stopped");
    }

    /// Returns `false` if the session was cancelled while authenticating.
    async fn on_open(
        &self,
        transport: &mut dyn Transport,
        identity: &ClientIdentity,
        attempt: u32,
    ) -> bool {
        if let Some(token) = &identity.auth_token {
            match codec::encode(&ControlEnvelope::auth(token)) {
                Ok(text) => match self.send_unless_cancelled(transport, Frame::Text(text)).await {
                    None => return false,
                    Some(Err(e)) => warn!(error = %e, "Failed to send auth message"),
                    Some(Ok(())) => {}
                },
                Err(e) => warn!(error = %e, "Failed to encode auth message"),
            }
        }

        self.set_state(ConnectionState::Connected);
        info!(client_id = %identity.client_id, "Connected");
        if attempt > 0 {
            self.emit(Event::empty(EventKind::Reconnected));
        }
        true
    }

    /// Pump frames and commands until the transport closes or the session is cancelled.
    async fn drive(&mut self, transport: &mut dyn Transport) -> Exit {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.flush_and_close(transport).await;
                    return Exit::Cancelled;
                }
                inbound = transport.recv() => match inbound {
                    Some(Ok(frame)) => {
                        if let Some(reply) = self.handle_frame(frame) {
                            match self.send_unless_cancelled(transport, reply).await {
                                None => {
                                    self.flush_and_close(transport).await;
                                    return Exit::Cancelled;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Failed to send reply, closing");
                                    close_within(transport).await;
                                    return Exit::Closed;
                                }
                                Some(Ok(())) => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Transport error, closing");
                        close_within(transport).await;
                        return Exit::Closed;
                    }
                    None => {
                        info!("Connection closed by server");
                        return Exit::Closed;
                    }
                },
                Some(command) = self.commands.recv() => match command {
                    Command::Send(frame) => {
                        match self.send_unless_cancelled(transport, frame).await {
                            None => {
                                self.flush_and_close(transport).await;
                                return Exit::Cancelled;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Send failed, closing");
                                close_within(transport).await;
                                return Exit::Closed;
                            }
                            Some(Ok(())) => {}
                        }
                    }
                },
            }
        }
    }

    /// `None` if the session was cancelled before the send completed.
    async fn send_unless_cancelled(
        &self,
        transport: &mut dyn Transport,
        frame: Frame,
    ) -> Option<Result<(), TransportError>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            sent = transport.send(frame) => Some(sent),
        }
    }

    /// Sends accepted before the disconnect still go out, within [`CLOSE_TIMEOUT`].
    async fn flush_and_close(&mut self, transport: &mut dyn Transport) {
        let commands = &mut self.commands;
        let flushed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            while let Ok(Command::Send(frame)) = commands.try_recv() {
                if transport.send(frame).await.is_err() {
                    break;
                }
            }
            transport.close().await;
        })
        .await;
        if flushed.is_err() {
            warn!(
                timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                "Peer did not close in time, dropping connection"
            );
        }
    }

    /// Decode and dispatch one inbound frame. Returns a frame to send back, if any.
    fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        self.shared.stats.record_frame();

        match codec::decode(frame) {
            InboundMessage::Malformed { raw, error } => {
                self.shared.stats.record_malformed();
                warn!(%error, len = raw.len(), "Dropping malformed frame");
                None
            }
            InboundMessage::BinaryPreview(image) => {
                self.emit(Event::preview(image));
                None
            }
            InboundMessage::Control {
                kind,
                segment,
                payload,
            } => self.handle_control(EventKind::from(kind), segment, payload),
        }
    }

    fn handle_control(
        &self,
        kind: EventKind,
        segment: Option<String>,
        payload: Value,
    ) -> Option<Frame> {
        let mut reply = None;
        let data = match kind {
            EventKind::Status => {
                if let Some(sid) = payload.get("sid").and_then(Value::as_str) {
                    self.adopt_client_id(sid);
                }
                payload.get("status").cloned().unwrap_or(Value::Null)
            }
            EventKind::Executing => payload.get("node").cloned().unwrap_or(Value::Null),
            EventKind::Ping => {
                match codec::encode(&ControlEnvelope::pong(segment.as_deref())) {
                    Ok(text) => reply = Some(Frame::Text(text)),
                    Err(e) => warn!(error = %e, "Failed to encode pong"),
                }
                payload
            }
            _ => payload,
        };

        self.emit(Event::json(kind, data).with_segment(segment));
        reply
    }

    /// The server reassigned our id: adopt it for future reconnects and persist it.
    fn adopt_client_id(&self, sid: &str) {
        {
            let mut identity = self
                .shared
                .identity
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if identity.client_id != sid {
                info!(client_id = sid, "Server assigned client id");
            }
            identity.client_id = sid.to_string();
        }
        if let Err(e) = self.shared.store.save(sid) {
            warn!(error = %e, "Failed to persist client id");
        }
    }

    fn emit(&self, event: Event) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.shared.dispatcher.dispatch(&event) {
            Ok(report) => {
                if report.failed > 0 {
                    self.shared.stats.record_callback_failures(report.failed);
                }
            }
            Err(DispatchError::UnknownKind(kind)) => {
                self.shared.stats.record_unknown_kind();
                warn!(%kind, "Dropping message of unknown type");
            }
        }
    }

    /// A cancelled task publishes nothing; a newer connection may own the state by now.
    fn set_state(&self, state: ConnectionState) {
        // Checked under the channel lock, so a concurrent `disconnect` always publishes last.
        let published = self.shared.state.send_if_modified(|current| {
            if self.cancel.is_cancelled() {
                return false;
            }
            *current = state;
            true
        });
        if published {
            debug!(?state, "Connection state");
        }
    }

    fn drain_commands(&mut self) -> usize {
        let mut dropped = 0;
        while self.commands.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Close a transport the peer may no longer be servicing.
async fn close_within(transport: &mut dyn Transport) {
    if tokio::time::timeout(CLOSE_TIMEOUT, transport.close())
        .await
        .is_err()
    {
        warn!("Transport close timed out");
    }
}
