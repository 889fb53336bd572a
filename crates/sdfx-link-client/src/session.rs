//! Session facade: the single entry point applications hold.

use std::sync::{Arc, Mutex, PoisonError};

use sdfx_link_core::codec;
use sdfx_link_core::config::{Config, Endpoints};
use sdfx_link_core::events::{Event, EventKind};
use sdfx_link_core::identity::{ClientIdentity, FileIdentityStore, IdentityStore};
use sdfx_link_core::protocol::{ControlEnvelope, Frame};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::SubscriptionHandle;
use crate::lifecycle::{Command, ConnectionState, Lifecycle, ReconnectPolicy, Shared};
use crate::rest::RestClient;
use crate::stats::StatsSnapshot;
use crate::transport::{Connector, WsConnector};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle on a connection task. A cancelled one stays in the session's slot
/// until its task has released the transport.
struct Connection {
    cancel: CancellationToken,
    /// Cancelled once the task has finished and dropped its transport.
    finished: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Connection {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

/// Owns at most one live connection to the backend and the subscriber registry.
///
/// Dropping the session disconnects it.
pub struct Session {
    shared: Arc<Shared>,
    endpoints: Endpoints,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    default_token: Option<String>,
    connection: Mutex<Option<Connection>>,
}

impl Session {
    /// The resumption id is read from `store` once, here.
    pub fn new(endpoints: Endpoints, store: Arc<dyn IdentityStore>) -> Self {
        Self {
            shared: Arc::new(Shared::new(store)),
            endpoints,
            connector: Arc::new(WsConnector),
            policy: ReconnectPolicy::default(),
            default_token: None,
            connection: Mutex::new(None),
        }
    }

    /// Build a session from configuration: endpoints, token, reconnect policy
    /// and a file-backed identity store.
    pub fn from_config(config: &Config) -> sdfx_link_core::error::Result<Self> {
        let store = Arc::new(FileIdentityStore::new(config.identity_path()));
        Ok(Self::new(config.endpoints()?, store)
            .with_policy(ReconnectPolicy::from_config(config))
            .with_auth_token(config.auth_token()))
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Token used when `connect` is not given one.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.default_token = token;
        self
    }

    /// Start the connection task. A no-op while one is already running.
    ///
    /// `client_id` overrides the known id for this and later reconnects. If a
    /// previous connection is still closing, the new task opens its transport
    /// only after the old one is released.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, since the connection task is
    /// spawned onto the current one.
    pub fn connect(&self, client_id: Option<String>, token: Option<String>) {
        let mut slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(Connection::is_active) {
            debug!("Connection already active, ignoring connect");
            return;
        }
        let previous = slot.take().map(|c| c.task);

        let known = self.shared.identity();
        let identity = ClientIdentity::resolve(
            client_id,
            Some(known.client_id),
            token.or_else(|| self.default_token.clone()),
        );
        info!(client_id = %identity.client_id, endpoint = %self.endpoints.ws, "Connecting");
        self.shared.set_identity(identity);
        self.shared.state.send_replace(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let lifecycle = Lifecycle {
            shared: self.shared.clone(),
            connector: self.connector.clone(),
            endpoints: self.endpoints.clone(),
            policy: self.policy,
            cancel: cancel.clone(),
            commands: commands_rx,
        };
        let finished = CancellationToken::new();
        let guard = finished.clone().drop_guard();
        let task = tokio::spawn(async move {
            let _guard = guard;
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(error = %e, "Previous connection task ended abnormally");
                }
            }
            lifecycle.run().await;
        });

        *slot = Some(Connection {
            cancel,
            finished,
            commands: commands_tx,
            task,
        });
    }

    /// Close the connection and abandon any pending reconnection or
    /// in-flight open. Returns immediately; the task closes the transport
    /// in the background.
    pub fn disconnect(&self) {
        self.cancel_connection();
    }

    /// Like [`Session::disconnect`], but waits for the connection task to
    /// flush queued sends and release the transport. Bounded by
    /// [`CLOSE_TIMEOUT`](crate::lifecycle::CLOSE_TIMEOUT) once the transport is open.
    pub async fn shutdown(&self) {
        if let Some(finished) = self.cancel_connection() {
            finished.cancelled().await;
        }
    }

    /// Cancel the current task, if any, and publish `Disconnected`.
    fn cancel_connection(&self) -> Option<CancellationToken> {
        let slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let finished = slot.as_ref().map(|connection| {
            if !connection.cancel.is_cancelled() {
                connection.cancel.cancel();
                info!("Disconnected");
            }
            connection.finished.clone()
        });
        self.shared.state.send_replace(ConnectionState::Disconnected);
        finished
    }

    /// Queue a control message for the open connection.
    pub fn send(&self, envelope: ControlEnvelope) -> Result<(), SendError> {
        if !self.state().is_connected() {
            return Err(SendError::NotConnected);
        }
        let text = codec::encode(&envelope)?;

        let slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let connection = slot
            .as_ref()
            .filter(|connection| connection.is_active())
            .ok_or(SendError::NotConnected)?;
        connection
            .commands
            .send(Command::Send(Frame::Text(text)))
            .map_err(|_| SendError::NotConnected)
    }

    /// Subscribe to events of `kind`. Subscriptions survive reconnects.
    pub fn on<F>(&self, kind: impl Into<EventKind>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(kind, callback)
    }

    pub fn off(&self, handle: &SubscriptionHandle) -> bool {
        self.shared.dispatcher.unsubscribe(handle)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn identity(&self) -> ClientIdentity {
        self.shared.identity()
    }

    pub fn client_id(&self) -> String {
        self.shared.identity().client_id
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// REST client sharing this session's endpoint and credentials.
    pub fn rest(&self) -> RestClient {
        let token = self
            .shared
            .identity()
            .auth_token
            .or_else(|| self.default_token.clone());
        RestClient::new(self.endpoints.http.clone(), token)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
