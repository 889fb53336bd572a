//! Scripted in-memory connector for lifecycle tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sdfx_link_core::protocol::{ControlEnvelope, Frame};
use tokio::sync::mpsc;

use crate::transport::{Connector, Transport, TransportError};

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Accept,
    Refuse,
    /// The open never completes.
    Pending,
}

/// Server side of an accepted mock connection.
pub struct ServerEnd {
    pub url: String,
    to_client: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        self.to_client.send(Ok(Frame::Text(text.to_string()))).ok();
    }

    pub fn send_binary(&self, bytes: Bytes) {
        self.to_client.send(Ok(Frame::Binary(bytes))).ok();
    }

    pub fn fail(&self) {
        self.to_client
            .send(Err(TransportError::Protocol("connection reset".into())))
            .ok();
    }

    /// Next envelope the client sent.
    pub async fn recv_envelope(&mut self) -> ControlEnvelope {
        match self.from_client.recv().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Transports currently held by the client, and the most ever held at once.
#[derive(Default)]
struct LiveCount {
    now: AtomicUsize,
    max: AtomicUsize,
}

/// Opens connections according to a script; refuses once the script runs out.
pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    urls: Mutex<Vec<String>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
    close_delay: Duration,
    live: Arc<LiveCount>,
}

impl MockConnector {
    pub fn new(script: Vec<Outcome>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        Self::with_close_delay(script, Duration::ZERO)
    }

    /// Transports whose `close` takes `close_delay`, like a peer that stopped reading.
    pub fn with_close_delay(
        script: Vec<Outcome>,
        close_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            urls: Mutex::new(Vec::new()),
            accepted,
            close_delay,
            live: Arc::default(),
        });
        (connector, servers)
    }

    pub fn live_transports(&self) -> usize {
        self.live.now.load(Ordering::SeqCst)
    }

    pub fn max_live_transports(&self) -> usize {
        self.live.max.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.urls.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.urls.lock().unwrap().push(url.to_string());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Refuse);

        match outcome {
            Outcome::Refuse => Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
            Outcome::Pending => std::future::pending().await,
            Outcome::Accept => {
                let now = self.live.now.fetch_add(1, Ordering::SeqCst) + 1;
                self.live.max.fetch_max(now, Ordering::SeqCst);

                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                self.accepted
                    .send(ServerEnd {
                        url: url.to_string(),
                        to_client,
                        from_client,
                    })
                    .ok();
                Ok(Box::new(MockTransport {
                    inbound,
                    outbound,
                    close_delay: self.close_delay,
                    live: self.live.clone(),
                }))
            }
        }
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    outbound: mpsc::UnboundedSender<Frame>,
    close_delay: Duration,
    live: Arc<LiveCount>,
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.live.now.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        tokio::time::sleep(self.close_delay).await;
        self.inbound.close();
    }
}
