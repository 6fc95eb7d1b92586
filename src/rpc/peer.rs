//! A multiplexed duplex RPC peer.
//!
//! One `Peer` wraps an established framed stream: outgoing calls are tagged
//! with an id and matched to replies through a pending map, incoming calls
//! are dispatched through the session gateway on their own tasks so a slow
//! handler never stalls other traffic on the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{MeshError, Result};
use crate::gateway::{RemoteRegistry, SessionGateway};
use crate::rpc::wire::{self, Envelope, SessionRole};

type ReplySlot = oneshot::Sender<std::result::Result<Value, (String, String)>>;

#[derive(Clone)]
pub struct Peer {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: Arc<Mutex<HashMap<u64, ReplySlot>>>,
    next_id: Arc<AtomicU64>,
    call_timeout: Duration,
    closed: CancellationToken,
    name: String,
}

impl Peer {
    /// Take over an established stream and start the reader and writer
    /// tasks. Incoming calls are resolved through `gateway`.
    pub fn spawn(
        framed: wire::FramedStream,
        gateway: Arc<SessionGateway>,
        call_timeout: Duration,
    ) -> Peer {
        let (tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let peer = Peer {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            call_timeout,
            closed: CancellationToken::new(),
            name: gateway.peer().to_string(),
        };

        let (mut sink, mut stream) = framed.split();

        let writer_name = peer.name.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match serde_json::to_vec(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(peer = %writer_name, error = %e, "failed to encode envelope");
                        continue;
                    }
                };
                if sink.send(Bytes::from(bytes)).await.is_err() {
                    break;
                }
            }
        });

        let reader = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(peer = %reader.name, error = %e, "transport error, closing session");
                        break;
                    }
                };
                match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(envelope) => reader.handle_incoming(envelope, &gateway),
                    Err(e) => {
                        tracing::warn!(peer = %reader.name, error = %e, "dropping malformed frame");
                    }
                }
            }
            reader.fail_pending();
            reader.closed.cancel();
        });

        peer
    }

    fn handle_incoming(&self, envelope: Envelope, gateway: &Arc<SessionGateway>) {
        match envelope {
            Envelope::Call { id, method, args } => {
                let gateway = gateway.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let reply = match gateway.dispatch(&method, args).await {
                        Ok(result) => Envelope::Reply { id, result },
                        Err(e) => Envelope::Error {
                            id,
                            code: e.wire_code().to_string(),
                            message: e.to_string(),
                        },
                    };
                    let _ = tx.send(reply);
                });
            }
            Envelope::Notify { method, args } => {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = gateway.dispatch(&method, args).await {
                        tracing::warn!(method, error = %e, "notify dispatch failed");
                    }
                });
            }
            Envelope::Reply { id, result } => {
                if let Some(slot) = self.take_pending(id) {
                    let _ = slot.send(Ok(result));
                }
            }
            Envelope::Error { id, code, message } => {
                if let Some(slot) = self.take_pending(id) {
                    let _ = slot.send(Err((code, message)));
                }
            }
            Envelope::Login { .. } | Envelope::LoginAck { .. } => {
                tracing::warn!(peer = %self.name, "unexpected login frame mid-session");
            }
        }
    }

    /// Call a remote method and await its result, bounded by the peer's
    /// call timeout. A timeout is a delivery failure from the caller's
    /// point of view.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot_tx, slot_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(id, slot_tx);

        let envelope = Envelope::Call {
            id,
            method: method.to_string(),
            args,
        };
        if self.tx.send(envelope).is_err() {
            self.take_pending(id);
            return Err(MeshError::NotConnected);
        }

        match tokio::time::timeout(self.call_timeout, slot_rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err((code, message)))) => Err(MeshError::from_wire(&code, message)),
            Ok(Err(_)) => Err(MeshError::NotConnected),
            Err(_) => {
                self.take_pending(id);
                Err(MeshError::CallTimeout(method.to_string()))
            }
        }
    }

    /// Send a one-way notification. Never waits for the remote side.
    pub fn notify(&self, method: &str, args: Value) -> Result<()> {
        let envelope = Envelope::Notify {
            method: method.to_string(),
            args,
        };
        self.tx.send(envelope).map_err(|_| MeshError::NotConnected)
    }

    /// Resolves when the underlying connection is gone.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn take_pending(&self, id: u64) -> Option<ReplySlot> {
        self.pending.lock().expect("lock poisoned").remove(&id)
    }

    /// Drop every pending reply slot; waiting callers observe the
    /// connection loss instead of hanging.
    fn fail_pending(&self) {
        self.pending.lock().expect("lock poisoned").clear();
    }
}

/// Connect to a master, authenticate, and return a live peer for the
/// session. `registry` holds the methods this side exposes to the master.
pub async fn login(
    addr: &str,
    key: &str,
    secret: &str,
    role: SessionRole,
    registry: Arc<RemoteRegistry>,
    call_timeout: Duration,
) -> Result<Peer> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = wire::frame(stream);

    wire::send(
        &mut framed,
        &Envelope::Login {
            key: key.to_string(),
            secret: secret.to_string(),
            role,
        },
    )
    .await?;

    match wire::recv(&mut framed).await? {
        Some(Envelope::LoginAck { accepted: true }) => {}
        _ => return Err(MeshError::LoginRejected),
    }

    let gateway = Arc::new(SessionGateway::authenticated(registry, "master"));
    Ok(Peer::spawn(framed, gateway, call_timeout))
}
