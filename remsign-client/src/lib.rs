//! Terminal-side client for a remote signer.
//!
//! Connects as the handshake initiator, then multiplexes request/reply
//! traffic over the established connection. Replies arrive in completion
//! order, not submission order (the signer suspends on password prompts), so
//! correlation is by request id: each in-flight request parks a oneshot in a
//! pending map and the reader task routes replies by id. Envelopes with
//! request id 0 are server pushes and are delivered on a separate event
//! stream.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use remsign_net::{conn, Config, Connection, CookieMode, KeyPromptRequest};
use remsign_signer::api::RequestType;
use remsign_wire::{envelope::MalformedEnvelope, Envelope};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, WriteHalf},
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
    time::interval,
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] remsign_net::Error),

    #[error("connection lost before the reply arrived")]
    ConnectionLost,

    #[error("malformed reply envelope")]
    MalformedReply,

    #[error("reply type {got} does not match request type {want}")]
    ReplyTypeMismatch { want: u16, got: u16 },

    #[error("failed to decode reply payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<MalformedEnvelope> for ClientError {
    fn from(_: MalformedEnvelope) -> Self {
        Self::MalformedReply
    }
}

type PendingMap =
    Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Envelope, ClientError>>>>>;

/// A connected signer client. Cheap to clone; all clones share one
/// connection.
pub struct SignerClient<S> {
    writer: Arc<AsyncMutex<conn::ConnectionWriter<WriteHalf<S>>>>,
    pending: PendingMap,
    next_request_id: Arc<AtomicU32>,
}

impl<S> Clone for SignerClient<S> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            pending: Arc::clone(&self.pending),
            next_request_id: Arc::clone(&self.next_request_id),
        }
    }
}

/// Server-pushed envelopes (request id 0), in arrival order.
pub type EventStream = mpsc::Receiver<Envelope>;

impl<S> SignerClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the handshake over `stream` and start the reader and heartbeat
    /// tasks. `expected_peer` names the pinned signer key in the peer store
    /// (ignored in cookie mode).
    pub async fn connect(
        stream: S,
        config: Config,
        expected_peer: &str,
        cookie_mode: &CookieMode,
        prompts: Option<mpsc::Sender<KeyPromptRequest>>,
    ) -> Result<(Self, EventStream), ClientError> {
        let connection =
            conn::connect(stream, config, expected_peer, cookie_mode, prompts)
                .await?;
        Ok(Self::from_connection(connection))
    }

    fn from_connection(connection: Connection<S>) -> (Self, EventStream) {
        let (reader, writer) = connection.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(16);

        let client = Self {
            writer: Arc::new(AsyncMutex::new(writer)),
            pending: pending.clone(),
            next_request_id: Arc::new(AtomicU32::new(1)),
        };

        tokio::spawn(read_loop(reader, pending, events_tx));
        tokio::spawn(heartbeat_loop(Arc::clone(&client.writer)));

        (client, events_rx)
    }

    /// Send one request and await its correlated reply.
    pub async fn request<Req, Resp>(
        &self,
        request_type: RequestType,
        payload: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request_id = self.alloc_request_id();
        let bytes = serde_json::to_vec(payload)?;
        let envelope =
            Envelope::new(request_type.to_u16(), request_id, bytes);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(request_id, reply_tx);

        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send(request_id, &envelope.encode()).await
        };
        if let Err(err) = sent {
            self.pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&request_id);
            return Err(err.into());
        }

        let reply = reply_rx
            .await
            .map_err(|_| ClientError::ConnectionLost)??;
        if reply.msg_type != request_type.to_u16() {
            return Err(ClientError::ReplyTypeMismatch {
                want: request_type.to_u16(),
                got: reply.msg_type,
            });
        }
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// Announce a clean close. In-flight requests fail with
    /// [`ClientError::ConnectionLost`].
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        writer.send_disconnect().await?;
        Ok(())
    }

    /// Request ids are non-zero and monotonically increasing; zero is
    /// reserved for server pushes.
    fn alloc_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: conn::ConnectionReader<R>,
    pending: PendingMap,
    events_tx: mpsc::Sender<Envelope>,
) {
    let reason = loop {
        match reader.recv().await {
            Ok(Some((_msg_id, payload))) => {
                let envelope = match Envelope::parse(&payload) {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        warn!("dropping malformed reply envelope");
                        continue;
                    }
                };
                if envelope.is_event() {
                    if events_tx.send(envelope).await.is_err() {
                        debug!("event stream dropped; discarding pushes");
                    }
                    continue;
                }
                let waiter = pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&envelope.request_id);
                match waiter {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(Ok(envelope));
                    }
                    None => warn!(
                        request_id = envelope.request_id,
                        "reply for unknown request id",
                    ),
                }
            }
            Ok(None) => break ClientError::ConnectionLost,
            Err(err) => break ClientError::Transport(err),
        }
    };

    debug!(%reason, "signer connection reader stopped");
    // Fail everything still in flight; new requests fail at send time.
    let waiters = std::mem::take(
        &mut *pending.lock().expect("pending map lock poisoned"),
    );
    for (_request_id, reply_tx) in waiters {
        let _ = reply_tx.send(Err(ClientError::ConnectionLost));
    }
}

/// Initiator-side local probe: a short-interval heartbeat that detects a
/// dead local socket quickly even when the responder is quiet.
async fn heartbeat_loop<W: AsyncWrite + Unpin + Send + 'static>(
    writer: Arc<AsyncMutex<conn::ConnectionWriter<W>>>,
) {
    let mut ticker = interval(conn::DEFAULT_PROBE_INTERVAL);
    ticker.tick().await; // the first tick is immediate
    loop {
        ticker.tick().await;
        let mut writer = writer.lock().await;
        if writer.send_heartbeat().await.is_err() {
            debug!("heartbeat failed; connection is gone");
            return;
        }
    }
}
