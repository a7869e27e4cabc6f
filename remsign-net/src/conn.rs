//! Connection driver: runs the handshake over an ordered byte stream, then
//! exposes the established, sealed send/recv surface.
//!
//! One reader task per connection owns the inbound sub-session; writes own
//! the outbound one. The two halves never share key material, so a
//! [`Connection`] can be split for concurrent use without locks around the
//! session.
//!
//! Wire phases:
//!
//! - Handshake, clear: `len | body` with the length prefix in plaintext.
//! - Handshake, sealed (from `AuthChallenge` on) and all established
//!   traffic: `enc(len) | enc(body) | tag` as produced by the cipher.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use remsign_crypto::{
    identity::{IdentityKeyPair, IdentityPubKey, PUBLIC_KEY_LEN},
    rng::SysRng,
};
use remsign_wire::{frame::MAX_BODY_LEN, Frame, PacketType};
use tokio::{
    io::{
        self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf,
        WriteHalf,
    },
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::{
    cookie::{self, CookieMode},
    error::Error,
    handshake::{Action, Handshake, KeyPrompt, State},
    peers::PeerStore,
    session::{Session, SubSession, LEN_PREFIX_LEN, TAG_LEN},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// `H`: the responder heartbeats on this interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The initiator's short local-probe heartbeat interval, for connections
/// where the responder does not heartbeat.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// A peer is dead after `3H` without any frame.
pub const fn idle_timeout(heartbeat_interval: Duration) -> Duration {
    Duration::from_secs(heartbeat_interval.as_secs() * 3)
}

#[derive(Clone)]
pub struct Config {
    pub identity: Arc<IdentityKeyPair>,
    pub peer_store: Arc<PeerStore>,
    /// First byte to `Established`.
    pub handshake_timeout: Duration,
    /// `None`: never declare the peer dead on silence.
    pub idle_timeout: Option<Duration>,
}

impl Config {
    pub fn new(
        identity: Arc<IdentityKeyPair>,
        peer_store: Arc<PeerStore>,
    ) -> Self {
        Self {
            identity,
            peer_store,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Some(idle_timeout(DEFAULT_HEARTBEAT_INTERVAL)),
        }
    }
}

/// An unknown responder key surfaced mid-handshake. Send `true` on `answer`
/// to pin the new key and resume, `false` to close with `UnknownPeerKey`.
/// Dropping `answer` counts as reject.
pub struct KeyPromptRequest {
    pub prompt: KeyPrompt,
    pub answer: oneshot::Sender<bool>,
}

/// Connect as the initiator. `expected_peer` is the peer-store name the
/// responder's key is pinned under (conventionally `host:port`). In
/// [`CookieMode::ReadServerCookie`] the cookie key overrides the peer store
/// and no prompt is ever raised.
pub async fn connect<S>(
    stream: S,
    config: Config,
    expected_peer: &str,
    cookie_mode: &CookieMode,
    prompts: Option<mpsc::Sender<KeyPromptRequest>>,
) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cookie_pin = match cookie_mode {
        CookieMode::ReadServerCookie(path) => Some(cookie::read_cookie(path)?),
        CookieMode::NotUsed | CookieMode::MakeCookie(_) => None,
    };

    let handshake = Handshake::initiator(
        config.identity.clone(),
        config.peer_store.clone(),
        expected_peer,
        cookie_pin,
        SysRng::new(),
    );
    establish(stream, config, handshake, prompts).await
}

/// Accept as the responder.
pub async fn accept<S>(
    stream: S,
    config: Config,
) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake::responder(
        config.identity.clone(),
        config.peer_store.clone(),
        SysRng::new(),
    );
    establish(stream, config, handshake, None).await
}

async fn establish<S>(
    stream: S,
    config: Config,
    handshake: Handshake<SysRng>,
    prompts: Option<mpsc::Sender<KeyPromptRequest>>,
) -> Result<Connection<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let driver = Driver {
        stream,
        session: None,
        handshake,
        prompts,
    };
    match timeout(config.handshake_timeout, driver.run()).await {
        Ok(result) => result.map(|(stream, session, peer)| {
            Connection::new(stream, session, peer, &config)
        }),
        Err(_elapsed) => Err(Error::HandshakeTimeout),
    }
}

struct Driver<S> {
    stream: S,
    session: Option<Session>,
    handshake: Handshake<SysRng>,
    prompts: Option<mpsc::Sender<KeyPromptRequest>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Driver<S> {
    async fn run(mut self) -> Result<(S, Session, IdentityPubKey), Error> {
        let mut queue: std::collections::VecDeque<Action> =
            self.handshake.start().into();

        loop {
            let mut established = None;
            while let Some(action) = queue.pop_front() {
                match action {
                    Action::SendClear(frame) => {
                        self.stream.write_all(&frame.encode()).await?;
                    }
                    Action::SendSealed(frame) => {
                        let session = self
                            .session
                            .as_mut()
                            .expect("sealed sends only after SessionReady");
                        let sealed =
                            session.outbound.seal(&frame.encode_body());
                        self.stream.write_all(&sealed).await?;
                    }
                    Action::SessionReady(session) => {
                        self.session = Some(session);
                    }
                    Action::RekeyEstablished {
                        initiator_key,
                        responder_key,
                    } => {
                        let session = self
                            .session
                            .as_mut()
                            .expect("rekey only after SessionReady");
                        session.rekey_both(&[
                            &initiator_key.serialize(),
                            &responder_key.serialize(),
                        ]);
                    }
                    Action::PromptKey(prompt) => {
                        // A prompt is always the last action of its batch;
                        // resuming produces the next sends.
                        let accept = self.ask_user(prompt).await;
                        queue.extend(self.handshake.resolve_prompt(accept)?);
                    }
                    Action::Established { peer } => {
                        established = Some(peer);
                    }
                    Action::Close(err) => {
                        self.stream.flush().await.ok();
                        return Err(err);
                    }
                }
            }

            if let Some(peer) = established {
                let session = self
                    .session
                    .take()
                    .expect("established implies a live session");
                return Ok((self.stream, session, peer));
            }

            let frame = self.read_frame().await?;
            trace!(packet = ?frame.packet_type, "handshake frame");
            queue = self.handshake.on_frame(frame)?.into();
        }
    }

    async fn ask_user(&mut self, prompt: KeyPrompt) -> bool {
        let sender = match &self.prompts {
            Some(sender) => sender.clone(),
            None => {
                warn!(
                    peer = %prompt.peer_name,
                    "unknown peer key and no prompt consumer; rejecting",
                );
                return false;
            }
        };
        let (answer_tx, answer_rx) = oneshot::channel();
        let request = KeyPromptRequest {
            prompt,
            answer: answer_tx,
        };
        if sender.send(request).await.is_err() {
            return false;
        }
        // A dropped answer channel is a reject.
        answer_rx.await.unwrap_or(false)
    }

    /// Read one frame, clear before the session exists and sealed after.
    async fn read_frame(&mut self) -> Result<Frame, Error> {
        match &mut self.session {
            None => {
                let mut prefix = [0u8; LEN_PREFIX_LEN];
                self.stream.read_exact(&mut prefix).await?;
                let body_len = u32::from_le_bytes(prefix);
                if body_len == 0 || body_len > MAX_BODY_LEN {
                    return Err(Error::MalformedFrame);
                }
                let mut body = vec![0u8; body_len as usize];
                self.stream.read_exact(&mut body).await?;
                Ok(Frame::parse_body(&body)?)
            }
            Some(session) => {
                let body =
                    read_sealed(&mut self.stream, &mut session.inbound)
                        .await?;
                Ok(Frame::parse_body(&body)?)
            }
        }
    }
}

/// Read and open one sealed frame body from `reader`.
async fn read_sealed<R: AsyncRead + Unpin>(
    reader: &mut R,
    sub: &mut SubSession,
) -> Result<Vec<u8>, Error> {
    let mut prefix = [0u8; LEN_PREFIX_LEN];
    reader.read_exact(&mut prefix).await?;

    let body_len = sub.open_len(&prefix);
    if body_len == 0 || body_len > MAX_BODY_LEN {
        return Err(Error::AeadFailure);
    }

    let mut sealed = vec![0u8; LEN_PREFIX_LEN + body_len as usize + TAG_LEN];
    sealed[..LEN_PREFIX_LEN].copy_from_slice(&prefix);
    reader.read_exact(&mut sealed[LEN_PREFIX_LEN..]).await?;

    sub.open(&sealed).map_err(|_| Error::AeadFailure)
}

/// An established, mutually-authenticated connection.
#[derive(Debug)]
pub struct Connection<S> {
    reader: ConnectionReader<ReadHalf<S>>,
    writer: ConnectionWriter<WriteHalf<S>>,
    peer: IdentityPubKey,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    fn new(
        stream: S,
        session: Session,
        peer: IdentityPubKey,
        config: &Config,
    ) -> Self {
        let (read_half, write_half) = io::split(stream);
        Self {
            reader: ConnectionReader {
                inner: read_half,
                sub: session.inbound,
                idle_timeout: config.idle_timeout,
            },
            writer: ConnectionWriter {
                inner: write_half,
                sub: session.outbound,
            },
            peer,
        }
    }

    /// The identity key the peer proved possession of.
    pub fn peer_identity(&self) -> IdentityPubKey {
        self.peer
    }

    /// Split into independently-owned halves for concurrent read/write.
    pub fn into_split(
        self,
    ) -> (ConnectionReader<ReadHalf<S>>, ConnectionWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }

    pub async fn send(
        &mut self,
        msg_id: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.writer.send(msg_id, payload).await
    }

    pub async fn recv(&mut self) -> Result<Option<(u32, Bytes)>, Error> {
        self.reader.recv().await
    }

    pub async fn send_disconnect(&mut self) -> Result<(), Error> {
        self.writer.send_disconnect().await
    }
}

/// The inbound half: opens sealed frames, absorbs heartbeats and rekeys,
/// yields application payloads.
#[derive(Debug)]
pub struct ConnectionReader<R> {
    inner: R,
    sub: SubSession,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    /// Receive the next application payload. Returns `Ok(None)` on a clean
    /// `Disconnect` from the peer. Heartbeats and rekeys are handled
    /// internally. Exceeding the idle timeout (no frame of any type) is a
    /// dead peer and yields `ConnectionClosed`.
    pub async fn recv(&mut self) -> Result<Option<(u32, Bytes)>, Error> {
        loop {
            let body = match self.idle_timeout {
                Some(limit) => {
                    match timeout(
                        limit,
                        read_sealed(&mut self.inner, &mut self.sub),
                    )
                    .await
                    {
                        Ok(result) => result?,
                        Err(_elapsed) => {
                            debug!("no frames within idle limit; peer dead");
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }
                None => read_sealed(&mut self.inner, &mut self.sub).await?,
            };

            let frame = Frame::parse_body(&body)?;
            match frame.packet_type {
                PacketType::SinglePacket => {
                    return Ok(Some((frame.msg_id, frame.payload)));
                }
                PacketType::Heartbeat => {
                    trace!("heartbeat");
                }
                PacketType::AeadRekey => {
                    if frame.payload.len() != PUBLIC_KEY_LEN {
                        return Err(Error::MalformedFrame);
                    }
                    trace!("peer rekeyed; rotating inbound keys");
                    self.sub.rekey(&[]);
                }
                PacketType::Disconnect => return Ok(None),
                _ => return Err(Error::UnexpectedState(State::Established)),
            }
        }
    }
}

/// The outbound half: seals frames, enforcing the rekey policy before every
/// send.
#[derive(Debug)]
pub struct ConnectionWriter<W> {
    inner: W,
    sub: SubSession,
}

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    pub async fn send(
        &mut self,
        msg_id: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.write_frame(&Frame::single(msg_id, payload.to_vec())).await
    }

    pub async fn send_heartbeat(&mut self) -> Result<(), Error> {
        self.write_frame(&Frame::control(PacketType::Heartbeat, Bytes::new()))
            .await
    }

    pub async fn send_disconnect(&mut self) -> Result<(), Error> {
        self.write_frame(&Frame::control(PacketType::Disconnect, Bytes::new()))
            .await
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let body = frame.encode_body();
        if body.len() as u64 > u64::from(MAX_BODY_LEN) {
            return Err(Error::MalformedFrame);
        }
        self.rekey_if_needed().await?;
        let sealed = self.sub.seal(&body);
        self.inner.write_all(&sealed).await?;
        Ok(())
    }

    /// The rekey policy: rotate outbound keys *before* the next frame is
    /// sealed once a threshold is crossed. The `AeadRekey` notice itself is
    /// the last frame under the old key.
    async fn rekey_if_needed(&mut self) -> Result<(), Error> {
        if !self.sub.needs_rekey() {
            return Ok(());
        }
        debug!("outbound rekey threshold crossed");
        let notice = Frame::control(
            PacketType::AeadRekey,
            vec![0u8; PUBLIC_KEY_LEN],
        );
        let sealed = self.sub.seal(&notice.encode_body());
        self.inner.write_all(&sealed).await?;
        self.sub.rekey(&[]);
        Ok(())
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn force_bytes_since_rekey(&mut self, bytes: u64) {
        self.sub.force_bytes_since_rekey(bytes);
    }
}
