//! The mutually-authenticated handshake state machine.
//!
//! Ten messages establish a connection (six of them authenticated):
//!
//! ```text
//! initiator                                 responder
//!     | -- AeadSetup ------------------------> |   clear
//!     | <----------------- AeadPresentPubKey - |   clear, identity key
//!     | -- AeadEncInit ----------------------> |   clear, eph key + suite
//!     | <--------------------- AeadEncAck ---- |   clear, eph key
//!     |        (AEAD session live; everything below is sealed)
//!     | -- AuthChallenge --------------------> |   H("i"|sid_out|resp_key)
//!     | <----------------------- AuthReply --- |   responder's signature
//!     | -- AuthPropose ----------------------> |   H("p"|sid_in|init_key)
//!     | <------------------- AuthChallenge --- |   H("i"|sid_out|init_key)
//!     | -- AuthReply ------------------------> |   initiator's signature
//!     |        (both rekey, keyed to the authenticated identities)
//! ```
//!
//! The machine is sans-I/O: the connection driver feeds it plaintext frames
//! (opening sealed ones first) and executes the [`Action`]s it returns. Any
//! out-of-order message or failed verification moves the machine to
//! [`State::Closed`]; there is no partial-trust state.
//!
//! Two deliberate subtleties:
//!
//! - If the initiator proposes an identity the responder does not know, the
//!   responder still sends a *garbage* challenge and verifies the eventual
//!   reply before closing, so a probing client cannot distinguish "unknown
//!   key" from "bad signature" by timing.
//! - If the responder presents a key the initiator has not pinned, the
//!   machine pauses and surfaces [`Action::PromptKey`]; the consumer answers
//!   via [`Handshake::resolve_prompt`]. In cookie mode there is no prompt:
//!   the cookie key is the only acceptable one.

use std::sync::Arc;

use bytes::Bytes;
use remsign_crypto::{
    identity::{
        challenge_hash, AuthSignature, IdentityKeyPair, IdentityPubKey,
        PUBLIC_KEY_LEN,
    },
    kdf::{EphemeralKey, SESSION_ID_LEN},
    rng::Crng,
};
use remsign_wire::{Frame, PacketType};
use secp256k1::PublicKey;
use tracing::debug;

use crate::{
    error::Error,
    peers::PeerStore,
    session::{Role, Session},
};

/// The only cipher suite on the table.
pub const CIPHER_SUITE_CHACHA20_POLY1305_OPENSSH: u8 = 0x00;

/// `AeadEncInit` payload: 33-byte ephemeral key + 1 suite byte.
pub const ENC_INIT_LEN: usize = PUBLIC_KEY_LEN + 1;

pub const CHALLENGE_LEN: usize = 32;

/// Handshake states. `Established` and `Closed` are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Fresh,
    AwaitingServerKey,
    AwaitingEncInit,
    AwaitingEncAck,
    AwaitingAuthChallenge,
    AwaitingAuthReply,
    AwaitingAuthPropose,
    AwaitingAuthChallenge2,
    AwaitingAuthReply2,
    Established,
    Closed,
}

/// Raised when the responder presents a key the initiator has not pinned for
/// the expected peer name. The consumer must answer accept (pin it, resume)
/// or reject (close with `UnknownPeerKey`); there is no third option.
#[derive(Clone, Debug)]
pub struct KeyPrompt {
    pub peer_name: String,
    pub old_key: Option<IdentityPubKey>,
    pub new_key: IdentityPubKey,
}

/// Instructions for the connection driver, executed in order.
#[derive(Debug)]
pub enum Action {
    /// Write this frame unencrypted.
    SendClear(Frame),
    /// Seal this frame under the outbound sub-session, then write it.
    SendSealed(Frame),
    /// The AEAD session is derived; the driver takes ownership. All reads
    /// after this point are sealed.
    SessionReady(Session),
    /// Rekey both sub-sessions, mixing the authenticated identity keys into
    /// the derivation.
    RekeyEstablished {
        initiator_key: IdentityPubKey,
        responder_key: IdentityPubKey,
    },
    /// Pause: surface the prompt to the consumer, then call
    /// [`Handshake::resolve_prompt`].
    PromptKey(KeyPrompt),
    /// Handshake complete; the peer's identity is authenticated.
    Established { peer: IdentityPubKey },
    /// Send any frames queued before this, then close with the error.
    Close(Error),
}

pub struct Handshake<R: Crng> {
    role: Role,
    state: State,
    identity: Arc<IdentityKeyPair>,
    peer_store: Arc<PeerStore>,
    rng: R,

    /// Initiator: the peer-store name the responder key is pinned under.
    expected_peer: Option<String>,
    /// Initiator: cookie-pinned responder key, overriding the peer store.
    cookie_pin: Option<IdentityPubKey>,
    /// Initiator: responder key awaiting an accept/reject answer.
    prompt_pending: Option<IdentityPubKey>,

    eph: Option<EphemeralKey>,
    remote_identity: Option<IdentityPubKey>,
    session_id_in: Option<[u8; SESSION_ID_LEN]>,
    session_id_out: Option<[u8; SESSION_ID_LEN]>,
    /// The challenge hash whose signature we are waiting for.
    sent_challenge: Option<[u8; CHALLENGE_LEN]>,
    /// Responder: the propose named a key outside our authorised set. We
    /// keep going (garbage challenge) but refuse to establish.
    rejected: bool,
}

impl<R: Crng> Handshake<R> {
    pub fn initiator(
        identity: Arc<IdentityKeyPair>,
        peer_store: Arc<PeerStore>,
        expected_peer: impl Into<String>,
        cookie_pin: Option<IdentityPubKey>,
        rng: R,
    ) -> Self {
        Self::new(
            Role::Initiator,
            identity,
            peer_store,
            Some(expected_peer.into()),
            cookie_pin,
            rng,
        )
    }

    pub fn responder(
        identity: Arc<IdentityKeyPair>,
        peer_store: Arc<PeerStore>,
        rng: R,
    ) -> Self {
        Self::new(Role::Responder, identity, peer_store, None, None, rng)
    }

    fn new(
        role: Role,
        identity: Arc<IdentityKeyPair>,
        peer_store: Arc<PeerStore>,
        expected_peer: Option<String>,
        cookie_pin: Option<IdentityPubKey>,
        rng: R,
    ) -> Self {
        Self {
            role,
            state: State::Fresh,
            identity,
            peer_store,
            rng,
            expected_peer,
            cookie_pin,
            prompt_pending: None,
            eph: None,
            remote_identity: None,
            session_id_in: None,
            session_id_out: None,
            sent_challenge: None,
            rejected: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// The authenticated peer identity; `Some` only once established (or,
    /// on the initiator, once the responder's key has been accepted).
    pub fn remote_identity(&self) -> Option<IdentityPubKey> {
        self.remote_identity
    }

    /// Kick off the handshake. The initiator sends `AeadSetup`; the
    /// responder waits.
    pub fn start(&mut self) -> Vec<Action> {
        match self.role {
            Role::Initiator => {
                self.state = State::AwaitingServerKey;
                vec![Action::SendClear(Frame::control(
                    PacketType::AeadSetup,
                    Bytes::new(),
                ))]
            }
            Role::Responder => Vec::new(),
        }
    }

    /// Feed one plaintext frame (the driver opens sealed ones first).
    pub fn on_frame(&mut self, frame: Frame) -> Result<Vec<Action>, Error> {
        use PacketType as P;
        use State as S;

        // A Disconnect is honored in any state.
        if frame.packet_type == P::Disconnect {
            self.state = S::Closed;
            return Err(Error::ConnectionClosed);
        }

        let result = match (self.role, self.state, frame.packet_type) {
            (Role::Responder, S::Fresh, P::AeadSetup) =>
                self.on_setup(&frame.payload),
            (Role::Initiator, S::AwaitingServerKey, P::AeadPresentPubKey) =>
                self.on_present_pubkey(&frame.payload),
            (Role::Responder, S::AwaitingEncInit, P::AeadEncInit) =>
                self.on_enc_init(&frame.payload),
            (Role::Initiator, S::AwaitingEncAck, P::AeadEncAck) =>
                self.on_enc_ack(&frame.payload),
            (Role::Responder, S::AwaitingAuthChallenge, P::AuthChallenge) =>
                self.on_auth_challenge(&frame.payload),
            (Role::Initiator, S::AwaitingAuthReply, P::AuthReply) =>
                self.on_auth_reply(&frame.payload),
            (Role::Responder, S::AwaitingAuthPropose, P::AuthPropose) =>
                self.on_auth_propose(&frame.payload),
            (Role::Initiator, S::AwaitingAuthChallenge2, P::AuthChallenge) =>
                self.on_auth_challenge2(&frame.payload),
            (Role::Responder, S::AwaitingAuthReply2, P::AuthReply) =>
                self.on_auth_reply2(&frame.payload),
            (_, state, _) => Err(Error::UnexpectedState(state)),
        };

        if result.is_err() {
            self.state = State::Closed;
        }
        result
    }

    /// Answer an outstanding [`Action::PromptKey`].
    pub fn resolve_prompt(
        &mut self,
        accept: bool,
    ) -> Result<Vec<Action>, Error> {
        let new_key = match self.prompt_pending.take() {
            Some(key) => key,
            None => {
                let state = self.state;
                self.state = State::Closed;
                return Err(Error::UnexpectedState(state));
            }
        };

        if !accept {
            self.state = State::Closed;
            return Err(Error::UnknownPeerKey);
        }

        let name = self
            .expected_peer
            .clone()
            .expect("prompts only occur on the initiator");
        // Pin the new key; any old key for this name is replaced.
        self.peer_store
            .add(&name, new_key)
            .map_err(|_| Error::UnknownPeerKey)?;
        debug!(peer = %name, key = %new_key.fingerprint(), "pinned new peer key");

        self.accept_responder_key(new_key)
    }

    // --- responder steps --- //

    fn on_setup(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        if !payload.is_empty() {
            return Err(Error::MalformedFrame);
        }
        self.state = State::AwaitingEncInit;
        let key = self.identity.public().serialize();
        Ok(vec![Action::SendClear(Frame::control(
            PacketType::AeadPresentPubKey,
            key.to_vec(),
        ))])
    }

    fn on_enc_init(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        if payload.len() != ENC_INIT_LEN {
            return Err(Error::MalformedFrame);
        }
        let (key_bytes, suite) = payload.split_at(PUBLIC_KEY_LEN);
        if suite[0] != CIPHER_SUITE_CHACHA20_POLY1305_OPENSSH {
            return Err(Error::MalformedFrame);
        }
        let remote_eph = PublicKey::from_slice(key_bytes)
            .map_err(|_| Error::MalformedFrame)?;

        let eph = EphemeralKey::from_rng(&mut self.rng);
        let eph_pub = eph.public_bytes();
        let shared = eph.agree(&remote_eph);
        let session = self.install_session(&shared);

        self.state = State::AwaitingAuthChallenge;
        Ok(vec![
            Action::SessionReady(session),
            Action::SendClear(Frame::control(
                PacketType::AeadEncAck,
                eph_pub.to_vec(),
            )),
        ])
    }

    fn on_auth_challenge(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        let challenge = parse_challenge(payload)?;
        let expected = challenge_hash(
            b'i',
            self.session_id_in(),
            &self.identity.public(),
        );
        if challenge != expected {
            return Err(Error::SignatureInvalid);
        }

        let sig = self.identity.sign_challenge(&challenge);
        self.state = State::AwaitingAuthPropose;
        Ok(vec![Action::SendSealed(Frame::control(
            PacketType::AuthReply,
            sig.serialize().to_vec(),
        ))])
    }

    fn on_auth_propose(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        let propose = parse_challenge(payload)?;
        let sid_out = *self.session_id_out();

        // Which authorised key is the initiator claiming?
        let matched = self.peer_store.peers().into_values().find(|key| {
            challenge_hash(b'p', &sid_out, key) == propose
        });

        let challenge = match matched {
            Some(key) => {
                self.remote_identity = Some(key);
                challenge_hash(b'i', &sid_out, &key)
            }
            None => {
                // Unknown key: send garbage so the timing of this step does
                // not reveal membership of the authorised set. We will close
                // after the reply arrives.
                self.rejected = true;
                self.rng.gen_bytes()
            }
        };

        self.sent_challenge = Some(challenge);
        self.state = State::AwaitingAuthReply2;
        Ok(vec![Action::SendSealed(Frame::control(
            PacketType::AuthChallenge,
            challenge.to_vec(),
        ))])
    }

    fn on_auth_reply2(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        let sig = AuthSignature::from_bytes(payload)
            .map_err(|_| Error::MalformedFrame)?;
        let challenge = self
            .sent_challenge
            .take()
            .expect("AwaitingAuthReply2 implies a challenge was sent");

        // Verify against our own key on the rejected path so the work done
        // (and thus the close timing) matches the genuine-verification path.
        let verify_key = if self.rejected {
            self.identity.public()
        } else {
            self.remote_identity
                .expect("accepted propose stored the key")
        };
        let verified = verify_key.verify_challenge(&challenge, &sig);

        if self.rejected {
            return Err(Error::UnknownPeerKey);
        }
        verified.map_err(|_| Error::SignatureInvalid)?;

        self.state = State::Established;
        let peer = verify_key;
        debug!(peer = %peer.fingerprint(), "responder handshake complete");
        Ok(vec![
            Action::RekeyEstablished {
                initiator_key: peer,
                responder_key: self.identity.public(),
            },
            Action::Established { peer },
        ])
    }

    // --- initiator steps --- //

    fn on_present_pubkey(
        &mut self,
        payload: &[u8],
    ) -> Result<Vec<Action>, Error> {
        let key = IdentityPubKey::from_bytes(payload)
            .map_err(|_| Error::MalformedFrame)?;

        // Cookie mode: the cookie key is the only acceptable one, and a
        // mismatch is fatal without consulting the user or the peer store.
        if let Some(pinned) = self.cookie_pin {
            if key != pinned {
                return Err(Error::UnknownPeerKey);
            }
            return self.accept_responder_key(key);
        }

        let name = self
            .expected_peer
            .as_deref()
            .expect("initiator always has an expected peer name");
        match self.peer_store.lookup(name) {
            Some(pinned) if pinned == key => self.accept_responder_key(key),
            old_key => {
                // Unknown or rotated key: pause and ask.
                self.prompt_pending = Some(key);
                Ok(vec![Action::PromptKey(KeyPrompt {
                    peer_name: name.to_owned(),
                    old_key,
                    new_key: key,
                })])
            }
        }
    }

    fn accept_responder_key(
        &mut self,
        key: IdentityPubKey,
    ) -> Result<Vec<Action>, Error> {
        self.remote_identity = Some(key);

        let eph = EphemeralKey::from_rng(&mut self.rng);
        let mut payload = eph.public_bytes().to_vec();
        payload.push(CIPHER_SUITE_CHACHA20_POLY1305_OPENSSH);
        self.eph = Some(eph);

        self.state = State::AwaitingEncAck;
        Ok(vec![Action::SendClear(Frame::control(
            PacketType::AeadEncInit,
            payload,
        ))])
    }

    fn on_enc_ack(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        if payload.len() != PUBLIC_KEY_LEN {
            return Err(Error::MalformedFrame);
        }
        let remote_eph = PublicKey::from_slice(payload)
            .map_err(|_| Error::MalformedFrame)?;
        let eph = self
            .eph
            .take()
            .expect("AwaitingEncAck implies we sent an EncInit");
        let shared = eph.agree(&remote_eph);
        let session = self.install_session(&shared);

        let responder_key = self
            .remote_identity
            .expect("responder key accepted before EncInit");
        let challenge = challenge_hash(
            b'i',
            self.session_id_out(),
            &responder_key,
        );
        self.sent_challenge = Some(challenge);

        self.state = State::AwaitingAuthReply;
        Ok(vec![
            Action::SessionReady(session),
            Action::SendSealed(Frame::control(
                PacketType::AuthChallenge,
                challenge.to_vec(),
            )),
        ])
    }

    fn on_auth_reply(&mut self, payload: &[u8]) -> Result<Vec<Action>, Error> {
        let sig = AuthSignature::from_bytes(payload)
            .map_err(|_| Error::MalformedFrame)?;
        let challenge = self
            .sent_challenge
            .take()
            .expect("AwaitingAuthReply implies a challenge was sent");
        let responder_key = self
            .remote_identity
            .expect("responder key accepted before EncInit");

        responder_key
            .verify_challenge(&challenge, &sig)
            .map_err(|_| Error::SignatureInvalid)?;

        let propose = challenge_hash(
            b'p',
            self.session_id_in(),
            &self.identity.public(),
        );
        self.state = State::AwaitingAuthChallenge2;
        Ok(vec![Action::SendSealed(Frame::control(
            PacketType::AuthPropose,
            propose.to_vec(),
        ))])
    }

    fn on_auth_challenge2(
        &mut self,
        payload: &[u8],
    ) -> Result<Vec<Action>, Error> {
        let challenge = parse_challenge(payload)?;
        let expected = challenge_hash(
            b'i',
            self.session_id_in(),
            &self.identity.public(),
        );

        // Sign and reply even if the challenge is not the expected
        // construction (the responder sends garbage when it rejected our
        // propose); it will close on us either way.
        let sig = self.identity.sign_challenge(&challenge);
        let reply = Action::SendSealed(Frame::control(
            PacketType::AuthReply,
            sig.serialize().to_vec(),
        ));

        if challenge != expected {
            return Ok(vec![reply, Action::Close(Error::SignatureInvalid)]);
        }

        self.state = State::Established;
        let responder_key = self
            .remote_identity
            .expect("responder key accepted before EncInit");
        debug!(
            peer = %responder_key.fingerprint(),
            "initiator handshake complete",
        );
        Ok(vec![
            reply,
            Action::RekeyEstablished {
                initiator_key: self.identity.public(),
                responder_key,
            },
            Action::Established { peer: responder_key },
        ])
    }

    // --- shared --- //

    fn install_session(&mut self, shared_secret: &[u8; 32]) -> Session {
        let session = Session::derive(shared_secret, self.role);
        self.session_id_in = Some(*session.inbound.session_id());
        self.session_id_out = Some(*session.outbound.session_id());
        session
    }

    fn session_id_in(&self) -> &[u8; SESSION_ID_LEN] {
        self.session_id_in
            .as_ref()
            .expect("session derived before auth phase")
    }

    fn session_id_out(&self) -> &[u8; SESSION_ID_LEN] {
        self.session_id_out
            .as_ref()
            .expect("session derived before auth phase")
    }
}

fn parse_challenge(payload: &[u8]) -> Result<[u8; CHALLENGE_LEN], Error> {
    payload.try_into().map_err(|_| Error::MalformedFrame)
}

#[cfg(test)]
mod test {
    use remsign_crypto::rng::FastRng;

    use super::*;

    fn identity(seed: u64) -> Arc<IdentityKeyPair> {
        Arc::new(IdentityKeyPair::from_rng(&mut FastRng::from_u64(seed)))
    }

    struct Pair {
        initiator: Handshake<FastRng>,
        responder: Handshake<FastRng>,
    }

    /// Both sides with each other's keys pinned.
    fn mutual_pair() -> Pair {
        let init_id = identity(1);
        let resp_id = identity(2);

        let init_store = Arc::new(PeerStore::ephemeral());
        init_store.add("signer:a", resp_id.public()).unwrap();
        let resp_store = Arc::new(PeerStore::ephemeral());
        resp_store.add("terminal", init_id.public()).unwrap();

        Pair {
            initiator: Handshake::initiator(
                init_id,
                init_store,
                "signer:a",
                None,
                FastRng::from_u64(10),
            ),
            responder: Handshake::responder(
                resp_id,
                resp_store,
                FastRng::from_u64(11),
            ),
        }
    }

    #[derive(Default)]
    struct PumpResult {
        initiator_err: Option<Error>,
        responder_err: Option<Error>,
    }

    /// Pump actions between the two machines until both go quiet. Sealing is
    /// skipped: the machines exchange plaintext frames directly, which is
    /// exactly what they see from the real driver. A side that fails stops
    /// consuming but its already-queued frames still deliver, mirroring
    /// frames in flight on a real stream.
    fn pump(pair: &mut Pair) -> PumpResult {
        let mut to_responder: Vec<Frame> = Vec::new();
        let mut to_initiator: Vec<Frame> = Vec::new();
        let mut result = PumpResult::default();

        for action in pair.initiator.start() {
            collect(action, &mut to_responder);
        }

        for _round in 0..16 {
            if to_responder.is_empty() && to_initiator.is_empty() {
                break;
            }
            for frame in std::mem::take(&mut to_responder) {
                if result.responder_err.is_some() {
                    break;
                }
                match pair.responder.on_frame(frame) {
                    Ok(actions) =>
                        for action in actions {
                            if let Err(err) =
                                collect_checked(action, &mut to_initiator)
                            {
                                result.responder_err = Some(err);
                            }
                        },
                    Err(err) => result.responder_err = Some(err),
                }
            }
            for frame in std::mem::take(&mut to_initiator) {
                if result.initiator_err.is_some() {
                    break;
                }
                match pair.initiator.on_frame(frame) {
                    Ok(actions) =>
                        for action in actions {
                            if let Err(err) =
                                collect_checked(action, &mut to_responder)
                            {
                                result.initiator_err = Some(err);
                            }
                        },
                    Err(err) => result.initiator_err = Some(err),
                }
            }
        }
        result
    }

    fn collect(action: Action, out: &mut Vec<Frame>) {
        collect_checked(action, out).expect("unexpected Close action");
    }

    fn collect_checked(
        action: Action,
        out: &mut Vec<Frame>,
    ) -> Result<(), Error> {
        match action {
            Action::SendClear(frame) | Action::SendSealed(frame) =>
                out.push(frame),
            Action::SessionReady(_)
            | Action::RekeyEstablished { .. }
            | Action::Established { .. }
            | Action::PromptKey(_) => {}
            Action::Close(err) => return Err(err),
        }
        Ok(())
    }

    #[test]
    fn happy_path_establishes_both_sides() {
        let mut pair = mutual_pair();
        let result = pump(&mut pair);
        assert_eq!(result.initiator_err, None);
        assert_eq!(result.responder_err, None);

        assert!(pair.initiator.is_established());
        assert!(pair.responder.is_established());
        assert_eq!(
            pair.initiator.remote_identity(),
            Some(pair.responder.identity.public()),
        );
        assert_eq!(
            pair.responder.remote_identity(),
            Some(pair.initiator.identity.public()),
        );
    }

    #[test]
    fn single_packet_during_handshake_is_unexpected_state() {
        let mut pair = mutual_pair();

        // Drive the responder to AwaitingAuthChallenge.
        let setup = Frame::control(PacketType::AeadSetup, Bytes::new());
        pair.responder.on_frame(setup).unwrap();
        let enc_init = {
            let eph = EphemeralKey::from_rng(&mut FastRng::from_u64(3));
            let mut payload = eph.public_bytes().to_vec();
            payload.push(CIPHER_SUITE_CHACHA20_POLY1305_OPENSSH);
            Frame::control(PacketType::AeadEncInit, payload)
        };
        pair.responder.on_frame(enc_init).unwrap();
        assert_eq!(pair.responder.state(), State::AwaitingAuthChallenge);

        let err = pair
            .responder
            .on_frame(Frame::single(1, vec![0u8; 8]))
            .unwrap_err();
        assert_eq!(
            err,
            Error::UnexpectedState(State::AwaitingAuthChallenge),
        );
        assert_eq!(pair.responder.state(), State::Closed);
    }

    #[test]
    fn out_of_order_handshake_message_closes() {
        let mut pair = mutual_pair();
        // AuthChallenge before anything else.
        let err = pair
            .responder
            .on_frame(Frame::control(
                PacketType::AuthChallenge,
                vec![0u8; CHALLENGE_LEN],
            ))
            .unwrap_err();
        assert_eq!(err, Error::UnexpectedState(State::Fresh));
    }

    #[test]
    fn unknown_propose_closes_with_unknown_peer_key() {
        let mut pair = mutual_pair();
        // The responder no longer knows the initiator.
        pair.responder.peer_store.remove("terminal").unwrap();

        let result = pump(&mut pair);
        // The responder still sent a (garbage) challenge and verified the
        // reply before rejecting.
        assert_eq!(result.responder_err, Some(Error::UnknownPeerKey));
        assert_eq!(pair.responder.state(), State::Closed);
        // The initiator noticed the challenge was not the expected
        // construction and gave up after replying.
        assert_eq!(result.initiator_err, Some(Error::SignatureInvalid));
        assert!(!pair.initiator.is_established());
    }

    #[test]
    fn unknown_responder_key_prompts_and_accept_resumes() {
        let mut pair = mutual_pair();
        // Simulate a rotated server key: re-pin the wrong key client-side.
        let stale = identity(99).public();
        pair.initiator.peer_store.add("signer:a", stale).unwrap();

        // Manually walk the first exchange to catch the prompt.
        let mut to_responder = Vec::new();
        for action in pair.initiator.start() {
            collect(action, &mut to_responder);
        }
        let present = pair
            .responder
            .on_frame(to_responder.remove(0))
            .unwrap()
            .into_iter()
            .find_map(|a| match a {
                Action::SendClear(f) => Some(f),
                _ => None,
            })
            .unwrap();

        let actions = pair.initiator.on_frame(present).unwrap();
        let prompt = match &actions[..] {
            [Action::PromptKey(prompt)] => prompt.clone(),
            _ => panic!("expected exactly one PromptKey action"),
        };
        assert_eq!(prompt.peer_name, "signer:a");
        assert_eq!(prompt.old_key, Some(stale));

        // Accept: the new key is pinned and the handshake resumes.
        let resumed = pair.initiator.resolve_prompt(true).unwrap();
        assert!(matches!(resumed[..], [Action::SendClear(_)]));
        assert_eq!(
            pair.initiator.peer_store.lookup("signer:a"),
            Some(prompt.new_key),
        );
    }

    #[test]
    fn unknown_responder_key_reject_closes() {
        let mut pair = mutual_pair();
        pair.initiator.peer_store.remove("signer:a").unwrap();

        let mut to_responder = Vec::new();
        for action in pair.initiator.start() {
            collect(action, &mut to_responder);
        }
        let present = pair
            .responder
            .on_frame(to_responder.remove(0))
            .unwrap()
            .into_iter()
            .find_map(|a| match a {
                Action::SendClear(f) => Some(f),
                _ => None,
            })
            .unwrap();
        let actions = pair.initiator.on_frame(present).unwrap();
        assert!(matches!(actions[..], [Action::PromptKey(_)]));

        let err = pair.initiator.resolve_prompt(false).unwrap_err();
        assert_eq!(err, Error::UnknownPeerKey);
        assert_eq!(pair.initiator.state(), State::Closed);
    }

    #[test]
    fn cookie_pin_mismatch_closes_without_prompt() {
        let resp_id = identity(2);
        let wrong_key = identity(50).public();

        let mut initiator = Handshake::initiator(
            identity(1),
            Arc::new(PeerStore::ephemeral()),
            "signer:a",
            Some(wrong_key),
            FastRng::from_u64(12),
        );
        initiator.start();

        let present = Frame::control(
            PacketType::AeadPresentPubKey,
            resp_id.public().serialize().to_vec(),
        );
        let err = initiator.on_frame(present).unwrap_err();
        assert_eq!(err, Error::UnknownPeerKey);
        assert_eq!(initiator.state(), State::Closed);
    }
}
