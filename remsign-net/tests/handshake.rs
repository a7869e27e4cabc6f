//! End-to-end connection scenarios over in-memory duplex streams.

use std::{sync::Arc, time::Duration};

use remsign_crypto::{identity::IdentityKeyPair, rng::FastRng};
use remsign_net::{
    accept, connect, conn::KeyPromptRequest, session::REKEY_BYTES, Config,
    CookieMode, Error, PeerStore,
};
use tokio::{io::DuplexStream, sync::mpsc};

const BUF: usize = 64 * 1024;

fn identity(seed: u64) -> Arc<IdentityKeyPair> {
    Arc::new(IdentityKeyPair::from_rng(&mut FastRng::from_u64(seed)))
}

struct TestNet {
    client_id: Arc<IdentityKeyPair>,
    server_id: Arc<IdentityKeyPair>,
    client_store: Arc<PeerStore>,
    server_store: Arc<PeerStore>,
}

impl TestNet {
    /// Both sides with each other's keys pinned under matching names.
    fn mutual() -> Self {
        let client_id = identity(1);
        let server_id = identity(2);

        let client_store = Arc::new(PeerStore::ephemeral());
        client_store.add("signer:a", server_id.public()).unwrap();
        let server_store = Arc::new(PeerStore::ephemeral());
        server_store.add("terminal:1", client_id.public()).unwrap();

        Self {
            client_id,
            server_id,
            client_store,
            server_store,
        }
    }

    fn client_config(&self) -> Config {
        Config::new(self.client_id.clone(), self.client_store.clone())
    }

    fn server_config(&self) -> Config {
        Config::new(self.server_id.clone(), self.server_store.clone())
    }

    fn streams(&self) -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(BUF)
    }
}

#[tokio::test]
async fn happy_handshake_roundtrips_one_mib() {
    let net = TestNet::mutual();
    let (client_stream, server_stream) = net.streams();

    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    let mut client = client.unwrap();
    let mut server = server.unwrap();

    // The pinned key equals the key actually used by the responder, and
    // vice versa.
    assert_eq!(client.peer_identity(), net.server_id.public());
    assert_eq!(server.peer_identity(), net.client_id.public());

    // A 1 MiB payload survives the established session unchanged.
    let payload: Vec<u8> =
        (0..1024 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    let expected = payload.clone();
    let (sent, received) = tokio::join!(
        async { client.send(7, &payload).await },
        async { server.recv().await },
    );
    sent.unwrap();
    let (msg_id, body) = received.unwrap().expect("not a disconnect");
    assert_eq!(msg_id, 7);
    assert_eq!(&body[..], &expected[..]);

    // And the reverse direction.
    let (sent, received) = tokio::join!(
        async { server.send(8, b"pong").await },
        async { client.recv().await },
    );
    sent.unwrap();
    assert_eq!(received.unwrap(), Some((8, bytes::Bytes::from("pong"))));
}

#[tokio::test]
async fn rotated_server_key_prompts_and_repins() {
    let net = TestNet::mutual();
    // The client still pins the server's *old* key.
    let old_key = identity(77).public();
    net.client_store.add("signer:a", old_key).unwrap();

    let (prompt_tx, mut prompt_rx) = mpsc::channel::<KeyPromptRequest>(1);
    let prompt_consumer = tokio::spawn(async move {
        let request = prompt_rx.recv().await.expect("prompt must be raised");
        let prompt = request.prompt.clone();
        request.answer.send(true).expect("driver is waiting");
        prompt
    });

    let (client_stream, server_stream) = net.streams();
    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            Some(prompt_tx),
        ),
        accept(server_stream, net.server_config()),
    );
    client.unwrap();
    server.unwrap();

    let prompt = prompt_consumer.await.unwrap();
    assert_eq!(prompt.peer_name, "signer:a");
    assert_eq!(prompt.old_key, Some(old_key));
    assert_eq!(prompt.new_key, net.server_id.public());

    // The store now pins the new key; the old one is forgotten.
    assert_eq!(
        net.client_store.lookup("signer:a"),
        Some(net.server_id.public()),
    );
}

#[tokio::test]
async fn unknown_server_key_without_consumer_is_rejected() {
    let net = TestNet::mutual();
    net.client_store.remove("signer:a").unwrap();

    let (client_stream, server_stream) = net.streams();
    let (client, _server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    assert_eq!(client.unwrap_err(), Error::UnknownPeerKey);
}

#[tokio::test]
async fn rejected_propose_closes_server_with_unknown_peer_key() {
    let net = TestNet::mutual();
    // The server does not know the client.
    net.server_store.remove("terminal:1").unwrap();

    let (client_stream, server_stream) = net.streams();
    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );

    // The server sent a garbage challenge, verified the reply, and closed.
    assert_eq!(server.unwrap_err(), Error::UnknownPeerKey);
    // The client recognized the garbage challenge after replying.
    assert_eq!(client.unwrap_err(), Error::SignatureInvalid);
}

#[tokio::test]
async fn cookie_with_wrong_key_closes_without_prompting() {
    let net = TestNet::mutual();
    let dir = tempfile::tempdir().unwrap();
    let cookie_path = dir.path().join("signer.cookie");
    remsign_net::cookie::write_cookie(&cookie_path, &identity(88).public())
        .unwrap();

    // A prompt consumer is wired up but must never be consulted.
    let (prompt_tx, mut prompt_rx) = mpsc::channel::<KeyPromptRequest>(1);

    let (client_stream, server_stream) = net.streams();
    let cookie_mode = CookieMode::ReadServerCookie(cookie_path);
    let (client, _server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &cookie_mode,
            Some(prompt_tx),
        ),
        accept(server_stream, net.server_config()),
    );

    assert_eq!(client.unwrap_err(), Error::UnknownPeerKey);
    assert!(prompt_rx.try_recv().is_err(), "no prompt may be raised");
}

#[tokio::test]
async fn cookie_with_right_key_pins_without_peer_store() {
    let net = TestNet::mutual();
    // Client peer store knows nothing; only the cookie pins the server.
    net.client_store.remove("signer:a").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cookie_path = dir.path().join("signer.cookie");
    remsign_net::cookie::write_cookie(&cookie_path, &net.server_id.public())
        .unwrap();

    let (client_stream, server_stream) = net.streams();
    let cookie_mode = CookieMode::ReadServerCookie(cookie_path);
    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &cookie_mode,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    client.unwrap();
    server.unwrap();
}

#[tokio::test]
async fn missing_cookie_fails_before_any_traffic() {
    let net = TestNet::mutual();
    let dir = tempfile::tempdir().unwrap();
    let cookie_path = dir.path().join("absent.cookie");

    let (client_stream, _server_stream) = net.streams();
    let result = connect(
        client_stream,
        net.client_config(),
        "signer:a",
        &CookieMode::ReadServerCookie(cookie_path),
        None,
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::CookieMissing);
}

#[tokio::test]
async fn byte_threshold_rekeys_before_next_frame() {
    let net = TestNet::mutual();
    let (client_stream, server_stream) = net.streams();

    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    let client = client.unwrap();
    let server = server.unwrap();

    let (_client_reader, mut client_writer) = client.into_split();
    let (mut server_reader, _server_writer) = server.into_split();

    // Pretend a full 1 GiB already went out under the current key. The next
    // send must rotate keys first, and the receiver must follow the rekey
    // notice transparently.
    client_writer.force_bytes_since_rekey(REKEY_BYTES);
    let (sent, received) = tokio::join!(
        async { client_writer.send(1, b"fresh keys").await },
        async { server_reader.recv().await },
    );
    sent.unwrap();
    assert_eq!(
        received.unwrap(),
        Some((1, bytes::Bytes::from("fresh keys"))),
    );
}

#[tokio::test]
async fn disconnect_yields_none_not_error() {
    let net = TestNet::mutual();
    let (client_stream, server_stream) = net.streams();

    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    let mut client = client.unwrap();
    let mut server = server.unwrap();

    let (sent, received) = tokio::join!(
        async { client.send_disconnect().await },
        async { server.recv().await },
    );
    sent.unwrap();
    assert_eq!(received.unwrap(), None);
}

#[tokio::test]
async fn heartbeats_are_absorbed() {
    let net = TestNet::mutual();
    let (client_stream, server_stream) = net.streams();

    let (client, server) = tokio::join!(
        connect(
            client_stream,
            net.client_config(),
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    let client = client.unwrap();
    let mut server = server.unwrap();

    let (_client_reader, mut client_writer) = client.into_split();
    let (sent, received) = tokio::join!(
        async {
            client_writer.send_heartbeat().await?;
            client_writer.send_heartbeat().await?;
            client_writer.send(9, b"after heartbeats").await
        },
        async { server.recv().await },
    );
    sent.unwrap();
    assert_eq!(
        received.unwrap(),
        Some((9, bytes::Bytes::from("after heartbeats"))),
    );
}

#[tokio::test]
async fn silent_peer_is_declared_dead() {
    let net = TestNet::mutual();
    let (client_stream, server_stream) = net.streams();

    let mut client_config = net.client_config();
    client_config.idle_timeout = Some(Duration::from_millis(50));

    let (client, server) = tokio::join!(
        connect(
            client_stream,
            client_config,
            "signer:a",
            &CookieMode::NotUsed,
            None,
        ),
        accept(server_stream, net.server_config()),
    );
    let mut client = client.unwrap();
    let _server = server.unwrap();

    // The server never sends anything; after 3H of silence the peer is dead.
    assert_eq!(client.recv().await.unwrap_err(), Error::ConnectionClosed);
}

#[tokio::test]
async fn handshake_timeout_fires() {
    let net = TestNet::mutual();
    let (client_stream, _server_stream) = net.streams();

    let mut config = net.client_config();
    config.handshake_timeout = Duration::from_millis(50);

    // Nobody answers on the other end.
    let result = connect(
        client_stream,
        config,
        "signer:a",
        &CookieMode::NotUsed,
        None,
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::HandshakeTimeout);
}
