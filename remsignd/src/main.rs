//! The headless remsign signer daemon.
//!
//! Wires the pieces together: identity key, peer store, optional cookie,
//! the TCP listener accepting terminal connections, and the single signer
//! dispatcher they all feed into. Runs without a GUI adapter; requests that
//! would need an interactive password prompt fail with `GuiDisconnected`
//! until one is attached.

use std::{
    collections::HashMap,
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use argh::FromArgs;
use remsign_crypto::{identity::IdentityKeyPair, rng::SysRng};
use remsign_net::{accept, cookie, Config, PeerStore};
use remsign_signer::{
    dispatch::{ClientId, Dispatcher, DispatcherMsg},
    wallets::testing::MemoryWalletRegistry,
};
use remsign_wire::Envelope;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::interval,
};
use tracing::{info, warn};

/// Headless remote signer daemon.
#[derive(FromArgs)]
struct Args {
    /// data directory holding the identity key, wallets and the peer store
    #[argh(option, default = "PathBuf::from(\"./signer-data\")")]
    datadir: PathBuf,

    /// listen address for terminal connections
    #[argh(option, default = "String::from(\"127.0.0.1:23456\")")]
    listen: String,

    /// peer store filename inside the data directory
    #[argh(option, default = "String::from(\"peers.store\")")]
    peers_file: String,

    /// write our identity public key to the cookie file on startup
    #[argh(switch)]
    make_cookie: bool,

    /// cookie filename inside the data directory
    #[argh(option, default = "String::from(\"signer.cookie\")")]
    cookie_file: String,

    /// keep the authorised-peer set in memory only
    #[argh(switch)]
    ephemeral_peers: bool,

    /// generate a fresh identity key instead of persisting one
    #[argh(switch)]
    ephemeral_identity: bool,

    /// heartbeat interval for connected terminals, in seconds
    #[argh(option, default = "30")]
    heartbeat_secs: u64,
}

type WriterMap = Arc<Mutex<HashMap<ClientId, mpsc::Sender<Envelope>>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    remsign_logger::init();
    let args: Args = argh::from_env();
    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    fs::create_dir_all(&args.datadir).with_context(|| {
        format!("creating data dir {}", args.datadir.display())
    })?;

    let identity = Arc::new(load_or_create_identity(
        &args.datadir.join("signer.key"),
        args.ephemeral_identity,
    )?);
    info!(key = %identity.public().fingerprint(), "signer identity ready");

    let peer_store = Arc::new(if args.ephemeral_peers {
        PeerStore::ephemeral()
    } else {
        PeerStore::load(args.datadir.join(&args.peers_file))?
    });

    if args.make_cookie {
        let cookie_path = args.datadir.join(&args.cookie_file);
        cookie::write_cookie(&cookie_path, &identity.public())
            .context("writing cookie")?;
    }

    // The dispatcher and its reply router.
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    let (dispatcher, dispatcher_tx) = Dispatcher::new(
        Box::new(MemoryWalletRegistry::new()),
        None,
        outbound_tx,
    );
    tokio::spawn(dispatcher.run());

    let writers: WriterMap = Arc::new(Mutex::new(HashMap::new()));
    let router_writers = Arc::clone(&writers);
    tokio::spawn(async move {
        while let Some((client, envelope)) = outbound_rx.recv().await {
            let sender = router_writers.lock().await.get(&client).cloned();
            match sender {
                Some(sender) =>
                    if sender.send(envelope).await.is_err() {
                        warn!(client, "writer gone; dropping reply");
                    },
                None => warn!(client, "reply for unknown client"),
            }
        }
    });

    let listen: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("bad listen address {}", args.listen))?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, "accepting terminal connections");

    let heartbeat = Duration::from_secs(args.heartbeat_secs);
    let mut config = Config::new(identity, peer_store);
    config.idle_timeout = Some(Duration::from_secs(args.heartbeat_secs * 3));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connection_tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut next_client: ClientId = 1;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = accepted.context("accept failed")?;
                let client = next_client;
                next_client += 1;
                info!(client, %remote, "terminal connecting");
                connection_tasks.push(tokio::spawn(handle_connection(
                    stream,
                    config.clone(),
                    client,
                    dispatcher_tx.clone(),
                    Arc::clone(&writers),
                    heartbeat,
                    shutdown_rx.clone(),
                )));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Close out every terminal connection before returning: the shutdown
    // signal stops the reader loops, and dropping each writer channel makes
    // its writer task send a Disconnect frame and exit.
    info!("shutting down; disconnecting terminals");
    let _ = shutdown_tx.send(true);
    writers.lock().await.clear();
    for task in connection_tasks {
        let _ = task.await;
    }

    info!("shut down cleanly");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    config: Config,
    client: ClientId,
    dispatcher_tx: mpsc::Sender<DispatcherMsg>,
    writers: WriterMap,
    heartbeat: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let connection = tokio::select! {
        accepted = accept(stream, config) => match accepted {
            Ok(connection) => connection,
            Err(err) => {
                warn!(client, %err, "handshake failed");
                return;
            }
        },
        _ = shutdown.changed() => return,
    };
    info!(
        client,
        peer = %connection.peer_identity().fingerprint(),
        "terminal authenticated",
    );

    let (mut reader, mut writer) = connection.into_split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Envelope>(32);
    writers.lock().await.insert(client, writer_tx);
    if dispatcher_tx
        .send(DispatcherMsg::ClientConnected { client })
        .await
        .is_err()
    {
        writers.lock().await.remove(&client);
        return;
    }

    // Replies and heartbeats go out on their own task; the responder
    // heartbeats every H so initiators can detect a dead peer at 3H.
    let write_task = tokio::spawn(async move {
        let mut ticker = interval(heartbeat);
        loop {
            tokio::select! {
                maybe_envelope = writer_rx.recv() => match maybe_envelope {
                    Some(envelope) => {
                        let sent = writer
                            .send(envelope.request_id, &envelope.encode())
                            .await;
                        if sent.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = writer.send_disconnect().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if writer.send_heartbeat().await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            received = reader.recv() => match received {
                Ok(Some((_msg_id, payload))) => {
                    let envelope = match Envelope::parse(&payload) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            warn!(client, %err, "malformed envelope; closing");
                            break;
                        }
                    };
                    let request = DispatcherMsg::Request { client, envelope };
                    if dispatcher_tx.send(request).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!(client, "terminal disconnected");
                    break;
                }
                Err(err) => {
                    warn!(client, %err, "connection error");
                    break;
                }
            },
            _ = shutdown.changed() => {
                info!(client, "closing for shutdown");
                break;
            }
        }
    }

    // Dropping the writer channel (if run() hasn't already) lets the writer
    // task send its Disconnect and finish; wait for it so the frame actually
    // goes out before this task returns.
    writers.lock().await.remove(&client);
    let _ = dispatcher_tx
        .send(DispatcherMsg::ClientDisconnected { client })
        .await;
    let _ = write_task.await;
}

fn load_or_create_identity(
    path: &Path,
    ephemeral: bool,
) -> anyhow::Result<IdentityKeyPair> {
    let mut rng = SysRng::new();
    if ephemeral {
        return Ok(IdentityKeyPair::from_rng(&mut rng));
    }

    match fs::read(path) {
        Ok(bytes) => {
            let secret: [u8; 32] =
                bytes.as_slice().try_into().with_context(|| {
                    format!(
                        "identity key file {} must be exactly 32 bytes",
                        path.display(),
                    )
                })?;
            Ok(IdentityKeyPair::from_secret_bytes(&secret)?)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let keys = IdentityKeyPair::from_rng(&mut rng);
            fs::write(path, keys.secret_bytes()).with_context(|| {
                format!("persisting identity key to {}", path.display())
            })?;
            info!(path = %path.display(), "generated new identity key");
            Ok(keys)
        }
        Err(err) => Err(err).with_context(|| {
            format!("reading identity key {}", path.display())
        }),
    }
}
