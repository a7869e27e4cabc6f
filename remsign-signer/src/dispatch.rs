//! The signer request dispatcher.
//!
//! A single task owns the wallet registry and executes all request handlers
//! sequentially; everything reaches it as a [`DispatcherMsg`] on one inbound
//! queue. Handlers produce at most one reply envelope, addressed to the
//! originating client and tagged with the originating request id.
//!
//! The only suspension point is the wallet-password prompt: a sign request
//! that needs a password it cannot obtain otherwise parks as an explicit
//! [`PendingPrompt`] keyed by wallet id (at most one per wallet; later
//! requests for the same wallet fail fast with `AlreadyPrompting`) and the
//! GUI adapter is asked to decrypt. The dispatcher itself never blocks, so
//! other requests keep flowing while a prompt is outstanding — which is why
//! replies can complete out of submission order and terminals must correlate
//! by request id.

use std::collections::{HashMap, HashSet};

use remsign_crypto::secret::Password;
use remsign_wire::Envelope;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    api::{
        AutoSignRequest, AutoSignResponse, AutoSignStateChanged,
        ChangeControlPasswordRequest, ChangePasswordRequest,
        ControlPasswordStatus, CreateHDWalletRequest, CreateHDWalletResponse,
        DecryptedNodeResponse, ErrorCode, ExportWatchOnlyResponse,
        GetDecryptedNodeRequest, ImportWatchOnlyRequest,
        ImportWatchOnlyResponse, OfflineSignRequest, RequestType,
        SignLimits, SignOfflineTxRequest, SignTxResponse,
        SyncHDWalletResponse, SyncWalletInfoResponse, SyncWalletResponse,
        VerifyOfflineTxRequest, WalletId, WalletIdRequest,
    },
    autosign::AutoSignCache,
    verify::{now_unix, verify_offline_request},
    wallets::{CreateWalletParams, WalletRegistry},
};

/// Identifies one terminal connection for reply routing.
pub type ClientId = u64;

/// Everything that can land on the dispatcher's inbound queue.
pub enum DispatcherMsg {
    Request { client: ClientId, envelope: Envelope },
    ClientConnected { client: ClientId },
    ClientDisconnected { client: ClientId },
    GuiReply(GuiReply),
    GuiDisconnected,
}

/// Events pushed to the GUI adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GuiEvent {
    /// Ask the user to decrypt a wallet; answered by
    /// [`GuiReply::PasswordReceived`].
    DecryptWalletRequest { wallet_id: WalletId },
    /// Ask the user for the process-wide control password.
    ControlPasswordRequest { status: ControlPasswordStatus },
    PeerConnected { client: ClientId },
    PeerDisconnected { client: ClientId },
    WalletsListUpdated,
    AutoSignStateChanged { wallet_id: WalletId, active: bool },
}

/// Answers and commands from the GUI adapter.
pub enum GuiReply {
    PasswordReceived {
        wallet_id: WalletId,
        result: ErrorCode,
        password: Password,
    },
    ControlPasswordReceived { password: Password },
    /// GUI-initiated shutdown of the signer process.
    RequestClose,
}

/// A sign request parked on a wallet-password prompt. Invariant: at most one
/// per wallet id.
struct PendingPrompt {
    client: ClientId,
    request_id: u32,
    request: OfflineSignRequest,
}

pub struct Dispatcher {
    registry: Box<dyn WalletRegistry>,
    inbound: mpsc::Receiver<DispatcherMsg>,
    outbound: mpsc::Sender<(ClientId, Envelope)>,
    gui: Option<mpsc::Sender<GuiEvent>>,
    clients: HashSet<ClientId>,
    pending: HashMap<WalletId, PendingPrompt>,
    control_status: ControlPasswordStatus,
    autosign: AutoSignCache,
    limits: SignLimits,
}

impl Dispatcher {
    /// Returns the dispatcher and the sender feeding its inbound queue.
    pub fn new(
        registry: Box<dyn WalletRegistry>,
        gui: Option<mpsc::Sender<GuiEvent>>,
        outbound: mpsc::Sender<(ClientId, Envelope)>,
    ) -> (Self, mpsc::Sender<DispatcherMsg>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let dispatcher = Self {
            registry,
            inbound: inbound_rx,
            outbound,
            gui,
            clients: HashSet::new(),
            pending: HashMap::new(),
            control_status: ControlPasswordStatus::RequestedNew,
            autosign: AutoSignCache::new(),
            limits: SignLimits::default(),
        };
        (dispatcher, inbound_tx)
    }

    /// Run until the inbound queue closes or the GUI requests shutdown.
    pub async fn run(mut self) {
        self.startup().await;
        while let Some(msg) = self.inbound.recv().await {
            let keep_going = self.handle(msg).await;
            if !keep_going {
                break;
            }
        }
        info!("signer dispatcher stopped");
    }

    /// Try loading wallets with an empty control password; if that fails,
    /// the wallets are locked until the GUI supplies one.
    async fn startup(&mut self) {
        match self.registry.load_wallets(&Password::empty()) {
            Ok(()) => {
                self.control_status = if self.registry.wallet_infos().is_empty()
                {
                    ControlPasswordStatus::RequestedNew
                } else {
                    ControlPasswordStatus::Accepted
                };
                info!(status = ?self.control_status, "wallets loaded");
            }
            Err(_) => {
                self.control_status = ControlPasswordStatus::Rejected;
                warn!("wallets need a control password; asking the GUI");
                self.gui_send(GuiEvent::ControlPasswordRequest {
                    status: ControlPasswordStatus::Rejected,
                })
                .await;
            }
        }
    }

    async fn handle(&mut self, msg: DispatcherMsg) -> bool {
        match msg {
            DispatcherMsg::Request { client, envelope } => {
                self.on_request(client, envelope).await;
            }
            DispatcherMsg::ClientConnected { client } => {
                debug!(client, "terminal connected");
                self.clients.insert(client);
                self.gui_send(GuiEvent::PeerConnected { client }).await;
            }
            DispatcherMsg::ClientDisconnected { client } => {
                debug!(client, "terminal disconnected");
                self.clients.remove(&client);
                // Cancel that client's suspended requests, silently: no
                // reply is produced for a cancelled request. Prompts for
                // wallets held by other clients stay valid.
                self.pending.retain(|_, prompt| prompt.client != client);
                self.gui_send(GuiEvent::PeerDisconnected { client }).await;
            }
            DispatcherMsg::GuiReply(reply) => return self.on_gui_reply(reply).await,
            DispatcherMsg::GuiDisconnected => self.on_gui_disconnected().await,
        }
        true
    }

    // --- terminal requests --- //

    async fn on_request(&mut self, client: ClientId, envelope: Envelope) {
        let request_type = match RequestType::from_u16(envelope.msg_type) {
            Some(rt) => rt,
            None => {
                warn!(
                    client,
                    msg_type = envelope.msg_type,
                    "request with unknown type",
                );
                self.reply_status(
                    client,
                    envelope.msg_type,
                    envelope.request_id,
                    ErrorCode::FailedToParse,
                )
                .await;
                return;
            }
        };
        let request_id = envelope.request_id;
        let code = request_type.to_u16();

        macro_rules! parse_or_bail {
            ($ty:ty) => {
                match serde_json::from_slice::<$ty>(&envelope.payload) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(client, ?request_type, %err, "bad payload");
                        self.reply_status(
                            client,
                            code,
                            request_id,
                            ErrorCode::FailedToParse,
                        )
                        .await;
                        return;
                    }
                }
            };
        }

        match request_type {
            RequestType::SyncWalletInfo => {
                let response = SyncWalletInfoResponse {
                    wallets: self.registry.wallet_infos(),
                };
                self.reply(client, code, request_id, &response).await;
            }
            RequestType::SyncHDWallet => {
                let request = parse_or_bail!(WalletIdRequest);
                let response = match self.registry.hd_wallet(&request.wallet_id)
                {
                    Some(groups) => SyncHDWalletResponse {
                        error_code: ErrorCode::NoError,
                        wallet_id: request.wallet_id,
                        groups,
                    },
                    None => SyncHDWalletResponse {
                        error_code: ErrorCode::WalletNotFound,
                        wallet_id: request.wallet_id,
                        groups: Vec::new(),
                    },
                };
                self.reply(client, code, request_id, &response).await;
            }
            RequestType::SyncWallet => {
                let request = parse_or_bail!(WalletIdRequest);
                let response = self
                    .registry
                    .wallet_sync(&request.wallet_id)
                    .unwrap_or(SyncWalletResponse {
                        error_code: ErrorCode::WalletNotFound,
                        wallet_id: request.wallet_id,
                        highest_ext_index: 0,
                        highest_int_index: 0,
                        addresses: Vec::new(),
                    });
                self.reply(client, code, request_id, &response).await;
            }
            RequestType::GetDecryptedNode => {
                let request = parse_or_bail!(GetDecryptedNodeRequest);
                let response = match self
                    .registry
                    .decrypt_node(&request.wallet_id, &request.password)
                {
                    Ok(node) => DecryptedNodeResponse {
                        error_code: ErrorCode::NoError,
                        wallet_id: request.wallet_id,
                        xpriv: node.xpriv,
                        seed: node.seed,
                    },
                    Err(error_code) => DecryptedNodeResponse {
                        error_code,
                        wallet_id: request.wallet_id,
                        xpriv: Default::default(),
                        seed: Default::default(),
                    },
                };
                self.reply(client, code, request_id, &response).await;
            }
            RequestType::SignOfflineTx => {
                let request = parse_or_bail!(SignOfflineTxRequest);
                self.on_sign_offline(client, request_id, request).await;
            }
            RequestType::CreateHDWallet => {
                let request = parse_or_bail!(CreateHDWalletRequest);
                let params = CreateWalletParams {
                    name: request.name,
                    seed: request.seed,
                    password: request.password,
                    net_type: request.net_type,
                };
                let response = match self.registry.create_wallet(params) {
                    Ok(info) => CreateHDWalletResponse {
                        error_code: ErrorCode::NoError,
                        wallet_id: info.wallet_id,
                    },
                    Err(error_code) => CreateHDWalletResponse {
                        error_code,
                        wallet_id: WalletId::new(),
                    },
                };
                let created = response.error_code.is_ok();
                self.reply(client, code, request_id, &response).await;
                if created {
                    self.wallets_list_updated().await;
                }
            }
            RequestType::DeleteHDWallet => {
                let request = parse_or_bail!(WalletIdRequest);
                let result = self.registry.delete_wallet(&request.wallet_id);
                let error_code = result.err().unwrap_or(ErrorCode::NoError);
                self.reply_status(client, code, request_id, error_code).await;
                if error_code.is_ok() {
                    self.wallets_list_updated().await;
                }
            }
            RequestType::ImportWatchOnly => {
                let request = parse_or_bail!(ImportWatchOnlyRequest);
                let response = match self
                    .registry
                    .import_watch_only(&request.content, &request.filename)
                {
                    Ok(info) => ImportWatchOnlyResponse {
                        error_code: ErrorCode::NoError,
                        wallet: Some(info),
                    },
                    Err(error_code) => ImportWatchOnlyResponse {
                        error_code,
                        wallet: None,
                    },
                };
                let imported = response.error_code.is_ok();
                self.reply(client, code, request_id, &response).await;
                if imported {
                    self.wallets_list_updated().await;
                }
            }
            RequestType::ExportWatchOnly => {
                let request = parse_or_bail!(WalletIdRequest);
                let response = match self
                    .registry
                    .export_watch_only(&request.wallet_id)
                {
                    Ok(content) => ExportWatchOnlyResponse {
                        error_code: ErrorCode::NoError,
                        content,
                    },
                    Err(error_code) => ExportWatchOnlyResponse {
                        error_code,
                        content: Vec::new(),
                    },
                };
                self.reply(client, code, request_id, &response).await;
            }
            RequestType::ChangePassword => {
                let request = parse_or_bail!(ChangePasswordRequest);
                let result = self.registry.change_password(
                    &request.wallet_id,
                    &request.old_password,
                    &request.new_password,
                );
                let error_code = result.err().unwrap_or(ErrorCode::NoError);
                self.reply_status(client, code, request_id, error_code).await;
            }
            RequestType::AutoSignActivate => {
                let request = parse_or_bail!(AutoSignRequest);
                let error_code = self.activate_auto_sign(&request);
                let response = AutoSignResponse {
                    error_code,
                    wallet_id: request.wallet_id.clone(),
                };
                self.reply(client, code, request_id, &response).await;
                if error_code.is_ok() {
                    self.auto_sign_state_changed(&request.wallet_id, true)
                        .await;
                }
            }
            RequestType::AutoSignDeactivate => {
                let request = parse_or_bail!(WalletIdRequest);
                let was_active = self.autosign.deactivate(&request.wallet_id);
                let response = AutoSignResponse {
                    error_code: ErrorCode::NoError,
                    wallet_id: request.wallet_id.clone(),
                };
                self.reply(client, code, request_id, &response).await;
                if was_active {
                    self.auto_sign_state_changed(&request.wallet_id, false)
                        .await;
                }
            }
            RequestType::SetLimits => {
                self.limits = parse_or_bail!(SignLimits);
                debug!(limits = ?self.limits, "limits replaced");
                self.reply_status(
                    client,
                    code,
                    request_id,
                    ErrorCode::NoError,
                )
                .await;
            }
            RequestType::VerifyOfflineTx => {
                let request = parse_or_bail!(VerifyOfflineTxRequest);
                let error_code = match serde_json::from_slice::<
                    OfflineSignRequest,
                >(&request.content)
                {
                    Ok(parsed) => verify_offline_request(
                        self.registry.as_ref(),
                        &parsed,
                        now_unix(),
                    )
                    .err()
                    .unwrap_or(ErrorCode::NoError),
                    Err(_) => ErrorCode::FailedToParse,
                };
                self.reply_status(client, code, request_id, error_code).await;
            }
            RequestType::ChangeControlPassword => {
                let request = parse_or_bail!(ChangeControlPasswordRequest);
                let result = self.registry.change_control_password(
                    &request.old_password,
                    &request.new_password,
                );
                let error_code = result.err().unwrap_or(ErrorCode::NoError);
                self.reply_status(client, code, request_id, error_code).await;
            }
            // Push-only types are never valid as requests.
            RequestType::WalletsListUpdated
            | RequestType::ControlPasswordStatus
            | RequestType::AutoSignStateChanged => {
                self.reply_status(
                    client,
                    code,
                    request_id,
                    ErrorCode::FailedToParse,
                )
                .await;
            }
        }
    }

    // --- offline signing and password prompts --- //

    async fn on_sign_offline(
        &mut self,
        client: ClientId,
        request_id: u32,
        request: SignOfflineTxRequest,
    ) {
        let code = RequestType::SignOfflineTx.to_u16();

        if let Err(error_code) = verify_offline_request(
            self.registry.as_ref(),
            &request.request,
            now_unix(),
        ) {
            self.reply_sign_error(client, request_id, error_code).await;
            return;
        }

        let root = match request
            .request
            .wallet_ids
            .first()
            .and_then(|id| self.registry.root_for(id))
        {
            Some(root) => root,
            None => {
                self.reply_sign_error(
                    client,
                    request_id,
                    ErrorCode::WalletNotFound,
                )
                .await;
                return;
            }
        };

        // Resolve the password: supplied > not needed > auto-sign > prompt.
        let password = if !request.password.is_empty() {
            request.password
        } else if !self.registry.has_password(&root) {
            Password::empty()
        } else {
            let spend = request.request.total_spent();
            let was_active = self.autosign.is_active(&root);
            match self.autosign.password_for_spend(
                &root,
                spend,
                &self.limits,
            ) {
                Some(password) => password,
                None => {
                    if was_active {
                        // Expired or over budget: the activation just died.
                        self.auto_sign_state_changed(&root, false).await;
                    }
                    self.suspend_for_password(
                        client,
                        request_id,
                        root,
                        request.request,
                    )
                    .await;
                    return;
                }
            }
        };

        let response = self.sign_now(&request.request, &password);
        self.reply(client, code, request_id, &response).await;
    }

    /// Park the request and ask the GUI for the wallet password. At most one
    /// prompt per wallet may be outstanding.
    async fn suspend_for_password(
        &mut self,
        client: ClientId,
        request_id: u32,
        wallet_id: WalletId,
        request: OfflineSignRequest,
    ) {
        if self.pending.contains_key(&wallet_id) {
            self.reply_sign_error(
                client,
                request_id,
                ErrorCode::AlreadyPrompting,
            )
            .await;
            return;
        }
        if self.gui.is_none() {
            self.reply_sign_error(
                client,
                request_id,
                ErrorCode::GuiDisconnected,
            )
            .await;
            return;
        }

        debug!(%wallet_id, client, "suspending sign request on prompt");
        self.pending.insert(
            wallet_id.clone(),
            PendingPrompt {
                client,
                request_id,
                request,
            },
        );
        self.gui_send(GuiEvent::DecryptWalletRequest { wallet_id }).await;
    }

    fn sign_now(
        &mut self,
        request: &OfflineSignRequest,
        password: &Password,
    ) -> SignTxResponse {
        match self.registry.sign_offline(request, password) {
            Ok(signed_tx) => SignTxResponse {
                error_code: ErrorCode::NoError,
                signed_tx,
            },
            Err(error_code) => SignTxResponse {
                error_code,
                signed_tx: Vec::new(),
            },
        }
    }

    // --- GUI adapter --- //

    async fn on_gui_reply(&mut self, reply: GuiReply) -> bool {
        match reply {
            GuiReply::PasswordReceived {
                wallet_id,
                result,
                password,
            } => {
                let prompt = match self.pending.remove(&wallet_id) {
                    Some(prompt) => prompt,
                    None => {
                        // The requester disconnected while the dialog was
                        // open; the prompt was cancelled silently.
                        debug!(%wallet_id, "password for no pending prompt");
                        return true;
                    }
                };
                if result.is_ok() {
                    let response = self.sign_now(&prompt.request, &password);
                    self.reply(
                        prompt.client,
                        RequestType::SignOfflineTx.to_u16(),
                        prompt.request_id,
                        &response,
                    )
                    .await;
                } else {
                    self.reply_sign_error(
                        prompt.client,
                        prompt.request_id,
                        result,
                    )
                    .await;
                }
            }
            GuiReply::ControlPasswordReceived { password } => {
                match self.registry.load_wallets(&password) {
                    Ok(()) => {
                        self.control_status = ControlPasswordStatus::Accepted;
                        info!("control password accepted; wallets loaded");
                        self.push_control_status().await;
                    }
                    Err(_) => {
                        self.control_status = ControlPasswordStatus::Rejected;
                        warn!("control password rejected");
                        self.push_control_status().await;
                        self.gui_send(GuiEvent::ControlPasswordRequest {
                            status: ControlPasswordStatus::Rejected,
                        })
                        .await;
                    }
                }
            }
            GuiReply::RequestClose => {
                info!("closing on GUI request");
                return false;
            }
        }
        true
    }

    /// The GUI went away: every outstanding prompt fails, it does not hang.
    async fn on_gui_disconnected(&mut self) {
        warn!(
            pending = self.pending.len(),
            "GUI adapter disconnected; failing outstanding prompts",
        );
        self.gui = None;
        let pending = std::mem::take(&mut self.pending);
        for (_wallet_id, prompt) in pending {
            self.reply_sign_error(
                prompt.client,
                prompt.request_id,
                ErrorCode::GuiDisconnected,
            )
            .await;
        }
    }

    // --- helpers --- //

    fn activate_auto_sign(&mut self, request: &AutoSignRequest) -> ErrorCode {
        if self.registry.root_for(&request.wallet_id).is_none() {
            return ErrorCode::WalletNotFound;
        }
        if !self
            .registry
            .check_password(&request.wallet_id, &request.password)
        {
            return ErrorCode::InvalidPassword;
        }
        self.autosign
            .activate(&request.wallet_id, request.password.clone());
        ErrorCode::NoError
    }

    async fn reply<T: Serialize>(
        &mut self,
        client: ClientId,
        msg_type: u16,
        request_id: u32,
        payload: &T,
    ) {
        let bytes = serde_json::to_vec(payload)
            .expect("reply payloads always serialize");
        let envelope = Envelope::new(msg_type, request_id, bytes);
        if self.outbound.send((client, envelope)).await.is_err() {
            warn!(client, "outbound channel closed; dropping reply");
        }
    }

    async fn reply_status(
        &mut self,
        client: ClientId,
        msg_type: u16,
        request_id: u32,
        error_code: ErrorCode,
    ) {
        let status = crate::api::StatusResponse { error_code };
        self.reply(client, msg_type, request_id, &status).await;
    }

    async fn reply_sign_error(
        &mut self,
        client: ClientId,
        request_id: u32,
        error_code: ErrorCode,
    ) {
        let response = SignTxResponse {
            error_code,
            signed_tx: Vec::new(),
        };
        self.reply(
            client,
            RequestType::SignOfflineTx.to_u16(),
            request_id,
            &response,
        )
        .await;
    }

    async fn gui_send(&mut self, event: GuiEvent) {
        let sender = match &self.gui {
            Some(sender) => sender.clone(),
            None => return,
        };
        if sender.send(event).await.is_err() {
            self.on_gui_disconnected().await;
        }
    }

    /// Broadcast a request-id-0 notification to every connected terminal.
    async fn broadcast<T: Serialize>(
        &mut self,
        request_type: RequestType,
        payload: &T,
    ) {
        let bytes = serde_json::to_vec(payload)
            .expect("push payloads always serialize");
        for client in self.clients.iter().copied().collect::<Vec<_>>() {
            let envelope =
                Envelope::event(request_type.to_u16(), bytes.clone());
            if self.outbound.send((client, envelope)).await.is_err() {
                warn!(client, "outbound channel closed; dropping push");
            }
        }
    }

    async fn wallets_list_updated(&mut self) {
        self.broadcast(RequestType::WalletsListUpdated, &()).await;
        self.gui_send(GuiEvent::WalletsListUpdated).await;
    }

    async fn push_control_status(&mut self) {
        let status = self.control_status;
        self.broadcast(RequestType::ControlPasswordStatus, &status).await;
    }

    async fn auto_sign_state_changed(&mut self, wallet_id: &str, active: bool) {
        self.broadcast(
            RequestType::AutoSignStateChanged,
            &AutoSignStateChanged {
                wallet_id: wallet_id.to_owned(),
                active,
            },
        )
        .await;
        self.gui_send(GuiEvent::AutoSignStateChanged {
            wallet_id: wallet_id.to_owned(),
            active,
        })
        .await;
    }
}
