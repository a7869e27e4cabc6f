//! Dispatcher scenarios, driven end-to-end through its channels.

use remsign_crypto::secret::Password;
use remsign_signer::{
    api::{
        Address, AutoSignRequest, ChangeControlPasswordRequest,
        ChangeOutput, ControlPasswordStatus, ErrorCode, OfflineSignRequest,
        RequestType, SignLimits, SignOfflineTxRequest, SignTxResponse,
        SpendInput, StatusResponse, SyncWalletInfoResponse, TxOutput,
        VerifyOfflineTxRequest, WalletIdRequest,
    },
    dispatch::{ClientId, Dispatcher, DispatcherMsg, GuiEvent, GuiReply},
    wallets::{
        testing::{derived_address, MemoryWalletRegistry},
        SharedRegistry,
    },
};
use remsign_wire::Envelope;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

struct TestBed {
    inbound: mpsc::Sender<DispatcherMsg>,
    outbound: mpsc::Receiver<(ClientId, Envelope)>,
    gui_events: mpsc::Receiver<GuiEvent>,
    registry: SharedRegistry,
    _task: tokio::task::JoinHandle<()>,
}

impl TestBed {
    fn spawn(inner: MemoryWalletRegistry) -> Self {
        let registry = SharedRegistry::new(inner);
        let (gui_tx, gui_events) = mpsc::channel(32);
        let (outbound_tx, outbound) = mpsc::channel(32);
        let (dispatcher, inbound) = Dispatcher::new(
            Box::new(registry.clone()),
            Some(gui_tx),
            outbound_tx,
        );
        let task = tokio::spawn(dispatcher.run());
        Self {
            inbound,
            outbound,
            gui_events,
            registry,
            _task: task,
        }
    }

    fn default_wallets() -> Self {
        let mut inner = MemoryWalletRegistry::new();
        inner.add_wallet("w1", "pass-w1", false);
        inner.add_wallet("open", "", false);
        Self::spawn(inner)
    }

    async fn request<T: Serialize>(
        &self,
        client: ClientId,
        request_id: u32,
        request_type: RequestType,
        payload: &T,
    ) {
        let bytes = serde_json::to_vec(payload).unwrap();
        let envelope =
            Envelope::new(request_type.to_u16(), request_id, bytes);
        self.inbound
            .send(DispatcherMsg::Request { client, envelope })
            .await
            .unwrap();
    }

    async fn reply<T: DeserializeOwned>(
        &mut self,
        expected_client: ClientId,
        expected_type: RequestType,
        expected_id: u32,
    ) -> T {
        let (client, envelope) =
            self.outbound.recv().await.expect("dispatcher alive");
        assert_eq!(client, expected_client);
        assert_eq!(envelope.msg_type, expected_type.to_u16());
        assert_eq!(envelope.request_id, expected_id);
        serde_json::from_slice(&envelope.payload).expect("reply parses")
    }
}

fn sign_request(wallet_id: &str, value: u64) -> SignOfflineTxRequest {
    SignOfflineTxRequest {
        request: OfflineSignRequest {
            wallet_ids: vec![wallet_id.to_owned()],
            inputs: vec![SpendInput {
                txid: "00".repeat(32),
                vout: 0,
                value,
                address: derived_address(wallet_id, 0, 1),
            }],
            outputs: vec![TxOutput {
                address: Address::new("bc1qdest"),
                value: value.saturating_sub(500),
            }],
            input_count: 1,
            change: None,
            allow_broadcast: true,
            expiry: None,
        },
        password: Password::empty(),
    }
}

#[tokio::test]
async fn sync_wallet_info_lists_wallets() {
    let mut bed = TestBed::default_wallets();
    bed.request(1, 10, RequestType::SyncWalletInfo, &()).await;
    let response: SyncWalletInfoResponse =
        bed.reply(1, RequestType::SyncWalletInfo, 10).await;
    let ids: Vec<_> = response
        .wallets
        .iter()
        .map(|w| w.wallet_id.as_str())
        .collect();
    assert_eq!(ids, ["open", "w1"]);
}

#[tokio::test]
async fn sign_with_supplied_password() {
    let mut bed = TestBed::default_wallets();
    let mut request = sign_request("w1", 10_000);
    request.password = Password::new("pass-w1");

    bed.request(1, 11, RequestType::SignOfflineTx, &request).await;
    let response: SignTxResponse =
        bed.reply(1, RequestType::SignOfflineTx, 11).await;
    assert_eq!(response.error_code, ErrorCode::NoError);
    assert!(!response.signed_tx.is_empty());
}

#[tokio::test]
async fn sign_with_wrong_password_fails() {
    let mut bed = TestBed::default_wallets();
    let mut request = sign_request("w1", 10_000);
    request.password = Password::new("nope");

    bed.request(1, 12, RequestType::SignOfflineTx, &request).await;
    let response: SignTxResponse =
        bed.reply(1, RequestType::SignOfflineTx, 12).await;
    assert_eq!(response.error_code, ErrorCode::InvalidPassword);
}

#[tokio::test]
async fn expired_settlement_short_circuits() {
    let mut bed = TestBed::default_wallets();
    let mut request = sign_request("w1", 10_000);
    request.request.allow_broadcast = false;
    request.request.expiry = Some(1); // long past

    bed.request(1, 13, RequestType::SignOfflineTx, &request).await;
    let response: SignTxResponse =
        bed.reply(1, RequestType::SignOfflineTx, 13).await;
    assert_eq!(response.error_code, ErrorCode::TxSettlementExpired);

    // No password prompt was emitted and no wallet file was opened.
    assert!(bed.gui_events.try_recv().is_err());
    assert_eq!(bed.registry.lock().wallet_opens, 0);
}

#[tokio::test]
async fn interleaved_prompts_second_fails_fast() {
    let mut bed = TestBed::default_wallets();

    // Both clients ask to sign with wallet w1; neither supplies a password.
    bed.request(1, 20, RequestType::SignOfflineTx, &sign_request("w1", 1_000))
        .await;
    bed.request(2, 21, RequestType::SignOfflineTx, &sign_request("w1", 2_000))
        .await;

    // Exactly one DecryptWalletRequest reaches the GUI.
    let event = bed.gui_events.recv().await.unwrap();
    assert_eq!(
        event,
        GuiEvent::DecryptWalletRequest {
            wallet_id: "w1".to_owned()
        },
    );

    // The second request fails fast while the first stays suspended.
    let response: SignTxResponse =
        bed.reply(2, RequestType::SignOfflineTx, 21).await;
    assert_eq!(response.error_code, ErrorCode::AlreadyPrompting);
    assert!(bed.gui_events.try_recv().is_err());

    // The GUI answers; the first request completes.
    bed.inbound
        .send(DispatcherMsg::GuiReply(GuiReply::PasswordReceived {
            wallet_id: "w1".to_owned(),
            result: ErrorCode::NoError,
            password: Password::new("pass-w1"),
        }))
        .await
        .unwrap();
    let response: SignTxResponse =
        bed.reply(1, RequestType::SignOfflineTx, 20).await;
    assert_eq!(response.error_code, ErrorCode::NoError);

    // A retry by the second client may now prompt again.
    bed.request(2, 22, RequestType::SignOfflineTx, &sign_request("w1", 2_000))
        .await;
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::DecryptWalletRequest {
            wallet_id: "w1".to_owned()
        },
    );
}

#[tokio::test]
async fn gui_disconnect_fails_outstanding_prompt() {
    let mut bed = TestBed::default_wallets();
    bed.request(1, 30, RequestType::SignOfflineTx, &sign_request("w1", 1_000))
        .await;
    let _ = bed.gui_events.recv().await.unwrap();

    bed.inbound.send(DispatcherMsg::GuiDisconnected).await.unwrap();
    let response: SignTxResponse =
        bed.reply(1, RequestType::SignOfflineTx, 30).await;
    assert_eq!(response.error_code, ErrorCode::GuiDisconnected);
}

#[tokio::test]
async fn client_disconnect_cancels_prompt_silently() {
    let mut bed = TestBed::default_wallets();
    bed.request(1, 40, RequestType::SignOfflineTx, &sign_request("w1", 1_000))
        .await;
    let _ = bed.gui_events.recv().await.unwrap();

    bed.inbound
        .send(DispatcherMsg::ClientDisconnected { client: 1 })
        .await
        .unwrap();

    // A late answer produces no reply for the cancelled request.
    bed.inbound
        .send(DispatcherMsg::GuiReply(GuiReply::PasswordReceived {
            wallet_id: "w1".to_owned(),
            result: ErrorCode::NoError,
            password: Password::new("pass-w1"),
        }))
        .await
        .unwrap();

    // The wallet is promptable again by a live client.
    bed.request(2, 41, RequestType::SignOfflineTx, &sign_request("w1", 1_000))
        .await;
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::DecryptWalletRequest {
            wallet_id: "w1".to_owned()
        },
    );
    assert!(bed.outbound.try_recv().is_err(), "no stray replies");
}

#[tokio::test]
async fn auto_sign_covers_spends_until_budget_runs_out() {
    let mut bed = TestBed::default_wallets();

    // Tight budget: 5000 sat per interval.
    bed.request(
        1,
        50,
        RequestType::SetLimits,
        &SignLimits {
            auto_sign_spend_limit: 5_000,
            auto_sign_interval_secs: 600,
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::SetLimits, 50).await;
    assert_eq!(status.error_code, ErrorCode::NoError);

    bed.request(
        1,
        51,
        RequestType::AutoSignActivate,
        &AutoSignRequest {
            wallet_id: "w1".to_owned(),
            password: Password::new("pass-w1"),
        },
    )
    .await;
    let response: remsign_signer::api::AutoSignResponse =
        bed.reply(1, RequestType::AutoSignActivate, 51).await;
    assert_eq!(response.error_code, ErrorCode::NoError);
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::AutoSignStateChanged {
            wallet_id: "w1".to_owned(),
            active: true,
        },
    );

    // Within budget: signs without a prompt.
    bed.request(1, 52, RequestType::SignOfflineTx, &sign_request("w1", 4_000))
        .await;
    let response: SignTxResponse =
        bed.reply(1, RequestType::SignOfflineTx, 52).await;
    assert_eq!(response.error_code, ErrorCode::NoError);
    assert!(bed.gui_events.try_recv().is_err());

    // Over budget: auto-sign dies and the request falls back to prompting.
    bed.request(1, 53, RequestType::SignOfflineTx, &sign_request("w1", 2_000))
        .await;
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::AutoSignStateChanged {
            wallet_id: "w1".to_owned(),
            active: false,
        },
    );
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::DecryptWalletRequest {
            wallet_id: "w1".to_owned()
        },
    );
}

#[tokio::test]
async fn wallet_lifecycle_pushes_list_updates() {
    let mut bed = TestBed::default_wallets();
    bed.inbound
        .send(DispatcherMsg::ClientConnected { client: 7 })
        .await
        .unwrap();
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::PeerConnected { client: 7 },
    );

    bed.request(
        7,
        60,
        RequestType::DeleteHDWallet,
        &WalletIdRequest {
            wallet_id: "open".to_owned(),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(7, RequestType::DeleteHDWallet, 60).await;
    assert_eq!(status.error_code, ErrorCode::NoError);

    // The connected terminal receives a request-id-0 push, and the GUI an
    // event.
    let (client, envelope) = bed.outbound.recv().await.unwrap();
    assert_eq!(client, 7);
    assert_eq!(
        envelope.msg_type,
        RequestType::WalletsListUpdated.to_u16(),
    );
    assert!(envelope.is_event());
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::WalletsListUpdated,
    );
}

#[tokio::test]
async fn control_password_flow() {
    let mut inner = MemoryWalletRegistry::new();
    inner.add_wallet("w1", "pass-w1", false);
    inner.control_password = Password::new("control-pw");
    let mut bed = TestBed::spawn(inner);

    // Startup with an empty control password fails; the GUI is asked.
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::ControlPasswordRequest {
            status: ControlPasswordStatus::Rejected,
        },
    );

    // Wrong answer: asked again.
    bed.inbound
        .send(DispatcherMsg::GuiReply(GuiReply::ControlPasswordReceived {
            password: Password::new("wrong"),
        }))
        .await
        .unwrap();
    assert_eq!(
        bed.gui_events.recv().await.unwrap(),
        GuiEvent::ControlPasswordRequest {
            status: ControlPasswordStatus::Rejected,
        },
    );

    // Right answer: accepted, and connected terminals are notified.
    bed.inbound
        .send(DispatcherMsg::ClientConnected { client: 3 })
        .await
        .unwrap();
    let _ = bed.gui_events.recv().await.unwrap(); // PeerConnected
    bed.inbound
        .send(DispatcherMsg::GuiReply(GuiReply::ControlPasswordReceived {
            password: Password::new("control-pw"),
        }))
        .await
        .unwrap();

    let (client, envelope) = bed.outbound.recv().await.unwrap();
    assert_eq!(client, 3);
    assert_eq!(
        envelope.msg_type,
        RequestType::ControlPasswordStatus.to_u16(),
    );
    let status: ControlPasswordStatus =
        serde_json::from_slice(&envelope.payload).unwrap();
    assert_eq!(status, ControlPasswordStatus::Accepted);
}

#[tokio::test]
async fn change_control_password_is_all_or_nothing() {
    let mut bed = TestBed::default_wallets();

    // A mid-flight failure leaves the old (empty) password in force.
    bed.registry.lock().fail_control_reencrypt = true;
    bed.request(
        1,
        70,
        RequestType::ChangeControlPassword,
        &ChangeControlPasswordRequest {
            old_password: Password::empty(),
            new_password: Password::new("new-control"),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::ChangeControlPassword, 70).await;
    assert_eq!(status.error_code, ErrorCode::InternalError);
    assert!(bed
        .registry
        .lock()
        .control_password
        .ct_eq(&Password::empty()));

    // Without the failure, the change lands.
    bed.registry.lock().fail_control_reencrypt = false;
    bed.request(
        1,
        71,
        RequestType::ChangeControlPassword,
        &ChangeControlPasswordRequest {
            old_password: Password::empty(),
            new_password: Password::new("new-control"),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::ChangeControlPassword, 71).await;
    assert_eq!(status.error_code, ErrorCode::NoError);
    assert!(bed
        .registry
        .lock()
        .control_password
        .ct_eq(&Password::new("new-control")));
}

#[tokio::test]
async fn verify_offline_tx_parses_and_validates() {
    let mut bed = TestBed::default_wallets();

    // Valid content verifies clean without signing.
    let valid = sign_request("w1", 1_000).request;
    bed.request(
        1,
        80,
        RequestType::VerifyOfflineTx,
        &VerifyOfflineTxRequest {
            content: serde_json::to_vec(&valid).unwrap(),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::VerifyOfflineTx, 80).await;
    assert_eq!(status.error_code, ErrorCode::NoError);
    assert_eq!(bed.registry.lock().wallet_opens, 0);

    // Garbage content fails to parse.
    bed.request(
        1,
        81,
        RequestType::VerifyOfflineTx,
        &VerifyOfflineTxRequest {
            content: b"not json".to_vec(),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::VerifyOfflineTx, 81).await;
    assert_eq!(status.error_code, ErrorCode::FailedToParse);

    // A malformed change path is a parse-level failure.
    let mut bad = sign_request("w1", 1_000).request;
    bad.change = Some(ChangeOutput {
        address: derived_address("w1", 1, 2),
        path: vec![3, 2],
        value: 100,
    });
    bed.request(
        1,
        82,
        RequestType::VerifyOfflineTx,
        &VerifyOfflineTxRequest {
            content: serde_json::to_vec(&bad).unwrap(),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::VerifyOfflineTx, 82).await;
    assert_eq!(status.error_code, ErrorCode::FailedToParse);

    // A well-formed path whose derived address disagrees is a wrong address.
    let mut mismatched = sign_request("w1", 1_000).request;
    mismatched.change = Some(ChangeOutput {
        address: derived_address("w1", 1, 9),
        path: vec![1, 2],
        value: 100,
    });
    bed.request(
        1,
        83,
        RequestType::VerifyOfflineTx,
        &VerifyOfflineTxRequest {
            content: serde_json::to_vec(&mismatched).unwrap(),
        },
    )
    .await;
    let status: StatusResponse =
        bed.reply(1, RequestType::VerifyOfflineTx, 83).await;
    assert_eq!(status.error_code, ErrorCode::WrongAddress);
}

#[tokio::test]
async fn unknown_and_malformed_requests_fail_to_parse() {
    let mut bed = TestBed::default_wallets();

    // Unknown type code.
    let envelope = Envelope::new(999, 90, Vec::new());
    bed.inbound
        .send(DispatcherMsg::Request {
            client: 1,
            envelope,
        })
        .await
        .unwrap();
    let (client, envelope) = bed.outbound.recv().await.unwrap();
    assert_eq!(client, 1);
    assert_eq!(envelope.msg_type, 999);
    assert_eq!(envelope.request_id, 90);
    let status: StatusResponse =
        serde_json::from_slice(&envelope.payload).unwrap();
    assert_eq!(status.error_code, ErrorCode::FailedToParse);

    // Known type, garbage payload.
    let envelope = Envelope::new(
        RequestType::SyncWallet.to_u16(),
        91,
        b"{\"nope\":1}".to_vec(),
    );
    bed.inbound
        .send(DispatcherMsg::Request {
            client: 1,
            envelope,
        })
        .await
        .unwrap();
    let status: StatusResponse =
        bed.reply(1, RequestType::SyncWallet, 91).await;
    assert_eq!(status.error_code, ErrorCode::FailedToParse);
}

#[tokio::test]
async fn gui_request_close_stops_dispatcher() {
    let bed = TestBed::default_wallets();
    bed.inbound
        .send(DispatcherMsg::GuiReply(GuiReply::RequestClose))
        .await
        .unwrap();
    bed._task.await.unwrap();
}
