//! The terminal-facing signer API: request types, reply payloads, and the
//! reply-level error taxonomy.
//!
//! Every request and reply travels in a `remsign-wire` envelope; the payload
//! is JSON with field names preserved (the envelope `msg_type` selects the
//! payload shape). Replies reuse the request's type code and echo its
//! request id. Server-pushed notifications use request id 0.
//!
//! Errors here are reply-level: they are reported to the requesting terminal
//! and never close the connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use remsign_crypto::secret::{Password, SecretBytes};

pub type WalletId = String;

/// Request/reply type codes carried in the envelope `msg_type` field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum RequestType {
    SyncWalletInfo = 1,
    SyncHDWallet = 2,
    SyncWallet = 3,
    GetDecryptedNode = 4,
    SignOfflineTx = 5,
    CreateHDWallet = 6,
    DeleteHDWallet = 7,
    ImportWatchOnly = 8,
    ExportWatchOnly = 9,
    ChangePassword = 10,
    AutoSignActivate = 11,
    AutoSignDeactivate = 12,
    SetLimits = 13,
    VerifyOfflineTx = 14,
    ChangeControlPassword = 15,

    // Server-pushed notifications (request id 0).
    WalletsListUpdated = 100,
    ControlPasswordStatus = 101,
    AutoSignStateChanged = 102,
}

impl RequestType {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::SyncWalletInfo),
            2 => Some(Self::SyncHDWallet),
            3 => Some(Self::SyncWallet),
            4 => Some(Self::GetDecryptedNode),
            5 => Some(Self::SignOfflineTx),
            6 => Some(Self::CreateHDWallet),
            7 => Some(Self::DeleteHDWallet),
            8 => Some(Self::ImportWatchOnly),
            9 => Some(Self::ExportWatchOnly),
            10 => Some(Self::ChangePassword),
            11 => Some(Self::AutoSignActivate),
            12 => Some(Self::AutoSignDeactivate),
            13 => Some(Self::SetLimits),
            14 => Some(Self::VerifyOfflineTx),
            15 => Some(Self::ChangeControlPassword),
            100 => Some(Self::WalletsListUpdated),
            101 => Some(Self::ControlPasswordStatus),
            102 => Some(Self::AutoSignStateChanged),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Reply-level error kinds, serialized by name in reply payloads.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Error,
)]
pub enum ErrorCode {
    #[error("no error")]
    NoError,
    #[error("wallet not found")]
    WalletNotFound,
    #[error("wallet already present")]
    WalletAlreadyPresent,
    #[error("invalid password")]
    InvalidPassword,
    #[error("missing password")]
    MissingPassword,
    #[error("a password prompt is already pending for this wallet")]
    AlreadyPrompting,
    #[error("signer GUI is not connected")]
    GuiDisconnected,
    #[error("internal error")]
    InternalError,
    #[error("invalid sign request")]
    TxInvalidRequest,
    #[error("settlement expired")]
    TxSettlementExpired,
    #[error("address does not belong to the wallet")]
    WrongAddress,
    #[error("failed to parse request")]
    FailedToParse,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == Self::NoError
    }
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum NetType {
    Mainnet,
    Testnet,
    Regtest,
}

/// Address kinds the verifier distinguishes. "P2SH variant" of a native
/// segwit address is nested segwit.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum AddressType {
    Legacy,
    NestedSegwit,
    NativeSegwit,
}

impl AddressType {
    /// Whether an address of type `self` is acceptable for a wallet whose
    /// default type is `default` (exact match or the P2SH-nested variant).
    pub fn matches_default(self, default: AddressType) -> bool {
        self == default
            || (self == Self::NestedSegwit && default == Self::NativeSegwit)
    }
}

/// An address in its display form. Derivation and script matching are the
/// wallet library's concern; the core treats addresses as opaque,
/// comparable strings.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }
}

// --- request payloads --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletIdRequest {
    pub wallet_id: WalletId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetDecryptedNodeRequest {
    pub wallet_id: WalletId,
    pub password: Password,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignOfflineTxRequest {
    pub request: OfflineSignRequest,
    /// Empty when the terminal expects the signer to prompt (or auto-sign).
    pub password: Password,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateHDWalletRequest {
    pub name: String,
    /// Seed bytes or a serialized xpriv, per the wallet library.
    pub seed: SecretBytes,
    pub password: Password,
    pub net_type: NetType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportWatchOnlyRequest {
    pub content: Vec<u8>,
    pub filename: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub wallet_id: WalletId,
    pub old_password: Password,
    pub new_password: Password,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutoSignRequest {
    pub wallet_id: WalletId,
    pub password: Password,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyOfflineTxRequest {
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeControlPasswordRequest {
    pub old_password: Password,
    pub new_password: Password,
}

/// Per-operation limits, replaced wholesale by `SetLimits`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignLimits {
    /// Total satoshis auto-sign may spend per activation interval.
    pub auto_sign_spend_limit: u64,
    /// Auto-sign activations expire after this many seconds.
    pub auto_sign_interval_secs: u64,
}

impl Default for SignLimits {
    fn default() -> Self {
        Self {
            auto_sign_spend_limit: 100_000_000,
            auto_sign_interval_secs: 3600,
        }
    }
}

// --- offline sign request model --- //

/// A transaction prepared without private keys, carried to the signer for
/// completion. Structurally validated (see the verifier) before any key
/// material is touched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfflineSignRequest {
    pub wallet_ids: Vec<WalletId>,
    pub inputs: Vec<SpendInput>,
    pub outputs: Vec<TxOutput>,
    /// The number of inputs the preparer claims; must match `inputs`.
    pub input_count: u32,
    pub change: Option<ChangeOutput>,
    pub allow_broadcast: bool,
    /// Unix seconds; requests that cannot be broadcast must expire.
    pub expiry: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpendInput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// The address recovered from the spent output's script.
    pub address: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub value: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeOutput {
    pub address: Address,
    /// Non-hardened derivation path below the wallet's change root:
    /// `[branch, index]` with branch 0 (external) or 1 (internal).
    pub path: Vec<u32>,
    pub value: u64,
}

impl OfflineSignRequest {
    /// Total satoshis spent by the request's inputs.
    pub fn total_spent(&self) -> u64 {
        self.inputs.iter().map(|input| input.value).sum()
    }
}

// --- reply payloads --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletInfo {
    pub wallet_id: WalletId,
    pub name: String,
    pub net_type: NetType,
    pub has_password: bool,
    pub watch_only: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncWalletInfoResponse {
    pub wallets: Vec<WalletInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HDLeaf {
    pub id: WalletId,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HDGroup {
    pub group_type: u32,
    pub leaves: Vec<HDLeaf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncHDWalletResponse {
    pub error_code: ErrorCode,
    pub wallet_id: WalletId,
    pub groups: Vec<HDGroup>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsedAddress {
    pub address: Address,
    pub index: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncWalletResponse {
    pub error_code: ErrorCode,
    pub wallet_id: WalletId,
    pub highest_ext_index: u32,
    pub highest_int_index: u32,
    pub addresses: Vec<UsedAddress>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedNodeResponse {
    pub error_code: ErrorCode,
    pub wallet_id: WalletId,
    pub xpriv: SecretBytes,
    pub seed: SecretBytes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignTxResponse {
    pub error_code: ErrorCode,
    #[serde(default)]
    pub signed_tx: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateHDWalletResponse {
    pub error_code: ErrorCode,
    pub wallet_id: WalletId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub error_code: ErrorCode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportWatchOnlyResponse {
    pub error_code: ErrorCode,
    pub wallet: Option<WalletInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportWatchOnlyResponse {
    pub error_code: ErrorCode,
    #[serde(default)]
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutoSignResponse {
    pub error_code: ErrorCode,
    pub wallet_id: WalletId,
}

// --- server-pushed payloads --- //

/// Control-password states, pushed to terminals and the GUI whenever the
/// state changes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
pub enum ControlPasswordStatus {
    /// No control password is set yet and the wallets expect one.
    RequestedNew,
    /// Wallets are loaded and usable.
    Accepted,
    /// The offered control password was wrong.
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutoSignStateChanged {
    pub wallet_id: WalletId,
    pub active: bool,
}
