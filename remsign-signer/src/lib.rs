//! The remsign signer core: request dispatching, offline-sign validation,
//! and the interfaces to the wallet layer and the GUI adapter.
//!
//! - [`api`]: request/reply payloads, type codes, and the reply-level error
//!   taxonomy.
//! - [`dispatch`]: the single-task request dispatcher with password-prompt
//!   multiplexing and the control-password state machine.
//! - [`verify`]: structural validation of offline sign requests.
//! - [`wallets`]: the narrow wallet-registry trait the dispatcher drives
//!   (HD derivation and wallet files live behind it, out of scope here).
//! - [`autosign`]: the in-memory auto-sign password cache.

pub mod api;
pub mod autosign;
pub mod dispatch;
pub mod verify;
pub mod wallets;

pub use api::ErrorCode;
pub use dispatch::{
    ClientId, Dispatcher, DispatcherMsg, GuiEvent, GuiReply,
};
pub use wallets::WalletRegistry;
