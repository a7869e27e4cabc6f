//! Structural validation of offline sign requests.
//!
//! Every check below must pass before a private key is touched; each failure
//! maps to a specific reply-level error and aborts signing. `VerifyOfflineTx`
//! runs the same checks without ever reaching the signing step.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::error;

use crate::{
    api::{ErrorCode, OfflineSignRequest},
    wallets::WalletRegistry,
};

/// Run the full check sequence. `now_unix` is passed in so expiry handling
/// is testable; callers use [`now_unix`].
pub fn verify_offline_request(
    registry: &dyn WalletRegistry,
    request: &OfflineSignRequest,
    now_unix: u64,
) -> Result<(), ErrorCode> {
    let result = run_checks(registry, request, now_unix);
    if let Err(code) = result {
        // Reply-level, but logged for forensics, tagged with the wallet id.
        error!(
            wallet_id = request.wallet_ids.first().map(String::as_str),
            code = %code,
            "offline sign request rejected",
        );
    }
    result
}

fn run_checks(
    registry: &dyn WalletRegistry,
    request: &OfflineSignRequest,
    now_unix: u64,
) -> Result<(), ErrorCode> {
    // 1. A request that cannot be broadcast must carry an expiry.
    if !request.allow_broadcast && request.expiry.is_none() {
        return Err(ErrorCode::TxInvalidRequest);
    }

    // 2. An expiry in the past is dead on arrival.
    if let Some(expiry) = request.expiry {
        if expiry < now_unix {
            return Err(ErrorCode::TxSettlementExpired);
        }
    }

    // 3. At least one wallet must be named.
    if request.wallet_ids.is_empty() {
        return Err(ErrorCode::WalletNotFound);
    }

    // 4. Every spender input must pay to a used address of one of the named
    //    wallets, of the wallet's default address type (or its P2SH
    //    variant).
    for input in &request.inputs {
        let owning_wallet = request
            .wallet_ids
            .iter()
            .find(|id| registry.is_used_address(id, &input.address))
            .ok_or(ErrorCode::WrongAddress)?;

        let addr_type = registry
            .address_type(&input.address)
            .ok_or(ErrorCode::WrongAddress)?;
        let default_type = registry
            .default_address_type(owning_wallet)
            .ok_or(ErrorCode::WalletNotFound)?;
        if !addr_type.matches_default(default_type) {
            return Err(ErrorCode::WrongAddress);
        }
    }

    // 5. All named wallets must hang off the same HD root.
    let mut roots = request.wallet_ids.iter().map(|id| registry.root_for(id));
    let root = roots
        .next()
        .expect("wallet_ids checked non-empty")
        .ok_or(ErrorCode::WalletNotFound)?;
    for other in roots {
        if other.as_ref() != Some(&root) {
            return Err(ErrorCode::WalletNotFound);
        }
    }

    // 6. Watch-only roots cannot sign, except hardware-wallet adapters,
    //    which "sign" by delegation.
    if registry.is_watch_only(&root) && !registry.is_hardware(&root) {
        return Err(ErrorCode::WalletNotFound);
    }

    // 7. A change output must sit at a non-hardened 2-component path below
    //    the external (0) or internal (1) branch, and its address must match
    //    what the change leaf actually derives at that index. A path of the
    //    wrong shape is a parse-level failure; only a derivation mismatch is
    //    a wrong address.
    if let Some(change) = &request.change {
        let (branch, index) = match change.path[..] {
            [branch @ (0 | 1), index] if index < 0x8000_0000 =>
                (branch, index),
            _ => return Err(ErrorCode::FailedToParse),
        };
        let derived = registry
            .derive_change_address(&root, branch, index)
            .ok_or(ErrorCode::WrongAddress)?;
        if derived != change.address {
            return Err(ErrorCode::WrongAddress);
        }
    }

    // 8. The preparer's input count must match what we actually found and
    //    matched above.
    if request.input_count as usize != request.inputs.len() {
        return Err(ErrorCode::WalletNotFound);
    }

    Ok(())
}

/// Wall-clock Unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
