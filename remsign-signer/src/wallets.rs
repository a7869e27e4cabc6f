//! The wallet-registry interface the dispatcher drives.
//!
//! HD derivation, seed encryption, and wallet file formats are the wallet
//! library's business; the dispatcher only needs the narrow surface below.
//! Wallet files are opened for the duration of a single operation; the
//! registry implementation owns that discipline.
//!
//! [`testing::MemoryWalletRegistry`] is an in-memory stand-in used by the
//! dispatcher tests and the fake-GUI tooling.

use remsign_crypto::secret::{Password, SecretBytes};

use crate::api::{
    Address, AddressType, ErrorCode, HDGroup, NetType, OfflineSignRequest,
    SyncWalletResponse, WalletId, WalletInfo,
};

/// The decrypted root node of a wallet: exists only for the duration of a
/// `GetDecryptedNode` reply.
pub struct DecryptedNode {
    pub xpriv: SecretBytes,
    pub seed: SecretBytes,
}

pub struct CreateWalletParams {
    pub name: String,
    pub seed: SecretBytes,
    pub password: Password,
    pub net_type: NetType,
}

/// Everything the signer dispatcher needs from the wallet layer. All
/// blocking I/O behind these calls is bounded by wallet file size.
pub trait WalletRegistry: Send {
    /// Load (or reload) all wallets under the given control password.
    fn load_wallets(&mut self, control_password: &Password)
        -> Result<(), ErrorCode>;

    /// Re-encrypt every wallet under a new control password, atomically:
    /// if any per-wallet step fails the old password remains in force.
    fn change_control_password(
        &mut self,
        old: &Password,
        new: &Password,
    ) -> Result<(), ErrorCode>;

    fn wallet_infos(&self) -> Vec<WalletInfo>;

    /// Account tree of an HD (root) wallet.
    fn hd_wallet(&self, wallet_id: &str) -> Option<Vec<HDGroup>>;

    /// Used-address chain and highest indices of a leaf wallet.
    fn wallet_sync(&self, wallet_id: &str) -> Option<SyncWalletResponse>;

    /// The HD root a leaf belongs to (a root maps to itself).
    fn root_for(&self, wallet_id: &str) -> Option<WalletId>;

    fn is_watch_only(&self, root_id: &str) -> bool;

    /// Hardware-wallet adapters look watch-only but may "sign" by
    /// delegation.
    fn is_hardware(&self, root_id: &str) -> bool;

    fn has_password(&self, root_id: &str) -> bool;

    fn check_password(&self, root_id: &str, password: &Password) -> bool;

    fn decrypt_node(
        &self,
        root_id: &str,
        password: &Password,
    ) -> Result<DecryptedNode, ErrorCode>;

    fn is_used_address(&self, wallet_id: &str, address: &Address) -> bool;

    /// The script kind an address decodes to, if it decodes at all.
    fn address_type(&self, address: &Address) -> Option<AddressType>;

    fn default_address_type(&self, wallet_id: &str) -> Option<AddressType>;

    /// Derive the address at `branch/index` below the root's change node.
    fn derive_change_address(
        &self,
        root_id: &str,
        branch: u32,
        index: u32,
    ) -> Option<Address>;

    /// Sign a (pre-validated) offline request. The password has already been
    /// checked by the dispatcher.
    fn sign_offline(
        &mut self,
        request: &OfflineSignRequest,
        password: &Password,
    ) -> Result<Vec<u8>, ErrorCode>;

    fn create_wallet(
        &mut self,
        params: CreateWalletParams,
    ) -> Result<WalletInfo, ErrorCode>;

    fn delete_wallet(&mut self, wallet_id: &str) -> Result<(), ErrorCode>;

    fn import_watch_only(
        &mut self,
        content: &[u8],
        filename: &str,
    ) -> Result<WalletInfo, ErrorCode>;

    /// Fork a full wallet to watch-only if needed and return the WO file
    /// bytes.
    fn export_watch_only(
        &mut self,
        wallet_id: &str,
    ) -> Result<Vec<u8>, ErrorCode>;

    fn change_password(
        &mut self,
        wallet_id: &str,
        old: &Password,
        new: &Password,
    ) -> Result<(), ErrorCode>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! An in-memory wallet registry for dispatcher tests.

    use std::collections::BTreeMap;

    use super::*;

    pub struct MemoryWallet {
        pub info: WalletInfo,
        pub password: Password,
        pub used_addresses: Vec<Address>,
        pub default_address_type: AddressType,
        /// Root id; equals `info.wallet_id` for roots.
        pub root: WalletId,
        pub hardware: bool,
    }

    #[derive(Default)]
    pub struct MemoryWalletRegistry {
        pub wallets: BTreeMap<WalletId, MemoryWallet>,
        pub control_password: Password,
        /// Counts every operation that would open a wallet file on disk.
        pub wallet_opens: u64,
        /// When set, `change_control_password` fails partway through.
        pub fail_control_reencrypt: bool,
    }

    impl MemoryWalletRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// A root wallet with one password and a couple of used addresses.
        pub fn add_wallet(
            &mut self,
            wallet_id: &str,
            password: &str,
            watch_only: bool,
        ) {
            let used_addresses = (0..4)
                .map(|i| derived_address(wallet_id, 0, i))
                .collect();
            self.wallets.insert(
                wallet_id.to_owned(),
                MemoryWallet {
                    info: WalletInfo {
                        wallet_id: wallet_id.to_owned(),
                        name: format!("wallet {wallet_id}"),
                        net_type: NetType::Testnet,
                        has_password: !password.is_empty(),
                        watch_only,
                    },
                    password: Password::new(password),
                    used_addresses,
                    default_address_type: AddressType::NativeSegwit,
                    root: wallet_id.to_owned(),
                    hardware: false,
                },
            );
        }
    }

    /// Deterministic fake derivation: unique per (root, branch, index).
    pub fn derived_address(
        wallet_id: &str,
        branch: u32,
        index: u32,
    ) -> Address {
        Address::new(format!("addr-{wallet_id}-{branch}-{index}"))
    }

    impl WalletRegistry for MemoryWalletRegistry {
        fn load_wallets(
            &mut self,
            control_password: &Password,
        ) -> Result<(), ErrorCode> {
            if self.control_password.ct_eq(control_password) {
                Ok(())
            } else {
                Err(ErrorCode::InvalidPassword)
            }
        }

        fn change_control_password(
            &mut self,
            old: &Password,
            new: &Password,
        ) -> Result<(), ErrorCode> {
            if !self.control_password.ct_eq(old) {
                return Err(ErrorCode::InvalidPassword);
            }
            if self.fail_control_reencrypt {
                // A per-wallet step failed; the whole change is abandoned
                // and the old password stays in force.
                return Err(ErrorCode::InternalError);
            }
            self.control_password = new.clone();
            Ok(())
        }

        fn wallet_infos(&self) -> Vec<WalletInfo> {
            self.wallets.values().map(|w| w.info.clone()).collect()
        }

        fn hd_wallet(&self, wallet_id: &str) -> Option<Vec<HDGroup>> {
            let wallet = self.wallets.get(wallet_id)?;
            Some(vec![HDGroup {
                group_type: 0,
                leaves: vec![crate::api::HDLeaf {
                    id: wallet.info.wallet_id.clone(),
                    path: "m/84'/1'/0'".to_owned(),
                }],
            }])
        }

        fn wallet_sync(&self, wallet_id: &str) -> Option<SyncWalletResponse> {
            let wallet = self.wallets.get(wallet_id)?;
            Some(SyncWalletResponse {
                error_code: ErrorCode::NoError,
                wallet_id: wallet_id.to_owned(),
                highest_ext_index: wallet.used_addresses.len() as u32,
                highest_int_index: 0,
                addresses: wallet
                    .used_addresses
                    .iter()
                    .enumerate()
                    .map(|(i, addr)| crate::api::UsedAddress {
                        address: addr.clone(),
                        index: format!("0/{i}"),
                    })
                    .collect(),
            })
        }

        fn root_for(&self, wallet_id: &str) -> Option<WalletId> {
            self.wallets.get(wallet_id).map(|w| w.root.clone())
        }

        fn is_watch_only(&self, root_id: &str) -> bool {
            self.wallets
                .get(root_id)
                .map(|w| w.info.watch_only)
                .unwrap_or(false)
        }

        fn is_hardware(&self, root_id: &str) -> bool {
            self.wallets
                .get(root_id)
                .map(|w| w.hardware)
                .unwrap_or(false)
        }

        fn has_password(&self, root_id: &str) -> bool {
            self.wallets
                .get(root_id)
                .map(|w| w.info.has_password)
                .unwrap_or(false)
        }

        fn check_password(&self, root_id: &str, password: &Password) -> bool {
            self.wallets
                .get(root_id)
                .map(|w| w.password.ct_eq(password))
                .unwrap_or(false)
        }

        fn decrypt_node(
            &self,
            root_id: &str,
            password: &Password,
        ) -> Result<DecryptedNode, ErrorCode> {
            let wallet = self
                .wallets
                .get(root_id)
                .ok_or(ErrorCode::WalletNotFound)?;
            if !wallet.password.ct_eq(password) {
                return Err(ErrorCode::InvalidPassword);
            }
            Ok(DecryptedNode {
                xpriv: SecretBytes::new(
                    format!("xpriv-{root_id}").into_bytes(),
                ),
                seed: SecretBytes::new(vec![0x5e; 32]),
            })
        }

        fn is_used_address(
            &self,
            wallet_id: &str,
            address: &Address,
        ) -> bool {
            self.wallets
                .get(wallet_id)
                .map(|w| w.used_addresses.contains(address))
                .unwrap_or(false)
        }

        fn address_type(&self, address: &Address) -> Option<AddressType> {
            // Fake addresses are all "native segwit" unless marked.
            if address.0.starts_with("legacy-") {
                Some(AddressType::Legacy)
            } else {
                Some(AddressType::NativeSegwit)
            }
        }

        fn default_address_type(
            &self,
            wallet_id: &str,
        ) -> Option<AddressType> {
            self.wallets.get(wallet_id).map(|w| w.default_address_type)
        }

        fn derive_change_address(
            &self,
            root_id: &str,
            branch: u32,
            index: u32,
        ) -> Option<Address> {
            self.wallets.get(root_id)?;
            Some(derived_address(root_id, branch, index))
        }

        fn sign_offline(
            &mut self,
            request: &OfflineSignRequest,
            password: &Password,
        ) -> Result<Vec<u8>, ErrorCode> {
            self.wallet_opens += 1;
            let root_id = request
                .wallet_ids
                .first()
                .ok_or(ErrorCode::WalletNotFound)?;
            if !self.check_password(root_id, password) {
                return Err(ErrorCode::InvalidPassword);
            }
            // A fake "signed transaction" that binds the request shape.
            Ok(format!(
                "signed:{}:{}:{}",
                root_id,
                request.inputs.len(),
                request.outputs.len(),
            )
            .into_bytes())
        }

        fn create_wallet(
            &mut self,
            params: CreateWalletParams,
        ) -> Result<WalletInfo, ErrorCode> {
            self.wallet_opens += 1;
            let wallet_id = format!("w-{}", params.name);
            if self.wallets.contains_key(&wallet_id) {
                return Err(ErrorCode::WalletAlreadyPresent);
            }
            self.add_wallet(&wallet_id, params.password.expose(), false);
            Ok(self.wallets[&wallet_id].info.clone())
        }

        fn delete_wallet(&mut self, wallet_id: &str) -> Result<(), ErrorCode> {
            self.wallet_opens += 1;
            self.wallets
                .remove(wallet_id)
                .map(|_| ())
                .ok_or(ErrorCode::WalletNotFound)
        }

        fn import_watch_only(
            &mut self,
            content: &[u8],
            _filename: &str,
        ) -> Result<WalletInfo, ErrorCode> {
            self.wallet_opens += 1;
            let wallet_id = String::from_utf8(content.to_vec())
                .map_err(|_| ErrorCode::InternalError)?;
            self.add_wallet(&wallet_id, "", true);
            Ok(self.wallets[&wallet_id].info.clone())
        }

        fn export_watch_only(
            &mut self,
            wallet_id: &str,
        ) -> Result<Vec<u8>, ErrorCode> {
            self.wallet_opens += 1;
            self.wallets
                .get(wallet_id)
                .map(|w| format!("wo:{}", w.info.wallet_id).into_bytes())
                .ok_or(ErrorCode::WalletNotFound)
        }

        fn change_password(
            &mut self,
            wallet_id: &str,
            old: &Password,
            new: &Password,
        ) -> Result<(), ErrorCode> {
            self.wallet_opens += 1;
            if new.is_empty() {
                return Err(ErrorCode::MissingPassword);
            }
            let wallet = self
                .wallets
                .get_mut(wallet_id)
                .ok_or(ErrorCode::WalletNotFound)?;
            if !wallet.password.ct_eq(old) {
                return Err(ErrorCode::InvalidPassword);
            }
            wallet.password = new.clone();
            wallet.info.has_password = true;
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod testing_shared {
    //! A clonable handle around [`testing::MemoryWalletRegistry`] so tests
    //! can hand the dispatcher a registry and still inspect it afterwards.

    use std::sync::{Arc, Mutex, MutexGuard};

    use super::{
        testing::MemoryWalletRegistry, CreateWalletParams, DecryptedNode,
        WalletRegistry,
    };
    use crate::api::{
        Address, AddressType, ErrorCode, HDGroup, OfflineSignRequest,
        SyncWalletResponse, WalletId, WalletInfo,
    };
    use remsign_crypto::secret::Password;

    #[derive(Clone, Default)]
    pub struct SharedRegistry(Arc<Mutex<MemoryWalletRegistry>>);

    impl SharedRegistry {
        pub fn new(inner: MemoryWalletRegistry) -> Self {
            Self(Arc::new(Mutex::new(inner)))
        }

        pub fn lock(&self) -> MutexGuard<'_, MemoryWalletRegistry> {
            self.0.lock().expect("shared registry lock poisoned")
        }
    }

    impl WalletRegistry for SharedRegistry {
        fn load_wallets(
            &mut self,
            control_password: &Password,
        ) -> Result<(), ErrorCode> {
            self.lock().load_wallets(control_password)
        }

        fn change_control_password(
            &mut self,
            old: &Password,
            new: &Password,
        ) -> Result<(), ErrorCode> {
            self.lock().change_control_password(old, new)
        }

        fn wallet_infos(&self) -> Vec<WalletInfo> {
            self.lock().wallet_infos()
        }

        fn hd_wallet(&self, wallet_id: &str) -> Option<Vec<HDGroup>> {
            self.lock().hd_wallet(wallet_id)
        }

        fn wallet_sync(&self, wallet_id: &str) -> Option<SyncWalletResponse> {
            self.lock().wallet_sync(wallet_id)
        }

        fn root_for(&self, wallet_id: &str) -> Option<WalletId> {
            self.lock().root_for(wallet_id)
        }

        fn is_watch_only(&self, root_id: &str) -> bool {
            self.lock().is_watch_only(root_id)
        }

        fn is_hardware(&self, root_id: &str) -> bool {
            self.lock().is_hardware(root_id)
        }

        fn has_password(&self, root_id: &str) -> bool {
            self.lock().has_password(root_id)
        }

        fn check_password(&self, root_id: &str, password: &Password) -> bool {
            self.lock().check_password(root_id, password)
        }

        fn decrypt_node(
            &self,
            root_id: &str,
            password: &Password,
        ) -> Result<DecryptedNode, ErrorCode> {
            self.lock().decrypt_node(root_id, password)
        }

        fn is_used_address(&self, wallet_id: &str, address: &Address) -> bool {
            self.lock().is_used_address(wallet_id, address)
        }

        fn address_type(&self, address: &Address) -> Option<AddressType> {
            self.lock().address_type(address)
        }

        fn default_address_type(
            &self,
            wallet_id: &str,
        ) -> Option<AddressType> {
            self.lock().default_address_type(wallet_id)
        }

        fn derive_change_address(
            &self,
            root_id: &str,
            branch: u32,
            index: u32,
        ) -> Option<Address> {
            self.lock().derive_change_address(root_id, branch, index)
        }

        fn sign_offline(
            &mut self,
            request: &OfflineSignRequest,
            password: &Password,
        ) -> Result<Vec<u8>, ErrorCode> {
            self.lock().sign_offline(request, password)
        }

        fn create_wallet(
            &mut self,
            params: CreateWalletParams,
        ) -> Result<WalletInfo, ErrorCode> {
            self.lock().create_wallet(params)
        }

        fn delete_wallet(&mut self, wallet_id: &str) -> Result<(), ErrorCode> {
            self.lock().delete_wallet(wallet_id)
        }

        fn import_watch_only(
            &mut self,
            content: &[u8],
            filename: &str,
        ) -> Result<WalletInfo, ErrorCode> {
            self.lock().import_watch_only(content, filename)
        }

        fn export_watch_only(
            &mut self,
            wallet_id: &str,
        ) -> Result<Vec<u8>, ErrorCode> {
            self.lock().export_watch_only(wallet_id)
        }

        fn change_password(
            &mut self,
            wallet_id: &str,
            old: &Password,
            new: &Password,
        ) -> Result<(), ErrorCode> {
            self.lock().change_password(wallet_id, old, new)
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use testing_shared::SharedRegistry;
