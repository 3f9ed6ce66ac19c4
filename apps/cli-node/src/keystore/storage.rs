//! Storage functionality for the keystore module.
//!
//! Wallet files live at `<base>/wallets/<device_id>/<curve>/<wallet>.dat`,
//! one UTF-8 JSON `WalletFile` each. The keystore holds a metadata cache
//! rebuilt by scanning that tree, plus the session password captured by
//! `unlock`. Decrypted shares are handed out as owned byte vectors; nothing
//! shares secret memory with the caller.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tracing::{info, warn};

use super::{
    KeystoreError, Result,
    encryption::{self, KeyDerivation},
    models::{WALLET_FILE_VERSION, WalletFile, WalletMetadata},
};

/// Main keystore interface
pub struct Keystore {
    /// Base path for keystore files
    base_path: PathBuf,

    /// Unique identifier for this device
    device_id: String,

    /// Cached wallet metadata for quick access
    wallet_cache: Vec<WalletMetadata>,

    /// Session password captured by `unlock`; `None` means locked.
    session_password: Option<String>,
}

const CURVE_DIRS: [&str; 2] = ["ed25519", "secp256k1"];

impl Keystore {
    /// Creates a keystore rooted at `base_path` for the given device,
    /// building the directory structure if needed and loading the metadata
    /// cache from any existing wallet files.
    pub fn new(base_path: impl AsRef<Path>, device_id: &str) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();

        let device_dir = base_path.join("wallets").join(device_id);
        for curve in CURVE_DIRS {
            fs::create_dir_all(device_dir.join(curve))?;
        }

        let mut keystore = Self {
            base_path,
            device_id: device_id.to_string(),
            wallet_cache: Vec::new(),
            session_password: None,
        };
        keystore.reload_wallet_cache()?;
        Ok(keystore)
    }

    /// Reloads the wallet cache by scanning all wallet files
    fn reload_wallet_cache(&mut self) -> Result<()> {
        self.wallet_cache.clear();

        let device_dir = self.base_path.join("wallets").join(&self.device_id);
        for curve in CURVE_DIRS {
            let curve_dir = device_dir.join(curve);
            if !curve_dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&curve_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|s| s.to_str()) != Some("dat") {
                    continue;
                }
                match File::open(&path).map_err(KeystoreError::from).and_then(|f| {
                    serde_json::from_reader::<_, WalletFile>(f).map_err(KeystoreError::from)
                }) {
                    Ok(wallet_file) => self.wallet_cache.push(wallet_file.metadata),
                    Err(e) => warn!(path = %path.display(), "skipping unreadable wallet file: {e}"),
                }
            }
        }
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_unlocked(&self) -> bool {
        self.session_password.is_some()
    }

    /// Unlocks the keystore with a password.
    ///
    /// When wallets exist, the password is verified by decrypting one entry;
    /// an empty keystore accepts the password provisionally and it becomes
    /// binding with the first `add_wallet`.
    pub fn unlock(&mut self, password: &str) -> Result<()> {
        if let Some(first) = self.wallet_cache.first() {
            let wallet_id = first.wallet_id.clone();
            let file = self.read_wallet_file(&wallet_id)?;
            let blob = BASE64
                .decode(&file.data)
                .map_err(|e| KeystoreError::General(format!("invalid wallet data: {e}")))?;
            encryption::decrypt_data(&blob, password, &file.algorithm)?;
        }
        self.session_password = Some(password.to_string());
        info!("keystore unlocked");
        Ok(())
    }

    /// Drops the session password; subsequent share access fails with
    /// `Locked` until the next unlock.
    pub fn lock(&mut self) {
        self.session_password = None;
    }

    /// Lists all wallets from the cache
    pub fn list_wallets(&self) -> Vec<&WalletMetadata> {
        self.wallet_cache.iter().collect()
    }

    /// Gets wallet metadata by ID
    pub fn get_wallet(&self, wallet_id: &str) -> Option<&WalletMetadata> {
        self.wallet_cache.iter().find(|w| w.wallet_id == wallet_id)
    }

    /// Adds a wallet: encrypts the key share under the session password and
    /// writes the wallet file. Fails with `Locked` when no unlock happened.
    pub fn add_wallet(&mut self, metadata: WalletMetadata, key_share: &[u8]) -> Result<String> {
        let password = self
            .session_password
            .clone()
            .ok_or(KeystoreError::Locked)?;

        // Sanitize the wallet id so it is a valid file name.
        let wallet_id = metadata
            .wallet_id
            .replace('/', "-")
            .replace('\\', "-")
            .replace(':', "-");
        if self.get_wallet(&wallet_id).is_some() {
            return Err(KeystoreError::WalletExists(wallet_id));
        }

        let mut metadata = metadata;
        metadata.wallet_id = wallet_id.clone();

        self.write_wallet_file(&metadata, key_share, &password, KeyDerivation::Argon2id)?;
        self.wallet_cache.push(metadata);
        Ok(wallet_id)
    }

    /// Decrypts and returns a wallet's key share bytes.
    pub fn get_key_share(&self, wallet_id: &str) -> Result<Vec<u8>> {
        let password = self
            .session_password
            .as_deref()
            .ok_or(KeystoreError::Locked)?;

        let file = self.read_wallet_file(wallet_id)?;
        let blob = BASE64
            .decode(&file.data)
            .map_err(|e| KeystoreError::General(format!("invalid wallet data: {e}")))?;
        encryption::decrypt_data(&blob, password, &file.algorithm)
    }

    /// Returns the wallet file as stored, for sharing or backup.
    pub fn export_wallet(&self, wallet_id: &str) -> Result<WalletFile> {
        self.read_wallet_file(wallet_id)
    }

    /// Imports a wallet file produced by any compliant implementation.
    ///
    /// The password must decrypt the embedded data (the algorithm header
    /// decides the KDF); `participant_index` and the group key come over
    /// verbatim and stay immutable.
    pub fn import_wallet(&mut self, file: WalletFile, password: &str) -> Result<String> {
        let blob = BASE64
            .decode(&file.data)
            .map_err(|e| KeystoreError::General(format!("invalid wallet data: {e}")))?;
        let key_share = encryption::decrypt_data(&blob, password, &file.algorithm)?;

        let mut metadata = file.metadata;
        metadata.device_id = self.device_id.clone();
        metadata.touch();

        if self.get_wallet(&metadata.wallet_id).is_some() {
            return Err(KeystoreError::WalletExists(metadata.wallet_id));
        }

        // Re-encrypt under the session password when unlocked, otherwise
        // adopt the import password for this entry as-is.
        let store_password = self
            .session_password
            .clone()
            .unwrap_or_else(|| password.to_string());
        self.write_wallet_file(
            &metadata,
            &key_share,
            &store_password,
            KeyDerivation::Argon2id,
        )?;
        let wallet_id = metadata.wallet_id.clone();
        self.wallet_cache.push(metadata);
        if self.session_password.is_none() {
            self.session_password = Some(password.to_string());
        }
        Ok(wallet_id)
    }

    /// Removes a wallet file and forgets it.
    pub fn remove_wallet(&mut self, wallet_id: &str) -> Result<()> {
        let wallet = self
            .get_wallet(wallet_id)
            .ok_or_else(|| KeystoreError::WalletNotFound(wallet_id.to_string()))?;
        let path = self.wallet_path(&wallet.curve_type, wallet_id);
        fs::remove_file(path)?;
        self.wallet_cache.retain(|w| w.wallet_id != wallet_id);
        Ok(())
    }

    fn wallet_path(&self, curve_type: &str, wallet_id: &str) -> PathBuf {
        self.base_path
            .join("wallets")
            .join(&self.device_id)
            .join(curve_type)
            .join(format!("{}.dat", wallet_id))
    }

    fn read_wallet_file(&self, wallet_id: &str) -> Result<WalletFile> {
        let wallet = self
            .get_wallet(wallet_id)
            .ok_or_else(|| KeystoreError::WalletNotFound(wallet_id.to_string()))?;
        let path = self.wallet_path(&wallet.curve_type, wallet_id);
        let file = File::open(&path)?;
        Ok(serde_json::from_reader(file)?)
    }

    fn write_wallet_file(
        &self,
        metadata: &WalletMetadata,
        key_share: &[u8],
        password: &str,
        method: KeyDerivation,
    ) -> Result<()> {
        let wallet_dir = self
            .base_path
            .join("wallets")
            .join(&self.device_id)
            .join(&metadata.curve_type);
        fs::create_dir_all(&wallet_dir)?;

        let encrypted = encryption::encrypt_data_with_method(key_share, password, method)?;
        let wallet_file = WalletFile {
            version: WALLET_FILE_VERSION.to_string(),
            encrypted: true,
            algorithm: method.algorithm_string().to_string(),
            data: BASE64.encode(&encrypted),
            metadata: metadata.clone(),
        };

        let path = wallet_dir.join(format!("{}.dat", metadata.wallet_id));
        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, &wallet_file)?;
        Ok(())
    }
}
