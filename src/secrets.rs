//! Encrypted-at-rest storage for the preview API key.
//!
//! A config value of the form `{encrypted}<base64(nonce || ciphertext)>` is
//! decrypted at startup with an AES-256-GCM key kept under the secret home
//! directory. The key is stored XOR-masked across two files so neither file on
//! its own reveals it.

use crate::config::Config;
use aes_gcm::{aead::{Aead, KeyInit}, Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use log::{info, warn};
use prometheus::{IntCounter, Opts, Registry};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const ENCRYPTED_PREFIX: &str = "{encrypted}";
const KEY_FILE: &str = "master.key";
const MASK_FILE: &str = "master.mask";
const ENV_OVERRIDE: &str = "PREVIEW_BRIDGE_SECRET_HOME";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("unable to locate a home directory for secrets")]
    MissingHomeDir,

    #[error("secret storage directory already contains a master key")]
    KeyAlreadyInitialized,

    #[error("encryption key has not been initialized yet")]
    KeyNotInitialized,

    #[error("secret storage directory permissions are insecure (expected 0700)")]
    InsecurePermissions,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("invalid encrypted payload: {0}")]
    InvalidPayload(String),

    #[error("decrypted secret is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

struct SecretTelemetry {
    decrypt_success: IntCounter,
    decrypt_failure: IntCounter,
}

fn telemetry() -> &'static SecretTelemetry {
    static TELEMETRY: OnceLock<SecretTelemetry> = OnceLock::new();
    TELEMETRY.get_or_init(|| {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).namespace("preview_bridge"))
                .expect("static counter options are valid")
        };
        SecretTelemetry {
            decrypt_success: counter(
                "secret_decrypt_success_total",
                "Encrypted configuration values decrypted at startup",
            ),
            decrypt_failure: counter(
                "secret_decrypt_failure_total",
                "Encrypted configuration values that failed to decrypt",
            ),
        }
    })
}

pub fn register_secret_metrics(registry: &Registry) {
    let t = telemetry();
    for counter in [&t.decrypt_success, &t.decrypt_failure] {
        if let Err(err) = registry.register(Box::new(counter.clone())) {
            warn!("Failed to register secret metric: {}", err);
        }
    }
}

pub struct SecretManager {
    root_dir: PathBuf,
}

impl SecretManager {
    /// Manager rooted at `~/.preview-bridge` or `$PREVIEW_BRIDGE_SECRET_HOME`.
    pub fn new() -> Result<Self, SecretError> {
        Ok(Self { root_dir: resolve_secret_home()? })
    }

    pub fn with_root(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    pub fn encrypted_prefix() -> &'static str {
        ENCRYPTED_PREFIX
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    pub fn init_encryption_key(&self, overwrite: bool) -> Result<(), SecretError> {
        self.ensure_root_dir()?;
        if !overwrite && self.key_material_exists() {
            return Err(SecretError::KeyAlreadyInitialized);
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        let mut mask = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut mask[..]);

        let masked: Zeroizing<Vec<u8>> =
            Zeroizing::new(key.iter().zip(mask.iter()).map(|(k, m)| k ^ m).collect());
        fs::write(self.root_dir.join(MASK_FILE), general_purpose::STANDARD.encode(&mask[..]))?;
        fs::write(self.root_dir.join(KEY_FILE), general_purpose::STANDARD.encode(&masked[..]))?;

        info!("Initialized encryption key in {}", self.root_dir.display());
        Ok(())
    }

    /// Encrypt `payload` into the `{encrypted}<base64>` form accepted in config files.
    pub fn encrypt_payload(&self, payload: &[u8]) -> Result<String, SecretError> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|e| SecretError::Encryption(e.to_string()))?;

        let mut bundle = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        bundle.extend_from_slice(&nonce);
        bundle.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", ENCRYPTED_PREFIX, general_purpose::STANDARD.encode(bundle)))
    }

    pub fn decrypt_secret_string(&self, value: &str) -> Result<String, SecretError> {
        let cipher = self.cipher()?;
        let payload = value.strip_prefix(ENCRYPTED_PREFIX).unwrap_or(value);
        let bundle = general_purpose::STANDARD.decode(payload.trim())?;
        if bundle.len() <= NONCE_SIZE {
            return Err(SecretError::InvalidPayload(
                "payload too small to contain nonce and ciphertext".to_string(),
            ));
        }
        let (nonce, ciphertext) = bundle.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SecretError::Encryption(e.to_string()))?;
        Ok(String::from_utf8(plaintext)?)
    }

    /// Decrypt `field` in place when it carries the encrypted prefix.
    pub fn decrypt_option_field(
        &self,
        field: &mut Option<String>,
        field_name: &str,
    ) -> Result<bool, SecretError> {
        let Some(current) = field.as_mut() else {
            return Ok(false);
        };
        if !Self::is_encrypted(current) {
            return Ok(false);
        }
        match self.decrypt_secret_string(current) {
            Ok(secret) => {
                *current = secret;
                telemetry().decrypt_success.inc();
                info!("Decrypted encrypted secret for {}", field_name);
                Ok(true)
            }
            Err(err) => {
                telemetry().decrypt_failure.inc();
                Err(err)
            }
        }
    }

    pub fn apply_to_config(&self, config: &mut Config) -> Result<(), SecretError> {
        self.decrypt_option_field(&mut config.preview_api.api_key, "preview_api.api_key")?;
        Ok(())
    }

    fn cipher(&self) -> Result<Aes256Gcm, SecretError> {
        let key = self.recover_key()?;
        Aes256Gcm::new_from_slice(&key[..]).map_err(|e| SecretError::Encryption(e.to_string()))
    }

    fn recover_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, SecretError> {
        if !self.key_material_exists() {
            return Err(SecretError::KeyNotInitialized);
        }
        #[cfg(unix)]
        enforce_permissions(&self.root_dir)?;

        let mask = read_key_file(&self.root_dir.join(MASK_FILE))?;
        let masked = read_key_file(&self.root_dir.join(KEY_FILE))?;
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = masked[i] ^ mask[i];
        }
        Ok(key)
    }

    fn key_material_exists(&self) -> bool {
        self.root_dir.join(KEY_FILE).exists() && self.root_dir.join(MASK_FILE).exists()
    }

    fn ensure_root_dir(&self) -> Result<(), SecretError> {
        if !self.root_dir.exists() {
            fs::create_dir_all(&self.root_dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.root_dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        #[cfg(unix)]
        enforce_permissions(&self.root_dir)?;
        Ok(())
    }
}

fn read_key_file(path: &Path) -> Result<Zeroizing<Vec<u8>>, SecretError> {
    let encoded = Zeroizing::new(fs::read_to_string(path)?);
    let decoded = Zeroizing::new(general_purpose::STANDARD.decode(encoded.trim())?);
    if decoded.len() != KEY_SIZE {
        return Err(SecretError::InvalidPayload(format!(
            "{} has invalid length",
            path.display()
        )));
    }
    Ok(decoded)
}

#[cfg(unix)]
fn enforce_permissions(path: &Path) -> Result<(), SecretError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(SecretError::InsecurePermissions);
    }
    Ok(())
}

fn resolve_secret_home() -> Result<PathBuf, SecretError> {
    if let Ok(dir) = std::env::var(ENV_OVERRIDE) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(SecretError::MissingHomeDir)?;
    Ok(home.join(".preview-bridge"))
}

pub fn config_has_encrypted_values(config: &Config) -> bool {
    config
        .preview_api
        .api_key
        .as_deref()
        .map(SecretManager::is_encrypted)
        .unwrap_or(false)
}
