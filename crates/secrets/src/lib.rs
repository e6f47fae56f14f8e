use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, bail};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use core_types::{AccessToken, TokenStore};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA_VERSION: u32 = 1;

/// The one persisted name.
pub const TOKEN_KEY: &str = "access_token";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("the stored token is encrypted but no passphrase was provided")]
    MissingPassphrase,
}

#[derive(Serialize, Deserialize)]
struct PlainTokenFile {
    schema_version: u32,
    access_token: String,
}

#[derive(Serialize, Deserialize)]
struct EncryptedTokenFile {
    schema_version: u32,
    key: String,
    salt_b64: String,
    nonce_b64: String,
    ciphertext_b64: String,
}

/// File-backed [`TokenStore`], plain or passphrase-encrypted.
#[derive(Clone)]
pub struct TokenVault {
    root: PathBuf,
    passphrase: Option<String>,
}

impl TokenVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase.filter(|p| !p.is_empty());
        self
    }

    pub fn is_encrypted_mode(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self) -> Result<Option<AccessToken>> {
        let plain = self.plain_path();
        let encrypted = self.encrypted_path();

        let value = match (
            plain.exists(),
            encrypted.exists(),
            self.passphrase.as_deref(),
        ) {
            (false, false, _) => return Ok(None),
            (_, true, Some(passphrase)) => self.read_encrypted(passphrase)?,
            (false, true, None) => return Err(VaultError::MissingPassphrase.into()),
            (true, _, _) => self.read_plain()?,
        };
        Ok(Some(AccessToken::new(value)).filter(|token| !token.is_empty()))
    }

    fn write(&self, token: &AccessToken) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        if let Some(passphrase) = self.passphrase.as_deref() {
            let doc = encrypt_token(passphrase, token.as_str())?;
            let text = serde_json::to_string_pretty(&doc)?;
            fs::write(self.encrypted_path(), text)
                .with_context(|| format!("failed to write {}", self.encrypted_path().display()))?;
            remove_if_present(&self.plain_path())?;
            info!("session token persisted in encrypted mode");
            return Ok(());
        }

        let doc = PlainTokenFile {
            schema_version: SCHEMA_VERSION,
            access_token: token.as_str().to_string(),
        };
        let text = serde_json::to_string_pretty(&doc)?;
        fs::write(self.plain_path(), text)
            .with_context(|| format!("failed to write {}", self.plain_path().display()))?;
        remove_if_present(&self.encrypted_path())?;
        info!("session token persisted in plain mode");
        Ok(())
    }

    fn read_plain(&self) -> Result<String> {
        let text = fs::read_to_string(self.plain_path())?;
        let doc: PlainTokenFile =
            serde_json::from_str(&text).context("failed to parse token file")?;
        Ok(doc.access_token)
    }

    fn read_encrypted(&self, passphrase: &str) -> Result<String> {
        let text = fs::read_to_string(self.encrypted_path())?;
        let doc: EncryptedTokenFile =
            serde_json::from_str(&text).context("failed to parse encrypted token file")?;
        if doc.key != TOKEN_KEY {
            bail!("unexpected key `{}` in token file", doc.key);
        }
        decrypt_token(passphrase, &doc)
    }

    fn plain_path(&self) -> PathBuf {
        self.root.join("token.json")
    }

    fn encrypted_path(&self) -> PathBuf {
        self.root.join("token.enc.json")
    }
}

impl TokenStore for TokenVault {
    fn load(&self) -> Result<Option<AccessToken>> {
        self.read()
    }

    fn save(&self, token: &AccessToken) -> Result<()> {
        self.write(token)
    }

    fn clear(&self) -> Result<()> {
        remove_if_present(&self.plain_path())?;
        remove_if_present(&self.encrypted_path())?;
        debug!("persisted session token cleared");
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("failed to derive encryption key: {e}"))?;
    Ok(key)
}

fn encrypt_token(passphrase: &str, token: &str) -> Result<EncryptedTokenFile> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to build cipher")?;

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), token.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to encrypt token: {e}"))?;

    Ok(EncryptedTokenFile {
        schema_version: SCHEMA_VERSION,
        key: TOKEN_KEY.to_string(),
        salt_b64: BASE64.encode(salt),
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

fn decrypt_token(passphrase: &str, encrypted: &EncryptedTokenFile) -> Result<String> {
    let salt = BASE64.decode(&encrypted.salt_b64)?;
    let nonce_bytes = BASE64.decode(&encrypted.nonce_b64)?;
    let ciphertext = BASE64.decode(&encrypted.ciphertext_b64)?;

    if nonce_bytes.len() != 12 {
        bail!("invalid nonce length");
    }

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).context("failed to build cipher")?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to decrypt token: {e}"))?;
    String::from_utf8(plaintext).context("decrypted token is not utf-8")
}

pub fn default_session_dir_from(base_dir: &Path) -> PathBuf {
    base_dir.join("session")
}
