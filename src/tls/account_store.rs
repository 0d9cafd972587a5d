//! ACME account persistence: the encrypted account keystore plus a small
//! properties file recording which account URL the key is registered under.

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::acme::{Account, AccountKey, AcmeTransport};
use crate::config::AcmeConfig;
use crate::error::RenewalError;

const KEY_ACCOUNT_URL: &str = "account.url";
const KEY_FINGERPRINT: &str = "account.key_fingerprint";

/// Persisted account reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub url: String,
    pub key_fingerprint: String,
}

impl AccountRecord {
    /// Parse `key=value` lines; `#` and `!` start comments
    pub fn parse(contents: &str) -> Option<Self> {
        let mut url = None;
        let mut fingerprint = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = unescape(value.trim());
            match key.trim() {
                KEY_ACCOUNT_URL => url = Some(value),
                KEY_FINGERPRINT => fingerprint = Some(value),
                _ => {}
            }
        }

        Some(Self {
            url: url.filter(|u| !u.is_empty())?,
            key_fingerprint: fingerprint.unwrap_or_default(),
        })
    }

    pub fn to_properties(&self) -> String {
        format!(
            "# ACME account information\n{}={}\n{}={}\n",
            KEY_ACCOUNT_URL, self.url, KEY_FINGERPRINT, self.key_fingerprint
        )
    }
}

/// Drop properties-style backslash escapes (`\:` -> `:`)
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Write `contents` next to `path` and rename over it
fn write_atomic(path: &Path, contents: &[u8], clobber: bool) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    if clobber {
        tmp.persist(path)
            .map_err(|e| anyhow!("Failed to persist {}: {}", path.display(), e.error))?;
    } else {
        tmp.persist_noclobber(path)
            .map_err(|e| anyhow!("Failed to persist {}: {}", path.display(), e.error))?;
    }
    Ok(())
}

/// Owns the account key and the bound account for the life of the process
pub struct AccountStore {
    transport: Arc<dyn AcmeTransport>,
    keystore_path: PathBuf,
    keystore_password: String,
    account_file: PathBuf,
    contact_email: String,
    account: Mutex<Option<Account>>,
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore")
            .field("keystore_path", &self.keystore_path)
            .field("account_file", &self.account_file)
            .field("contact_email", &self.contact_email)
            .finish()
    }
}

impl AccountStore {
    pub fn new(transport: Arc<dyn AcmeTransport>, config: &AcmeConfig) -> Self {
        Self {
            transport,
            keystore_path: PathBuf::from(&config.keystore_path),
            keystore_password: config.keystore_password.clone(),
            account_file: PathBuf::from(&config.account_file),
            contact_email: config.contact_email.clone(),
            account: Mutex::new(None),
        }
    }

    /// The bound account, initializing it on first use
    pub async fn get_or_create_account(&self) -> Result<Account, RenewalError> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let account = self.initialize().await.map_err(RenewalError::AccountInit)?;
        *cached = Some(account.clone());
        Ok(account)
    }

    async fn initialize(&self) -> Result<Account> {
        let key = Arc::new(self.load_or_create_key().await?);

        if let Some(record) = self.load_trusted_record(&key)? {
            match self.transport.bind_account(&key, &record.url).await {
                Ok(()) => {
                    info!("Using existing ACME account {}", record.url);
                    return Ok(Account::new(record.url, key));
                }
                Err(e) => warn!("Stored account {} could not be bound, registering anew: {}", record.url, e),
            }
        }

        let url = self
            .transport
            .new_account(&key, &self.contact_email)
            .await
            .context("Failed to register ACME account")?;
        info!("Registered ACME account {}", url);

        self.save_record(&AccountRecord {
            url: url.clone(),
            key_fingerprint: key.fingerprint()?,
        })?;

        Ok(Account::new(url, key))
    }

    /// Load the keystore, generating and persisting a new key when none exists
    pub async fn load_or_create_key(&self) -> Result<AccountKey> {
        match self.load_key()? {
            Some(key) => Ok(key),
            None => {
                info!("No account keystore at {}, generating key", self.keystore_path.display());
                let key = tokio::task::spawn_blocking(AccountKey::generate)
                    .await
                    .context("Key generation task failed")??;

                let pem = key.to_encrypted_pem(&self.keystore_password)?;
                write_atomic(&self.keystore_path, pem.as_bytes(), false)?;
                info!("New account key saved to {}", self.keystore_path.display());
                Ok(key)
            }
        }
    }

    fn load_key(&self) -> Result<Option<AccountKey>> {
        let pem = match std::fs::read_to_string(&self.keystore_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read keystore: {}", self.keystore_path.display()))
            }
        };
        let key = AccountKey::from_encrypted_pem(&pem, &self.keystore_password)
            .with_context(|| format!("Failed to load keystore: {}", self.keystore_path.display()))?;
        Ok(Some(key))
    }

    /// Whether `key` is the key stored in the keystore
    pub fn validate_key_pair(&self, key: &AccountKey) -> Result<bool> {
        Ok(self.load_key()?.is_some_and(|stored| stored.matches(key)))
    }

    pub fn load_record(&self) -> Result<Option<AccountRecord>> {
        match std::fs::read_to_string(&self.account_file) {
            Ok(contents) => Ok(AccountRecord::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.account_file.display())),
        }
    }

    /// The stored record, only if it belongs to `key`
    fn load_trusted_record(&self, key: &AccountKey) -> Result<Option<AccountRecord>> {
        let Some(record) = self.load_record()? else {
            return Ok(None);
        };

        if !self.validate_key_pair(key)? {
            warn!("Account key does not match keystore, ignoring stored account");
            return Ok(None);
        }
        if record.key_fingerprint != key.fingerprint()? {
            warn!("Stored account {} was registered with a different key", record.url);
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn save_record(&self, record: &AccountRecord) -> Result<()> {
        write_atomic(&self.account_file, record.to_properties().as_bytes(), true)
            .context("Failed to save account record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let record = AccountRecord {
            url: "https://ca.test/acct/17".to_string(),
            key_fingerprint: "abcd".to_string(),
        };
        assert_eq!(AccountRecord::parse(&record.to_properties()), Some(record));
    }

    #[test]
    fn test_record_parses_escaped_properties() {
        let contents = "#ACME Account Information\n#Fri Mar 21 10:00:00 CST 2025\naccount.url=https\\://ca.test/acct/9\n";
        let record = AccountRecord::parse(contents).unwrap();
        assert_eq!(record.url, "https://ca.test/acct/9");
        assert_eq!(record.key_fingerprint, "");
    }

    #[test]
    fn test_record_without_url_is_absent() {
        assert!(AccountRecord::parse("account.key_fingerprint=abcd\n").is_none());
        assert!(AccountRecord::parse("").is_none());
    }

    #[test]
    fn test_write_atomic_noclobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/key.pem");
        write_atomic(&path, b"one", false).unwrap();
        assert!(write_atomic(&path, b"two", false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");

        write_atomic(&path, b"three", true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "three");
    }
}
