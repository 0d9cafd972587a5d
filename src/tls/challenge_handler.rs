//! Challenge handlers: publish the proof a CA checks, then take it down again

use anyhow::{Context, Result};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::acme::{dns_txt_value, ChallengeType};
use crate::error::ChallengeError;
use crate::tls::dns_provider::{challenge_record_name, DnsProvider};

/// Directory, relative to the webroot, that HTTP-01 tokens are served from
pub const HTTP_CHALLENGE_DIR: &str = ".well-known/acme-challenge";

/// ACME tokens are base64url; anything else could escape the challenge directory
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// File an HTTP-01 token is published at
pub fn http_challenge_path(webroot: &Path, token: &str) -> PathBuf {
    webroot.join(HTTP_CHALLENGE_DIR).join(token)
}

pub enum ChallengeHandler {
    Http01 {
        domain: String,
        path: PathBuf,
        key_authorization: String,
    },
    Dns01 {
        domain: String,
        record_name: String,
        value: String,
        provider: Arc<dyn DnsProvider>,
    },
}

impl fmt::Debug for ChallengeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeHandler::Http01 { domain, path, .. } => f
                .debug_struct("Http01")
                .field("domain", domain)
                .field("path", path)
                .finish(),
            ChallengeHandler::Dns01 {
                domain,
                record_name,
                provider,
                ..
            } => f
                .debug_struct("Dns01")
                .field("domain", domain)
                .field("record_name", record_name)
                .field("provider", &provider.provider_name())
                .finish(),
        }
    }
}

impl ChallengeHandler {
    pub fn http01(
        webroot: &Path,
        domain: &str,
        token: &str,
        key_authorization: String,
    ) -> Result<Self, ChallengeError> {
        if !is_valid_token(token) {
            return Err(ChallengeError::Prepare {
                domain: domain.to_string(),
                source: anyhow::anyhow!("CA sent malformed token {:?}", token),
            });
        }
        Ok(ChallengeHandler::Http01 {
            domain: domain.to_string(),
            path: http_challenge_path(webroot, token),
            key_authorization,
        })
    }

    pub fn dns01(domain: &str, key_authorization: &str, provider: Arc<dyn DnsProvider>) -> Self {
        ChallengeHandler::Dns01 {
            domain: domain.to_string(),
            record_name: challenge_record_name(domain),
            value: dns_txt_value(key_authorization),
            provider,
        }
    }

    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            ChallengeHandler::Http01 { .. } => ChallengeType::Http01,
            ChallengeHandler::Dns01 { .. } => ChallengeType::Dns01,
        }
    }

    /// Identity of the external resource this handler mutates
    pub fn resource_key(&self) -> String {
        match self {
            ChallengeHandler::Http01 { path, .. } => format!("http-01:{}", path.display()),
            ChallengeHandler::Dns01 { record_name, .. } => format!("dns-01:{}", record_name),
        }
    }

    /// Make the proof reachable by the CA
    pub async fn prepare(&self) -> Result<()> {
        match self {
            ChallengeHandler::Http01 {
                path,
                key_authorization,
                ..
            } => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                tokio::fs::write(path, key_authorization)
                    .await
                    .with_context(|| format!("Failed to write challenge file {}", path.display()))?;
                debug!("HTTP challenge file deployed: {}", path.display());
            }
            ChallengeHandler::Dns01 {
                record_name,
                value,
                provider,
                ..
            } => {
                provider
                    .add_txt_record(record_name, value)
                    .await
                    .with_context(|| format!("{} failed to add {}", provider.provider_name(), record_name))?;
                debug!("DNS record added: {}={}", record_name, value);
            }
        }
        Ok(())
    }

    /// For DNS-01, ask the provider whether the record is visible. HTTP-01 is
    /// always considered propagated.
    pub async fn check_propagation(&self) -> Result<bool> {
        match self {
            ChallengeHandler::Http01 { .. } => Ok(true),
            ChallengeHandler::Dns01 {
                record_name,
                value,
                provider,
                ..
            } => provider.check_propagation(record_name, value).await,
        }
    }

    /// Best-effort removal; failures are logged, never returned
    pub async fn cleanup(&self) {
        match self {
            ChallengeHandler::Http01 { domain, path, .. } => match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed challenge file {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(domain = %domain, "Failed to remove challenge file {}: {}", path.display(), e),
            },
            ChallengeHandler::Dns01 {
                domain,
                record_name,
                provider,
                ..
            } => {
                if let Err(e) = provider.remove_txt_record(record_name).await {
                    warn!(domain = %domain, "Failed to remove DNS record {}: {:#}", record_name, e);
                }
            }
        }
    }
}
