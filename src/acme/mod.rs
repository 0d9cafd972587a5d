//! ACME resource model and the transport seam used by the orchestrator

pub mod http;
pub mod key;

pub use http::HttpAcmeTransport;
pub use key::{dns_txt_value, AccountKey, DomainKey};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{AcmeError, Problem};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// A bound ACME account: its URL plus the key that authenticates it
#[derive(Debug, Clone)]
pub struct Account {
    url: String,
    key: Arc<AccountKey>,
}

impl Account {
    pub fn new(url: impl Into<String>, key: Arc<AccountKey>) -> Self {
        Self {
            url: url.into(),
            key,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }
}

/// Challenge types this crate knows how to satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(other)]
    Unsupported,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Processing => "processing",
            ChallengeStatus::Valid => "valid",
            ChallengeStatus::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// A single way of proving control over an identifier
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// Proof-of-control requirement for one domain of an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub url: String,
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn find_challenge(&self, kind: ChallengeType) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

/// A CA-tracked request to issue a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub url: String,
    pub status: OrderStatus,
    pub domains: Vec<String>,
    pub not_after: Option<DateTime<Utc>>,
    pub authorizations: Vec<String>,
    pub finalize_url: String,
    pub certificate_url: Option<String>,
}

/// The CA-facing capability the orchestrator consumes.
///
/// Implementations own nonce handling, request signing and wire retries; the
/// orchestrator only sees resources and typed errors.
#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Register a new account, agreeing to the terms of service. Returns the account URL.
    async fn new_account(&self, key: &AccountKey, contact_email: &str) -> Result<String, AcmeError>;

    /// Confirm a previously registered account still exists for this key
    async fn bind_account(&self, key: &AccountKey, account_url: &str) -> Result<(), AcmeError>;

    async fn new_order(
        &self,
        account: &Account,
        domains: &[String],
        not_after: Option<DateTime<Utc>>,
    ) -> Result<Order, AcmeError>;

    async fn fetch_authorization(&self, account: &Account, url: &str) -> Result<Authorization, AcmeError>;

    async fn fetch_challenge(&self, account: &Account, url: &str) -> Result<Challenge, AcmeError>;

    /// Tell the CA the challenge response is in place
    async fn trigger_challenge(&self, account: &Account, url: &str) -> Result<Challenge, AcmeError>;

    /// Submit the CSR and wait until the order is issued
    async fn finalize_order(&self, account: &Account, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError>;

    /// Download the issued chain as PEM, leaf first
    async fn download_certificate(&self, account: &Account, order: &Order) -> Result<String, AcmeError>;
}
