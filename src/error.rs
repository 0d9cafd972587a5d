//! Error types for the renewal pipeline and the ACME transport

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Problem type the CA uses for malformed requests (RFC 8555 §6.7)
pub const PROBLEM_MALFORMED: &str = "urn:ietf:params:acme:error:malformed";
/// Problem type signalling a stale replay nonce
pub const PROBLEM_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
/// Problem type returned when `onlyReturnExisting` finds no account
pub const PROBLEM_ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";

/// Detail fragment the CA uses when it refuses caller-chosen validity windows
const VALIDITY_WINDOW_REJECTION: &str = "NotBefore and NotAfter";

/// An RFC 7807 problem document returned by the CA
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Problem {
    /// Whether the CA refused an explicit notBefore/notAfter on a new order
    pub fn rejects_validity_window(&self) -> bool {
        self.problem_type == PROBLEM_MALFORMED
            && self
                .detail
                .as_deref()
                .is_some_and(|d| d.contains(VALIDITY_WINDOW_REJECTION))
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.problem_type == PROBLEM_BAD_NONCE
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", detail, self.problem_type),
            None => write!(f, "{}", self.problem_type),
        }
    }
}

/// Errors raised by an ACME transport
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CA rejected request: {0}")]
    Problem(Problem),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("request cancelled")]
    Cancelled,
}

impl AcmeError {
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            AcmeError::Problem(p) => Some(p),
            _ => None,
        }
    }
}

/// Outcome of a failed challenge validation
#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("no supported challenge offered for {0}")]
    Unsupported(String),

    #[error("DNS-01 selected for {0} but no DNS provider is configured")]
    NoDnsProvider(String),

    #[error("challenge for {domain} is {status}, expected pending")]
    UnexpectedState { domain: String, status: String },

    #[error("preparing challenge for {domain} failed: {source:#}")]
    Prepare {
        domain: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("CA marked challenge for {domain} invalid: {detail}")]
    Invalid { domain: String, detail: String },

    #[error("challenge for {domain} not validated after {attempts} attempts")]
    Timeout { domain: String, attempts: u32 },

    #[error("challenge processing cancelled")]
    Cancelled,

    #[error(transparent)]
    Acme(#[from] AcmeError),
}

/// Per-domain renewal failure, tagged with the pipeline stage that produced it
#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("account initialization failed: {0:#}")]
    AccountInit(#[source] anyhow::Error),

    #[error("order creation failed: {0}")]
    OrderCreation(#[source] AcmeError),

    #[error("challenge validation failed for {}", .failed_domains.join(", "))]
    ChallengeValidation { failed_domains: Vec<String> },

    #[error("order finalization failed: {0:#}")]
    Finalization(#[source] anyhow::Error),

    #[error("persisting certificate failed: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("deploying certificate failed: {0:#}")]
    Deployment(#[source] anyhow::Error),
}

impl RenewalError {
    /// Stable label for logs and metrics
    pub fn stage(&self) -> &'static str {
        match self {
            RenewalError::AccountInit(_) => "account",
            RenewalError::OrderCreation(_) => "order",
            RenewalError::ChallengeValidation { .. } => "challenge",
            RenewalError::Finalization(_) => "finalize",
            RenewalError::Persistence(_) => "persist",
            RenewalError::Deployment(_) => "deploy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_rejection_requires_exact_reason() {
        let rejection = Problem {
            problem_type: PROBLEM_MALFORMED.to_string(),
            detail: Some("NotBefore and NotAfter are not supported".to_string()),
            status: Some(400),
        };
        assert!(rejection.rejects_validity_window());

        let other_malformed = Problem {
            problem_type: PROBLEM_MALFORMED.to_string(),
            detail: Some("Invalid identifiers".to_string()),
            status: Some(400),
        };
        assert!(!other_malformed.rejects_validity_window());

        let rate_limited = Problem {
            problem_type: "urn:ietf:params:acme:error:rateLimited".to_string(),
            detail: Some("NotBefore and NotAfter".to_string()),
            status: Some(429),
        };
        assert!(!rate_limited.rejects_validity_window());
    }

    #[test]
    fn test_stage_labels() {
        let err = RenewalError::ChallengeValidation {
            failed_domains: vec!["a.example.com".to_string(), "b.example.com".to_string()],
        };
        assert_eq!(err.stage(), "challenge");
        assert_eq!(
            err.to_string(),
            "challenge validation failed for a.example.com, b.example.com"
        );
        assert_eq!(
            RenewalError::Deployment(anyhow::anyhow!("cdn down")).stage(),
            "deploy"
        );
    }
}
