//! CDN abstraction: the managed-domain inventory and certificate upload

pub mod aliyun;
pub mod factory;

pub use aliyun::AliyunCdnProvider;
pub use factory::create_cdn_provider;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Validity of the certificate a managed domain currently serves.
/// `not_after == None` means no certificate is deployed (or it could not be read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainCertificateStatus {
    pub hostname: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl DomainCertificateStatus {
    pub fn without_certificate(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            not_before: None,
            not_after: None,
        }
    }
}

#[async_trait]
pub trait CdnProvider: Send + Sync {
    /// Every domain the CDN serves, with its live certificate validity
    async fn list_managed_domains(&self) -> Result<Vec<DomainCertificateStatus>>;

    /// Upload a PEM chain + key and bind it to `domain` under `cert_name`.
    /// `Ok(false)` means the CDN answered but refused the certificate.
    async fn deploy_certificate(
        &self,
        domain: &str,
        cert_name: &str,
        pem_chain: &str,
        pem_key: &str,
    ) -> Result<bool>;

    fn provider_name(&self) -> &str;
}
