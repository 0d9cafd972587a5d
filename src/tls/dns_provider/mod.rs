//! DNS provider abstraction for ACME DNS-01 challenge validation

pub mod aliyun;
pub mod factory;

pub use aliyun::AliyunDnsProvider;
pub use factory::create_dns_provider;

use anyhow::Result;
use async_trait::async_trait;

/// DNS provider trait for ACME DNS-01 challenge operations.
///
/// Record names are fully qualified, e.g. `_acme-challenge.www.example.com`.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publish a TXT record
    async fn add_txt_record(&self, name: &str, value: &str) -> Result<()>;

    /// Remove every TXT record at `name`
    async fn remove_txt_record(&self, name: &str) -> Result<()>;

    /// Whether the record is visible with the expected value
    async fn check_propagation(&self, name: &str, value: &str) -> Result<bool>;

    /// Get provider name for logging
    fn provider_name(&self) -> &str;
}

/// Extract the base domain for DNS operations
/// Examples:
/// - "example.com" -> "example.com"
/// - "www.example.com" -> "example.com"
/// - "_acme-challenge.sub.example.com" -> "example.com"
pub fn extract_base_domain(domain: &str) -> String {
    let domain = domain.trim_end_matches('.');
    let parts: Vec<&str> = domain.split('.').collect();

    if parts.len() >= 2 {
        format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1])
    } else {
        domain.to_string()
    }
}

/// Split a record name into (host record, base domain).
/// `_acme-challenge.www.example.com` -> (`_acme-challenge.www`, `example.com`)
pub fn split_record_name(name: &str) -> (String, String) {
    let name = name.trim_end_matches('.');
    let base = extract_base_domain(name);
    let rr = name
        .strip_suffix(base.as_str())
        .map(|rest| rest.trim_end_matches('.'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or("@");
    (rr.to_string(), base)
}

/// Record name a DNS-01 challenge for `domain` is published under
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}
