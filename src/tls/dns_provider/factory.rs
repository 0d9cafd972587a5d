//! Factory for creating DNS provider instances from configuration

use super::{AliyunDnsProvider, DnsProvider};
use crate::config::DnsProviderConfig;
use anyhow::Result;
use std::sync::Arc;

/// Create a DNS provider instance from configuration
pub fn create_dns_provider(config: &DnsProviderConfig) -> Result<Arc<dyn DnsProvider>> {
    match config {
        DnsProviderConfig::Aliyun {
            access_key_id,
            access_key_secret,
            endpoint,
        } => Ok(Arc::new(AliyunDnsProvider::new(
            endpoint,
            access_key_id.clone(),
            access_key_secret.clone(),
        )?)),
    }
}
