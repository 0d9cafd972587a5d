use super::{AliyunCdnProvider, CdnProvider};
use crate::config::{CdnProviderConfig, RenewalConfig};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Create the CDN provider; the probe settings come from the renewal section
pub fn create_cdn_provider(config: &CdnProviderConfig, renewal: &RenewalConfig) -> Result<Arc<dyn CdnProvider>> {
    match config {
        CdnProviderConfig::Aliyun {
            access_key_id,
            access_key_secret,
            endpoint,
        } => Ok(Arc::new(AliyunCdnProvider::new(
            endpoint,
            access_key_id.clone(),
            access_key_secret.clone(),
            renewal.probe_port,
            Duration::from_secs(renewal.probe_timeout_secs),
        )?)),
    }
}
