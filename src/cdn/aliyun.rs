//! Aliyun CDN: domain inventory through DescribeUserDomains, certificate
//! upload through SetCdnDomainSSLCertificate

use super::{CdnProvider, DomainCertificateStatus};
use crate::aliyun::AliyunClient;
use crate::tls::expiry_probe::probe_certificate;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info};

pub const CDN_API_VERSION: &str = "2018-05-10";
const PAGE_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct AliyunCdnProvider {
    client: AliyunClient,
    probe_port: u16,
    probe_timeout: Duration,
}

impl AliyunCdnProvider {
    pub fn new(
        endpoint: &str,
        access_key_id: String,
        access_key_secret: String,
        probe_port: u16,
        probe_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: AliyunClient::new(endpoint, CDN_API_VERSION, access_key_id, access_key_secret)?,
            probe_port,
            probe_timeout,
        })
    }

    async fn domain_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page = 1usize;

        loop {
            let mut params = BTreeMap::new();
            params.insert("PageSize".to_string(), PAGE_SIZE.to_string());
            params.insert("PageNumber".to_string(), page.to_string());

            let response = self.client.get("DescribeUserDomains", params).await?;
            let batch = parse_domain_page(&response);
            let total = response["TotalCount"].as_u64().unwrap_or(0) as usize;
            let fetched = batch.len();
            names.extend(batch);

            if fetched < PAGE_SIZE || names.len() >= total {
                break;
            }
            page += 1;
        }

        Ok(names)
    }
}

fn parse_domain_page(response: &serde_json::Value) -> Vec<String> {
    response["Domains"]["PageData"]
        .as_array()
        .map(|domains| {
            domains
                .iter()
                .filter_map(|d| d["DomainName"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl CdnProvider for AliyunCdnProvider {
    async fn list_managed_domains(&self) -> Result<Vec<DomainCertificateStatus>> {
        let names = self.domain_names().await?;
        info!("Aliyun CDN manages {} domain(s)", names.len());

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            // Leading-dot wildcard entries are probed through their root
            let host = name.trim_start_matches('.');
            let mut status = probe_certificate(host, self.probe_port, self.probe_timeout).await;
            status.hostname = name;
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn deploy_certificate(
        &self,
        domain: &str,
        cert_name: &str,
        pem_chain: &str,
        pem_key: &str,
    ) -> Result<bool> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), domain.to_string());
        params.insert("CertName".to_string(), cert_name.to_string());
        params.insert("CertType".to_string(), "upload".to_string());
        params.insert("SSLProtocol".to_string(), "on".to_string());
        params.insert("SSLPub".to_string(), pem_chain.to_string());
        params.insert("SSLPri".to_string(), pem_key.to_string());

        match self.client.post_form("SetCdnDomainSSLCertificate", params).await {
            Ok(response) => {
                info!(
                    domain = %domain,
                    cert_name = %cert_name,
                    request_id = response["RequestId"].as_str().unwrap_or("-"),
                    "Certificate uploaded to Aliyun CDN"
                );
                Ok(true)
            }
            Err(e) => {
                error!(domain = %domain, "Aliyun CDN rejected certificate: {:#}", e);
                Ok(false)
            }
        }
    }

    fn provider_name(&self) -> &str {
        "Aliyun CDN"
    }
}
