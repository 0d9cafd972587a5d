//! Aliyun (Alibaba Cloud) DNS provider for ACME DNS-01 challenges

use super::{split_record_name, DnsProvider};
use crate::aliyun::AliyunClient;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const ALIDNS_API_VERSION: &str = "2015-01-09";

#[derive(Debug, Clone)]
pub struct AliyunDnsProvider {
    client: AliyunClient,
}

impl AliyunDnsProvider {
    pub fn new(endpoint: &str, access_key_id: String, access_key_secret: String) -> Result<Self> {
        Ok(Self {
            client: AliyunClient::new(endpoint, ALIDNS_API_VERSION, access_key_id, access_key_secret)?,
        })
    }

    /// Values of the TXT records currently published at `name`
    async fn txt_values(&self, name: &str) -> Result<Vec<String>> {
        let (_, base_domain) = split_record_name(name);

        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), base_domain);
        params.insert("SubDomain".to_string(), name.to_string());
        params.insert("Type".to_string(), "TXT".to_string());

        let response = self.client.get("DescribeSubDomainRecords", params).await?;

        let values = response["DomainRecords"]["Record"]
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| record["Value"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(values)
    }
}

#[async_trait]
impl DnsProvider for AliyunDnsProvider {
    async fn add_txt_record(&self, name: &str, value: &str) -> Result<()> {
        let (rr, base_domain) = split_record_name(name);

        info!("Creating TXT record on Aliyun: {} = {}", name, value);

        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), base_domain);
        params.insert("RR".to_string(), rr);
        params.insert("Type".to_string(), "TXT".to_string());
        params.insert("Value".to_string(), value.to_string());
        params.insert("TTL".to_string(), "600".to_string());

        let response = self.client.get("AddDomainRecord", params).await?;

        if let Some(record_id) = response["RecordId"].as_str() {
            info!("Created TXT record with ID: {}", record_id);
            Ok(())
        } else {
            Err(anyhow!("Failed to create TXT record: no RecordId in response"))
        }
    }

    async fn remove_txt_record(&self, name: &str) -> Result<()> {
        let (rr, base_domain) = split_record_name(name);

        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), base_domain);
        params.insert("RR".to_string(), rr);
        params.insert("Type".to_string(), "TXT".to_string());

        let response = self.client.get("DeleteSubDomainRecords", params).await?;
        let removed = response["TotalCount"]
            .as_str()
            .map(str::to_string)
            .or_else(|| response["TotalCount"].as_u64().map(|n| n.to_string()))
            .unwrap_or_else(|| "0".to_string());

        info!("Deleted {} TXT record(s) at {}", removed, name);
        Ok(())
    }

    async fn check_propagation(&self, name: &str, value: &str) -> Result<bool> {
        let values = self.txt_values(name).await?;
        debug!("TXT values at {}: {:?}", name, values);
        Ok(values.iter().any(|v| v == value))
    }

    fn provider_name(&self) -> &str {
        "Aliyun DNS"
    }
}
