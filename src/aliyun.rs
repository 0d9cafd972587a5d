//! Signed RPC client for Aliyun (Alibaba Cloud) OpenAPI, shared by the DNS and
//! CDN adapters

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

type HmacSha1 = Hmac<sha1::Sha1>;

/// RFC 3986 percent encoding for Aliyun API signature
/// Aliyun requires: %20 for spaces, %2A for *, %7E becomes ~
pub fn percent_encode(s: &str) -> String {
    urlencoding::encode(s)
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

/// Compute the signature for an already-complete parameter set.
///
/// The canonical query is the sorted, percent-encoded parameters; the string to
/// sign is `METHOD&%2F&<encoded canonical query>`; the key is `secret&`.
pub fn sign(method: &Method, params: &BTreeMap<String, String>, access_key_secret: &str) -> Result<String> {
    let canonical_query_string: String = params
        .iter()
        .map(|(key, value)| format!("{}={}", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    let string_to_sign = format!(
        "{}&%2F&{}",
        method.as_str(),
        percent_encode(&canonical_query_string)
    );

    let key = format!("{}&", access_key_secret);
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow!("Invalid Aliyun signing key: {}", e))?;
    mac.update(string_to_sign.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// One Aliyun product endpoint (alidns, cdn, ...) with its API version
#[derive(Clone)]
pub struct AliyunClient {
    endpoint: String,
    version: &'static str,
    access_key_id: String,
    access_key_secret: String,
    client: Client,
}

impl std::fmt::Debug for AliyunClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliyunClient")
            .field("endpoint", &self.endpoint)
            .field("version", &self.version)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<REDACTED>")
            .finish()
    }
}

impl AliyunClient {
    pub fn new(
        endpoint: impl Into<String>,
        version: &'static str,
        access_key_id: String,
        access_key_secret: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Aliyun HTTP client")?;

        Ok(Self {
            endpoint: endpoint.into(),
            version,
            access_key_id,
            access_key_secret,
            client,
        })
    }

    fn signed_params(
        &self,
        method: &Method,
        action: &str,
        params: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut params = params;
        params.insert("Action".to_string(), action.to_string());
        params.insert("AccessKeyId".to_string(), self.access_key_id.clone());
        params.insert("Format".to_string(), "JSON".to_string());
        params.insert("Version".to_string(), self.version.to_string());
        params.insert("SignatureMethod".to_string(), "HMAC-SHA1".to_string());
        params.insert("SignatureVersion".to_string(), "1.0".to_string());
        params.insert("SignatureNonce".to_string(), uuid::Uuid::new_v4().to_string());
        params.insert("Timestamp".to_string(), Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());

        let signature = sign(method, &params, &self.access_key_secret)?;
        params.insert("Signature".to_string(), signature);
        Ok(params)
    }

    /// Call an action with parameters in the query string
    pub async fn get(&self, action: &str, params: BTreeMap<String, String>) -> Result<serde_json::Value> {
        let params = self.signed_params(&Method::GET, action, params)?;
        let request = self.client.get(&self.endpoint).query(&params);
        self.send(action, request).await
    }

    /// Call an action with a form body; used when values are large (PEM uploads)
    pub async fn post_form(&self, action: &str, params: BTreeMap<String, String>) -> Result<serde_json::Value> {
        let params = self.signed_params(&Method::POST, action, params)?;
        let request = self.client.post(&self.endpoint).form(&params);
        self.send(action, request).await
    }

    async fn send(&self, action: &str, request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        debug!("Calling Aliyun API {} at {}", action, self.endpoint);

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to Aliyun API", action))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Aliyun API {} returned error {}: {}", action, status, body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Aliyun API {} response", action))?;

        Ok(json)
    }
}
