//! RFC 8555 transport over HTTPS with RS256 JWS request signing

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Account, AccountKey, AcmeTransport, Authorization, AuthorizationStatus, Challenge, Order,
    OrderStatus,
};
use crate::error::{AcmeError, Problem};

const REPLAY_NONCE: &str = "Replay-Nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Identifier {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResource {
    status: OrderStatus,
    #[serde(default)]
    identifiers: Vec<Identifier>,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    not_after: Option<String>,
    #[serde(default)]
    error: Option<Problem>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationResource {
    identifier: Identifier,
    status: AuthorizationStatus,
    #[serde(default)]
    challenges: Vec<Challenge>,
}

/// How a request identifies its signer
enum KeyId<'a> {
    /// Embedded public key, used before an account URL exists
    Jwk,
    /// Account URL of an existing account
    Kid(&'a str),
}

/// ACME client speaking directly to a CA directory
pub struct HttpAcmeTransport {
    directory_url: String,
    client: Client,
    directory: OnceCell<Directory>,
    nonce: Mutex<Option<String>>,
    finalize_poll_attempts: u32,
    finalize_poll_interval: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HttpAcmeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAcmeTransport")
            .field("directory_url", &self.directory_url)
            .finish()
    }
}

impl HttpAcmeTransport {
    pub fn new(directory_url: impl Into<String>) -> Result<Self, AcmeError> {
        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(concat!("edge-cert-renewer/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            directory_url: directory_url.into(),
            client,
            directory: OnceCell::new(),
            nonce: Mutex::new(None),
            finalize_poll_attempts: 10,
            finalize_poll_interval: Duration::from_secs(3),
            cancel: CancellationToken::new(),
        })
    }

    /// Abort finalization polling once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn directory(&self) -> Result<&Directory, AcmeError> {
        self.directory
            .get_or_try_init(|| async {
                info!("Fetching ACME directory from {}", self.directory_url);
                let response = self.client.get(&self.directory_url).send().await?;
                if !response.status().is_success() {
                    return Err(AcmeError::Protocol(format!(
                        "failed to fetch directory: {}",
                        response.status()
                    )));
                }
                Ok(response.json::<Directory>().await?)
            })
            .await
    }

    async fn remember_nonce(&self, response: &Response) {
        if let Some(nonce) = response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
        {
            *self.nonce.lock().await = Some(nonce.to_string());
        }
    }

    async fn fresh_nonce(&self) -> Result<String, AcmeError> {
        if let Some(nonce) = self.nonce.lock().await.take() {
            return Ok(nonce);
        }

        let new_nonce_url = self.directory().await?.new_nonce.clone();
        let response = self.client.head(&new_nonce_url).send().await?;
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("newNonce response carried no nonce".to_string()))
    }

    fn build_jws(
        key: &AccountKey,
        key_id: &KeyId<'_>,
        url: &str,
        nonce: &str,
        payload: Option<&Value>,
    ) -> Result<Value, AcmeError> {
        let mut protected = json!({
            "alg": "RS256",
            "nonce": nonce,
            "url": url,
        });
        match key_id {
            KeyId::Jwk => protected["jwk"] = key.jwk(),
            KeyId::Kid(kid) => protected["kid"] = Value::String(kid.to_string()),
        }

        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);
        // POST-as-GET carries an empty payload
        let payload_b64 = match payload {
            Some(p) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(p)?),
            None => String::new(),
        };

        let signing_input = format!("{}.{}", protected_b64, payload_b64);
        let signature = key
            .sign(signing_input.as_bytes())
            .map_err(|e| AcmeError::Key(format!("{:#}", e)))?;

        Ok(json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        }))
    }

    async fn problem_from(response: Response) -> Problem {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let mut problem = serde_json::from_str::<Problem>(&body).unwrap_or_else(|_| Problem {
            problem_type: String::new(),
            detail: Some(body),
            status: None,
        });
        problem.status.get_or_insert(status);
        problem
    }

    /// Signed POST, retrying once when the CA reports a stale nonce
    async fn post(
        &self,
        key: &AccountKey,
        key_id: KeyId<'_>,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response, AcmeError> {
        let mut retried = false;
        loop {
            let nonce = self.fresh_nonce().await?;
            let body = Self::build_jws(key, &key_id, url, &nonce, payload)?;

            let mut request = self
                .client
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(serde_json::to_vec(&body)?);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            let response = request.send().await?;
            self.remember_nonce(&response).await;

            if response.status().is_success() {
                return Ok(response);
            }

            let problem = Self::problem_from(response).await;
            if problem.is_bad_nonce() && !retried {
                debug!("CA rejected nonce for {}, retrying once", url);
                retried = true;
                continue;
            }
            return Err(AcmeError::Problem(problem));
        }
    }

    fn location(response: &Response) -> Result<String, AcmeError> {
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("response carried no Location header".to_string()))
    }

    fn into_order(url: String, resource: OrderResource) -> Order {
        let not_after = resource
            .not_after
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Order {
            url,
            status: resource.status,
            domains: resource.identifiers.into_iter().map(|i| i.value).collect(),
            not_after,
            authorizations: resource.authorizations,
            finalize_url: resource.finalize,
            certificate_url: resource.certificate,
        }
    }
}

#[async_trait]
impl AcmeTransport for HttpAcmeTransport {
    async fn new_account(&self, key: &AccountKey, contact_email: &str) -> Result<String, AcmeError> {
        let url = self.directory().await?.new_account.clone();
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": [format!("mailto:{}", contact_email)],
        });

        let response = self.post(key, KeyId::Jwk, &url, Some(&payload), None).await?;
        let account_url = Self::location(&response)?;
        info!("Registered ACME account {}", account_url);
        Ok(account_url)
    }

    async fn bind_account(&self, key: &AccountKey, account_url: &str) -> Result<(), AcmeError> {
        let url = self.directory().await?.new_account.clone();
        let payload = json!({ "onlyReturnExisting": true });

        let response = self.post(key, KeyId::Jwk, &url, Some(&payload), None).await?;
        let location = Self::location(&response)?;
        if location != account_url {
            return Err(AcmeError::Protocol(format!(
                "key is bound to account {}, expected {}",
                location, account_url
            )));
        }
        Ok(())
    }

    async fn new_order(
        &self,
        account: &Account,
        domains: &[String],
        not_after: Option<DateTime<Utc>>,
    ) -> Result<Order, AcmeError> {
        let url = self.directory().await?.new_order.clone();
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier {
                kind: "dns".to_string(),
                value: d.clone(),
            })
            .collect();

        let mut payload = json!({ "identifiers": identifiers });
        if let Some(not_after) = not_after {
            payload["notAfter"] = Value::String(not_after.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        let response = self
            .post(account.key(), KeyId::Kid(account.url()), &url, Some(&payload), None)
            .await?;
        let order_url = Self::location(&response)?;
        let resource: OrderResource = response.json().await?;
        Ok(Self::into_order(order_url, resource))
    }

    async fn fetch_authorization(&self, account: &Account, url: &str) -> Result<Authorization, AcmeError> {
        let response = self
            .post(account.key(), KeyId::Kid(account.url()), url, None, None)
            .await?;
        let resource: AuthorizationResource = response.json().await?;
        Ok(Authorization {
            url: url.to_string(),
            domain: resource.identifier.value,
            status: resource.status,
            challenges: resource.challenges,
        })
    }

    async fn fetch_challenge(&self, account: &Account, url: &str) -> Result<Challenge, AcmeError> {
        let response = self
            .post(account.key(), KeyId::Kid(account.url()), url, None, None)
            .await?;
        Ok(response.json().await?)
    }

    async fn trigger_challenge(&self, account: &Account, url: &str) -> Result<Challenge, AcmeError> {
        let payload = json!({});
        let response = self
            .post(account.key(), KeyId::Kid(account.url()), url, Some(&payload), None)
            .await?;
        Ok(response.json().await?)
    }

    async fn finalize_order(&self, account: &Account, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self
            .post(
                account.key(),
                KeyId::Kid(account.url()),
                &order.finalize_url,
                Some(&payload),
                None,
            )
            .await?;
        let mut resource: OrderResource = response.json().await?;

        for attempt in 0..self.finalize_poll_attempts {
            match resource.status {
                OrderStatus::Valid => return Ok(Self::into_order(order.url.clone(), resource)),
                OrderStatus::Invalid => {
                    return Err(match resource.error {
                        Some(problem) => AcmeError::Problem(problem),
                        None => AcmeError::Protocol(format!("order {} became invalid", order.url)),
                    })
                }
                _ => {
                    debug!(
                        "Order {} still {:?} (poll {}/{})",
                        order.url,
                        resource.status,
                        attempt + 1,
                        self.finalize_poll_attempts
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(AcmeError::Cancelled),
                        _ = tokio::time::sleep(self.finalize_poll_interval) => {}
                    }
                    let response = self
                        .post(account.key(), KeyId::Kid(account.url()), &order.url, None, None)
                        .await?;
                    resource = response.json().await?;
                }
            }
        }

        warn!("Order {} was not issued in time", order.url);
        Err(AcmeError::Protocol(format!(
            "order {} not issued after {} polls",
            order.url, self.finalize_poll_attempts
        )))
    }

    async fn download_certificate(&self, account: &Account, order: &Order) -> Result<String, AcmeError> {
        let url = order
            .certificate_url
            .as_deref()
            .ok_or_else(|| AcmeError::Protocol(format!("order {} has no certificate URL", order.url)))?;

        let response = self
            .post(account.key(), KeyId::Kid(account.url()), url, None, Some(PEM_CHAIN))
            .await?;
        Ok(response.text().await?)
    }
}
