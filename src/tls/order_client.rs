use anyhow::{anyhow, Context};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::acme::{Account, AcmeTransport, AuthorizationStatus, ChallengeType, DomainKey, Order};
use crate::error::{AcmeError, RenewalError};
use crate::tls::certificate_store::IssuedCertificate;
use crate::tls::challenge_processor::ChallengeProcessor;

/// Order lifecycle: create, authorize, finalize
pub struct OrderClient {
    transport: Arc<dyn AcmeTransport>,
    processor: Arc<ChallengeProcessor>,
}

impl OrderClient {
    pub fn new(transport: Arc<dyn AcmeTransport>, processor: Arc<ChallengeProcessor>) -> Self {
        Self { transport, processor }
    }

    /// Create an order for `domains`, asking for `validity_days` of validity
    /// when given. A CA that refuses caller-chosen validity gets a second
    /// request without it; any other rejection is final.
    pub async fn create_order(
        &self,
        account: &Account,
        domains: &[String],
        validity_days: Option<u32>,
    ) -> Result<Order, RenewalError> {
        if domains.is_empty() {
            return Err(RenewalError::OrderCreation(AcmeError::Protocol(
                "cannot order a certificate for an empty domain list".to_string(),
            )));
        }

        let not_after = validity_days
            .filter(|days| *days > 0)
            .map(|days| Utc::now() + ChronoDuration::days(i64::from(days)));

        let order = match self.transport.new_order(account, domains, not_after).await {
            Ok(order) => order,
            Err(AcmeError::Problem(problem)) if not_after.is_some() && problem.rejects_validity_window() => {
                warn!(
                    domains = ?domains,
                    "CA does not accept a validity window, retrying with its default"
                );
                self.transport
                    .new_order(account, domains, None)
                    .await
                    .map_err(RenewalError::OrderCreation)?
            }
            Err(e) => return Err(RenewalError::OrderCreation(e)),
        };

        info!(domains = ?domains, order = %order.url, "Order created");
        Ok(order)
    }

    /// Validate every authorization of the order. All of them are attempted;
    /// the error names each domain that did not end up valid.
    pub async fn process_authorizations(
        &self,
        account: &Account,
        order: &Order,
        preferred: Option<ChallengeType>,
    ) -> Result<(), RenewalError> {
        let mut failed_domains = Vec::new();

        for url in &order.authorizations {
            let authorization = match self.transport.fetch_authorization(account, url).await {
                Ok(authorization) => authorization,
                Err(e) => {
                    error!("Failed to fetch authorization {}: {}", url, e);
                    failed_domains.push(url.clone());
                    continue;
                }
            };
            let domain = authorization.domain.clone();

            match authorization.status {
                AuthorizationStatus::Valid => {
                    info!(domain = %domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    error!(domain = %domain, ?status, "Authorization cannot be satisfied");
                    failed_domains.push(domain);
                    continue;
                }
            }

            if self
                .processor
                .process_authorization(account, &authorization, preferred)
                .await
                .is_err()
            {
                failed_domains.push(domain);
                continue;
            }

            match self.transport.fetch_authorization(account, url).await {
                Ok(refreshed) if refreshed.status == AuthorizationStatus::Valid => {}
                Ok(refreshed) => {
                    error!(domain = %domain, status = ?refreshed.status, "Authorization not valid after challenge");
                    failed_domains.push(domain);
                }
                Err(e) => {
                    error!(domain = %domain, "Failed to confirm authorization: {}", e);
                    failed_domains.push(domain);
                }
            }
        }

        if failed_domains.is_empty() {
            Ok(())
        } else {
            Err(RenewalError::ChallengeValidation { failed_domains })
        }
    }

    /// Submit a CSR signed by `domain_key` and download the issued chain
    pub async fn finalize_order(
        &self,
        account: &Account,
        order: &Order,
        domain_key: &DomainKey,
    ) -> Result<IssuedCertificate, RenewalError> {
        let csr = domain_key
            .csr_der(&order.domains)
            .map_err(RenewalError::Finalization)?;

        let finalized = self
            .transport
            .finalize_order(account, order, &csr)
            .await
            .context("Order finalization rejected")
            .map_err(RenewalError::Finalization)?;

        let chain_pem = self
            .transport
            .download_certificate(account, &finalized)
            .await
            .context("Certificate download failed")
            .map_err(RenewalError::Finalization)?;

        let key_pem = domain_key.to_pkcs8_pem().map_err(RenewalError::Finalization)?;
        let certificate = IssuedCertificate::from_pem(chain_pem, key_pem)
            .context("CA returned an unreadable certificate chain")
            .map_err(RenewalError::Finalization)?;

        if certificate.leaf.domains.is_empty() {
            return Err(RenewalError::Finalization(anyhow!("Issued certificate names no domains")));
        }

        info!(
            domains = ?order.domains,
            serial = %certificate.leaf.serial,
            not_after = %certificate.leaf.not_after,
            chain_len = certificate.chain.len(),
            "Certificate issued"
        );
        Ok(certificate)
    }
}
