//! Automatic certificate renewal: decide which CDN domains need a new
//! certificate, issue it through ACME, persist it, deploy it.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acme::{ChallengeType, DomainKey};
use crate::cdn::{CdnProvider, DomainCertificateStatus};
use crate::config::Config;
use crate::error::RenewalError;
use crate::observability::metrics::RenewalMetrics;
use crate::tls::account_store::AccountStore;
use crate::tls::certificate_store::{CertificateStore, IssuedCertificate};
use crate::tls::dns_provider::extract_base_domain;
use crate::tls::order_client::OrderClient;

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct RenewalSettings {
    /// How often to check for certificates needing renewal
    pub check_interval: StdDuration,
    /// How many days before expiration to renew certificates
    pub renew_before_days: i64,
    /// Validity requested from the CA for new certificates
    pub validity_days: u32,
    /// CDN certificate slots are named `<prefix>-<serial>`
    pub cert_name_prefix: String,
    pub preferred_challenge: Option<ChallengeType>,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            check_interval: StdDuration::from_secs(24 * 60 * 60),
            renew_before_days: 15,
            validity_days: 90,
            cert_name_prefix: "edge".to_string(),
            preferred_challenge: Some(ChallengeType::Dns01),
        }
    }
}

impl From<&Config> for RenewalSettings {
    fn from(config: &Config) -> Self {
        Self {
            check_interval: StdDuration::from_secs(config.renewal.check_interval_secs),
            renew_before_days: config.renewal.renew_before_days,
            validity_days: config.renewal.validity_days,
            cert_name_prefix: config.renewal.cert_name_prefix.clone(),
            preferred_challenge: config.challenge.preferred_type,
        }
    }
}

/// True when no certificate is deployed or it expires within the window
pub fn needs_renewal(status: &DomainCertificateStatus, now: DateTime<Utc>, renew_before_days: i64) -> bool {
    match status.not_after {
        None => true,
        Some(not_after) => now + Duration::days(renew_before_days) > not_after,
    }
}

/// CDN wildcard entries are listed as `.example.com`; issue for the root domain
pub fn normalize_hostname(hostname: &str) -> String {
    if hostname.starts_with('.') {
        extract_base_domain(hostname.trim_start_matches('.'))
    } else {
        hostname.to_string()
    }
}

pub fn certificate_slot_name(prefix: &str, serial: &str) -> String {
    format!("{}-{}", prefix, serial)
}

/// What happened to one domain that needed work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// A new certificate was issued and deployed
    Renewed { serial: String },
    /// A previously persisted certificate was deployed without reissuing
    Redeployed { serial: String },
}

/// Summary of one scheduling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub skipped: Vec<String>,
    pub renewed: Vec<String>,
    pub redeployed: Vec<String>,
    /// (domain, failed stage)
    pub failed: Vec<(String, &'static str)>,
}

impl CycleReport {
    /// Domains this cycle reached a decision for
    pub fn processed(&self) -> usize {
        self.skipped.len() + self.renewed.len() + self.redeployed.len() + self.failed.len()
    }
}

pub struct RenewalScheduler {
    accounts: Arc<AccountStore>,
    orders: Arc<OrderClient>,
    certificates: Arc<CertificateStore>,
    cdn: Arc<dyn CdnProvider>,
    settings: RenewalSettings,
    metrics: Option<Arc<RenewalMetrics>>,
    batch_lock: Mutex<()>,
}

impl RenewalScheduler {
    pub fn new(
        accounts: Arc<AccountStore>,
        orders: Arc<OrderClient>,
        certificates: Arc<CertificateStore>,
        cdn: Arc<dyn CdnProvider>,
        settings: RenewalSettings,
    ) -> Self {
        Self {
            accounts,
            orders,
            certificates,
            cdn,
            settings,
            metrics: None,
            batch_lock: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RenewalMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run a cycle immediately, then every `check_interval`, until cancelled
    pub async fn start(&self, cancel: CancellationToken) {
        info!(
            "Starting certificate renewal scheduler (check interval: {}s, renewal window: {} days before expiry)",
            self.settings.check_interval.as_secs(),
            self.settings.renew_before_days
        );

        let mut timer = interval(self.settings.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Renewal scheduler stopped");
                    return;
                }
                _ = timer.tick() => {}
            }

            debug!("Running certificate renewal check");

            // The cycle is never dropped mid-flight: challenge waits observe the
            // same token and unwind through cleanup
            if let Err(e) = self.run_cycle_until(&cancel).await {
                error!("Certificate renewal check failed: {:#}", e);
            }
        }
    }

    /// Check every managed domain once. Fails only when the domain list
    /// itself cannot be fetched; per-domain failures land in the report.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_until(&CancellationToken::new()).await
    }

    async fn run_cycle_until(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let _batch = self.batch_lock.lock().await;

        let domains = self
            .cdn
            .list_managed_domains()
            .await
            .with_context(|| format!("Failed to list domains from {}", self.cdn.provider_name()))?;

        let now = Utc::now();
        let mut report = CycleReport {
            checked: domains.len(),
            ..Default::default()
        };

        for status in &domains {
            if cancel.is_cancelled() {
                info!("Renewal cycle interrupted, {} domain(s) left unchecked", domains.len() - report.processed());
                break;
            }
            let hostname = status.hostname.as_str();

            if let (Some(metrics), Some(not_after)) = (&self.metrics, status.not_after) {
                metrics.set_seconds_to_expiry(hostname, (not_after - now).num_seconds() as f64);
            }

            if !needs_renewal(status, now, self.settings.renew_before_days) {
                debug!(domain = %hostname, not_after = ?status.not_after, "Certificate still valid");
                self.record_outcome(hostname, "skipped");
                report.skipped.push(hostname.to_string());
                continue;
            }

            match status.not_after {
                None => info!(domain = %hostname, "No certificate deployed, renewing"),
                Some(not_after) => info!(domain = %hostname, %not_after, "Certificate expiring soon, renewing"),
            }

            match self.renew_domain(hostname).await {
                Ok(RenewalOutcome::Renewed { .. }) => {
                    self.record_outcome(hostname, "renewed");
                    report.renewed.push(hostname.to_string());
                }
                Ok(RenewalOutcome::Redeployed { .. }) => {
                    self.record_outcome(hostname, "redeployed");
                    report.redeployed.push(hostname.to_string());
                }
                Err(e) => {
                    error!(domain = %hostname, stage = e.stage(), "Certificate renewal failed: {}", e);
                    self.record_outcome(hostname, "failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_stage_failure(e.stage());
                    }
                    report.failed.push((hostname.to_string(), e.stage()));
                }
            }
        }

        info!(
            "Certificate renewal check complete: {} checked, {} renewed, {} redeployed, {} failed",
            report.checked,
            report.renewed.len(),
            report.redeployed.len(),
            report.failed.len()
        );

        Ok(report)
    }

    /// Bring one CDN domain up to date: redeploy a fresh local certificate
    /// when there is one, otherwise issue a new certificate
    pub async fn renew_domain(&self, hostname: &str) -> Result<RenewalOutcome, RenewalError> {
        let domain = normalize_hostname(hostname);

        if let Some(certificate) = self.fresh_local_certificate(&domain).await {
            info!(domain = %hostname, serial = %certificate.leaf.serial, "Deploying previously issued certificate");
            self.deploy(hostname, &certificate).await?;
            return Ok(RenewalOutcome::Redeployed {
                serial: certificate.leaf.serial,
            });
        }

        let certificate = self.issue(&domain).await?;

        self.certificates
            .save(&domain, &certificate)
            .await
            .map_err(RenewalError::Persistence)?;

        self.deploy(hostname, &certificate).await?;

        Ok(RenewalOutcome::Renewed {
            serial: certificate.leaf.serial,
        })
    }

    /// Deploy the newest persisted certificate for `hostname` as is
    pub async fn redeploy(&self, hostname: &str) -> Result<RenewalOutcome, RenewalError> {
        let _batch = self.batch_lock.lock().await;
        let domain = normalize_hostname(hostname);
        let stored = self
            .certificates
            .latest(&domain)
            .await
            .map_err(RenewalError::Deployment)?
            .ok_or_else(|| RenewalError::Deployment(anyhow::anyhow!("No stored certificate for {}", domain)))?;

        self.deploy(hostname, &stored.certificate).await?;
        Ok(RenewalOutcome::Redeployed {
            serial: stored.certificate.leaf.serial,
        })
    }

    async fn fresh_local_certificate(&self, domain: &str) -> Option<IssuedCertificate> {
        let stored = match self.certificates.latest(domain).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(domain = %domain, "Ignoring unreadable stored certificate: {:#}", e);
                return None;
            }
        };

        let status = DomainCertificateStatus {
            hostname: domain.to_string(),
            not_before: Some(stored.certificate.leaf.not_before),
            not_after: Some(stored.certificate.leaf.not_after),
        };
        if needs_renewal(&status, Utc::now(), self.settings.renew_before_days) {
            None
        } else {
            Some(stored.certificate)
        }
    }

    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, RenewalError> {
        let account = self.accounts.get_or_create_account().await?;
        let domains = vec![domain.to_string()];

        let order = self
            .orders
            .create_order(&account, &domains, Some(self.settings.validity_days))
            .await?;

        self.orders
            .process_authorizations(&account, &order, self.settings.preferred_challenge)
            .await?;

        let domain_key = tokio::task::spawn_blocking(DomainKey::generate)
            .await
            .context("Key generation task failed")
            .and_then(|key| key)
            .map_err(RenewalError::Finalization)?;

        self.orders.finalize_order(&account, &order, &domain_key).await
    }

    async fn deploy(&self, hostname: &str, certificate: &IssuedCertificate) -> Result<(), RenewalError> {
        let cert_name = certificate_slot_name(&self.settings.cert_name_prefix, &certificate.leaf.serial);

        let deployed = self
            .cdn
            .deploy_certificate(hostname, &cert_name, &certificate.chain_pem, &certificate.key_pem)
            .await
            .map_err(RenewalError::Deployment)?;

        if !deployed {
            return Err(RenewalError::Deployment(anyhow::anyhow!(
                "{} refused certificate {}",
                self.cdn.provider_name(),
                cert_name
            )));
        }

        info!(domain = %hostname, cert_name = %cert_name, "Certificate deployed to {}", self.cdn.provider_name());
        Ok(())
    }

    fn record_outcome(&self, domain: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(domain, outcome);
        }
    }
}
