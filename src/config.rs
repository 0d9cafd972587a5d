use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::acme::{ChallengeType, LETS_ENCRYPT_DIRECTORY};

/// Upper bound on settle delay plus every poll sleep for one authorization.
/// Pending authorizations stay alive for days; an hour leaves ample margin.
pub const MAX_VALIDATION_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub acme: AcmeConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub dns_provider: Option<DnsProviderConfig>,
    pub cdn_provider: CdnProviderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcmeConfig {
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    pub contact_email: String,
    #[serde(default = "default_keystore_path")]
    pub keystore_path: String,
    pub keystore_password: String,
    #[serde(default = "default_account_file")]
    pub account_file: String,
}

fn default_directory_url() -> String { LETS_ENCRYPT_DIRECTORY.to_string() }
fn default_keystore_path() -> String { "data/account_key.pem".to_string() }
fn default_account_file() -> String { "data/acme_account.properties".to_string() }

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChallengeConfig {
    /// Challenge type to use when the CA offers it
    #[serde(default = "default_preferred_type")]
    pub preferred_type: Option<ChallengeType>,
    /// Directory under which `.well-known/acme-challenge/` is served
    #[serde(default = "default_http_webroot")]
    pub http_webroot: String,
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
}

fn default_preferred_type() -> Option<ChallengeType> { Some(ChallengeType::Dns01) }
fn default_http_webroot() -> String { "/var/www".to_string() }
fn default_propagation_delay() -> u64 { 3 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_interval() -> u64 { 10 }
fn default_growth_factor() -> f64 { 1.5 }

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            preferred_type: default_preferred_type(),
            http_webroot: default_http_webroot(),
            propagation_delay_secs: default_propagation_delay(),
            max_attempts: default_max_attempts(),
            base_interval_secs: default_base_interval(),
            growth_factor: default_growth_factor(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RenewalConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    #[serde(default = "default_certs_dir")]
    pub certs_dir: String,
    #[serde(default = "default_cert_name_prefix")]
    pub cert_name_prefix: String,
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_check_interval() -> u64 { 24 * 60 * 60 }
fn default_renew_before_days() -> i64 { 15 }
fn default_validity_days() -> u32 { 90 }
fn default_certs_dir() -> String { "certs".to_string() }
fn default_cert_name_prefix() -> String { "edge".to_string() }
fn default_probe_port() -> u16 { 443 }
fn default_probe_timeout() -> u64 { 10 }

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            renew_before_days: default_renew_before_days(),
            validity_days: default_validity_days(),
            certs_dir: default_certs_dir(),
            cert_name_prefix: default_cert_name_prefix(),
            probe_port: default_probe_port(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsProviderConfig {
    Aliyun {
        access_key_id: String,
        access_key_secret: String,
        #[serde(default = "default_alidns_endpoint")]
        endpoint: String,
    },
}

fn default_alidns_endpoint() -> String { "https://alidns.aliyuncs.com/".to_string() }

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CdnProviderConfig {
    Aliyun {
        access_key_id: String,
        access_key_secret: String,
        #[serde(default = "default_cdn_endpoint")]
        endpoint: String,
    },
}

fn default_cdn_endpoint() -> String { "https://cdn.aliyuncs.com/".to_string() }

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_log_output() -> String { "console".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String { "0.0.0.0:9090".to_string() }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

impl ChallengeConfig {
    /// Worst-case wait for one authorization: settle delay plus every poll sleep
    pub fn worst_case_wait(&self) -> Duration {
        let base = Duration::from_secs(self.base_interval_secs);
        let polls: Duration = (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| crate::tls::challenge_processor::backoff_delay(base, self.growth_factor, attempt))
            .sum();
        Duration::from_secs(self.propagation_delay_secs) + polls
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path))?;
    Ok(config)
}

/// Reject configurations the pipeline cannot run safely with
pub fn validate_config(config: &Config) -> Result<()> {
    let email = &config.acme.contact_email;
    if email.is_empty() || !email.contains('@') {
        bail!("Invalid ACME contact email: {:?}", email);
    }

    reqwest::Url::parse(&config.acme.directory_url)
        .with_context(|| format!("Invalid ACME directory URL: {}", config.acme.directory_url))?;

    if config.acme.keystore_password.is_empty() {
        bail!("ACME keystore password must not be empty");
    }

    let challenge = &config.challenge;
    if challenge.max_attempts == 0 {
        bail!("challenge.max_attempts must be at least 1");
    }
    if !(challenge.growth_factor >= 1.0 && challenge.growth_factor.is_finite()) {
        bail!("challenge.growth_factor must be a finite value >= 1.0");
    }
    let worst_case = challenge.worst_case_wait();
    if worst_case > MAX_VALIDATION_WINDOW {
        bail!(
            "Challenge settings allow waiting {}s per authorization (limit {}s)",
            worst_case.as_secs(),
            MAX_VALIDATION_WINDOW.as_secs()
        );
    }
    if challenge.preferred_type == Some(ChallengeType::Unsupported) {
        bail!("challenge.preferred_type must be http-01 or dns-01");
    }
    if challenge.preferred_type == Some(ChallengeType::Dns01) && config.dns_provider.is_none() {
        warn!("dns-01 is preferred but no [dns_provider] is configured; http-01 will be used");
    }

    let renewal = &config.renewal;
    if renewal.validity_days == 0 {
        bail!("renewal.validity_days must be positive");
    }
    if renewal.renew_before_days < 0 || renewal.renew_before_days >= renewal.validity_days as i64 {
        bail!(
            "renewal.renew_before_days ({}) must be within the certificate validity ({} days)",
            renewal.renew_before_days,
            renewal.validity_days
        );
    }
    if renewal.check_interval_secs == 0 {
        bail!("renewal.check_interval_secs must be positive");
    }
    if renewal.cert_name_prefix.is_empty() {
        bail!("renewal.cert_name_prefix must not be empty");
    }

    if config.metrics.enabled {
        config
            .metrics
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid metrics listen address: {}", config.metrics.listen_addr))?;
    }

    Ok(())
}
