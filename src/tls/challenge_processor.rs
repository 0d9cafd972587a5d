//! Drives one authorization's challenge from `pending` to `valid`.
//!
//! The flow is: select a challenge, build its handler, refresh the challenge,
//! publish the proof, wait for it to settle, trigger validation, then poll with
//! exponential backoff. The handler is cleaned up exactly once whatever the
//! outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acme::{Account, AcmeTransport, Authorization, Challenge, ChallengeStatus, ChallengeType};
use crate::config::ChallengeConfig;
use crate::error::ChallengeError;
use crate::observability::metrics::RenewalMetrics;
use crate::tls::challenge_handler::ChallengeHandler;
use crate::tls::dns_provider::DnsProvider;

/// Tunables for challenge validation
#[derive(Debug, Clone)]
pub struct ChallengeSettings {
    pub http_webroot: PathBuf,
    /// Grace period between publishing the proof and triggering validation
    pub propagation_delay: Duration,
    pub max_attempts: u32,
    pub base_interval: Duration,
    pub growth_factor: f64,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self::from(&ChallengeConfig::default())
    }
}

impl From<&ChallengeConfig> for ChallengeSettings {
    fn from(config: &ChallengeConfig) -> Self {
        Self {
            http_webroot: PathBuf::from(&config.http_webroot),
            propagation_delay: Duration::from_secs(config.propagation_delay_secs),
            max_attempts: config.max_attempts,
            base_interval: Duration::from_secs(config.base_interval_secs),
            growth_factor: config.growth_factor,
        }
    }
}

/// Sleep before poll attempt `attempt + 1`: `base * growth^attempt`
pub fn backoff_delay(base: Duration, growth: f64, attempt: u32) -> Duration {
    let factor = growth.powi(attempt.min(i32::MAX as u32) as i32);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Pick the challenge to answer: the preferred type when offered, then
/// dns-01, then http-01. dns-01 is never picked without a DNS provider.
pub fn select_challenge(
    authorization: &Authorization,
    preferred: Option<ChallengeType>,
    dns_available: bool,
) -> Option<&Challenge> {
    let usable = |kind: &ChallengeType| match kind {
        ChallengeType::Http01 => true,
        ChallengeType::Dns01 => dns_available,
        ChallengeType::Unsupported => false,
    };
    preferred
        .filter(usable)
        .and_then(|kind| authorization.find_challenge(kind))
        .or_else(|| Some(ChallengeType::Dns01).filter(usable).and_then(|kind| authorization.find_challenge(kind)))
        .or_else(|| authorization.find_challenge(ChallengeType::Http01))
}

/// Owns a prepared handler until its cleanup has run. Cleanup happens on a
/// spawned task so it completes even when the processing future is dropped.
struct CleanupGuard {
    handler: Option<Arc<ChallengeHandler>>,
}

impl CleanupGuard {
    fn new(handler: Arc<ChallengeHandler>) -> Self {
        Self { handler: Some(handler) }
    }

    async fn finish(mut self) {
        if let Some(handler) = self.handler.take() {
            if let Err(e) = tokio::spawn(async move { handler.cleanup().await }).await {
                error!("Challenge cleanup task failed: {}", e);
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(resource = %handler.resource_key(), "Challenge abandoned, cleaning up in the background");
                runtime.spawn(async move { handler.cleanup().await });
            }
            Err(_) => error!(resource = %handler.resource_key(), "No runtime left to clean up challenge"),
        }
    }
}

pub struct ChallengeProcessor {
    transport: Arc<dyn AcmeTransport>,
    dns_provider: Option<Arc<dyn DnsProvider>>,
    settings: ChallengeSettings,
    cancel: CancellationToken,
    resource_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    metrics: Option<Arc<RenewalMetrics>>,
}

impl ChallengeProcessor {
    pub fn new(
        transport: Arc<dyn AcmeTransport>,
        dns_provider: Option<Arc<dyn DnsProvider>>,
        settings: ChallengeSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            dns_provider,
            settings,
            cancel,
            resource_locks: StdMutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RenewalMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &ChallengeSettings {
        &self.settings
    }

    /// Validate `authorization` through one of its challenges
    pub async fn process_authorization(
        &self,
        account: &Account,
        authorization: &Authorization,
        preferred: Option<ChallengeType>,
    ) -> Result<(), ChallengeError> {
        let domain = authorization.domain.as_str();

        if self.cancel.is_cancelled() {
            return Err(ChallengeError::Cancelled);
        }

        let dns_available = self.dns_provider.is_some();
        let challenge = select_challenge(authorization, preferred, dns_available).ok_or_else(|| {
            if !dns_available && authorization.find_challenge(ChallengeType::Dns01).is_some() {
                error!(domain = %domain, "Only dns-01 offered and no DNS provider configured");
                ChallengeError::NoDnsProvider(domain.to_string())
            } else {
                error!(domain = %domain, "No supported challenge type offered");
                ChallengeError::Unsupported(domain.to_string())
            }
        })?;

        let handler = Arc::new(self.build_handler(account, domain, challenge)?);

        let key = handler.resource_key();
        let lock = self.resource_lock(&key);
        let result = {
            let _exclusive = lock.lock().await;
            let cleanup = CleanupGuard::new(handler.clone());
            let result = self.run(account, domain, challenge, &handler).await;
            cleanup.finish().await;
            result
        };
        self.release_resource_lock(&key, lock);

        match &result {
            Ok(()) => info!(domain = %domain, challenge_type = %challenge.kind, "Challenge validated"),
            Err(e) => error!(domain = %domain, challenge_type = %challenge.kind, "Challenge failed: {}", e),
        }
        result
    }

    fn build_handler(
        &self,
        account: &Account,
        domain: &str,
        challenge: &Challenge,
    ) -> Result<ChallengeHandler, ChallengeError> {
        let key_authorization = account.key().key_authorization(&challenge.token);
        match challenge.kind {
            ChallengeType::Http01 => {
                ChallengeHandler::http01(&self.settings.http_webroot, domain, &challenge.token, key_authorization)
            }
            ChallengeType::Dns01 => {
                let provider = self
                    .dns_provider
                    .clone()
                    .ok_or_else(|| ChallengeError::NoDnsProvider(domain.to_string()))?;
                Ok(ChallengeHandler::dns01(domain, &key_authorization, provider))
            }
            ChallengeType::Unsupported => Err(ChallengeError::Unsupported(domain.to_string())),
        }
    }

    fn resource_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.resource_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_string()).or_default().clone()
    }

    fn release_resource_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = match self.resource_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Held only by the map and by `lock`: nobody else is waiting on it
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Number of challenge resources currently tracked for mutual exclusion
    pub fn tracked_resources(&self) -> usize {
        match self.resource_locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    async fn run(
        &self,
        account: &Account,
        domain: &str,
        challenge: &Challenge,
        handler: &ChallengeHandler,
    ) -> Result<(), ChallengeError> {
        let current = self.transport.fetch_challenge(account, &challenge.url).await?;
        match current.status {
            ChallengeStatus::Pending => {}
            ChallengeStatus::Valid => {
                info!(domain = %domain, "Challenge already valid");
                return Ok(());
            }
            status => {
                warn!(domain = %domain, %status, "Challenge not pending, refusing to trigger");
                return Err(ChallengeError::UnexpectedState {
                    domain: domain.to_string(),
                    status: status.to_string(),
                });
            }
        }

        handler.prepare().await.map_err(|source| ChallengeError::Prepare {
            domain: domain.to_string(),
            source,
        })?;

        self.sleep(self.settings.propagation_delay).await?;

        match handler.check_propagation().await {
            Ok(true) => {}
            Ok(false) => warn!(domain = %domain, "Challenge record not visible yet, triggering anyway"),
            Err(e) => warn!(domain = %domain, "Propagation check failed: {:#}", e),
        }

        self.transport.trigger_challenge(account, &challenge.url).await?;
        debug!(domain = %domain, "Challenge triggered");

        self.poll(account, domain, challenge).await
    }

    async fn poll(&self, account: &Account, domain: &str, challenge: &Challenge) -> Result<(), ChallengeError> {
        let max_attempts = self.settings.max_attempts;

        for attempt in 0..max_attempts {
            if let Some(metrics) = &self.metrics {
                metrics.record_poll_attempt(challenge.kind.as_str());
            }

            match self.transport.fetch_challenge(account, &challenge.url).await {
                Ok(current) => match current.status {
                    ChallengeStatus::Valid => return Ok(()),
                    ChallengeStatus::Invalid => {
                        let detail = current
                            .error
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "no error detail".to_string());
                        return Err(ChallengeError::Invalid {
                            domain: domain.to_string(),
                            detail,
                        });
                    }
                    status => debug!(domain = %domain, attempt = attempt + 1, %status, "Challenge not settled"),
                },
                Err(e) => warn!(domain = %domain, attempt = attempt + 1, "Challenge status refresh failed: {}", e),
            }

            if attempt + 1 < max_attempts {
                let delay = backoff_delay(self.settings.base_interval, self.settings.growth_factor, attempt);
                debug!(domain = %domain, "Waiting {:?} before attempt {}/{}", delay, attempt + 2, max_attempts);
                self.sleep(delay).await?;
            }
        }

        Err(ChallengeError::Timeout {
            domain: domain.to_string(),
            attempts: max_attempts,
        })
    }

    async fn sleep(&self, duration: Duration) -> Result<(), ChallengeError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChallengeError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
