use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus collectors for the renewal pipeline
pub struct RenewalMetrics {
    registry: Registry,
    renewals: IntCounterVec,
    stage_failures: IntCounterVec,
    poll_attempts: IntCounterVec,
    seconds_to_expiry: GaugeVec,
}

impl RenewalMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let renewals = IntCounterVec::new(
            Opts::new("cert_renewals_total", "Renewal pipeline outcomes per domain"),
            &["domain", "outcome"],
        )?;

        let stage_failures = IntCounterVec::new(
            Opts::new("cert_renewal_stage_failures_total", "Renewal failures by pipeline stage"),
            &["stage"],
        )?;

        let poll_attempts = IntCounterVec::new(
            Opts::new("acme_challenge_poll_attempts_total", "Challenge status polls by challenge type"),
            &["challenge_type"],
        )?;

        let seconds_to_expiry = GaugeVec::new(
            Opts::new("cert_seconds_to_expiry", "Seconds until the served certificate expires"),
            &["domain"],
        )?;

        registry.register(Box::new(renewals.clone()))?;
        registry.register(Box::new(stage_failures.clone()))?;
        registry.register(Box::new(poll_attempts.clone()))?;
        registry.register(Box::new(seconds_to_expiry.clone()))?;

        Ok(Self {
            registry,
            renewals,
            stage_failures,
            poll_attempts,
            seconds_to_expiry,
        })
    }

    /// `outcome` is one of `renewed`, `redeployed`, `skipped`, `failed`
    pub fn record_outcome(&self, domain: &str, outcome: &str) {
        self.renewals.with_label_values(&[domain, outcome]).inc();
    }

    pub fn record_stage_failure(&self, stage: &str) {
        self.stage_failures.with_label_values(&[stage]).inc();
    }

    pub fn record_poll_attempt(&self, challenge_type: &str) {
        self.poll_attempts.with_label_values(&[challenge_type]).inc();
    }

    pub fn set_seconds_to_expiry(&self, domain: &str, seconds: f64) {
        self.seconds_to_expiry.with_label_values(&[domain]).set(seconds);
    }

    pub fn outcome_count(&self, domain: &str, outcome: &str) -> u64 {
        self.renewals.with_label_values(&[domain, outcome]).get()
    }

    pub fn stage_failure_count(&self, stage: &str) -> u64 {
        self.stage_failures.with_label_values(&[stage]).get()
    }

    pub fn poll_attempt_count(&self, challenge_type: &str) -> u64 {
        self.poll_attempts.with_label_values(&[challenge_type]).get()
    }

    pub fn export_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
