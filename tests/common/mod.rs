//! Hand-written fakes for the CA, DNS and CDN seams

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use edge_cert_renewer::acme::{
    Account, AccountKey, AcmeTransport, Authorization, AuthorizationStatus, Challenge, ChallengeStatus,
    ChallengeType, Order, OrderStatus,
};
use edge_cert_renewer::cdn::{CdnProvider, DomainCertificateStatus};
use edge_cert_renewer::error::{AcmeError, Problem, PROBLEM_MALFORMED};
use edge_cert_renewer::tls::dns_provider::DnsProvider;

/// Ordered record of side effects across all fakes
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// PEM chain (leaf + issuer) for `domain`, expiring `valid_days` from now
pub fn minted_chain(domain: &str, valid_days: i64) -> String {
    let not_after = Utc::now() + Duration::days(valid_days);
    let not_before = Utc::now() - Duration::days(1);

    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, domain);
    params.not_before = rcgen::date_time_ymd(not_before.year(), not_before.month() as u8, not_before.day() as u8);
    params.not_after = rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);
    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let leaf = params.self_signed(&leaf_key).unwrap();

    let issuer_key = rcgen::KeyPair::generate().unwrap();
    let issuer = rcgen::CertificateParams::new(vec!["issuer.test".to_string()])
        .unwrap()
        .self_signed(&issuer_key)
        .unwrap();

    format!("{}{}", leaf.pem(), issuer.pem())
}

pub fn test_account() -> Account {
    Account::new("https://ca.test/acct/1", Arc::new(AccountKey::generate().unwrap()))
}

pub fn validity_rejection() -> AcmeError {
    AcmeError::Problem(Problem {
        problem_type: PROBLEM_MALFORMED.to_string(),
        detail: Some("NotBefore and NotAfter are not supported".to_string()),
        status: Some(400),
    })
}

#[derive(Default)]
struct CaState {
    order_results: VecDeque<Result<(), AcmeError>>,
    order_requests: Vec<(Vec<String>, Option<DateTime<Utc>>)>,
    authorizations: HashMap<String, Authorization>,
    /// Per challenge URL; the last entry repeats once the script runs out
    challenge_script: HashMap<String, VecDeque<ChallengeStatus>>,
    challenge_fetches: usize,
    triggers: Vec<String>,
    finalized: Vec<Vec<u8>>,
    new_accounts: usize,
    bind_results: VecDeque<Result<(), AcmeError>>,
    binds: Vec<String>,
    next_order: usize,
}

/// In-memory CA: issues one authorization per domain offering both
/// http-01 and dns-01
#[derive(Clone)]
pub struct FakeCa {
    state: Arc<Mutex<CaState>>,
    log: EventLog,
    /// Challenge status sequence every new authorization starts with
    default_script: Arc<Mutex<Vec<ChallengeStatus>>>,
    offered: Arc<Mutex<Vec<ChallengeType>>>,
}

impl FakeCa {
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaState::default())),
            log,
            default_script: Arc::new(Mutex::new(vec![ChallengeStatus::Pending, ChallengeStatus::Valid])),
            offered: Arc::new(Mutex::new(vec![ChallengeType::Http01, ChallengeType::Dns01])),
        }
    }

    /// Challenge statuses returned by successive fetches: the first is the
    /// pre-check, the rest are polls
    pub fn set_challenge_script(&self, script: Vec<ChallengeStatus>) {
        *self.default_script.lock().unwrap() = script;
    }

    pub fn set_offered(&self, offered: Vec<ChallengeType>) {
        *self.offered.lock().unwrap() = offered;
    }

    pub fn push_order_result(&self, result: Result<(), AcmeError>) {
        self.state.lock().unwrap().order_results.push_back(result);
    }

    pub fn push_bind_result(&self, result: Result<(), AcmeError>) {
        self.state.lock().unwrap().bind_results.push_back(result);
    }

    pub fn order_requests(&self) -> Vec<(Vec<String>, Option<DateTime<Utc>>)> {
        self.state.lock().unwrap().order_requests.clone()
    }

    pub fn triggers(&self) -> usize {
        self.state.lock().unwrap().triggers.len()
    }

    pub fn challenge_fetches(&self) -> usize {
        self.state.lock().unwrap().challenge_fetches
    }

    pub fn finalized(&self) -> usize {
        self.state.lock().unwrap().finalized.len()
    }

    pub fn new_accounts(&self) -> usize {
        self.state.lock().unwrap().new_accounts
    }

    pub fn binds(&self) -> Vec<String> {
        self.state.lock().unwrap().binds.clone()
    }

    /// Mark an authorization with the given status before it is processed
    pub fn set_authorization_status(&self, domain: &str, status: AuthorizationStatus) {
        let mut state = self.state.lock().unwrap();
        for auth in state.authorizations.values_mut() {
            if auth.domain == domain {
                auth.status = status;
            }
        }
    }

    fn push_event(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }
}

#[async_trait]
impl AcmeTransport for FakeCa {
    async fn new_account(&self, _key: &AccountKey, contact_email: &str) -> Result<String, AcmeError> {
        let mut state = self.state.lock().unwrap();
        state.new_accounts += 1;
        self.push_event(format!("new_account:{}", contact_email));
        Ok(format!("https://ca.test/acct/{}", state.new_accounts))
    }

    async fn bind_account(&self, _key: &AccountKey, account_url: &str) -> Result<(), AcmeError> {
        let mut state = self.state.lock().unwrap();
        state.binds.push(account_url.to_string());
        state.bind_results.pop_front().unwrap_or(Ok(()))
    }

    async fn new_order(
        &self,
        _account: &Account,
        domains: &[String],
        not_after: Option<DateTime<Utc>>,
    ) -> Result<Order, AcmeError> {
        let mut state = self.state.lock().unwrap();
        state.order_requests.push((domains.to_vec(), not_after));
        state.order_results.pop_front().unwrap_or(Ok(()))?;

        state.next_order += 1;
        let order_id = state.next_order;
        let script: VecDeque<ChallengeStatus> = self.default_script.lock().unwrap().iter().copied().collect();
        let offered = self.offered.lock().unwrap().clone();

        let mut authorization_urls = Vec::new();
        for (i, domain) in domains.iter().enumerate() {
            let authz_url = format!("https://ca.test/authz/{}-{}", order_id, i);
            let challenges = offered
                .iter()
                .map(|kind| Challenge {
                    kind: *kind,
                    url: format!("{}/{}", authz_url, kind),
                    token: format!("token{}x{}", order_id, i),
                    status: ChallengeStatus::Pending,
                    error: None,
                })
                .collect::<Vec<_>>();
            for challenge in &challenges {
                state.challenge_script.insert(challenge.url.clone(), script.clone());
            }
            state.authorizations.insert(
                authz_url.clone(),
                Authorization {
                    url: authz_url.clone(),
                    domain: domain.clone(),
                    status: AuthorizationStatus::Pending,
                    challenges,
                },
            );
            authorization_urls.push(authz_url);
        }

        Ok(Order {
            url: format!("https://ca.test/order/{}", order_id),
            status: OrderStatus::Pending,
            domains: domains.to_vec(),
            not_after,
            authorizations: authorization_urls,
            finalize_url: format!("https://ca.test/order/{}/finalize", order_id),
            certificate_url: None,
        })
    }

    async fn fetch_authorization(&self, _account: &Account, url: &str) -> Result<Authorization, AcmeError> {
        let state = self.state.lock().unwrap();
        state
            .authorizations
            .get(url)
            .cloned()
            .ok_or_else(|| AcmeError::Protocol(format!("unknown authorization {}", url)))
    }

    async fn fetch_challenge(&self, _account: &Account, url: &str) -> Result<Challenge, AcmeError> {
        let mut state = self.state.lock().unwrap();
        state.challenge_fetches += 1;

        let script = state
            .challenge_script
            .get_mut(url)
            .ok_or_else(|| AcmeError::Protocol(format!("unknown challenge {}", url)))?;
        let status = if script.len() > 1 {
            script.pop_front().unwrap_or(ChallengeStatus::Pending)
        } else {
            script.front().copied().unwrap_or(ChallengeStatus::Pending)
        };

        let authz_url = url.rsplit_once('/').map(|(a, _)| a.to_string()).unwrap_or_default();
        let auth = state
            .authorizations
            .get_mut(&authz_url)
            .ok_or_else(|| AcmeError::Protocol(format!("no authorization for {}", url)))?;
        let mut challenge = auth
            .challenges
            .iter()
            .find(|c| c.url == url)
            .cloned()
            .ok_or_else(|| AcmeError::Protocol(format!("unknown challenge {}", url)))?;

        challenge.status = status;
        match status {
            ChallengeStatus::Valid => auth.status = AuthorizationStatus::Valid,
            ChallengeStatus::Invalid => {
                auth.status = AuthorizationStatus::Invalid;
                challenge.error = Some(Problem {
                    problem_type: "urn:ietf:params:acme:error:unauthorized".to_string(),
                    detail: Some("Incorrect TXT record".to_string()),
                    status: Some(403),
                });
            }
            _ => {}
        }
        Ok(challenge)
    }

    async fn trigger_challenge(&self, _account: &Account, url: &str) -> Result<Challenge, AcmeError> {
        let mut state = self.state.lock().unwrap();
        state.triggers.push(url.to_string());
        self.push_event(format!("trigger:{}", url));
        let authz_url = url.rsplit_once('/').map(|(a, _)| a.to_string()).unwrap_or_default();
        let mut challenge = state
            .authorizations
            .get(&authz_url)
            .and_then(|auth| auth.challenges.iter().find(|c| c.url == url).cloned())
            .ok_or_else(|| AcmeError::Protocol(format!("unknown challenge {}", url)))?;
        challenge.status = ChallengeStatus::Processing;
        Ok(challenge)
    }

    async fn finalize_order(&self, _account: &Account, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError> {
        let mut state = self.state.lock().unwrap();
        state.finalized.push(csr_der.to_vec());
        self.push_event(format!("finalize:{}", order.url));
        let mut finalized = order.clone();
        finalized.status = OrderStatus::Valid;
        finalized.certificate_url = Some(format!("{}/cert", order.url));
        Ok(finalized)
    }

    async fn download_certificate(&self, _account: &Account, order: &Order) -> Result<String, AcmeError> {
        let domain = order
            .domains
            .first()
            .cloned()
            .ok_or_else(|| AcmeError::Protocol("order without domains".to_string()))?;
        Ok(minted_chain(&domain, 90))
    }
}

/// DNS provider that records every call in the shared log
pub struct FakeDns {
    log: EventLog,
    records: Mutex<HashMap<String, String>>,
    fail_add: bool,
}

impl FakeDns {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            records: Mutex::new(HashMap::new()),
            fail_add: false,
        }
    }

    pub fn failing(log: EventLog) -> Self {
        Self {
            fail_add: true,
            ..Self::new(log)
        }
    }

    pub fn records(&self) -> HashMap<String, String> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn add_txt_record(&self, name: &str, value: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("dns_add:{}", name));
        if self.fail_add {
            anyhow::bail!("DNS API unavailable");
        }
        self.records.lock().unwrap().insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_txt_record(&self, name: &str) -> Result<()> {
        // Suspends like a real API call would
        tokio::task::yield_now().await;
        self.log.lock().unwrap().push(format!("dns_remove:{}", name));
        self.records.lock().unwrap().remove(name);
        Ok(())
    }

    async fn check_propagation(&self, name: &str, value: &str) -> Result<bool> {
        Ok(self.records.lock().unwrap().get(name).map(String::as_str) == Some(value))
    }

    fn provider_name(&self) -> &str {
        "Fake DNS"
    }
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub domain: String,
    pub cert_name: String,
    pub pem_chain: String,
    pub pem_key: String,
}

/// CDN with a fixed inventory that records deployments
pub struct FakeCdn {
    domains: Vec<DomainCertificateStatus>,
    deployments: Mutex<Vec<Deployment>>,
    accept: Mutex<VecDeque<bool>>,
    log: EventLog,
}

impl FakeCdn {
    pub fn new(domains: Vec<DomainCertificateStatus>, log: EventLog) -> Self {
        Self {
            domains,
            deployments: Mutex::new(Vec::new()),
            accept: Mutex::new(VecDeque::new()),
            log,
        }
    }

    /// Queue answers for upcoming deploy calls; unqueued calls succeed
    pub fn push_deploy_answer(&self, accepted: bool) {
        self.accept.lock().unwrap().push_back(accepted);
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.deployments.lock().unwrap().clone()
    }
}

#[async_trait]
impl CdnProvider for FakeCdn {
    async fn list_managed_domains(&self) -> Result<Vec<DomainCertificateStatus>> {
        Ok(self.domains.clone())
    }

    async fn deploy_certificate(
        &self,
        domain: &str,
        cert_name: &str,
        pem_chain: &str,
        pem_key: &str,
    ) -> Result<bool> {
        self.log.lock().unwrap().push(format!("deploy:{}", domain));
        self.deployments.lock().unwrap().push(Deployment {
            domain: domain.to_string(),
            cert_name: cert_name.to_string(),
            pem_chain: pem_chain.to_string(),
            pem_key: pem_key.to_string(),
        });
        Ok(self.accept.lock().unwrap().pop_front().unwrap_or(true))
    }

    fn provider_name(&self) -> &str {
        "Fake CDN"
    }
}

pub fn status(hostname: &str, not_after: Option<DateTime<Utc>>) -> DomainCertificateStatus {
    DomainCertificateStatus {
        hostname: hostname.to_string(),
        not_before: None,
        not_after,
    }
}
