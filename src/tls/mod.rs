// Certificate lifecycle: account, challenges, orders, storage and renewal

pub mod account_store;
pub mod certificate_store;
pub mod challenge_handler;
pub mod challenge_processor;
pub mod dns_provider;
pub mod expiry_probe;
pub mod order_client;
pub mod renewal;

pub use account_store::{AccountRecord, AccountStore};
pub use certificate_store::{CertificateInfo, CertificateStore, IssuedCertificate, StoredCertificate};
pub use challenge_handler::ChallengeHandler;
pub use challenge_processor::{ChallengeProcessor, ChallengeSettings};
pub use order_client::OrderClient;
pub use renewal::{CycleReport, RenewalOutcome, RenewalScheduler, RenewalSettings};
