mod common;

use chrono::{TimeZone, Utc};
use common::minted_chain;
use edge_cert_renewer::tls::certificate_store::extract_cert_info;
use edge_cert_renewer::tls::{CertificateStore, IssuedCertificate};

fn issued(domain: &str) -> IssuedCertificate {
    let key = rcgen::KeyPair::generate().unwrap();
    IssuedCertificate::from_pem(minted_chain(domain, 90), key.serialize_pem()).unwrap()
}

#[tokio::test]
async fn test_latest_prefers_newest_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertificateStore::new(dir.path());

    let older = issued("a.example.com");
    let newer = issued("a.example.com");
    store
        .save_at("a.example.com", &newer, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap())
        .await
        .unwrap();
    store
        .save_at("a.example.com", &older, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
        .await
        .unwrap();

    let latest = store.latest("a.example.com").await.unwrap().unwrap();
    assert_eq!(latest.certificate.leaf.serial, newer.leaf.serial);
    assert_eq!(latest.certificate.chain_pem, newer.chain_pem);
    assert_eq!(latest.certificate.key_pem, newer.key_pem);
}

#[tokio::test]
async fn test_domains_do_not_shadow_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertificateStore::new(dir.path());

    let root = issued("example.com");
    let sub = issued("a.example.com");
    store.save("example.com", &root).await.unwrap();
    store.save("a.example.com", &sub).await.unwrap();

    let latest_root = store.latest("example.com").await.unwrap().unwrap();
    assert_eq!(latest_root.certificate.leaf.serial, root.leaf.serial);
    assert_eq!(latest_root.certificate.leaf.domains, vec!["example.com".to_string()]);

    assert!(store.latest("b.example.com").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unrelated_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.example.com_backup_cert.pem"), "junk").unwrap();
    std::fs::write(dir.path().join("README"), "notes").unwrap();

    let store = CertificateStore::new(dir.path());
    assert!(store.latest("a.example.com").await.unwrap().is_none());

    let cert = issued("a.example.com");
    let stored = store.save("a.example.com", &cert).await.unwrap();
    let latest = store.latest("a.example.com").await.unwrap().unwrap();
    assert_eq!(latest.cert_path, stored.cert_path);
}

#[tokio::test]
async fn test_persisted_chain_reparses_identically() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertificateStore::new(dir.path());
    let cert = issued("r.example.com");

    let stored = store.save("r.example.com", &cert).await.unwrap();
    let reloaded = IssuedCertificate::from_pem(
        std::fs::read_to_string(&stored.cert_path).unwrap(),
        std::fs::read_to_string(&stored.key_path).unwrap(),
    )
    .unwrap();

    assert_eq!(reloaded.chain.len(), cert.chain.len());
    let serials = |c: &IssuedCertificate| -> Vec<String> {
        c.chain
            .iter()
            .map(|der| extract_cert_info(der).unwrap().serial)
            .collect()
    };
    assert_eq!(serials(&reloaded), serials(&cert));
    assert_eq!(reloaded.leaf, cert.leaf);
}
