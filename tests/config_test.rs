use edge_cert_renewer::acme::ChallengeType;
use edge_cert_renewer::config::{load_config, validate_config, CdnProviderConfig, DnsProviderConfig};
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const FULL: &str = r#"
[acme]
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
contact_email = "ops@example.com"
keystore_path = "/var/lib/renewer/account_key.pem"
keystore_password = "changeit"
account_file = "/var/lib/renewer/acme_account.properties"

[challenge]
preferred_type = "http-01"
http_webroot = "/srv/www"
propagation_delay_secs = 5
max_attempts = 6
base_interval_secs = 5
growth_factor = 2.0

[renewal]
check_interval_secs = 3600
renew_before_days = 20
validity_days = 90
certs_dir = "/var/lib/renewer/certs"
cert_name_prefix = "prod"

[dns_provider]
type = "aliyun"
access_key_id = "dns-id"
access_key_secret = "dns-secret"

[cdn_provider]
type = "aliyun"
access_key_id = "cdn-id"
access_key_secret = "cdn-secret"
endpoint = "https://cdn.example.test/"

[logging]
level = "debug"
format = "text"
output = "file"
file_path = "/var/log/renewer"

[metrics]
enabled = true
listen_addr = "127.0.0.1:9100"
"#;

#[test]
fn test_load_full_config() {
    let file = write_config(FULL);
    let config = load_config(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.challenge.preferred_type, Some(ChallengeType::Http01));
    assert_eq!(config.challenge.max_attempts, 6);
    assert_eq!(config.renewal.renew_before_days, 20);
    assert_eq!(config.renewal.cert_name_prefix, "prod");
    assert_eq!(config.logging.file_path.as_deref(), Some("/var/log/renewer"));

    match &config.dns_provider {
        Some(DnsProviderConfig::Aliyun { access_key_id, endpoint, .. }) => {
            assert_eq!(access_key_id, "dns-id");
            assert_eq!(endpoint, "https://alidns.aliyuncs.com/");
        }
        None => panic!("dns provider missing"),
    }
    let CdnProviderConfig::Aliyun { endpoint, .. } = &config.cdn_provider;
    assert_eq!(endpoint, "https://cdn.example.test/");

    validate_config(&config).unwrap();
}

#[test]
fn test_http01_does_not_need_dns_provider() {
    let contents = FULL.replace(
        "[dns_provider]\ntype = \"aliyun\"\naccess_key_id = \"dns-id\"\naccess_key_secret = \"dns-secret\"\n",
        "",
    );
    let file = write_config(&contents);
    let config = load_config(file.path().to_str().unwrap()).unwrap();
    assert!(config.dns_provider.is_none());
    validate_config(&config).unwrap();
}

#[test]
fn test_missing_file_is_an_error() {
    let err = load_config("/nonexistent/renewer.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_malformed_file_is_an_error() {
    let file = write_config("[acme\ncontact_email = ");
    let err = load_config(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_validation_rejects_bad_values() {
    let file = write_config(FULL);
    let base = load_config(file.path().to_str().unwrap()).unwrap();

    let mut config = base.clone();
    config.acme.contact_email = "not-an-email".to_string();
    assert!(validate_config(&config).is_err());

    let mut config = base.clone();
    config.acme.keystore_password = String::new();
    assert!(validate_config(&config).is_err());

    let mut config = base.clone();
    config.challenge.max_attempts = 0;
    assert!(validate_config(&config).is_err());

    let mut config = base.clone();
    config.renewal.renew_before_days = 90;
    assert!(validate_config(&config).is_err());

    let mut config = base;
    config.metrics.listen_addr = "nowhere".to_string();
    assert!(validate_config(&config).is_err());
}

#[test]
fn test_webroot_only_challenge_section_without_dns_provider() {
    let file = write_config(
        r#"
[acme]
contact_email = "ops@example.com"
keystore_password = "changeit"

[challenge]
http_webroot = "/srv/www"

[cdn_provider]
type = "aliyun"
access_key_id = "cdn-id"
access_key_secret = "cdn-secret"
"#,
    );
    let config = load_config(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.challenge.preferred_type, Some(ChallengeType::Dns01));
    assert!(config.dns_provider.is_none());
    validate_config(&config).unwrap();
}
