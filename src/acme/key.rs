//! RSA key material: the account key that signs CA requests and the per-order
//! domain key that becomes the certificate subject key.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;

/// RSA modulus size for both account and domain keys
pub const RSA_KEY_BITS: usize = 2048;

fn generate_rsa() -> Result<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).context("Failed to generate RSA key")
}

/// The account key pair. Authenticates every account-level request.
#[derive(Clone)]
pub struct AccountKey {
    private: RsaPrivateKey,
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("bits", &(self.private.size() * 8))
            .field("private", &"<REDACTED>")
            .finish()
    }
}

impl AccountKey {
    /// Generate a fresh key. CPU bound; call from a blocking context.
    pub fn generate() -> Result<Self> {
        Ok(Self {
            private: generate_rsa()?,
        })
    }

    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        Self { private }
    }

    /// Decode a password-encrypted PKCS#8 PEM document
    pub fn from_encrypted_pem(pem: &str, password: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password.as_bytes())
            .map_err(|e| anyhow!("Failed to decrypt account key: {}", e))?;
        Ok(Self { private })
    }

    /// Encode as password-encrypted PKCS#8 PEM
    pub fn to_encrypted_pem(&self, password: &str) -> Result<String> {
        let mut rng = rand::thread_rng();
        let pem = self
            .private
            .to_pkcs8_encrypted_pem(&mut rng, password.as_bytes(), LineEnding::LF)
            .map_err(|e| anyhow!("Failed to encrypt account key: {}", e))?;
        Ok(pem.to_string())
    }

    fn private_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| anyhow!("Failed to encode account key: {}", e))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// True when both keys encode to the same private key bytes
    pub fn matches(&self, other: &AccountKey) -> bool {
        match (self.private_der(), other.private_der()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Hex SHA-256 of the DER-encoded public key
    pub fn fingerprint(&self) -> Result<String> {
        let spki = self
            .private
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| anyhow!("Failed to encode public key: {}", e))?;
        Ok(hex_lower(&Sha256::digest(spki.as_bytes())))
    }

    /// Public key as an RFC 7517 JWK
    pub fn jwk(&self) -> serde_json::Value {
        json!({
            "e": URL_SAFE_NO_PAD.encode(self.private.e().to_bytes_be()),
            "kty": "RSA",
            "n": URL_SAFE_NO_PAD.encode(self.private.n().to_bytes_be()),
        })
    }

    /// RFC 7638 thumbprint over the canonical JWK members
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(self.private.e().to_bytes_be()),
            URL_SAFE_NO_PAD.encode(self.private.n().to_bytes_be()),
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Key authorization for a challenge token (`token.thumbprint`)
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint())
    }

    /// RS256 signature over `data`
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| anyhow!("Failed to sign request: {}", e))?;
        Ok(signature.to_vec())
    }
}

/// TXT record value for a DNS-01 key authorization
pub fn dns_txt_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Subject key of an issued certificate. Generated per order, never reused.
#[derive(Clone)]
pub struct DomainKey {
    private: RsaPrivateKey,
}

impl fmt::Debug for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainKey")
            .field("private", &"<REDACTED>")
            .finish()
    }
}

impl DomainKey {
    /// Generate a fresh key. CPU bound; call from a blocking context.
    pub fn generate() -> Result<Self> {
        Ok(Self {
            private: generate_rsa()?,
        })
    }

    /// Unencrypted PKCS#8 PEM, the form CDNs accept for upload
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow!("Failed to encode domain key: {}", e))?;
        Ok(pem.to_string())
    }

    /// DER-encoded CSR covering exactly `domains`, signed with this key
    pub fn csr_der(&self, domains: &[String]) -> Result<Vec<u8>> {
        let primary = domains
            .first()
            .ok_or_else(|| anyhow!("Cannot build CSR for empty domain list"))?;

        let pem = self.to_pkcs8_pem()?;
        let key_pair = rcgen::KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
            .context("Failed to load domain key for CSR signing")?;

        let mut params =
            rcgen::CertificateParams::new(domains.to_vec()).context("Invalid CSR domain list")?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, primary.clone());

        let csr = params
            .serialize_request(&key_pair)
            .context("Failed to sign CSR")?;
        let der: &[u8] = csr.der().as_ref();
        Ok(der.to_vec())
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::FromDer;

    #[test]
    fn test_key_validation_is_reflexive() {
        let key = AccountKey::generate().unwrap();
        assert!(key.matches(&key));
        assert!(key.matches(&key.clone()));

        let other = AccountKey::generate().unwrap();
        assert!(!key.matches(&other));
        assert_ne!(key.fingerprint().unwrap(), other.fingerprint().unwrap());
    }

    #[test]
    fn test_encrypted_pem_roundtrip() {
        let key = AccountKey::generate().unwrap();
        let pem = key.to_encrypted_pem("s3cret").unwrap();
        assert!(pem.contains("ENCRYPTED PRIVATE KEY"));

        let loaded = AccountKey::from_encrypted_pem(&pem, "s3cret").unwrap();
        assert!(loaded.matches(&key));
        assert!(AccountKey::from_encrypted_pem(&pem, "wrong").is_err());
    }

    #[test]
    fn test_key_authorization_format() {
        let key = AccountKey::generate().unwrap();
        let key_auth = key.key_authorization("token123");
        let (token, thumbprint) = key_auth.split_once('.').unwrap();
        assert_eq!(token, "token123");
        assert_eq!(thumbprint, key.thumbprint());
        // SHA-256 digest, base64url without padding
        assert_eq!(dns_txt_value(&key_auth).len(), 43);
    }

    #[test]
    fn test_csr_covers_requested_domains() {
        let key = DomainKey::generate().unwrap();
        let domains = vec!["a.example.com".to_string(), "www.a.example.com".to_string()];
        let der = key.csr_der(&domains).unwrap();

        let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(&der)
            .unwrap();
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "a.example.com");
        assert!(key.csr_der(&[]).is_err());
    }
}
