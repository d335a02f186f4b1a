//! TLS certificate material: inspecting an existing certificate, and
//! generating the self-signed one passim uses on first start.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509NameBuilder, X509};

use crate::statedir;

const KEY_BITS: u32 = 2048;
const CERT_LIFETIME_DAYS: u32 = 365 * 10;

/// Default path for the daemon's private key, under the state directory.
pub fn default_key_path() -> PathBuf {
    PathBuf::from(statedir!("/secret.key"))
}

/// Default path for the daemon's certificate, under the state directory.
pub fn default_cert_path() -> PathBuf {
    PathBuf::from(statedir!("/cert.pem"))
}

/// Generate an RSA key and self-signed certificate suitable for serving
/// HTTPS, and write them as PEM to `key_path`/`cert_path` if they don't
/// already exist. Returns without regenerating if both files are present.
pub fn ensure_self_signed(key_path: &Path, cert_path: &Path) -> Result<(), Error> {
    if key_path.exists() && cert_path.exists() {
        return Ok(());
    }

    let rsa = Rsa::generate(KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let cert = build_self_signed_cert(&key)?;

    let mode = nix::sys::stat::Mode::from_bits_truncate(0o600);
    crate::tools::atomic_write(key_path, &key.private_key_to_pem_pkcs8()?, mode)?;

    let cert_mode = nix::sys::stat::Mode::from_bits_truncate(0o644);
    crate::tools::atomic_write(cert_path, &cert.to_pem()?, cert_mode)?;

    Ok(())
}

fn build_self_signed_cert(key: &PKey<Private>) -> Result<X509, Error> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", "passim")?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;

    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(CERT_LIFETIME_DAYS)?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new().digital_signature().key_encipherment().build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(key, MessageDigest::sha256())?;

    Ok(builder.build())
}

/// Inspects a loaded certificate; used by the control plane and tests to
/// confirm the generated certificate looks right.
pub struct CertInfo {
    x509: X509,
}

fn x509name_to_string(name: &openssl::x509::X509NameRef) -> Result<String, Error> {
    let mut parts = Vec::new();
    for entry in name.entries() {
        parts.push(format!(
            "{} = {}",
            entry.object().nid().short_name()?,
            entry.data().as_utf8()?
        ));
    }
    Ok(parts.join(", "))
}

impl CertInfo {
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        Self::from_pem(&std::fs::read(path)?)
            .map_err(|err| format_err!("failed to load certificate from {:?} - {}", path, err))
    }

    pub fn from_pem(cert_pem: &[u8]) -> Result<Self, Error> {
        let x509 = X509::from_pem(cert_pem)?;
        Ok(Self { x509 })
    }

    pub fn subject_name(&self) -> Result<String, Error> {
        x509name_to_string(self.x509.subject_name())
    }

    pub fn issuer_name(&self) -> Result<String, Error> {
        x509name_to_string(self.x509.issuer_name())
    }

    pub fn fingerprint(&self) -> Result<String, Error> {
        let fp = self.x509.digest(MessageDigest::sha256())?;
        Ok(hex::encode(fp)
            .as_bytes()
            .chunks(2)
            .map(|v| std::str::from_utf8(v).unwrap())
            .collect::<Vec<&str>>()
            .join(":"))
    }

    pub fn public_key(&self) -> Result<PKey<Public>, Error> {
        Ok(self.x509.public_key()?)
    }

    /// True if the certificate's `notAfter` is before "now".
    pub fn is_expired(&self) -> Result<bool, Error> {
        let now = Asn1Time::days_from_now(0)?;
        Ok(self.x509.not_after() < now.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_loads_a_valid_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("secret.key");
        let cert_path = dir.path().join("cert.pem");

        ensure_self_signed(&key_path, &cert_path).unwrap();
        assert!(key_path.exists());
        assert!(cert_path.exists());

        let info = CertInfo::from_path(&cert_path).unwrap();
        assert!(info.subject_name().unwrap().contains("passim"));
        assert!(!info.is_expired().unwrap());
    }

    #[test]
    fn second_call_does_not_regenerate() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("secret.key");
        let cert_path = dir.path().join("cert.pem");

        ensure_self_signed(&key_path, &cert_path).unwrap();
        let first = std::fs::read(&cert_path).unwrap();
        ensure_self_signed(&key_path, &cert_path).unwrap();
        let second = std::fs::read(&cert_path).unwrap();
        assert_eq!(first, second);
    }
}
