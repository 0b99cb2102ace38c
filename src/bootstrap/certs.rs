//! Self-signed CA and server certificate for the webhook

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};

use crate::error::Result;

const KEY_BITS: u32 = 2048;

/// A certificate and the key it was issued for
pub struct KeyPair {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// PEM material the webhook serves with and registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertBundle {
    pub ca_cert: Vec<u8>,
    pub server_cert: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl CertBundle {
    /// Fresh CA plus a server certificate for `service` in `namespace`
    pub fn generate(service: &str, namespace: &str, validity_days: u32) -> Result<Self> {
        let ca = new_ca(&format!("{}-ca", service), validity_days)?;
        let server = new_server_pair(
            &ca,
            &format!("{}.{}.svc", service, namespace),
            &service_dns_names(service, namespace),
            validity_days,
        )?;
        Ok(Self {
            ca_cert: ca.cert.to_pem()?,
            server_cert: server.cert.to_pem()?,
            server_key: server.key.private_key_to_pem_pkcs8()?,
        })
    }
}

/// Names the API server may use to reach `service`
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
        format!("{}.{}.svc.cluster.local", service, namespace),
    ]
}

fn new_key() -> Result<PKey<Private>> {
    Ok(PKey::from_rsa(Rsa::generate(KEY_BITS)?)?)
}

fn serial_number() -> Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn common_name(cn: &str) -> Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", cn)?;
    Ok(name.build())
}

fn base_builder(subject: &X509Name, key: &PKey<Private>, validity_days: u32) -> Result<X509Builder> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = serial_number()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

/// Self-signed signing certificate
pub fn new_ca(cn: &str, validity_days: u32) -> Result<KeyPair> {
    let key = new_key()?;
    let name = common_name(cn)?;
    let mut builder = base_builder(&name, &key, validity_days)?;
    builder.set_issuer_name(&name)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    let key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(key_id)?;
    builder.sign(&key, MessageDigest::sha256())?;
    Ok(KeyPair {
        cert: builder.build(),
        key,
    })
}

/// Server certificate for `dns_names`, signed by `ca`
pub fn new_server_pair(
    ca: &KeyPair,
    cn: &str,
    dns_names: &[String],
    validity_days: u32,
) -> Result<KeyPair> {
    let key = new_key()?;
    let mut builder = base_builder(&common_name(cn)?, &key, validity_days)?;
    builder.set_issuer_name(ca.cert.subject_name())?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let mut san = SubjectAlternativeName::new();
    for name in dns_names {
        san.dns(name);
    }
    let san = san.build(&builder.x509v3_context(Some(&ca.cert), None))?;
    builder.append_extension(san)?;
    let authority = AuthorityKeyIdentifier::new()
        .keyid(false)
        .issuer(false)
        .build(&builder.x509v3_context(Some(&ca.cert), None))?;
    builder.append_extension(authority)?;

    builder.sign(&ca.key, MessageDigest::sha256())?;
    Ok(KeyPair {
        cert: builder.build(),
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_cert_is_signed_by_ca() {
        let bundle = CertBundle::generate("admission-server-svc", "openebs", 30).unwrap();
        let ca = X509::from_pem(&bundle.ca_cert).unwrap();
        let server = X509::from_pem(&bundle.server_cert).unwrap();

        assert!(server.verify(&ca.public_key().unwrap()).unwrap());
        assert!(ca.verify(&ca.public_key().unwrap()).unwrap());
        assert!(PKey::private_key_from_pem(&bundle.server_key).is_ok());

        let sans: Vec<String> = server
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(sans, service_dns_names("admission-server-svc", "openebs"));
        assert!(sans.contains(&"admission-server-svc.openebs.svc.cluster.local".to_string()));
    }

    #[test]
    fn test_bundles_are_unique() {
        let a = CertBundle::generate("svc", "ns", 1).unwrap();
        let b = CertBundle::generate("svc", "ns", 1).unwrap();
        assert_ne!(a.ca_cert, b.ca_cert);
    }
}
