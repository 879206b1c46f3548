//! Generates, (de)serializes and inspects the CA and serving certificates

use std::collections::BTreeMap;

use openssl::{
    asn1::{Asn1Integer, Asn1Time, TimeDiff},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509NameBuilder, X509Ref, X509,
    },
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{k8s_openapi::ByteString, time::Duration};
use time::OffsetDateTime;

pub const SECRET_KEY_CERT: &str = "tls.crt";
pub const SECRET_KEY_KEY: &str = "tls.key";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("secret is missing required key {key:?}"))]
    MissingKey { key: &'static str },

    #[snafu(display("failed to load certificate from key {key:?}"))]
    LoadCertificate {
        source: openssl::error::ErrorStack,
        key: &'static str,
    },

    #[snafu(display("private key does not belong to the certificate"))]
    KeyMismatch,

    #[snafu(display("failed to read certificate expiry"))]
    ReadExpiry { source: openssl::error::ErrorStack },

    #[snafu(display("certificate expiry is out of range"))]
    ExpiryOutOfRange { source: time::error::ComponentRange },

    #[snafu(display("failed to fingerprint certificate"))]
    Fingerprint { source: openssl::error::ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Generation failures point at the host (entropy, OpenSSL itself), not at stored data.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::GenerateKey { .. }
            | Error::BuildCertificate { .. }
            | Error::SerializeCertificate { .. } => true,
            Error::MissingKey { .. }
            | Error::LoadCertificate { .. }
            | Error::KeyMismatch
            | Error::ReadExpiry { .. }
            | Error::ExpiryOutOfRange { .. }
            | Error::Fingerprint { .. } => false,
        }
    }
}

/// A certificate together with its private key.
pub struct CertifiedKeyPair {
    pub certificate: X509,
    pub private_key: PKey<Private>,
    not_after: OffsetDateTime,
}

impl CertifiedKeyPair {
    /// Parses a PEM-encoded certificate and private key, and checks that they belong together.
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<Self> {
        let certificate = X509::from_pem(certificate_pem).context(LoadCertificateSnafu {
            key: SECRET_KEY_CERT,
        })?;
        let private_key = PKey::private_key_from_pem(private_key_pem).context(
            LoadCertificateSnafu {
                key: SECRET_KEY_KEY,
            },
        )?;
        let public_key = certificate.public_key().context(LoadCertificateSnafu {
            key: SECRET_KEY_CERT,
        })?;
        ensure!(public_key.public_eq(&private_key), KeyMismatchSnafu);
        Ok(Self {
            not_after: not_after(&certificate)?,
            certificate,
            private_key,
        })
    }

    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Result<Self> {
        let certificate = data.get(SECRET_KEY_CERT).context(MissingKeySnafu {
            key: SECRET_KEY_CERT,
        })?;
        let private_key = data.get(SECRET_KEY_KEY).context(MissingKeySnafu {
            key: SECRET_KEY_KEY,
        })?;
        Self::from_pem(&certificate.0, &private_key.0)
    }

    pub fn to_secret_data(&self) -> Result<BTreeMap<String, ByteString>> {
        Ok([
            (SECRET_KEY_CERT.to_string(), ByteString(self.certificate_pem()?)),
            (
                SECRET_KEY_KEY.to_string(),
                ByteString(
                    self.private_key
                        .private_key_to_pem_pkcs8()
                        .context(SerializeCertificateSnafu)?,
                ),
            ),
        ]
        .into())
    }

    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        self.certificate.to_pem().context(SerializeCertificateSnafu)
    }

    /// Lowercase hex SHA-256 digest of the DER-encoded certificate.
    pub fn fingerprint(&self) -> Result<String> {
        let digest = self
            .certificate
            .digest(MessageDigest::sha256())
            .context(FingerprintSnafu)?;
        Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Whether the certificate is no longer valid for at least `threshold` after `now`.
    pub fn expires_within(&self, now: OffsetDateTime, threshold: Duration) -> bool {
        self.not_after <= now + threshold
    }
}

/// OpenSSL only exposes certificate times as ASN.1, so measure the distance from the Unix epoch.
fn not_after(certificate: &X509Ref) -> Result<OffsetDateTime> {
    let epoch = Asn1Time::from_unix(0).context(ReadExpirySnafu)?;
    let TimeDiff { days, secs } = epoch
        .diff(certificate.not_after())
        .context(ReadExpirySnafu)?;
    OffsetDateTime::from_unix_timestamp(i64::from(days) * 86_400 + i64::from(secs))
        .context(ExpiryOutOfRangeSnafu)
}

fn generate_key() -> Result<PKey<Private>> {
    Rsa::generate(2048)
        .and_then(PKey::try_from)
        .context(GenerateKeySnafu)
}

fn random_serial() -> Result<Asn1Integer, openssl::error::ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}

/// Generates a new self-signed CA, valid from now for `validity`.
pub fn new_self_signed_ca(common_name: &str, validity: Duration) -> Result<CertifiedKeyPair> {
    let subject_name = X509NameBuilder::new()
        .and_then(|mut name| {
            name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
            Ok(name)
        })
        .context(BuildCertificateSnafu)?
        .build();
    let now = OffsetDateTime::now_utc();
    // Backdate slightly, to tolerate clock skew between us and the API server
    let not_before = now - Duration::from_minutes_unchecked(5);
    let not_after = now + validity;
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    let ca_key = generate_key()?;
    let ca_cert = X509Builder::new()
        .and_then(|mut x509| {
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(&subject_name)?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&ca_key)?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let ctx = x509.x509v3_context(None, Some(&conf));
            let exts = [
                BasicConstraints::new().critical().ca().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(false)
                    .keyid(false)
                    .build(&ctx)?,
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            ];
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca_key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build();
    Ok(CertifiedKeyPair {
        certificate: ca_cert,
        private_key: ca_key,
        not_after,
    })
}

/// Generates a server certificate for `dns_names`, signed by `ca` and valid from now for `validity`.
///
/// The first DNS name doubles as the subject's common name.
pub fn new_server_certificate(
    ca: &CertifiedKeyPair,
    dns_names: &[String],
    validity: Duration,
) -> Result<CertifiedKeyPair> {
    let now = OffsetDateTime::now_utc();
    let not_before = now - Duration::from_minutes_unchecked(5);
    let not_after = now + validity;
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    let server_key = generate_key()?;
    let server_cert = X509Builder::new()
        .and_then(|mut x509| {
            let subject_name = X509NameBuilder::new()
                .and_then(|mut name| {
                    name.append_entry_by_nid(
                        Nid::COMMONNAME,
                        dns_names.first().map_or("webhook", String::as_str),
                    )?;
                    Ok(name)
                })?
                .build();
            x509.set_subject_name(&subject_name)?;
            x509.set_issuer_name(ca.certificate.subject_name())?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&server_key)?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            x509.set_serial_number(random_serial()?.as_ref())?;
            let ctx = x509.x509v3_context(Some(&ca.certificate), Some(&conf));
            let mut exts = vec![
                BasicConstraints::new().critical().build()?,
                KeyUsage::new()
                    .critical()
                    .key_encipherment()
                    .digital_signature()
                    .build()?,
                ExtendedKeyUsage::new().server_auth().build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
            ];
            if !dns_names.is_empty() {
                let mut san_ext = SubjectAlternativeName::new();
                for dns in dns_names {
                    san_ext.dns(dns);
                }
                exts.push(san_ext.build(&ctx)?);
            }
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&ca.private_key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build();
    Ok(CertifiedKeyPair {
        certificate: server_cert,
        private_key: server_key,
        not_after,
    })
}

/// All names the API server may use to reach `service` in `namespace`.
pub fn service_dns_names(service: &str, namespace: &str, cluster_domain: &str) -> Vec<String> {
    vec![
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.{cluster_domain}"),
        format!("{service}.{namespace}"),
        service.to_string(),
    ]
}
