//! Certificate decoding and chain validation for operational credentials
//! (RCAC / ICAC / NOC). Delegates actual ASN.1 parsing to `x509-parser`
//! rather than hand-rolling it; this crate only adds the Matter-specific
//! extraction and fabric-id cross-checks layered on top.

use std::collections::HashSet;

use fabric_ids::{FabricId, NodeId};
use thiserror::Error;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{KeyUsage, ParsedExtension};
use x509_parser::prelude::FromDer;

/// Maximum size of any single certificate buffer a `FabricEntry` will hold.
pub const MAX_CERT_LEN: usize = 400;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate buffer exceeds MAX_CERT_LEN ({0} bytes)")]
    BufferTooLarge(usize),
    #[error("certificate failed to parse: {0}")]
    ParseFailure(String),
    #[error("certificate chain is not trusted")]
    CertNotTrusted,
    #[error("required key usage missing from certificate")]
    MissingKeyUsage,
    #[error("required extended key usage missing from certificate")]
    MissingKeyPurpose,
    #[error("NOC is missing an operational node id or fabric id")]
    MissingOperationalIds,
    #[error("ICAC fabric id does not match NOC fabric id")]
    FabricMismatchOnIca,
    #[error("root fabric id does not match NOC fabric id, or root has a fabric id with no matching ICAC one")]
    WrongCertDn,
}

/// Subset of RFC 5280 key usage bits this validator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequiredKeyUsage {
    DigitalSignature,
    KeyCertSign,
}

/// Extended key usage purposes this validator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequiredKeyPurpose {
    ServerAuth,
    ClientAuth,
}

/// Policy a caller hands to `verify_credentials`: which key usage bits and
/// extended key usage purposes the leaf certificate must carry.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub required_key_usages: HashSet<RequiredKeyUsage>,
    pub required_key_purposes: HashSet<RequiredKeyPurpose>,
}

/// A decoded certificate's operational identity fields, extracted once so
/// callers don't re-parse ASN.1 for every accessor.
#[derive(Debug, Clone)]
pub struct CertIdentity {
    pub subject_public_key: Vec<u8>,
    pub subject_key_id: Option<Vec<u8>>,
    pub fabric_id: Option<FabricId>,
    pub node_id: Option<NodeId>,
}

/// Parses DER-encoded certificates and extracts the fields the fabric table
/// needs, isolating every direct `x509_parser` call behind this trait so a
/// future platform-provided decoder (vendored, hardware-backed) can replace
/// it without touching `fabric-table`.
pub trait CertificateDecoder: Send + Sync {
    fn decode(&self, der: &[u8]) -> Result<CertIdentity, CertError>;

    /// Runs chain validation honoring `ctx`, returning the leaf's identity
    /// on success. `root` is the trust anchor; `icac` is optional.
    fn verify_chain(
        &self,
        root: &[u8],
        icac: Option<&[u8]>,
        noc: &[u8],
        ctx: &ValidationContext,
    ) -> Result<CertIdentity, CertError>;
}

/// `x509-parser`-backed decoder. The only concrete implementation shipped;
/// real chain-of-trust verification (signature chaining) is delegated to
/// `x509_parser::verify` helpers rather than reimplemented.
#[derive(Debug, Default, Clone, Copy)]
pub struct X509CertificateDecoder;

impl X509CertificateDecoder {
    pub fn new() -> Self {
        Self
    }

    fn parse<'a>(&self, der: &'a [u8]) -> Result<X509Certificate<'a>, CertError> {
        if der.len() > MAX_CERT_LEN {
            return Err(CertError::BufferTooLarge(der.len()));
        }
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| CertError::ParseFailure(e.to_string()))?;
        Ok(cert)
    }

    fn extract_identity(&self, cert: &X509Certificate<'_>) -> CertIdentity {
        let subject_public_key = cert.public_key().subject_public_key.data.to_vec();
        let subject_key_id = cert.get_extension_unique(&oid_registry::OID_X509_EXT_SUBJECT_KEY_IDENTIFIER)
            .ok()
            .flatten()
            .and_then(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(skid) => Some(skid.0.to_vec()),
                _ => None,
            });

        let matter_ids = extract_matter_ids_from_subject(cert);

        CertIdentity {
            subject_public_key,
            subject_key_id,
            fabric_id: matter_ids.0,
            node_id: matter_ids.1,
        }
    }

    fn check_key_usage(&self, cert: &X509Certificate<'_>, ctx: &ValidationContext) -> Result<(), CertError> {
        if ctx.required_key_usages.is_empty() {
            return Ok(());
        }
        let key_usage = cert
            .get_extension_unique(&oid_registry::OID_X509_EXT_KEY_USAGE)
            .ok()
            .flatten()
            .and_then(|ext| match ext.parsed_extension() {
                ParsedExtension::KeyUsage(ku) => Some(*ku),
                _ => None,
            });

        let Some(ku) = key_usage else {
            return Err(CertError::MissingKeyUsage);
        };

        for required in &ctx.required_key_usages {
            let present = match required {
                RequiredKeyUsage::DigitalSignature => ku.digital_signature(),
                RequiredKeyUsage::KeyCertSign => ku.key_cert_sign(),
            };
            if !present {
                return Err(CertError::MissingKeyUsage);
            }
        }
        Ok(())
    }

    fn check_key_purpose(&self, cert: &X509Certificate<'_>, ctx: &ValidationContext) -> Result<(), CertError> {
        if ctx.required_key_purposes.is_empty() {
            return Ok(());
        }
        let eku = cert
            .get_extension_unique(&oid_registry::OID_X509_EXT_EXTENDED_KEY_USAGE)
            .ok()
            .flatten()
            .and_then(|ext| match ext.parsed_extension() {
                ParsedExtension::ExtendedKeyUsage(eku) => Some(eku.clone()),
                _ => None,
            });

        let Some(eku) = eku else {
            return Err(CertError::MissingKeyPurpose);
        };

        for required in &ctx.required_key_purposes {
            let present = match required {
                RequiredKeyPurpose::ServerAuth => eku.server_auth,
                RequiredKeyPurpose::ClientAuth => eku.client_auth,
            };
            if !present {
                return Err(CertError::MissingKeyPurpose);
            }
        }
        Ok(())
    }
}

impl CertificateDecoder for X509CertificateDecoder {
    fn decode(&self, der: &[u8]) -> Result<CertIdentity, CertError> {
        let cert = self.parse(der)?;
        Ok(self.extract_identity(&cert))
    }

    fn verify_chain(
        &self,
        root: &[u8],
        icac: Option<&[u8]>,
        noc: &[u8],
        ctx: &ValidationContext,
    ) -> Result<CertIdentity, CertError> {
        let root_cert = self.parse(root)?;
        let icac_cert = icac.map(|bytes| self.parse(bytes)).transpose()?;
        let noc_cert = self.parse(noc)?;

        self.check_key_usage(&noc_cert, ctx)?;
        self.check_key_purpose(&noc_cert, ctx)?;

        let issuer_of_noc = icac_cert.as_ref().unwrap_or(&root_cert);
        if noc_cert.verify_signature(Some(issuer_of_noc.public_key())).is_err() {
            warn!("NOC signature did not verify against its issuer");
            return Err(CertError::CertNotTrusted);
        }
        if let Some(icac_cert) = &icac_cert {
            if icac_cert.verify_signature(Some(root_cert.public_key())).is_err() {
                warn!("ICAC signature did not verify against root");
                return Err(CertError::CertNotTrusted);
            }
        }

        let noc_identity = self.extract_identity(&noc_cert);
        let noc_fabric_id = noc_identity.fabric_id.ok_or(CertError::MissingOperationalIds)?;
        if noc_identity.node_id.is_none() {
            return Err(CertError::MissingOperationalIds);
        }

        if let Some(icac_cert) = &icac_cert {
            let icac_identity = self.extract_identity(icac_cert);
            if let Some(icac_fabric_id) = icac_identity.fabric_id {
                if icac_fabric_id != noc_fabric_id {
                    return Err(CertError::FabricMismatchOnIca);
                }
            }
        }

        let root_identity = self.extract_identity(&root_cert);
        if let Some(root_fabric_id) = root_identity.fabric_id {
            if root_fabric_id != noc_fabric_id {
                return Err(CertError::WrongCertDn);
            }
            if icac_cert.is_some() {
                let icac_identity = self.extract_identity(icac_cert.as_ref().unwrap());
                if icac_identity.fabric_id.is_none() {
                    return Err(CertError::WrongCertDn);
                }
            }
        }

        debug!(fabric_id = ?noc_fabric_id, "NOC chain verified");
        Ok(noc_identity)
    }
}

/// Extracts Matter's `FabricID=` / `NodeID=` RDN attributes from a
/// certificate's subject, where present. Matter encodes these as custom
/// attribute OIDs inside the subject DN rather than standard extensions;
/// here we look for hex-encoded attribute values tagged with the
/// well-known Matter OIDs.
fn extract_matter_ids_from_subject(cert: &X509Certificate<'_>) -> (Option<FabricId>, Option<NodeId>) {
    let mut fabric_id = None;
    let mut node_id = None;
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            let oid = attr.attr_type().to_id_string();
            let Ok(value) = attr.as_str() else { continue };
            match oid.as_str() {
                MATTER_FABRIC_ID_OID => {
                    if let Ok(v) = u64::from_str_radix(value, 16) {
                        fabric_id = Some(FabricId(v));
                    }
                }
                MATTER_NODE_ID_OID => {
                    if let Ok(v) = u64::from_str_radix(value, 16) {
                        node_id = Some(NodeId(v));
                    }
                }
                _ => {}
            }
        }
    }
    (fabric_id, node_id)
}

/// Matter's assigned arc for the Fabric ID subject attribute.
const MATTER_FABRIC_ID_OID: &str = "1.3.6.1.4.1.37244.1.5";
/// Matter's assigned arc for the Node ID subject attribute.
const MATTER_NODE_ID_OID: &str = "1.3.6.1.4.1.37244.1.1";

/// Convenience re-export so callers matching on a parsed key usage value
/// don't need their own `x509_parser` dependency just for the type name.
pub type RawKeyUsage = KeyUsage;
