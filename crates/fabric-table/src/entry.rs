use fabric_certs::{CertificateDecoder, MAX_CERT_LEN, ValidationContext};
use fabric_crypto::FabricKeypair;
use fabric_ids::{CompressedFabricId, FabricId, FabricIndex, NodeId, VendorId};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::error::FabricError;

/// Matches the original `kFabricLabelMaxLengthInBytes`.
pub const FABRIC_LABEL_MAX_LEN: usize = 32;

/// One fabric's operational identity and credentials: root/intermediate/leaf
/// certificates, the operational keypair, and the values derived from them.
/// A table slot that has never been provisioned, or has been `reset()`, is
/// indistinguishable from any other uninitialized slot other than its
/// `index`.
pub struct FabricEntry {
    index: FabricIndex,
    fabric_id: FabricId,
    node_id: NodeId,
    vendor_id: VendorId,
    label: String,
    operational_keypair: Option<FabricKeypair>,
    root_cert: Vec<u8>,
    icac_cert: Option<Vec<u8>>,
    noc_cert: Vec<u8>,
    compressed_fabric_id: CompressedFabricId,
    /// Cached by `compute_compressed_fabric_id`; `None` until that has run
    /// at least once since the root cert was last set. `generate_destination_id`
    /// omits the public-key section of its buffer when this is `None`,
    /// reproducing the original's documented compatibility quirk rather than
    /// eagerly re-extracting the key on every call.
    root_public_key: Option<Vec<u8>>,
}

impl FabricEntry {
    /// Builds a fresh, uninitialized entry bound to `index`. The index is
    /// stable for the entry's lifetime, including across `reset()`.
    pub fn new(index: FabricIndex) -> Self {
        Self {
            index,
            fabric_id: FabricId::UNDEFINED,
            node_id: NodeId::UNDEFINED,
            vendor_id: VendorId(0),
            label: String::new(),
            operational_keypair: None,
            root_cert: Vec::new(),
            icac_cert: None,
            noc_cert: Vec::new(),
            compressed_fabric_id: CompressedFabricId::UNDEFINED,
            root_public_key: None,
        }
    }

    pub fn index(&self) -> FabricIndex {
        self.index
    }

    pub fn fabric_id(&self) -> FabricId {
        self.fabric_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn vendor_id(&self) -> VendorId {
        self.vendor_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn compressed_fabric_id(&self) -> CompressedFabricId {
        self.compressed_fabric_id
    }

    pub fn operational_keypair(&self) -> Option<&FabricKeypair> {
        self.operational_keypair.as_ref()
    }

    /// `None` until `compute_compressed_fabric_id` has cached the root
    /// public key at least once since the root cert was last set.
    pub fn root_public_key(&self) -> Option<&[u8]> {
        self.root_public_key.as_deref()
    }

    /// Sets the fabric/node id pair extracted from the NOC. Used by the table
    /// both right after `verify_credentials` succeeds and when re-deriving
    /// identity on load from storage.
    pub fn set_identity(&mut self, fabric_id: FabricId, node_id: NodeId) {
        self.fabric_id = fabric_id;
        self.node_id = node_id;
    }

    /// An entry is initialized iff its node id falls in the operational
    /// range; everything else about an uninitialized slot is blank.
    pub fn is_initialized(&self) -> bool {
        self.node_id.is_operational()
    }

    pub fn set_vendor_id(&mut self, vendor_id: VendorId) {
        self.vendor_id = vendor_id;
    }

    pub fn set_label(&mut self, label: &str) -> Result<(), FabricError> {
        if label.len() > FABRIC_LABEL_MAX_LEN {
            return Err(FabricError::InvalidArgument(format!("label exceeds {FABRIC_LABEL_MAX_LEN} bytes")));
        }
        self.label = label.to_string();
        Ok(())
    }

    pub fn root_cert(&self) -> &[u8] {
        &self.root_cert
    }

    pub fn icac_cert(&self) -> Option<&[u8]> {
        self.icac_cert.as_deref()
    }

    pub fn noc_cert(&self) -> &[u8] {
        &self.noc_cert
    }

    /// Returns `IncorrectState` on an empty buffer, matching `FabricInfo::GetRootCert`.
    pub fn get_root_cert(&self) -> Result<&[u8], FabricError> {
        if self.root_cert.is_empty() {
            return Err(FabricError::IncorrectState);
        }
        Ok(&self.root_cert)
    }

    /// Never errors: an absent ICAC is the normal case, unlike an absent root/NOC.
    pub fn get_icac_cert(&self) -> Option<&[u8]> {
        self.icac_cert.as_deref()
    }

    /// Returns `IncorrectState` on an empty buffer, matching `FabricInfo::GetNOCCert`.
    pub fn get_noc(&self) -> Result<&[u8], FabricError> {
        if self.noc_cert.is_empty() {
            return Err(FabricError::IncorrectState);
        }
        Ok(&self.noc_cert)
    }

    pub fn set_root_cert(&mut self, cert: &[u8]) -> Result<(), FabricError> {
        if cert.len() > MAX_CERT_LEN {
            return Err(FabricError::InvalidArgument(format!("root cert exceeds MAX_CERT_LEN ({} bytes)", cert.len())));
        }
        self.root_cert = cert.to_vec();
        self.root_public_key = None;
        Ok(())
    }

    pub fn set_intermediate_cert(&mut self, cert: Option<&[u8]>) -> Result<(), FabricError> {
        if let Some(bytes) = cert {
            if bytes.len() > MAX_CERT_LEN {
                return Err(FabricError::InvalidArgument(format!("ICAC exceeds MAX_CERT_LEN ({} bytes)", bytes.len())));
            }
            self.icac_cert = Some(bytes.to_vec());
        } else {
            self.icac_cert = None;
        }
        Ok(())
    }

    pub fn set_noc(&mut self, cert: &[u8]) -> Result<(), FabricError> {
        if cert.len() > MAX_CERT_LEN {
            return Err(FabricError::InvalidArgument(format!("NOC exceeds MAX_CERT_LEN ({} bytes)", cert.len())));
        }
        self.noc_cert = cert.to_vec();
        Ok(())
    }

    /// Serializes then immediately deserializes `keypair` into a freshly
    /// owned copy, matching the original's defensive copy on assignment.
    /// Any previously held key material is dropped (and zeroized by its own
    /// `Drop` impl) in the process.
    pub fn set_operational_keypair(&mut self, keypair: &FabricKeypair) -> Result<(), FabricError> {
        let restored = match keypair {
            FabricKeypair::Software(_) => FabricKeypair::deserialize(&keypair.serialize()?)?,
            FabricKeypair::Hsm { slot_id } => FabricKeypair::Hsm { slot_id: *slot_id },
        };
        self.operational_keypair = Some(restored);
        Ok(())
    }

    /// Requires the root cert to be present. Extracts the root public key via
    /// `decoder` and derives the compressed fabric ID; idempotent (recomputes
    /// the same value on repeat calls as long as the root cert and fabric id
    /// are unchanged).
    pub fn compute_compressed_fabric_id(&mut self, decoder: &dyn CertificateDecoder) -> Result<CompressedFabricId, FabricError> {
        if self.root_cert.is_empty() {
            return Err(FabricError::IncorrectState);
        }
        let identity = decoder.decode(&self.root_cert)?;
        let compressed = fabric_crypto::compute_compressed_fabric_id(&identity.subject_public_key, self.fabric_id.0)?;
        self.root_public_key = Some(identity.subject_public_key);
        self.compressed_fabric_id = CompressedFabricId(compressed);
        info!(fabric_id = %self.fabric_id, compressed_fabric_id = %self.compressed_fabric_id, "computed compressed fabric id");
        Ok(self.compressed_fabric_id)
    }

    /// Verifies the certificate chain `{root (trust anchor), icac?, noc}` via
    /// `decoder`, then enforces the fabric-id cross-checks in spec.md §4.1.
    /// Returns the leaf's `(fabric_id, node_id, public_key)` on success. Does
    /// not mutate `self`; the caller commits the extracted ids afterwards.
    pub fn verify_credentials(
        &self,
        noc: &[u8],
        icac: Option<&[u8]>,
        validation_ctx: &ValidationContext,
        decoder: &dyn CertificateDecoder,
    ) -> Result<(FabricId, NodeId, Vec<u8>), FabricError> {
        let identity = decoder.verify_chain(&self.root_cert, icac, noc, validation_ctx)?;
        let fabric_id = identity.fabric_id.ok_or(FabricError::IncorrectState)?;
        let node_id = identity.node_id.ok_or(FabricError::IncorrectState)?;
        Ok((fabric_id, node_id, identity.subject_public_key))
    }

    /// Builds `initiator_random (32B) || root_public_key? (65B) || fabric_id
    /// (LE64) || dest_node_id (LE64)` and HMACs it with `ipk`. The root
    /// public key section is present only if `compute_compressed_fabric_id`
    /// has already cached it; this omission-on-missing-key behavior is a
    /// deliberately preserved compatibility quirk (see DESIGN.md).
    pub fn generate_destination_id(&self, ipk: &[u8], initiator_random: &[u8], dest_node_id: NodeId, out: &mut [u8; 32]) {
        debug!(fabric_id = %self.fabric_id, dest_node_id = %dest_node_id, "generating destination id");
        let root_pub = self.root_public_key.as_deref().unwrap_or(&[]);
        *out = fabric_crypto::generate_destination_id(ipk, initiator_random, root_pub, self.fabric_id.0, dest_node_id.0);
    }

    /// Regenerates the destination ID for each IPK in `ipk_list` and compares
    /// to `target` in constant time; `true` iff at least one matches.
    /// Requires the entry to be initialized (an uninitialized entry has no
    /// meaningful `node_id` to match against).
    pub fn match_destination_id(&self, target: &[u8], initiator_random: &[u8], ipk_list: &[&[u8]]) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let mut found = false;
        for ipk in ipk_list {
            let mut candidate = [0u8; 32];
            self.generate_destination_id(ipk, initiator_random, self.node_id, &mut candidate);
            found |= bool::from(candidate.ct_eq(target));
        }
        found
    }

    /// Zeroes key material, frees cert buffers, and clears the node id. The
    /// entry's `index` is left untouched: slots are addressed by position,
    /// only their contents become blank.
    pub fn reset(&mut self) {
        self.node_id = NodeId::UNDEFINED;
        self.fabric_id = FabricId::UNDEFINED;
        self.compressed_fabric_id = CompressedFabricId::UNDEFINED;
        self.vendor_id = VendorId(0);
        self.label.clear();
        self.operational_keypair = None;
        self.root_cert.clear();
        self.icac_cert = None;
        self.noc_cert.clear();
        self.root_public_key = None;
    }
}
