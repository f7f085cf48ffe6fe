use std::sync::Arc;

use device_storage::PersistentStorage;
use fabric_certs::{CertificateDecoder, ValidationContext};
use fabric_ids::{CompressedFabricId, FabricId, FabricIndex, MAX_FABRICS, MIN_VALID_FABRIC_INDEX};
use tracing::{debug, error, warn};

use crate::entry::FabricEntry;
use crate::error::FabricError;
use crate::storable;

/// Observer notified of persistence events on a [`FabricTable`]. Replaces the
/// original's intrusive linked list of `FabricTableDelegate *` with an owned
/// `Vec` of shared handles; duplicate registration is detected by `Arc`
/// identity rather than pointer equality.
pub trait FabricTableDelegate: Send + Sync {
    fn on_persisted(&self, entry: &FabricEntry);
    fn on_retrieved(&self, entry: &FabricEntry);
    fn on_deleted(&self, compressed_id: CompressedFabricId, index: FabricIndex);
}

fn storage_key(index: FabricIndex) -> String {
    format!("Fabric{}", index.to_lowercase_hex())
}

/// Fixed-capacity registry of fabrics that have provisioned this device. A
/// slot per valid `FabricIndex` is allocated once at construction and never
/// resized; entries are loaded from storage lazily, on first access, rather
/// than strictly at `init()` time (though `init()` does force every slot to
/// be attempted once).
pub struct FabricTable {
    entries: Box<[Option<FabricEntry>]>,
    next_available_index: u8,
    fabric_count: usize,
    storage: Box<dyn PersistentStorage>,
    decoder: Box<dyn CertificateDecoder>,
    delegates: Vec<Arc<dyn FabricTableDelegate>>,
}

impl FabricTable {
    pub fn new(storage: Box<dyn PersistentStorage>, decoder: Box<dyn CertificateDecoder>) -> Self {
        Self {
            entries: (0..=MAX_FABRICS as usize).map(|_| None).collect(),
            next_available_index: MIN_VALID_FABRIC_INDEX,
            storage,
            decoder,
            fabric_count: 0,
            delegates: Vec::new(),
        }
    }

    pub fn fabric_count(&self) -> usize {
        self.fabric_count
    }

    /// Attempts to load every valid slot from storage. Idempotent: a slot
    /// already resident in memory is left untouched. A slot with no matching
    /// storage entry is simply skipped, not an error.
    pub fn init(&mut self) {
        for raw in MIN_VALID_FABRIC_INDEX..=MAX_FABRICS {
            let index = FabricIndex::new(raw).expect("raw index is within [MIN_VALID_FABRIC_INDEX, MAX_FABRICS]");
            self.ensure_loaded(index);
        }
    }

    pub fn add_delegate(&mut self, delegate: Arc<dyn FabricTableDelegate>) {
        if self.delegates.iter().any(|existing| Arc::ptr_eq(existing, &delegate)) {
            return;
        }
        self.delegates.push(delegate);
    }

    fn slot(&self, index: FabricIndex) -> &Option<FabricEntry> {
        &self.entries[index.get() as usize]
    }

    /// Loads `index` from storage into memory if it isn't resident yet.
    /// Returns `true` if an entry is resident in memory after the call
    /// (whether it was already there or was just loaded). A resident entry
    /// may still be uninitialized (e.g. reset by a prior `delete()`); callers
    /// that need occupancy, not mere residency, must check
    /// `entry.is_initialized()` themselves.
    fn ensure_loaded(&mut self, index: FabricIndex) -> bool {
        if self.entries[index.get() as usize].is_some() {
            return true;
        }
        let key = storage_key(index);
        let bytes = match self.storage.get(&key) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match storable::deserialize(&bytes, index) {
            Ok(mut entry) => {
                if let Err(err) = self.recompute_identity_on_load(&mut entry) {
                    warn!(%index, error = %err, "stored fabric failed re-derivation of node/fabric id, treating as absent");
                    return false;
                }
                self.entries[index.get() as usize] = Some(entry);
                for delegate in &self.delegates {
                    delegate.on_retrieved(self.entries[index.get() as usize].as_ref().unwrap());
                }
                true
            }
            Err(err) => {
                warn!(%index, error = %err, "stored fabric record was malformed, treating as absent");
                false
            }
        }
    }

    /// Re-derives `fabric_id`/`node_id` from the NOC and recomputes the
    /// compressed fabric ID, matching `LoadFromStorage`'s use of
    /// `ExtractNodeIdFabricIdFromOpCert` plus `ComputeCompressedFabricId`
    /// instead of persisting those derived fields directly.
    fn recompute_identity_on_load(&self, entry: &mut FabricEntry) -> Result<(), FabricError> {
        let identity = self.decoder.decode(entry.noc_cert())?;
        let fabric_id = identity.fabric_id.ok_or(FabricError::IncorrectState)?;
        let node_id = identity.node_id.ok_or(FabricError::IncorrectState)?;
        entry.set_identity(fabric_id, node_id);
        entry.compute_compressed_fabric_id(self.decoder.as_ref())?;
        Ok(())
    }

    pub fn find_with_index(&mut self, index: FabricIndex) -> Option<&FabricEntry> {
        self.ensure_loaded(index);
        self.slot(index).as_ref().filter(|e| e.is_initialized())
    }

    /// Linear scan for the first initialized entry whose `(root public key,
    /// fabric id)` match.
    pub fn find(&mut self, root_pubkey: &[u8], fabric_id: FabricId) -> Option<&FabricEntry> {
        let mut found = None;
        for raw in MIN_VALID_FABRIC_INDEX..=MAX_FABRICS {
            let index = FabricIndex::new(raw).unwrap();
            self.ensure_loaded(index);
            if let Some(entry) = self.slot(index).as_ref() {
                if entry.is_initialized() && entry.fabric_id() == fabric_id && entry.root_public_key() == Some(root_pubkey) {
                    found = Some(index);
                    break;
                }
            }
        }
        found.and_then(move |index| self.slot(index).as_ref())
    }

    pub fn find_with_compressed_id(&mut self, compressed_id: CompressedFabricId) -> Option<&FabricEntry> {
        let mut found = None;
        for raw in MIN_VALID_FABRIC_INDEX..=MAX_FABRICS {
            let index = FabricIndex::new(raw).unwrap();
            self.ensure_loaded(index);
            if let Some(entry) = self.slot(index).as_ref() {
                if entry.is_initialized() && entry.compressed_fabric_id() == compressed_id {
                    found = Some(index);
                    break;
                }
            }
        }
        found.and_then(move |index| self.slot(index).as_ref())
    }

    /// Scans initialized entries for one whose destination ID matches
    /// `target` under any IPK in `ipk_list`.
    pub fn find_destination_id_candidate(&mut self, target: &[u8], initiator_random: &[u8], ipk_list: &[&[u8]]) -> Option<FabricIndex> {
        for raw in MIN_VALID_FABRIC_INDEX..=MAX_FABRICS {
            let index = FabricIndex::new(raw).unwrap();
            self.ensure_loaded(index);
            if let Some(entry) = self.slot(index).as_ref() {
                if entry.match_destination_id(target, initiator_random, ipk_list) {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Circular two-pass scan for the first uninitialized slot, starting at
    /// `next_available_index` and wrapping. The second pass's upper bound is
    /// exclusive of `MAX_FABRICS`, an original off-by-one retained for
    /// interoperable insertion-order behavior (see DESIGN.md).
    fn find_free_slot(&mut self) -> Option<FabricIndex> {
        for raw in self.next_available_index..=MAX_FABRICS {
            let index = FabricIndex::new(raw).unwrap();
            self.ensure_loaded(index);
            if !self.slot(index).as_ref().is_some_and(|e| e.is_initialized()) {
                return Some(index);
            }
        }
        for raw in MIN_VALID_FABRIC_INDEX..MAX_FABRICS {
            let index = FabricIndex::new(raw).unwrap();
            self.ensure_loaded(index);
            if !self.slot(index).as_ref().is_some_and(|e| e.is_initialized()) {
                return Some(index);
            }
        }
        None
    }

    /// Copies `source`'s certs, keypair, vendor id, and label into a free
    /// slot, verifies the NOC/ICAC chain under `validation_ctx`, and on
    /// success persists the new entry. Verification failures are surfaced
    /// unchanged and do not consume a slot.
    pub fn add_new_fabric(&mut self, source: &FabricEntry, validation_ctx: &ValidationContext) -> Result<FabricIndex, FabricError> {
        let index = self.find_free_slot().ok_or(FabricError::NoMemory)?;

        let mut candidate = FabricEntry::new(index);
        if let Some(keypair) = source.operational_keypair() {
            candidate.set_operational_keypair(keypair)?;
        }
        candidate.set_root_cert(source.root_cert())?;
        candidate.set_intermediate_cert(source.icac_cert())?;
        candidate.set_noc(source.noc_cert())?;
        candidate.set_vendor_id(source.vendor_id());
        candidate.set_label(source.label())?;

        debug!(%index, "verifying credentials for new fabric");
        let (fabric_id, node_id, _pubkey) =
            candidate.verify_credentials(candidate.noc_cert(), candidate.icac_cert(), validation_ctx, self.decoder.as_ref())?;
        candidate.set_identity(fabric_id, node_id);
        candidate.compute_compressed_fabric_id(self.decoder.as_ref())?;

        self.entries[index.get() as usize] = Some(candidate);
        self.store(index)?;
        self.fabric_count += 1;
        self.next_available_index = ((index.get() as u16 + 1) % 256) as u8;
        debug!(%index, fabric_id = %fabric_id, node_id = %node_id, "added new fabric");
        Ok(index)
    }

    /// Serializes the entry at `index` and writes it to storage, notifying
    /// delegates on success.
    pub fn store(&mut self, index: FabricIndex) -> Result<(), FabricError> {
        let entry = self.slot(index).as_ref().ok_or(FabricError::NotFound)?;
        let bytes = storable::serialize(entry)?;
        self.storage.set(&storage_key(index), &bytes)?;
        for delegate in &self.delegates {
            delegate.on_persisted(self.slot(index).as_ref().unwrap());
        }
        Ok(())
    }

    /// Deletes the storage entry for `index` unconditionally, then resets the
    /// in-memory slot if it was initialized. Returns `NotFound` only if the
    /// slot was already uninitialized (the storage delete itself is
    /// best-effort in that case, matching the original).
    pub fn delete(&mut self, index: FabricIndex) -> Result<(), FabricError> {
        self.ensure_loaded(index);
        let was_initialized = self.slot(index).as_ref().map(|e| e.is_initialized()).unwrap_or(false);
        let compressed_id = if was_initialized {
            self.slot(index).as_ref().unwrap().compressed_fabric_id()
        } else {
            CompressedFabricId::UNDEFINED
        };

        let storage_result = self.storage.delete(&storage_key(index));
        if !was_initialized {
            return Err(FabricError::NotFound);
        }
        storage_result?;

        if let Some(entry) = self.entries[index.get() as usize].as_mut() {
            entry.reset();
        }
        if self.fabric_count == 0 {
            error!(%index, "attempted to delete a fabric but fabric count is already zero");
        } else {
            self.fabric_count -= 1;
        }

        for delegate in &self.delegates {
            delegate.on_deleted(compressed_id, index);
        }
        Ok(())
    }

    /// Deletes every valid index; per-index failures (an already-empty slot)
    /// are swallowed, matching `DeleteAllFabrics`'s "never fails" contract.
    pub fn delete_all(&mut self) {
        for raw in MIN_VALID_FABRIC_INDEX..=MAX_FABRICS {
            let index = FabricIndex::new(raw).unwrap();
            let _ = self.delete(index);
        }
    }

    /// Iterates initialized entries in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = &FabricEntry> {
        self.entries.iter().filter_map(|slot| slot.as_ref()).filter(|entry| entry.is_initialized())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use device_storage::InMemoryStorage;
    use fabric_certs::X509CertificateDecoder;

    use super::*;

    fn new_table() -> FabricTable {
        FabricTable::new(Box::new(InMemoryStorage::new()), Box::new(X509CertificateDecoder::new()))
    }

    #[derive(Default)]
    struct RecordingDelegate {
        persisted: Mutex<Vec<FabricIndex>>,
        deleted: Mutex<Vec<(CompressedFabricId, FabricIndex)>>,
    }

    impl FabricTableDelegate for RecordingDelegate {
        fn on_persisted(&self, entry: &FabricEntry) {
            self.persisted.lock().unwrap().push(entry.index());
        }
        fn on_retrieved(&self, _entry: &FabricEntry) {}
        fn on_deleted(&self, compressed_id: CompressedFabricId, index: FabricIndex) {
            self.deleted.lock().unwrap().push((compressed_id, index));
        }
    }

    #[test]
    fn new_table_has_no_initialized_entries() {
        let mut table = new_table();
        table.init();
        assert_eq!(table.fabric_count(), 0);
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn delete_missing_slot_returns_not_found() {
        let mut table = new_table();
        let index = FabricIndex::new(1).unwrap();
        assert!(matches!(table.delete(index), Err(FabricError::NotFound)));
    }

    #[test]
    fn add_delegate_deduplicates_by_identity() {
        let mut table = new_table();
        let delegate: Arc<dyn FabricTableDelegate> = Arc::new(RecordingDelegate::default());
        table.add_delegate(delegate.clone());
        table.add_delegate(delegate.clone());
        assert_eq!(table.delegates.len(), 1);
    }
}
