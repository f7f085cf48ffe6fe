//! End-to-end scenarios against a real [`FabricTable`], backed by an
//! in-memory store and a fake certificate decoder that encodes its
//! fabric/node ids directly in the "certificate" bytes rather than parsing
//! ASN.1. `fabric-certs`'s own unit tests already exercise real DER parsing;
//! what matters here is the table's slot allocation, persistence, and
//! credential cross-check wiring.

use device_storage::{FileStorage, InMemoryStorage};
use fabric_certs::{CertError, CertIdentity, CertificateDecoder, ValidationContext};
use fabric_crypto::{FabricKeypair, SoftwareKeypair};
use fabric_ids::{FabricId, FabricIndex, NodeId, VendorId};
use fabric_table::{FabricEntry, FabricError, FabricTable};
use rand::rngs::OsRng;

/// A fake cert is `tag (1 byte) || fabric_id (LE64) || node_id (LE64) || pubkey (rest)`.
/// `node_id` is `0` for root/ICAC certs, which have no operational node id.
fn make_cert(tag: u8, fabric_id: u64, node_id: u64, pubkey: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&fabric_id.to_le_bytes());
    out.extend_from_slice(&node_id.to_le_bytes());
    out.extend_from_slice(pubkey);
    out
}

struct FakeDecoder;

impl CertificateDecoder for FakeDecoder {
    fn decode(&self, der: &[u8]) -> Result<CertIdentity, CertError> {
        if der.len() < 17 {
            return Err(CertError::ParseFailure("cert too short".into()));
        }
        let fabric_id = u64::from_le_bytes(der[1..9].try_into().unwrap());
        let node_id = u64::from_le_bytes(der[9..17].try_into().unwrap());
        Ok(CertIdentity {
            subject_public_key: der[17..].to_vec(),
            subject_key_id: None,
            fabric_id: Some(FabricId(fabric_id)),
            node_id: if node_id == 0 { None } else { Some(NodeId(node_id)) },
        })
    }

    fn verify_chain(&self, root: &[u8], icac: Option<&[u8]>, noc: &[u8], _ctx: &ValidationContext) -> Result<CertIdentity, CertError> {
        let root_id = self.decode(root)?;
        let noc_id = self.decode(noc)?;
        let noc_fabric_id = noc_id.fabric_id.ok_or(CertError::MissingOperationalIds)?;
        if noc_id.node_id.is_none() {
            return Err(CertError::MissingOperationalIds);
        }

        if let Some(icac) = icac {
            let icac_id = self.decode(icac)?;
            if icac_id.fabric_id != Some(noc_fabric_id) {
                return Err(CertError::FabricMismatchOnIca);
            }
        }

        if root_id.fabric_id != Some(noc_fabric_id) {
            return Err(CertError::WrongCertDn);
        }

        Ok(noc_id)
    }
}

fn new_table() -> FabricTable {
    FabricTable::new(Box::new(InMemoryStorage::new()), Box::new(FakeDecoder))
}

fn candidate_entry(fabric_id: u64, node_id: u64, icac: Option<u64>) -> FabricEntry {
    let mut entry = FabricEntry::new(FabricIndex::new(1).unwrap());
    let pubkey = vec![0xAB; 65];
    entry.set_root_cert(&make_cert(b'R', fabric_id, 0, &pubkey)).unwrap();
    entry
        .set_intermediate_cert(icac.map(|icac_fabric_id| make_cert(b'I', icac_fabric_id, 0, &pubkey)).as_deref())
        .unwrap();
    entry.set_noc(&make_cert(b'N', fabric_id, node_id, &pubkey)).unwrap();
    entry.set_vendor_id(VendorId(0xFFF1));
    entry.set_label("home").unwrap();
    let keypair = FabricKeypair::Software(SoftwareKeypair::generate(&mut OsRng));
    entry.set_operational_keypair(&keypair).unwrap();
    entry
}

/// S1: a fabric added with a consistent root/ICAC/NOC chain is assigned a
/// slot, persisted, and discoverable by index and by iteration; deleting it
/// frees the storage entry and drops it from the in-memory view.
#[test]
fn add_new_fabric_round_trips_through_storage() {
    let mut table = new_table();
    table.init();

    let candidate = candidate_entry(0x1111_2222_3333_4444, 0x0000_0000_0001_B669, Some(0x1111_2222_3333_4444));
    let ctx = ValidationContext::default();

    let index = table.add_new_fabric(&candidate, &ctx).unwrap();
    assert_eq!(index, FabricIndex::new(1).unwrap());
    assert_eq!(table.fabric_count(), 1);

    {
        let stored = table.find_with_index(index).unwrap();
        assert_eq!(stored.fabric_id(), FabricId(0x1111_2222_3333_4444));
        assert_eq!(stored.node_id(), NodeId(0x0000_0000_0001_B669));
        assert_eq!(stored.label(), "home");
    }
    assert_eq!(table.iter().count(), 1);

    table.delete(index).unwrap();
    assert_eq!(table.fabric_count(), 0);
    assert!(table.find_with_index(index).is_none());
}

/// S2: an ICAC whose fabric id disagrees with the NOC's is rejected before
/// any slot is committed, leaving the table empty and free to retry.
#[test]
fn add_new_fabric_rejects_icac_fabric_mismatch() {
    let mut table = new_table();
    table.init();

    let candidate = candidate_entry(0x1111_2222_3333_4444, 0x0000_0000_0001_B669, Some(0x9999_8888_7777_6666));
    let ctx = ValidationContext::default();

    let err = table.add_new_fabric(&candidate, &ctx).unwrap_err();
    assert!(matches!(err, FabricError::FabricMismatchOnIca));
    assert_eq!(table.fabric_count(), 0);

    // The rejected attempt must not have consumed the slot: a valid retry still lands on index 1.
    let retry = candidate_entry(0x1111_2222_3333_4444, 0x0000_0000_0001_B669, Some(0x1111_2222_3333_4444));
    let index = table.add_new_fabric(&retry, &ctx).unwrap();
    assert_eq!(index, FabricIndex::new(1).unwrap());
}

/// S1 (full): a fabric added on one `FabricTable` survives a process
/// restart. A second table constructed against the same on-disk store and
/// re-initialized finds the same entry at the same index, with the same
/// compressed fabric id (re-derived from the persisted NOC, not itself
/// persisted — see `storable::deserialize`).
#[test]
fn add_new_fabric_survives_reopening_the_table_on_the_same_store() {
    let dir = tempfile::tempdir().unwrap();

    let compressed_id = {
        let mut table = FabricTable::new(Box::new(FileStorage::new(dir.path()).unwrap()), Box::new(FakeDecoder));
        table.init();
        let candidate = candidate_entry(0x0000_0000_0000_0001, 0x0000_0000_0001_B669, None);
        let index = table.add_new_fabric(&candidate, &ValidationContext::default()).unwrap();
        assert_eq!(index, FabricIndex::new(1).unwrap());
        table.find_with_index(index).unwrap().compressed_fabric_id()
    };

    let mut reopened = FabricTable::new(Box::new(FileStorage::new(dir.path()).unwrap()), Box::new(FakeDecoder));
    reopened.init();
    assert_eq!(reopened.fabric_count(), 1);

    let restored = reopened.find_with_index(FabricIndex::new(1).unwrap()).unwrap();
    assert_eq!(restored.fabric_id(), FabricId(0x0000_0000_0000_0001));
    assert_eq!(restored.node_id(), NodeId(0x0000_0000_0001_B669));
    assert_eq!(restored.compressed_fabric_id(), compressed_id);
}

#[test]
fn delete_of_unprovisioned_slot_is_not_found() {
    let mut table = new_table();
    let index = FabricIndex::new(5).unwrap();
    assert!(matches!(table.delete(index), Err(FabricError::NotFound)));
}

/// A slot freed by `delete` must be reusable by a later `add_new_fabric`,
/// not permanently retired just because it was once resident in memory.
#[test]
fn deleted_slot_is_reused_by_a_later_add() {
    let mut table = new_table();
    table.init();

    let first = candidate_entry(0x1111_2222_3333_4444, 0x0000_0000_0001_B669, None);
    let first_index = table.add_new_fabric(&first, &ValidationContext::default()).unwrap();
    assert_eq!(first_index, FabricIndex::new(1).unwrap());

    table.delete(first_index).unwrap();
    assert_eq!(table.fabric_count(), 0);

    let second = candidate_entry(0x5555_6666_7777_8888, 0x0000_0000_0002_AAAA, None);
    let second_index = table.add_new_fabric(&second, &ValidationContext::default()).unwrap();
    assert_eq!(second_index, FabricIndex::new(1).unwrap());
    assert_eq!(table.fabric_count(), 1);
    assert_eq!(table.find_with_index(second_index).unwrap().fabric_id(), FabricId(0x5555_6666_7777_8888));
}
