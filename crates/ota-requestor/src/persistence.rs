use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use device_storage::PersistentStorage;
use fabric_ids::{FabricIndex, NodeId};
use tracing::warn;

use crate::provider::{DefaultProviderList, ProviderLocation};
use crate::token::MAX_UPDATE_TOKEN_LEN;

/// Stable KV key prefixes, preserved byte-for-byte per spec.md §4.5/§9.
pub const KEY_DEFAULT_PROVIDERS: &str = "O/dflt";
pub const KEY_CURRENT_PROVIDER: &str = "O/cur";
pub const KEY_UPDATE_TOKEN: &str = "O/tok";

/// `fabric_index (u8) || node_id (LE64) || endpoint (LE16)`.
const PROVIDER_RECORD_LEN: usize = 1 + 8 + 2;

/// The current-provider record additionally carries the in-flight target
/// version, since spec.md §4.5 names only three KV keys and `target_version`
/// has nowhere else to live across a reboot.
const CURRENT_PROVIDER_RECORD_LEN: usize = PROVIDER_RECORD_LEN + 4;

fn encode_provider(loc: &ProviderLocation, buf: &mut Vec<u8>) {
    buf.write_u8(loc.fabric_index.get()).expect("write to Vec never fails");
    buf.write_u64::<LittleEndian>(loc.node_id.0).expect("write to Vec never fails");
    buf.write_u16::<LittleEndian>(loc.endpoint).expect("write to Vec never fails");
}

fn decode_provider(bytes: &[u8]) -> Option<ProviderLocation> {
    if bytes.len() < PROVIDER_RECORD_LEN {
        return None;
    }
    let mut cursor = std::io::Cursor::new(bytes);
    let fabric_index = cursor.read_u8().ok()?;
    let node_id = cursor.read_u64::<LittleEndian>().ok()?;
    let endpoint = cursor.read_u16::<LittleEndian>().ok()?;
    Some(ProviderLocation { fabric_index: FabricIndex::new(fabric_index)?, node_id: NodeId(node_id), endpoint })
}

/// All load operations here are best-effort per spec.md §4.5: a missing key
/// is not an error, and a malformed value is logged and treated as absent.
pub fn load_default_providers(storage: &dyn PersistentStorage) -> DefaultProviderList {
    let bytes = match storage.get(KEY_DEFAULT_PROVIDERS) {
        Ok(bytes) => bytes,
        Err(_) => return DefaultProviderList::new(),
    };
    if bytes.len() % PROVIDER_RECORD_LEN != 0 {
        warn!(len = bytes.len(), "default OTA provider list has an unaligned length, treating as empty");
        return DefaultProviderList::new();
    }
    let entries = bytes
        .chunks_exact(PROVIDER_RECORD_LEN)
        .filter_map(decode_provider)
        .collect::<Vec<_>>();
    DefaultProviderList::from_entries(entries)
}

pub fn save_default_providers(storage: &mut dyn PersistentStorage, list: &DefaultProviderList) -> Result<(), device_storage::StorageError> {
    let mut buf = Vec::new();
    for entry in list.iter() {
        encode_provider(entry, &mut buf);
    }
    storage.set(KEY_DEFAULT_PROVIDERS, &buf)
}

pub fn load_current_provider(storage: &dyn PersistentStorage) -> Option<(ProviderLocation, u32)> {
    let bytes = storage.get(KEY_CURRENT_PROVIDER).ok()?;
    if bytes.len() != CURRENT_PROVIDER_RECORD_LEN {
        warn!(len = bytes.len(), "current OTA provider record has the wrong length, treating as absent");
        return None;
    }
    let provider = decode_provider(&bytes[..PROVIDER_RECORD_LEN])?;
    let target_version = u32::from_le_bytes(bytes[PROVIDER_RECORD_LEN..].try_into().ok()?);
    Some((provider, target_version))
}

pub fn save_current_provider(
    storage: &mut dyn PersistentStorage,
    provider: &ProviderLocation,
    target_version: u32,
) -> Result<(), device_storage::StorageError> {
    let mut buf = Vec::with_capacity(CURRENT_PROVIDER_RECORD_LEN);
    encode_provider(provider, &mut buf);
    buf.extend_from_slice(&target_version.to_le_bytes());
    storage.set(KEY_CURRENT_PROVIDER, &buf)
}

pub fn clear_current_provider(storage: &mut dyn PersistentStorage) {
    let _ = storage.delete(KEY_CURRENT_PROVIDER);
}

pub fn load_update_token(storage: &dyn PersistentStorage) -> Option<Vec<u8>> {
    let bytes = storage.get(KEY_UPDATE_TOKEN).ok()?;
    if bytes.is_empty() || bytes.len() > MAX_UPDATE_TOKEN_LEN {
        warn!(len = bytes.len(), "stored update token has an invalid length, treating as absent");
        return None;
    }
    Some(bytes)
}

pub fn save_update_token(storage: &mut dyn PersistentStorage, token: &[u8]) -> Result<(), device_storage::StorageError> {
    storage.set(KEY_UPDATE_TOKEN, token)
}

pub fn clear_update_token(storage: &mut dyn PersistentStorage) {
    let _ = storage.delete(KEY_UPDATE_TOKEN);
}

#[cfg(test)]
mod tests {
    use device_storage::InMemoryStorage;

    use super::*;

    #[test]
    fn default_provider_list_round_trips() {
        let mut storage = InMemoryStorage::new();
        let mut list = DefaultProviderList::new();
        list.add(ProviderLocation { fabric_index: FabricIndex::new(1).unwrap(), node_id: NodeId(0xAAAA), endpoint: 0 });
        list.add(ProviderLocation { fabric_index: FabricIndex::new(2).unwrap(), node_id: NodeId(0xBBBB), endpoint: 1 });

        save_default_providers(&mut storage, &list).unwrap();
        let reloaded = load_default_providers(&storage);
        assert_eq!(reloaded.iter().count(), 2);
        assert_eq!(reloaded.find_for_fabric(FabricIndex::new(2).unwrap()).unwrap().node_id, NodeId(0xBBBB));
    }

    #[test]
    fn missing_keys_load_as_absent_not_error() {
        let storage = InMemoryStorage::new();
        assert!(load_default_providers(&storage).is_empty());
        assert!(load_current_provider(&storage).is_none());
        assert!(load_update_token(&storage).is_none());
    }

    #[test]
    fn current_provider_round_trips_with_target_version() {
        let mut storage = InMemoryStorage::new();
        let provider = ProviderLocation { fabric_index: FabricIndex::new(3).unwrap(), node_id: NodeId(0xCCCC), endpoint: 2 };
        save_current_provider(&mut storage, &provider, 42).unwrap();
        let (reloaded, version) = load_current_provider(&storage).unwrap();
        assert_eq!(reloaded, provider);
        assert_eq!(version, 42);
    }
}
