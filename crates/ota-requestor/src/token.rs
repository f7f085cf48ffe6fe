use fabric_ids::NodeId;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Maximum length of an update token the protocol will carry, matching
/// `kMaxUpdateTokenLen`.
pub const MAX_UPDATE_TOKEN_LEN: usize = 32;

/// Generates an update token per spec.md §4.4: `SHA-256(operational_node_id
/// (BE u64) || random32)`. Used when a provider's `QueryImageResponse` omits
/// one, mirroring `GenerateUpdateToken`.
pub fn generate_update_token(node_id: NodeId, rng: &mut impl RngCore) -> [u8; MAX_UPDATE_TOKEN_LEN] {
    let mut random32 = [0u8; 32];
    rng.fill_bytes(&mut random32);

    let mut hasher = Sha256::new();
    hasher.update(node_id.0.to_be_bytes());
    hasher.update(random32);
    hasher.finalize().into()
}
