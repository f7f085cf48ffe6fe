//! Strongly typed identifiers shared by the fabric table and the OTA
//! requestor. Mirrors the newtype-per-identifier convention used across the
//! rest of the identifier crates in this codebase: small `Copy` wrappers
//! with explicit `From`/`Display` rather than passing bare integers around.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel fabric index meaning "no fabric" / "undefined".
pub const UNDEFINED_FABRIC_INDEX: u8 = 0;
/// Smallest fabric index that can ever be assigned to a real fabric.
pub const MIN_VALID_FABRIC_INDEX: u8 = 1;
/// Largest number of fabrics a table may hold. Kept at or below `u8::MAX - 1`
/// so that `UNDEFINED_FABRIC_INDEX` and the wraparound arithmetic in
/// `add_new_fabric` never collide with a real index.
pub const MAX_FABRICS: u8 = 254;

pub const UNDEFINED_FABRIC_ID: u64 = 0;
pub const UNDEFINED_NODE_ID: u64 = 0;
pub const UNDEFINED_COMPRESSED_FABRIC_ID: u64 = 0;

/// Node IDs with all top 32 bits set are reserved (group IDs, CASE
/// Authenticated Tags, and other non-operational uses) and never denote an
/// operational node.
const RESERVED_NODE_ID_PREFIX_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Fixed-capacity small positive integer identifying a slot in the fabric
/// table. `0` is the sentinel "undefined" value; valid indices live in
/// `[MIN_VALID_FABRIC_INDEX, MAX_FABRICS]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FabricIndex(u8);

impl FabricIndex {
    pub const UNDEFINED: FabricIndex = FabricIndex(UNDEFINED_FABRIC_INDEX);

    /// Builds a `FabricIndex`, returning `None` if `value` is `0` or exceeds
    /// `MAX_FABRICS`.
    pub fn new(value: u8) -> Option<Self> {
        if value >= MIN_VALID_FABRIC_INDEX && value <= MAX_FABRICS {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn is_undefined(self) -> bool {
        self.0 == UNDEFINED_FABRIC_INDEX
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Lowercase hex rendering used for the KV storage key, e.g. `Fabric1`
    /// and `Fabrica` — matches the original `"%s%x"` format string
    /// (`FabricInfo::GenerateKey`), not the uppercase variant sometimes
    /// quoted in documentation.
    pub fn to_lowercase_hex(self) -> String {
        format!("{:x}", self.0)
    }
}

impl Default for FabricIndex {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<FabricIndex> for u8 {
    fn from(value: FabricIndex) -> Self {
        value.0
    }
}

/// 64-bit administrator-chosen fabric identifier. Unique only in
/// combination with the fabric's root public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FabricId(pub u64);

impl FabricId {
    pub const UNDEFINED: FabricId = FabricId(UNDEFINED_FABRIC_ID);

    pub fn is_undefined(self) -> bool {
        self.0 == UNDEFINED_FABRIC_ID
    }
}

impl fmt::Display for FabricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for FabricId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// 64-bit per-fabric node identifier. Only a sub-range denotes an
/// operational node; the rest is reserved for group IDs, CASE
/// Authenticated Tags, and other non-operational uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const UNDEFINED: NodeId = NodeId(UNDEFINED_NODE_ID);

    /// True iff this ID falls in the documented operational sub-range: not
    /// undefined, and not in the reserved top block.
    pub fn is_operational(self) -> bool {
        self.0 != UNDEFINED_NODE_ID && (self.0 & RESERVED_NODE_ID_PREFIX_MASK) != RESERVED_NODE_ID_PREFIX_MASK
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// 16-bit vendor identifier, `0` meaning "not specified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct VendorId(pub u16);

impl fmt::Display for VendorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// 64-bit value derived deterministically from `(root public key, fabric
/// id)`. Cached on the fabric entry once the root cert is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CompressedFabricId(pub u64);

impl CompressedFabricId {
    pub const UNDEFINED: CompressedFabricId = CompressedFabricId(UNDEFINED_COMPRESSED_FABRIC_ID);

    pub fn is_undefined(self) -> bool {
        self.0 == UNDEFINED_COMPRESSED_FABRIC_ID
    }
}

impl fmt::Display for CompressedFabricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for CompressedFabricId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A node's identity across the whole operational ecosystem:
/// `(compressed fabric id, node id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub compressed_fabric_id: CompressedFabricId,
    pub node_id: NodeId,
}

impl PeerId {
    pub fn new(compressed_fabric_id: CompressedFabricId, node_id: NodeId) -> Self {
        Self { compressed_fabric_id, node_id }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressed_fabric_id, self.node_id)
    }
}
