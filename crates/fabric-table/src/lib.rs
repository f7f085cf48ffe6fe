//! The on-device registry of commissioned fabrics: per-fabric operational
//! credentials (root/ICAC/NOC certs, operational keypair), persistence to a
//! [`device_storage::PersistentStorage`] backend, and the CASE destination ID
//! engine used to select which fabric an incoming session belongs to.

mod entry;
mod error;
mod storable;
mod table;

pub use entry::{FABRIC_LABEL_MAX_LEN, FabricEntry};
pub use error::FabricError;
pub use storable::STORABLE_RECORD_LEN;
pub use table::{FabricTable, FabricTableDelegate};
