use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fabric_certs::MAX_CERT_LEN;
use fabric_crypto::{FabricKeypair, P256_SERIALIZED_KEYPAIR_LEN};
use fabric_ids::{FabricIndex, VendorId};

use crate::entry::{FABRIC_LABEL_MAX_LEN, FabricEntry};
use crate::error::FabricError;

/// `index (u8) + vendor_id (u16) + three cert lengths (u16 each) + serialized
/// keypair + three MAX_CERT_LEN cert buffers + a 33-byte label`. Integer
/// fields are little-endian on disk regardless of host byte order, matching
/// `StorableFabricInfo`.
pub const STORABLE_RECORD_LEN: usize =
    1 + 2 + 2 + 2 + 2 + P256_SERIALIZED_KEYPAIR_LEN + (MAX_CERT_LEN * 3) + (FABRIC_LABEL_MAX_LEN + 1);

/// Serializes `entry` into its fixed-layout on-disk record. The entry must
/// hold a software-backed operational keypair and a non-empty root cert;
/// persisting an HSM-backed key or an entry that was never provisioned is an
/// internal error, matching the original's assumption that only committed
/// fabrics are ever written to storage.
pub fn serialize(entry: &FabricEntry) -> Result<Vec<u8>, FabricError> {
    let keypair = entry.operational_keypair().ok_or(FabricError::IncorrectState)?;
    let serialized_keypair = match keypair {
        FabricKeypair::Software(_) => keypair.serialize()?,
        FabricKeypair::Hsm { .. } => {
            return Err(FabricError::Internal("cannot persist an HSM-backed keypair in the default storable layout".into()));
        }
    };

    if entry.root_cert().len() > MAX_CERT_LEN || entry.noc_cert().len() > MAX_CERT_LEN {
        return Err(FabricError::InvalidArgument("certificate exceeds MAX_CERT_LEN".into()));
    }
    if let Some(icac) = entry.icac_cert() {
        if icac.len() > MAX_CERT_LEN {
            return Err(FabricError::InvalidArgument("ICAC exceeds MAX_CERT_LEN".into()));
        }
    }

    let mut buf = Vec::with_capacity(STORABLE_RECORD_LEN);
    buf.write_u8(entry.index().get()).map_err(io_err)?;
    buf.write_u16::<LittleEndian>(entry.vendor_id().0).map_err(io_err)?;
    buf.write_u16::<LittleEndian>(entry.root_cert().len() as u16).map_err(io_err)?;
    buf.write_u16::<LittleEndian>(entry.icac_cert().map(|c| c.len()).unwrap_or(0) as u16).map_err(io_err)?;
    buf.write_u16::<LittleEndian>(entry.noc_cert().len() as u16).map_err(io_err)?;
    buf.extend_from_slice(&serialized_keypair);

    write_padded_cert(&mut buf, entry.root_cert());
    write_padded_cert(&mut buf, entry.icac_cert().unwrap_or(&[]));
    write_padded_cert(&mut buf, entry.noc_cert());

    let mut label_buf = [0u8; FABRIC_LABEL_MAX_LEN + 1];
    let label_bytes = entry.label().as_bytes();
    label_buf[..label_bytes.len()].copy_from_slice(label_bytes);
    buf.extend_from_slice(&label_buf);

    debug_assert_eq!(buf.len(), STORABLE_RECORD_LEN);
    Ok(buf)
}

fn write_padded_cert(buf: &mut Vec<u8>, cert: &[u8]) {
    let mut padded = vec![0u8; MAX_CERT_LEN];
    padded[..cert.len()].copy_from_slice(cert);
    buf.extend_from_slice(&padded);
}

fn io_err(e: std::io::Error) -> FabricError {
    FabricError::Internal(format!("failed writing storable record: {e}"))
}

/// Parses a storable record produced by [`serialize`]. `fabric_id` and
/// `node_id` are intentionally not part of the wire layout: the caller is
/// expected to re-derive them from the NOC (and recompute the compressed
/// fabric ID) immediately after a successful parse, exactly as the original
/// `LoadFromStorage` does.
pub fn deserialize(bytes: &[u8], expected_index: FabricIndex) -> Result<FabricEntry, FabricError> {
    if bytes.len() != STORABLE_RECORD_LEN {
        return Err(FabricError::Internal(format!(
            "storable record has the wrong length: expected {STORABLE_RECORD_LEN}, got {}",
            bytes.len()
        )));
    }

    let mut cursor = std::io::Cursor::new(bytes);
    let stored_index = cursor.read_u8().map_err(io_err)?;
    if stored_index != expected_index.get() {
        return Err(FabricError::IncorrectState);
    }

    let vendor_id = cursor.read_u16::<LittleEndian>().map_err(io_err)?;
    let root_len = cursor.read_u16::<LittleEndian>().map_err(io_err)? as usize;
    let icac_len = cursor.read_u16::<LittleEndian>().map_err(io_err)? as usize;
    let noc_len = cursor.read_u16::<LittleEndian>().map_err(io_err)? as usize;

    let mut keypair_buf = [0u8; P256_SERIALIZED_KEYPAIR_LEN];
    std::io::Read::read_exact(&mut cursor, &mut keypair_buf).map_err(io_err)?;

    let mut root_buf = vec![0u8; MAX_CERT_LEN];
    std::io::Read::read_exact(&mut cursor, &mut root_buf).map_err(io_err)?;
    let mut icac_buf = vec![0u8; MAX_CERT_LEN];
    std::io::Read::read_exact(&mut cursor, &mut icac_buf).map_err(io_err)?;
    let mut noc_buf = vec![0u8; MAX_CERT_LEN];
    std::io::Read::read_exact(&mut cursor, &mut noc_buf).map_err(io_err)?;

    let mut label_buf = [0u8; FABRIC_LABEL_MAX_LEN + 1];
    std::io::Read::read_exact(&mut cursor, &mut label_buf).map_err(io_err)?;
    let nul_pos = label_buf.iter().position(|&b| b == 0).unwrap_or(label_buf.len());
    let label = std::str::from_utf8(&label_buf[..nul_pos])
        .map_err(|_| FabricError::Internal("stored fabric label is not valid UTF-8".into()))?;

    if root_len > MAX_CERT_LEN || icac_len > MAX_CERT_LEN || noc_len > MAX_CERT_LEN {
        return Err(FabricError::Internal("stored certificate length exceeds MAX_CERT_LEN".into()));
    }

    let mut entry = FabricEntry::new(expected_index);
    entry.set_vendor_id(VendorId(vendor_id));
    entry.set_label(label)?;
    entry.set_root_cert(&root_buf[..root_len])?;
    entry.set_intermediate_cert(if icac_len == 0 { None } else { Some(&icac_buf[..icac_len]) })?;
    entry.set_noc(&noc_buf[..noc_len])?;
    entry.set_operational_keypair(&FabricKeypair::deserialize(&keypair_buf)?)?;

    Ok(entry)
}
