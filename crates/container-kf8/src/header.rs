//! MOBI/KF8 metadata header sniffing (spec.md 4.10).
//!
//! `open()` only ever needs three facts out of a MOBI file before handing
//! it to the exploder worker: whether it's actually Topaz wearing a MOBI
//! extension, whether it carries DRM, and whether it contains a KF8
//! section at all (and if so, whether that section is the whole file or
//! shares the PDB with an older Mobi6 rendition -- a "joint" file). All
//! three live in the PalmDOC/MOBI header at the front of the first PDB
//! record, ahead of any content the `mobi` crate would need to decompress,
//! so they're read directly by offset rather than through a full parse.
//! Grounded in the original's `MetadataHeader`/`header.encryption_type`/
//! `header.kf8_type`.

use container_core::error::{ContainerError, Result};

const PDB_HEADER_LEN: usize = 78;
const TOPAZ_MAGIC: &[u8; 3] = b"TPZ";
const MOBI_IDENTIFIER: &[u8; 4] = b"MOBI";

/// EXTH record type carrying the record index at which a joint file's KF8
/// section begins.
const EXTH_KF8_BOUNDARY: u32 = 121;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kf8Type {
    /// No KF8 section; an old Mobi6-only file.
    None,
    /// The whole file is KF8.
    Pure,
    /// Both a Mobi6 rendition and a KF8 rendition share this PDB.
    Joint,
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderInfo {
    pub encryption_type: u16,
    pub kf8_type: Kf8Type,
}

pub fn inspect(data: &[u8]) -> Result<HeaderInfo> {
    if data.len() >= 3 && &data[0..3] == TOPAZ_MAGIC {
        return Err(ContainerError::InvalidBook(
            "this is a Topaz (TPZ) file, not a MOBI file".to_string(),
        ));
    }

    // Validate the file parses as MOBI at all (the `mobi` crate is known
    // to panic on malformed records, matching the defensive pattern the
    // converter's own MOBI reader already uses).
    std::panic::catch_unwind(|| mobi::Mobi::new(data))
        .map_err(|_| ContainerError::InvalidBook("MOBI header parser panicked on malformed input".to_string()))?
        .map_err(|e| ContainerError::InvalidBook(format!("invalid MOBI file: {e}")))?;

    parse_header_bytes(data)
}

/// The byte-offset half of [`inspect`], kept separate so it can be
/// exercised directly against a synthetic header without needing a
/// fully-valid MOBI payload the `mobi` crate would also accept.
fn parse_header_bytes(data: &[u8]) -> Result<HeaderInfo> {
    let record0 = first_record(data)?;
    let encryption_type = u16::from_be_bytes([
        *record0.get(12).ok_or_else(truncated)?,
        *record0.get(13).ok_or_else(truncated)?,
    ]);

    if record0.len() < 20 || &record0[16..20] != MOBI_IDENTIFIER {
        return Err(ContainerError::InvalidBook(
            "record 0 has no MOBI header".to_string(),
        ));
    }
    let file_version = u32::from_be_bytes([
        *record0.get(36).ok_or_else(truncated)?,
        *record0.get(37).ok_or_else(truncated)?,
        *record0.get(38).ok_or_else(truncated)?,
        *record0.get(39).ok_or_else(truncated)?,
    ]);

    let has_kf8_boundary = exth_records(record0).contains_key(&EXTH_KF8_BOUNDARY);

    let kf8_type = match (file_version, has_kf8_boundary) {
        (8, _) => Kf8Type::Pure,
        (_, true) => Kf8Type::Joint,
        _ => Kf8Type::None,
    };

    Ok(HeaderInfo {
        encryption_type,
        kf8_type,
    })
}

fn truncated() -> ContainerError {
    ContainerError::InvalidBook("MOBI header is truncated".to_string())
}

/// Slices out PDB record 0 (the PalmDOC + MOBI header) using the PDB
/// record-info list that follows the fixed 78-byte database header.
fn first_record(data: &[u8]) -> Result<&[u8]> {
    if data.len() < PDB_HEADER_LEN + 8 {
        return Err(truncated());
    }
    let record_count = u16::from_be_bytes([data[76], data[77]]) as usize;
    if record_count == 0 {
        return Err(ContainerError::InvalidBook("MOBI file has no PDB records".to_string()));
    }
    let first_offset = u32::from_be_bytes([
        data[PDB_HEADER_LEN],
        data[PDB_HEADER_LEN + 1],
        data[PDB_HEADER_LEN + 2],
        data[PDB_HEADER_LEN + 3],
    ]) as usize;
    let second_offset = if record_count > 1 {
        let base = PDB_HEADER_LEN + 8;
        u32::from_be_bytes([data[base], data[base + 1], data[base + 2], data[base + 3]]) as usize
    } else {
        data.len()
    };
    data.get(first_offset..second_offset.min(data.len())).ok_or_else(truncated)
}

/// Parses the EXTH header (if present) following the MOBI header inside
/// `record0`, returning a map of EXTH record type -> raw payload bytes.
fn exth_records(record0: &[u8]) -> std::collections::HashMap<u32, Vec<u8>> {
    let mut out = std::collections::HashMap::new();
    let Some(header_length) = record0.get(20..24).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize) else {
        return out;
    };
    let Some(exth_flags) = record0
        .get(128..132)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    else {
        return out;
    };
    if exth_flags & 0x40 == 0 {
        return out;
    }
    let exth_start = 16 + header_length;
    let Some(exth) = record0.get(exth_start..) else {
        return out;
    };
    if exth.len() < 12 || &exth[0..4] != b"EXTH" {
        return out;
    }
    let record_count = u32::from_be_bytes([exth[8], exth[9], exth[10], exth[11]]) as usize;
    let mut cursor = 12;
    for _ in 0..record_count {
        let Some(header) = exth.get(cursor..cursor + 8) else { break };
        let rec_type = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let rec_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if rec_len < 8 {
            break;
        }
        let Some(payload) = exth.get(cursor + 8..cursor + rec_len) else { break };
        out.insert(rec_type, payload.to_vec());
        cursor += rec_len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_topaz_magic() {
        let mut data = vec![0u8; 200];
        data[0..3].copy_from_slice(TOPAZ_MAGIC);
        let err = inspect(&data).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidBook(_)));
    }

    /// Builds a synthetic record 0 (PalmDOC header + MOBI header, with an
    /// optional KF8-boundary EXTH record) large enough to exercise
    /// `parse_header_bytes` without needing a fully-valid MOBI payload.
    fn build_record0(file_version: u32, encryption_type: u16, kf8_boundary: Option<u32>) -> Vec<u8> {
        let mut buf = vec![0u8; 248];
        buf[12..14].copy_from_slice(&encryption_type.to_be_bytes());
        buf[16..20].copy_from_slice(MOBI_IDENTIFIER);
        buf[20..24].copy_from_slice(&232u32.to_be_bytes());
        buf[36..40].copy_from_slice(&file_version.to_be_bytes());
        if let Some(boundary) = kf8_boundary {
            buf[128..132].copy_from_slice(&0x40u32.to_be_bytes());
            buf.extend_from_slice(b"EXTH");
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&1u32.to_be_bytes());
            buf.extend_from_slice(&EXTH_KF8_BOUNDARY.to_be_bytes());
            buf.extend_from_slice(&12u32.to_be_bytes());
            buf.extend_from_slice(&boundary.to_be_bytes());
        }
        buf
    }

    fn build_pdb(record0: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; PDB_HEADER_LEN + 8];
        buf[76..78].copy_from_slice(&1u16.to_be_bytes());
        let first_offset = buf.len() as u32;
        buf[PDB_HEADER_LEN..PDB_HEADER_LEN + 4].copy_from_slice(&first_offset.to_be_bytes());
        buf.extend_from_slice(record0);
        buf
    }

    #[test]
    fn detects_pure_kf8() {
        let data = build_pdb(&build_record0(8, 0, None));
        let info = parse_header_bytes(&data).unwrap();
        assert_eq!(info.kf8_type, Kf8Type::Pure);
        assert_eq!(info.encryption_type, 0);
    }

    #[test]
    fn detects_joint_kf8_via_boundary_exth() {
        let data = build_pdb(&build_record0(6, 0, Some(5)));
        let info = parse_header_bytes(&data).unwrap();
        assert_eq!(info.kf8_type, Kf8Type::Joint);
    }

    #[test]
    fn detects_no_kf8_section() {
        let data = build_pdb(&build_record0(6, 0, None));
        let info = parse_header_bytes(&data).unwrap();
        assert_eq!(info.kf8_type, Kf8Type::None);
    }

    #[test]
    fn detects_nonzero_encryption() {
        let data = build_pdb(&build_record0(8, 2, None));
        let info = parse_header_bytes(&data).unwrap();
        assert_eq!(info.encryption_type, 2);
    }
}
