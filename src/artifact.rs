//! Trace-artifact decoding: wire-shape detection, MAM decompression header,
//! and the versioned binary layout (v17/v23/v26/v30/v31).
//!
//! All integers are little-endian. Field reads are bounds-checked against the
//! buffer; a missing optional field yields an empty value instead of failing
//! the artifact, matching how the platform tolerates truncated trace files.

use serde::Serialize;

use crate::drives::VolumeMap;
use crate::error::ScanError;

/// Minimum plausible artifact size after decompression.
pub const MIN_ARTIFACT_SIZE: usize = 0x100;

/// Seconds between the platform epoch (1601) and the unix epoch.
const EPOCH_DIFF_SECS: i64 = 11_644_473_600;
const TICKS_PER_SEC: i64 = 10_000_000;

const SUPPORTED_VERSIONS: &[u32] = &[17, 23, 26, 30, 31];
const EXECUTION_TIME_SLOTS: usize = 8;

const OFF_VERSION: usize = 0x00;
const OFF_MAGIC: usize = 0x04;
const OFF_DECLARED_SIZE: usize = 0x0C;
const OFF_FILE_TABLE: usize = 0x64;
const OFF_FILE_TABLE_SIZE: usize = 0x68;

/// Trust classification of one file, ordered by display severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignatureStatus {
    Signed,
    Unsigned,
    Cheat,
    Fake,
    NotFound,
}

impl SignatureStatus {
    /// Sort key used when presenting results grouped by trust.
    pub fn display_rank(self) -> u8 {
        match self {
            Self::Signed => 0,
            Self::Unsigned => 1,
            Self::Cheat => 2,
            Self::Fake => 3,
            Self::NotFound => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signed => "Signed",
            Self::Unsigned => "Unsigned",
            Self::Cheat => "Cheat",
            Self::Fake => "Fake",
            Self::NotFound => "NotFound",
        }
    }
}

/// Fully-resolved record for one parsed trace artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub source_name: String,
    pub source_path: String,
    pub format_version: u32,
    pub format_magic: String,
    pub declared_size: u32,
    pub run_count: u32,
    /// Empty when no referenced path matched the artifact stem.
    pub main_executable_path: String,
    pub referenced_paths: Vec<String>,
    /// Unix seconds, most recent first, at most 8 entries.
    pub execution_times: Vec<i64>,
    pub main_signature: SignatureStatus,
    /// Parallel to `referenced_paths`.
    pub referenced_signatures: Vec<SignatureStatus>,
    pub matched_rules: Vec<String>,
}

/// Layout-level decode result, before signature resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedArtifact {
    pub format_version: u32,
    pub format_magic: String,
    pub declared_size: u32,
    pub run_count: u32,
    pub referenced_paths: Vec<String>,
    pub execution_times: Vec<i64>,
}

/// Preamble of the compressed wire shape: `M A M <nibble>` + decompressed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MamHeader {
    pub format: u8,
    pub decompressed_size: u32,
}

impl MamHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if word & 0x00FF_FFFF != 0x004D_414D {
            return None;
        }
        let format = ((word & 0x0F00_0000) >> 24) as u8;
        let decompressed_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Self {
            format,
            decompressed_size,
        })
    }
}

/// True when the buffer starts with a version word followed by the `SCCA`
/// magic, i.e. it is already uncompressed.
pub fn has_scca_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && &bytes[4..8] == b"SCCA"
}

/// Normalize a raw trace file into its uncompressed byte buffer.
///
/// Compressed (`MAM`) inputs are handed to the system decompression service;
/// uncompressed (`SCCA`) inputs pass through. Anything else is rejected, as is
/// any result below [`MIN_ARTIFACT_SIZE`].
pub fn decompress_artifact(raw: Vec<u8>) -> Result<Vec<u8>, ScanError> {
    let buf = if MamHeader::parse(&raw).is_some() {
        #[cfg(target_os = "windows")]
        {
            crate::win::compress::decompress_mam(&raw)?
        }
        #[cfg(not(target_os = "windows"))]
        {
            return Err(ScanError::DecompressionFailed(
                "system decompression service unavailable on this platform".to_string(),
            ));
        }
    } else if has_scca_magic(&raw) {
        raw
    } else {
        return Err(ScanError::UnsupportedFormat);
    };

    if buf.len() < MIN_ARTIFACT_SIZE {
        return Err(ScanError::TooShort(buf.len()));
    }
    Ok(buf)
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

fn run_count_offset(version: u32) -> usize {
    match version {
        17 => 0x90,
        23 => 0x98,
        _ => 0xD0,
    }
}

fn execution_time_offset(version: u32) -> usize {
    match version {
        17 => 0x78,
        _ => 0x80,
    }
}

/// Decode an uncompressed artifact buffer.
///
/// Rejects unknown format versions and buffers without the `SCCA` magic.
/// Every referenced path is rewritten through the volume map.
pub fn decode(buf: &[u8], volumes: &VolumeMap) -> Result<DecodedArtifact, ScanError> {
    let version = read_u32(buf, OFF_VERSION).ok_or(ScanError::TooShort(buf.len()))?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ScanError::UnsupportedFormat);
    }

    let magic_bytes = buf
        .get(OFF_MAGIC..OFF_MAGIC + 4)
        .ok_or(ScanError::TooShort(buf.len()))?;
    if magic_bytes != b"SCCA" {
        return Err(ScanError::UnsupportedFormat);
    }
    let format_magic = String::from_utf8_lossy(magic_bytes).into_owned();

    Ok(DecodedArtifact {
        format_version: version,
        format_magic,
        declared_size: read_u32(buf, OFF_DECLARED_SIZE).unwrap_or(0),
        run_count: read_u32(buf, run_count_offset(version)).unwrap_or(0),
        referenced_paths: extract_referenced_paths(buf, volumes),
        execution_times: extract_execution_times(buf, version),
    })
}

/// Read the NUL-separated UTF-16LE filename table. A trailing string without
/// a terminator is still emitted. Each string is rewritten through the volume
/// map before it is returned.
fn extract_referenced_paths(buf: &[u8], volumes: &VolumeMap) -> Vec<String> {
    let mut paths = Vec::new();
    let (Some(offset), Some(size)) = (
        read_u32(buf, OFF_FILE_TABLE).map(|v| v as usize),
        read_u32(buf, OFF_FILE_TABLE_SIZE).map(|v| v as usize),
    ) else {
        return paths;
    };
    if size == 0 || offset.checked_add(size).map_or(true, |end| end > buf.len()) {
        return paths;
    }

    let table = &buf[offset..offset + size];
    let mut current: Vec<u16> = Vec::new();
    for unit in table.chunks_exact(2) {
        let ch = u16::from_le_bytes([unit[0], unit[1]]);
        if ch == 0 {
            if !current.is_empty() {
                push_resolved(&mut paths, &current, volumes);
                current.clear();
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        push_resolved(&mut paths, &current, volumes);
    }
    paths
}

fn push_resolved(paths: &mut Vec<String>, units: &[u16], volumes: &VolumeMap) {
    let raw = String::from_utf16_lossy(units);
    let (resolved, _) = volumes.resolve(&raw);
    paths.push(resolved);
}

/// Read up to 8 execution timestamps. Zero slots are skipped; anything past
/// the eighth slot is ignored regardless of value.
fn extract_execution_times(buf: &[u8], version: u32) -> Vec<i64> {
    let mut times = Vec::new();
    let mut offset = execution_time_offset(version);
    for _ in 0..EXECUTION_TIME_SLOTS {
        let Some(raw) = read_u64(buf, offset) else {
            break;
        };
        if raw != 0 {
            times.push(filetime_to_unix(raw));
        }
        offset += 8;
    }
    times
}

/// 100-ns ticks since 1601 → unix seconds.
pub fn filetime_to_unix(filetime: u64) -> i64 {
    (filetime / TICKS_PER_SEC as u64) as i64 - EPOCH_DIFF_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volumes() -> VolumeMap {
        VolumeMap::from_entries(vec![(0xA1B2_C3D4, "C:".to_string())])
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_utf16(buf: &mut [u8], offset: usize, text: &str) -> usize {
        let mut pos = offset;
        for unit in text.encode_utf16() {
            buf[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
            pos += 2;
        }
        pos
    }

    /// 2024-01-02 03:04:05 UTC as a platform timestamp.
    const JAN_2024_FILETIME: u64 = (1_704_164_645u64 + 11_644_473_600) * 10_000_000;

    fn v30_fixture() -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        put_u32(&mut buf, 0x00, 30);
        buf[0x04..0x08].copy_from_slice(b"SCCA");
        put_u32(&mut buf, 0x0C, 4096);
        put_u32(&mut buf, 0xD0, 3); // run count

        let path = "\\VOLUME{01D0-A1B2C3D4}\\Windows\\System32\\notepad.exe";
        let end = put_utf16(&mut buf, 0x200, path);
        let table_size = (end - 0x200) + 2; // include the NUL terminator
        put_u32(&mut buf, 0x64, 0x200);
        put_u32(&mut buf, 0x68, table_size as u32);

        put_u64(&mut buf, 0x80, JAN_2024_FILETIME);
        buf
    }

    #[test]
    fn decodes_v30_with_volume_rewrite() {
        let buf = v30_fixture();
        let decoded = decode(&buf, &volumes()).unwrap();
        assert_eq!(decoded.format_version, 30);
        assert_eq!(decoded.format_magic, "SCCA");
        assert_eq!(decoded.declared_size, 4096);
        assert_eq!(decoded.run_count, 3);
        assert_eq!(
            decoded.referenced_paths,
            vec!["C:\\Windows\\System32\\notepad.exe".to_string()]
        );
        assert_eq!(decoded.execution_times, vec![1_704_164_645]);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut buf = v30_fixture();
        put_u32(&mut buf, 0x00, 24);
        assert!(matches!(
            decode(&buf, &volumes()),
            Err(ScanError::UnsupportedFormat)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = v30_fixture();
        buf[0x04..0x08].copy_from_slice(b"XXXX");
        assert!(matches!(
            decode(&buf, &volumes()),
            Err(ScanError::UnsupportedFormat)
        ));
    }

    #[test]
    fn v17_uses_early_offsets() {
        let mut buf = vec![0u8; 1024];
        put_u32(&mut buf, 0x00, 17);
        buf[0x04..0x08].copy_from_slice(b"SCCA");
        put_u32(&mut buf, 0x90, 7);
        put_u64(&mut buf, 0x78, JAN_2024_FILETIME);

        let decoded = decode(&buf, &volumes()).unwrap();
        assert_eq!(decoded.run_count, 7);
        assert_eq!(decoded.execution_times, vec![1_704_164_645]);
    }

    #[test]
    fn zero_time_slots_are_skipped_and_ninth_ignored() {
        let mut buf = vec![0u8; 1024];
        put_u32(&mut buf, 0x00, 31);
        buf[0x04..0x08].copy_from_slice(b"SCCA");
        // Slots 0, 2 populated; slot 1 zero.
        put_u64(&mut buf, 0x80, JAN_2024_FILETIME);
        put_u64(&mut buf, 0x90, JAN_2024_FILETIME + 10_000_000);
        // A value just past the 8-slot window must not be read.
        put_u64(&mut buf, 0x80 + 8 * 8, u64::MAX / 2);

        let decoded = decode(&buf, &volumes()).unwrap();
        assert_eq!(
            decoded.execution_times,
            vec![1_704_164_645, 1_704_164_646]
        );
    }

    #[test]
    fn eight_time_slots_all_preserved() {
        let mut buf = vec![0u8; 1024];
        put_u32(&mut buf, 0x00, 30);
        buf[0x04..0x08].copy_from_slice(b"SCCA");
        for i in 0..8u64 {
            put_u64(&mut buf, 0x80 + (i as usize) * 8, JAN_2024_FILETIME + i * 10_000_000);
        }
        let decoded = decode(&buf, &volumes()).unwrap();
        assert_eq!(decoded.execution_times.len(), 8);
    }

    #[test]
    fn trailing_unterminated_name_is_emitted() {
        let mut buf = vec![0u8; 1024];
        put_u32(&mut buf, 0x00, 30);
        buf[0x04..0x08].copy_from_slice(b"SCCA");

        let first = "C:\\A.DLL";
        let mut pos = put_utf16(&mut buf, 0x200, first);
        pos += 2; // NUL
        let second = "C:\\B.DLL";
        let end = put_utf16(&mut buf, pos, second);
        // Table size stops exactly at the last character: no trailing NUL.
        put_u32(&mut buf, 0x64, 0x200);
        put_u32(&mut buf, 0x68, (end - 0x200) as u32);

        let decoded = decode(&buf, &volumes()).unwrap();
        assert_eq!(
            decoded.referenced_paths,
            vec![first.to_string(), second.to_string()]
        );
    }

    #[test]
    fn out_of_range_table_yields_empty_paths() {
        let mut buf = vec![0u8; 512];
        put_u32(&mut buf, 0x00, 30);
        buf[0x04..0x08].copy_from_slice(b"SCCA");
        put_u32(&mut buf, 0x64, 0x400); // beyond the buffer
        put_u32(&mut buf, 0x68, 64);

        let decoded = decode(&buf, &volumes()).unwrap();
        assert!(decoded.referenced_paths.is_empty());
    }

    #[test]
    fn minimum_size_boundary() {
        // Exactly 256 bytes: header fields are in range, so decode succeeds.
        let mut buf = vec![0u8; MIN_ARTIFACT_SIZE];
        put_u32(&mut buf, 0x00, 23);
        buf[0x04..0x08].copy_from_slice(b"SCCA");
        let decoded = decode(&buf, &volumes()).unwrap();
        // v23 run count lives at 0x98, inside the 256-byte window.
        assert_eq!(decoded.run_count, 0);
        assert!(decoded.referenced_paths.is_empty());
    }

    #[test]
    fn mam_header_parses_scenario_preamble() {
        let header = MamHeader::parse(&[0x4D, 0x41, 0x4D, 0x04, 0x00, 0x10, 0x00, 0x00]).unwrap();
        assert_eq!(header.format, 4);
        assert_eq!(header.decompressed_size, 4096);
    }

    #[test]
    fn mam_header_rejects_other_preambles() {
        assert!(MamHeader::parse(b"SCCA0000").is_none());
        assert!(MamHeader::parse(&[0x4D, 0x41]).is_none());
        // Version word + SCCA is the uncompressed shape, not MAM.
        let mut buf = vec![0u8; 8];
        buf[4..8].copy_from_slice(b"SCCA");
        assert!(MamHeader::parse(&buf).is_none());
        assert!(has_scca_magic(&buf));
    }

    #[test]
    fn decompress_rejects_garbage_and_short_buffers() {
        assert!(matches!(
            decompress_artifact(vec![0u8; 512]),
            Err(ScanError::UnsupportedFormat)
        ));

        let mut short = vec![0u8; 64];
        short[4..8].copy_from_slice(b"SCCA");
        assert!(matches!(
            decompress_artifact(short),
            Err(ScanError::TooShort(64))
        ));
    }

    #[test]
    fn decompress_passes_through_uncompressed() {
        let buf = v30_fixture();
        let out = decompress_artifact(buf.clone()).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn filetime_conversion_matches_known_instant() {
        assert_eq!(filetime_to_unix(JAN_2024_FILETIME), 1_704_164_645);
        assert_eq!(filetime_to_unix(11_644_473_600 * 10_000_000), 0);
    }
}
