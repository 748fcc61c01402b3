//! Change-journal replay for the trace store.
//!
//! The volume's journal is read from its first known entry and filtered to
//! post-logon delete/rename records that touch `.pf` files or the Prefetch
//! directory itself. Rename pairs are reconstructed by file reference number.
//! Record parsing and the pairing state machine are portable; only the
//! device-control reads are Windows-specific.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

pub const USN_REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const USN_REASON_RENAME_OLD_NAME: u32 = 0x0000_1000;
pub const USN_REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;

/// Reused read buffer size; the journal can be large and one big buffer
/// avoids repeated device round-trips.
#[allow(dead_code)]
pub const JOURNAL_BUFFER_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JournalAction {
    Deleted,
    Renamed,
    PrefetchDirectoryDelete,
    PrefetchDirectoryRename,
}

impl JournalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "Deleted",
            Self::Renamed => "Renamed",
            Self::PrefetchDirectoryDelete => "Prefetch Directory Delete",
            Self::PrefetchDirectoryRename => "Prefetch Directory Rename",
        }
    }
}

/// One reconstructed post-logon observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEvent {
    pub old_name: String,
    /// Empty for deletions.
    pub new_name: String,
    pub action: JournalAction,
    /// Unix seconds.
    pub timestamp: i64,
    pub is_prefetch_dir: bool,
}

/// Raw V2 change record, already narrowed to the fields the replay needs.
#[derive(Debug, Clone, PartialEq)]
pub struct UsnRecord {
    pub frn: u64,
    pub reason: u32,
    /// Unix seconds.
    pub timestamp: i64,
    pub name: String,
}

/// Parse one read buffer: 8 bytes of next-USN followed by packed records.
/// Returns the next start USN and the decoded records. A buffer containing
/// only the USN (or less) produces no records.
pub fn parse_record_buffer(buf: &[u8]) -> (i64, Vec<UsnRecord>) {
    if buf.len() < 8 {
        return (0, Vec::new());
    }
    let next_usn = i64::from_le_bytes(buf[0..8].try_into().unwrap());

    let mut records = Vec::new();
    let mut offset = 8usize;
    while offset + 4 <= buf.len() {
        let record_len =
            u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        if record_len < 64 || offset + record_len > buf.len() {
            break;
        }
        if let Some(record) = parse_usn_record_v2(&buf[offset..offset + record_len]) {
            records.push(record);
        }
        offset += record_len;
    }

    (next_usn, records)
}

/// Decode a USN_RECORD_V2. Non-V2 majors and nameless records are skipped.
fn parse_usn_record_v2(data: &[u8]) -> Option<UsnRecord> {
    if data.len() < 64 {
        return None;
    }

    let major = u16::from_le_bytes(data[4..6].try_into().ok()?);
    if major != 2 {
        return None;
    }

    let frn = u64::from_le_bytes(data[8..16].try_into().ok()?) & 0x0000_FFFF_FFFF_FFFF;
    let filetime = u64::from_le_bytes(data[32..40].try_into().ok()?);
    let reason = u32::from_le_bytes(data[40..44].try_into().ok()?);

    let name_len = u16::from_le_bytes(data[56..58].try_into().ok()?) as usize;
    let name_offset = u16::from_le_bytes(data[58..60].try_into().ok()?) as usize;
    if name_len == 0 || name_offset + name_len > data.len() {
        return None;
    }

    let utf16: Vec<u16> = data[name_offset..name_offset + name_len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let name = String::from_utf16_lossy(&utf16);

    Some(UsnRecord {
        frn,
        reason,
        timestamp: crate::artifact::filetime_to_unix(filetime),
        name,
    })
}

fn ends_with_pf(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 3
        && bytes[bytes.len() - 3] == b'.'
        && bytes[bytes.len() - 2].to_ascii_lowercase() == b'p'
        && bytes[bytes.len() - 1].to_ascii_lowercase() == b'f'
}

fn is_prefetch_dir_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("prefetch")
}

struct PendingRename {
    old_name: String,
    is_pf: bool,
}

/// Stream-order replay of change records into [`JournalEvent`]s.
pub struct JournalReplay {
    logon_time: i64,
    prefetch_dir_frns: HashSet<u64>,
    pending_renames: HashMap<u64, PendingRename>,
    events: Vec<JournalEvent>,
}

impl JournalReplay {
    pub fn new(logon_time: i64) -> Self {
        Self {
            logon_time,
            prefetch_dir_frns: HashSet::new(),
            pending_renames: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, record: &UsnRecord) {
        if record.timestamp <= self.logon_time {
            return;
        }

        if is_prefetch_dir_name(&record.name) {
            self.prefetch_dir_frns.insert(record.frn);
        }
        let in_cohort = self.prefetch_dir_frns.contains(&record.frn);
        let is_pf = ends_with_pf(&record.name);

        if record.reason & USN_REASON_RENAME_OLD_NAME != 0 {
            self.pending_renames.insert(
                record.frn,
                PendingRename {
                    old_name: record.name.clone(),
                    is_pf,
                },
            );
        } else if record.reason & USN_REASON_RENAME_NEW_NAME != 0 {
            if let Some(pending) = self.pending_renames.remove(&record.frn) {
                if in_cohort {
                    self.events.push(JournalEvent {
                        old_name: pending.old_name,
                        new_name: record.name.clone(),
                        action: JournalAction::PrefetchDirectoryRename,
                        timestamp: record.timestamp,
                        is_prefetch_dir: true,
                    });
                } else if pending.is_pf {
                    self.events.push(JournalEvent {
                        old_name: pending.old_name,
                        new_name: record.name.clone(),
                        action: JournalAction::Renamed,
                        timestamp: record.timestamp,
                        is_prefetch_dir: false,
                    });
                }
            }
        } else if record.reason & USN_REASON_FILE_DELETE != 0 {
            if in_cohort {
                self.events.push(JournalEvent {
                    old_name: record.name.clone(),
                    new_name: String::new(),
                    action: JournalAction::PrefetchDirectoryDelete,
                    timestamp: record.timestamp,
                    is_prefetch_dir: true,
                });
            } else if is_pf {
                self.events.push(JournalEvent {
                    old_name: record.name.clone(),
                    new_name: String::new(),
                    action: JournalAction::Deleted,
                    timestamp: record.timestamp,
                    is_prefetch_dir: false,
                });
            }
        }
    }

    /// Close the pairing window: unmatched OLD_NAME records are dropped.
    pub fn finish(self) -> Vec<JournalEvent> {
        self.events
    }
}

/// Replay the volume journal from its head and return post-logon events.
#[cfg(target_os = "windows")]
pub fn read_events() -> Result<Vec<JournalEvent>, crate::error::ScanError> {
    use crate::error::ScanError;
    use crate::win::{session, volume};

    let drive = crate::scan::install_drive_letter().unwrap_or('C');
    let vol = volume::open_volume(drive).map_err(ScanError::JournalQueryFailed)?;
    let journal = volume::query_usn_journal(&vol).map_err(ScanError::JournalQueryFailed)?;

    let logon_time = session::interactive_logon_time().unwrap_or(0);
    let mut replay = JournalReplay::new(logon_time);

    let reason_mask =
        USN_REASON_RENAME_OLD_NAME | USN_REASON_RENAME_NEW_NAME | USN_REASON_FILE_DELETE;
    let mut buffer = vec![0u8; JOURNAL_BUFFER_SIZE];
    let mut start_usn = journal.first_usn;

    loop {
        let bytes = match volume::read_usn_journal(
            &vol,
            start_usn,
            journal.journal_id,
            reason_mask,
            &mut buffer,
        ) {
            Ok(n) => n,
            // Read failures end the stream; whatever replayed so far stands.
            Err(_) => break,
        };
        if bytes <= 8 {
            break;
        }

        let (next_usn, records) = parse_record_buffer(&buffer[..bytes]);
        for record in &records {
            replay.push(record);
        }

        if next_usn <= start_usn {
            break;
        }
        start_usn = next_usn;
    }

    Ok(replay.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;

    fn rec(frn: u64, reason: u32, ts: i64, name: &str) -> UsnRecord {
        UsnRecord {
            frn,
            reason,
            timestamp: ts,
            name: name.to_string(),
        }
    }

    fn replay(records: &[UsnRecord]) -> Vec<JournalEvent> {
        let mut r = JournalReplay::new(T0);
        for record in records {
            r.push(record);
        }
        r.finish()
    }

    #[test]
    fn pre_logon_records_are_discarded() {
        let events = replay(&[
            rec(1, USN_REASON_FILE_DELETE, T0 - 60, "OLD.EXE-11111111.pf"),
            rec(2, USN_REASON_FILE_DELETE, T0, "ATLOGON.EXE-22222222.pf"),
        ]);
        assert!(events.is_empty());
    }

    #[test]
    fn pf_delete_after_logon_is_reported() {
        let events = replay(&[rec(
            9,
            USN_REASON_FILE_DELETE,
            T0 + 60,
            "NOTEPAD.EXE-D8414F97.pf",
        )]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, JournalAction::Deleted);
        assert_eq!(events[0].old_name, "NOTEPAD.EXE-D8414F97.pf");
        assert_eq!(events[0].new_name, "");
        assert_eq!(events[0].timestamp, T0 + 60);
        assert!(!events[0].is_prefetch_dir);
    }

    #[test]
    fn non_pf_delete_is_ignored() {
        let events = replay(&[rec(9, USN_REASON_FILE_DELETE, T0 + 60, "report.txt")]);
        assert!(events.is_empty());
    }

    #[test]
    fn pf_rename_pairs_old_and_new() {
        let events = replay(&[
            rec(5, USN_REASON_RENAME_OLD_NAME, T0 + 10, "CMD.EXE-0B8C2A15.pf"),
            rec(5, USN_REASON_RENAME_NEW_NAME, T0 + 10, "CMD.EXE-0B8C2A15.bak"),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, JournalAction::Renamed);
        assert_eq!(events[0].old_name, "CMD.EXE-0B8C2A15.pf");
        assert_eq!(events[0].new_name, "CMD.EXE-0B8C2A15.bak");
    }

    #[test]
    fn prefetch_dir_rename_uses_cohort() {
        let events = replay(&[
            rec(77, USN_REASON_RENAME_OLD_NAME, T0 + 5, "Prefetch"),
            rec(77, USN_REASON_RENAME_NEW_NAME, T0 + 5, "Prefetch_old"),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, JournalAction::PrefetchDirectoryRename);
        assert_eq!(events[0].old_name, "Prefetch");
        assert_eq!(events[0].new_name, "Prefetch_old");
        assert!(events[0].is_prefetch_dir);
    }

    #[test]
    fn prefetch_dir_delete_uses_cohort() {
        // The directory is seen once under its canonical name, then deleted.
        let events = replay(&[
            rec(77, USN_REASON_RENAME_OLD_NAME, T0 + 5, "PREFETCH"),
            rec(77, USN_REASON_FILE_DELETE, T0 + 6, "PREFETCH"),
        ]);
        assert!(events
            .iter()
            .any(|e| e.action == JournalAction::PrefetchDirectoryDelete));
    }

    #[test]
    fn unpaired_old_name_is_dropped() {
        let events = replay(&[rec(
            5,
            USN_REASON_RENAME_OLD_NAME,
            T0 + 10,
            "CMD.EXE-0B8C2A15.pf",
        )]);
        assert!(events.is_empty());
    }

    #[test]
    fn new_name_without_old_is_ignored() {
        let events = replay(&[rec(
            5,
            USN_REASON_RENAME_NEW_NAME,
            T0 + 10,
            "CMD.EXE-0B8C2A15.pf",
        )]);
        assert!(events.is_empty());
    }

    #[test]
    fn rename_events_have_nonempty_new_names() {
        let events = replay(&[
            rec(1, USN_REASON_RENAME_OLD_NAME, T0 + 1, "A.EXE-00000001.pf"),
            rec(1, USN_REASON_RENAME_NEW_NAME, T0 + 1, "A.EXE-00000001.tmp"),
            rec(2, USN_REASON_FILE_DELETE, T0 + 2, "B.EXE-00000002.pf"),
        ]);
        for event in &events {
            assert!(event.timestamp > T0);
            match event.action {
                JournalAction::Renamed | JournalAction::PrefetchDirectoryRename => {
                    assert!(!event.new_name.is_empty())
                }
                JournalAction::Deleted | JournalAction::PrefetchDirectoryDelete => {
                    assert!(event.new_name.is_empty())
                }
            }
        }
    }

    // ── record-buffer parsing ──

    fn encode_record(frn: u64, reason: u32, filetime: u64, name: &str) -> Vec<u8> {
        let name_units: Vec<u16> = name.encode_utf16().collect();
        let name_bytes = name_units.len() * 2;
        let record_len = ((64 + name_bytes + 7) / 8) * 8;

        let mut rec = vec![0u8; record_len];
        rec[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        rec[4..6].copy_from_slice(&2u16.to_le_bytes()); // major version
        rec[8..16].copy_from_slice(&frn.to_le_bytes());
        rec[32..40].copy_from_slice(&filetime.to_le_bytes());
        rec[40..44].copy_from_slice(&reason.to_le_bytes());
        rec[56..58].copy_from_slice(&(name_bytes as u16).to_le_bytes());
        rec[58..60].copy_from_slice(&64u16.to_le_bytes());
        for (i, unit) in name_units.iter().enumerate() {
            rec[64 + i * 2..64 + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        rec
    }

    #[test]
    fn buffer_with_only_next_usn_yields_no_records() {
        let buf = 4242i64.to_le_bytes().to_vec();
        let (next, records) = parse_record_buffer(&buf);
        assert_eq!(next, 4242);
        assert!(records.is_empty());
    }

    #[test]
    fn parses_packed_records() {
        let ft = (1_700_000_100u64 + 11_644_473_600) * 10_000_000;
        let mut buf = 99i64.to_le_bytes().to_vec();
        buf.extend(encode_record(7, USN_REASON_FILE_DELETE, ft, "X.EXE-1.pf"));
        buf.extend(encode_record(8, USN_REASON_RENAME_OLD_NAME, ft, "Prefetch"));

        let (next, records) = parse_record_buffer(&buf);
        assert_eq!(next, 99);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].frn, 7);
        assert_eq!(records[0].name, "X.EXE-1.pf");
        assert_eq!(records[0].timestamp, 1_700_000_100);
        assert_eq!(records[1].name, "Prefetch");
    }

    #[test]
    fn truncated_record_terminates_loop() {
        let ft = (1_700_000_100u64 + 11_644_473_600) * 10_000_000;
        let mut buf = 1i64.to_le_bytes().to_vec();
        let rec = encode_record(7, USN_REASON_FILE_DELETE, ft, "X.EXE-1.pf");
        buf.extend(&rec[..rec.len() - 4]); // cut the tail

        let (_, records) = parse_record_buffer(&buf);
        assert!(records.is_empty());
    }

    #[test]
    fn non_v2_records_are_skipped() {
        let ft = (1_700_000_100u64 + 11_644_473_600) * 10_000_000;
        let mut rec = encode_record(7, USN_REASON_FILE_DELETE, ft, "X.EXE-1.pf");
        rec[4..6].copy_from_slice(&3u16.to_le_bytes());
        let mut buf = 1i64.to_le_bytes().to_vec();
        buf.extend(rec);

        let (_, records) = parse_record_buffer(&buf);
        assert!(records.is_empty());
    }
}
