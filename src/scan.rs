//! Scan coordination: artifact enumeration, the 4-worker decode front, and
//! ordered per-artifact reference-classification fan-out.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::artifact::{ArtifactRecord, SignatureStatus};
use crate::rules::RuleSet;

/// Artifacts decoded concurrently by the coordinator front.
pub const ARTIFACT_WORKERS: usize = 4;
/// Reference-classification batches per artifact on the global pool.
pub const REFERENCE_BATCHES: usize = 6;

/// Shared scan progress, readable while a scan runs.
#[derive(Default)]
pub struct ScanProgress {
    processed: AtomicU64,
    total: AtomicU64,
    current_path: Mutex<String>,
    in_progress: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
    pub current_path: String,
    pub in_progress: bool,
}

impl ScanProgress {
    pub fn begin(&self, total: usize) {
        self.processed.store(0, AtomicOrdering::Release);
        self.total.store(total as u64, AtomicOrdering::Release);
        self.current_path.lock().clear();
        self.in_progress.store(true, AtomicOrdering::Release);
    }

    /// Update counters before an artifact is handed to a worker.
    pub fn note_current(&self, path: &Path) {
        *self.current_path.lock() = path.to_string_lossy().to_string();
        self.processed.fetch_add(1, AtomicOrdering::AcqRel);
    }

    pub fn end(&self) {
        self.in_progress.store(false, AtomicOrdering::Release);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed: self.processed.load(AtomicOrdering::Acquire),
            total: self.total.load(AtomicOrdering::Acquire),
            current_path: self.current_path.lock().clone(),
            in_progress: self.in_progress.load(AtomicOrdering::Acquire),
        }
    }
}

/// Drive letter of the platform install, from the Windows directory.
#[cfg(target_os = "windows")]
pub fn install_drive_letter() -> Option<char> {
    windows_directory().and_then(|dir| dir.chars().next())
}

#[cfg(not(target_os = "windows"))]
pub fn install_drive_letter() -> Option<char> {
    None
}

#[cfg(target_os = "windows")]
pub fn windows_directory() -> Option<String> {
    use windows::Win32::System::SystemInformation::GetWindowsDirectoryW;

    let mut buf = [0u16; 260];
    let len = unsafe { GetWindowsDirectoryW(Some(&mut buf)) } as usize;
    if len == 0 || len > buf.len() {
        return None;
    }
    Some(String::from_utf16_lossy(&buf[..len]))
}

/// The trace store: `<windir>\Prefetch`.
#[cfg(target_os = "windows")]
pub fn prefetch_directory() -> Option<PathBuf> {
    windows_directory().map(|dir| Path::new(&dir).join("Prefetch"))
}

#[cfg(not(target_os = "windows"))]
pub fn prefetch_directory() -> Option<PathBuf> {
    None
}

/// Enumerate `*.pf` files (case-insensitive extension) directly in `dir`.
pub fn enumerate_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("pf"))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}

/// Split `len` items into at most `max_batches` contiguous ranges.
pub fn batch_ranges(len: usize, max_batches: usize) -> Vec<std::ops::Range<usize>> {
    if len == 0 || max_batches == 0 {
        return Vec::new();
    }
    let batch_size = len.div_ceil(max_batches);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + batch_size).min(len);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Promote unsigned references through the pattern rules, then enforce the
/// record-level invariant: any cheat-listed reference taints the artifact.
pub fn apply_rules(rules: &RuleSet, record: &mut ArtifactRecord) {
    for i in 0..record.referenced_paths.len() {
        if record.referenced_signatures[i] != SignatureStatus::Unsigned {
            continue;
        }
        let matched = rules.scan_file(&record.referenced_paths[i]);
        if !matched.is_empty() {
            record.referenced_signatures[i] = SignatureStatus::Cheat;
            for rule_id in matched {
                if !record.matched_rules.contains(&rule_id) {
                    record.matched_rules.push(rule_id);
                }
            }
        }
    }

    if record
        .referenced_signatures
        .iter()
        .any(|s| *s == SignatureStatus::Cheat)
    {
        record.main_signature = SignatureStatus::Cheat;
    }
}

/// Walk the trace store and return one record per decodable artifact.
/// Artifacts that fail to decode, or whose worker panics, are dropped.
#[cfg(target_os = "windows")]
pub fn scan(
    ctx: &crate::signature::ScanContext,
    progress: &ScanProgress,
) -> Vec<ArtifactRecord> {
    use std::collections::VecDeque;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let Some(dir) = prefetch_directory() else {
        eprintln!("[scan] could not determine the prefetch directory");
        return Vec::new();
    };
    let paths = enumerate_artifacts(&dir);
    crate::perf_log(format!("[scan] {} artifacts in {}", paths.len(), dir.display()));

    progress.begin(paths.len());
    let queue: Mutex<VecDeque<PathBuf>> = Mutex::new(paths.into());
    let results: Mutex<Vec<ArtifactRecord>> = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for _ in 0..ARTIFACT_WORKERS {
            s.spawn(|| loop {
                let Some(path) = queue.lock().pop_front() else {
                    break;
                };
                progress.note_current(&path);
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| process_artifact(&path, ctx)));
                if let Ok(Some(record)) = outcome {
                    results.lock().push(record);
                }
            });
        }
    });
    progress.end();

    results.into_inner()
}

/// Decode one artifact and classify its paths. `None` drops the artifact.
#[cfg(target_os = "windows")]
fn process_artifact(
    path: &Path,
    ctx: &crate::signature::ScanContext,
) -> Option<ArtifactRecord> {
    use crate::{artifact, drives, names, signature};

    let raw = std::fs::read(path).ok()?;
    let buf = match artifact::decompress_artifact(raw) {
        Ok(buf) => buf,
        Err(err) => {
            crate::perf_log(format!("[scan] {}: {err}", path.display()));
            return None;
        }
    };
    let decoded = artifact::decode(&buf, drives::VolumeMap::system()).ok()?;

    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = names::stem_from_artifact(&source_name);
    let main_executable_path = names::best_match(stem, &decoded.referenced_paths)
        .map(str::to_string)
        .unwrap_or_default();

    let main_signature = if main_executable_path.is_empty() {
        SignatureStatus::NotFound
    } else {
        signature::resolve(&main_executable_path, ctx)
    };
    let referenced_signatures = classify_references(&decoded.referenced_paths, ctx);

    let mut record = ArtifactRecord {
        source_name,
        source_path: path.to_string_lossy().to_string(),
        format_version: decoded.format_version,
        format_magic: decoded.format_magic,
        declared_size: decoded.declared_size,
        run_count: decoded.run_count,
        main_executable_path,
        referenced_paths: decoded.referenced_paths,
        execution_times: decoded.execution_times,
        main_signature,
        referenced_signatures,
        matched_rules: Vec::new(),
    };
    apply_rules(&ctx.rules, &mut record);
    Some(record)
}

/// Classify every referenced path, preserving order: paths are split into at
/// most [`REFERENCE_BATCHES`] contiguous batches, each resolved on its own
/// scoped thread, and batch results are concatenated in submission order.
/// Catalog fan-out below these batches runs on the shared global pool.
#[cfg(target_os = "windows")]
fn classify_references(
    paths: &[String],
    ctx: &crate::signature::ScanContext,
) -> Vec<SignatureStatus> {
    use crate::signature;

    if paths.is_empty() {
        return Vec::new();
    }

    let mut signatures = Vec::with_capacity(paths.len());
    std::thread::scope(|s| {
        let handles: Vec<_> = batch_ranges(paths.len(), REFERENCE_BATCHES)
            .into_iter()
            .map(|range| {
                let len = range.len();
                let handle = s.spawn(move || {
                    paths[range]
                        .iter()
                        .map(|p| signature::resolve(p, ctx))
                        .collect::<Vec<_>>()
                });
                (handle, len)
            })
            .collect();
        for (handle, len) in handles {
            match handle.join() {
                Ok(batch) => signatures.extend(batch),
                // A panicked batch leaves its slots unresolved; alignment
                // with `paths` is preserved.
                Err(_) => signatures.extend(std::iter::repeat(SignatureStatus::NotFound).take(len)),
            }
        }
    });
    signatures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    #[test]
    fn enumerates_pf_files_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("A.EXE-11111111.pf"), b"x").unwrap();
        fs::write(dir.path().join("B.EXE-22222222.PF"), b"x").unwrap();
        fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub.pf")).unwrap();

        let paths = enumerate_artifacts(dir.path());
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["A.EXE-11111111.pf", "B.EXE-22222222.PF"]);
    }

    #[test]
    fn batch_ranges_cover_all_items_in_order() {
        let ranges = batch_ranges(10, 6);
        let flattened: Vec<usize> = ranges.iter().flat_map(|r| r.clone()).collect();
        assert_eq!(flattened, (0..10).collect::<Vec<_>>());
        assert!(ranges.len() <= 6);

        assert_eq!(batch_ranges(0, 6), vec![]);
        assert_eq!(batch_ranges(3, 6).len(), 3);
        assert_eq!(batch_ranges(100, 6).len(), 6);
    }

    #[test]
    fn progress_snapshot_reflects_updates() {
        let progress = ScanProgress::default();
        progress.begin(3);
        assert!(progress.snapshot().in_progress);
        assert_eq!(progress.snapshot().total, 3);

        progress.note_current(Path::new("C:\\Windows\\Prefetch\\A.pf"));
        let snap = progress.snapshot();
        assert_eq!(snap.processed, 1);
        assert!(snap.current_path.ends_with("A.pf"));

        progress.end();
        assert!(!progress.snapshot().in_progress);
    }

    fn record_with_refs(
        paths: Vec<String>,
        signatures: Vec<SignatureStatus>,
    ) -> ArtifactRecord {
        ArtifactRecord {
            source_name: "APP.EXE-00000001.pf".into(),
            source_path: String::new(),
            format_version: 30,
            format_magic: "SCCA".into(),
            declared_size: 0,
            run_count: 1,
            main_executable_path: paths.first().cloned().unwrap_or_default(),
            referenced_paths: paths,
            execution_times: vec![],
            main_signature: SignatureStatus::Signed,
            referenced_signatures: signatures,
            matched_rules: vec![],
        }
    }

    #[test]
    fn rules_promote_unsigned_matches_to_cheat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clicker.exe");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"AutoClicker AutoClicker AutoClicker").unwrap();
        drop(f);

        let rules = RuleSet::new();
        let mut record = record_with_refs(
            vec![path.to_string_lossy().to_string()],
            vec![SignatureStatus::Unsigned],
        );
        apply_rules(&rules, &mut record);

        assert_eq!(record.referenced_signatures[0], SignatureStatus::Cheat);
        assert_eq!(record.main_signature, SignatureStatus::Cheat);
        assert!(record.matched_rules.contains(&"STRINGS".to_string()));
    }

    #[test]
    fn rules_skip_signed_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clicker.exe");
        fs::write(&path, b"AutoClicker AutoClicker AutoClicker").unwrap();

        let rules = RuleSet::new();
        let mut record = record_with_refs(
            vec![path.to_string_lossy().to_string()],
            vec![SignatureStatus::Signed],
        );
        apply_rules(&rules, &mut record);

        assert_eq!(record.referenced_signatures[0], SignatureStatus::Signed);
        assert_eq!(record.main_signature, SignatureStatus::Signed);
        assert!(record.matched_rules.is_empty());
    }

    #[test]
    fn cheat_reference_taints_main_signature() {
        let mut record = record_with_refs(
            vec!["C:\\a.dll".into(), "C:\\b.dll".into()],
            vec![SignatureStatus::Signed, SignatureStatus::Cheat],
        );
        let rules = RuleSet::new();
        apply_rules(&rules, &mut record);
        assert_eq!(record.main_signature, SignatureStatus::Cheat);
    }
}
