//! Trust classification of referenced files.
//!
//! The decision pipeline: path cache → forced-signed allowlist → self path →
//! file check → header read → header-hash cache → PE sniff → embedded
//! signature verify (cheat-signer check, Fake-upgrade via the certificate
//! store snapshot) → catalog fallback → Unsigned. Results are computed
//! outside the cache locks and inserted afterwards.

use std::collections::HashMap;

use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::artifact::SignatureStatus;
use crate::rules::RuleSet;

/// Bytes of each file inspected for PE sniffing and header hashing.
pub const HEADER_PROBE_SIZE: usize = 1024;

/// Signer-subject fragments (lowercase) that mark a binary as a known-bad
/// signer regardless of a valid signature.
pub const CHEAT_SIGNERS: &[&str] = &[
    "manthe industries, llc",
    "slinkware",
    "amstion limited",
    "newfakeco",
    "faked signatures inc",
];

/// Platform binaries short-circuited to Signed. Entries are normalized:
/// install-drive prefix stripped, uppercased, backslash separators.
const FORCED_SIGNED_PATHS: &[&str] = &[
    "\\WINDOWS\\EXPLORER.EXE",
    "\\WINDOWS\\SYSTEM32\\CMD.EXE",
    "\\WINDOWS\\SYSTEM32\\CONHOST.EXE",
    "\\WINDOWS\\SYSTEM32\\DLLHOST.EXE",
    "\\WINDOWS\\SYSTEM32\\NOTEPAD.EXE",
    "\\WINDOWS\\SYSTEM32\\RUNTIMEBROKER.EXE",
    "\\WINDOWS\\SYSTEM32\\SVCHOST.EXE",
    "\\WINDOWS\\SYSTEM32\\TASKHOSTW.EXE",
    "\\WINDOWS\\SYSTEM32\\WINLOGON.EXE",
];

pub type Sha1Hash = [u8; 20];

/// Process-lifetime signature caches, readers/writer-locked.
#[derive(Default)]
pub struct SignatureCaches {
    path: RwLock<HashMap<String, SignatureStatus>>,
    header: RwLock<HashMap<Sha1Hash, SignatureStatus>>,
    file_hash: RwLock<HashMap<String, Sha1Hash>>,
    catalog: RwLock<HashMap<Sha1Hash, bool>>,
}

impl SignatureCaches {
    pub fn path_get(&self, path: &str) -> Option<SignatureStatus> {
        self.path.read().get(path).copied()
    }

    pub fn path_insert(&self, path: &str, status: SignatureStatus) {
        self.path.write().insert(path.to_string(), status);
    }

    pub fn header_get(&self, hash: &Sha1Hash) -> Option<SignatureStatus> {
        self.header.read().get(hash).copied()
    }

    pub fn header_insert(&self, hash: Sha1Hash, status: SignatureStatus) {
        self.header.write().insert(hash, status);
    }

    pub fn file_hash_get(&self, path: &str) -> Option<Sha1Hash> {
        self.file_hash.read().get(path).copied()
    }

    pub fn file_hash_insert(&self, path: &str, hash: Sha1Hash) {
        self.file_hash.write().insert(path.to_string(), hash);
    }

    pub fn catalog_get(&self, hash: &Sha1Hash) -> Option<bool> {
        self.catalog.read().get(hash).copied()
    }

    pub fn catalog_insert(&self, hash: Sha1Hash, signed: bool) {
        self.catalog.write().insert(hash, signed);
    }
}

/// Shared state for one process: caches, compiled rules, identity of the
/// inspector itself, and (on Windows) the lazily-built certificate-store
/// snapshot. Constructed once at startup and passed explicitly.
pub struct ScanContext {
    pub caches: SignatureCaches,
    pub rules: RuleSet,
    pub self_path: String,
    pub install_drive: Option<char>,
    #[cfg(target_os = "windows")]
    stores: RwLock<Option<std::sync::Arc<crate::win::trust::StoreSnapshot>>>,
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanContext {
    pub fn new() -> Self {
        let self_path = std::env::current_exe()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            caches: SignatureCaches::default(),
            rules: RuleSet::new(),
            self_path,
            install_drive: crate::scan::install_drive_letter(),
            #[cfg(target_os = "windows")]
            stores: RwLock::new(None),
        }
    }

    /// Snapshot of the local certificate stores, built once on first use and
    /// read-only afterwards.
    #[cfg(target_os = "windows")]
    pub fn store_snapshot(&self) -> std::sync::Arc<crate::win::trust::StoreSnapshot> {
        use std::sync::Arc;
        if let Some(snapshot) = self.stores.read().as_ref() {
            return Arc::clone(snapshot);
        }
        let mut slot = self.stores.write();
        if let Some(snapshot) = slot.as_ref() {
            return Arc::clone(snapshot);
        }
        let snapshot = Arc::new(crate::win::trust::StoreSnapshot::build());
        *slot = Some(Arc::clone(&snapshot));
        snapshot
    }
}

/// PE sniff over the header probe: `MZ`, in-range `PE\0\0`, and a plausible
/// section count (1..=96).
pub fn is_pe_image(header: &[u8]) -> bool {
    if header.len() < 0x40 || header[0] != b'M' || header[1] != b'Z' {
        return false;
    }
    let e_lfanew =
        u32::from_le_bytes([header[0x3C], header[0x3D], header[0x3E], header[0x3F]]) as usize;
    // 4 bytes signature + 20-byte file header must fit in the probe.
    if e_lfanew + 24 > header.len() {
        return false;
    }
    if &header[e_lfanew..e_lfanew + 4] != b"PE\0\0" {
        return false;
    }
    let sections = u16::from_le_bytes([header[e_lfanew + 6], header[e_lfanew + 7]]);
    (1..=96).contains(&sections)
}

/// Strip the install-drive prefix, unify separators, uppercase.
pub fn normalize_forced_path(path: &str, install_drive: Option<char>) -> String {
    let drive = install_drive.unwrap_or('C').to_ascii_uppercase();
    let bytes = path.as_bytes();
    let stripped = if bytes.len() >= 2
        && bytes[1] == b':'
        && bytes[0].to_ascii_uppercase() == drive as u8
    {
        &path[2..]
    } else {
        path
    };
    stripped
        .chars()
        .map(|c| if c == '/' { '\\' } else { c.to_ascii_uppercase() })
        .collect()
}

pub fn is_forced_signed(path: &str, install_drive: Option<char>) -> bool {
    let normalized = normalize_forced_path(path, install_drive);
    FORCED_SIGNED_PATHS.contains(&normalized.as_str())
}

pub fn subject_is_cheat_listed(subject_lower: &str) -> bool {
    CHEAT_SIGNERS
        .iter()
        .any(|fragment| subject_lower.contains(fragment))
}

pub fn sha1_of(bytes: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Classify one absolute path. Stable per path for the process lifetime.
#[cfg(target_os = "windows")]
pub fn resolve(path: &str, ctx: &ScanContext) -> SignatureStatus {
    use std::fs;
    use std::io::Read;

    if let Some(hit) = ctx.caches.path_get(path) {
        return hit;
    }
    if is_forced_signed(path, ctx.install_drive) {
        return SignatureStatus::Signed;
    }
    if !ctx.self_path.is_empty() && path.eq_ignore_ascii_case(&ctx.self_path) {
        return SignatureStatus::Signed;
    }

    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {}
        _ => {
            ctx.caches.path_insert(path, SignatureStatus::NotFound);
            return SignatureStatus::NotFound;
        }
    }

    let mut header = [0u8; HEADER_PROBE_SIZE];
    let read = fs::File::open(path)
        .and_then(|mut f| f.read(&mut header))
        .unwrap_or(0);
    if read == 0 {
        ctx.caches.path_insert(path, SignatureStatus::NotFound);
        return SignatureStatus::NotFound;
    }
    let header = &header[..read];

    let header_hash = sha1_of(header);
    if let Some(hit) = ctx.caches.header_get(&header_hash) {
        ctx.caches.path_insert(path, hit);
        return hit;
    }

    let status = classify_uncached(path, header, ctx);

    ctx.caches.header_insert(header_hash, status);
    ctx.caches.path_insert(path, status);
    status
}

#[cfg(target_os = "windows")]
fn classify_uncached(path: &str, header: &[u8], ctx: &ScanContext) -> SignatureStatus {
    use crate::win::trust;

    // Non-executable content is treated as trusted.
    if !is_pe_image(header) {
        return SignatureStatus::Signed;
    }

    match trust::verify_embedded(path) {
        Ok(Some(signer)) => {
            let subject = signer.subject.to_lowercase();
            if subject_is_cheat_listed(&subject) {
                return SignatureStatus::Cheat;
            }
            // A valid signature whose certificate sits in a local store did
            // not chain through the normal trust path: self-installed.
            if let Some(cert_hash) = signer.cert_sha1 {
                if ctx.store_snapshot().contains(&cert_hash) {
                    return SignatureStatus::Fake;
                }
            }
            SignatureStatus::Signed
        }
        Ok(None) | Err(_) => {
            if catalog_signed(path, ctx) {
                SignatureStatus::Signed
            } else {
                SignatureStatus::Unsigned
            }
        }
    }
}

/// Catalog fallback: full-file SHA-1 (cached per path), then parallel
/// verification of each matching catalog entry; first success wins.
#[cfg(target_os = "windows")]
fn catalog_signed(path: &str, ctx: &ScanContext) -> bool {
    use crate::win::trust;

    let hash = match ctx.caches.file_hash_get(path) {
        Some(hash) => hash,
        None => {
            let Ok(hash) = full_file_sha1(path) else {
                return false;
            };
            ctx.caches.file_hash_insert(path, hash);
            hash
        }
    };

    if let Some(hit) = ctx.caches.catalog_get(&hash) {
        return hit;
    }
    let signed = trust::verify_against_catalogs(path, &hash);
    ctx.caches.catalog_insert(hash, signed);
    signed
}

/// SHA-1 of the whole file, memory-mapped and hashed in 64 KiB steps.
#[cfg(target_os = "windows")]
fn full_file_sha1(path: &str) -> std::io::Result<Sha1Hash> {
    const CHUNK: usize = 64 * 1024;

    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let mut hasher = Sha1::new();
    for chunk in mmap.chunks(CHUNK) {
        hasher.update(chunk);
    }
    Ok(hasher.finalize().into())
}
