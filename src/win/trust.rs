//! Trust-service wrappers: embedded-signature verification with signer
//! extraction, the local certificate-store snapshot used by the Fake-upgrade
//! check, and catalog-membership verification.

use std::collections::HashMap;

use windows::core::{GUID, PCWSTR};
use windows::Win32::Foundation::{HANDLE, HWND};
use windows::Win32::Security::Cryptography::Catalog::{
    CryptCATAdminAcquireContext2, CryptCATAdminEnumCatalogFromHash,
    CryptCATAdminReleaseCatalogContext, CryptCATAdminReleaseContext,
    CryptCATCatalogInfoFromContext, CATALOG_INFO,
};
use windows::Win32::Security::Cryptography::{
    CertCloseStore, CertEnumCertificatesInStore, CertGetNameStringW, CertOpenStore,
    CERT_CONTEXT, CERT_NAME_SIMPLE_DISPLAY_TYPE, CERT_OPEN_STORE_FLAGS,
    CERT_QUERY_ENCODING_TYPE, CERT_STORE_PROV_SYSTEM_W, HCERTSTORE, HCRYPTPROV_LEGACY,
};
use windows::Win32::Security::WinTrust::{
    WinVerifyTrust, WTHelperGetProvCertFromChain, WTHelperGetProvSignerFromChain,
    WTHelperProvDataFromStateData, WINTRUST_ACTION_GENERIC_VERIFY_V2, WINTRUST_CATALOG_INFO,
    WINTRUST_DATA, WINTRUST_DATA_0, WINTRUST_FILE_INFO, WTD_CACHE_ONLY_URL_RETRIEVAL,
    WTD_CHOICE_CATALOG, WTD_CHOICE_FILE, WTD_REVOKE_NONE, WTD_STATEACTION_CLOSE,
    WTD_STATEACTION_VERIFY, WTD_UI_NONE,
};

use crate::error::ScanError;
use crate::pool::WorkerPool;
use crate::signature::{sha1_of, Sha1Hash};

// Trust-service outcomes that mean "the service itself refused", as opposed
// to "this file has no valid embedded signature".
const TRUST_E_PROVIDER_UNKNOWN: i32 = 0x800B_0001u32 as i32;
const TRUST_E_ACTION_UNKNOWN: i32 = 0x800B_0002u32 as i32;

const CERT_STORE_READONLY_FLAG: u32 = 0x0000_8000;
const CERT_STORE_OPEN_EXISTING_FLAG: u32 = 0x0000_4000;
const CERT_SYSTEM_STORE_CURRENT_USER: u32 = 1 << 16;
const CERT_SYSTEM_STORE_LOCAL_MACHINE: u32 = 2 << 16;

/// Store names snapshotted for the Fake-upgrade check, enumerated for both
/// the user and machine contexts.
const SNAPSHOT_STORE_NAMES: &[&str] = &[
    "MY",
    "Root",
    "Trust",
    "CA",
    "TrustedPublisher",
    "Disallowed",
    "AuthRoot",
    "TrustedPeople",
    "ClientAuthIssuer",
    "REQUEST",
    "SmartCardRoot",
];

/// Extracted signer of a successfully-verified embedded signature.
pub struct SignerInfo {
    pub subject: String,
    pub cert_sha1: Option<Sha1Hash>,
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Verify the embedded signature of `path`.
///
/// `Ok(Some(_))` — verified, with the signing certificate's subject and hash.
/// `Ok(None)` — the file carries no valid embedded signature.
/// `Err(TrustServiceDenied)` — the service itself was unavailable.
pub fn verify_embedded(path: &str) -> Result<Option<SignerInfo>, ScanError> {
    let path_w = wide(path);
    let mut file_info = WINTRUST_FILE_INFO {
        cbStruct: std::mem::size_of::<WINTRUST_FILE_INFO>() as u32,
        pcwszFilePath: PCWSTR(path_w.as_ptr()),
        ..Default::default()
    };

    let mut data = WINTRUST_DATA {
        cbStruct: std::mem::size_of::<WINTRUST_DATA>() as u32,
        dwUIChoice: WTD_UI_NONE,
        fdwRevocationChecks: WTD_REVOKE_NONE,
        dwUnionChoice: WTD_CHOICE_FILE,
        dwStateAction: WTD_STATEACTION_VERIFY,
        dwProvFlags: WTD_CACHE_ONLY_URL_RETRIEVAL,
        Anonymous: WINTRUST_DATA_0 {
            pFile: &mut file_info,
        },
        ..Default::default()
    };

    let mut action: GUID = WINTRUST_ACTION_GENERIC_VERIFY_V2;
    let verdict = unsafe {
        WinVerifyTrust(HWND::default(), &mut action, &mut data as *mut _ as *mut _)
    };

    // Extract the signer before releasing the provider state; the close
    // below must run on every path.
    let signer = if verdict == 0 {
        extract_signer(data.hWVTStateData)
    } else {
        None
    };

    data.dwStateAction = WTD_STATEACTION_CLOSE;
    unsafe {
        WinVerifyTrust(HWND::default(), &mut action, &mut data as *mut _ as *mut _);
    }

    if verdict == 0 {
        // Verified but no certificate reachable through the chain helpers:
        // treat as an anonymous valid signer.
        return Ok(Some(signer.unwrap_or(SignerInfo {
            subject: String::new(),
            cert_sha1: None,
        })));
    }
    if verdict == TRUST_E_PROVIDER_UNKNOWN || verdict == TRUST_E_ACTION_UNKNOWN {
        return Err(ScanError::TrustServiceDenied(format!("0x{verdict:08X}")));
    }
    Ok(None)
}

fn extract_signer(state_data: HANDLE) -> Option<SignerInfo> {
    unsafe {
        let prov_data = WTHelperProvDataFromStateData(state_data);
        if prov_data.is_null() {
            return None;
        }
        let prov_signer = WTHelperGetProvSignerFromChain(prov_data, 0, false.into(), 0);
        if prov_signer.is_null() {
            return None;
        }
        let prov_cert = WTHelperGetProvCertFromChain(prov_signer, 0);
        if prov_cert.is_null() {
            return None;
        }
        let cert_ctx = (*prov_cert).pCert;
        if cert_ctx.is_null() {
            return None;
        }

        let name_len =
            CertGetNameStringW(cert_ctx, CERT_NAME_SIMPLE_DISPLAY_TYPE, 0, None, None);
        let subject = if name_len > 1 {
            let mut buf = vec![0u16; name_len as usize];
            let written =
                CertGetNameStringW(cert_ctx, CERT_NAME_SIMPLE_DISPLAY_TYPE, 0, None, Some(&mut buf));
            let end = written.saturating_sub(1) as usize;
            String::from_utf16_lossy(&buf[..end.min(buf.len())])
        } else {
            String::new()
        };

        let cert_sha1 = cert_hash(&*cert_ctx);
        Some(SignerInfo { subject, cert_sha1 })
    }
}

fn cert_hash(cert: &CERT_CONTEXT) -> Option<Sha1Hash> {
    if cert.pbCertEncoded.is_null() || cert.cbCertEncoded == 0 {
        return None;
    }
    let encoded =
        unsafe { std::slice::from_raw_parts(cert.pbCertEncoded, cert.cbCertEncoded as usize) };
    Some(sha1_of(encoded))
}

struct StoreHandle(HCERTSTORE);

impl Drop for StoreHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CertCloseStore(self.0, 0);
        }
    }
}

/// One-time snapshot of every local certificate store: certificate SHA-1 →
/// owning store name. Built once per process and read-only afterwards; the
/// enumeration releases each certificate context as it walks, so teardown
/// only closes the store handles.
pub struct StoreSnapshot {
    certs: HashMap<Sha1Hash, String>,
}

impl StoreSnapshot {
    pub fn build() -> Self {
        let mut certs = HashMap::new();
        for (context_flag, context_name) in [
            (CERT_SYSTEM_STORE_CURRENT_USER, "user"),
            (CERT_SYSTEM_STORE_LOCAL_MACHINE, "machine"),
        ] {
            for store_name in SNAPSHOT_STORE_NAMES {
                snapshot_one_store(&mut certs, context_flag, context_name, store_name);
            }
        }
        crate::perf_log(format!("[trust] store snapshot: {} certificates", certs.len()));
        Self { certs }
    }

    pub fn contains(&self, hash: &Sha1Hash) -> bool {
        self.certs.contains_key(hash)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.certs.len()
    }
}

fn snapshot_one_store(
    certs: &mut HashMap<Sha1Hash, String>,
    context_flag: u32,
    context_name: &str,
    store_name: &str,
) {
    let name_w = wide(store_name);
    let flags = CERT_OPEN_STORE_FLAGS(
        context_flag | CERT_STORE_READONLY_FLAG | CERT_STORE_OPEN_EXISTING_FLAG,
    );
    let store = match unsafe {
        CertOpenStore(
            CERT_STORE_PROV_SYSTEM_W,
            CERT_QUERY_ENCODING_TYPE(0),
            HCRYPTPROV_LEGACY(0),
            flags,
            Some(name_w.as_ptr() as *const _),
        )
    } {
        Ok(store) => StoreHandle(store),
        Err(_) => return,
    };

    let mut cert: *const CERT_CONTEXT = std::ptr::null();
    loop {
        cert = unsafe { CertEnumCertificatesInStore(store.0, Some(cert)) };
        if cert.is_null() {
            break;
        }
        if let Some(hash) = cert_hash(unsafe { &*cert }) {
            certs
                .entry(hash)
                .or_insert_with(|| format!("{context_name}\\{store_name}"));
        }
    }
}

struct CatAdmin(isize);

impl Drop for CatAdmin {
    fn drop(&mut self) {
        unsafe {
            let _ = CryptCATAdminReleaseContext(self.0, 0);
        }
    }
}

/// Verify `path` against every security catalog containing `file_hash`.
///
/// Catalog candidates are verified in parallel on the global pool; the first
/// success flips a shared flag that lets the remaining candidates exit early.
pub fn verify_against_catalogs(path: &str, file_hash: &Sha1Hash) -> bool {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let admin = {
        let mut raw: isize = 0;
        if unsafe { CryptCATAdminAcquireContext2(&mut raw, None, PCWSTR::null(), None, 0) }
            .is_err()
        {
            return false;
        }
        CatAdmin(raw)
    };

    // Collect catalog file paths containing this hash. Passing the previous
    // context back into the enumeration releases it; only the last one needs
    // an explicit release.
    let mut catalogs: Vec<String> = Vec::new();
    let mut prev: isize = 0;
    loop {
        let info =
            unsafe { CryptCATAdminEnumCatalogFromHash(admin.0, file_hash, 0, Some(&mut prev)) };
        if info == 0 {
            break;
        }
        let mut catalog_info = CATALOG_INFO {
            cbStruct: std::mem::size_of::<CATALOG_INFO>() as u32,
            ..Default::default()
        };
        if unsafe { CryptCATCatalogInfoFromContext(info, &mut catalog_info, 0) }.is_ok() {
            let len = catalog_info
                .wszCatalogFile
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(catalog_info.wszCatalogFile.len());
            catalogs.push(String::from_utf16_lossy(&catalog_info.wszCatalogFile[..len]));
        }
        prev = info;
    }
    if prev != 0 {
        unsafe {
            let _ = CryptCATAdminReleaseCatalogContext(admin.0, prev, 0);
        }
    }

    if catalogs.is_empty() {
        return false;
    }

    let member_tag = hex::encode_upper(file_hash);
    let found = Arc::new(AtomicBool::new(false));
    let pool = WorkerPool::global();

    let handles: Vec<_> = catalogs
        .into_iter()
        .map(|catalog| {
            let path = path.to_string();
            let member_tag = member_tag.clone();
            let found = Arc::clone(&found);
            pool.submit(move || {
                if found.load(Ordering::Acquire) {
                    return false;
                }
                let ok = verify_one_catalog(&catalog, &path, &member_tag);
                if ok {
                    found.store(true, Ordering::Release);
                }
                ok
            })
        })
        .collect();

    // No cancellation: drain every handle, the flag already short-circuits
    // whatever has not started yet.
    let mut signed = false;
    for handle in handles {
        if handle.join() == Some(true) {
            signed = true;
        }
    }
    signed
}

fn verify_one_catalog(catalog_path: &str, member_path: &str, member_tag: &str) -> bool {
    let catalog_w = wide(catalog_path);
    let member_w = wide(member_path);
    let tag_w = wide(member_tag);

    let mut catalog_info = WINTRUST_CATALOG_INFO {
        cbStruct: std::mem::size_of::<WINTRUST_CATALOG_INFO>() as u32,
        pcwszCatalogFilePath: PCWSTR(catalog_w.as_ptr()),
        pcwszMemberTag: PCWSTR(tag_w.as_ptr()),
        pcwszMemberFilePath: PCWSTR(member_w.as_ptr()),
        ..Default::default()
    };

    let mut data = WINTRUST_DATA {
        cbStruct: std::mem::size_of::<WINTRUST_DATA>() as u32,
        dwUIChoice: WTD_UI_NONE,
        fdwRevocationChecks: WTD_REVOKE_NONE,
        dwUnionChoice: WTD_CHOICE_CATALOG,
        dwStateAction: WTD_STATEACTION_VERIFY,
        dwProvFlags: WTD_CACHE_ONLY_URL_RETRIEVAL,
        Anonymous: WINTRUST_DATA_0 {
            pCatalog: &mut catalog_info,
        },
        ..Default::default()
    };

    let mut action: GUID = WINTRUST_ACTION_GENERIC_VERIFY_V2;
    let verdict = unsafe {
        WinVerifyTrust(HWND::default(), &mut action, &mut data as *mut _ as *mut _)
    };

    data.dwStateAction = WTD_STATEACTION_CLOSE;
    unsafe {
        WinVerifyTrust(HWND::default(), &mut action, &mut data as *mut _ as *mut _);
    }

    verdict == 0
}
