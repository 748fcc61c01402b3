//! System decompression service for the compressed artifact variant.
//!
//! `RtlDecompressBufferEx` and `RtlGetCompressionWorkSpaceSize` are ntdll
//! exports with no import-library surface, so they are bound dynamically.

use windows::core::s;
use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

use crate::artifact::MamHeader;
use crate::error::ScanError;

type RtlGetCompressionWorkSpaceSizeFn =
    unsafe extern "system" fn(u16, *mut u32, *mut u32) -> i32;
type RtlDecompressBufferExFn = unsafe extern "system" fn(
    u16,
    *mut u8,
    u32,
    *const u8,
    u32,
    *mut u32,
    *mut core::ffi::c_void,
) -> i32;

struct DecompressionService {
    workspace_size: RtlGetCompressionWorkSpaceSizeFn,
    decompress: RtlDecompressBufferExFn,
}

fn service() -> Result<&'static DecompressionService, ScanError> {
    use std::sync::OnceLock;
    static SERVICE: OnceLock<Option<DecompressionService>> = OnceLock::new();

    SERVICE
        .get_or_init(|| unsafe {
            let ntdll = GetModuleHandleA(s!("ntdll.dll")).ok()?;
            let workspace_size = GetProcAddress(ntdll, s!("RtlGetCompressionWorkSpaceSize"))?;
            let decompress = GetProcAddress(ntdll, s!("RtlDecompressBufferEx"))?;
            Some(DecompressionService {
                workspace_size: std::mem::transmute::<
                    _,
                    RtlGetCompressionWorkSpaceSizeFn,
                >(workspace_size),
                decompress: std::mem::transmute::<_, RtlDecompressBufferExFn>(decompress),
            })
        })
        .as_ref()
        .ok_or_else(|| {
            ScanError::DecompressionFailed("decompression service not available".to_string())
        })
}

/// Decompress a `MAM`-preambled artifact. The format nibble from the
/// preamble is passed verbatim to the decompression service.
pub fn decompress_mam(raw: &[u8]) -> Result<Vec<u8>, ScanError> {
    let header = MamHeader::parse(raw).ok_or(ScanError::UnsupportedFormat)?;
    let payload = &raw[8..];
    let svc = service()?;

    let format = header.format as u16;
    let mut ws_buffer: u32 = 0;
    let mut ws_fragment: u32 = 0;
    let status = unsafe { (svc.workspace_size)(format, &mut ws_buffer, &mut ws_fragment) };
    if status != 0 {
        return Err(ScanError::DecompressionFailed(format!(
            "workspace query rejected format {format}: 0x{status:08X}"
        )));
    }

    let mut workspace = vec![0u8; ws_buffer as usize];
    let mut out = vec![0u8; header.decompressed_size as usize];
    let mut final_size: u32 = 0;

    let status = unsafe {
        (svc.decompress)(
            format,
            out.as_mut_ptr(),
            out.len() as u32,
            payload.as_ptr(),
            payload.len() as u32,
            &mut final_size,
            if workspace.is_empty() {
                std::ptr::null_mut()
            } else {
                workspace.as_mut_ptr() as *mut _
            },
        )
    };
    if status != 0 {
        return Err(ScanError::DecompressionFailed(format!(
            "RtlDecompressBufferEx: 0x{status:08X}"
        )));
    }

    out.truncate(final_size as usize);
    Ok(out)
}
