//! Interactive-logon timestamp for the current user, used as the after-logon
//! cutoff when filtering journal and event-log records.

use windows::Win32::Foundation::LUID;
use windows::Win32::Security::Authentication::Identity::{
    LsaEnumerateLogonSessions, LsaFreeReturnBuffer, LsaGetLogonSessionData,
    SECURITY_LOGON_SESSION_DATA,
};

use crate::artifact::filetime_to_unix;

const LOGON_TYPE_INTERACTIVE: u32 = 2;

/// Unix timestamp of the current user's interactive logon, or `None` when the
/// session enumeration is unavailable.
pub fn interactive_logon_time() -> Option<i64> {
    let username = std::env::var("USERNAME").ok()?;

    let mut count: u32 = 0;
    let mut sessions: *mut LUID = std::ptr::null_mut();
    let status = unsafe { LsaEnumerateLogonSessions(&mut count, &mut sessions) };
    if status.0 != 0 || sessions.is_null() {
        return None;
    }

    let mut result = None;
    for i in 0..count as isize {
        let luid = unsafe { sessions.offset(i) };
        let mut data: *mut SECURITY_LOGON_SESSION_DATA = std::ptr::null_mut();
        let status = unsafe { LsaGetLogonSessionData(luid, &mut data) };
        if status.0 != 0 || data.is_null() {
            continue;
        }

        let session = unsafe { &*data };
        let session_user = unsafe {
            let name = session.UserName;
            if name.Buffer.is_null() {
                String::new()
            } else {
                String::from_utf16_lossy(std::slice::from_raw_parts(
                    name.Buffer.0,
                    (name.Length / 2) as usize,
                ))
            }
        };

        if session.LogonType == LOGON_TYPE_INTERACTIVE
            && session_user.eq_ignore_ascii_case(&username)
        {
            result = Some(filetime_to_unix(session.LogonTime as u64));
        }

        unsafe {
            let _ = LsaFreeReturnBuffer(data as *const _);
        }
        if result.is_some() {
            break;
        }
    }

    unsafe {
        let _ = LsaFreeReturnBuffer(sessions as *const _);
    }
    result
}
