//! Volume-serial to drive-letter resolution.
//!
//! Recorded paths inside trace artifacts start with a `\VOLUME{...-HHHHHHHH}`
//! token instead of a drive letter; `HHHHHHHH` is the volume serial in hex.
//! The present-drive mapping is enumerated once per process and reused.

use std::sync::OnceLock;

const VOLUME_PREFIX: &str = "\\VOLUME{";

/// Immutable `volume serial → drive prefix` mapping ("C:" style, no slash).
#[derive(Debug, Default)]
pub struct VolumeMap {
    entries: Vec<(u32, String)>,
}

static SYSTEM_VOLUMES: OnceLock<VolumeMap> = OnceLock::new();

impl VolumeMap {
    pub fn from_entries(entries: Vec<(u32, String)>) -> Self {
        Self { entries }
    }

    /// The process-wide mapping, enumerated on first use.
    pub fn system() -> &'static VolumeMap {
        SYSTEM_VOLUMES.get_or_init(|| {
            #[cfg(target_os = "windows")]
            {
                Self::detect()
            }
            #[cfg(not(target_os = "windows"))]
            {
                Self::default()
            }
        })
    }

    /// Enumerate present drives via the logical-drive bitmask and read each
    /// volume's serial number. Drives that refuse the query are skipped.
    #[cfg(target_os = "windows")]
    pub fn detect() -> Self {
        use windows::core::PCWSTR;
        use windows::Win32::Storage::FileSystem::{GetLogicalDrives, GetVolumeInformationW};

        let mut entries = Vec::new();
        let mask = unsafe { GetLogicalDrives() };
        if mask == 0 {
            return Self { entries };
        }

        for i in 0..26u32 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let letter = (b'A' + i as u8) as char;
            let root: Vec<u16> = format!("{letter}:\\")
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            let mut serial: u32 = 0;
            let ok = unsafe {
                GetVolumeInformationW(
                    PCWSTR(root.as_ptr()),
                    None,
                    Some(&mut serial),
                    None,
                    None,
                    None,
                )
            };
            if ok.is_ok() {
                entries.push((serial, format!("{letter}:")));
            }
        }

        Self { entries }
    }

    pub fn drive_for_serial(&self, serial: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(s, _)| *s == serial)
            .map(|(_, drive)| drive.as_str())
    }

    /// Rewrite a leading volume token into its present drive prefix.
    ///
    /// Returns the rewritten path and the drive it mapped to. Paths without a
    /// token, with a malformed token, or with an unknown serial pass through
    /// unchanged. Re-applying to an already-rewritten path is a no-op.
    pub fn resolve(&self, path: &str) -> (String, Option<String>) {
        let Some(start) = path.find(VOLUME_PREFIX) else {
            return (path.to_string(), None);
        };
        let Some(end_rel) = path[start..].find('}') else {
            return (path.to_string(), None);
        };
        let end = start + end_rel;

        let token = &path[start..end];
        let Some(dash) = token.rfind('-') else {
            return (path.to_string(), None);
        };
        let serial_str = &token[dash + 1..];
        let Ok(serial) = u32::from_str_radix(serial_str, 16) else {
            return (path.to_string(), None);
        };

        match self.drive_for_serial(serial) {
            Some(drive) => {
                let mut rewritten =
                    String::with_capacity(path.len() - (end - start) + drive.len());
                rewritten.push_str(&path[..start]);
                rewritten.push_str(drive);
                rewritten.push_str(&path[end + 1..]);
                (rewritten, Some(drive.to_string()))
            }
            None => (path.to_string(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> VolumeMap {
        VolumeMap::from_entries(vec![
            (0xA1B2_C3D4, "C:".to_string()),
            (0x1122_3344, "D:".to_string()),
        ])
    }

    #[test]
    fn rewrites_known_serial() {
        let (path, drive) = map().resolve(
            "\\VOLUME{01d0c6f5-a1b2c3d4}\\Windows\\System32\\notepad.exe",
        );
        assert_eq!(path, "C:\\Windows\\System32\\notepad.exe");
        assert_eq!(drive.as_deref(), Some("C:"));
    }

    #[test]
    fn unknown_serial_passes_through() {
        let original = "\\VOLUME{01d0c6f5-deadbeef}\\Windows\\win.ini";
        let (path, drive) = map().resolve(original);
        assert_eq!(path, original);
        assert_eq!(drive, None);
    }

    #[test]
    fn malformed_token_passes_through() {
        let no_brace = "\\VOLUME{01d0c6f5-a1b2c3d4\\Windows\\win.ini";
        assert_eq!(map().resolve(no_brace).0, no_brace);

        let no_dash = "\\VOLUME{a1b2c3d4}\\Windows\\win.ini";
        assert_eq!(map().resolve(no_dash).0, no_dash);

        let bad_hex = "\\VOLUME{01d0-zzzz}\\Windows\\win.ini";
        assert_eq!(map().resolve(bad_hex).0, bad_hex);
    }

    #[test]
    fn resolve_is_idempotent() {
        let (once, _) = map().resolve(
            "\\VOLUME{01d0c6f5-a1b2c3d4}\\Windows\\System32\\notepad.exe",
        );
        let (twice, drive) = map().resolve(&once);
        assert_eq!(once, twice);
        assert_eq!(drive, None);
    }

    #[test]
    fn plain_path_untouched() {
        let (path, drive) = map().resolve("C:\\Windows\\explorer.exe");
        assert_eq!(path, "C:\\Windows\\explorer.exe");
        assert_eq!(drive, None);
    }
}
