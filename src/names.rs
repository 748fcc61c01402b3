//! Name normalization and main-executable matching.
//!
//! Trace filenames encode the launched binary as `EXE-HASH.pf`; the stem
//! before the first `-` is matched against the basenames of the referenced
//! paths to recover the full executable path.

/// Lowercase a name and strip everything that is not ASCII alphanumeric.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Extract the executable stem from an artifact filename or path.
/// `NOTEPAD.EXE-D8414F97.pf` → `NOTEPAD.EXE`.
pub fn stem_from_artifact(filename: &str) -> &str {
    let base = filename
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(filename);
    match base.find('-') {
        Some(pos) => &base[..pos],
        None => base,
    }
}

/// Pick the referenced path whose basename best matches the artifact stem.
///
/// Score is the common-prefix length of the normalized names, plus 2 when the
/// normalized stem occurs anywhere inside the normalized basename. Ties keep
/// the first occurrence; a best score of zero means no match.
pub fn best_match<'a>(stem: &str, paths: &'a [String]) -> Option<&'a str> {
    let stem_norm = normalize(stem);
    if paths.is_empty() {
        return None;
    }

    let mut best: Option<(&str, usize)> = None;
    for full_path in paths {
        let base = full_path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(full_path.as_str());
        let base_norm = normalize(base);

        let mut score = stem_norm
            .bytes()
            .zip(base_norm.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        if !stem_norm.is_empty() && base_norm.contains(&stem_norm) {
            score += 2;
        }

        match best {
            Some((_, prev)) if prev >= score => {}
            _ => best = Some((full_path.as_str(), score)),
        }
    }

    match best {
        Some((_, 0)) | None => None,
        Some((path, _)) => Some(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_lowercases() {
        assert_eq!(normalize("NOTEPAD.EXE"), "notepadexe");
        assert_eq!(normalize("auto-clicker_v2"), "autoclickerv2");
        assert_eq!(normalize("..."), "");
    }

    #[test]
    fn stem_takes_prefix_before_first_dash() {
        assert_eq!(stem_from_artifact("NOTEPAD.EXE-D8414F97.pf"), "NOTEPAD.EXE");
        assert_eq!(
            stem_from_artifact("C:\\Windows\\Prefetch\\CMD.EXE-0B8C2A15.pf"),
            "CMD.EXE"
        );
        // No dash: the whole basename is the stem.
        assert_eq!(stem_from_artifact("WEIRD.pf"), "WEIRD.pf");
    }

    #[test]
    fn best_match_prefers_longest_prefix() {
        let paths = vec![
            "C:\\Windows\\System32\\ntdll.dll".to_string(),
            "C:\\Windows\\System32\\notepad.exe".to_string(),
        ];
        assert_eq!(
            best_match("NOTEPAD.EXE", &paths),
            Some("C:\\Windows\\System32\\notepad.exe")
        );
    }

    #[test]
    fn best_match_substring_bonus_breaks_prefix_ties() {
        // Both share no prefix with the stem, but one contains it.
        let paths = vec![
            "C:\\Tools\\launcher.exe".to_string(),
            "C:\\Tools\\my-notepad.exe".to_string(),
        ];
        assert_eq!(
            best_match("NOTEPAD", &paths),
            Some("C:\\Tools\\my-notepad.exe")
        );
    }

    #[test]
    fn best_match_tie_keeps_first() {
        let paths = vec![
            "C:\\a\\app.exe".to_string(),
            "C:\\b\\app.exe".to_string(),
        ];
        assert_eq!(best_match("APP.EXE", &paths), Some("C:\\a\\app.exe"));
    }

    #[test]
    fn best_match_zero_score_is_none() {
        let paths = vec!["C:\\Windows\\System32\\kernel32.dll".to_string()];
        assert_eq!(best_match("ZZZZ", &paths), None);
        assert_eq!(best_match("ZZZZ", &[]), None);
    }
}
