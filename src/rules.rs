//! Content-pattern rules for unsigned binaries.
//!
//! The adapter exposes a single file-scan entry point and a process-wide
//! already-scanned set. The built-in engine matches literal patterns
//! case-insensitively in both ASCII and UTF-16LE encodings; a rule fires when
//! every pattern group hits at least once and the total occurrence count
//! reaches the rule's threshold.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use parking_lot::Mutex;

struct RuleDef {
    id: &'static str,
    /// Every group must produce at least one hit.
    groups: &'static [&'static [&'static str]],
    /// Total occurrences (across all groups) required to fire.
    min_total: usize,
}

const STRINGS_PATTERNS: &[&str] = &[
    "autoclicker",
    "click interval",
    "start clicking",
    "stop clicking",
    "mouse_event",
];

const CSHARP_DOTNET: &[&str] = &[
    "mscorlib",
    "system.windows.forms",
    "system.threading",
    "system.reflection",
    "system.runtime.interopservices",
];

const CSHARP_INPUT: &[&str] = &["sendinput", "mouse_event", "setcursorpos", "keybd_event"];

const CSHARP_CLICKER: &[&str] = &[
    "autoclicker",
    "mouseclicker",
    "clickinterval",
    "startclicking",
    "clickspersecond",
];

const CHEAT_PATTERNS: &[&str] = &[
    "slinky_library.dll",
    "vape.gg",
    "slinky.gg",
    "vape launcher",
    "dream-injector",
    "vroomclicker",
    "dopeclicker",
    "sapphire lite clicker",
    "unicorn client",
    "lithiumclient.wtf",
    "net/ccbluex/liquidbounce",
    "com/riseclient/main.class",
];

const RULES: &[RuleDef] = &[
    RuleDef {
        id: "STRINGS",
        groups: &[STRINGS_PATTERNS],
        min_total: 3,
    },
    RuleDef {
        id: "CSHARP",
        groups: &[CSHARP_DOTNET, CSHARP_INPUT, CSHARP_CLICKER],
        min_total: 3,
    },
    RuleDef {
        id: "CHEAT",
        groups: &[CHEAT_PATTERNS],
        min_total: 1,
    },
];

/// Compiled rule set plus the rescan-suppression set.
pub struct RuleSet {
    scanned: Mutex<HashSet<String>>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            scanned: Mutex::new(HashSet::new()),
        }
    }

    /// Scan one file and return the identifiers of every rule that fired.
    /// A path is scanned at most once per process; repeats return nothing.
    pub fn scan_file(&self, path: &str) -> Vec<String> {
        {
            let mut scanned = self.scanned.lock();
            if !scanned.insert(path.to_string()) {
                return Vec::new();
            }
        }

        let Ok(contents) = fs::read(Path::new(path)) else {
            return Vec::new();
        };
        match_rules(&contents)
    }
}

/// Evaluate every rule against a byte buffer.
pub fn match_rules(contents: &[u8]) -> Vec<String> {
    let lowered = ascii_lowercase(contents);
    let mut matched = Vec::new();

    for rule in RULES {
        let mut total = 0usize;
        let mut all_groups_hit = true;
        for group in rule.groups {
            let mut group_hits = 0usize;
            for pattern in *group {
                group_hits += count_occurrences(&lowered, pattern.as_bytes());
                group_hits += count_occurrences(&lowered, &widen(pattern));
            }
            if group_hits == 0 {
                all_groups_hit = false;
                break;
            }
            total += group_hits;
        }
        if all_groups_hit && total >= rule.min_total {
            matched.push(rule.id.to_string());
        }
    }
    matched
}

fn ascii_lowercase(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.to_ascii_lowercase()).collect()
}

/// UTF-16LE rendering of an ASCII pattern.
fn widen(pattern: &str) -> Vec<u8> {
    let mut wide = Vec::with_capacity(pattern.len() * 2);
    for b in pattern.bytes() {
        wide.push(b);
        wide.push(0);
    }
    wide
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    let mut count = 0;
    let mut pos = 0;
    while pos + needle.len() <= haystack.len() {
        if &haystack[pos..pos + needle.len()] == needle {
            count += 1;
            pos += needle.len();
        } else {
            pos += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn strings_rule_needs_three_total_hits() {
        let two = b"AutoClicker ... AutoClicker".to_vec();
        assert!(match_rules(&two).is_empty());

        let three = b"AutoClicker AutoClicker AutoClicker".to_vec();
        assert_eq!(match_rules(&three), vec!["STRINGS".to_string()]);
    }

    #[test]
    fn strings_rule_counts_distinct_patterns() {
        let mixed = b"Click Interval / Start Clicking / mouse_event".to_vec();
        assert_eq!(match_rules(&mixed), vec!["STRINGS".to_string()]);
    }

    #[test]
    fn wide_encoding_matches() {
        let mut wide = Vec::new();
        for _ in 0..3 {
            for b in b"AutoClicker " {
                wide.push(*b);
                wide.push(0);
            }
        }
        assert_eq!(match_rules(&wide), vec!["STRINGS".to_string()]);
    }

    #[test]
    fn csharp_rule_requires_every_group() {
        // .NET + input groups hit, clicker group missing.
        let partial = b"mscorlib SendInput SendInput".to_vec();
        assert!(match_rules(&partial).is_empty());

        let full = b"mscorlib SendInput AutoClicker".to_vec();
        assert!(match_rules(&full).contains(&"CSHARP".to_string()));
    }

    #[test]
    fn cheat_rule_fires_on_single_hit() {
        let buf = b"... vape.gg ...".to_vec();
        assert_eq!(match_rules(&buf), vec!["CHEAT".to_string()]);
    }

    #[test]
    fn scan_file_suppresses_rescans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"AutoClicker AutoClicker AutoClicker").unwrap();
        drop(f);

        let rules = RuleSet::new();
        let p = path.to_string_lossy().to_string();
        assert_eq!(rules.scan_file(&p), vec!["STRINGS".to_string()]);
        assert!(rules.scan_file(&p).is_empty());
    }

    #[test]
    fn unreadable_file_matches_nothing() {
        let rules = RuleSet::new();
        assert!(rules.scan_file("Z:\\no\\such\\file.bin").is_empty());
    }
}
