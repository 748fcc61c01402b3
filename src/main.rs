//! pfview — forensic inspector for the Windows prefetch store.
//!
//! Decodes every trace artifact in `<windir>\Prefetch`, resolves the trust
//! status of each referenced file, replays the NTFS change journal for
//! post-logon tampering with the store, and reports service/driver state.

use std::sync::OnceLock;

use clap::{Parser, Subcommand, ValueEnum};

mod artifact;
mod drives;
mod error;
mod journal;
mod names;
mod pool;
mod report;
mod rules;
mod scan;
mod signature;
#[cfg(target_os = "windows")]
mod win;

use artifact::ArtifactRecord;

static PERF_LOG_ENABLED: OnceLock<bool> = OnceLock::new();

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn perf_log_enabled() -> bool {
    *PERF_LOG_ENABLED.get_or_init(|| env_truthy("PFVIEW_PERF_LOG"))
}

pub(crate) fn perf_log(message: impl AsRef<str>) {
    if perf_log_enabled() {
        eprintln!("[perf] {}", message.as_ref());
    }
}

#[derive(Parser)]
#[command(name = "pfview", version, about = "Prefetch trace-store inspector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Decode and classify every artifact in the prefetch directory.
    Scan {
        /// Emit records as JSON instead of text lines.
        #[arg(long)]
        json: bool,
        /// Display order of the results.
        #[arg(long, value_enum, default_value = "time")]
        sort: SortKey,
    },
    /// Replay the change journal for post-logon deletions and renames.
    Journal {
        #[arg(long)]
        json: bool,
    },
    /// Print the environment trust-status report.
    Status,
    /// Scan, then journal, then status.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SortKey {
    /// Most recent execution first.
    Time,
    /// Grouped by trust classification, worst-off groups last.
    Signature,
    /// Artifact filename.
    Name,
}

#[allow(dead_code)]
fn sort_records(records: &mut [ArtifactRecord], key: SortKey) {
    match key {
        SortKey::Time => records.sort_by_key(|r| {
            std::cmp::Reverse(r.execution_times.first().copied().unwrap_or(0))
        }),
        SortKey::Signature => {
            records.sort_by_key(|r| (r.main_signature.display_rank(), r.source_name.clone()))
        }
        SortKey::Name => records.sort_by(|a, b| a.source_name.cmp(&b.source_name)),
    }
}

#[allow(dead_code)]
fn record_line(record: &ArtifactRecord) -> String {
    let when = record
        .execution_times
        .first()
        .map(|t| report::format_local_time(*t))
        .unwrap_or_else(|| "N/A".to_string());
    let path = if record.main_executable_path.is_empty() {
        record.source_name.as_str()
    } else {
        record.main_executable_path.as_str()
    };
    let mut line = format!(
        "{when}  [{:>8}]  v{:<2} runs={:<3} {path}",
        record.main_signature.as_str(),
        record.format_version,
        record.run_count,
    );
    if !record.matched_rules.is_empty() {
        line.push_str(&format!("  rules={}", record.matched_rules.join(",")));
    }
    line
}

fn main() {
    let cli = Cli::parse();
    perf_log("pfview starting");

    #[cfg(not(target_os = "windows"))]
    {
        let _ = cli;
        eprintln!("pfview inspects the Windows prefetch store and requires Windows.");
        std::process::exit(1);
    }

    #[cfg(target_os = "windows")]
    {
        if !win::privilege::enable_debug_privilege() {
            eprintln!("[ERROR] {}", error::ScanError::PrivilegeNotAvailable);
            std::process::exit(1);
        }

        match cli.command.unwrap_or(Command::All) {
            Command::Scan { json, sort } => run_scan(json, sort),
            Command::Journal { json } => run_journal(json),
            Command::Status => run_status(),
            Command::All => {
                run_scan(false, SortKey::Time);
                println!();
                run_journal(false);
                println!();
                run_status();
            }
        }
    }
}

#[cfg(target_os = "windows")]
fn run_scan(json: bool, sort: SortKey) {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    let ctx = signature::ScanContext::new();
    let progress = Arc::new(scan::ScanProgress::default());
    let done = Arc::new(AtomicBool::new(false));

    // Progress ticker on stderr while the scan runs.
    let ticker = (!json).then(|| {
        let progress = Arc::clone(&progress);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            loop {
                if done.load(Ordering::Acquire) {
                    break;
                }
                let snap = progress.snapshot();
                if snap.in_progress {
                    eprint!("\r[scan] {}/{} {}", snap.processed, snap.total, snap.current_path);
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            eprint!("\r");
        })
    });

    let mut records = scan::scan(&ctx, &progress);
    done.store(true, Ordering::Release);
    if let Some(handle) = ticker {
        let _ = handle.join();
    }

    sort_records(&mut records, sort);

    if json {
        match serde_json::to_string_pretty(&records) {
            Ok(body) => println!("{body}"),
            Err(err) => eprintln!("[scan] serialization failed: {err}"),
        }
        return;
    }

    for record in &records {
        println!("{}", record_line(record));
    }
    println!("\n{} artifacts", records.len());
}

#[cfg(target_os = "windows")]
fn run_journal(json: bool) {
    let events = match journal::read_events() {
        Ok(events) => events,
        Err(err) => {
            eprintln!("[journal] {err}");
            Vec::new()
        }
    };

    if json {
        match serde_json::to_string_pretty(&events) {
            Ok(body) => println!("{body}"),
            Err(err) => eprintln!("[journal] serialization failed: {err}"),
        }
        return;
    }

    if events.is_empty() {
        println!("No post-logon prefetch journal activity.");
        return;
    }
    for event in &events {
        let when = report::format_local_time(event.timestamp);
        if event.new_name.is_empty() {
            println!("{when}  {:<26} {}", event.action.as_str(), event.old_name);
        } else {
            println!(
                "{when}  {:<26} {} -> {}",
                event.action.as_str(),
                event.old_name,
                event.new_name
            );
        }
    }
}

#[cfg(target_os = "windows")]
fn run_status() {
    print!("{}", report::status_report());
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifact::SignatureStatus;

    fn record(name: &str, time: Option<i64>, sig: SignatureStatus) -> ArtifactRecord {
        ArtifactRecord {
            source_name: name.to_string(),
            source_path: format!("C:\\Windows\\Prefetch\\{name}"),
            format_version: 30,
            format_magic: "SCCA".into(),
            declared_size: 0,
            run_count: 2,
            main_executable_path: String::new(),
            referenced_paths: vec![],
            execution_times: time.into_iter().collect(),
            main_signature: sig,
            referenced_signatures: vec![],
            matched_rules: vec![],
        }
    }

    #[test]
    fn time_sort_puts_latest_first() {
        let mut records = vec![
            record("A.pf", Some(100), SignatureStatus::Signed),
            record("B.pf", Some(300), SignatureStatus::Signed),
            record("C.pf", None, SignatureStatus::Signed),
        ];
        sort_records(&mut records, SortKey::Time);
        let names: Vec<_> = records.iter().map(|r| r.source_name.as_str()).collect();
        assert_eq!(names, vec!["B.pf", "A.pf", "C.pf"]);
    }

    #[test]
    fn signature_sort_groups_by_severity() {
        let mut records = vec![
            record("A.pf", None, SignatureStatus::NotFound),
            record("B.pf", None, SignatureStatus::Cheat),
            record("C.pf", None, SignatureStatus::Signed),
        ];
        sort_records(&mut records, SortKey::Signature);
        let sigs: Vec<_> = records.iter().map(|r| r.main_signature).collect();
        assert_eq!(
            sigs,
            vec![
                SignatureStatus::Signed,
                SignatureStatus::Cheat,
                SignatureStatus::NotFound
            ]
        );
    }

    #[test]
    fn record_line_mentions_rules_when_present() {
        let mut r = record("A.pf", Some(1_704_164_645), SignatureStatus::Cheat);
        r.main_executable_path = "C:\\Tools\\clicker.exe".into();
        r.matched_rules = vec!["STRINGS".into()];
        let line = record_line(&r);
        assert!(line.contains("C:\\Tools\\clicker.exe"));
        assert!(line.contains("rules=STRINGS"));
        assert!(line.contains("Cheat"));
    }

    #[test]
    fn record_line_falls_back_to_source_name() {
        let r = record("GONE.EXE-12345678.pf", None, SignatureStatus::NotFound);
        let line = record_line(&r);
        assert!(line.contains("GONE.EXE-12345678.pf"));
        assert!(line.starts_with("N/A"));
    }
}
