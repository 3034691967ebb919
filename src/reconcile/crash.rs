//! Crash inference from the tail of a service's last log.

use regex::RegexSet;
use serde::Serialize;

use crate::registry::ManagedService;
use crate::supervisor::{ProcessControl, Supervisor, SupervisorError};

/// Default number of trailing log lines inspected.
pub const DEFAULT_TAIL_LINES: usize = 12;

pub const NO_DIAGNOSTICS: &str = "no diagnostic information";
pub const NO_LOGS: &str = "no logs captured for last run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashCategory {
    AbruptTermination,
    UnhandledException,
    AddressInUse,
    ExplicitError,
}

/// Keyword groups in priority order; a line matching several groups is
/// attributed to the first.
const KEYWORDS: &[(CrashCategory, &[&str])] = &[
    (
        CrashCategory::AbruptTermination,
        &["panic", "fatal", "segmentation fault", "killed"],
    ),
    (CrashCategory::UnhandledException, &["exception", "traceback"]),
    (
        CrashCategory::AddressInUse,
        &["eaddrinuse", "address already in use"],
    ),
    (CrashCategory::ExplicitError, &["error:", "exit status"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrashReason {
    Keyword { category: CrashCategory, line: String },
    LastLine { line: String },
    NoDiagnostics,
    NoLogs,
}

impl CrashReason {
    pub fn message(&self) -> &str {
        match self {
            Self::Keyword { line, .. } | Self::LastLine { line } => line,
            Self::NoDiagnostics => NO_DIAGNOSTICS,
            Self::NoLogs => NO_LOGS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashReport {
    pub reason: CrashReason,
    pub log_excerpt: Vec<String>,
}

pub struct CrashClassifier {
    set: Option<RegexSet>,
    categories: Vec<CrashCategory>,
}

impl Default for CrashClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashClassifier {
    pub fn new() -> Self {
        let mut patterns = Vec::new();
        let mut categories = Vec::new();
        for (category, words) in KEYWORDS {
            for word in *words {
                patterns.push(format!("(?i){}", regex::escape(word)));
                categories.push(*category);
            }
        }

        let set = match RegexSet::new(&patterns) {
            Ok(set) => Some(set),
            Err(e) => {
                tracing::warn!("Crash keyword set failed to compile: {}", e);
                None
            }
        };
        Self { set, categories }
    }

    /// Highest-priority keyword group matched by `line`.
    pub fn category(&self, line: &str) -> Option<CrashCategory> {
        let set = self.set.as_ref()?;
        set.matches(line)
            .iter()
            .next()
            .and_then(|idx| self.categories.get(idx).copied())
    }

    /// Newest keyword line, else the newest non-blank line, else the
    /// no-diagnostics sentinel. `lines` is oldest first.
    pub fn infer(&self, lines: &[String]) -> CrashReason {
        for line in lines.iter().rev() {
            if let Some(category) = self.category(line) {
                return CrashReason::Keyword {
                    category,
                    line: line.trim().to_string(),
                };
            }
        }

        match lines.iter().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => CrashReason::LastLine {
                line: line.trim().to_string(),
            },
            None => CrashReason::NoDiagnostics,
        }
    }

    /// Crash report for a service whose recorded run is no longer alive.
    pub fn report<C: ProcessControl>(
        &self,
        service: &ManagedService,
        supervisor: &Supervisor<C>,
        tail_lines: usize,
    ) -> CrashReport {
        match supervisor.tail(&service.name, tail_lines) {
            Ok(lines) => CrashReport {
                reason: self.infer(&lines),
                log_excerpt: lines,
            },
            Err(SupervisorError::NoLogs(_)) => CrashReport {
                reason: CrashReason::NoLogs,
                log_excerpt: Vec::new(),
            },
            Err(e) => {
                tracing::warn!("Cannot read logs of '{}': {}", service.name, e);
                CrashReport {
                    reason: CrashReason::NoDiagnostics,
                    log_excerpt: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn lines(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_panic_line_wins_over_later_noise() {
        let c = CrashClassifier::new();
        let log = lines(&[
            "listening on :3000",
            "thread 'main' panicked at src/main.rs:10:5",
            "note: run with `RUST_BACKTRACE=1`",
        ]);
        assert_eq!(
            c.infer(&log),
            CrashReason::Keyword {
                category: CrashCategory::AbruptTermination,
                line: "thread 'main' panicked at src/main.rs:10:5".into(),
            }
        );
    }

    #[test]
    fn test_newest_keyword_line_is_chosen() {
        let c = CrashClassifier::new();
        let log = lines(&["Error: first", "Traceback (most recent call last):", "done"]);
        let reason = c.infer(&log);
        assert_eq!(reason.message(), "Traceback (most recent call last):");
    }

    #[test]
    fn test_group_priority_within_one_line() {
        let c = CrashClassifier::new();
        assert_eq!(
            c.category("Error: listen EADDRINUSE: address already in use :::3000"),
            Some(CrashCategory::AddressInUse)
        );
        assert_eq!(c.category("FATAL exception"), Some(CrashCategory::AbruptTermination));
        assert_eq!(c.category("all good"), None);
    }

    #[test]
    fn test_falls_back_to_last_non_blank_line() {
        let c = CrashClassifier::new();
        let log = lines(&["starting", "  shutting down  ", "", "   "]);
        assert_eq!(
            c.infer(&log),
            CrashReason::LastLine {
                line: "shutting down".into()
            }
        );
    }

    #[test]
    fn test_empty_log_has_no_diagnostics() {
        let c = CrashClassifier::new();
        assert_eq!(c.infer(&[]), CrashReason::NoDiagnostics);
        assert_eq!(c.infer(&lines(&["", " "])).message(), NO_DIAGNOSTICS);
    }

    #[test]
    fn test_report_distinguishes_missing_logs() {
        let dir = TempDir::new().unwrap();
        let sup = Supervisor::new(dir.path());
        let svc = ManagedService::new("api", dir.path(), "npm start", &[]);

        let report = CrashClassifier::new().report(&svc, &sup, DEFAULT_TAIL_LINES);
        assert_eq!(report.reason, CrashReason::NoLogs);
        assert_eq!(report.reason.message(), NO_LOGS);

        fs::create_dir_all(dir.path().join("api")).unwrap();
        fs::write(dir.path().join("api/2026-10-18T09-00-00.000.log"), "").unwrap();
        let report = CrashClassifier::new().report(&svc, &sup, DEFAULT_TAIL_LINES);
        assert_eq!(report.reason, CrashReason::NoDiagnostics);
    }
}
