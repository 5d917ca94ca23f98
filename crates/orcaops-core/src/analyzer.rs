//! Log analysis over captured step output.
//!
//! Extracts error and warning lines plus the first stack trace (Python,
//! Node, Go, Java) and builds the one-line run summary attached to the run
//! record.

use crate::types::{JobStatus, RunRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ERROR_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|exception|fatal|panic|traceback|segfault|assertion failed)\b").unwrap()
});

static WARNING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(warn|warning|deprecated)\b").unwrap());

/// Head of a stack trace and the continuation shape that follows it.
static TRACE_HEADS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("python", Regex::new(r"^Traceback \(most recent call last\):").unwrap()),
        ("go", Regex::new(r"^panic: ").unwrap()),
        ("go", Regex::new(r"^goroutine \d+ \[").unwrap()),
        ("java", Regex::new(r"^Exception in thread ").unwrap()),
        ("java", Regex::new(r"^[\w.$]+(Exception|Error)(: .*)?$").unwrap()),
        ("node", Regex::new(r"^\w*Error: ").unwrap()),
    ]
});

static TRACE_CONTINUATION: Lazy<Regex> = Lazy::new(|| {
    // Indented frames (Python/Node/Java), tabbed Go file lines, bare Go
    // call frames, chained Java causes, and the closing exception line of a
    // Python traceback.
    Regex::new(
        r"^(\s+at .+|\s+File .+|\s+\S.*|\t.+|Caused by: .+|goroutine \d+ \[.*|[\w.$/]+\(.*\)|[\w.$]*(Error|Exception)(: .*)?)$",
    )
    .unwrap()
});

const MAX_TRACE_LINES: usize = 50;
const MAX_CAPTURED_LINES: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogAnalysis {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace_language: Option<String>,
}

/// Stateless pattern scanner over captured stdout/stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnalyzer;

impl LogAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, stdout: &str, stderr: &str) -> LogAnalysis {
        let mut analysis = LogAnalysis::default();
        for source in [stderr, stdout] {
            self.scan(source, &mut analysis);
        }
        analysis
    }

    fn scan(&self, text: &str, analysis: &mut LogAnalysis) {
        let lines: Vec<&str> = text.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if analysis.stack_trace.is_none() {
                if let Some((language, trace)) = extract_trace(&lines, i) {
                    analysis.stack_trace = Some(trace);
                    analysis.stack_trace_language = Some(language.to_string());
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if ERROR_LINE.is_match(trimmed) {
                if analysis.errors.len() < MAX_CAPTURED_LINES {
                    analysis.errors.push(trimmed.to_string());
                }
            } else if WARNING_LINE.is_match(trimmed) && analysis.warnings.len() < MAX_CAPTURED_LINES {
                analysis.warnings.push(trimmed.to_string());
            }
        }
    }

    /// One-line status summary: outcome, duration, first error, and an
    /// optional baseline-derived suggestion.
    pub fn summarize(
        &self,
        record: &RunRecord,
        analysis: &LogAnalysis,
        suggestion: Option<&str>,
    ) -> String {
        let status = match record.status {
            JobStatus::Success => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed out",
            JobStatus::Cancelled => "was cancelled",
            JobStatus::Skipped => "was skipped",
            JobStatus::Queued | JobStatus::Running => "is still running",
        };
        let duration = record
            .duration_seconds()
            .map(|d| format!(" in {d:.1}s"))
            .unwrap_or_default();
        let steps = format!(
            " ({}/{} steps)",
            record.steps.len(),
            record.spec.commands.len()
        );

        let mut summary = format!("Job {status}{duration}{steps}");
        if let Some(first_error) = analysis.errors.first() {
            summary.push_str(&format!("; first error: {}", truncate(first_error, 120)));
        }
        if let Some(suggestion) = suggestion {
            summary.push_str(&format!("; {suggestion}"));
        }
        summary
    }
}

fn extract_trace(lines: &[&str], start: usize) -> Option<(&'static str, String)> {
    let head = lines[start];
    let language = TRACE_HEADS
        .iter()
        .find(|(_, re)| re.is_match(head))
        .map(|(lang, _)| *lang)?;

    let mut collected = vec![head.to_string()];
    for line in lines.iter().skip(start + 1).take(MAX_TRACE_LINES) {
        if TRACE_CONTINUATION.is_match(line) {
            collected.push(line.to_string());
        } else {
            break;
        }
    }
    // A head with no continuation is an ordinary error line, not a trace.
    if collected.len() < 2 {
        return None;
    }
    Some((language, collected.join("\n")))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobSpec;

    fn analyzer() -> LogAnalyzer {
        LogAnalyzer::new()
    }

    #[test]
    fn extracts_error_and_warning_lines() {
        let analysis = analyzer().analyze(
            "building...\nWARNING: cache miss\ndone\n",
            "Error: connection refused\n",
        );
        assert_eq!(analysis.errors.len(), 1);
        assert!(analysis.errors[0].contains("connection refused"));
        assert_eq!(analysis.warnings.len(), 1);
    }

    #[test]
    fn detects_python_traceback() {
        let stderr = "Traceback (most recent call last):\n  File \"app.py\", line 3, in <module>\n    main()\nValueError: bad input\n";
        let analysis = analyzer().analyze("", stderr);
        assert_eq!(analysis.stack_trace_language.as_deref(), Some("python"));
        let trace = analysis.stack_trace.unwrap();
        assert!(trace.contains("app.py"));
        assert!(trace.contains("ValueError"));
    }

    #[test]
    fn detects_node_stack() {
        let stderr = "TypeError: x is not a function\n    at main (/srv/app.js:10:5)\n    at Object.<anonymous> (/srv/app.js:20:1)\n";
        let analysis = analyzer().analyze("", stderr);
        assert_eq!(analysis.stack_trace_language.as_deref(), Some("node"));
        assert!(analysis.stack_trace.unwrap().contains("app.js:10:5"));
    }

    #[test]
    fn detects_go_panic() {
        let stderr = "panic: runtime error: index out of range [3]\ngoroutine 1 [running]:\nmain.main()\n\t/srv/main.go:12 +0x1d\n";
        let analysis = analyzer().analyze("", stderr);
        assert_eq!(analysis.stack_trace_language.as_deref(), Some("go"));
        assert!(analysis.stack_trace.unwrap().contains("main.go:12"));
    }

    #[test]
    fn detects_java_exception() {
        let stderr = "Exception in thread \"main\" java.lang.NullPointerException\n\tat com.example.App.run(App.java:14)\n\tat com.example.App.main(App.java:5)\n";
        let analysis = analyzer().analyze("", stderr);
        assert_eq!(analysis.stack_trace_language.as_deref(), Some("java"));
        assert!(analysis.stack_trace.unwrap().contains("App.java:14"));
    }

    #[test]
    fn lone_error_line_is_not_a_trace() {
        let analysis = analyzer().analyze("", "Error: nope\nall good afterwards\n");
        assert!(analysis.stack_trace.is_none());
        assert_eq!(analysis.errors.len(), 1);
    }

    #[test]
    fn summary_includes_duration_and_first_error() {
        let spec = JobSpec::new("alpine:3.19", vec![vec!["true".to_string()], vec!["false".to_string()]]);
        let mut record = RunRecord::new(spec);
        record.started_at = Some(record.created_at);
        record.finished_at = Some(record.created_at + chrono::Duration::milliseconds(2500));
        record.status = JobStatus::Failed;

        let analysis = analyzer().analyze("", "Error: disk full\n");
        let summary = analyzer().summarize(&record, &analysis, Some("retry with a larger volume"));
        assert!(summary.contains("failed"));
        assert!(summary.contains("2.5s"));
        assert!(summary.contains("disk full"));
        assert!(summary.contains("retry with a larger volume"));
    }
}
