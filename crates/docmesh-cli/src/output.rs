//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag), one object per line for status streams
//! - Quiet mode for scripting (--quiet flag)

use anyhow::Result;

use docmesh_core::{EngineStatus, PeerStatus};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print one engine status update
    pub fn print_engine_status(&self, status: &EngineStatus) -> Result<()> {
        match self.format {
            OutputFormat::Human => println!("{}", format_engine_status(status)),
            OutputFormat::Json => println!("{}", serde_json::to_string(status)?),
            OutputFormat::Quiet => {}
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message (human mode only)
    pub fn message(&self, msg: &str) {
        if matches!(self.format, OutputFormat::Human) {
            println!("{}", msg);
        }
    }
}

fn format_engine_status(status: &EngineStatus) -> String {
    let mut line = format!("[{}] main: {}", status.step, format_peer(status.main.as_ref()));
    for (i, shadow) in status.shadows.iter().enumerate() {
        line.push_str(&format!(" | shadow-{}: {}", i + 1, format_peer(shadow.as_ref())));
    }
    if status.retrying {
        line.push_str(" (retrying)");
    }
    line
}

fn format_peer(status: Option<&PeerStatus>) -> String {
    match status {
        None => "-".to_string(),
        Some(status) => format!(
            "{} {}/{} docs, pull {}, push {}",
            status.step,
            status.loaded_documents,
            status.total_documents,
            status.pending_pull_count,
            status.pending_push_count
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmesh_core::{EngineStep, PeerStep};

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_format_engine_status() {
        let status = EngineStatus {
            step: EngineStep::Syncing,
            main: Some(PeerStatus {
                step: PeerStep::Syncing,
                total_documents: 3,
                loaded_documents: 3,
                pending_pull_count: 0,
                pending_push_count: 2,
            }),
            shadows: vec![None],
            retrying: true,
        };

        assert_eq!(
            format_engine_status(&status),
            "[syncing] main: syncing 3/3 docs, pull 0, push 2 | shadow-1: - (retrying)"
        );
    }
}
