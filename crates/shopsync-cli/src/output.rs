//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use shopsync_core::conflict::Conflict;
use shopsync_core::queue::QueueStats;
use shopsync_core::{CycleReport, SyncOperation, SyncState};

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

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print queued operations
    pub fn print_operations(&self, ops: &[SyncOperation]) {
        match self.format {
            OutputFormat::Human => {
                if ops.is_empty() {
                    println!("Queue is empty.");
                    return;
                }
                for op in ops {
                    let error = op
                        .last_error
                        .as_deref()
                        .map(|e| format!(" | {}", truncate(e, 40)))
                        .unwrap_or_default();
                    println!(
                        "{} | {:<11} | {:<14} {:<6} | {} | retries {}{}",
                        short_id(&op.local_id),
                        op.status.as_str(),
                        op.entity_type.as_str(),
                        op.operation_type.as_str(),
                        truncate(op.coalesce_key(), 24),
                        op.retry_count,
                        error
                    );
                }
                println!("\n{} operation(s)", ops.len());
            }
            OutputFormat::Json => self.json(ops),
            OutputFormat::Quiet => {
                for op in ops {
                    println!("{}", op.local_id);
                }
            }
        }
    }

    /// Print queue statistics
    pub fn print_stats(&self, stats: &QueueStats) {
        match self.format {
            OutputFormat::Human => {
                println!("Queue: {} operation(s)", stats.total);
                print_counts("By status", stats.by_status.iter());
                print_counts("By entity", stats.by_entity_type.iter());
                print_counts("By operation", stats.by_operation_type.iter());
                print_counts("By priority", stats.by_priority.iter());
                if let Some(at) = stats.oldest_pending_at {
                    println!("Oldest pending: {}", at.format("%Y-%m-%d %H:%M:%S"));
                }
                if let Some(at) = stats.last_synced_at {
                    println!("Last synced:    {}", at.format("%Y-%m-%d %H:%M:%S"));
                }
            }
            OutputFormat::Json => self.json(stats),
            OutputFormat::Quiet => println!("{}", stats.total),
        }
    }

    /// Print the report of a finished sync cycle
    pub fn print_report(&self, report: &CycleReport) {
        match self.format {
            OutputFormat::Human => {
                let mark = match report.state {
                    SyncState::Success => "✓",
                    SyncState::PartialFailure => "!",
                    _ => "✗",
                };
                println!(
                    "{} Sync {} ({}) in {}ms",
                    mark, report.state, report.trigger, report.duration_ms
                );
                println!(
                    "  Uploaded: {}, Failed: {} ({} will retry)",
                    report.uploaded, report.failed, report.retried
                );
                println!(
                    "  Conflicts: {} ({} resolved, {} waiting)",
                    report.conflicts, report.conflicts_resolved, report.conflicts_pending
                );
                println!(
                    "  Downloaded: {} record(s) in {} page(s)",
                    report.downloaded, report.pages
                );
                if let Some(ref error) = report.last_error {
                    println!("  Error: {}", error);
                }
            }
            OutputFormat::Json => self.json(report),
            OutputFormat::Quiet => println!("{}", report.state),
        }
    }

    /// Print a list of conflicts
    pub fn print_conflicts(&self, conflicts: &[Conflict]) {
        match self.format {
            OutputFormat::Human => {
                if conflicts.is_empty() {
                    println!("No conflicts found.");
                    return;
                }
                for conflict in conflicts {
                    let escalated = if conflict.escalated { " [escalated]" } else { "" };
                    println!(
                        "{} | {:<8} | {:<17} | {} {} | {}{}",
                        short_id(&conflict.conflict_id),
                        conflict.status.as_str(),
                        conflict.conflict_type.as_str(),
                        conflict.entity_type,
                        truncate(&conflict.entity_id, 24),
                        conflict.severity,
                        escalated
                    );
                }
                println!("\n{} conflict(s)", conflicts.len());
            }
            OutputFormat::Json => self.json(conflicts),
            OutputFormat::Quiet => {
                for conflict in conflicts {
                    println!("{}", conflict.conflict_id);
                }
            }
        }
    }

    /// Print a single conflict with both sides
    pub fn print_conflict(&self, conflict: &Conflict) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:        {}", conflict.conflict_id);
                println!("Entity:    {} {}", conflict.entity_type, conflict.entity_id);
                println!("Operation: {} ({})", conflict.operation_type, conflict.local_id);
                println!("Type:      {}", conflict.conflict_type);
                println!("Severity:  {}", conflict.severity);
                println!("Status:    {}", conflict.status);
                if !conflict.conflicting_fields.is_empty() {
                    println!("Fields:    {}", conflict.conflicting_fields.join(", "));
                }
                if let Some(ref message) = conflict.server_message {
                    println!("Server:    {}", message);
                }
                if let Some(ref error) = conflict.last_error {
                    println!("Error:     {} (after {} attempts)", error, conflict.attempts);
                }
                println!();
                println!("── Local ({}) ──", conflict.local.timestamp.format("%Y-%m-%d %H:%M:%S"));
                println!("{}", pretty(&conflict.local.data));
                println!("── Server ({}) ──", conflict.server.timestamp.format("%Y-%m-%d %H:%M:%S"));
                if conflict.server.deleted {
                    println!("(deleted)");
                } else {
                    println!("{}", pretty(&conflict.server.data));
                }
                if let Some(ref resolution) = conflict.resolution {
                    println!("── Resolved by {} with {} ──", resolution.resolved_by, resolution.strategy);
                    println!("{}", pretty(&resolution.data));
                }
            }
            OutputFormat::Json => self.json(conflict),
            OutputFormat::Quiet => println!("{}", conflict.conflict_id),
        }
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

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_counts<K: std::fmt::Display, V: std::fmt::Display>(
    title: &str,
    counts: impl Iterator<Item = (K, V)>,
) {
    let line: Vec<String> = counts.map(|(k, v)| format!("{}={}", k, v)).collect();
    if !line.is_empty() {
        println!("  {:<13} {}", format!("{}:", title), line.join(", "));
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// First 8 characters of an id
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
