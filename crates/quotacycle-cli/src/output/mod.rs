//! Output formatting module
//!
//! Commands hand a [`Printer`] both the core value and its table rows. JSON
//! output prints the core value as-is, so scripts see the same field names
//! the library serializes; table output prints the rows.

use chrono::{DateTime, SecondsFormat, Utc};
use colored::Colorize;
use quotacycle_core::ResetEvent;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Where command results and progress messages go
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    format: OutputFormat,
    quiet: bool,
}

impl Printer {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self {
            format,
            // Messages would corrupt the JSON document on stdout
            quiet: quiet || format == OutputFormat::Json,
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Print `value` as pretty JSON, or `rows` as a table
    pub fn emit<V, R>(&self, value: &V, rows: &[R]) -> anyhow::Result<()>
    where
        V: Serialize + ?Sized,
        R: Tabled,
    {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Table => println!("{}", render_table(rows)),
        }
        Ok(())
    }

    /// Green confirmation line
    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{}", message.green());
        }
    }

    /// Plain progress line
    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("{}", message);
        }
    }

    /// Highlight a reset the tracker just persisted
    pub fn reset_banner(&self, event: &ResetEvent) {
        if !self.quiet {
            println!("{}", reset_message(event).yellow().bold());
        }
    }
}

fn reset_message(event: &ResetEvent) -> String {
    format!(
        "Reset detected for {} ({}), closed at {} with delta {} and peak {}",
        event.key,
        event.reason,
        cell_time(Some(event.closed_at)),
        cell_value(event.closed_delta),
        cell_value(event.closed_peak)
    )
}

/// Table text, or a placeholder line when there is nothing to show
pub fn render_table<R: Tabled>(rows: &[R]) -> String {
    if rows.is_empty() {
        "No items found.".to_string()
    } else {
        Table::new(rows).with(Style::rounded()).to_string()
    }
}

/// Timestamp cell, second precision
pub fn cell_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

/// Numeric cell, trimming float noise
pub fn cell_value(v: f64) -> String {
    let rounded = (v * 1000.0).round() / 1000.0;
    format!("{}", rounded)
}

/// Countdown cell such as `4h 05m`
pub fn cell_countdown(seconds: Option<i64>) -> String {
    match seconds {
        Some(s) => format!("{}h {:02}m", s / 3600, (s % 3600) / 60),
        None => "-".to_string(),
    }
}
