//! Terminal and JSON output for kapply commands.
//!
//! Status lines go to stdout, errors and warnings to stderr. Colors are
//! dropped when the stream is not a terminal.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use kapply_lib::BatchReport;
use kapply_lib::apply::ApplyOutcome;
use owo_colors::{OwoColorize, Stream, Style};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// Leading marker of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
  Success,
  Error,
  Warning,
  Info,
  Outcome(ApplyOutcome),
}

impl Marker {
  fn symbol(self) -> &'static str {
    match self {
      Marker::Success => "✓",
      Marker::Error => "✗",
      Marker::Warning => "⚠",
      Marker::Info => "•",
      Marker::Outcome(ApplyOutcome::Created) => "+",
      Marker::Outcome(ApplyOutcome::Updated) => "~",
      Marker::Outcome(ApplyOutcome::Unchanged) => "=",
    }
  }

  fn color(self) -> Style {
    match self {
      Marker::Success | Marker::Outcome(ApplyOutcome::Created) => Style::new().green(),
      Marker::Error => Style::new().red(),
      Marker::Warning | Marker::Outcome(ApplyOutcome::Updated) => Style::new().yellow(),
      Marker::Info => Style::new().blue(),
      Marker::Outcome(ApplyOutcome::Unchanged) => Style::new().dimmed(),
    }
  }

  fn paint(self, stream: Stream) -> String {
    let color = self.color();
    self
      .symbol()
      .if_supports_color(stream, |s| s.style(color))
      .to_string()
  }
}

pub fn print_success(message: &str) {
  println!("{} {message}", Marker::Success.paint(Stream::Stdout));
}

pub fn print_info(message: &str) {
  println!("{} {message}", Marker::Info.paint(Stream::Stdout));
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    Marker::Error.paint(Stream::Stderr),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    Marker::Warning.paint(Stream::Stderr),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}

#[derive(Serialize)]
struct ReportLine<'a> {
  manifest: &'a str,
  outcome: ApplyOutcome,
}

/// One line per manifest, e.g. `+ ns.yaml (created)`, then a summary.
pub fn print_report(report: &BatchReport, elapsed: Duration, format: OutputFormat) -> anyhow::Result<()> {
  if format.is_json() {
    let lines: Vec<ReportLine<'_>> = report
      .applied
      .iter()
      .map(|(manifest, outcome)| ReportLine {
        manifest: manifest.as_str(),
        outcome: *outcome,
      })
      .collect();
    return print_json(&lines);
  }

  for (manifest, outcome) in &report.applied {
    let detail = format!("({outcome})");
    println!(
      "  {} {manifest} {}",
      Marker::Outcome(*outcome).paint(Stream::Stdout),
      detail.if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }
  println!();
  print_success(&summary(report, elapsed));
  Ok(())
}

fn summary(report: &BatchReport, elapsed: Duration) -> String {
  // Sub-millisecond precision is noise on a wall-clock total.
  let elapsed = Duration::from_millis(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
  format!(
    "Applied {} manifest(s) in {}: {} created, {} updated, {} unchanged",
    report.len(),
    humantime::format_duration(elapsed),
    report.count(ApplyOutcome::Created),
    report.count(ApplyOutcome::Updated),
    report.count(ApplyOutcome::Unchanged),
  )
}
