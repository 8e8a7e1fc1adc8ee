//! Output formatting for CLI

use anyhow::Result;
use console::{style, Style};
use serde::Serialize;
use std::fmt::Display;
use tabled::{settings::Style as TableStyle, Table, Tabled};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// Print rows as a table, or as a serialized list.
pub fn print_table<T: Serialize + Tabled>(rows: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("{}", style("No results found").dim());
            } else {
                println!("{}", Table::new(rows).with(TableStyle::rounded()));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(rows)?),
    }
    Ok(())
}

/// Print a single serializable item; text output falls back to JSON.
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?)
        }
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
    }
    Ok(())
}

pub fn success(msg: impl Display) {
    println!("{} {}", style("✓").green().bold(), msg);
}

pub fn warning(msg: impl Display) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

pub fn error(msg: impl Display) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

pub fn info(msg: impl Display) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: impl Display) {
    let key_style = Style::new().cyan().bold();
    println!("{}: {}", key_style.apply_to(key), value);
}

/// Color a readiness value.
pub fn status_indicator(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "ready" | "true" => format!("{}", style(status).green()),
        "pending" | "unknown" => format!("{}", style(status).yellow()),
        "absent" | "false" | "failed" => format!("{}", style(status).red()),
        _ => status.to_string(),
    }
}

/// Spinner for indeterminate progress
pub fn create_spinner(message: impl Into<String>) -> indicatif::ProgressBar {
    let spinner = indicatif::ProgressBar::new_spinner();
    if let Ok(template) = indicatif::ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    spinner
}

/// Interactive confirmation prompt
pub fn confirm(prompt: &str) -> bool {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}
