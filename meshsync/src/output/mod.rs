use chrono::{DateTime, Utc};
use comfy_table::Table;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
}

pub fn print_output<T: Serialize>(data: T, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&data) {
                println!("{json}");
            }
        }
        OutputFormat::Table => {
            // Commands without a table layout fall back to JSON
            if let Ok(json) = serde_json::to_string_pretty(&data) {
                println!("{json}");
            }
        }
    }
}

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}

/// "3m ago" style age, or "Never".
pub fn format_age(time: Option<DateTime<Utc>>) -> String {
    let Some(time) = time else {
        return "Never".to_string();
    };
    match (Utc::now() - time).to_std() {
        Ok(age) => {
            let age = std::time::Duration::from_secs(age.as_secs());
            format!("{} ago", humantime::format_duration(age))
        }
        Err(_) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

pub fn format_optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}
