//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use vpa_lib::models::{ResourceAmount, ResourceKind, Resources};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a rows table with the shared style
pub fn print_table<T: tabled::Tabled>(rows: Vec<T>) {
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(amount: ResourceAmount) -> String {
    const KI: i64 = 1024;
    const MI: i64 = KI * 1024;
    const GI: i64 = MI * 1024;

    let bytes = amount.value();
    if bytes >= GI {
        format!("{:.2}Gi", bytes as f64 / GI as f64)
    } else if bytes >= MI {
        format!("{:.2}Mi", bytes as f64 / MI as f64)
    } else if bytes >= KI {
        format!("{:.2}Ki", bytes as f64 / KI as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Format millicores as human-readable string
pub fn format_cpu(amount: ResourceAmount) -> String {
    let millicores = amount.value();
    if millicores >= 1000 {
        format!("{:.1}", millicores as f64 / 1000.0)
    } else {
        format!("{}m", millicores)
    }
}

/// Format one resource of a map, `-` when absent
pub fn format_resource(resources: &Resources, kind: ResourceKind) -> String {
    match (resources.get(&kind), kind) {
        (Some(amount), ResourceKind::Cpu) => format_cpu(*amount),
        (Some(amount), ResourceKind::Memory) => format_bytes(*amount),
        (None, _) => "-".to_string(),
    }
}

/// Color a confidence value (in days of history)
pub fn color_confidence(confidence: f64) -> String {
    let formatted = format!("{:.2}", confidence);
    if confidence >= 1.0 {
        formatted.green().to_string()
    } else if confidence >= 0.25 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cpu() {
        assert_eq!(format_cpu(ResourceAmount(250)), "250m");
        assert_eq!(format_cpu(ResourceAmount(1500)), "1.5");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(ResourceAmount(512)), "512B");
        assert_eq!(format_bytes(ResourceAmount(256 * 1024 * 1024)), "256.00Mi");
        assert_eq!(format_bytes(ResourceAmount(3 * 1024 * 1024 * 1024)), "3.00Gi");
    }

    #[test]
    fn test_format_resource_missing_kind() {
        let resources: Resources = [(ResourceKind::Cpu, ResourceAmount(100))]
            .into_iter()
            .collect();
        assert_eq!(format_resource(&resources, ResourceKind::Cpu), "100m");
        assert_eq!(format_resource(&resources, ResourceKind::Memory), "-");
    }
}
