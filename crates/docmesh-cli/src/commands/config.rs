//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use docmesh_core::Config;

use crate::output::{Output, OutputFormat};

fn effective_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path)
}

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "retry_delay_ms": config.retry_delay_ms,
                    "log_level": config.log_level,
                    "path": effective_path(config_path)
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", effective_path(config_path).display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  retry_delay_ms: {}", config.retry_delay_ms);
            println!("  log_level:      {}", config.log_level);
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Print the config file path
pub fn path(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let path = effective_path(config_path);
    if output.is_json() {
        println!("{}", serde_json::json!({ "path": path }));
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match key.as_str() {
        "retry_delay_ms" => {
            config.retry_delay_ms = value
                .parse()
                .context("Invalid value for retry_delay_ms. Use a number of milliseconds.")?;
        }
        "log_level" => {
            const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
            if !LEVELS.contains(&value.as_str()) {
                bail!(
                    "Invalid value for log_level: '{}'\nValid levels: {}",
                    value,
                    LEVELS.join(", ")
                );
            }
            config.log_level = value.clone();
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: retry_delay_ms, log_level",
                key
            );
        }
    }

    config
        .save_to_path(&effective_path(config_path))
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}
