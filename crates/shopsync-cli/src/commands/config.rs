//! Config command handlers

use anyhow::{Context, Result};

use shopsync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&redacted(&config)),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let not_set = || "(not set)".to_string();
            println!("Configuration:");
            println!("  data_dir:     {}", config.data_dir.display());
            println!(
                "  server_url:   {}",
                config.server_url.clone().unwrap_or_else(not_set)
            );
            println!(
                "  auth_token:   {}",
                if config.auth_token.is_some() { "(set)" } else { "(not set)" }
            );
            println!(
                "  device_id:    {}",
                config.device_id.clone().unwrap_or_else(|| "(generated)".to_string())
            );
            println!(
                "  user_id:      {}",
                config.user_id.clone().unwrap_or_else(not_set)
            );
            println!("  sync_enabled: {}", config.sync_enabled);
            println!(
                "  log_file:     {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(not_set)
            );
            println!();
            println!("[sync]");
            println!("  batch_size:            {}", config.sync.batch_size);
            println!("  delta_page_limit:      {}", config.sync.delta_page_limit);
            println!("  sync_interval_secs:    {}", config.sync.sync_interval_secs);
            println!("  cycle_timeout_secs:    {}", config.sync.cycle_timeout_secs);
            println!("  max_operation_retries: {}", config.sync.max_operation_retries);
            println!("  retry_profile:         {:?}", config.sync.retry_profile);
            println!("[compression]");
            println!("  enabled:         {}", config.compression.enabled);
            println!("  level:           {}", config.compression.level);
            println!("  threshold_bytes: {}", config.compression.threshold_bytes);
            println!("[connectivity]");
            println!("  debounce_ms:         {}", config.connectivity.debounce_ms);
            println!("  probe_interval_secs: {}", config.connectivity.probe_interval_secs);
            println!("[conflicts]");
            println!("  default_strategy:        {}", config.conflicts.default_strategy);
            println!(
                "  max_resolution_attempts: {}",
                config.conflicts.max_resolution_attempts
            );
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config.set(&key, &value)?;
    config.save().context("Failed to save configuration")?;

    let shown = if key == "auth_token" { "(hidden)" } else { value.as_str() };
    output.success(&format!("Set {} = {}", key, shown));
    Ok(())
}

/// Configuration as JSON with the token masked
fn redacted(config: &Config) -> serde_json::Value {
    let mut value = serde_json::to_value(config).unwrap_or_default();
    if let Some(token) = value.get_mut("auth_token").filter(|t| !t.is_null()) {
        *token = serde_json::Value::String("(set)".to_string());
    }
    value
}
