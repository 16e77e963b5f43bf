use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Cli;
use crate::progress::IdlePolicy;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub app_name: String,
    pub db_url: String,
    pub ai_base_url: String,
    pub ai_model: String,
    pub ai_api_key_env: String,
    pub oracle_timeout_secs: u64,
    pub tag_page_size: u32,
    pub progress_poll_interval_ms: u64,
    pub progress_idle_polls: u32,
    pub agent_max_iterations: u32,
    pub search_result_limit: usize,
    pub preview_max_chars: usize,
    pub reader_base_url: String,
    pub reader_timeout_secs: u64,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub show_sensitive_config: bool,
}

impl RuntimeConfig {
    pub fn idle_policy(&self) -> IdlePolicy {
        IdlePolicy {
            poll_interval: Duration::from_millis(self.progress_poll_interval_ms),
            max_idle_polls: self.progress_idle_polls,
        }
    }

    /// API key for the AI endpoint, read from the configured environment variable.
    pub fn ai_api_key(&self) -> Option<String> {
        std::env::var(&self.ai_api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub app_name: Option<String>,
    pub db_url: Option<String>,
    pub ai_base_url: Option<String>,
    pub ai_model: Option<String>,
    pub ai_api_key_env: Option<String>,
    pub oracle_timeout_secs: Option<u64>,
    pub tag_page_size: Option<u32>,
    pub progress_poll_interval_ms: Option<u64>,
    pub progress_idle_polls: Option<u32>,
    pub agent_max_iterations: Option<u32>,
    pub search_result_limit: Option<usize>,
    pub preview_max_chars: Option<usize>,
    pub reader_base_url: Option<String>,
    pub reader_timeout_secs: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check field names and value types.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        app_name: cli
            .app_name
            .clone()
            .or(profile.app_name)
            .unwrap_or_else(|| "linkbox".to_string()),
        db_url: cli
            .db_url
            .clone()
            .or(profile.db_url)
            .unwrap_or_else(|| "sqlite://.linkbox/linkbox.db".to_string()),
        ai_base_url: cli
            .ai_base_url
            .clone()
            .or(profile.ai_base_url)
            .unwrap_or_else(|| "https://api.siliconflow.cn/v1".to_string()),
        ai_model: cli
            .ai_model
            .clone()
            .or(profile.ai_model)
            .unwrap_or_else(|| "moonshotai/Kimi-K2-Instruct".to_string()),
        ai_api_key_env: cli
            .ai_api_key_env
            .clone()
            .or(profile.ai_api_key_env)
            .unwrap_or_else(|| "LINKBOX_AI_API_KEY".to_string()),
        oracle_timeout_secs: cli
            .oracle_timeout_secs
            .or(profile.oracle_timeout_secs)
            .unwrap_or(60)
            .max(1),
        tag_page_size: cli
            .tag_page_size
            .or(profile.tag_page_size)
            .unwrap_or(100)
            .max(1),
        progress_poll_interval_ms: cli
            .progress_poll_interval_ms
            .or(profile.progress_poll_interval_ms)
            .unwrap_or(100)
            .max(1),
        progress_idle_polls: cli
            .progress_idle_polls
            .or(profile.progress_idle_polls)
            .unwrap_or(50)
            .max(1),
        agent_max_iterations: cli
            .agent_max_iterations
            .or(profile.agent_max_iterations)
            .unwrap_or(3)
            .max(1),
        search_result_limit: cli
            .search_result_limit
            .or(profile.search_result_limit)
            .unwrap_or(10)
            .max(1),
        preview_max_chars: cli
            .preview_max_chars
            .or(profile.preview_max_chars)
            .unwrap_or(10_000)
            .max(256),
        reader_base_url: cli
            .reader_base_url
            .clone()
            .or(profile.reader_base_url)
            .unwrap_or_else(|| "https://r.jina.ai/".to_string()),
        reader_timeout_secs: cli
            .reader_timeout_secs
            .or(profile.reader_timeout_secs)
            .unwrap_or(300)
            .max(1),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".linkbox/telemetry/events.jsonl".to_string()),
        show_sensitive_config: cli.show_sensitive_config,
    })
}

pub fn display_db_url(cfg: &RuntimeConfig) -> String {
    if cfg.show_sensitive_config {
        cfg.db_url.clone()
    } else {
        crate::error::redact_sqlite_url_value(&cfg.db_url)
    }
}
