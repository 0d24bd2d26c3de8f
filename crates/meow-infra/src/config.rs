//! Orchestrator configuration loader.
//!
//! Reads `<project_root>/.meow/config.toml` into
//! [`OrchestratorConfig`]. A missing file yields defaults; a malformed
//! file logs a warning and yields defaults rather than refusing to
//! start.

use std::path::Path;

use meow_types::config::OrchestratorConfig;

/// Load configuration from `{project_root}/.meow/config.toml`.
pub async fn load_config(project_root: &Path) -> OrchestratorConfig {
    let config_path = project_root.join(".meow").join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "no config.toml at {}, using defaults",
                config_path.display()
            );
            return OrchestratorConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return OrchestratorConfig::default();
        }
    };

    match toml::from_str::<OrchestratorConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            OrchestratorConfig::default()
        }
    }
}

/// The user-scope library directory (`~/.meow/lib`).
pub fn user_lib_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meow")
        .join("lib")
}
