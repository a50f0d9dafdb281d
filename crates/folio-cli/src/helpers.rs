//! Shared helpers for the CLI subcommands.

use std::path::Path;

use anyhow::{Context, Result};
use folio_search::PipelineConfig;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the provider API key.
pub const ENV_API_KEY: &str = "FOLIO_API_KEY";

/// Install the global tracing subscriber.  `RUST_LOG` wins over
/// `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

/// Read a non-empty environment variable, returning `None` if unset or empty.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Load the config file, apply `FOLIO_*` overrides and validate.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.apply_env();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// The API key, or an error explaining where to put it.
pub fn api_key() -> Result<String> {
    env_non_empty(ENV_API_KEY)
        .with_context(|| format!("no API key found; set {ENV_API_KEY} in your environment or .env"))
}

/// Part of `text` not yet printed, given `printed` bytes already shown.
///
/// Returns `None` when `text` no longer extends what was printed (the
/// stream restarted).
pub fn unprinted_suffix<'a>(printed: &str, text: &'a str) -> Option<&'a str> {
    text.strip_prefix(printed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_of_growing_text() {
        assert_eq!(unprinted_suffix("", "Paul"), Some("Paul"));
        assert_eq!(unprinted_suffix("Paul", "Paul is"), Some(" is"));
        assert_eq!(unprinted_suffix("Paul is", "Paul is"), Some(""));
    }

    #[test]
    fn restarted_text_has_no_suffix() {
        assert_eq!(unprinted_suffix("stale text", "fresh"), None);
    }

    #[test]
    fn missing_config_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.toml");
        std::fs::write(&path, "[rate_limit]\ncapacity = 5\n").unwrap();

        let mut config = PipelineConfig::load(&path).unwrap();
        config.apply_overrides(|name| match name {
            "FOLIO_PREMIUM_MODEL" => Some("sonar-reasoning".to_string()),
            _ => None,
        });
        config.validate().unwrap();

        assert_eq!(config.rate_limit.capacity, 5);
        assert_eq!(config.provider.premium_model, "sonar-reasoning");
        assert_eq!(config.provider.cheap_model, "sonar");
    }
}
