use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, validate::validate_config, ConfigError};

/// Prefix of environment overrides. Nested keys use `__`, e.g.
/// `REELQUEUE_DOWNLOAD__WORKERS=8`.
pub const ENV_PREFIX: &str = "REELQUEUE_";

/// Layered sources: built-in defaults, then the file (if any), then environment.
fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

fn extract(figment: Figment) -> Result<Config, ConfigError> {
    let config: Config = figment
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file with environment overrides.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    extract(figment(Some(path)))
}

/// Load configuration from the file if given, otherwise defaults plus environment.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => extract(figment(None)),
    }
}

/// Parse and validate configuration from a TOML string. Environment is ignored.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config =
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = load_config_from_str(
            r#"
[submission]
inflight_ceiling = 3

[naming]
model_tag = "veo3"
"#,
        )
        .unwrap();

        assert_eq!(config.submission.inflight_ceiling, 3);
        assert_eq!(config.submission.submit_attempts, 3);
        assert_eq!(config.naming.model_tag, "veo3");
        assert_eq!(config.naming.extension, "mp4");
        assert_eq!(config.download.workers, 5);
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let err = load_config_from_str("[submission]\ninflight_ceiling = \"many\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected_on_load() {
        let err = load_config_from_str("[download]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/reelqueue.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_file_over_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/runs.db"

[harvest]
enabled = false
"#
        )
        .unwrap();

        let config = load_config_or_default(Some(file.path())).unwrap();
        assert_eq!(config.database.path.to_str(), Some("/tmp/runs.db"));
        assert!(!config.harvest.enabled);
        assert_eq!(config.output.manifest_filename, "manifest.json");
        assert_eq!(config.harvest.artifact_url_patterns.len(), 2);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_or_default(None).unwrap();
        assert_eq!(config.harvest.max_idle_steps, 5);
        assert_eq!(config.download.backoff_multiplier, 2.0);
    }
}
