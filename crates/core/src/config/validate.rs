use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Submission ceiling, tick interval and attempts are non-zero
/// - Download workers and attempts are non-zero, backoff never shrinks
/// - Naming model tag and extension are usable in filenames
/// - Artifact URL patterns compile
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.submission.inflight_ceiling == 0 {
        return Err(ConfigError::ValidationError(
            "submission.inflight_ceiling cannot be 0".to_string(),
        ));
    }

    if config.submission.tick_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "submission.tick_interval_ms cannot be 0".to_string(),
        ));
    }

    if config.submission.submit_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "submission.submit_attempts cannot be 0".to_string(),
        ));
    }

    if config.download.workers == 0 {
        return Err(ConfigError::ValidationError(
            "download.workers cannot be 0".to_string(),
        ));
    }

    if config.download.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "download.max_attempts cannot be 0".to_string(),
        ));
    }

    let multiplier = config.download.backoff_multiplier;
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::ValidationError(format!(
            "download.backoff_multiplier must be at least 1.0, got {}",
            multiplier
        )));
    }

    if config.naming.model_tag.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "naming.model_tag cannot be empty".to_string(),
        ));
    }

    let ext = &config.naming.extension;
    if ext.is_empty() || ext.contains('.') || ext.contains('/') {
        return Err(ConfigError::ValidationError(format!(
            "naming.extension must be a bare extension, got {:?}",
            ext
        )));
    }

    for pattern in &config.harvest.artifact_url_patterns {
        if let Err(e) = regex_lite::Regex::new(pattern) {
            return Err(ConfigError::ValidationError(format!(
                "harvest.artifact_url_patterns: invalid pattern {:?}: {}",
                pattern, e
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_ceiling_fails() {
        let mut config = Config::default();
        config.submission.inflight_ceiling = 0;
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_zero_workers_fails() {
        let mut config = Config::default();
        config.download.workers = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_dotted_extension_fails() {
        let mut config = Config::default();
        config.naming.extension = ".mp4".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("naming.extension"));
    }

    #[test]
    fn test_validate_bad_pattern_fails() {
        let mut config = Config::default();
        config.harvest.artifact_url_patterns = vec!["(unclosed".to_string()];
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("artifact_url_patterns"));
    }
}
