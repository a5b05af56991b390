// Copyright The Phoenix Authors
// SPDX-License-Identifier: Apache-2.0

//! Settings file IO.

use crate::error::Error;
use crate::ControlPlaneSettings;
use std::path::Path;

/// Loads and validates settings from a YAML file.
///
/// # Errors
///
/// Returns an error when the file cannot be read, fails to deserialize, or
/// fails validation.
pub fn load_settings(path: &Path) -> Result<ControlPlaneSettings, Error> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    let settings = parse_settings(&contents).map_err(|details| Error::DeserializationError {
        path: path.display().to_string(),
        details,
    })?;
    settings.validate()?;
    Ok(settings)
}

/// Parses settings from a YAML string without validating them.
fn parse_settings(contents: &str) -> Result<ControlPlaneSettings, String> {
    serde_yaml::from_str(contents).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn loads_overrides_and_keeps_defaults() {
        let yaml = r#"
http:
  bind_address: "0.0.0.0:9090"
queue:
  lease: 2m
  retry_ceiling: 5
analyzer:
  critical_processes:
    - sshd
    - systemd
"#;
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write");
        let settings = load_settings(file.path()).expect("load");
        assert_eq!(settings.http.bind_address, "0.0.0.0:9090");
        assert_eq!(settings.queue.lease, Duration::from_secs(120));
        assert_eq!(settings.queue.retry_ceiling, 5);
        assert_eq!(settings.analyzer.critical_processes.len(), 2);
        // Untouched sections keep their defaults.
        assert_eq!(settings.dispatch.default_max_wait, Duration::from_secs(30));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "queue:\n  lease: 1m\n  surprise: true\n";
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write");
        let err = load_settings(file.path()).expect_err("must fail");
        assert!(matches!(err, Error::DeserializationError { .. }));
    }

    #[test]
    fn invalid_settings_fail_validation_on_load() {
        let yaml = "queue:\n  retry_ceiling: 0\n";
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write");
        let err = load_settings(file.path()).expect_err("must fail");
        assert!(matches!(err, Error::InvalidSettings { .. }));
    }
}
