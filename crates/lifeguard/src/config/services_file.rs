//! Services file YAML schema definitions

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root services file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesFile {
    /// Services file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Supervisor-wide settings
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Environment overlay applied to every service
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Service definitions (ordered map for deterministic start order)
    pub services: IndexMap<String, ServiceConfig>,

    /// Directory the file was loaded from, if any
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Supervisor-wide timing and control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Overall deadline for stopping every service
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Delay between readiness probes
    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,

    /// Uptime after which a crash no longer continues a crash loop
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,

    /// Captured output lines kept per service
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,

    /// Address the HTTP control plane listens on (disabled when unset)
    #[serde(default)]
    pub http_bind: Option<String>,
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_readiness_interval_ms() -> u64 {
    1_000
}

fn default_stability_window_ms() -> u64 {
    30_000
}

fn default_output_buffer_lines() -> usize {
    200
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            readiness_interval_ms: default_readiness_interval_ms(),
            stability_window_ms: default_stability_window_ms(),
            output_buffer_lines: default_output_buffer_lines(),
            http_bind: None,
        }
    }
}

/// A single service definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Executable path or interpreter (`python3`, `node`, ...)
    pub executable: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Environment variables specific to this service
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// How to tell the service is ready to accept traffic
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,

    /// Automatic restart behaviour
    #[serde(default)]
    pub restart: RestartConfig,

    /// Services that must be started first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Start this service when the daemon boots
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// Optional description shown by status listings
    #[serde(default)]
    pub description: Option<String>,
}

fn default_autostart() -> bool {
    true
}

/// Readiness target: either `tcp` or `http`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// TCP port expected to accept connections
    #[serde(default)]
    pub tcp: Option<u16>,

    /// Host used with `tcp`
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP URL polled for a response
    #[serde(default)]
    pub http: Option<String>,

    /// Status the HTTP endpoint must return (any response counts when unset)
    #[serde(default)]
    pub expected_status: Option<u16>,

    /// How long to wait for readiness before the start fails
    #[serde(default = "default_readiness_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

/// Restart policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Restart the service after an unexpected exit
    #[serde(default)]
    pub auto: bool,

    /// Restarts allowed within one crash loop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between restarts
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            auto: false,
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff: `min(base * multiplier^(attempt-1), cap)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            multiplier: default_backoff_multiplier(),
            cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl ServicesFile {
    /// Load services file from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServicesFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ServicesFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut file = Self::from_yaml(&content)?;
        file.source_dir = path
            .canonicalize()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf));
        Ok(file)
    }

    /// Parse services file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ServicesFileError> {
        let file: ServicesFile = serde_yaml::from_str(content).map_err(ServicesFileError::Parse)?;
        file.validate()?;
        Ok(file)
    }

    /// Validate the services file configuration
    pub fn validate(&self) -> Result<(), ServicesFileError> {
        let settings = &self.supervisor;
        if settings.stop_timeout_ms == 0 {
            return Err(ServicesFileError::Validation(
                "supervisor.stop_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if settings.readiness_interval_ms == 0 {
            return Err(ServicesFileError::Validation(
                "supervisor.readiness_interval_ms must be greater than zero".to_string(),
            ));
        }
        if settings.output_buffer_lines == 0 {
            return Err(ServicesFileError::Validation(
                "supervisor.output_buffer_lines must be greater than zero".to_string(),
            ));
        }

        for (name, service) in &self.services {
            validate_name(name)?;

            if service.executable.trim().is_empty() {
                return Err(ServicesFileError::Validation(format!(
                    "Service '{}': 'executable' must not be empty",
                    name
                )));
            }

            if let Some(readiness) = &service.readiness {
                validate_readiness(name, readiness)?;
            }

            let backoff = &service.restart.backoff;
            if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
                return Err(ServicesFileError::Validation(format!(
                    "Service '{}': backoff multiplier must be a finite number >= 1.0",
                    name
                )));
            }
            if backoff.base_ms > backoff.cap_ms {
                return Err(ServicesFileError::Validation(format!(
                    "Service '{}': backoff base_ms ({}) exceeds cap_ms ({})",
                    name, backoff.base_ms, backoff.cap_ms
                )));
            }

            for dep in &service.depends_on {
                if dep == name {
                    return Err(ServicesFileError::Validation(format!(
                        "Service '{}': cannot depend on itself",
                        name
                    )));
                }
                if !self.services.contains_key(dep) {
                    return Err(ServicesFileError::Validation(format!(
                        "Service '{}': depends on unknown service '{}'",
                        name, dep
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ServicesFileError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ServicesFileError::Validation(format!(
            "Invalid service name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

fn validate_readiness(name: &str, readiness: &ReadinessConfig) -> Result<(), ServicesFileError> {
    match (&readiness.tcp, &readiness.http) {
        (Some(0), None) => {
            return Err(ServicesFileError::Validation(format!(
                "Service '{}': readiness tcp port must not be 0",
                name
            )));
        }
        (Some(_), None) => {}
        (None, Some(url)) => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ServicesFileError::Validation(format!(
                    "Service '{}': readiness http must be an http:// or https:// URL, got '{}'",
                    name, url
                )));
            }
        }
        (Some(_), Some(_)) => {
            return Err(ServicesFileError::Validation(format!(
                "Service '{}': readiness cannot specify both 'tcp' and 'http'",
                name
            )));
        }
        (None, None) => {
            return Err(ServicesFileError::Validation(format!(
                "Service '{}': readiness must specify either 'tcp' or 'http'",
                name
            )));
        }
    }

    if readiness.expected_status.is_some() && readiness.http.is_none() {
        return Err(ServicesFileError::Validation(format!(
            "Service '{}': 'expected_status' only applies to http readiness",
            name
        )));
    }
    if readiness.timeout_ms == 0 {
        return Err(ServicesFileError::Validation(format!(
            "Service '{}': readiness timeout_ms must be greater than zero",
            name
        )));
    }

    Ok(())
}

/// Errors that can occur when loading a services file
#[derive(Debug, thiserror::Error)]
pub enum ServicesFileError {
    #[error("Failed to read services file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse services file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_services_file() {
        let yaml = r#"
version: "1.0"
supervisor:
  stop_timeout_ms: 2000
env:
  RUST_LOG: info
services:
  db:
    executable: postgres
    args: ["-D", "/var/lib/db"]
    readiness:
      tcp: 5432
      timeout_ms: 10000
    restart:
      auto: true
      max_attempts: 2
      backoff:
        base_ms: 1000
  api:
    executable: python3
    args: ["-m", "uvicorn", "app:main", "--port", "8765"]
    working_dir: /srv/api
    env:
      API_KEY: "$(env API_KEY)"
    readiness:
      http: "http://localhost:8765/health"
      expected_status: 200
    depends_on: [db]
"#;
        let file = ServicesFile::from_yaml(yaml).unwrap();
        assert_eq!(file.supervisor.stop_timeout_ms, 2000);
        assert_eq!(file.supervisor.readiness_interval_ms, 1000);
        assert_eq!(file.services.len(), 2);

        let names: Vec<_> = file.services.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["db", "api"]);

        let db = &file.services["db"];
        assert!(db.restart.auto);
        assert_eq!(db.restart.max_attempts, 2);
        assert_eq!(db.restart.backoff.multiplier, 2.0);
        assert_eq!(db.readiness.as_ref().unwrap().host, "127.0.0.1");

        let api = &file.services["api"];
        assert!(!api.restart.auto);
        assert!(api.autostart);
        assert_eq!(api.depends_on, vec!["db".to_string()]);
    }

    #[test]
    fn test_validation_empty_executable() {
        let yaml = r#"
services:
  bad:
    executable: "  "
"#;
        assert!(matches!(
            ServicesFile::from_yaml(yaml),
            Err(ServicesFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_readiness_needs_one_target() {
        let both = r#"
services:
  svc:
    executable: bin/svc
    readiness:
      tcp: 8080
      http: "http://localhost:8080"
"#;
        assert!(ServicesFile::from_yaml(both).is_err());

        let neither = r#"
services:
  svc:
    executable: bin/svc
    readiness:
      timeout_ms: 1000
"#;
        assert!(ServicesFile::from_yaml(neither).is_err());

        let status_on_tcp = r#"
services:
  svc:
    executable: bin/svc
    readiness:
      tcp: 8080
      expected_status: 200
"#;
        assert!(ServicesFile::from_yaml(status_on_tcp).is_err());
    }

    #[test]
    fn test_validation_unknown_dependency() {
        let yaml = r#"
services:
  worker:
    executable: bin/worker
    depends_on: [queue]
"#;
        let err = ServicesFile::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown service 'queue'"));
    }

    #[test]
    fn test_validation_backoff() {
        let yaml = r#"
services:
  worker:
    executable: bin/worker
    restart:
      backoff:
        base_ms: 5000
        cap_ms: 1000
"#;
        assert!(ServicesFile::from_yaml(yaml).is_err());

        let shrinking = r#"
services:
  worker:
    executable: bin/worker
    restart:
      backoff:
        multiplier: 0.5
"#;
        assert!(ServicesFile::from_yaml(shrinking).is_err());
    }

    #[test]
    fn test_validation_service_name() {
        let yaml = r#"
services:
  "bad/name":
    executable: bin/worker
"#;
        assert!(ServicesFile::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file_records_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        std::fs::write(&path, "services:\n  a:\n    executable: bin/a\n").unwrap();

        let file = ServicesFile::from_file(&path).unwrap();
        assert_eq!(
            file.source_dir.unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_from_file_missing() {
        let result = ServicesFile::from_file("/nonexistent/services.yaml");
        assert!(matches!(result, Err(ServicesFileError::Io { .. })));
    }
}
