//! Server configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use buildq_core::logstash::DEFAULT_MAX_LINES;
use buildq_scheduler::SchedulerConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const DEFAULT_PATHS: [&str; 2] = ["/etc/buildq/scheduler.yaml", "scheduler.yaml"];

/// Configuration of the `serve` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Addresses the HTTP server binds to.
    #[serde(default = "default_listen_http")]
    pub listen_http: Vec<String>,
    /// Addresses clients use to reach the server. The first one is used in
    /// log links.
    #[serde(default)]
    pub public_http: Vec<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logstash: LogstashConfig,
    #[serde(default)]
    pub dashboard: Option<DashboardConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogstashConfig {
    /// Total log lines kept in memory before the oldest logs are evicted.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub uri: String,
}

fn default_listen_http() -> Vec<String> {
    vec!["0.0.0.0:9090".to_string()]
}

fn default_max_lines() -> usize {
    DEFAULT_MAX_LINES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_http: default_listen_http(),
            public_http: Vec::new(),
            scheduler: SchedulerConfig::default(),
            logstash: LogstashConfig::default(),
            dashboard: None,
        }
    }
}

impl Default for LogstashConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or the first default path that exists, then apply
    /// `BUILDQ_` environment overrides such as
    /// `BUILDQ_SCHEDULER__RESCHEDULE_INTERVAL_SECS=10`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("configuration file {} does not exist", path.display());
                }
                builder = builder.add_source(File::from(path.to_path_buf()).format(FileFormat::Yaml));
            }
            None => {
                if let Some(path) = DEFAULT_PATHS.iter().map(PathBuf::from).find(|p| p.exists()) {
                    builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("BUILDQ")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("listen_http")
                .with_list_parse_key("public_http")
                .try_parsing(true),
        );

        Self::from_config(builder.build().context("failed to read configuration")?)
    }

    /// Parse a YAML document, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .context("failed to read configuration")?;
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self> {
        let parsed: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_http.is_empty() {
            bail!("listen_http must name at least one address");
        }
        if let Some(dashboard) = &self.dashboard {
            if dashboard.uri.is_empty() {
                bail!("dashboard.uri must not be empty");
            }
        }
        Ok(())
    }

    /// Base URL of this server as seen by clients.
    pub fn public_url(&self) -> String {
        let address = self
            .public_http
            .first()
            .or_else(|| self.listen_http.first())
            .map(String::as_str)
            .unwrap_or("localhost:9090");
        if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{address}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_http, vec!["0.0.0.0:9090"]);
        assert_eq!(config.scheduler.reschedule_interval_secs, 60);
        assert_eq!(config.scheduler.executor_init_timeout_secs, 3);
        assert_eq!(config.logstash.max_lines, DEFAULT_MAX_LINES);
        assert!(config.dashboard.is_none());
    }

    #[test]
    fn test_yaml() {
        let config = ServerConfig::from_yaml(
            r#"
listen_http: ["127.0.0.1:8080", "[::1]:8080"]
public_http: ["https://buildq.example.com/"]
scheduler:
  reschedule_interval_secs: 5
  reject_ineligible_builds: true
logstash:
  max_lines: 1000
dashboard:
  uri: http://dashboard:8000
"#,
        )
        .unwrap();
        assert_eq!(config.listen_http.len(), 2);
        assert_eq!(config.scheduler.reschedule_interval_secs, 5);
        assert_eq!(config.scheduler.executor_init_timeout_secs, 3);
        assert!(config.scheduler.reject_ineligible_builds);
        assert_eq!(config.logstash.max_lines, 1000);
        assert_eq!(config.dashboard.unwrap().uri, "http://dashboard:8000");
    }

    #[test]
    fn test_public_url() {
        let mut config = ServerConfig::default();
        assert_eq!(config.public_url(), "http://0.0.0.0:9090");
        config.public_http = vec!["sched.local:9090".to_string()];
        assert_eq!(config.public_url(), "http://sched.local:9090");
        config.public_http = vec!["https://sched.example.com/".to_string()];
        assert_eq!(config.public_url(), "https://sched.example.com");
    }

    #[test]
    fn test_rejects_empty_listen() {
        assert!(ServerConfig::from_yaml("listen_http: []").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/buildq.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
