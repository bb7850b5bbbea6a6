//! Farm configuration parsing.

use crate::template::referenced_variables;
use crate::{ConfigError, ConfigResult};
use buildfarm_core::worker::NewWorker;
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.+-]*$").unwrap());

/// Whole-farm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    pub manager: ManagerConfig,
    /// PostgreSQL URL. The in-memory store is used when absent.
    pub database_url: Option<String>,
    pub api: ApiConfig,
    pub librarian: LibrarianConfig,
    pub notify: NotifyConfig,
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Scheduler cadence, timeouts and failure thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub scan_interval: Duration,
    /// How long a cancel may wait for the worker to confirm the abort.
    pub cancel_timeout: Duration,
    pub socket_timeout: Duration,
    pub virtualized_socket_timeout: Duration,
    /// Consecutive failures between reset actions.
    pub reset_threshold: u32,
    /// Consecutive failed reset actions before a worker is disabled.
    pub reset_failure_threshold: u32,
    /// Command that resumes a worker's VM, e.g. `ssh ${vm_host} resume ${worker}`.
    pub vm_resume_command: Option<String>,
    /// Base URL restricted files are served from.
    pub private_file_base: Option<String>,
    /// Key used to sign restricted file URLs.
    pub private_file_secret: Option<String>,
    pub log_format: LogFormat,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            cancel_timeout: Duration::from_secs(180),
            socket_timeout: Duration::from_secs(40),
            virtualized_socket_timeout: Duration::from_secs(30),
            reset_threshold: 5,
            reset_failure_threshold: 3,
            vm_resume_command: None,
            private_file_base: None,
            private_file_secret: None,
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibrarianConfig {
    Http { url: String },
    Filesystem { path: PathBuf },
}

impl Default for LibrarianConfig {
    fn default() -> Self {
        LibrarianConfig::Filesystem {
            path: PathBuf::from("librarian"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook: Option<String>,
}

/// One entry of the worker roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub url: String,
    pub processor: String,
    pub virtualized: bool,
    pub vm_host: Option<String>,
    pub manual: bool,
    pub active: bool,
}

impl WorkerConfig {
    pub fn to_new_worker(&self) -> NewWorker {
        NewWorker {
            name: self.name.clone(),
            url: self.url.clone(),
            processor: self.processor.clone(),
            virtualized: self.virtualized,
            vm_host: self.vm_host.clone(),
            manual: self.manual,
            active: self.active,
        }
    }
}

/// Read and parse a farm configuration file.
pub fn load_farm_config(path: impl AsRef<Path>) -> ConfigResult<FarmConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_farm_config(&text)
}

/// Parse a farm configuration from KDL text.
pub fn parse_farm_config(kdl: &str) -> ConfigResult<FarmConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut manager = ManagerConfig::default();
    let mut database_url = None;
    let mut api = ApiConfig::default();
    let mut librarian = LibrarianConfig::default();
    let mut notify = NotifyConfig::default();
    let mut workers = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "manager" => {
                manager = parse_manager(node)?;
            }
            "database" => {
                database_url = Some(
                    get_string_prop(node, "url")
                        .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?,
                );
            }
            "api" => {
                if let Some(listen) = get_string_prop(node, "listen") {
                    api.listen = listen;
                }
            }
            "librarian" => {
                librarian = parse_librarian(node)?;
            }
            "notify" => {
                notify.webhook = get_string_prop(node, "webhook");
            }
            "worker" => {
                workers.push(parse_worker(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let config = FarmConfig {
        manager,
        database_url,
        api,
        librarian,
        notify,
        workers,
    };
    validate(&config)?;
    Ok(config)
}

fn parse_manager(node: &KdlNode) -> ConfigResult<ManagerConfig> {
    let mut manager = ManagerConfig::default();

    let Some(children) = node.children() else {
        return Ok(manager);
    };

    for child in children.nodes() {
        let key = child.name().value();
        match key {
            "scan-interval" => manager.scan_interval = get_seconds_arg(child, key)?,
            "cancel-timeout" => manager.cancel_timeout = get_seconds_arg(child, key)?,
            "socket-timeout" => manager.socket_timeout = get_seconds_arg(child, key)?,
            "virtualized-socket-timeout" => {
                manager.virtualized_socket_timeout = get_seconds_arg(child, key)?
            }
            "reset-threshold" => manager.reset_threshold = get_positive_arg(child, key)?,
            "reset-failure-threshold" => {
                manager.reset_failure_threshold = get_positive_arg(child, key)?
            }
            "vm-resume-command" => manager.vm_resume_command = get_first_string_arg(child),
            "private-file-base" => manager.private_file_base = get_first_string_arg(child),
            "private-file-secret" => manager.private_file_secret = get_first_string_arg(child),
            "log-format" => {
                manager.log_format = match get_first_string_arg(child).as_deref() {
                    Some("text") => LogFormat::Text,
                    Some("json") => LogFormat::Json,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            field: key.to_string(),
                            message: format!("expected \"text\" or \"json\", got {:?}", other),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    Ok(manager)
}

fn parse_librarian(node: &KdlNode) -> ConfigResult<LibrarianConfig> {
    if let Some(url) = get_string_prop(node, "url") {
        return Ok(LibrarianConfig::Http { url });
    }
    if let Some(path) = get_string_prop(node, "path") {
        return Ok(LibrarianConfig::Filesystem {
            path: PathBuf::from(path),
        });
    }
    Err(ConfigError::MissingField("librarian url or path".to_string()))
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;

    let url = get_string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField(format!("url for worker '{}'", name)))?;
    let processor = get_string_prop(node, "processor")
        .ok_or_else(|| ConfigError::MissingField(format!("processor for worker '{}'", name)))?;

    Ok(WorkerConfig {
        url,
        processor,
        virtualized: get_bool_prop(node, "virtualized").unwrap_or(false),
        vm_host: get_string_prop(node, "vm-host"),
        manual: get_bool_prop(node, "manual").unwrap_or(false),
        active: get_bool_prop(node, "active").unwrap_or(true),
        name,
    })
}

fn validate(config: &FarmConfig) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for worker in &config.workers {
        if !NAME_REGEX.is_match(&worker.name) {
            return Err(ConfigError::InvalidValue {
                field: "worker name".to_string(),
                message: format!("'{}' must match {}", worker.name, NAME_REGEX.as_str()),
            });
        }
        if !seen.insert(worker.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("worker '{}'", worker.name)));
        }
    }

    // Virtualized workers are resumed before every build.
    let mut virtualized = config.workers.iter().filter(|w| w.virtualized);
    match &config.manager.vm_resume_command {
        None => {
            if let Some(worker) = virtualized.next() {
                return Err(ConfigError::MissingField(format!(
                    "vm-resume-command for virtualized worker '{}'",
                    worker.name
                )));
            }
        }
        Some(command) => {
            let needs_host = referenced_variables(command).iter().any(|v| v == "vm_host");
            if let Some(worker) = virtualized.find(|w| needs_host && w.vm_host.is_none()) {
                return Err(ConfigError::MissingField(format!(
                    "vm-host for virtualized worker '{}'",
                    worker.name
                )));
            }
        }
    }

    let manager = &config.manager;
    if manager.private_file_base.is_some() != manager.private_file_secret.is_some() {
        return Err(ConfigError::MissingField(
            "private-file-base and private-file-secret must be set together".to_string(),
        ));
    }

    for worker in &config.workers {
        check_http_url(&format!("url for worker '{}'", worker.name), &worker.url)?;
    }
    if let LibrarianConfig::Http { url } = &config.librarian {
        check_http_url("librarian url", url)?;
    }
    if let Some(url) = &config.notify.webhook {
        check_http_url("notify webhook", url)?;
    }
    if let Some(url) = &manager.private_file_base {
        check_http_url("private-file-base", url)?;
    }

    Ok(())
}

fn check_http_url(field: &str, value: &str) -> ConfigResult<()> {
    let invalid = |message: String| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    };
    let url = Url::parse(value).map_err(|e| invalid(format!("'{}': {}", value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_positive_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = get_first_integer_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a positive integer, got {}", value),
        })
}

fn get_seconds_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    get_positive_arg(node, field).map(|secs| Duration::from_secs(u64::from(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            manager {
                scan-interval 5
                cancel-timeout 60
                reset-threshold 4
                reset-failure-threshold 2
                vm-resume-command "ssh ppa@${vm_host} resume ${worker}"
                private-file-base "https://private.example.com/files"
                private-file-secret "s3cret"
                log-format "json"
            }

            database url="postgres://localhost/buildfarm"
            api listen="127.0.0.1:9000"
            librarian url="http://librarian.internal:8000"
            notify webhook="http://hooks.internal/build"

            worker "bob" url="http://bob:8221" processor="386" virtualized=#true vm-host="host1"
            worker "frog" url="http://frog:8221" processor="amd64" manual=#true
        "#;

        let config = parse_farm_config(kdl).unwrap();
        assert_eq!(config.manager.scan_interval, Duration::from_secs(5));
        assert_eq!(config.manager.cancel_timeout, Duration::from_secs(60));
        assert_eq!(config.manager.reset_threshold, 4);
        assert_eq!(config.manager.reset_failure_threshold, 2);
        assert_eq!(config.manager.socket_timeout, Duration::from_secs(40));
        assert_eq!(config.manager.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/buildfarm")
        );
        assert_eq!(config.api.listen, "127.0.0.1:9000");
        assert_eq!(
            config.librarian,
            LibrarianConfig::Http {
                url: "http://librarian.internal:8000".to_string()
            }
        );
        assert_eq!(config.workers.len(), 2);
        assert!(config.workers[0].virtualized);
        assert_eq!(config.workers[0].vm_host.as_deref(), Some("host1"));
        assert!(config.workers[1].manual);
        assert!(config.workers[1].active);
    }

    #[test]
    fn test_defaults() {
        let config = parse_farm_config("").unwrap();
        assert_eq!(config.manager.scan_interval, Duration::from_secs(15));
        assert_eq!(config.manager.cancel_timeout, Duration::from_secs(180));
        assert_eq!(config.manager.reset_threshold, 5);
        assert_eq!(config.manager.reset_failure_threshold, 3);
        assert!(config.database_url.is_none());
        assert!(matches!(config.librarian, LibrarianConfig::Filesystem { .. }));
    }

    #[test]
    fn test_rejects_bad_worker_name() {
        let kdl = r#"worker "Bob_1" url="http://x" processor="386""#;
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_worker() {
        let kdl = r#"
            worker "bob" url="http://a" processor="386"
            worker "bob" url="http://b" processor="386"
        "#;
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_virtualized_worker_needs_vm_host_for_resume() {
        let kdl = r#"
            manager {
                vm-resume-command "ssh ${vm_host} resume ${worker}"
            }
            worker "bob" url="http://bob" processor="386" virtualized=#true
        "#;
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_virtualized_worker_needs_resume_command() {
        let kdl =
            r#"worker "bob" url="http://bob" processor="386" virtualized=#true vm-host="host1""#;
        match parse_farm_config(kdl) {
            Err(ConfigError::MissingField(field)) => assert!(field.contains("vm-resume-command")),
            other => panic!("expected missing vm-resume-command, got {:?}", other.map(|_| ())),
        }

        let kdl = r#"worker "frog" url="http://frog" processor="386""#;
        assert!(parse_farm_config(kdl).is_ok());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let kdl = "manager {\n reset-threshold 0\n}";
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_private_files_need_secret() {
        let kdl = r#"manager { private-file-base "https://private"; }"#;
        assert!(parse_farm_config(kdl).is_err());
    }

    #[test]
    fn test_rejects_bad_urls() {
        let kdl = r#"worker "bob" url="bob:8221" processor="386""#;
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));

        let kdl = r#"
            librarian url="ftp://librarian.internal"
            worker "bob" url="http://bob:8221" processor="386"
        "#;
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_worker_requires_processor() {
        let kdl = r#"worker "bob" url="http://bob""#;
        assert!(matches!(
            parse_farm_config(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }
}
