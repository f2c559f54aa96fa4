//! Sync orchestration: target configuration, the OpenProject issue service,
//! and one-pass runs that isolate per-item normalization failures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use opsync_client::{build_filter, ClientConfig, FilterExpression, OpenProjectClient, RemoteError};
use opsync_core::{
    DurationFormatter, FormatError, NormalizedRecord, Origin, PriorityCode, CONFIG_PREFIX,
};
use opsync_normalize::{NormalizationError, Normalizer, DEFAULT_TIMEZONE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use thiserror::Error;
use tokio::fs;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "opsync-sync";

/// Keys every target must define (without the `openproject.` prefix).
pub const REQUIRED_KEYS: &[&str] = &["url", "key"];

/// Process-wide settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("OPSYNC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./opsync.yaml")),
            user_agent: std::env::var("OPSYNC_USER_AGENT")
                .unwrap_or_else(|_| format!("opsync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("OPSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("[{target}] has no '{key}'")]
    MissingKey { target: String, key: String },
    #[error("[{target}] invalid '{key}': {reason}")]
    InvalidValue {
        target: String,
        key: String,
        reason: String,
    },
    #[error("no target named {0:?} in configuration")]
    UnknownTarget(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsFile {
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

/// One configured target: a name plus its flat `openproject.*` keys.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    pub name: String,
    #[serde(flatten)]
    pub options: BTreeMap<String, YamlValue>,
}

impl TargetsFile {
    pub fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn target(&self, name: &str) -> Result<&TargetEntry, ConfigError> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }
}

fn prefixed(key: &str) -> String {
    format!("{CONFIG_PREFIX}.{key}")
}

fn yaml_text(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_bool_text(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

struct TargetOptions<'a> {
    target: &'a str,
    options: &'a BTreeMap<String, YamlValue>,
}

impl<'a> TargetOptions<'a> {
    fn text(&self, key: &str) -> Option<String> {
        self.options.get(&prefixed(key)).and_then(yaml_text)
    }

    fn invalid(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            target: self.target.to_string(),
            key: prefixed(key),
            reason: reason.into(),
        }
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.text(key).ok_or_else(|| ConfigError::MissingKey {
            target: self.target.to_string(),
            key: prefixed(key),
        })
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.options.get(&prefixed(key)) {
            None | Some(YamlValue::Null) => Ok(default),
            Some(YamlValue::Bool(b)) => Ok(*b),
            Some(other) => yaml_text(other)
                .as_deref()
                .and_then(parse_bool_text)
                .ok_or_else(|| self.invalid(key, "expected a boolean")),
        }
    }
}

/// Checks that every required key is present, before anything else runs.
pub fn validate_config(target: &str, options: &BTreeMap<String, YamlValue>) -> Result<(), ConfigError> {
    let opts = TargetOptions { target, options };
    for key in REQUIRED_KEYS {
        opts.required(key)?;
    }
    Ok(())
}

/// Credential-store identity for a target: `openproject://<login>@<url>/`.
pub fn keyring_service(options: &BTreeMap<String, YamlValue>) -> String {
    let get = |key: &str| {
        options
            .get(&prefixed(key))
            .and_then(yaml_text)
            .unwrap_or_else(|| "None".to_string())
    };
    format!("{CONFIG_PREFIX}://{}@{}/", get("login"), get("url"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceMetadata {
    pub project_name: Option<String>,
    pub url: String,
}

/// Validated per-target settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub target: String,
    pub url: String,
    pub key: String,
    pub login: Option<String>,
    pub verify_ssl: bool,
    pub issue_limit: Option<u32>,
    pub only_if_assigned: bool,
    pub filter_project_id: Option<String>,
    pub project_name: Option<String>,
    pub default_priority: PriorityCode,
    pub timezone: Tz,
}

impl ServiceConfig {
    pub fn from_entry(entry: &TargetEntry) -> Result<Self, ConfigError> {
        Self::from_options(&entry.name, &entry.options)
    }

    pub fn from_options(target: &str, options: &BTreeMap<String, YamlValue>) -> Result<Self, ConfigError> {
        validate_config(target, options)?;
        let opts = TargetOptions { target, options };

        let url = opts.required("url")?.trim_end_matches('/').to_string();
        Url::parse(&url).map_err(|e| opts.invalid("url", e.to_string()))?;

        let issue_limit = match opts.text("issue_limit") {
            None => None,
            Some(text) => match text.parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => return Err(opts.invalid("issue_limit", "expected a positive integer")),
            },
        };

        let default_priority = match opts.text("default_priority") {
            None => PriorityCode::default(),
            Some(text) => text
                .parse::<PriorityCode>()
                .map_err(|e| opts.invalid("default_priority", e.to_string()))?,
        };

        let timezone = match opts.text("timezone") {
            None => DEFAULT_TIMEZONE,
            Some(text) => text
                .parse::<Tz>()
                .map_err(|e| opts.invalid("timezone", e.to_string()))?,
        };

        Ok(Self {
            target: target.to_string(),
            url,
            key: opts.required("key")?,
            login: opts.text("login"),
            verify_ssl: opts.bool_or("verify_ssl", true)?,
            issue_limit,
            only_if_assigned: opts.bool_or("only_if_assigned", false)?,
            filter_project_id: opts.text("filter_project_id"),
            project_name: opts.text("project_name"),
            default_priority,
            timezone,
        })
    }

    pub fn origin(&self) -> Origin {
        Origin {
            default_priority: self.default_priority,
            project_name: self.project_name.clone(),
        }
    }

    pub fn metadata(&self) -> ServiceMetadata {
        ServiceMetadata {
            project_name: self.project_name.clone(),
            url: self.url.clone(),
        }
    }
}

/// A remote system whose items become task records.
///
/// `fetch_raw` is the only I/O; `normalize` handles one item in isolation.
#[async_trait]
pub trait IssueService: Send + Sync {
    fn target(&self) -> &str;

    fn service_metadata(&self) -> ServiceMetadata;

    async fn fetch_raw(&self) -> Result<Vec<JsonValue>, RemoteError>;

    fn normalize(&self, raw: &JsonValue) -> Result<NormalizedRecord, NormalizationError>;
}

pub struct OpenProjectService {
    config: ServiceConfig,
    client: OpenProjectClient,
    normalizer: Normalizer,
    filter: FilterExpression,
}

impl OpenProjectService {
    pub fn new(
        config: ServiceConfig,
        sync: &SyncConfig,
        formatter: Arc<dyn DurationFormatter>,
    ) -> Result<Self, RemoteError> {
        let client = OpenProjectClient::new(ClientConfig {
            base_url: config.url.clone(),
            api_key: config.key.clone(),
            verify_ssl: config.verify_ssl,
            timeout: Duration::from_secs(sync.http_timeout_secs),
            user_agent: Some(sync.user_agent.clone()),
        })?;
        let mut normalizer = Normalizer::new(formatter).with_timezone(config.timezone);
        if let Ok(base) = Url::parse(&config.url) {
            normalizer = normalizer.with_base_url(base);
        }
        let filter = build_filter(config.only_if_assigned, config.filter_project_id.as_deref());
        Ok(Self {
            config,
            client,
            normalizer,
            filter,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Lazily normalizes already-fetched items, in the order the API sorted them.
    pub fn records<'a>(
        &'a self,
        raw: &'a [JsonValue],
    ) -> impl Iterator<Item = Result<NormalizedRecord, NormalizationError>> + 'a {
        let origin = self.config.origin();
        raw.iter().map(move |item| self.normalizer.normalize(item, &origin))
    }
}

#[async_trait]
impl IssueService for OpenProjectService {
    fn target(&self) -> &str {
        &self.config.target
    }

    fn service_metadata(&self) -> ServiceMetadata {
        self.config.metadata()
    }

    async fn fetch_raw(&self) -> Result<Vec<JsonValue>, RemoteError> {
        self.client
            .find_work_packages(&self.filter, self.config.issue_limit)
            .await
    }

    fn normalize(&self, raw: &JsonValue) -> Result<NormalizedRecord, NormalizationError> {
        self.normalizer.normalize(raw, &self.config.origin())
    }
}

/// Adapter to Taskwarrior's calculator: `task calc "<N> hours"`.
#[derive(Debug, Clone)]
pub struct TaskCalcFormatter {
    binary: PathBuf,
}

impl Default for TaskCalcFormatter {
    fn default() -> Self {
        Self::new("task")
    }
}

impl TaskCalcFormatter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl DurationFormatter for TaskCalcFormatter {
    fn format_hours(&self, rendered: &str, _hours: f64) -> Result<String, FormatError> {
        let output = Command::new(&self.binary)
            .args(["rc.verbose=nothing", "rc.hooks=off", "calc", rendered])
            .output()?;
        if !output.status.success() {
            return Err(FormatError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next().unwrap_or_default().trim_end();
        if first.is_empty() {
            return Err(FormatError::Empty(rendered.to_string()));
        }
        Ok(first.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item_id: Option<i64>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub normalized: usize,
    pub failures: Vec<ItemFailure>,
}

impl SyncRunSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TargetRun {
    pub summary: SyncRunSummary,
    pub records: Vec<NormalizedRecord>,
}

/// Runs `f` without stalling other tasks on a multi-threaded runtime; the
/// duration formatter may block on a `task` subprocess.
fn normalize_off_reactor<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// One fetch + normalize pass over a single target.
///
/// A fetch failure aborts the pass. Items that fail to normalize are logged,
/// recorded in the summary, and skipped; the rest keep their API order.
pub async fn sync_target(service: &dyn IssueService) -> Result<TargetRun, RemoteError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("sync_target", %run_id, target_name = service.target());

    async {
        let raw = service.fetch_raw().await?;
        let mut records = Vec::with_capacity(raw.len());
        let mut failures = Vec::new();

        for item in &raw {
            match normalize_off_reactor(|| service.normalize(item)) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(item_id = ?err.item_id(), error = %err, "skipping work package");
                    failures.push(ItemFailure {
                        item_id: err.item_id(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = SyncRunSummary {
            run_id,
            target: service.target().to_string(),
            started_at,
            finished_at: Utc::now(),
            fetched: raw.len(),
            normalized: records.len(),
            failures,
        };
        info!(
            fetched = summary.fetched,
            normalized = summary.normalized,
            failed = summary.failures.len(),
            "sync pass finished"
        );
        Ok::<_, RemoteError>(TargetRun { summary, records })
    }
    .instrument(span)
    .await
}

/// Validates every configured target without touching the network.
pub async fn validate_targets(config: &SyncConfig) -> Result<Vec<ServiceConfig>> {
    let file = TargetsFile::load(&config.config_path).await?;
    file.targets
        .iter()
        .map(|entry| ServiceConfig::from_entry(entry).map_err(anyhow::Error::from))
        .collect()
}

/// Runs one pass for every target (or only `only_target`), in file order.
pub async fn run_sync_once(
    config: &SyncConfig,
    only_target: Option<&str>,
    formatter: Arc<dyn DurationFormatter>,
) -> Result<Vec<TargetRun>> {
    let file = TargetsFile::load(&config.config_path).await?;
    let entries: Vec<&TargetEntry> = match only_target {
        Some(name) => vec![file.target(name)?],
        None => file.targets.iter().collect(),
    };

    let services = entries
        .into_iter()
        .map(|entry| -> Result<OpenProjectService> {
            let service_config = ServiceConfig::from_entry(entry)?;
            OpenProjectService::new(service_config, config, formatter.clone())
                .with_context(|| format!("setting up target {}", entry.name))
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(targets = services.len(), "configured services");

    let mut runs = Vec::with_capacity(services.len());
    for service in &services {
        let run = sync_target(service)
            .await
            .with_context(|| format!("syncing target {}", service.target()))?;
        runs.push(run);
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::IsoDurationFormatter;
    use serde_json::json;

    const SAMPLE: &str = r#"
targets:
  - name: work
    openproject.url: https://op.example.com/api/v3/work_packages/
    openproject.key: abc123
    openproject.login: dana
    openproject.verify_ssl: "no"
    openproject.issue_limit: 50
    openproject.only_if_assigned: true
    openproject.filter_project_id: 12
    openproject.default_priority: h
  - name: side
    openproject.url: https://side.example.org/api/v3/work_packages
    openproject.key: xyz
    openproject.project_name: hobby
    openproject.timezone: Europe/Berlin
"#;

    fn sample() -> TargetsFile {
        TargetsFile::parse(SAMPLE, "sample.yaml").unwrap()
    }

    #[test]
    fn parses_typed_target_settings() {
        let file = sample();
        let work = ServiceConfig::from_entry(file.target("work").unwrap()).unwrap();
        assert_eq!(work.url, "https://op.example.com/api/v3/work_packages");
        assert_eq!(work.key, "abc123");
        assert_eq!(work.login.as_deref(), Some("dana"));
        assert!(!work.verify_ssl);
        assert_eq!(work.issue_limit, Some(50));
        assert!(work.only_if_assigned);
        assert_eq!(work.filter_project_id.as_deref(), Some("12"));
        assert_eq!(work.default_priority, PriorityCode::H);
        assert_eq!(work.timezone, DEFAULT_TIMEZONE);
        assert_eq!(work.project_name, None);

        let side = ServiceConfig::from_entry(file.target("side").unwrap()).unwrap();
        assert!(side.verify_ssl);
        assert_eq!(side.issue_limit, None);
        assert!(!side.only_if_assigned);
        assert_eq!(side.default_priority, PriorityCode::M);
        assert_eq!(side.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(
            side.metadata(),
            ServiceMetadata {
                project_name: Some("hobby".into()),
                url: "https://side.example.org/api/v3/work_packages".into(),
            }
        );
    }

    #[test]
    fn missing_required_key_names_target_and_key() {
        let file = TargetsFile::parse(
            "targets:\n  - name: broken\n    openproject.url: https://x.example\n",
            "t.yaml",
        )
        .unwrap();
        let err = ServiceConfig::from_entry(&file.targets[0]).unwrap_err();
        assert_eq!(err.to_string(), "[broken] has no 'openproject.key'");

        let file = TargetsFile::parse("targets:\n  - name: empty\n    openproject.key: k\n", "t.yaml").unwrap();
        let err = validate_config("empty", &file.targets[0].options).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key, .. } if key == "openproject.url"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = "targets:\n  - name: t\n    openproject.url: https://x.example\n    openproject.key: k\n";
        for (extra, key) in [
            ("    openproject.issue_limit: 0\n", "openproject.issue_limit"),
            ("    openproject.default_priority: Z\n", "openproject.default_priority"),
            ("    openproject.verify_ssl: maybe\n", "openproject.verify_ssl"),
            ("    openproject.timezone: Mars/Olympus\n", "openproject.timezone"),
        ] {
            let file = TargetsFile::parse(&format!("{base}{extra}"), "t.yaml").unwrap();
            let err = ServiceConfig::from_entry(&file.targets[0]).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key: k, .. } if k == key),
                "{extra}: {err}"
            );
        }
    }

    #[test]
    fn keyring_identity_uses_login_and_url() {
        let file = sample();
        assert_eq!(
            keyring_service(&file.target("work").unwrap().options),
            "openproject://dana@https://op.example.com/api/v3/work_packages//"
        );
        assert_eq!(
            keyring_service(&file.target("side").unwrap().options),
            "openproject://None@https://side.example.org/api/v3/work_packages/"
        );
    }

    #[test]
    fn unknown_target_is_config_error() {
        assert!(matches!(sample().target("nope"), Err(ConfigError::UnknownTarget(_))));
    }

    struct StaticService {
        items: Vec<JsonValue>,
        normalizer: Normalizer,
    }

    #[async_trait]
    impl IssueService for StaticService {
        fn target(&self) -> &str {
            "static"
        }

        fn service_metadata(&self) -> ServiceMetadata {
            ServiceMetadata {
                project_name: None,
                url: "https://static.example".into(),
            }
        }

        async fn fetch_raw(&self) -> Result<Vec<JsonValue>, RemoteError> {
            Ok(self.items.clone())
        }

        fn normalize(&self, raw: &JsonValue) -> Result<NormalizedRecord, NormalizationError> {
            self.normalizer.normalize(raw, &Origin::default())
        }
    }

    fn item(id: i64, subject: Option<&str>) -> JsonValue {
        let mut value = json!({
            "id": id,
            "_links": {"type": {"title": "Task"}, "project": {"title": "Ops"}}
        });
        if let Some(subject) = subject {
            value["subject"] = json!(subject);
        }
        value
    }

    #[tokio::test]
    async fn failing_item_does_not_abort_the_pass() {
        let service = StaticService {
            items: vec![item(1, Some("one")), item(2, None), item(3, Some("three"))],
            normalizer: Normalizer::new(Arc::new(IsoDurationFormatter)),
        };
        let run = sync_target(&service).await.unwrap();
        assert_eq!(run.summary.fetched, 3);
        assert_eq!(run.summary.normalized, 2);
        assert!(!run.summary.is_clean());
        assert_eq!(run.summary.failures[0].item_id, Some(2));
        assert!(run.summary.failures[0].error.contains("subject"));
        let ids = run.records.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3]);
    }

    struct WaitForSignal(std::sync::Mutex<std::sync::mpsc::Receiver<()>>);

    impl DurationFormatter for WaitForSignal {
        fn format_hours(&self, rendered: &str, _hours: f64) -> Result<String, FormatError> {
            let signal = self.0.lock().unwrap();
            signal
                .recv_timeout(Duration::from_secs(5))
                .map(|()| "PT1H".to_string())
                .map_err(|_| FormatError::Empty(rendered.to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn blocking_formatter_leaves_the_worker_free() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut raw = item(7, Some("seven"));
        raw["estimatedTime"] = json!("PT1H");
        let service = Arc::new(StaticService {
            items: vec![raw],
            normalizer: Normalizer::new(Arc::new(WaitForSignal(std::sync::Mutex::new(rx)))),
        });

        let pass = tokio::spawn(async move { sync_target(service.as_ref()).await });
        tokio::spawn(async move { tx.send(()).unwrap() });

        let run = pass.await.unwrap().unwrap();
        assert!(run.summary.is_clean(), "{:?}", run.summary.failures);
        assert_eq!(run.records[0].estimated_hours.as_deref(), Some("PT1H"));
    }

    #[test]
    fn service_records_follow_api_order() {
        let file = sample();
        let config = ServiceConfig::from_entry(file.target("side").unwrap()).unwrap();
        let service = OpenProjectService::new(
            config,
            &SyncConfig::from_env(),
            Arc::new(IsoDurationFormatter),
        )
        .unwrap();
        let raw = vec![item(9, Some("nine")), item(4, None), item(5, Some("a &lt; b"))];
        let results = service.records(&raw).collect::<Vec<_>>();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().tags, vec!["OP#9", "hobby"]);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().subject, "a < b");
        assert_eq!(service.service_metadata().project_name.as_deref(), Some("hobby"));
    }

    #[cfg(unix)]
    #[test]
    fn task_calc_formatter_returns_first_line() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("task");
        std::fs::write(&script, "#!/bin/sh\n[ \"$3\" = calc ] || exit 2\necho PT2H30M\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let formatter = TaskCalcFormatter::new(&script);
        assert_eq!(formatter.format_hours("2.5 hours", 2.5).unwrap(), "PT2H30M");

        let failing = dir.path().join("failing");
        std::fs::write(&failing, "#!/bin/sh\necho boom >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&failing, std::fs::Permissions::from_mode(0o755)).unwrap();
        let err = TaskCalcFormatter::new(&failing)
            .format_hours("1.0 hours", 1.0)
            .unwrap_err();
        assert!(matches!(err, FormatError::Failed { ref stderr, .. } if stderr == "boom"));
    }
}
