// Judge configuration: file defaults first, then environment overrides
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/judge.json";

/// How actual and expected outputs are normalized before exact comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// Trim leading and trailing whitespace of the whole output only
    #[default]
    Trim,
    /// CRLF to LF, trim trailing whitespace per line, then trim the whole output
    TrimLines,
}

impl std::str::FromStr for ComparisonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trim" => Ok(ComparisonPolicy::Trim),
            "trim_lines" => Ok(ComparisonPolicy::TrimLines),
            other => Err(format!("unknown comparison policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitPolicy {
    pub min_time_secs: u32,
    pub max_time_secs: u32,
    pub min_memory_mb: u32,
    pub max_memory_mb: u32,
    pub default_time_secs: u32,
    pub default_memory_mb: u32,
    pub compile_timeout_secs: u64,
    pub compile_memory_mb: u64,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
    pub max_test_input_bytes: usize,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            min_time_secs: 1,
            max_time_secs: 30,
            min_memory_mb: 32,
            max_memory_mb: 512,
            default_time_secs: 5,
            default_memory_mb: 128,
            compile_timeout_secs: 10,
            compile_memory_mb: 1024,
            max_output_bytes: 1024 * 1024,
            max_source_bytes: 1024 * 1024,
            max_test_input_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            queue_capacity: 64,
        }
    }
}

/// `nobody`; submissions never run as root
pub const UNPRIVILEGED_ID: u32 = 65534;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub workspace_root: PathBuf,
    /// Run untrusted code in a fresh network namespace (needs CAP_SYS_ADMIN)
    pub isolate_network: bool,
    pub run_as_uid: Option<u32>,
    pub run_as_gid: Option<u32>,
    pub max_open_files: u64,
    /// RLIMIT_NPROC is per-uid; only meaningful together with `run_as_uid`
    pub max_processes: Option<u64>,
    pub max_file_size_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("gavel"),
            isolate_network: true,
            run_as_uid: None,
            run_as_gid: None,
            max_open_files: 64,
            max_processes: None,
            max_file_size_bytes: 16 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Credentials submissions run with when the judge's effective uid is `euid`.
    ///
    /// An explicit `run_as_uid` always wins. Without one, a root judge drops
    /// to [`UNPRIVILEGED_ID`] and an unprivileged judge keeps its own ids.
    pub fn effective_run_as(&self, euid: u32) -> Option<(u32, u32)> {
        match (self.run_as_uid, self.run_as_gid) {
            (Some(uid), gid) => Some((uid, gid.unwrap_or(uid))),
            (None, gid) if euid == 0 => Some((UNPRIVILEGED_ID, gid.unwrap_or(UNPRIVILEGED_ID))),
            (None, _) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub result_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            result_ttl_secs: 86400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub limits: LimitPolicy,
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub store: StoreConfig,
    pub comparison: ComparisonPolicy,
    pub bind_addr: String,
    pub languages_path: PathBuf,
    pub exercises_path: PathBuf,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            limits: LimitPolicy::default(),
            scheduler: SchedulerConfig::default(),
            sandbox: SandboxConfig::default(),
            store: StoreConfig::default(),
            comparison: ComparisonPolicy::default(),
            bind_addr: "0.0.0.0:3000".to_string(),
            languages_path: PathBuf::from("config/languages.json"),
            exercises_path: PathBuf::from("config/exercises.json"),
        }
    }
}

impl JudgeConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read {}: {}", path.as_ref().display(), e))?;

        let config: JudgeConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse {}: {}", path.as_ref().display(), e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `config/judge.json` when present, then apply environment overrides
    pub fn load_default() -> Result<Self, String> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment-like lookup
    pub fn apply_env_from<F>(&mut self, get: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("GAVEL_WORKERS") {
            self.scheduler.workers = parse_env("GAVEL_WORKERS", &v)?;
        }
        if let Some(v) = get("GAVEL_QUEUE_CAPACITY") {
            self.scheduler.queue_capacity = parse_env("GAVEL_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("GAVEL_WORKSPACE_ROOT") {
            self.sandbox.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = get("GAVEL_COMPARISON") {
            self.comparison = v.parse()?;
        }
        if let Some(v) = get("GAVEL_ISOLATE_NETWORK") {
            self.sandbox.isolate_network = parse_env("GAVEL_ISOLATE_NETWORK", &v)?;
        }
        if let Some(v) = get("GAVEL_RUN_AS_UID") {
            self.sandbox.run_as_uid = Some(parse_env("GAVEL_RUN_AS_UID", &v)?);
        }
        if let Some(v) = get("GAVEL_RUN_AS_GID") {
            self.sandbox.run_as_gid = Some(parse_env("GAVEL_RUN_AS_GID", &v)?);
        }
        if let Some(v) = get("REDIS_URL") {
            self.store.redis_url = Some(v);
        }
        if let Some(v) = get("GAVEL_BIND") {
            self.bind_addr = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        let l = &self.limits;
        if l.min_time_secs == 0 || l.min_time_secs > l.max_time_secs {
            return Err(format!(
                "invalid time bounds {}..={}",
                l.min_time_secs, l.max_time_secs
            ));
        }
        if l.min_memory_mb == 0 || l.min_memory_mb > l.max_memory_mb {
            return Err(format!(
                "invalid memory bounds {}..={}",
                l.min_memory_mb, l.max_memory_mb
            ));
        }
        if !(l.min_time_secs..=l.max_time_secs).contains(&l.default_time_secs)
            || !(l.min_memory_mb..=l.max_memory_mb).contains(&l.default_memory_mb)
        {
            return Err("default limits fall outside configured bounds".to_string());
        }
        if self.scheduler.workers == 0 {
            return Err("scheduler.workers must be at least 1".to_string());
        }
        if self.scheduler.queue_capacity == 0 {
            return Err("scheduler.queue_capacity must be at least 1".to_string());
        }
        if self.sandbox.run_as_uid == Some(0) || self.sandbox.run_as_gid == Some(0) {
            return Err("sandbox.run_as_uid and run_as_gid must not be root".to_string());
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("Invalid value for {}: '{}'", key, value))
}
