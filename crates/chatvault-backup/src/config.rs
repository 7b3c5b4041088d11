use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Every problem found in the environment, reported together.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

#[derive(Clone)]
pub struct Config {
    pub token: String,
    pub channels: Vec<String>,
    pub db_path: PathBuf,
    pub storage_dir: PathBuf,
    pub api_base: String,
    pub rate_per_minute: NonZeroU32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub page_size: u32,
    pub http_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub max_file_bytes: u64,
    pub full_resync: bool,
    pub skip_files: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("channels", &self.channels)
            .field("db_path", &self.db_path)
            .field("storage_dir", &self.storage_dir)
            .field("api_base", &self.api_base)
            .field("rate_per_minute", &self.rate_per_minute)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("page_size", &self.page_size)
            .field("http_timeout", &self.http_timeout)
            .field("run_timeout", &self.run_timeout)
            .field("max_file_bytes", &self.max_file_bytes)
            .field("full_resync", &self.full_resync)
            .field("skip_files", &self.skip_files)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = Reader {
            lookup,
            problems: Vec::new(),
        };

        let token = env.required("CHATVAULT_TOKEN");
        let channels = env
            .required("CHATVAULT_CHANNELS")
            .map(|raw| parse_channels(&raw))
            .unwrap_or_default();
        if env.get("CHATVAULT_CHANNELS").is_some() && channels.is_empty() {
            env.problems
                .push("CHATVAULT_CHANNELS contains no channel ids".to_string());
        }

        let db_path: PathBuf = env.string("CHATVAULT_DB_PATH", "chatvault.db").into();
        let storage_dir: PathBuf = env.string("CHATVAULT_STORAGE_DIR", "./storage").into();
        let api_base = env.string("CHATVAULT_API_BASE", "https://slack.com/api");
        let rate_per_minute = NonZeroU32::new(env.parsed("CHATVAULT_RATE_PER_MINUTE", 50u32));
        if rate_per_minute.is_none() {
            env.problems
                .push("CHATVAULT_RATE_PER_MINUTE must be at least 1".to_string());
        }
        let max_attempts = env.parsed("CHATVAULT_MAX_ATTEMPTS", 5u32);
        if max_attempts == 0 {
            env.problems
                .push("CHATVAULT_MAX_ATTEMPTS must be at least 1".to_string());
        }
        let backoff_base = Duration::from_millis(env.parsed("CHATVAULT_BACKOFF_BASE_MS", 1000u64));
        let page_size = env.parsed("CHATVAULT_PAGE_SIZE", 200u32);
        if !(1..=1000).contains(&page_size) {
            env.problems
                .push(format!("CHATVAULT_PAGE_SIZE must be between 1 and 1000, got {}", page_size));
        }
        let http_timeout = Duration::from_secs(env.parsed("CHATVAULT_HTTP_TIMEOUT_SECS", 30u64));
        let run_timeout = env
            .optional::<u64>("CHATVAULT_RUN_TIMEOUT_SECS")
            .map(Duration::from_secs);
        let max_file_bytes = env.parsed("CHATVAULT_MAX_FILE_BYTES", 1024 * 1024 * 1024u64);
        let full_resync = env.flag("CHATVAULT_FULL_RESYNC");
        let skip_files = env.flag("CHATVAULT_SKIP_FILES");

        if !env.problems.is_empty() {
            return Err(ConfigError {
                problems: env.problems,
            });
        }

        Ok(Self {
            token: token.unwrap_or_default(),
            channels,
            db_path,
            storage_dir,
            api_base,
            rate_per_minute: rate_per_minute.unwrap_or(NonZeroU32::MIN),
            max_attempts,
            backoff_base,
            page_size,
            http_timeout,
            run_timeout,
            max_file_bytes,
            full_resync,
            skip_files,
        })
    }
}

/// Comma separated ids, trimmed, duplicates dropped, order kept.
fn parse_channels(raw: &str) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !channels.iter().any(|c| c == id) {
            channels.push(id.to_string());
        }
    }
    channels
}

struct Reader<F> {
    lookup: F,
    problems: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    /// Set and not blank.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&mut self, key: &str) -> Option<String> {
        let value = self.get(key);
        if value.is_none() {
            self.problems.push(format!("{} is required", key));
        }
        value
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn optional<T: FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.problems.push(format!("{} has invalid value {:?}", key, raw));
                None
            }
        }
    }

    fn parsed<T: FromStr>(&mut self, key: &str, default: T) -> T {
        self.optional(key).unwrap_or(default)
    }

    fn flag(&mut self, key: &str) -> bool {
        let Some(raw) = self.get(key) else {
            return false;
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                self.problems.push(format!("{} must be true or false, got {:?}", key, raw));
                false
            }
        }
    }
}
