use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

use crate::{coordinator::CoordinatorSettings, credentials::CredentialOrder};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_TUNECACHE_PORT: u16 = 8000;
pub const DEFAULT_TUNECACHE_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_COOKIES_PATH: &str = "cookies";
pub const DEFAULT_MIN_FILE_SIZE: u64 = 100 * 1024;
pub const DEFAULT_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_FETCH_RETRIES: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_HANDLE_CACHE_FILE: &str = "cache.json";
pub const DEFAULT_BOT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub download_dir: PathBuf,
    pub cookies_path: PathBuf,
    pub min_file_size: u64,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub worker_pool_size: usize,
    pub wait_timeout: Duration,
    pub fetch_retries: u32,
    pub attempt_timeout: Duration,
    pub credential_order: CredentialOrder,
    pub credential_seed: Option<u64>,
    /// `None` keeps the built-in client list; an empty list disables the
    /// `player_client` extractor argument.
    pub player_clients: Option<Vec<String>>,
    pub ytdlp_bin: PathBuf,
    pub handle_cache_file: PathBuf,
    pub archive: Option<ArchiveSettings>,
}

/// Channel archiving credentials; present only when both the bot token and
/// the channel id are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSettings {
    pub bot_token: String,
    pub channel_id: String,
    pub api_base: String,
}

impl Settings {
    pub fn coordinator(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            worker_pool_size: self.worker_pool_size,
            wait_timeout: self.wait_timeout,
            max_retries: self.fetch_retries,
            attempt_timeout: self.attempt_timeout,
            retention: self.retention,
        }
    }
}

/// Values supplied on the command line; they win over the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub download_dir: Option<PathBuf>,
    pub cookies_path: Option<PathBuf>,
    pub worker_pool_size: Option<usize>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

/// Builds settings from `.env` values and an injected environment lookup.
pub fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let path_value = |key: &str, fallback: &str| {
        lookup(key)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(fallback))
    };
    let secs = |key: &str, fallback: u64| Duration::from_secs(parse_or_default(key, lookup(key), fallback));

    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup("TUNECACHE_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TUNECACHE_HOST.to_string());
    let port = overrides
        .port
        .unwrap_or_else(|| parse_or_default("TUNECACHE_PORT", lookup("TUNECACHE_PORT"), DEFAULT_TUNECACHE_PORT));

    let worker_pool_size = overrides.worker_pool_size.unwrap_or_else(|| {
        parse_or_default(
            "WORKER_POOL_SIZE",
            lookup("WORKER_POOL_SIZE"),
            DEFAULT_WORKER_POOL_SIZE,
        )
    });
    if worker_pool_size == 0 {
        bail!("WORKER_POOL_SIZE must be at least 1");
    }

    let credential_order = match lookup("CREDENTIAL_ORDER") {
        Some(value) => CredentialOrder::parse(&value).unwrap_or_else(|| {
            warn!("ignoring unknown CREDENTIAL_ORDER {value:?}, using fixed order");
            CredentialOrder::Fixed
        }),
        None => CredentialOrder::default(),
    };
    let credential_seed = lookup("CREDENTIAL_SEED").and_then(|value| match value.parse::<u64>() {
        Ok(seed) => Some(seed),
        Err(_) => {
            warn!("ignoring non-numeric CREDENTIAL_SEED {value:?}");
            None
        }
    });

    let player_clients = lookup("YTDLP_PLAYER_CLIENTS").map(|value| {
        if value.trim().eq_ignore_ascii_case("none") {
            return Vec::new();
        }
        value
            .split(',')
            .map(str::trim)
            .filter(|client| !client.is_empty())
            .map(str::to_string)
            .collect()
    });

    let archive = match (lookup("BOT_TOKEN"), lookup("CHANNEL_ID")) {
        (Some(bot_token), Some(channel_id)) => Some(ArchiveSettings {
            bot_token,
            channel_id,
            api_base: lookup("BOT_API_BASE")
                .unwrap_or_else(|| DEFAULT_BOT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        }),
        _ => None,
    };

    Ok(Settings {
        host,
        port,
        download_dir: overrides
            .download_dir
            .unwrap_or_else(|| path_value("DOWNLOAD_DIR", DEFAULT_DOWNLOAD_DIR)),
        cookies_path: overrides
            .cookies_path
            .unwrap_or_else(|| path_value("COOKIES_PATH", DEFAULT_COOKIES_PATH)),
        min_file_size: parse_or_default("MIN_FILE_SIZE", lookup("MIN_FILE_SIZE"), DEFAULT_MIN_FILE_SIZE),
        retention: secs("RETENTION_SECS", DEFAULT_RETENTION_SECS),
        sweep_interval: secs("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
        worker_pool_size,
        wait_timeout: secs("WAIT_TIMEOUT_SECS", DEFAULT_WAIT_TIMEOUT_SECS),
        fetch_retries: parse_or_default("FETCH_RETRIES", lookup("FETCH_RETRIES"), DEFAULT_FETCH_RETRIES),
        attempt_timeout: secs("ATTEMPT_TIMEOUT_SECS", DEFAULT_ATTEMPT_TIMEOUT_SECS),
        credential_order,
        credential_seed,
        player_clients,
        ytdlp_bin: overrides
            .ytdlp_bin
            .unwrap_or_else(|| path_value("YTDLP_BIN", DEFAULT_YTDLP_BIN)),
        handle_cache_file: path_value("HANDLE_CACHE_FILE", DEFAULT_HANDLE_CACHE_FILE),
        archive,
    })
}

fn parse_or_default<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    raw.parse().unwrap_or_else(|_| {
        warn!("ignoring unparseable {key}={raw:?}, using the default");
        default
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
