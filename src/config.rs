use std::{path::PathBuf, time::Duration};

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

pub const DEFAULT_CREDENTIAL_TTL: u64 = 86_400;

pub const TELNYX_API_BASE_URL: &str = "https://api.telnyx.com/v2";
pub const DEFAULT_REALM: &str = "sip.telnyx.com";
pub const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun:stun.telnyx.com:3478", "stun:stun.telnyx.com:3479"];
pub const DEFAULT_TURN_SERVER: &str = "turn:turn.telnyx.com:3478?transport=udp";
pub const PLACEHOLDER_USERNAME: &str = "user";

pub const API_KEY_ENV: &str = "TELNYX_API_KEY";
pub const API_BASE_URL_ENV: &str = "TELNYX_API_BASE_URL";
pub const WORKER_BIN_ENV: &str = "WEBRTC_WORKER_BIN";
pub const VERBOSE_ENV: &str = "WEBRTC_VERBOSE";

pub const WORKER_BIN_NAME: &str = "webrtc-worker";

/// Startup data handed to a worker, whichever way it is launched.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub api_key: Option<String>,
    pub api_base_url: String,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        WorkerConfig {
            api_key: non_empty_var(API_KEY_ENV),
            api_base_url: non_empty_var(API_BASE_URL_ENV)
                .unwrap_or_else(|| TELNYX_API_BASE_URL.to_owned()),
        }
    }
}

/// Everything the supervisor needs: the worker's startup data plus its own
/// timing policy.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub worker: WorkerConfig,
    pub worker_binary: Option<PathBuf>,

    pub startup_timeout: Duration,
    pub command_timeout: Duration,
    pub health_check_timeout: Duration,
    pub health_check_interval: Duration,
    pub shutdown_grace: Duration,

    pub restart_backoff: Duration,
    pub max_restart_attempts: u32,
}

impl ServiceConfig {
    pub fn new(api_key: Option<String>) -> Self {
        ServiceConfig {
            worker: WorkerConfig {
                api_key,
                api_base_url: TELNYX_API_BASE_URL.to_owned(),
            },
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        ServiceConfig {
            worker: WorkerConfig::from_env(),
            worker_binary: non_empty_var(WORKER_BIN_ENV).map(PathBuf::from),
            ..Default::default()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            worker: WorkerConfig {
                api_key: None,
                api_base_url: TELNYX_API_BASE_URL.to_owned(),
            },
            worker_binary: None,

            startup_timeout: STARTUP_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            health_check_timeout: HEALTH_CHECK_TIMEOUT,
            health_check_interval: HEALTH_CHECK_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,

            restart_backoff: RESTART_BACKOFF,
            max_restart_attempts: MAX_RESTART_ATTEMPTS,
        }
    }
}

/// The worker binary installed next to the running executable.
pub fn default_worker_binary() -> std::io::Result<PathBuf> {
    let current = std::env::current_exe()?;
    let dir = current.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "current executable has no parent directory",
        )
    })?;

    Ok(dir.join(format!("{}{}", WORKER_BIN_NAME, std::env::consts::EXE_SUFFIX)))
}

/// Debug-level logging when `WEBRTC_VERBOSE` is set; `RUST_LOG` still wins.
pub fn verbose_from_env() -> bool {
    non_empty_var(VERBOSE_ENV).is_some()
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = ServiceConfig::default();

        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.restart_backoff, Duration::from_secs(5));
        assert_eq!(config.max_restart_attempts, 3);
        assert!(config.worker.api_key.is_none());
    }

    #[test]
    fn default_worker_binary_sits_beside_current_exe() {
        let binary = default_worker_binary().unwrap();
        let current = std::env::current_exe().unwrap();

        assert_eq!(binary.parent(), current.parent());
        assert!(binary
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(WORKER_BIN_NAME));
    }
}
