use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

use crate::error::ProbeError;

/// CPU sample rate the runtime applies on its own when none is requested.
/// Pre-setting the rate is skipped when it matches this value so the runtime
/// does not warn about a redundant rate change.
pub const RUNTIME_DEFAULT_CPU_SAMPLE_RATE_HZ: u32 = 100;

/// Read-only configuration snapshot for the probe.
///
/// Produced once by [`Configuration::from_environment`] (defaults → ini file
/// → environment) or assembled manually for embedding scenarios. The probe
/// never mutates it after construction.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Agent socket in `network://address` form
    /// (e.g. `tcp://127.0.0.1:8307`, `unix:///var/run/blackfire/agent.sock`).
    pub agent_socket: String,

    /// Blackfire API endpoint the signing request goes to.
    pub http_endpoint: String,

    /// Pre-supplied signed query, present when the host was launched by the
    /// CLI wrapper. When set, no signing round-trip is needed.
    pub blackfire_query: Option<String>,

    /// Client ID for the signing request.
    pub client_id: String,

    /// Client token for the signing request.
    pub client_token: String,

    /// Server ID for the `Blackfire-Auth` agent header.
    pub server_id: String,

    /// Server token for the `Blackfire-Auth` agent header.
    pub server_token: String,

    /// Time before dropping an unresponsive agent connection. Default: 250ms.
    pub agent_timeout: Duration,

    /// Absolute ceiling on a profile's duration; user-supplied durations are
    /// clamped to it. Default: 10 minutes.
    pub max_profile_duration: Duration,

    /// Rate at which CPU samples are taken. Default: 100 Hz.
    pub cpu_sample_rate_hz: u32,

    /// Verbosity of the probe's own logging: the CLI's numeric levels
    /// (1=error .. 4=debug) or a tracing filter directive. Default: "info".
    pub log_level: String,

    /// When set, raw sampler buffers are dumped there whenever a profile ends.
    pub pprof_dump_dir: Option<PathBuf>,

    /// Disables the probe unless a query is present. All operations become
    /// silent no-ops while disabled this way.
    pub on_demand_only: bool,

    /// Path of the ini config file; None means "search default locations".
    pub config_file: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            agent_socket: default_agent_socket(),
            http_endpoint: default_http_endpoint(),
            blackfire_query: None,
            client_id: String::new(),
            client_token: String::new(),
            server_id: String::new(),
            server_token: String::new(),
            agent_timeout: default_agent_timeout(),
            max_profile_duration: default_max_profile_duration(),
            cpu_sample_rate_hz: RUNTIME_DEFAULT_CPU_SAMPLE_RATE_HZ,
            log_level: default_log_level(),
            pprof_dump_dir: None,
            on_demand_only: false,
            config_file: None,
        }
    }
}

// --- Default value functions ---

fn default_agent_socket() -> String {
    if cfg!(target_os = "windows") {
        "tcp://127.0.0.1:8307".to_string()
    } else if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            "unix:///opt/homebrew/var/run/blackfire-agent.sock".to_string()
        } else {
            "unix:///usr/local/var/run/blackfire-agent.sock".to_string()
        }
    } else {
        "unix:///var/run/blackfire/agent.sock".to_string()
    }
}

fn default_http_endpoint() -> String {
    "https://blackfire.io".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_agent_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_max_profile_duration() -> Duration {
    Duration::from_secs(600)
}

// --- Loading and validation ---

impl Configuration {
    /// Build a configuration from the process environment.
    ///
    /// Order, later steps overriding earlier ones: built-in defaults, the
    /// `[blackfire]` section of the ini config file, then `BLACKFIRE_*`
    /// environment variables. The result is validated before being returned.
    pub fn from_environment() -> Result<Self, ProbeError> {
        let mut cfg = Self::empty();
        cfg.apply_env();
        cfg.apply_ini_file();
        cfg.fill_defaults();
        // Install the probe's subscriber before validation so bad
        // configuration is diagnosable; a host-installed subscriber wins.
        crate::log::init(&cfg.log_level);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fill unset fields with defaults and validate a manually assembled
    /// configuration.
    pub fn finalize(mut self) -> Result<Self, ProbeError> {
        self.fill_defaults();
        self.validate()?;
        Ok(self)
    }

    fn empty() -> Self {
        Self {
            agent_socket: String::new(),
            http_endpoint: String::new(),
            blackfire_query: None,
            client_id: String::new(),
            client_token: String::new(),
            server_id: String::new(),
            server_token: String::new(),
            agent_timeout: Duration::ZERO,
            max_profile_duration: Duration::ZERO,
            cpu_sample_rate_hz: 0,
            log_level: String::new(),
            pprof_dump_dir: None,
            on_demand_only: false,
            config_file: None,
        }
    }

    /// True when profiling may proceed: a query is present, or the probe is
    /// not restricted to on-demand use.
    pub fn can_profile(&self) -> bool {
        self.blackfire_query.is_some() || !self.on_demand_only
    }

    fn fill_defaults(&mut self) {
        if self.agent_socket.is_empty() {
            self.agent_socket = default_agent_socket();
        }
        if self.http_endpoint.is_empty() {
            self.http_endpoint = default_http_endpoint();
        }
        if self.agent_timeout.is_zero() {
            self.agent_timeout = default_agent_timeout();
        }
        if self.max_profile_duration.is_zero() {
            self.max_profile_duration = default_max_profile_duration();
        }
        if self.cpu_sample_rate_hz == 0 {
            self.cpu_sample_rate_hz = RUNTIME_DEFAULT_CPU_SAMPLE_RATE_HZ;
        }
        if self.log_level.is_empty() {
            self.log_level = default_log_level();
        }
    }

    /// Validate required fields and the pprof dump directory.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.blackfire_query.is_none()
            && (self.client_id.is_empty() || self.client_token.is_empty())
        {
            return Err(ProbeError::ConfigInvalid(
                "either a Blackfire query must be supplied, or client ID and client token must be set"
                    .to_string(),
            ));
        }

        if self.agent_socket.split_once("://").is_none() {
            return Err(ProbeError::ConfigInvalid(format!(
                "could not parse agent socket value: [{}]",
                self.agent_socket
            )));
        }

        if let Some(dir) = &self.pprof_dump_dir {
            validate_dump_dir(dir)?;
        }

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(v) = read_env("BLACKFIRE_AGENT_SOCKET") {
            self.agent_socket = v;
        }
        if let Some(v) = read_env("BLACKFIRE_QUERY") {
            self.blackfire_query = Some(v);
            // Consumed once so child processes do not re-trigger profiling.
            std::env::remove_var("BLACKFIRE_QUERY");
        }
        if let Some(v) = read_env("BLACKFIRE_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = read_env("BLACKFIRE_CLIENT_TOKEN") {
            self.client_token = v;
        }
        if let Some(v) = read_env("BLACKFIRE_SERVER_ID") {
            self.server_id = v;
        }
        if let Some(v) = read_env("BLACKFIRE_SERVER_TOKEN") {
            self.server_token = v;
        }
        if let Some(v) = read_env("BLACKFIRE_ENDPOINT") {
            self.http_endpoint = v;
        }
        if let Some(v) = read_env("BLACKFIRE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = read_env("BLACKFIRE_PPROF_DUMP_DIR") {
            match std::fs::canonicalize(&v) {
                Ok(abs) => self.pprof_dump_dir = Some(abs),
                Err(e) => warn!(dir = %v, error = %e, "cannot resolve pprof dump dir"),
            }
        }
    }

    /// Apply ini values. Only fields still unset are filled, so environment
    /// variables win over the file.
    fn apply_ini_file(&mut self) {
        let path = match self.config_file.clone().or_else(default_ini_path) {
            Some(p) => p,
            None => return,
        };

        let ini = match ini::Ini::load_from_file(&path) {
            Ok(ini) => ini,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load config file");
                return;
            }
        };

        let Some(section) = ini.section(Some("blackfire")) else {
            return;
        };

        if self.client_id.is_empty() {
            if let Some(v) = section.get("client-id") {
                self.client_id = v.to_string();
            }
        }
        if self.client_token.is_empty() {
            if let Some(v) = section.get("client-token") {
                self.client_token = v.to_string();
            }
        }
        if self.http_endpoint.is_empty() {
            if let Some(v) = section.get("endpoint") {
                self.http_endpoint = v.to_string();
            }
        }
        if self.agent_timeout.is_zero() {
            if let Some(v) = section.get("timeout") {
                match parse_timeout(v) {
                    Ok(d) => self.agent_timeout = d,
                    Err(e) => {
                        warn!(path = %path.display(), value = v, error = %e, "invalid timeout")
                    }
                }
            }
        }
    }
}

/// Parse an ini timeout value: a humantime string ("250ms", "10s") or a bare
/// number of seconds.
fn parse_timeout(value: &str) -> anyhow::Result<Duration> {
    if let Ok(d) = humantime::parse_duration(value) {
        return Ok(d);
    }
    let seconds: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("no seconds value found in {value:?}"))?;
    Ok(Duration::from_secs_f64(seconds))
}

/// Locate `.blackfire.ini`: `$BLACKFIRE_HOME`, then `$XDG_CONFIG_HOME`
/// (Linux only), then `$HOME`.
fn default_ini_path() -> Option<PathBuf> {
    let candidates = [
        read_env("BLACKFIRE_HOME"),
        if cfg!(target_os = "linux") {
            read_env("XDG_CONFIG_HOME")
        } else {
            None
        },
        read_env("HOME"),
    ];

    for dir in candidates.into_iter().flatten() {
        let path = Path::new(&dir).join(".blackfire.ini");
        let exists = path.is_file();
        debug!(path = %path.display(), exists, "checked for configuration file");
        if exists {
            return Some(path);
        }
    }
    None
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// The dump directory must exist, be a directory, and be writable. There is
/// no portable writability check, so a zero-byte probe file is created and
/// removed.
fn validate_dump_dir(dir: &Path) -> Result<(), ProbeError> {
    let meta = std::fs::metadata(dir).map_err(|e| {
        ProbeError::ConfigInvalid(format!("cannot dump pprof files to {}: {e}", dir.display()))
    })?;
    if !meta.is_dir() {
        return Err(ProbeError::ConfigInvalid(format!(
            "cannot dump pprof files to {}: not a directory",
            dir.display()
        )));
    }

    let probe_path = dir.join(format!(
        "{}-writability-test",
        crate::sysinfo::exe_basename()
    ));
    let _ = std::fs::remove_file(&probe_path);
    let result = std::fs::write(&probe_path, []);
    let _ = std::fs::remove_file(&probe_path);

    result.map_err(|e| {
        ProbeError::ConfigInvalid(format!(
            "cannot dump pprof files to {}: directory does not seem writable: {e}",
            dir.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Configuration {
        Configuration {
            client_id: "id".to_string(),
            client_token: "token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_values() {
        let cfg = Configuration::default();
        assert_eq!(cfg.agent_timeout, Duration::from_millis(250));
        assert_eq!(cfg.max_profile_duration, Duration::from_secs(600));
        assert_eq!(cfg.cpu_sample_rate_hz, 100);
        assert_eq!(cfg.http_endpoint, "https://blackfire.io");
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.agent_socket.contains("://"));
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides_log_level() {
        std::env::set_var("BLACKFIRE_CLIENT_ID", "id");
        std::env::set_var("BLACKFIRE_CLIENT_TOKEN", "token");
        std::env::set_var("BLACKFIRE_LOG_LEVEL", "2");

        let cfg = Configuration::from_environment().expect("load");
        assert_eq!(cfg.log_level, "2");
        assert_eq!(crate::log::filter_directive(&cfg.log_level), "warn");

        std::env::remove_var("BLACKFIRE_CLIENT_ID");
        std::env::remove_var("BLACKFIRE_CLIENT_TOKEN");
        std::env::remove_var("BLACKFIRE_LOG_LEVEL");
    }

    #[test]
    fn test_validation_requires_query_or_credentials() {
        let cfg = Configuration::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("client ID"));

        assert!(creds().validate().is_ok());

        let cfg = Configuration {
            blackfire_query: Some("expires=1&signature=sig".to_string()),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_malformed_agent_socket() {
        let cfg = Configuration {
            agent_socket: "127.0.0.1:8307".to_string(),
            ..creds()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent socket"));
    }

    #[test]
    fn test_validation_rejects_missing_dump_dir() {
        let cfg = Configuration {
            pprof_dump_dir: Some(PathBuf::from("/nonexistent/blackfire-dump")),
            ..creds()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_accepts_writable_dump_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Configuration {
            pprof_dump_dir: Some(dir.path().to_path_buf()),
            ..creds()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_finalize_fills_zero_fields() {
        let cfg = Configuration {
            agent_timeout: Duration::ZERO,
            max_profile_duration: Duration::ZERO,
            cpu_sample_rate_hz: 0,
            ..creds()
        }
        .finalize()
        .expect("finalize");

        assert_eq!(cfg.agent_timeout, Duration::from_millis(250));
        assert_eq!(cfg.max_profile_duration, Duration::from_secs(600));
        assert_eq!(cfg.cpu_sample_rate_hz, 100);
    }

    #[test]
    fn test_parse_timeout_formats() {
        assert_eq!(parse_timeout("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_timeout("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_timeout("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_timeout("not-a-number").is_err());
    }

    #[test]
    fn test_can_profile_on_demand_only() {
        let mut cfg = creds();
        cfg.on_demand_only = true;
        assert!(!cfg.can_profile());

        cfg.blackfire_query = Some("expires=1&signature=s".to_string());
        assert!(cfg.can_profile());
    }
}
