use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and request handling
    #[serde(default)]
    pub server: ServerConfig,

    /// How the gateway process is launched and probed
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Durable backup of the gateway's local state
    #[serde(default)]
    pub backup: BackupSettings,

    /// Upstream access verification
    #[serde(default)]
    pub access: AccessSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Max time to wait for the gateway to answer a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections kept to the gateway (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Environment variables that must be set before traffic is proxied
    #[serde(default = "default_required_env")]
    pub required_env: Vec<String>,

    /// Admin path users are sent to when the gateway asks for device pairing
    #[serde(default = "default_pairing_path")]
    pub pairing_path: String,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            required_env: default_required_env(),
            pairing_path: default_pairing_path(),
        }
    }
}

/// Gateway launch, probe and config-projection settings
///
/// # Security Warning
///
/// `command` is executed directly inside the container. Configuration files
/// must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Command line used to launch the gateway (split with shell rules)
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Extra switches appended after the port/bind arguments
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,

    /// Substrings identifying the gateway in the process list
    #[serde(default = "default_signature")]
    pub signature: Vec<String>,

    /// Substrings that disqualify a match (CLI invocations of the same binary)
    #[serde(default = "default_signature_exclude")]
    pub signature_exclude: Vec<String>,

    /// Host the gateway listens on inside the container
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Port the gateway listens on
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind mode passed to the gateway (`lan`, `loopback`, ...)
    #[serde(default = "default_bind_mode")]
    pub bind_mode: String,

    /// Proxies the gateway should trust for forwarded headers
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// Directory holding the gateway's JSON config
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// File name of the JSON config inside `config_dir`
    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// Template used when no local config exists yet
    pub template: Option<PathBuf>,

    /// Agent workspace directory written into the config
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Lock artifacts removed before each launch
    #[serde(default = "default_lock_files")]
    pub lock_files: Vec<PathBuf>,

    /// Hard upper bound on one start, including any wait on a process
    /// that was already starting
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// TCP connect timeout used by the port check in milliseconds
    #[serde(default = "default_probe_connect_timeout")]
    pub probe_connect_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// `never` or a duration after which an untouched gateway is stopped
    #[serde(default)]
    pub sleep_after: SleepPolicy,

    /// Environment variables passed through to the gateway unchanged
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl GatewaySettings {
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(&self.config_file)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_connect_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Split `command` into program and leading arguments
    pub fn command_parts(&self) -> Result<(String, Vec<String>), String> {
        let mut parts = shell_words::split(&self.command)
            .map_err(|e| format!("gateway.command: {}", e))?;
        if parts.is_empty() {
            return Err("gateway.command must not be empty".to_string());
        }
        let program = parts.remove(0);
        Ok((program, parts))
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.command_parts() {
            errors.push(e);
        }
        if self.signature.iter().all(|s| s.trim().is_empty()) {
            errors.push("gateway.signature needs at least one non-empty entry".to_string());
        }
        if self.port == 0 {
            errors.push("gateway.port must be greater than 0".to_string());
        }
        if self.config_file.is_empty() || self.config_file.contains('/') {
            errors.push("gateway.config_file must be a bare file name".to_string());
        }
        if self.startup_timeout_secs == 0 {
            errors.push("gateway.startup_timeout_secs must be greater than 0".to_string());
        }
        if self.ready_poll_interval_ms == 0 {
            errors.push("gateway.ready_poll_interval_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            extra_args: default_extra_args(),
            signature: default_signature(),
            signature_exclude: default_signature_exclude(),
            host: default_gateway_host(),
            port: default_gateway_port(),
            bind_mode: default_bind_mode(),
            trusted_proxies: default_trusted_proxies(),
            config_dir: default_config_dir(),
            config_file: default_config_file(),
            template: None,
            workspace_dir: default_workspace_dir(),
            lock_files: default_lock_files(),
            startup_timeout_secs: default_startup_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            probe_connect_timeout_ms: default_probe_connect_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            sleep_after: SleepPolicy::default(),
            env: HashMap::new(),
        }
    }
}

/// Backup location and schedule
#[derive(Debug, Deserialize, Clone)]
pub struct BackupSettings {
    /// Enable restore-at-boot and the periodic push
    #[serde(default)]
    pub enabled: bool,

    /// Mount point of the durable store
    #[serde(default = "default_backup_root")]
    pub root: PathBuf,

    /// Remote prefix mirroring the gateway config directory
    #[serde(default = "default_config_prefix")]
    pub config_prefix: String,

    /// Remote prefix mirroring the skills directory
    #[serde(default = "default_skills_prefix")]
    pub skills_prefix: String,

    /// Local skills directory
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,

    /// File name of the sync marker (remote root and local config dir)
    #[serde(default = "default_marker_name")]
    pub marker: String,

    /// File patterns never pushed (`*.ext` or exact names)
    #[serde(default = "default_backup_exclude")]
    pub exclude: Vec<String>,

    /// Seconds between scheduled pushes
    #[serde(default = "default_backup_interval")]
    pub interval_secs: u64,
}

impl BackupSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_backup_root(),
            config_prefix: default_config_prefix(),
            skills_prefix: default_skills_prefix(),
            skills_dir: default_skills_dir(),
            marker: default_marker_name(),
            exclude: default_backup_exclude(),
            interval_secs: default_backup_interval(),
        }
    }
}

/// Identity header set by the upstream access proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccessSettings {
    /// Header carrying the authenticated user; unset means every request is admitted
    pub user_header: Option<String>,
}

/// When an untouched gateway should be put to sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepPolicy {
    #[default]
    Never,
    After(Duration),
}

impl SleepPolicy {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            SleepPolicy::Never => None,
            SleepPolicy::After(d) => Some(*d),
        }
    }
}

impl FromStr for SleepPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("never") {
            return Ok(SleepPolicy::Never);
        }

        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "s"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid sleep policy '{}': expected 'never' or a duration like 10m", s))?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            other => return Err(format!("invalid sleep policy unit '{}' in '{}'", other, s)),
        };
        if value == 0 {
            return Err(format!("sleep policy '{}' must be greater than zero", s));
        }
        Ok(SleepPolicy::After(Duration::from_secs(value * multiplier)))
    }
}

impl<'de> Deserialize<'de> for SleepPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    120
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_required_env() -> Vec<String> {
    vec!["GATEWAY_TOKEN".to_string()]
}

fn default_pairing_path() -> String {
    "/_admin/".to_string()
}

fn default_gateway_command() -> String {
    "gateway-agent gateway".to_string()
}

fn default_extra_args() -> Vec<String> {
    vec!["--verbose".to_string(), "--allow-unconfigured".to_string()]
}

fn default_signature() -> Vec<String> {
    vec!["gateway-agent gateway".to_string(), "start-gateway.sh".to_string()]
}

fn default_signature_exclude() -> Vec<String> {
    vec![
        "gateway-agent devices".to_string(),
        "gateway-agent --version".to_string(),
    ]
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_bind_mode() -> String {
    "lan".to_string()
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["10.1.0.0".to_string()]
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/root/.gateway-agent")
}

fn default_config_file() -> String {
    "agent.json".to_string()
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/root/workspace")
}

fn default_lock_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/tmp/gateway-agent.lock"),
        PathBuf::from("/root/.gateway-agent/gateway.lock"),
    ]
}

fn default_startup_timeout() -> u64 {
    180 // cold containers can take minutes to boot the agent
}

fn default_ready_poll_interval() -> u64 {
    500
}

fn default_probe_connect_timeout() -> u64 {
    500
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/data/backup")
}

fn default_config_prefix() -> String {
    "config".to_string()
}

fn default_skills_prefix() -> String {
    "skills".to_string()
}

fn default_skills_dir() -> PathBuf {
    PathBuf::from("/root/workspace/skills")
}

fn default_marker_name() -> String {
    ".last-sync".to_string()
}

fn default_backup_exclude() -> Vec<String> {
    vec!["*.lock".to_string(), "*.log".to_string(), "*.tmp".to_string()]
}

fn default_backup_interval() -> u64 {
    300 // every 5 minutes
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(mut e) = self.gateway.validate() {
            errors.append(&mut e);
        }

        if self.server.port == self.gateway.port
            && (self.gateway.host == "127.0.0.1" || self.gateway.host == "localhost")
        {
            errors.push(format!(
                "server.port {} collides with gateway.port",
                self.server.port
            ));
        }

        if self.backup.enabled {
            if self.backup.interval_secs == 0 {
                errors.push("backup.interval_secs must be greater than 0".to_string());
            }
            if self.backup.config_prefix.trim_matches('/').is_empty() {
                errors.push("backup.config_prefix must not be empty".to_string());
            }
            if self.backup.config_prefix == self.backup.skills_prefix {
                errors.push("backup.config_prefix and backup.skills_prefix must differ".to_string());
            }
            if self.backup.marker.is_empty() || self.backup.marker.contains('/') {
                errors.push("backup.marker must be a bare file name".to_string());
            }
        }

        if let Some(header) = &self.access.user_header {
            if http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                errors.push(format!("access.user_header '{}' is not a valid header name", header));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8443
bind = "127.0.0.1"
required_env = ["GATEWAY_TOKEN", "ANTHROPIC_API_KEY"]

[gateway]
command = "agent gateway --profile 'main box'"
port = 19000
startup_timeout_secs = 60
sleep_after = "10m"
lock_files = ["/tmp/agent.lock"]

[backup]
enabled = true
root = "/mnt/bucket"
interval_secs = 60

[access]
user_header = "x-authenticated-user"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.required_env.len(), 2);
        assert_eq!(config.gateway.port, 19000);
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.gateway.sleep_after,
            SleepPolicy::After(Duration::from_secs(600))
        );
        assert!(config.backup.enabled);
        assert_eq!(config.backup.root, PathBuf::from("/mnt/bucket"));
        assert_eq!(
            config.access.user_header.as_deref(),
            Some("x-authenticated-user")
        );

        let (program, args) = config.gateway.command_parts().unwrap();
        assert_eq!(program, "agent");
        assert_eq!(args, vec!["gateway", "--profile", "main box"]);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.required_env, vec!["GATEWAY_TOKEN"]);
        assert_eq!(config.server.pairing_path, "/_admin/");
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.gateway.bind_mode, "lan");
        assert_eq!(config.gateway.sleep_after, SleepPolicy::Never);
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(180));
        assert!(!config.backup.enabled);
        assert_eq!(config.backup.interval(), Duration::from_secs(300));
        assert_eq!(config.backup.marker, ".last-sync");
        assert!(config.access.user_header.is_none());
    }

    #[test]
    fn test_config_path_joins_dir_and_file() {
        let mut settings = GatewaySettings::default();
        settings.config_dir = PathBuf::from("/srv/agent");
        settings.config_file = "config.json".to_string();
        assert_eq!(settings.config_path(), PathBuf::from("/srv/agent/config.json"));
    }

    #[test]
    fn test_sleep_policy_parsing() {
        assert_eq!("never".parse::<SleepPolicy>().unwrap(), SleepPolicy::Never);
        assert_eq!("NEVER".parse::<SleepPolicy>().unwrap(), SleepPolicy::Never);
        assert_eq!(
            "90s".parse::<SleepPolicy>().unwrap(),
            SleepPolicy::After(Duration::from_secs(90))
        );
        assert_eq!(
            "45".parse::<SleepPolicy>().unwrap(),
            SleepPolicy::After(Duration::from_secs(45))
        );
        assert_eq!(
            "2h".parse::<SleepPolicy>().unwrap(),
            SleepPolicy::After(Duration::from_secs(7200))
        );
        assert_eq!(
            "1d".parse::<SleepPolicy>().unwrap().duration(),
            Some(Duration::from_secs(86400))
        );
        assert!("0m".parse::<SleepPolicy>().is_err());
        assert!("10w".parse::<SleepPolicy>().is_err());
        assert!("soon".parse::<SleepPolicy>().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let toml = r#"
[gateway]
command = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("gateway.command must not be empty"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
port = 18789

[gateway]
port = 18789
config_file = "nested/agent.json"

[backup]
enabled = true
interval_secs = 0
config_prefix = "same"
skills_prefix = "same"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("collides with gateway.port"));
        assert!(err.contains("bare file name"));
        assert!(err.contains("backup.interval_secs"));
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_validate_rejects_bad_access_header() {
        let toml = r#"
[access]
user_header = "not a header"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sleep_policy_fails_parse() {
        let toml = r#"
[gateway]
sleep_after = "whenever"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
