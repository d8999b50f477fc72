//! Settings for `labmesh`, kept in `~/.labmesh/config.toml`.
//!
//! Precedence, lowest first: built-in defaults, the file, `LABMESH_*`
//! environment variables.  The merged result is validated before any role
//! starts with it.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use labmesh_runtime::orchestrator::{DISCOVERY_PORT, OrchestratorConfig, SERVER_PUB_PORT, SERVER_REQ_PORT};
use labmesh_runtime::{LabError, check_period};
use serde::{Deserialize, Serialize};

/// Persisted settings shared by the server, the workers it spawns and the
/// client commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name announced on the network; the OS hostname when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub server_req_port: u16,
    pub server_pub_port: u16,
    pub discovery_port: u16,
    pub broadcast_address: String,
    pub discovery_period_ms: u64,
    /// A peer unheard of for this long is reported disconnected.
    pub host_timeout_s: u64,
    pub request_timeout_ms: u64,
    /// Status publish period of every worker.
    pub refresh_period_ms: u64,
    /// Worker ports are drawn from `[low, high)`.
    pub port_range: [u16; 2],
    /// Device types started when the server boots.
    pub autostart: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            server_req_port: SERVER_REQ_PORT,
            server_pub_port: SERVER_PUB_PORT,
            discovery_port: DISCOVERY_PORT,
            broadcast_address: "255.255.255.255".to_string(),
            discovery_period_ms: 200,
            host_timeout_s: 3,
            request_timeout_ms: 2000,
            refresh_period_ms: 100,
            port_range: [30000, 40000],
            autostart: Vec::new(),
        }
    }
}

impl Config {
    /// Configured hostname, else the OS hostname, else `"localhost"`.
    pub fn resolved_hostname(&self) -> String {
        match &self.hostname {
            Some(name) if !name.is_empty() => name.clone(),
            _ => hostname::get().map_or_else(|_| "localhost".to_string(), |h| h.to_string_lossy().into_owned()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.refresh_period_ms)
    }

    /// Orchestrator settings for a server on this host.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(self.resolved_hostname());
        config.peer_req_port = self.server_req_port;
        config.peer_pub_port = self.server_pub_port;
        config.discovery_port = Some(self.discovery_port);
        config.broadcast_address = self.broadcast_address.clone();
        config.discovery_period = Duration::from_millis(self.discovery_period_ms);
        config.host_timeout = Duration::from_secs(self.host_timeout_s);
        config.request_timeout = self.request_timeout();
        config.port_range = (self.port_range[0], self.port_range[1]);
        config.autostart = self.autostart.clone();
        config
    }

    /// Reject settings no role can run with: zero periods, an empty worker
    /// port range, or server ports that collide with each other or with
    /// the range workers are given.
    pub fn validate(&self) -> Result<(), LabError> {
        check_period("refresh_period_ms", self.refresh_period())?;
        if self.server_req_port == self.server_pub_port {
            return Err(invalid("server_pub_port", format!("{} is also the request port", self.server_pub_port)));
        }
        let [low, high] = self.port_range;
        for (name, port) in [("server_req_port", self.server_req_port), ("server_pub_port", self.server_pub_port)] {
            if (low..high).contains(&port) {
                return Err(invalid(name, format!("{port} lies inside the worker port range {low}..{high}")));
            }
        }
        self.orchestrator_config().validate()
    }
}

fn invalid(name: &str, details: String) -> LabError {
    LabError::InvalidArgument {
        name: name.to_string(),
        details,
    }
}

/// `~/.labmesh/config.toml`, or `./.labmesh/config.toml` without a home.
pub fn config_path() -> PathBuf {
    let home = ["HOME", "USERPROFILE"]
        .into_iter()
        .find_map(std::env::var_os)
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    home.join(".labmesh").join("config.toml")
}

/// Defaults, then the file, then the environment; validated.
pub fn load() -> Result<Config, LabError> {
    let mut cfg = read(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse the file at `path`; `None` when it does not exist.  Fields the
/// file omits keep their defaults.
pub(crate) fn read(path: &Path) -> Result<Option<Config>, LabError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| LabError::Serialization(format!("config at {}: {e}", path.display())))
}

/// Apply the `LABMESH_*` variables of the process environment.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// Apply overrides from `lookup`:
///
/// | Variable | Field |
/// |---|---|
/// | `LABMESH_HOSTNAME` | `hostname` |
/// | `LABMESH_SERVER_REQ_PORT` | `server_req_port` |
/// | `LABMESH_SERVER_PUB_PORT` | `server_pub_port` |
/// | `LABMESH_DISCOVERY_PORT` | `discovery_port` |
/// | `LABMESH_REQUEST_TIMEOUT_MS` | `request_timeout_ms` |
/// | `LABMESH_REFRESH_PERIOD_MS` | `refresh_period_ms` |
///
/// Numbers that do not parse are ignored.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn number<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
        raw?.trim().parse().ok()
    }

    if let Some(name) = lookup("LABMESH_HOSTNAME") {
        cfg.hostname = Some(name);
    }
    if let Some(port) = number(lookup("LABMESH_SERVER_REQ_PORT")) {
        cfg.server_req_port = port;
    }
    if let Some(port) = number(lookup("LABMESH_SERVER_PUB_PORT")) {
        cfg.server_pub_port = port;
    }
    if let Some(port) = number(lookup("LABMESH_DISCOVERY_PORT")) {
        cfg.discovery_port = port;
    }
    if let Some(ms) = number(lookup("LABMESH_REQUEST_TIMEOUT_MS")) {
        cfg.request_timeout_ms = ms;
    }
    if let Some(ms) = number(lookup("LABMESH_REFRESH_PERIOD_MS")) {
        cfg.refresh_period_ms = ms;
    }
}

/// Write `cfg` to [`config_path`] and return where it went.
pub fn save(cfg: &Config) -> Result<PathBuf, LabError> {
    let path = config_path();
    write(cfg, &path)?;
    Ok(path)
}

/// Write `cfg` to `path`.  On Unix the directory ends up `0o700` and the
/// file `0o600`, including when the file already existed.
pub(crate) fn write(cfg: &Config, path: &Path) -> Result<(), LabError> {
    let raw = toml::to_string_pretty(cfg).map_err(|e| LabError::Serialization(e.to_string()))?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
        restrict(dir, 0o700)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    options.open(path)?.write_all(raw.as_bytes())?;
    restrict(path, 0o600)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<(), LabError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<(), LabError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid_and_use_the_well_known_ports() {
        let cfg = Config::default();
        cfg.validate().expect("defaults validate");
        assert_eq!((cfg.server_req_port, cfg.server_pub_port, cfg.discovery_port), (23413, 23412, 14453));
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "hostname = \"bench\"\nport_range = [31000, 31100]\n").unwrap();

        let cfg = read(&path).expect("read ok").expect("present");
        assert_eq!(cfg.resolved_hostname(), "bench");
        assert_eq!(cfg.request_timeout(), Duration::from_millis(2000));

        let orch = cfg.orchestrator_config();
        assert_eq!(orch.hostname, "bench");
        assert_eq!(orch.port_range, (31000, 31100));
        assert_eq!(orch.discovery_port, Some(14453));
        assert_eq!(orch.host_timeout, Duration::from_secs(3));
    }

    #[test]
    fn missing_file_reads_as_none_and_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        assert!(read(&path).expect("no error").is_none());

        fs::write(&path, "server_req_port = \"not a port\"\n").unwrap();
        assert!(matches!(read(&path), Err(LabError::Serialization(_))));
    }

    #[test]
    fn zero_periods_are_rejected_by_field() {
        let zeroed: [(&str, fn(&mut Config)); 4] = [
            ("refresh_period_ms", |c| c.refresh_period_ms = 0),
            ("discovery_period", |c| c.discovery_period_ms = 0),
            ("host_timeout", |c| c.host_timeout_s = 0),
            ("request_timeout", |c| c.request_timeout_ms = 0),
        ];
        for (field, zero) in zeroed {
            let mut cfg = Config::default();
            zero(&mut cfg);
            match cfg.validate() {
                Err(LabError::InvalidArgument { name, .. }) => assert_eq!(name, field),
                other => panic!("{field}: expected InvalidArgument, got {other:?}"),
            }
        }
    }

    #[test]
    fn server_ports_must_stay_out_of_the_worker_range() {
        let mut cfg = Config::default();
        cfg.port_range = [23000, 24000];
        assert!(matches!(cfg.validate(), Err(LabError::InvalidArgument { name, .. }) if name == "server_req_port"));

        let mut cfg = Config::default();
        cfg.server_pub_port = cfg.server_req_port;
        assert!(matches!(cfg.validate(), Err(LabError::InvalidArgument { name, .. }) if name == "server_pub_port"));

        let mut cfg = Config::default();
        cfg.port_range = [31000, 31000];
        assert!(matches!(cfg.validate(), Err(LabError::InvalidArgument { name, .. }) if name == "port_range"));
    }

    #[test]
    fn overrides_replace_file_values_and_skip_garbage() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            overrides(&[
                ("LABMESH_HOSTNAME", "rover-pc"),
                ("LABMESH_SERVER_REQ_PORT", " 24000 "),
                ("LABMESH_DISCOVERY_PORT", "not-a-port"),
                ("LABMESH_REQUEST_TIMEOUT_MS", "750"),
                ("LABMESH_REFRESH_PERIOD_MS", "0"),
            ]),
        );
        assert_eq!(cfg.resolved_hostname(), "rover-pc");
        assert_eq!(cfg.server_req_port, 24000);
        assert_eq!(cfg.discovery_port, 14453);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(750));
        // Overrides are checked like anything else.
        assert!(matches!(cfg.validate(), Err(LabError::InvalidArgument { .. })));
    }

    #[test]
    fn written_config_reads_back() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(".labmesh").join("config.toml");

        let mut cfg = Config::default();
        cfg.autostart = vec!["demo".to_string()];
        cfg.hostname = Some("bench".to_string());
        write(&cfg, &path).expect("write");
        assert_eq!(read(&path).expect("read").expect("present"), cfg);
    }

    #[cfg(unix)]
    #[test]
    fn rewritten_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let labmesh_dir = dir.path().join(".labmesh");
        fs::create_dir_all(&labmesh_dir).unwrap();
        let path = labmesh_dir.join("config.toml");
        fs::write(&path, "hostname = \"old\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write(&Config::default(), &path).expect("write");

        let mode = |p: &Path| fs::metadata(p).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode(&path), 0o600);
        assert_eq!(mode(&labmesh_dir), 0o700);
    }
}
