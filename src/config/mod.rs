use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "OXI_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub http: HttpConfig,
    pub timing: TimingConfig,
    pub discovery: DiscoveryConfig,
}

/// TCP listener the sensor devices connect to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8889,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a command waits for the device's direct reply.
    pub reply_timeout_ms: u64,
    /// How long START/STOP wait for a confirming status report.
    pub confirm_timeout_ms: u64,
    pub confirm_poll_ms: u64,
    pub liveness_tick_ms: u64,
    pub liveness_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 5000,
            confirm_timeout_ms: 5000,
            confirm_poll_ms: 500,
            liveness_tick_ms: 2000,
            liveness_timeout_ms: 15000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub port: u16,
    /// Address announced to devices; detected from the routing table if unset.
    pub advertise_ip: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8888,
            advertise_ip: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = active_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("DEVICE_HOST") {
            self.device.host = val;
        }
        override_parsed("DEVICE_PORT", &mut self.device.port);

        if let Some(val) = env_var("HTTP_HOST") {
            self.http.host = val;
        }
        override_parsed("HTTP_PORT", &mut self.http.port);

        override_parsed("REPLY_TIMEOUT_MS", &mut self.timing.reply_timeout_ms);
        override_parsed("CONFIRM_TIMEOUT_MS", &mut self.timing.confirm_timeout_ms);
        override_parsed("CONFIRM_POLL_MS", &mut self.timing.confirm_poll_ms);
        override_parsed("LIVENESS_TICK_MS", &mut self.timing.liveness_tick_ms);
        override_parsed("LIVENESS_TIMEOUT_MS", &mut self.timing.liveness_timeout_ms);

        override_parsed("DISCOVERY_ENABLED", &mut self.discovery.enabled);
        override_parsed("DISCOVERY_PORT", &mut self.discovery.port);
        if let Some(val) = env_var("DISCOVERY_ADVERTISE_IP") {
            self.discovery.advertise_ip = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.device.port == 0 {
            return Err("device.port must be non-zero".into());
        }
        if self.http.port == 0 {
            return Err("http.port must be non-zero".into());
        }
        self.device_addr()?;
        self.http_addr()?;

        let t = &self.timing;
        if t.reply_timeout_ms == 0 {
            return Err("timing.reply_timeout_ms must be non-zero".into());
        }
        if t.confirm_timeout_ms == 0 {
            return Err("timing.confirm_timeout_ms must be non-zero".into());
        }
        if t.confirm_poll_ms == 0 || t.confirm_poll_ms > t.confirm_timeout_ms {
            return Err("timing.confirm_poll_ms must be in 1..=confirm_timeout_ms".into());
        }
        if t.liveness_tick_ms == 0 {
            return Err("timing.liveness_tick_ms must be non-zero".into());
        }
        if t.liveness_timeout_ms <= t.liveness_tick_ms {
            return Err("timing.liveness_timeout_ms must be larger than liveness_tick_ms".into());
        }

        if self.discovery.enabled {
            if self.discovery.port == 0 {
                return Err("discovery.port must be non-zero when discovery.enabled = true".into());
            }
            if let Some(ip) = self.discovery.advertise_ip.as_deref() {
                if ip.trim().parse::<std::net::IpAddr>().is_err() {
                    return Err(format!("discovery.advertise_ip is not an IP address: {ip}").into());
                }
            }
        }
        Ok(())
    }

    pub fn device_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        socket_addr("device", &self.device.host, self.device.port)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        socket_addr("http", &self.http.host, self.http.port)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        active_config_path()
    }
}

fn socket_addr(section: &str, host: &str, port: u16) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    format!("{host}:{port}")
        .parse()
        .map_err(|_| format!("{section}.host is not a valid address: {host}").into())
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}")).ok()
}

/// Unparsable values are ignored and the current setting kept.
fn override_parsed<T: FromStr>(name: &str, slot: &mut T) {
    if let Some(val) = env_var(name) {
        match val.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var = %format!("{ENV_PREFIX}{name}"), value = %val, "ignoring unparsable override"),
        }
    }
}

fn active_config_path() -> PathBuf {
    match env_var("CONFIG_PATH") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(CONFIG_FILE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.device.port, 8889);
        assert_eq!(parsed.http.port, 8888);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [device]
            port = 9100

            [timing]
            liveness_timeout_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device.port, 9100);
        assert_eq!(cfg.device.host, "0.0.0.0");
        assert_eq!(cfg.timing.liveness_timeout_ms, 30000);
        assert_eq!(cfg.timing.reply_timeout_ms, 5000);
        assert!(!cfg.discovery.enabled);
    }

    #[test]
    fn validate_rejects_zero_ports() {
        let mut cfg = Config::default();
        cfg.device.port = 0;
        assert!(cfg.validate().is_err());
        cfg.device.port = 8889;
        cfg.http.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_timing() {
        let mut cfg = Config::default();
        cfg.timing.confirm_poll_ms = cfg.timing.confirm_timeout_ms + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.timing.reply_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.timing.liveness_timeout_ms = cfg.timing.liveness_tick_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_checks_discovery_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.discovery.advertise_ip = Some("not-an-ip".to_string());
        assert!(cfg.validate().is_ok());

        cfg.discovery.enabled = true;
        assert!(cfg.validate().is_err());

        cfg.discovery.advertise_ip = Some("192.168.1.20".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bind_addresses_are_parsed() {
        let mut cfg = Config::default();
        assert_eq!(cfg.device_addr().unwrap().port(), 8889);
        cfg.http.host = "localhost:1".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = env::temp_dir().join(format!("oxi-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        Config::write_default(&path).unwrap();
        let written: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.timing.confirm_poll_ms, 500);
        assert!(Config::write_default(&path).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
