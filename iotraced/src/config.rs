use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/iotrace/iotrace.toml";
const ENV_CONFIG_PATH: &str = "IOTRACE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `IOTRACE_CONFIG` environment variable. A missing or unparsable file
    /// falls back to defaults; the failure is logged, not fatal.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("failed to parse {}: {e}, using defaults", path.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RingConfig {
    #[serde(default = "default_ring_size_mb")]
    pub size_mb: usize,
    #[serde(default = "default_almost_full_threshold")]
    pub almost_full_threshold: f32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            size_mb: default_ring_size_mb(),
            almost_full_threshold: default_almost_full_threshold(),
        }
    }
}

fn default_ring_size_mb() -> usize {
    4
}

fn default_almost_full_threshold() -> f32 {
    0.75
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DevicesConfig {
    #[serde(default)]
    pub trace: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_inode_cache_entries")]
    pub inode_cache_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            inode_cache_entries: default_inode_cache_entries(),
        }
    }
}

fn default_inode_cache_entries() -> usize {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default)]
    pub default_label: Option<String>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_label: None,
            max_duration_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_control_addr")]
    pub listen_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_control_addr(),
        }
    }
}

fn default_control_addr() -> String {
    "127.0.0.1:7777".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_sink_path")]
    pub sink_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sink_path: default_sink_path(),
        }
    }
}

fn default_sink_path() -> String {
    "/var/log/iotrace/events.ndjson".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[ring]
size_mb = 8
almost_full_threshold = 0.8
[devices]
trace = ["/dev/sda"]
[cache]
inode_cache_entries = 8192
[control]
listen_addr = "0.0.0.0:9000"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.ring.size_mb, 8);
        assert_eq!(cfg.devices.trace, vec!["/dev/sda"]);
        assert_eq!(cfg.cache.inode_cache_entries, 8192);
        assert_eq!(cfg.control.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.logging.sink_path, "/var/log/iotrace/events.ndjson");
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[ring]\nsize_mb = 16").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.ring.size_mb, 16);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/iotrace.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.ring.size_mb, default_ring_size_mb());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
