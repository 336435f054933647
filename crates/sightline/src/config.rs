//! Edge daemon configuration from `SIGHTLINE_*` environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::capture::{CaptureConfig, DeviceHints};
use crate::error::ConfigError;
use crate::upstream::UpstreamConfig;

/// Full configuration of the edge daemon
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub capture: CaptureConfig,
    pub upstream: UpstreamConfig,
    /// Period of the local broadcaster
    pub broadcast_period: Duration,
    /// Port of the viewer web server
    pub web_port: u16,
    /// Outbound queue depth per viewer
    pub viewer_queue: usize,
    /// Use the synthetic camera (`--test-source`)
    pub test_source: bool,
    /// Run the upstream link (disabled with `--no-upstream`)
    pub upstream_enabled: bool,
    /// Directory for the rotating log file; `None` logs to the console only
    pub log_dir: Option<PathBuf>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            upstream: UpstreamConfig::default(),
            broadcast_period: Duration::from_millis(100),
            web_port: 8080,
            viewer_queue: 8,
            test_source: false,
            upstream_enabled: true,
            log_dir: None,
        }
    }
}

impl EdgeConfig {
    /// Read the process environment and command-line flags.
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::from_lookup(|key| std::env::var(key).ok(), &args)
    }

    /// Build from an arbitrary key lookup and argument list.
    pub fn from_lookup<F>(lookup: F, args: &[String]) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup };

        let jpeg_quality: u8 = env.parse("SIGHTLINE_JPEG_QUALITY", defaults.capture.jpeg_quality)?;
        if !(1..=100).contains(&jpeg_quality) {
            return Err(ConfigError::invalid(
                "SIGHTLINE_JPEG_QUALITY",
                "must be between 1 and 100",
            ));
        }

        let max_consecutive_failures: u32 = env.parse(
            "SIGHTLINE_CAPTURE_MAX_FAILURES",
            defaults.capture.max_consecutive_failures,
        )?;
        if max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "SIGHTLINE_CAPTURE_MAX_FAILURES",
                "must be at least 1",
            ));
        }

        let devices = match env.get("SIGHTLINE_CAMERA_DEVICES") {
            Some(value) => parse_devices(&value)?,
            None => defaults.capture.devices.clone(),
        };

        let hints = DeviceHints {
            exposure: env.parse_opt("SIGHTLINE_CAMERA_EXPOSURE")?.or(defaults.capture.hints.exposure),
            gain: env.parse_opt("SIGHTLINE_CAMERA_GAIN")?.or(defaults.capture.hints.gain),
            brightness: env
                .parse_opt("SIGHTLINE_CAMERA_BRIGHTNESS")?
                .or(defaults.capture.hints.brightness),
        };

        let capture = CaptureConfig {
            max_dimension: env.parse("SIGHTLINE_MAX_DIMENSION", defaults.capture.max_dimension)?,
            jpeg_quality,
            period: env.millis("SIGHTLINE_CAPTURE_PERIOD_MS", defaults.capture.period)?,
            retry_delay: env.millis("SIGHTLINE_CAPTURE_RETRY_MS", defaults.capture.retry_delay)?,
            max_consecutive_failures,
            devices,
            hints,
        };

        let url = env
            .get("SIGHTLINE_UPSTREAM_URL")
            .unwrap_or_else(|| defaults.upstream.url.clone());
        // The WebSocket client is built without TLS
        if url.starts_with("wss://") {
            return Err(ConfigError::invalid(
                "SIGHTLINE_UPSTREAM_URL",
                "wss:// is not supported, use ws:// (terminate TLS in front of the service)",
            ));
        }
        if !url.starts_with("ws://") {
            return Err(ConfigError::invalid(
                "SIGHTLINE_UPSTREAM_URL",
                format!("{:?} is not a ws:// URL", url),
            ));
        }

        let upstream = UpstreamConfig {
            url,
            reconnect_delay: env.millis("SIGHTLINE_RECONNECT_DELAY_MS", defaults.upstream.reconnect_delay)?,
            handshake_timeout: env.millis(
                "SIGHTLINE_HANDSHAKE_TIMEOUT_MS",
                defaults.upstream.handshake_timeout,
            )?,
            response_timeout: env.millis(
                "SIGHTLINE_RESPONSE_TIMEOUT_MS",
                defaults.upstream.response_timeout,
            )?,
        };

        let viewer_queue: usize = env.parse("SIGHTLINE_VIEWER_QUEUE", defaults.viewer_queue)?;
        if viewer_queue == 0 {
            return Err(ConfigError::invalid("SIGHTLINE_VIEWER_QUEUE", "must be at least 1"));
        }

        let log_dir = match env.get("SIGHTLINE_LOG_DIR") {
            Some(value) if value.eq_ignore_ascii_case("off") => None,
            Some(value) => Some(PathBuf::from(value)),
            None => env.get("HOME").map(|home| PathBuf::from(home).join(".sightline").join("logs")),
        };

        Ok(Self {
            capture,
            upstream,
            broadcast_period: env.millis("SIGHTLINE_BROADCAST_PERIOD_MS", defaults.broadcast_period)?,
            web_port: env.parse("SIGHTLINE_WEB_PORT", defaults.web_port)?,
            viewer_queue,
            test_source: args.iter().any(|arg| arg == "--test-source"),
            upstream_enabled: !args.iter().any(|arg| arg == "--no-upstream"),
            log_dir,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Value of `key`, trimmed; empty counts as unset
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_opt<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Parse { key, value }),
            None => Ok(None),
        }
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    /// Non-zero duration in milliseconds
    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.parse_opt::<u64>(key)? {
            Some(0) => Err(ConfigError::invalid(key, "must be non-zero")),
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => Ok(default),
        }
    }
}

fn parse_devices(value: &str) -> Result<Vec<u32>, ConfigError> {
    let devices = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::Parse {
                key: "SIGHTLINE_CAMERA_DEVICES",
                value: value.to_string(),
            })
        })
        .collect::<Result<Vec<u32>, _>>()?;
    if devices.is_empty() {
        return Err(ConfigError::invalid(
            "SIGHTLINE_CAMERA_DEVICES",
            "at least one device index is required",
        ));
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)], args: &[&str]) -> Result<EdgeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        EdgeConfig::from_lookup(|key| vars.get(key).cloned(), &args)
    }

    #[test]
    fn defaults() {
        let config = load(&[], &[]).unwrap();
        assert_eq!(config.capture.max_dimension, 640);
        assert_eq!(config.capture.jpeg_quality, 85);
        assert_eq!(config.capture.period, Duration::from_secs(1));
        assert_eq!(config.capture.max_consecutive_failures, 3);
        assert_eq!(config.capture.devices, vec![0]);
        assert_eq!(config.capture.hints.exposure, None);
        assert_eq!(config.capture.hints.gain, Some(100));
        assert_eq!(config.broadcast_period, Duration::from_millis(100));
        assert_eq!(config.upstream.url, "ws://127.0.0.1:8000/ws");
        assert_eq!(config.upstream.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.web_port, 8080);
        assert!(config.upstream_enabled);
        assert!(!config.test_source);
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn log_dir_defaults_under_home() {
        let config = load(&[("HOME", "/home/edge")], &[]).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/home/edge/.sightline/logs")));

        let config = load(&[("HOME", "/home/edge"), ("SIGHTLINE_LOG_DIR", "/var/log/sightline")], &[]).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/sightline")));

        let config = load(&[("HOME", "/home/edge"), ("SIGHTLINE_LOG_DIR", "off")], &[]).unwrap();
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn overrides_and_flags() {
        let config = load(
            &[
                ("SIGHTLINE_JPEG_QUALITY", "60"),
                ("SIGHTLINE_CAMERA_DEVICES", "2, 0,1"),
                ("SIGHTLINE_CAMERA_EXPOSURE", "-4"),
                ("SIGHTLINE_UPSTREAM_URL", "ws://infer.example:9000/ws"),
                ("SIGHTLINE_RECONNECT_DELAY_MS", "250"),
                ("SIGHTLINE_WEB_PORT", "9000"),
            ],
            &["--test-source", "--no-upstream"],
        )
        .unwrap();
        assert_eq!(config.capture.jpeg_quality, 60);
        assert_eq!(config.capture.devices, vec![2, 0, 1]);
        assert_eq!(config.capture.hints.exposure, Some(-4));
        assert_eq!(config.upstream.url, "ws://infer.example:9000/ws");
        assert_eq!(config.upstream.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.web_port, 9000);
        assert!(config.test_source);
        assert!(!config.upstream_enabled);
    }

    #[test]
    fn rejects_tls_upstream_url() {
        match load(&[("SIGHTLINE_UPSTREAM_URL", "wss://infer.example/ws")], &[]) {
            Err(ConfigError::Invalid { key, reason }) => {
                assert_eq!(key, "SIGHTLINE_UPSTREAM_URL");
                assert!(reason.contains("wss://"), "{}", reason);
            }
            other => panic!("expected Invalid, got {:?}", other.map(|c| c.upstream.url)),
        }
    }

    #[test]
    fn empty_value_means_default() {
        let config = load(&[("SIGHTLINE_WEB_PORT", "  ")], &[]).unwrap();
        assert_eq!(config.web_port, 8080);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            load(&[("SIGHTLINE_WEB_PORT", "http")], &[]).unwrap_err(),
            ConfigError::Parse {
                key: "SIGHTLINE_WEB_PORT",
                value: "http".into()
            }
        );
        assert!(matches!(
            load(&[("SIGHTLINE_JPEG_QUALITY", "0")], &[]),
            Err(ConfigError::Invalid { key: "SIGHTLINE_JPEG_QUALITY", .. })
        ));
        assert!(matches!(
            load(&[("SIGHTLINE_CAPTURE_PERIOD_MS", "0")], &[]),
            Err(ConfigError::Invalid { key: "SIGHTLINE_CAPTURE_PERIOD_MS", .. })
        ));
        assert!(matches!(
            load(&[("SIGHTLINE_UPSTREAM_URL", "http://host/ws")], &[]),
            Err(ConfigError::Invalid { key: "SIGHTLINE_UPSTREAM_URL", .. })
        ));
        assert!(matches!(
            load(&[("SIGHTLINE_CAMERA_DEVICES", ",")], &[]),
            Err(ConfigError::Invalid { key: "SIGHTLINE_CAMERA_DEVICES", .. })
        ));
        assert!(matches!(
            load(&[("SIGHTLINE_CAMERA_DEVICES", "0,usb")], &[]),
            Err(ConfigError::Parse { key: "SIGHTLINE_CAMERA_DEVICES", .. })
        ));
    }
}
