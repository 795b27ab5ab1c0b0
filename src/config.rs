use std::env;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keepalive: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub ip: IpAddr,
    /// `{device_id}` segment of every topic. Deployments use the plug's IP.
    pub id: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    /// Upper bound on concurrently running command handlers.
    pub command_workers: usize,
}

impl BridgeConfig {
    /// A cached relay state older than this is not reused as a fallback.
    pub fn stale_after(&self) -> Duration {
        self.poll_interval * 3
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            command_workers: 4,
        }
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(env_optional)
    }

    /// Builds the configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| format!("{key} environment variable is required"))
        };
        let parsed = |key: &str, default: u64| -> Result<u64, String> {
            match lookup(key) {
                Some(value) => value
                    .parse()
                    .map_err(|_| format!("{key} has an invalid value: {value}")),
                None => Ok(default),
            }
        };

        let plug_ip = required("PLUG_IP")?;
        let ip: IpAddr = plug_ip
            .parse()
            .map_err(|e| format!("PLUG_IP is not an IP address: {e}"))?;

        let broker_port = parsed("MQTT_BROKER_PORT", 1883)?;
        let broker_port = u16::try_from(broker_port)
            .map_err(|_| format!("MQTT_BROKER_PORT out of range: {broker_port}"))?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: required("MQTT_BROKER_HOST")?,
                broker_port,
                username: lookup("MQTT_USERNAME"),
                password: lookup("MQTT_PASSWORD"),
                client_id: lookup("MQTT_CLIENT_ID")
                    .unwrap_or_else(|| "mystrom-mqtt-bridge".to_string()),
                keepalive: Duration::from_secs(parsed("MQTT_KEEPALIVE_SECS", 60)?),
            },
            device: DeviceConfig {
                id: lookup("PLUG_DEVICE_ID").unwrap_or_else(|| plug_ip.clone()),
                ip,
                request_timeout: Duration::from_millis(parsed("REQUEST_TIMEOUT_MS", 5000)?),
            },
            bridge: BridgeConfig {
                poll_interval: Duration::from_millis(parsed("POLL_INTERVAL_MS", 1000)?),
                ..BridgeConfig::default()
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.mqtt.broker_port == 0 {
            return Err("MQTT_BROKER_PORT must be > 0".into());
        }
        if self.mqtt.keepalive < Duration::from_secs(5) {
            return Err("MQTT_KEEPALIVE_SECS must be at least 5".into());
        }
        if self.device.id.is_empty() || self.device.id.contains(['+', '#', '/']) {
            return Err("PLUG_DEVICE_ID must be a single non-empty topic level".into());
        }
        if self.device.request_timeout.is_zero() {
            return Err("REQUEST_TIMEOUT_MS must be > 0".into());
        }
        if self.bridge.poll_interval.is_zero() {
            return Err("POLL_INTERVAL_MS must be > 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("PLUG_IP", "192.168.0.152"), ("MQTT_BROKER_HOST", "broker")]).unwrap();

        assert_eq!(config.device.ip.to_string(), "192.168.0.152");
        assert_eq!(config.device.id, "192.168.0.152");
        assert_eq!(config.device.request_timeout, Duration::from_secs(5));
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.mqtt.keepalive, Duration::from_secs(60));
        assert_eq!(config.mqtt.client_id, "mystrom-mqtt-bridge");
        assert_eq!(config.bridge.poll_interval, Duration::from_secs(1));
        assert_eq!(config.bridge.stale_after(), Duration::from_secs(3));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PLUG_IP", "10.0.0.7"),
            ("PLUG_DEVICE_ID", "kitchen"),
            ("MQTT_BROKER_HOST", "broker"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_USERNAME", "user"),
            ("MQTT_PASSWORD", "secret"),
            ("MQTT_KEEPALIVE_SECS", "30"),
            ("POLL_INTERVAL_MS", "2500"),
            ("REQUEST_TIMEOUT_MS", "800"),
        ])
        .unwrap();

        assert_eq!(config.device.id, "kitchen");
        assert_eq!(config.mqtt.broker_port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("user"));
        assert_eq!(config.mqtt.keepalive, Duration::from_secs(30));
        assert_eq!(config.bridge.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.device.request_timeout, Duration::from_millis(800));
    }

    #[test]
    fn test_invalid() {
        assert!(load(&[("MQTT_BROKER_HOST", "broker")]).is_err());
        assert!(load(&[("PLUG_IP", "plug.local"), ("MQTT_BROKER_HOST", "broker")]).is_err());
        assert!(load(&[("PLUG_IP", "10.0.0.7")]).is_err());
        assert!(load(&[
            ("PLUG_IP", "10.0.0.7"),
            ("MQTT_BROKER_HOST", "broker"),
            ("POLL_INTERVAL_MS", "0"),
        ])
        .is_err());
        assert!(load(&[
            ("PLUG_IP", "10.0.0.7"),
            ("MQTT_BROKER_HOST", "broker"),
            ("MQTT_BROKER_PORT", "70000"),
        ])
        .is_err());
        assert!(load(&[
            ("PLUG_IP", "10.0.0.7"),
            ("MQTT_BROKER_HOST", "broker"),
            ("MQTT_KEEPALIVE_SECS", "2"),
        ])
        .is_err());
        assert!(load(&[
            ("PLUG_IP", "10.0.0.7"),
            ("PLUG_DEVICE_ID", "a/b"),
            ("MQTT_BROKER_HOST", "broker"),
        ])
        .is_err());
    }
}
