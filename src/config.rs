// Конфигурация подбора и звонков.
// Значения по умолчанию совпадают с тем, что ожидает клиент: 30 с на ответ
// кандидата, ready каждые 3 с, 10 с на восстановление соединения.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::peer::types::{IceServerKind, ServerConfig};
use crate::utils::add_ice_url_scheme;

pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Период ожидания перед тем, как считать соединение потерянным
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub const DEFAULT_ICE_CANDIDATE_POOL_SIZE: u8 = 10;

/// Публичные STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
});

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

fn default_offer_timeout() -> Duration {
    DEFAULT_OFFER_TIMEOUT
}

fn default_heartbeat() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_grace() -> Duration {
    GRACE_PERIOD
}

fn default_pool_size() -> u8 {
    DEFAULT_ICE_CANDIDATE_POOL_SIZE
}

fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_ICE_SERVERS.clone()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    #[serde(default = "default_offer_timeout", with = "secs", rename = "offerTimeoutSecs")]
    pub offer_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<ServerConfig>,
    #[serde(default = "default_heartbeat", with = "secs", rename = "heartbeatSecs")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_grace", with = "secs", rename = "graceSecs")]
    pub grace_period: Duration,
    #[serde(default = "default_pool_size")]
    pub ice_candidate_pool_size: u8,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            grace_period: GRACE_PERIOD,
            ice_candidate_pool_size: DEFAULT_ICE_CANDIDATE_POOL_SIZE,
        }
    }
}

impl PeerConfig {
    /// Проверяет ICE серверы и дописывает недостающие схемы в URL
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for server in &mut self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::InvalidIceServer {
                    id: server.id.clone(),
                    reason: "server URL cannot be empty".into(),
                });
            }

            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::InvalidIceServer {
                    id: server.id.clone(),
                    reason: "TURN servers require username and credential".into(),
                });
            }

            server.url = add_ice_url_scheme(server);
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "heartbeatSecs".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub peer: PeerConfig,
}

impl Settings {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Настройки из переменных окружения поверх значений по умолчанию
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(value) = lookup("CONSULT_OFFER_TIMEOUT_SECS") {
            settings.dispatch.offer_timeout = parse_secs("CONSULT_OFFER_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("CONSULT_HEARTBEAT_SECS") {
            settings.peer.heartbeat_interval = parse_secs("CONSULT_HEARTBEAT_SECS", &value)?;
        }
        if let Some(value) = lookup("CONSULT_GRACE_SECS") {
            settings.peer.grace_period = parse_secs("CONSULT_GRACE_SECS", &value)?;
        }
        if let Some(value) = lookup("CONSULT_ICE_SERVERS") {
            settings.peer.ice_servers =
                serde_json::from_str(&value).map_err(|e| ConfigError::InvalidValue {
                    key: "CONSULT_ICE_SERVERS".into(),
                    reason: e.to_string(),
                })?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.dispatch.offer_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "offerTimeoutSecs".into(),
                reason: "must be positive".into(),
            });
        }
        self.peer.validate()
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_call_protocol() {
        let settings = Settings::default();
        assert_eq!(settings.dispatch.offer_timeout, Duration::from_secs(30));
        assert_eq!(settings.peer.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(settings.peer.grace_period, Duration::from_secs(10));
        assert_eq!(settings.peer.ice_servers.len(), 2);
    }

    #[test]
    fn json_overrides_and_fills_defaults() {
        let settings = Settings::from_json(
            r#"{"dispatch": {"offerTimeoutSecs": 45},
                "peer": {"iceServers": [{"id": "s", "type": "stun", "url": "stun.example.org:3478"}]}}"#,
        )
        .unwrap();

        assert_eq!(settings.dispatch.offer_timeout, Duration::from_secs(45));
        assert_eq!(settings.peer.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(settings.peer.ice_servers[0].url, "stun:stun.example.org:3478");
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = Settings::from_json(
            r#"{"peer": {"iceServers": [{"id": "t", "type": "turn", "url": "relay.example.org"}]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIceServer { ref id, .. } if id == "t"));
    }

    #[test]
    fn env_lookup_parses_seconds() {
        let vars: HashMap<&str, &str> = [
            ("CONSULT_OFFER_TIMEOUT_SECS", "20"),
            ("CONSULT_GRACE_SECS", "4"),
        ]
        .into_iter()
        .collect();

        let settings = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.dispatch.offer_timeout, Duration::from_secs(20));
        assert_eq!(settings.peer.grace_period, Duration::from_secs(4));

        let err = Settings::from_lookup(|k| {
            (k == "CONSULT_HEARTBEAT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
