//! Configuration system.
//!
//! Loads sync and client configuration from JSON strings (file IO left to
//! the binaries). Every field has a default so partial documents work.

use serde::{Deserialize, Serialize};

/// Inbound delivery delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Added to every inbound message before it may be processed.
    #[serde(default)]
    pub latency_ms: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { latency_ms: 0.0 }
    }
}

/// Connection lifecycle tuning shared by reliable and fast channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: f64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: f64,
    /// Failed attempts after which a channel is marked degraded.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Watchdog bound on a single connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: f64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: f64,
    /// A ping not answered within this window counts as a silent disconnect.
    #[serde(default = "default_pong_deadline_ms")]
    pub pong_deadline_ms: f64,
}

fn default_backoff_base_ms() -> f64 {
    1000.0
}

fn default_backoff_cap_ms() -> f64 {
    30_000.0
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_connect_timeout_ms() -> f64 {
    5000.0
}

fn default_heartbeat_interval_ms() -> f64 {
    5000.0
}

fn default_pong_deadline_ms() -> f64 {
    10_000.0
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            pong_deadline_ms: default_pong_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalingConfig {
    /// Negotiations not established within this window are discarded.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: f64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: f64,
}

fn default_negotiation_timeout_ms() -> f64 {
    30_000.0
}

fn default_sweep_interval_ms() -> f64 {
    5000.0
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionConfig {
    /// Units per second per held direction.
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Speed multiplier while the boost action is held and boost remains.
    #[serde(default = "default_boost_multiplier")]
    pub boost_multiplier: f32,
    #[serde(default = "default_base_alpha")]
    pub base_alpha: f32,
    #[serde(default = "default_impulse_alpha")]
    pub impulse_alpha: f32,
    /// Corrections farther than this use `impulse_alpha`.
    #[serde(default = "default_impulse_threshold")]
    pub impulse_threshold: f32,
}

fn default_speed() -> f32 {
    300.0
}

fn default_boost_multiplier() -> f32 {
    1.5
}

fn default_base_alpha() -> f32 {
    0.1
}

fn default_impulse_alpha() -> f32 {
    0.02
}

fn default_impulse_threshold() -> f32 {
    50.0
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            boost_multiplier: default_boost_multiplier(),
            base_alpha: default_base_alpha(),
            impulse_alpha: default_impulse_alpha(),
            impulse_threshold: default_impulse_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterpolationConfig {
    /// Render this far behind the translated server time.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: f64,
    #[serde(default = "default_entity_history")]
    pub entity_history: usize,
    #[serde(default = "default_object_history")]
    pub object_history: usize,
    /// Per-tick render-lerp toward the time-interpolated target.
    #[serde(default = "default_render_smoothing")]
    pub render_smoothing: f32,
    /// Period of the drift correction pass for the shared object.
    #[serde(default = "default_correction_interval_ms")]
    pub correction_interval_ms: f64,
    #[serde(default = "default_correction_factor")]
    pub correction_factor: f32,
}

fn default_delay_ms() -> f64 {
    50.0
}

fn default_entity_history() -> usize {
    2
}

fn default_object_history() -> usize {
    10
}

fn default_render_smoothing() -> f32 {
    0.3
}

fn default_correction_interval_ms() -> f64 {
    250.0
}

fn default_correction_factor() -> f32 {
    0.2
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            entity_history: default_entity_history(),
            object_history: default_object_history(),
            render_smoothing: default_render_smoothing(),
            correction_interval_ms: default_correction_interval_ms(),
            correction_factor: default_correction_factor(),
        }
    }
}

/// Everything the sync core needs, independent of any socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub interpolation: InterpolationConfig,
}

/// Root configuration for the client binary and driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Open a datagram channel to the server for fast traffic.
    #[serde(default = "default_true")]
    pub fast_channel: bool,
    /// Negotiate direct peer channels through the server.
    #[serde(default)]
    pub peer_mesh: bool,
    /// Address advertised to peers for direct channels.
    #[serde(default = "default_peer_bind_ip")]
    pub peer_bind_ip: String,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_display_name() -> String {
    "Player".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

fn default_peer_bind_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            display_name: default_display_name(),
            tick_hz: default_tick_hz(),
            fast_channel: true,
            peer_mesh: false,
            peer_bind_ip: default_peer_bind_ip(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Reference server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for both TCP and UDP.
    pub listen_addr: String,
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Units per second per held direction, matching the client default.
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:40000".to_string(),
            tick_hz: default_tick_hz(),
            speed: default_speed(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_client_config_fills_defaults() {
        let cfg = ClientConfig::from_json_str(
            r#"{"server_addr": "10.0.0.2:9000", "sync": {"prediction": {"base_alpha": 0.2}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.server_addr, "10.0.0.2:9000");
        assert_eq!(cfg.tick_hz, 60);
        assert!(cfg.fast_channel);
        assert_eq!(cfg.sync.prediction.base_alpha, 0.2);
        assert_eq!(cfg.sync.prediction.impulse_alpha, 0.02);
        assert_eq!(cfg.sync.interpolation.entity_history, 2);
        assert_eq!(cfg.sync.transport.connect_timeout_ms, 5000.0);
    }

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{"listen_addr": "0.0.0.0:1"}"#).unwrap();
        assert_eq!(cfg.tick_hz, 60);
        assert_eq!(cfg.speed, 300.0);
    }
}
