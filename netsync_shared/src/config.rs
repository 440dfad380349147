//! Configuration system.
//!
//! Loads client network configuration from JSON strings/files. Every field has
//! a default so partial files are fine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// How remote entity positions approach their interpolation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Blend the displayed position towards the newer bracketing sample using
    /// the bracket fraction directly. Convergence depends on tick rate.
    Linear,
    /// Critically damped smoothing bounded by `max_smoothing_speed`.
    #[default]
    Smoothed,
}

impl std::str::FromStr for BlendMode {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BlendMode::Linear),
            "smoothed" => Ok(BlendMode::Smoothed),
            other => Err(NetError::InvalidConfig(format!(
                "unknown blend mode `{other}` (expected `linear` or `smoothed`)"
            ))),
        }
    }
}

/// Client network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Server host name or IP.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port of the reliable control channel.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// UDP port of the unreliable state channel.
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Consumer tick rate; also the local-state send rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Records kept per entity.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// How far behind local time remote entities are rendered.
    #[serde(default = "default_render_delay_ms")]
    pub render_delay_ms: f64,
    #[serde(default)]
    pub blend_mode: BlendMode,
    /// Smoothing time for [`BlendMode::Smoothed`].
    #[serde(default = "default_smoothing_time_ms")]
    pub smoothing_time_ms: f64,
    /// Speed cap (units/s) for [`BlendMode::Smoothed`].
    #[serde(default = "default_max_smoothing_speed")]
    pub max_smoothing_speed: f32,
    /// Fraction of each clock-offset error corrected per snapshot, in (0, 1].
    #[serde(default = "default_clock_correction_rate")]
    pub clock_correction_rate: f64,
    /// How far past the newest sample positions may be projected. 0 disables.
    #[serde(default)]
    pub extrapolation_limit_ms: f64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    7777
}

fn default_data_port() -> u16 {
    7778
}

fn default_tick_hz() -> u32 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_history_capacity() -> usize {
    20
}

fn default_render_delay_ms() -> f64 {
    80.0
}

fn default_smoothing_time_ms() -> f64 {
    100.0
}

fn default_max_smoothing_speed() -> f32 {
    50.0
}

fn default_clock_correction_rate() -> f64 {
    0.1
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            tick_hz: default_tick_hz(),
            connect_timeout_ms: default_connect_timeout_ms(),
            history_capacity: default_history_capacity(),
            render_delay_ms: default_render_delay_ms(),
            blend_mode: BlendMode::default(),
            smoothing_time_ms: default_smoothing_time_ms(),
            max_smoothing_speed: default_max_smoothing_speed(),
            clock_correction_rate: default_clock_correction_rate(),
            extrapolation_limit_ms: 0.0,
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file, then validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, NetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NetError::InvalidConfig(format!("read {}: {e}", path.display())))?;
        let cfg = Self::from_json_str(&text)
            .map_err(|e| NetError::InvalidConfig(format!("parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// `host:control_port`
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// `host:data_port`
    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    pub fn validate(&self) -> Result<(), NetError> {
        let fail = |msg: &str| Err(NetError::InvalidConfig(msg.to_string()));
        if self.host.is_empty() {
            return fail("host must not be empty");
        }
        if self.tick_hz == 0 {
            return fail("tick_hz must be positive");
        }
        if self.history_capacity < 2 {
            return fail("history_capacity must be at least 2");
        }
        if !(self.render_delay_ms >= 0.0) {
            return fail("render_delay_ms must be non-negative");
        }
        if !(self.smoothing_time_ms > 0.0) {
            return fail("smoothing_time_ms must be positive");
        }
        if !(self.max_smoothing_speed > 0.0) {
            return fail("max_smoothing_speed must be positive");
        }
        if !(self.clock_correction_rate > 0.0 && self.clock_correction_rate <= 1.0) {
            return fail("clock_correction_rate must be in (0, 1]");
        }
        if !(self.extrapolation_limit_ms >= 0.0) {
            return fail("extrapolation_limit_ms must be non-negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = NetConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, NetConfig::default());
        assert_eq!(cfg.history_capacity, 20);
        assert_eq!(cfg.blend_mode, BlendMode::Smoothed);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_override() {
        let cfg = NetConfig::from_json_str(
            r#"{"host":"10.0.0.2","data_port":9000,"blend_mode":"linear","render_delay_ms":120}"#,
        )
        .unwrap();
        assert_eq!(cfg.control_addr(), "10.0.0.2:7777");
        assert_eq!(cfg.data_addr(), "10.0.0.2:9000");
        assert_eq!(cfg.blend_mode, BlendMode::Linear);
        assert_eq!(cfg.render_delay_ms, 120.0);
    }

    #[test]
    fn defaults_survive_json_roundtrip() {
        let json = serde_json::to_string(&NetConfig::default()).unwrap();
        assert_eq!(NetConfig::from_json_str(&json).unwrap(), NetConfig::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            NetConfig {
                tick_hz: 0,
                ..Default::default()
            },
            NetConfig {
                history_capacity: 1,
                ..Default::default()
            },
            NetConfig {
                clock_correction_rate: 0.0,
                ..Default::default()
            },
            NetConfig {
                render_delay_ms: f64::NAN,
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(NetError::InvalidConfig(_))), "{cfg:?}");
        }
    }

    #[test]
    fn blend_mode_parses() {
        assert_eq!("linear".parse::<BlendMode>().unwrap(), BlendMode::Linear);
        assert!("cubic".parse::<BlendMode>().is_err());
    }
}
