use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub update_period_ms: u64,
    pub api_endpoint: String,
    pub request_timeout_sec: u32,
    pub fetch_jitter_base: u32,
    pub fetch_jitter_spread: u32,
    pub fetch_abandon_cycles: u32,
    pub cut_schedule: u32,
    pub json_version: u32,
    pub json_channel_names: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            update_period_ms: 15_000,
            api_endpoint: "https://api.porssari.fi/getcontrols.php".to_string(),
            request_timeout_sec: 10,
            fetch_jitter_base: 18,
            fetch_jitter_spread: 3,
            fetch_abandon_cycles: 4,
            cut_schedule: 10,
            json_version: 2,
            json_channel_names: false,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.update_period_ms = self.update_period_ms.clamp(1_000, 300_000);
        self.request_timeout_sec = self.request_timeout_sec.clamp(1, 120);
        self.fetch_jitter_base = self.fetch_jitter_base.clamp(1, 10_000);
        self.fetch_jitter_spread = self
            .fetch_jitter_spread
            .min(self.fetch_jitter_base.saturating_mul(4));
        self.fetch_abandon_cycles = self.fetch_abandon_cycles.max(1);
        self.cut_schedule = self.cut_schedule.clamp(1, 500);

        let trimmed = self.api_endpoint.trim();
        if trimmed.is_empty() {
            self.api_endpoint = Self::default().api_endpoint;
        } else if trimmed.len() != self.api_endpoint.len() {
            self.api_endpoint = trimmed.to_string();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayHardwareConfig {
    pub pins: Vec<i32>,
    pub active_low: bool,
}

impl Default for RelayHardwareConfig {
    fn default() -> Self {
        Self {
            pins: vec![4, 5, 6, 7],
            active_low: false,
        }
    }
}

impl RelayHardwareConfig {
    pub fn sanitize(&mut self) {
        self.pins.retain(|pin| *pin >= 0);
        self.pins.truncate(u8::MAX as usize);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relays: RelayHardwareConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            timezone: "Europe/Helsinki".to_string(),
            network: NetworkConfig::default(),
            relays: RelayHardwareConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.relays.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_scripts() {
        let config = ControllerConfig::default();
        assert_eq!(config.update_period_ms, 15_000);
        assert_eq!(config.fetch_jitter_base, 18);
        assert_eq!(config.fetch_jitter_spread, 3);
        assert_eq!(config.request_timeout_sec, 10);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = ControllerConfig {
            update_period_ms: 10,
            api_endpoint: "  ".to_string(),
            request_timeout_sec: 0,
            fetch_jitter_base: 0,
            fetch_jitter_spread: 100,
            fetch_abandon_cycles: 0,
            cut_schedule: 0,
            json_version: 2,
            json_channel_names: false,
        };
        config.sanitize();

        assert_eq!(config.update_period_ms, 1_000);
        assert_eq!(config.api_endpoint, ControllerConfig::default().api_endpoint);
        assert_eq!(config.request_timeout_sec, 1);
        assert_eq!(config.fetch_jitter_base, 1);
        assert_eq!(config.fetch_jitter_spread, 4);
        assert_eq!(config.fetch_abandon_cycles, 1);
        assert_eq!(config.cut_schedule, 1);

        let mut config = ControllerConfig {
            fetch_jitter_base: 2_000_000_000,
            fetch_jitter_spread: u32::MAX,
            ..ControllerConfig::default()
        };
        config.sanitize();

        assert_eq!(config.fetch_jitter_base, 10_000);
        assert_eq!(config.fetch_jitter_spread, 40_000);
    }

    #[test]
    fn runtime_config_tolerates_missing_hardware_sections() {
        let raw = r#"{"controller":{"update_period_ms":15000,"api_endpoint":"http://localhost/getcontrols.php","request_timeout_sec":10,"fetch_jitter_base":18,"fetch_jitter_spread":3,"fetch_abandon_cycles":4,"cut_schedule":10,"json_version":2,"json_channel_names":false},"timezone":"Europe/Helsinki"}"#;
        let runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(runtime.relays, RelayHardwareConfig::default());
        assert!(runtime.network.wifi_ssid.is_empty());
    }
}
