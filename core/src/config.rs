//! Session configuration — recognized keys, typed map, defaults
//!
//! Parameters travel as a string→tagged-value map inside the
//! `Parameters` message; locally they resolve into a `SessionConfig`
//! with typed fields and defaults for everything the map omits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Recognized parameter keys. Anything else in the map is ignored.
pub mod keys {
    pub const N_CLIENTS: &str = "NClients";
    pub const N_TRUSTEES: &str = "NTrustees";
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    pub const DOWNSTREAM_CELL_SIZE: &str = "DownstreamCellSize";
    pub const WINDOW_SIZE: &str = "WindowSize";
    pub const USE_UDP: &str = "UseUDP";
    pub const USE_DUMMY_DATA_DOWN: &str = "UseDummyDataDown";
    pub const USE_OPEN_CLOSED_SLOTS: &str = "UseOpenClosedSlots";
    pub const EQUIVOCATION_PROTECTION_ENABLED: &str = "EquivocationProtectionEnabled";
    pub const DISRUPTION_PROTECTION_ENABLED: &str = "DisruptionProtectionEnabled";
    pub const FORCE_DISRUPTION_SINCE_ROUND_3: &str = "ForceDisruptionSinceRound3";
    pub const OPEN_CLOSED_SLOTS_MIN_DELAY_BETWEEN_REQUESTS: &str =
        "OpenClosedSlotsMinDelayBetweenRequests";
    pub const RELAY_MAX_NUMBER_OF_CONSECUTIVE_FAILED_ROUNDS: &str =
        "RelayMaxNumberOfConsecutiveFailedRounds";
    pub const RELAY_PROCESSING_LOOP_SLEEP_TIME: &str = "RelayProcessingLoopSleepTime";
    pub const RELAY_ROUND_TIMEOUT: &str = "RelayRoundTimeOut";
    pub const RELAY_TRUSTEE_CACHE_LOW_BOUND: &str = "RelayTrusteeCacheLowBound";
    pub const RELAY_TRUSTEE_CACHE_HIGH_BOUND: &str = "RelayTrusteeCacheHighBound";
    pub const EXPERIMENT_ROUND_LIMIT: &str = "ExperimentRoundLimit";
    pub const START_NOW: &str = "StartNow";
    pub const NEXT_FREE_TRUSTEE_ID: &str = "NextFreeTrusteeID";
    pub const NEXT_FREE_CLIENT_ID: &str = "NextFreeClientID";
}

/// One tagged parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// The wire form of the configuration: a string→tagged-value map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterMap {
    entries: BTreeMap<String, ParamValue>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bool(&mut self, key: &str, value: bool) {
        self.entries.insert(key.to_string(), ParamValue::Bool(value));
    }

    pub fn add_int(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), ParamValue::Int(value));
    }

    pub fn add_str(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_string(), ParamValue::Str(value.to_string()));
    }

    /// `entries[key]` as bool, or `fallback` if absent or mistyped.
    pub fn bool_or(&self, key: &str, fallback: bool) -> bool {
        match self.entries.get(key) {
            Some(ParamValue::Bool(v)) => *v,
            _ => fallback,
        }
    }

    /// `entries[key]` as integer, or `fallback` if absent or mistyped.
    pub fn int_or(&self, key: &str, fallback: i64) -> i64 {
        match self.entries.get(key) {
            Some(ParamValue::Int(v)) => *v,
            _ => fallback,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Resolved session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub n_clients: usize,
    pub n_trustees: usize,
    /// Bytes of upstream payload per cell.
    pub payload_size: usize,
    /// Bytes of downstream payload per cell (with dummy padding).
    pub downstream_cell_size: usize,
    /// Max concurrent open rounds.
    pub window_size: usize,
    pub use_udp: bool,
    pub use_dummy_data_down: bool,
    pub use_open_closed_slots: bool,
    pub equivocation_protection: bool,
    pub disruption_protection: bool,
    /// Test hook: corrupt client 0's downstream copy from round 3 on.
    pub force_disruption_since_round_3: bool,
    /// Sleep when an open/closed bitmap comes back all-zero, in ms.
    pub open_closed_min_delay_ms: u64,
    pub max_consecutive_failed_rounds: u32,
    /// Inter-round pause, in ms.
    pub processing_loop_sleep_ms: u64,
    /// Per-round liveness timeout, in ms.
    pub round_timeout_ms: u64,
    /// Trustee rate-limiter bounds on buffered-ahead ciphers.
    pub trustee_cache_low_bound: usize,
    pub trustee_cache_high_bound: usize,
    /// Stop after this many rounds; -1 means unlimited.
    pub experiment_round_limit: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 1000,
            downstream_cell_size: 1000,
            window_size: 1,
            use_udp: false,
            use_dummy_data_down: false,
            use_open_closed_slots: false,
            equivocation_protection: false,
            disruption_protection: false,
            force_disruption_since_round_3: false,
            open_closed_min_delay_ms: 100,
            max_consecutive_failed_rounds: 3,
            processing_loop_sleep_ms: 0,
            round_timeout_ms: 10_000,
            trustee_cache_low_bound: 1,
            trustee_cache_high_bound: 10,
            experiment_round_limit: -1,
        }
    }
}

impl SessionConfig {
    /// Resolve a parameter map on top of `self`, keeping current values
    /// for absent keys.
    pub fn merged_with(&self, params: &ParameterMap) -> SessionConfig {
        use keys::*;
        SessionConfig {
            n_clients: params.int_or(N_CLIENTS, self.n_clients as i64).max(0) as usize,
            n_trustees: params.int_or(N_TRUSTEES, self.n_trustees as i64).max(0) as usize,
            payload_size: params.int_or(PAYLOAD_SIZE, self.payload_size as i64).max(0) as usize,
            downstream_cell_size: params
                .int_or(DOWNSTREAM_CELL_SIZE, self.downstream_cell_size as i64)
                .max(0) as usize,
            window_size: params.int_or(WINDOW_SIZE, self.window_size as i64).max(1) as usize,
            use_udp: params.bool_or(USE_UDP, self.use_udp),
            use_dummy_data_down: params.bool_or(USE_DUMMY_DATA_DOWN, self.use_dummy_data_down),
            use_open_closed_slots: params
                .bool_or(USE_OPEN_CLOSED_SLOTS, self.use_open_closed_slots),
            equivocation_protection: params
                .bool_or(EQUIVOCATION_PROTECTION_ENABLED, self.equivocation_protection),
            disruption_protection: params
                .bool_or(DISRUPTION_PROTECTION_ENABLED, self.disruption_protection),
            force_disruption_since_round_3: params.bool_or(
                FORCE_DISRUPTION_SINCE_ROUND_3,
                self.force_disruption_since_round_3,
            ),
            open_closed_min_delay_ms: params.int_or(
                OPEN_CLOSED_SLOTS_MIN_DELAY_BETWEEN_REQUESTS,
                self.open_closed_min_delay_ms as i64,
            ) as u64,
            max_consecutive_failed_rounds: params.int_or(
                RELAY_MAX_NUMBER_OF_CONSECUTIVE_FAILED_ROUNDS,
                self.max_consecutive_failed_rounds as i64,
            ) as u32,
            processing_loop_sleep_ms: params.int_or(
                RELAY_PROCESSING_LOOP_SLEEP_TIME,
                self.processing_loop_sleep_ms as i64,
            ) as u64,
            round_timeout_ms: params.int_or(RELAY_ROUND_TIMEOUT, self.round_timeout_ms as i64)
                as u64,
            trustee_cache_low_bound: params.int_or(
                RELAY_TRUSTEE_CACHE_LOW_BOUND,
                self.trustee_cache_low_bound as i64,
            ) as usize,
            trustee_cache_high_bound: params.int_or(
                RELAY_TRUSTEE_CACHE_HIGH_BOUND,
                self.trustee_cache_high_bound as i64,
            ) as usize,
            experiment_round_limit: params
                .int_or(EXPERIMENT_ROUND_LIMIT, self.experiment_round_limit),
        }
    }

    /// Serialize the full configuration back into a map, for the relay's
    /// parameter rebroadcast to trustees and clients.
    pub fn to_params(&self) -> ParameterMap {
        use keys::*;
        let mut map = ParameterMap::new();
        map.add_int(N_CLIENTS, self.n_clients as i64);
        map.add_int(N_TRUSTEES, self.n_trustees as i64);
        map.add_int(PAYLOAD_SIZE, self.payload_size as i64);
        map.add_int(DOWNSTREAM_CELL_SIZE, self.downstream_cell_size as i64);
        map.add_int(WINDOW_SIZE, self.window_size as i64);
        map.add_bool(USE_UDP, self.use_udp);
        map.add_bool(USE_DUMMY_DATA_DOWN, self.use_dummy_data_down);
        map.add_bool(USE_OPEN_CLOSED_SLOTS, self.use_open_closed_slots);
        map.add_bool(
            EQUIVOCATION_PROTECTION_ENABLED,
            self.equivocation_protection,
        );
        map.add_bool(DISRUPTION_PROTECTION_ENABLED, self.disruption_protection);
        map.add_bool(
            FORCE_DISRUPTION_SINCE_ROUND_3,
            self.force_disruption_since_round_3,
        );
        map.add_int(
            OPEN_CLOSED_SLOTS_MIN_DELAY_BETWEEN_REQUESTS,
            self.open_closed_min_delay_ms as i64,
        );
        map.add_int(
            RELAY_MAX_NUMBER_OF_CONSECUTIVE_FAILED_ROUNDS,
            self.max_consecutive_failed_rounds as i64,
        );
        map.add_int(
            RELAY_PROCESSING_LOOP_SLEEP_TIME,
            self.processing_loop_sleep_ms as i64,
        );
        map.add_int(RELAY_ROUND_TIMEOUT, self.round_timeout_ms as i64);
        map.add_int(
            RELAY_TRUSTEE_CACHE_LOW_BOUND,
            self.trustee_cache_low_bound as i64,
        );
        map.add_int(
            RELAY_TRUSTEE_CACHE_HIGH_BOUND,
            self.trustee_cache_high_bound as i64,
        );
        map.add_int(EXPERIMENT_ROUND_LIMIT, self.experiment_round_limit);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_empty_map() {
        let config = SessionConfig::default().merged_with(&ParameterMap::new());
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn map_overrides_selected_keys() {
        let mut map = ParameterMap::new();
        map.add_int(keys::N_CLIENTS, 5);
        map.add_bool(keys::USE_OPEN_CLOSED_SLOTS, true);

        let config = SessionConfig::default().merged_with(&map);
        assert_eq!(config.n_clients, 5);
        assert!(config.use_open_closed_slots);
        assert_eq!(config.n_trustees, SessionConfig::default().n_trustees);
    }

    #[test]
    fn accessors_fall_back_on_type_mismatch() {
        let mut map = ParameterMap::new();
        map.add_str(keys::N_CLIENTS, "five");
        assert_eq!(map.int_or(keys::N_CLIENTS, 3), 3);
        assert!(!map.bool_or(keys::USE_UDP, false));
    }

    #[test]
    fn config_roundtrips_through_params() {
        let mut config = SessionConfig::default();
        config.n_clients = 4;
        config.n_trustees = 2;
        config.payload_size = 100;
        config.equivocation_protection = true;
        config.experiment_round_limit = 50;

        let restored = SessionConfig::default().merged_with(&config.to_params());
        assert_eq!(restored, config);
    }

    #[test]
    fn window_size_is_at_least_one() {
        let mut map = ParameterMap::new();
        map.add_int(keys::WINDOW_SIZE, 0);
        let config = SessionConfig::default().merged_with(&map);
        assert_eq!(config.window_size, 1);
    }
}
