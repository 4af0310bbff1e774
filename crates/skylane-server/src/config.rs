//! Server configuration from environment.

use std::env;
use std::str::FromStr;

pub const DEFAULT_TERRAIN_URL: &str =
    "https://api.maptiler.com/tiles/terrain-rgb-v2/{z}/{x}/{y}.webp";

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    /// Tile URL template with `{z}`, `{x}` and `{y}` placeholders.
    pub terrain_url: String,
    /// Sent as the `key` query parameter when non-empty.
    pub terrain_key: String,
    pub terrain_zoom: u8,
    pub terrain_cache_tiles: usize,
    pub terrain_cache_ttl_s: u64,
    pub terrain_max_in_flight: usize,
    /// Retries after the first attempt.
    pub terrain_retries: u32,
    pub terrain_backoff_ms: u64,
    pub terrain_timeout_s: u64,
    /// When false, planning goes ahead geometry-only if endpoint elevation
    /// cannot be fetched.
    pub terrain_require: bool,
    /// Charge climbs and credit descents when costing graph edges.
    pub elevation_weighting: bool,
    pub route_deadline_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            terrain_url: DEFAULT_TERRAIN_URL.to_string(),
            terrain_key: String::new(),
            terrain_zoom: 12,
            terrain_cache_tiles: 500,
            terrain_cache_ttl_s: 3600,
            terrain_max_in_flight: 8,
            terrain_retries: 3,
            terrain_backoff_ms: 100,
            terrain_timeout_s: 10,
            terrain_require: true,
            elevation_weighting: false,
            route_deadline_s: 30,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_port: env_or("SKYLANE_PORT", defaults.server_port),
            terrain_url: env::var("SKYLANE_TERRAIN_URL").unwrap_or(defaults.terrain_url),
            terrain_key: env::var("SKYLANE_TERRAIN_KEY").unwrap_or(defaults.terrain_key),
            terrain_zoom: env_or("SKYLANE_TERRAIN_ZOOM", defaults.terrain_zoom).min(22),
            terrain_cache_tiles: env_or("SKYLANE_TERRAIN_CACHE_TILES", defaults.terrain_cache_tiles)
                .max(1),
            terrain_cache_ttl_s: env_or("SKYLANE_TERRAIN_CACHE_TTL_S", defaults.terrain_cache_ttl_s),
            terrain_max_in_flight: env_or(
                "SKYLANE_TERRAIN_MAX_IN_FLIGHT",
                defaults.terrain_max_in_flight,
            )
            .max(1),
            terrain_retries: env_or("SKYLANE_TERRAIN_RETRIES", defaults.terrain_retries),
            terrain_backoff_ms: env_or("SKYLANE_TERRAIN_BACKOFF_MS", defaults.terrain_backoff_ms),
            terrain_timeout_s: env_or("SKYLANE_TERRAIN_TIMEOUT_S", defaults.terrain_timeout_s)
                .max(1),
            terrain_require: env_flag("SKYLANE_TERRAIN_REQUIRE", defaults.terrain_require),
            elevation_weighting: env_flag(
                "SKYLANE_ELEVATION_WEIGHTING",
                defaults.elevation_weighting,
            ),
            route_deadline_s: env_or("SKYLANE_ROUTE_DEADLINE_S", defaults.route_deadline_s).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.terrain_zoom, 12);
        assert_eq!(config.terrain_cache_tiles, 500);
        assert_eq!(config.terrain_retries, 3);
        assert!(config.terrain_require);
        assert!(!config.elevation_weighting);
        assert!(config.terrain_url.contains("{z}/{x}/{y}"));
    }

    #[test]
    fn flag_parsing_accepts_common_spellings() {
        std::env::set_var("SKYLANE_TEST_FLAG_OFF", "off");
        std::env::set_var("SKYLANE_TEST_FLAG_BAD", "maybe");
        assert!(!env_flag("SKYLANE_TEST_FLAG_OFF", true));
        assert!(env_flag("SKYLANE_TEST_FLAG_BAD", true));
        assert!(!env_flag("SKYLANE_TEST_FLAG_UNSET", false));
    }
}
