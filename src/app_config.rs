//! `AppConfig`, `NetworkConfig`, `ForwardDetails` (spec.md §3) — the
//! declarative description of a user application that the Stager/Runner/
//! Forwarder pipelines consume.
//!
//! The YAML manifest parser that produces one of these is an external
//! collaborator (spec.md §1); this module only owns the shape and the two
//! pieces of parsing logic spec.md pins down exactly: the memory/disk
//! literal grammar and the three-map env-merge law.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{EngineError, Result};

/// Parse a suffixed memory/disk literal (`"512M"`, `"1g"`, `"2TB"`) into
/// megabytes, per spec.md §6's grammar `^(-?\d+)([KMGT])B?$` (case
/// insensitive), factor 1024.
pub fn parse_megabytes(literal: &str) -> Result<i64> {
    let re = Regex::new(r"(?i)^(-?\d+)([KMGT])B?$").unwrap();
    let caps = re
        .captures(literal.trim())
        .ok_or_else(|| EngineError::Other(format!("invalid byte quantity: {}", literal)))?;
    let n: i64 = caps[1]
        .parse()
        .map_err(|_| EngineError::Other(format!("invalid byte quantity: {}", literal)))?;
    let unit = caps[2].to_ascii_uppercase();
    let factor: i64 = match unit.as_str() {
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "T" => 1024i64.pow(4),
        _ => unreachable!("regex only matches K/M/G/T"),
    };
    Ok((n * factor) / (1024 * 1024))
}

/// Merge three env maps with the fixed precedence spec.md §3/§8 requires:
/// `base`, then `staging_or_running`, then `always` — last writer wins.
pub fn merge_env(
    base: &HashMap<String, String>,
    staging_or_running: &HashMap<String, String>,
    always: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out = base.clone();
    out.extend(staging_or_running.clone());
    out.extend(always.clone());
    out
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub name: String,
    /// Explicit buildpack list; empty means "detect".
    pub buildpacks: Vec<String>,
    pub command: Option<String>,
    pub memory_mb: Option<i64>,
    pub disk_mb: Option<i64>,
    pub staging_env: HashMap<String, String>,
    pub running_env: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub services: HashMap<String, serde_json::Value>,
}

impl AppConfig {
    /// Env merged for the staging phase: defaults, then `staging_env`,
    /// then `env` (always wins).
    pub fn staging_merged_env(&self, defaults: &HashMap<String, String>) -> HashMap<String, String> {
        merge_env(defaults, &self.staging_env, &self.env)
    }

    /// Env merged for the run phase: defaults, then `running_env`, then
    /// `env`.
    pub fn running_merged_env(&self, defaults: &HashMap<String, String>) -> HashMap<String, String> {
        merge_env(defaults, &self.running_env, &self.env)
    }

    /// `VCAP_SERVICES` JSON payload.
    pub fn vcap_services_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.services)?)
    }
}

/// Either bind a host port on the app container, or join an existing
/// "network" container's namespace (spec.md §3 `NetworkConfig`);
/// `container_id` wins when both could apply.
pub use crate::container::NetworkConfig;

/// SSH target plus a one-time-code supplier and the port-forward list
/// (spec.md §3 `ForwardDetails`).
pub struct ForwardDetails {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Produces a fresh one-time code each time it's called (spec.md §4.J).
    pub code: Box<dyn FnMut() -> Result<String> + Send>,
    pub forwards: Vec<PortForward>,
}

#[derive(Debug, Clone)]
pub struct PortForward {
    pub name: String,
    pub from: u16,
    pub to: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_megabytes("512M").unwrap(), 512);
        assert_eq!(parse_megabytes("1G").unwrap(), 1024);
        assert_eq!(parse_megabytes("2048K").unwrap(), 2);
        assert_eq!(parse_megabytes("1T").unwrap(), 1024 * 1024);
    }

    #[test]
    fn is_case_insensitive_and_accepts_trailing_b() {
        assert_eq!(parse_megabytes("512m").unwrap(), 512);
        assert_eq!(parse_megabytes("512MB").unwrap(), 512);
    }

    #[test]
    fn malformed_literal_is_an_error() {
        let err = parse_megabytes("five gigs").unwrap_err();
        assert!(err.to_string().contains("invalid byte"));
    }

    #[test]
    fn env_merge_law_last_writer_wins() {
        let base: HashMap<_, _> = [("A".to_string(), "base".to_string()), ("K".to_string(), "base".to_string())]
            .into_iter()
            .collect();
        let mid: HashMap<_, _> = [("A".to_string(), "mid".to_string())].into_iter().collect();
        let top: HashMap<_, _> = [("A".to_string(), "top".to_string())].into_iter().collect();

        let merged = merge_env(&base, &mid, &top);
        assert_eq!(merged["A"], "top");
        assert_eq!(merged["K"], "base");
    }
}
