//! TOML config file loading, validation, and database seeding for slave
//! controllers and master devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::{Db, MasterConfig, SlaveConfig, SlaveZoneConfig};
use crate::device::DeviceId;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,
    #[serde(default)]
    pub slaves: Vec<SlaveEntry>,
    #[serde(default)]
    pub masters: Vec<MasterEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Simulated,
    Relay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlaveEntry {
    pub id: DeviceId,
    pub name: String,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default = "yes")]
    pub configured: bool,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    pub max_duration_min: i64,
    pub gpio_pin: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterEntry {
    pub id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub controllers: Vec<DeviceId>,
}

fn default_poll_interval() -> u64 {
    60
}

fn yes() -> bool {
    true
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM; GPIO 28+ are not exposed.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.poll_interval_sec == 0 {
            errors.push("poll_interval_sec must be positive".to_string());
        }

        let mut seen_ids: HashSet<DeviceId> = HashSet::new();
        self.validate_slaves(&mut seen_ids, &mut errors);
        self.validate_masters(&mut seen_ids, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_slaves(&self, seen_ids: &mut HashSet<DeviceId>, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for s in &self.slaves {
            let ctx = format!("slave {}", s.id);

            // ── Identity ────────────────────────────────────────
            if s.id <= 0 {
                errors.push(format!("{ctx}: id must be positive"));
            } else if !seen_ids.insert(s.id) {
                errors.push(format!("{ctx}: duplicate device id"));
            }
            if s.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            // ── Zones ───────────────────────────────────────────
            for (i, z) in s.zones.iter().enumerate() {
                let zctx = format!("{ctx} zone {}", i + 1);

                if z.name.trim().is_empty() {
                    errors.push(format!("{zctx}: name is empty"));
                }
                if z.max_duration_min <= 0 {
                    errors.push(format!(
                        "{zctx}: max_duration_min must be positive, got {}",
                        z.max_duration_min
                    ));
                }

                match z.gpio_pin {
                    Some(pin) if !VALID_GPIO_PINS.contains(&pin) => errors.push(format!(
                        "{zctx}: gpio_pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                    )),
                    Some(pin) if !seen_pins.insert(pin) => errors.push(format!(
                        "{zctx}: gpio_pin {pin} is already used by another zone"
                    )),
                    Some(_) => {}
                    None if self.driver == DriverKind::Relay && s.enabled => {
                        errors.push(format!("{zctx}: gpio_pin is required by the relay driver"))
                    }
                    None => {}
                }
            }
        }
    }

    fn validate_masters(&self, seen_ids: &mut HashSet<DeviceId>, errors: &mut Vec<String>) {
        for m in &self.masters {
            let ctx = format!("master {}", m.id);

            if m.id <= 0 {
                errors.push(format!("{ctx}: id must be positive"));
            } else if !seen_ids.insert(m.id) {
                errors.push(format!("{ctx}: duplicate device id"));
            }
            if m.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }
        }
    }

    pub fn slave_configs(&self) -> Vec<SlaveConfig> {
        self.slaves
            .iter()
            .map(|s| SlaveConfig {
                id: s.id,
                name: s.name.clone(),
                enabled: s.enabled,
                configured: s.configured,
                zones: s
                    .zones
                    .iter()
                    .map(|z| SlaveZoneConfig {
                        name: z.name.clone(),
                        max_duration_min: z.max_duration_min,
                        gpio_pin: z.gpio_pin,
                    })
                    .collect(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all slaves and masters from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in config.slave_configs() {
        db.upsert_slave(&s)
            .await
            .with_context(|| format!("failed to upsert slave {}", s.id))?;
    }

    for m in &config.masters {
        db.upsert_master(&MasterConfig {
            id: m.id,
            name: m.name.clone(),
            controllers: m.controllers.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert master {}", m.id))?;
    }

    tracing::info!(
        slaves = config.slaves.len(),
        masters = config.masters.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
