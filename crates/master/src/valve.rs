//! Relay outputs for one physical controller. The `gpio` feature gates the
//! real rppal driver; without it, a mock board keeps relay state in memory and
//! logs every change.
//!
//! A board energises at most one zone at a time: selecting a zone releases
//! every other relay first.

use anyhow::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::device::DeviceId;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ValveBoard {
    controller: DeviceId,
    pins: BTreeMap<u32, OutputPin>, // physical zone -> GPIO pin
    active_low: bool,               // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub(crate) fn new(
        controller: DeviceId,
        zone_to_gpio: &[(u32, u8)],
        active_low: bool,
    ) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = BTreeMap::new();

        for (zone, pin_num) in zone_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: relay released at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*zone, pin);
        }

        info!(controller, zones = pins.len(), "relay board initialised");
        Ok(Self {
            controller,
            pins,
            active_low,
        })
    }

    fn set(&mut self, zone: u32, on: bool) {
        let Some(pin) = self.pins.get_mut(&zone) else {
            return;
        };
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        debug!(controller = self.controller, zone, on, "relay set");
    }

    fn zones(&self) -> Vec<u32> {
        self.pins.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveBoard {
    controller: DeviceId,
    pub(super) zones: BTreeMap<u32, bool>, // physical zone -> energised
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub(crate) fn new(
        controller: DeviceId,
        zone_to_gpio: &[(u32, u8)],
        _active_low: bool,
    ) -> Result<Self> {
        let mut zones = BTreeMap::new();
        for (zone, pin_num) in zone_to_gpio {
            debug!(controller, zone, gpio = pin_num, "[mock-gpio] registered zone (not wired)");
            zones.insert(*zone, false);
        }
        info!(controller, zones = zones.len(), "[mock-gpio] relay board initialised (no hardware)");
        Ok(Self { controller, zones })
    }

    fn set(&mut self, zone: u32, on: bool) {
        if let Some(state) = self.zones.get_mut(&zone) {
            *state = on;
            debug!(controller = self.controller, zone, on, "[mock-gpio] relay set");
        }
    }

    fn zones(&self) -> Vec<u32> {
        self.zones.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Shared behaviour
// ---------------------------------------------------------------------------

impl ValveBoard {
    /// Energise `zone` and release every other relay. Returns false (and
    /// leaves the board untouched) when the zone has no relay.
    pub(crate) fn select(&mut self, zone: u32) -> bool {
        let zones = self.zones();
        if !zones.contains(&zone) {
            warn!(controller = self.controller, zone, "no relay wired for zone");
            return false;
        }
        for z in zones.into_iter().filter(|z| *z != zone) {
            self.set(z, false);
        }
        self.set(zone, true);
        true
    }

    pub(crate) fn all_off(&mut self) {
        for z in self.zones() {
            self.set(z, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
