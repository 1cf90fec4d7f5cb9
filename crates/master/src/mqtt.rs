//! MQTT command ingress: topic and payload parsing for the commands the host
//! accepts.

use crate::device::DeviceId;

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

/// Topic filters the host subscribes to.
pub const SUBSCRIPTIONS: [&str; 3] = [
    "master/+/zone/set",
    "master/+/status/get",
    "controller/+/changed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Zone 0 turns every zone off.
    SetZone { master: DeviceId, zone: u32 },
    RequestStatus { master: DeviceId },
    ControllerChanged { controller: DeviceId },
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

fn parse_id(segment: &str) -> Option<DeviceId> {
    segment.parse::<DeviceId>().ok().filter(|id| *id > 0)
}

/// Parse a zone payload: "OFF", "0" or empty → 0; otherwise a zone number
/// (case-insensitive, trims whitespace).
pub fn parse_zone_payload(payload: &[u8]) -> Result<u32, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "" | "OFF" => Ok(0),
        n => n.parse::<u32>().map_err(|_| format!("unknown zone command '{s}'")),
    }
}

/// Map an incoming publish onto a [`Command`].
pub fn parse_command(topic: &str, payload: &[u8]) -> Result<Command, String> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["master", id, "zone", "set"] => {
            let master = parse_id(id).ok_or_else(|| format!("bad master id '{id}'"))?;
            let zone = parse_zone_payload(payload)?;
            Ok(Command::SetZone { master, zone })
        }
        ["master", id, "status", "get"] => {
            let master = parse_id(id).ok_or_else(|| format!("bad master id '{id}'"))?;
            Ok(Command::RequestStatus { master })
        }
        ["controller", id, "changed"] => {
            let controller = parse_id(id).ok_or_else(|| format!("bad controller id '{id}'"))?;
            Ok(Command::ControllerChanged { controller })
        }
        _ => Err(format!("unhandled topic '{topic}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
