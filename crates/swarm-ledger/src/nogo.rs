// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use swarm_core::{NoGoZone, NoGoZoneType, SwarmError};

/// C3: the set of address ranges currently reserved by in-flight code
/// injection work, shared across agents via bus broadcast (§4.3). Backed by
/// a plain in-memory `Vec` guarded by a mutex — unlike the tool-call ledger
/// this registry doesn't need to survive a process restart, since zones are
/// re-broadcast by each agent's injector as it resumes.
pub struct NoGoZoneRegistry {
    zones: Mutex<Vec<NoGoZone>>,
}

impl Default for NoGoZoneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NoGoZoneRegistry {
    pub fn new() -> Self {
        Self { zones: Mutex::new(Vec::new()) }
    }

    /// Record a new reservation. Overlap with an existing zone is logged
    /// but never rejected — the caller (the allocator) is expected to have
    /// already checked `find_safe_allocation` before reaching here, and a
    /// late broadcast from a peer agent must not be allowed to fail.
    pub fn add_zone(&self, zone: NoGoZone) {
        let mut zones = self.zones.lock().expect("no-go registry mutex poisoned");
        if let Some(existing) = zones.iter().find(|z| z.overlaps_range(zone.start, zone.end)) {
            tracing::warn!(
                new_start = zone.start, new_end = zone.end,
                existing_agent = %existing.agent_id,
                "no-go zone overlaps an existing reservation"
            );
        }
        zones.push(zone);
    }

    pub fn remove_agent_zones(&self, agent_id: &str) {
        let mut zones = self.zones.lock().expect("no-go registry mutex poisoned");
        zones.retain(|z| z.agent_id != agent_id);
    }

    pub fn is_no_go(&self, address: u64) -> bool {
        let zones = self.zones.lock().expect("no-go registry mutex poisoned");
        zones.iter().any(|z| z.contains(address))
    }

    /// Linear scan for the first `size`-byte range starting at or after
    /// `hint` that clears every reserved zone (§4.3, mirrors the original
    /// allocator's forward scan).
    pub fn find_safe_allocation(&self, hint: u64, size: u64) -> Result<u64, SwarmError> {
        if size == 0 {
            return Ok(hint);
        }

        let zones = self.zones.lock().expect("no-go registry mutex poisoned");
        let mut candidate = hint;
        loop {
            let end = candidate.checked_add(size).ok_or(SwarmError::NoSafeAddress { size })?;
            match zones.iter().find(|z| z.overlaps_range(candidate, end)) {
                Some(z) => {
                    candidate = z.end;
                }
                None => return Ok(candidate),
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NoGoZone> {
        self.zones.lock().expect("no-go registry mutex poisoned").clone()
    }
}

/// Render a zone in the wire format used for `#agents` broadcasts:
/// `NOGO|{SEGMENT|CAVE}|<agent_id>|<start_hex>|<end_hex>`.
pub fn serialize_zone(zone: &NoGoZone) -> String {
    let kind = match zone.zone_type {
        NoGoZoneType::TempSegment => "SEGMENT",
        NoGoZoneType::CodeCave => "CAVE",
    };
    format!("NOGO|{kind}|{}|{:#x}|{:#x}", zone.agent_id, zone.start, zone.end)
}

/// Inverse of `serialize_zone`. Returns `None` for anything that doesn't
/// match the expected shape rather than erroring, since this parses
/// untrusted bus traffic (§4.1 failure semantics).
pub fn deserialize_zone(line: &str) -> Option<NoGoZone> {
    let mut parts = line.split('|');
    if parts.next()? != "NOGO" {
        return None;
    }
    let kind = match parts.next()? {
        "SEGMENT" => NoGoZoneType::TempSegment,
        "CAVE" => NoGoZoneType::CodeCave,
        _ => return None,
    };
    let agent_id = parts.next()?.to_string();
    let start = u64::from_str_radix(parts.next()?.trim_start_matches("0x"), 16).ok()?;
    let end = u64::from_str_radix(parts.next()?.trim_start_matches("0x"), 16).ok()?;
    Some(NoGoZone::new(start, end, agent_id, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trips_through_deserialize() {
        let zone = NoGoZone::new(0xa000, 0xb000, "agent_1".to_string(), NoGoZoneType::TempSegment);
        let wire = serialize_zone(&zone);
        assert_eq!(wire, "NOGO|SEGMENT|agent_1|0xa000|0xb000");

        let parsed = deserialize_zone(&wire).unwrap();
        assert_eq!(parsed.start, zone.start);
        assert_eq!(parsed.end, zone.end);
        assert_eq!(parsed.agent_id, zone.agent_id);
    }

    #[test]
    fn deserialize_rejects_malformed_lines() {
        assert!(deserialize_zone("NOGO|SEGMENT|agent_1|0xa000").is_none());
        assert!(deserialize_zone("NOT_NOGO|SEGMENT|agent_1|0xa000|0xb000").is_none());
    }

    #[test]
    fn find_safe_allocation_skips_overlapping_zones() {
        let registry = NoGoZoneRegistry::new();
        registry.add_zone(NoGoZone::new(0x1000, 0x2000, "agent_1".to_string(), NoGoZoneType::TempSegment));

        let addr = registry.find_safe_allocation(0x1500, 0x100).unwrap();
        assert!(addr >= 0x2000);
    }

    #[test]
    fn find_safe_allocation_with_zero_size_returns_the_hint_even_inside_a_zone() {
        let registry = NoGoZoneRegistry::new();
        registry.add_zone(NoGoZone::new(0x1000, 0x2000, "agent_1".to_string(), NoGoZoneType::TempSegment));

        let addr = registry.find_safe_allocation(0x1500, 0).unwrap();
        assert_eq!(addr, 0x1500);
    }

    #[test]
    fn remove_agent_zones_frees_the_range() {
        let registry = NoGoZoneRegistry::new();
        registry.add_zone(NoGoZone::new(0x1000, 0x2000, "agent_1".to_string(), NoGoZoneType::TempSegment));
        assert!(registry.is_no_go(0x1500));

        registry.remove_agent_zones("agent_1");
        assert!(!registry.is_no_go(0x1500));
    }
}
