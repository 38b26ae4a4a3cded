use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;

use super::MtuConfig;

/// The two independently discovered path directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MtuDirection {
    Outgoing,
    Incoming,
}

impl std::fmt::Display for MtuDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MtuDirection::Outgoing => write!(f, "outgoing"),
            MtuDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Coarse lifecycle state of a path direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuStatus {
    Initial,
    Searching,
    Validated,
    Blackhole,
    Degraded,
}

/// Per-direction probing configuration, history, and status.
#[derive(Debug)]
pub struct PathState {
    pub current_mtu: u16,
    pub min_mtu: u16,
    pub max_mtu: u16,
    pub step_size: u16,
    pub current_probe_mtu: Option<u16>,
    pub last_successful_mtu: u16,
    pub consecutive_failures: u32,
    pub mtu_validated: bool,
    pub in_search_phase: bool,
    pub status: MtuStatus,
}

impl PathState {
    pub fn new(config: &MtuConfig) -> Self {
        // The protocol minimum is always deliverable, so both the active MTU
        // and the success watermark start there.
        Self {
            current_mtu: config.min_mtu,
            min_mtu: config.min_mtu,
            max_mtu: config.max_mtu,
            step_size: config.step_size,
            current_probe_mtu: None,
            last_successful_mtu: config.min_mtu,
            consecutive_failures: 0,
            mtu_validated: false,
            in_search_phase: false,
            status: MtuStatus::Initial,
        }
    }

    /// Checks the structural invariants that must hold at every quiescent
    /// point. Violations indicate a state machine bug, never bad input.
    pub fn invariants_hold(&self) -> bool {
        self.min_mtu <= self.last_successful_mtu
            && self.last_successful_mtu <= self.current_mtu
            && self.current_mtu <= self.max_mtu
            && (!self.in_search_phase || self.status == MtuStatus::Searching)
            && (self.status != MtuStatus::Validated || !self.in_search_phase)
            && self
                .current_probe_mtu
                .map_or(true, |p| p >= self.last_successful_mtu && p <= self.max_mtu)
    }
}

/// An in-flight probe: the size under test and when it left.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRecord {
    pub size: u16,
    pub sent_at: Instant,
}

/// Maps in-flight probe identifiers to probed sizes. One registry exists per
/// direction; ids are allocated by the connection adapter and never reused
/// within a connection lifetime.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    records: HashMap<u32, ProbeRecord>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    pub fn register(&mut self, probe_id: u32, size: u16, now: Instant) {
        if self
            .records
            .insert(
                probe_id,
                ProbeRecord {
                    size,
                    sent_at: now,
                },
            )
            .is_some()
        {
            // The adapter contract guarantees unique ids; a collision means
            // the previous record is unrecoverable.
            warn!("Probe id {} reused while still in flight", probe_id);
        }
    }

    /// Removes and returns the record for a probe, if it is known.
    pub fn take(&mut self, probe_id: u32) -> Option<ProbeRecord> {
        self.records.remove(&probe_id)
    }

    /// Removes and returns every probe whose timeout has elapsed.
    pub fn take_expired(&mut self, timeout: Duration, now: Instant) -> Vec<(u32, ProbeRecord)> {
        let expired: Vec<u32> = self
            .records
            .iter()
            .filter(|(_, r)| now.duration_since(r.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.records.remove(&id).map(|r| (id, r)))
            .collect()
    }

    pub fn drain(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, probe_id: u32) -> bool {
        self.records.contains_key(&probe_id)
    }
}
