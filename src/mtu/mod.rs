// Copyright (c) 2024, The QuicVeil Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Path MTU Discovery Module
//!
//! Determines, per network path and per direction, the largest packet size
//! that can be transmitted end-to-end without fragmentation or silent drop,
//! and publishes the validated size to the enclosing QUIC connection.
//!
//! The manager performs binary-search convergence over `[min_mtu, max_mtu]`,
//! watches for blackholes (persistent silent drops above a known-good size),
//! and adapts the committed MTU to loss/RTT feedback between searches.
//! Both the transport's receive path and the statistics tick call into the
//! manager concurrently; a single mutex over the whole state keeps every
//! transition atomic. The event rate is low and off the hot packet path, so
//! finer locking buys nothing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::ConfigError;

mod discovery;
mod path;

use discovery::ManagerState;
pub use path::{MtuDirection, MtuStatus, PathState, ProbeRecord, ProbeRegistry};

/// Narrow outbound interface through which the manager reaches the enclosing
/// connection. All three calls are side-effecting, non-blocking, and must
/// never call back into the manager: they may be invoked with the manager's
/// lock held.
pub trait ConnectionAdapter: Send + Sync {
    /// Hands a probe of `size` bytes for `direction` to the transport queue
    /// and returns its unique identifier. Ids are never reused within a
    /// connection lifetime.
    fn send_probe(&self, size: u16, direction: MtuDirection) -> u32;

    /// Queues the response frame for a probe received from the peer.
    fn send_probe_response(&self, probe_id: u32, success: bool);

    /// Informs the enclosing QUIC connection of the active outgoing MTU.
    fn set_mtu_size(&self, size: u16);
}

/// Monotonic time source for adaptive-interval gating and probe timeouts.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default clock, backed by `Instant::now`.
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Configuration for the path MTU manager.
#[derive(Debug, Clone)]
pub struct MtuConfig {
    /// Search floor; the manager never drops below it.
    pub min_mtu: u16,
    /// Search ceiling; probing never exceeds it.
    pub max_mtu: u16,
    /// Initial increment for upward exploration.
    pub step_size: u16,
    /// A probe without a response within this window counts as failed.
    pub probe_timeout: Duration,
    /// Consecutive failures before a blackhole is declared.
    pub blackhole_threshold: u32,
    /// Minimum spacing between adaptive actions.
    pub adaptive_check_interval: Duration,
    /// Whether Incoming discovery runs after Outgoing converges.
    pub bidirectional_enabled: bool,
    /// Loss rate above which the adaptive controller decreases the MTU.
    pub high_loss_threshold: f32,
    /// Loss rate below which an opportunistic increase is considered.
    pub low_loss_threshold: f32,
    /// RTT below which an opportunistic increase is considered.
    pub good_rtt_threshold_ms: u32,
}

impl Default for MtuConfig {
    fn default() -> Self {
        Self {
            min_mtu: 1200,
            max_mtu: 1500,
            step_size: 32,
            probe_timeout: Duration::from_millis(1000),
            blackhole_threshold: 3,
            adaptive_check_interval: Duration::from_millis(5000),
            bidirectional_enabled: true,
            high_loss_threshold: 0.05,
            low_loss_threshold: 0.01,
            good_rtt_threshold_ms: 100,
        }
    }
}

impl MtuConfig {
    pub fn from_toml(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        #[derive(Deserialize)]
        struct Root {
            mtu: Option<Section>,
        }

        #[derive(Deserialize)]
        struct Section {
            min_mtu: Option<u16>,
            max_mtu: Option<u16>,
            step_size: Option<u16>,
            probe_timeout: Option<u64>,
            blackhole_threshold: Option<u32>,
            adaptive_check_interval: Option<u64>,
            bidirectional_enabled: Option<bool>,
            high_loss_threshold: Option<f32>,
            low_loss_threshold: Option<f32>,
            good_rtt_threshold_ms: Option<u32>,
        }

        let root: Root = toml::from_str(s)?;
        let mut cfg = MtuConfig::default();
        if let Some(sec) = root.mtu {
            if let Some(v) = sec.min_mtu {
                cfg.min_mtu = v;
            }
            if let Some(v) = sec.max_mtu {
                cfg.max_mtu = v;
            }
            if let Some(v) = sec.step_size {
                cfg.step_size = v;
            }
            if let Some(v) = sec.probe_timeout {
                cfg.probe_timeout = Duration::from_millis(v);
            }
            if let Some(v) = sec.blackhole_threshold {
                cfg.blackhole_threshold = v;
            }
            if let Some(v) = sec.adaptive_check_interval {
                cfg.adaptive_check_interval = Duration::from_millis(v);
            }
            if let Some(v) = sec.bidirectional_enabled {
                cfg.bidirectional_enabled = v;
            }
            if let Some(v) = sec.high_loss_threshold {
                cfg.high_loss_threshold = v;
            }
            if let Some(v) = sec.low_loss_threshold {
                cfg.low_loss_threshold = v;
            }
            if let Some(v) = sec.good_rtt_threshold_ms {
                cfg.good_rtt_threshold_ms = v;
            }
        }
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Rejects contradictory configurations. Called at manager construction;
    /// a failure here is fatal to the connection setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_mtu > self.max_mtu {
            return Err(ConfigError::MtuRange {
                min: self.min_mtu,
                max: self.max_mtu,
            });
        }
        if self.step_size == 0 {
            return Err(ConfigError::ZeroStep);
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::ZeroProbeTimeout);
        }
        if self.blackhole_threshold == 0 {
            return Err(ConfigError::ZeroBlackholeThreshold);
        }
        if self.low_loss_threshold >= self.high_loss_threshold {
            return Err(ConfigError::LossThresholds {
                low: self.low_loss_threshold,
                high: self.high_loss_threshold,
            });
        }
        Ok(())
    }
}

/// The path MTU manager: one per connection, shared between the transport's
/// receive path and the periodic statistics caller.
pub struct PathMtuManager {
    config: MtuConfig,
    adapter: Arc<dyn ConnectionAdapter>,
    clock: Arc<dyn Clock>,
    inner: Mutex<ManagerState>,
}

impl PathMtuManager {
    /// Builds a manager over the given adapter with the default monotonic
    /// clock. Fails only on contradictory configuration.
    pub fn new(
        config: MtuConfig,
        adapter: Arc<dyn ConnectionAdapter>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, adapter, Arc::new(MonotonicClock))
    }

    /// Builds a manager with an explicit time source.
    pub fn with_clock(
        config: MtuConfig,
        adapter: Arc<dyn ConnectionAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Mutex::new(ManagerState::new(&config));
        Ok(Self {
            config,
            adapter,
            clock,
            inner,
        })
    }

    /// Begins discovery on the outgoing path. If bidirectional discovery is
    /// enabled, the incoming search follows automatically once the outgoing
    /// side validates.
    pub fn start(&self) {
        let now = self.clock.now();
        let mut state = self.inner.lock().unwrap();
        state.start_discovery(MtuDirection::Outgoing, now, &self.config, &*self.adapter);
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// Tears discovery down: both registries are drained and no further
    /// probe callbacks fire after this returns.
    pub fn stop(&self) {
        let mut state = self.inner.lock().unwrap();
        state.shutdown();
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// Restarts discovery for one direction, e.g. after path migration or to
    /// leave a blackhole state once the transport revalidated the path.
    pub fn restart(&self, direction: MtuDirection) {
        let now = self.clock.now();
        let mut state = self.inner.lock().unwrap();
        state.restart(direction, now, &self.config, &*self.adapter);
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// Delivers a probe acknowledgment (or negative acknowledgment) from the
    /// transport. Responses for unknown ids are logged and discarded.
    pub fn on_probe_response(&self, probe_id: u32, success: bool, is_incoming: bool) {
        let direction = if is_incoming {
            MtuDirection::Incoming
        } else {
            MtuDirection::Outgoing
        };
        let now = self.clock.now();
        let mut state = self.inner.lock().unwrap();
        state.handle_probe_response(
            probe_id,
            success,
            direction,
            now,
            &self.config,
            &*self.adapter,
        );
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// Handles a probe frame the peer sent toward us and queues the
    /// response. Duplicates yield the same response and no state regression.
    pub fn on_incoming_probe(&self, probe_id: u32, size: u16) {
        let mut state = self.inner.lock().unwrap();
        state.handle_incoming_probe(probe_id, size, &*self.adapter);
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// Feeds periodic loss/RTT statistics to the adaptive controller.
    pub fn adapt(&self, loss_rate: f32, rtt_ms: u32) {
        let now = self.clock.now();
        let mut state = self.inner.lock().unwrap();
        state.adapt(loss_rate, rtt_ms, now, &self.config, &*self.adapter);
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// Classifies every probe older than `probe_timeout` as failed. The
    /// enclosing connection calls this from its periodic tick; the manager
    /// itself runs no timers.
    pub fn process_timeouts(&self) {
        let now = self.clock.now();
        let mut state = self.inner.lock().unwrap();
        state.process_timeouts(now, &self.config, &*self.adapter);
        debug_assert!(state.outgoing.invariants_hold() && state.incoming.invariants_hold());
    }

    /// The currently active MTU for a direction.
    pub fn current_mtu(&self, direction: MtuDirection) -> u16 {
        self.inner.lock().unwrap().path(direction).current_mtu
    }

    /// The coarse lifecycle status of a direction.
    pub fn status(&self, direction: MtuDirection) -> MtuStatus {
        self.inner.lock().unwrap().path(direction).status
    }

    /// Number of probes currently awaiting a response for a direction.
    pub fn probes_in_flight(&self, direction: MtuDirection) -> usize {
        self.inner.lock().unwrap().registry(direction).len()
    }

    /// Whether the structural invariants hold for both directions. Exposed
    /// for property tests; always true absent a state machine bug.
    pub fn invariants_hold(&self) -> bool {
        let state = self.inner.lock().unwrap();
        state.outgoing.invariants_hold() && state.incoming.invariants_hold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_toml() {
        let cfg_str = r#"
            [mtu]
            min_mtu = 1280
            max_mtu = 1452
            step_size = 16
            probe_timeout = 500
            blackhole_threshold = 5
            adaptive_check_interval = 2000
            bidirectional_enabled = false
            high_loss_threshold = 0.08
            low_loss_threshold = 0.02
            good_rtt_threshold_ms = 80
        "#;
        let cfg = MtuConfig::from_toml(cfg_str).unwrap();
        assert_eq!(cfg.min_mtu, 1280);
        assert_eq!(cfg.max_mtu, 1452);
        assert_eq!(cfg.step_size, 16);
        assert_eq!(cfg.probe_timeout, Duration::from_millis(500));
        assert_eq!(cfg.blackhole_threshold, 5);
        assert_eq!(cfg.adaptive_check_interval, Duration::from_millis(2000));
        assert!(!cfg.bidirectional_enabled);
        assert!((cfg.high_loss_threshold - 0.08).abs() < 1e-6);
        assert!((cfg.low_loss_threshold - 0.02).abs() < 1e-6);
        assert_eq!(cfg.good_rtt_threshold_ms, 80);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_section_yields_defaults() {
        let cfg = MtuConfig::from_toml("").unwrap();
        assert_eq!(cfg.min_mtu, 1200);
        assert_eq!(cfg.max_mtu, 1500);
        assert_eq!(cfg.step_size, 32);
        assert!(cfg.bidirectional_enabled);
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let cfg = MtuConfig {
            min_mtu: 1500,
            max_mtu: 1200,
            ..MtuConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MtuRange { min: 1500, max: 1200 })
        ));
    }

    #[test]
    fn validate_rejects_zero_step() {
        let cfg = MtuConfig {
            step_size: 0,
            ..MtuConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroStep)));
    }

    #[test]
    fn validate_rejects_inverted_loss_thresholds() {
        let cfg = MtuConfig {
            high_loss_threshold: 0.01,
            low_loss_threshold: 0.05,
            ..MtuConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LossThresholds { .. })
        ));
    }

    #[test]
    fn degenerate_range_is_legal() {
        let cfg = MtuConfig {
            min_mtu: 1200,
            max_mtu: 1200,
            ..MtuConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
