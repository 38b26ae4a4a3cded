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

//! Discovery engine for the path MTU manager.
//!
//! Implements the binary-search convergence per direction, the adaptive
//! controller that reacts to loss/RTT feedback outside of active searches,
//! the probe response handler, and blackhole detection. All functions here
//! run under the manager's mutex; outbound adapter calls are contractually
//! non-blocking and must not re-enter the manager.

use std::time::Instant;

use log::{debug, info, warn};

use crate::telemetry;

use super::path::{MtuDirection, MtuStatus, PathState, ProbeRegistry};
use super::{ConnectionAdapter, MtuConfig};

/// The complete mutable state of a path MTU manager: one `PathState` and one
/// probe registry per direction, plus the adaptive controller's gate.
pub(super) struct ManagerState {
    pub(super) outgoing: PathState,
    pub(super) incoming: PathState,
    outgoing_probes: ProbeRegistry,
    incoming_probes: ProbeRegistry,
    last_adaptive_check: Option<Instant>,
}

impl ManagerState {
    pub(super) fn new(config: &MtuConfig) -> Self {
        Self {
            outgoing: PathState::new(config),
            incoming: PathState::new(config),
            outgoing_probes: ProbeRegistry::new(),
            incoming_probes: ProbeRegistry::new(),
            last_adaptive_check: None,
        }
    }

    pub(super) fn path(&self, direction: MtuDirection) -> &PathState {
        match direction {
            MtuDirection::Outgoing => &self.outgoing,
            MtuDirection::Incoming => &self.incoming,
        }
    }

    fn path_mut(&mut self, direction: MtuDirection) -> &mut PathState {
        match direction {
            MtuDirection::Outgoing => &mut self.outgoing,
            MtuDirection::Incoming => &mut self.incoming,
        }
    }

    pub(super) fn registry(&self, direction: MtuDirection) -> &ProbeRegistry {
        match direction {
            MtuDirection::Outgoing => &self.outgoing_probes,
            MtuDirection::Incoming => &self.incoming_probes,
        }
    }

    fn registry_mut(&mut self, direction: MtuDirection) -> &mut ProbeRegistry {
        match direction {
            MtuDirection::Outgoing => &mut self.outgoing_probes,
            MtuDirection::Incoming => &mut self.incoming_probes,
        }
    }

    /// Begins binary-search discovery for one direction. A direction already
    /// in its search phase is left alone.
    pub(super) fn start_discovery(
        &mut self,
        direction: MtuDirection,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        let path = self.path_mut(direction);
        if path.in_search_phase {
            warn!("{} MTU discovery already running", direction);
            return;
        }

        path.status = MtuStatus::Searching;
        path.in_search_phase = true;
        path.mtu_validated = false;
        path.consecutive_failures = 0;
        telemetry!(telemetry::MTU_SEARCHES.inc());
        info!(
            "Starting {} MTU discovery from {} (ceiling {})",
            direction, path.current_mtu, path.max_mtu
        );

        if path.current_mtu >= path.max_mtu {
            // Degenerate range, nothing above the active MTU to probe.
            self.finalize_search(direction, now, config, adapter);
            return;
        }

        let first = path.current_mtu.saturating_add(path.step_size).min(path.max_mtu);
        self.emit_probe(direction, first, now, adapter);
    }

    /// Aborts any active search and forgets all in-flight probes. No
    /// callbacks fire after this returns.
    pub(super) fn shutdown(&mut self) {
        for direction in [MtuDirection::Outgoing, MtuDirection::Incoming] {
            let path = self.path_mut(direction);
            path.in_search_phase = false;
            path.current_probe_mtu = None;
            if path.status == MtuStatus::Searching {
                path.status = MtuStatus::Initial;
            }
        }
        self.outgoing_probes.drain();
        self.incoming_probes.drain();
    }

    /// Re-runs discovery for one direction, typically after the transport
    /// validated a new path following a blackhole.
    pub(super) fn restart(
        &mut self,
        direction: MtuDirection,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        if self.path(direction).in_search_phase {
            warn!("Ignoring restart: {} discovery still active", direction);
            return;
        }
        self.registry_mut(direction).drain();
        let path = self.path_mut(direction);
        path.consecutive_failures = 0;
        path.current_probe_mtu = None;
        info!("Restarting {} MTU discovery", direction);
        self.start_discovery(direction, now, config, adapter);
    }

    /// Applies a probe response delivered by the transport. Unknown ids are
    /// stale or duplicate deliveries and are discarded.
    pub(super) fn handle_probe_response(
        &mut self,
        probe_id: u32,
        success: bool,
        direction: MtuDirection,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        let record = match self.registry_mut(direction).take(probe_id) {
            Some(record) => record,
            None => {
                warn!(
                    "Received response for unknown {} probe id {}",
                    direction, probe_id
                );
                return;
            }
        };

        debug!(
            "Received {} response for {} MTU probe {} (size {})",
            if success { "successful" } else { "failed" },
            direction,
            probe_id,
            record.size
        );

        if success {
            self.handle_probe_success(direction, record.size, now, config, adapter);
        } else {
            self.handle_probe_failure(direction, record.size, now, config, adapter);
        }
    }

    /// Sweeps both registries for probes whose timeout elapsed and routes
    /// each through the failure path.
    pub(super) fn process_timeouts(
        &mut self,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        for direction in [MtuDirection::Outgoing, MtuDirection::Incoming] {
            let expired = self
                .registry_mut(direction)
                .take_expired(config.probe_timeout, now);
            for (probe_id, record) in expired {
                debug!(
                    "{} MTU probe {} (size {}) timed out",
                    direction, probe_id, record.size
                );
                self.handle_probe_failure(direction, record.size, now, config, adapter);
            }
        }
    }

    fn handle_probe_success(
        &mut self,
        direction: MtuDirection,
        size: u16,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        let path = self.path_mut(direction);
        if size > path.last_successful_mtu {
            path.last_successful_mtu = size;
        }
        path.consecutive_failures = 0;

        if size > path.current_mtu {
            self.commit_mtu(direction, size, adapter);
        }

        let path = self.path_mut(direction);
        if !path.in_search_phase {
            // Completion of an adaptive exploration: the commit above is all
            // there is to do. A degraded path that carries a larger probe
            // again counts as recovered.
            path.current_probe_mtu = None;
            if path.status == MtuStatus::Degraded {
                path.status = MtuStatus::Validated;
            }
            debug!("Adaptive {} probe of {} bytes confirmed", direction, size);
            return;
        }

        if size < path.max_mtu {
            let next = size.saturating_add(path.step_size).min(path.max_mtu);
            debug!("Planning next {} probe with size {}", direction, next);
            self.emit_probe(direction, next, now, adapter);
        } else {
            info!("Reached maximum {} MTU: {}", direction, size);
            self.finalize_search(direction, now, config, adapter);
        }
    }

    fn handle_probe_failure(
        &mut self,
        direction: MtuDirection,
        size: u16,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        telemetry!(telemetry::MTU_PROBE_FAILURES.inc());

        let (blackhole, last_good, step) = {
            let path = self.path_mut(direction);
            if !path.in_search_phase {
                // A failed adaptive exploration leaves the validated MTU
                // alone and never escalates to bisection or blackhole
                // accounting.
                path.current_probe_mtu = None;
                debug!(
                    "Adaptive {} probe of {} bytes failed, keeping MTU {}",
                    direction, size, path.current_mtu
                );
                return;
            }

            path.consecutive_failures += 1;

            let blackhole = path.consecutive_failures >= config.blackhole_threshold
                && path
                    .current_probe_mtu
                    .map_or(false, |p| p > path.last_successful_mtu);
            (blackhole, path.last_successful_mtu, path.step_size)
        };

        if blackhole {
            self.declare_blackhole(direction, size, adapter);
            return;
        }

        let range = size.saturating_sub(last_good);
        if range < step {
            info!(
                "No viable {} MTU between {} and {}, using last successful: {}",
                direction, last_good, size, last_good
            );
            self.finalize_search(direction, now, config, adapter);
        } else {
            // Bisect the gap; integer division rounds toward the known-good
            // end.
            let next = last_good + range / 2;
            debug!("Trying intermediate {} probe size: {}", direction, next);
            self.emit_probe(direction, next, now, adapter);
        }
    }

    /// Marks a direction validated at its last successful size and, when the
    /// Outgoing side just converged, hands off to Incoming discovery.
    fn finalize_search(
        &mut self,
        direction: MtuDirection,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        let path = self.path_mut(direction);
        path.status = MtuStatus::Validated;
        path.mtu_validated = true;
        path.in_search_phase = false;
        path.current_probe_mtu = None;
        let target = path.last_successful_mtu;
        if path.current_mtu != target {
            self.commit_mtu(direction, target, adapter);
        }

        info!(
            "{} MTU validated at {}",
            direction,
            self.path(direction).current_mtu
        );

        if direction == MtuDirection::Outgoing
            && config.bidirectional_enabled
            && !self.incoming.in_search_phase
        {
            info!("Starting incoming path MTU discovery");
            self.start_discovery(MtuDirection::Incoming, now, config, adapter);
        }
    }

    fn declare_blackhole(
        &mut self,
        direction: MtuDirection,
        failed_size: u16,
        adapter: &dyn ConnectionAdapter,
    ) {
        let path = self.path_mut(direction);
        path.status = MtuStatus::Blackhole;
        path.in_search_phase = false;
        path.current_probe_mtu = None;
        let revert_to = path.last_successful_mtu;
        warn!(
            "MTU blackhole detected for {} path at {} bytes, reverting to last successful: {}",
            direction, failed_size, revert_to
        );
        telemetry!(telemetry::MTU_BLACKHOLES.inc());

        if path.current_mtu != revert_to {
            self.commit_mtu(direction, revert_to, adapter);
        }
    }

    /// Periodic loss/RTT feedback. Quiescent during active discovery and
    /// rate-limited by the adaptive check interval.
    pub(super) fn adapt(
        &mut self,
        loss_rate: f32,
        rtt_ms: u32,
        now: Instant,
        config: &MtuConfig,
        adapter: &dyn ConnectionAdapter,
    ) {
        if let Some(last) = self.last_adaptive_check {
            if now.duration_since(last) < config.adaptive_check_interval {
                return;
            }
        }
        self.last_adaptive_check = Some(now);

        if !self.outgoing.mtu_validated || self.outgoing.in_search_phase {
            return;
        }

        if loss_rate > config.high_loss_threshold {
            if self.outgoing.current_mtu > self.outgoing.min_mtu {
                let floor = self.outgoing.min_mtu;
                let new_mtu = self
                    .outgoing
                    .current_mtu
                    .saturating_sub(self.outgoing.step_size)
                    .max(floor);
                info!(
                    "High packet loss rate ({:.1}%), decreasing MTU from {} to {}",
                    loss_rate * 100.0,
                    self.outgoing.current_mtu,
                    new_mtu
                );
                // A decrease is a safety action: it takes effect without a
                // confirming probe. The success watermark follows it down so
                // a later search starts from a size the path still carries.
                self.outgoing.last_successful_mtu =
                    self.outgoing.last_successful_mtu.min(new_mtu);
                self.commit_mtu(MtuDirection::Outgoing, new_mtu, adapter);
                if new_mtu == floor {
                    self.outgoing.status = MtuStatus::Degraded;
                }
            }
        } else if loss_rate < config.low_loss_threshold && rtt_ms < config.good_rtt_threshold_ms {
            if self.outgoing.current_mtu < self.outgoing.max_mtu && self.outgoing_probes.is_empty()
            {
                let probe = self
                    .outgoing
                    .current_mtu
                    .saturating_add(self.outgoing.step_size)
                    .min(self.outgoing.max_mtu);
                info!(
                    "Good network conditions, probing larger MTU {}",
                    probe
                );
                // Exploratory: a single probe, committed by the response
                // handler on success. The search phase is not entered.
                self.emit_probe(MtuDirection::Outgoing, probe, now, adapter);
            }
        }
    }

    /// Answers a probe the peer sent toward us. Idempotent under duplicate
    /// deliveries of the same `(probe_id, size)`.
    pub(super) fn handle_incoming_probe(
        &mut self,
        probe_id: u32,
        size: u16,
        adapter: &dyn ConnectionAdapter,
    ) {
        debug!("Received incoming MTU probe {} with size {}", probe_id, size);

        let success = size <= self.incoming.max_mtu;
        if success && size > self.incoming.current_mtu {
            info!(
                "Updating incoming MTU from {} to {}",
                self.incoming.current_mtu, size
            );
            self.commit_mtu(MtuDirection::Incoming, size, adapter);
        }

        adapter.send_probe_response(probe_id, success);
    }

    /// Hands a probe to the adapter and records it as in flight.
    fn emit_probe(
        &mut self,
        direction: MtuDirection,
        size: u16,
        now: Instant,
        adapter: &dyn ConnectionAdapter,
    ) {
        let probe_id = adapter.send_probe(size, direction);
        let path = self.path_mut(direction);
        path.current_probe_mtu = Some(size);
        self.registry_mut(direction).register(probe_id, size, now);
        telemetry!(telemetry::MTU_PROBES_SENT.inc());
    }

    /// Commits a new active MTU for a direction. Outgoing commits are
    /// published to the enclosing connection; both update the gauges.
    fn commit_mtu(&mut self, direction: MtuDirection, size: u16, adapter: &dyn ConnectionAdapter) {
        let path = self.path_mut(direction);
        path.current_mtu = size;
        match direction {
            MtuDirection::Outgoing => {
                adapter.set_mtu_size(size);
                telemetry!(telemetry::MTU_OUTGOING.set(size as i64));
            }
            MtuDirection::Incoming => {
                telemetry!(telemetry::MTU_INCOMING.set(size as i64));
            }
        }
    }
}
