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

//! # XOR Shard FEC Module
//!
//! Groups outgoing packets into shard groups of `k` data shards followed by
//! one parity shard (the byte-wise XOR of the group). The receiver repairs a
//! single missing shard per group from the parity; two or more losses in a
//! group are unrecoverable and simply reported. A loss-rate EMA shrinks the
//! group under loss (more redundancy) and grows it back on clean paths.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use crate::telemetry;

/// Shard header: group(4) index(1) flags(1) count(1) len(2).
pub const SHARD_HEADER_LEN: usize = 9;
const FLAG_PARITY: u8 = 0x01;
/// Length prefix inside the parity-covered body.
const BODY_PREFIX_LEN: usize = 2;
/// Decoder keeps at most this many open groups before evicting the oldest.
const MAX_OPEN_GROUPS: usize = 64;

/// A single shard on the wire: either one source packet or the parity of a
/// group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub group: u32,
    pub index: u8,
    pub is_parity: bool,
    pub shard_count: u8,
    pub data: Vec<u8>,
}

impl Shard {
    /// Serializes the shard into its wire framing.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SHARD_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.group.to_be_bytes());
        out.push(self.index);
        out.push(if self.is_parity { FLAG_PARITY } else { 0 });
        out.push(self.shard_count);
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Deserializes a shard from a raw byte buffer.
    pub fn from_wire(raw: &[u8]) -> Result<Self, String> {
        if raw.len() < SHARD_HEADER_LEN {
            return Err("Shard frame too short".to_string());
        }
        let group = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        let index = raw[4];
        let is_parity = raw[5] & FLAG_PARITY != 0;
        let shard_count = raw[6];
        let len = u16::from_be_bytes(raw[7..9].try_into().unwrap()) as usize;
        if raw.len() < SHARD_HEADER_LEN + len {
            return Err("Shard payload truncated".to_string());
        }
        if shard_count == 0 {
            return Err("Shard group size of zero".to_string());
        }
        Ok(Shard {
            group,
            index,
            is_parity,
            shard_count,
            data: raw[SHARD_HEADER_LEN..SHARD_HEADER_LEN + len].to_vec(),
        })
    }
}

/// The parity-covered body of a source packet: a length prefix followed by
/// the payload, so a repaired shard can be truncated to its original size.
fn body_of(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(BODY_PREFIX_LEN + payload.len());
    body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    body.extend_from_slice(payload);
    body
}

fn xor_into(acc: &mut Vec<u8>, other: &[u8]) {
    if other.len() > acc.len() {
        acc.resize(other.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        *a ^= b;
    }
}

#[derive(Clone)]
pub struct FecConfig {
    pub enabled: bool,
    /// Data shards per group before a parity shard is emitted.
    pub data_shards: usize,
    pub min_data_shards: usize,
    pub max_data_shards: usize,
    /// Smoothing factor for the loss-rate EMA.
    pub lambda: f32,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_shards: 8,
            min_data_shards: 4,
            max_data_shards: 32,
            lambda: 0.1,
        }
    }
}

impl FecConfig {
    pub fn from_toml(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        #[derive(serde::Deserialize)]
        struct Root {
            fec: Option<Section>,
        }

        #[derive(serde::Deserialize)]
        struct Section {
            enabled: Option<bool>,
            data_shards: Option<usize>,
            min_data_shards: Option<usize>,
            max_data_shards: Option<usize>,
            lambda: Option<f32>,
        }

        let root: Root = toml::from_str(s)?;
        let mut cfg = FecConfig::default();
        if let Some(sec) = root.fec {
            if let Some(v) = sec.enabled {
                cfg.enabled = v;
            }
            if let Some(v) = sec.data_shards {
                cfg.data_shards = v;
            }
            if let Some(v) = sec.min_data_shards {
                cfg.min_data_shards = v;
            }
            if let Some(v) = sec.max_data_shards {
                cfg.max_data_shards = v;
            }
            if let Some(v) = sec.lambda {
                cfg.lambda = v;
            }
        }
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_data_shards == 0 {
            return Err("min_data_shards must be non-zero".into());
        }
        if self.min_data_shards > self.max_data_shards {
            return Err("min_data_shards exceeds max_data_shards".into());
        }
        if self.data_shards < self.min_data_shards || self.data_shards > self.max_data_shards {
            return Err("data_shards outside [min_data_shards, max_data_shards]".into());
        }
        if self.max_data_shards > u8::MAX as usize {
            return Err("max_data_shards exceeds the shard index space".into());
        }
        if !(0.0..=1.0).contains(&self.lambda) || self.lambda == 0.0 {
            return Err("lambda must lie in (0, 1]".into());
        }
        Ok(())
    }
}

/// Sender side: accumulates the running XOR of the open group.
struct XorEncoder {
    group: u32,
    shard_count: usize,
    in_group: usize,
    parity: Vec<u8>,
}

impl XorEncoder {
    fn new(shard_count: usize) -> Self {
        Self {
            group: 0,
            shard_count,
            in_group: 0,
            parity: Vec::new(),
        }
    }

    /// Wraps one source payload as a shard and, when it closes the group,
    /// appends the parity shard. `next_shard_count` takes effect at the
    /// group boundary.
    fn on_send(
        &mut self,
        payload: &[u8],
        next_shard_count: usize,
        outgoing: &mut VecDeque<Shard>,
    ) {
        xor_into(&mut self.parity, &body_of(payload));
        let shard = Shard {
            group: self.group,
            index: self.in_group as u8,
            is_parity: false,
            shard_count: self.shard_count as u8,
            data: payload.to_vec(),
        };
        self.in_group += 1;
        outgoing.push_back(shard);

        if self.in_group == self.shard_count {
            outgoing.push_back(Shard {
                group: self.group,
                index: self.shard_count as u8,
                is_parity: true,
                shard_count: self.shard_count as u8,
                data: std::mem::take(&mut self.parity),
            });
            telemetry!(telemetry::FEC_PARITY_SENT.inc());
            self.group = self.group.wrapping_add(1);
            self.in_group = 0;
            self.shard_count = next_shard_count;
        }
    }
}

struct GroupBuffer {
    shard_count: usize,
    data: Vec<Option<Vec<u8>>>,
    parity: Option<Vec<u8>>,
    repaired: bool,
}

impl GroupBuffer {
    fn new(shard_count: usize) -> Self {
        Self {
            shard_count,
            data: vec![None; shard_count],
            parity: None,
            repaired: false,
        }
    }

    fn received(&self) -> usize {
        self.data.iter().filter(|s| s.is_some()).count()
    }

    fn complete(&self) -> bool {
        self.received() == self.shard_count
    }

    /// Repairs the single missing shard from the parity, if possible.
    fn try_repair(&mut self) -> Option<Vec<u8>> {
        if self.repaired || self.parity.is_none() {
            return None;
        }
        let missing: Vec<usize> = (0..self.shard_count)
            .filter(|&i| self.data[i].is_none())
            .collect();
        if missing.len() != 1 {
            return None;
        }
        let mut body = self.parity.clone().unwrap();
        for shard in self.data.iter().flatten() {
            xor_into(&mut body, &body_of(shard));
        }
        if body.len() < BODY_PREFIX_LEN {
            warn!("Parity body shorter than its length prefix");
            return None;
        }
        let len = u16::from_be_bytes(body[0..2].try_into().unwrap()) as usize;
        if body.len() < BODY_PREFIX_LEN + len {
            warn!("Repaired shard length {} exceeds parity body", len);
            return None;
        }
        let payload = body[BODY_PREFIX_LEN..BODY_PREFIX_LEN + len].to_vec();
        self.data[missing[0]] = Some(payload.clone());
        self.repaired = true;
        Some(payload)
    }
}

/// Receiver side: buffers open groups and repairs single losses.
struct XorDecoder {
    groups: HashMap<u32, GroupBuffer>,
    order: VecDeque<u32>,
}

impl XorDecoder {
    fn new() -> Self {
        Self {
            groups: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Ingests one shard. Source payloads are delivered immediately; a
    /// repaired payload follows as soon as the parity closes the gap.
    fn on_receive(&mut self, shard: Shard) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        let group_id = shard.group;
        let shard_count = shard.shard_count as usize;

        if !self.groups.contains_key(&group_id) {
            self.groups.insert(group_id, GroupBuffer::new(shard_count));
            self.order.push_back(group_id);
            if self.order.len() > MAX_OPEN_GROUPS {
                if let Some(evicted) = self.order.pop_front() {
                    self.groups.remove(&evicted);
                }
            }
        }
        let buffer = self.groups.get_mut(&group_id).unwrap();
        if buffer.shard_count != shard_count {
            warn!(
                "Shard group {} announced inconsistent size {} (have {})",
                group_id, shard_count, buffer.shard_count
            );
            return delivered;
        }

        if shard.is_parity {
            buffer.parity = Some(shard.data);
        } else {
            let index = shard.index as usize;
            if index >= buffer.shard_count {
                warn!("Shard index {} outside group of {}", index, buffer.shard_count);
                return delivered;
            }
            if buffer.data[index].is_none() {
                buffer.data[index] = Some(shard.data.clone());
                delivered.push(shard.data);
            }
        }

        if let Some(repaired) = buffer.try_repair() {
            debug!("Repaired one shard of group {} from parity", group_id);
            telemetry!(telemetry::FEC_GROUPS_RECOVERED.inc());
            delivered.push(repaired);
        }

        if buffer.complete() {
            self.groups.remove(&group_id);
            self.order.retain(|g| *g != group_id);
        }

        delivered
    }
}

/// The FEC engine held by a connection: encoder, decoder, and the loss-rate
/// feedback that sizes the groups.
pub struct XorFec {
    config: FecConfig,
    encoder: XorEncoder,
    decoder: XorDecoder,
    ema_loss_rate: f32,
    target_shards: usize,
}

impl XorFec {
    pub fn new(config: FecConfig) -> Self {
        let shards = config.data_shards;
        Self {
            encoder: XorEncoder::new(shards),
            decoder: XorDecoder::new(),
            ema_loss_rate: 0.0,
            target_shards: shards,
            config,
        }
    }

    /// Processes an outgoing payload, pushing the resulting shard (and a
    /// parity shard at group boundaries) into the outgoing queue.
    pub fn on_send(&mut self, payload: &[u8], outgoing: &mut VecDeque<Shard>) {
        if !self.config.enabled {
            outgoing.push_back(Shard {
                group: 0,
                index: 0,
                is_parity: false,
                shard_count: 1,
                data: payload.to_vec(),
            });
            return;
        }
        self.encoder.on_send(payload, self.target_shards, outgoing);
    }

    /// Processes an incoming shard and returns every payload that became
    /// available, repaired ones included.
    pub fn on_receive(&mut self, shard: Shard) -> Vec<Vec<u8>> {
        if !self.config.enabled && !shard.is_parity {
            return vec![shard.data];
        }
        self.decoder.on_receive(shard)
    }

    /// Reports packet loss statistics. The group size shrinks under loss and
    /// recovers on clean paths, applied at the next group boundary.
    pub fn report_loss(&mut self, lost: usize, total: usize) {
        if total == 0 {
            return;
        }
        let current = lost as f32 / total as f32;
        self.ema_loss_rate =
            self.config.lambda * current + (1.0 - self.config.lambda) * self.ema_loss_rate;
        telemetry!(telemetry::LOSS_RATE.set((self.ema_loss_rate * 100.0) as i64));

        let previous = self.target_shards;
        if self.ema_loss_rate > 0.05 {
            self.target_shards = (self.target_shards / 2).max(self.config.min_data_shards);
        } else if self.ema_loss_rate < 0.01 {
            self.target_shards = (self.target_shards + 1).min(self.config.max_data_shards);
        }
        if self.target_shards != previous {
            debug!(
                "FEC group size {} -> {} (loss {:.2}%)",
                previous,
                self.target_shards,
                self.ema_loss_rate * 100.0
            );
        }
    }

    pub fn current_group_size(&self) -> usize {
        self.target_shards
    }
}
