//! Telemetry metrics used throughout QuicVeil.
//!
//! Currently exported metrics:
//! - `mtu_outgoing_bytes`: Active outgoing path MTU.
//! - `mtu_incoming_bytes`: Active incoming path MTU.
//! - `mtu_probes_sent_total`: MTU probes handed to the transport.
//! - `mtu_probe_failures_total`: Probes that were nacked or timed out.
//! - `mtu_blackholes_total`: Blackhole declarations.
//! - `mtu_searches_total`: Discovery rounds started (including restarts).
//! - `fec_groups_recovered_total`: Shard groups repaired from parity.
//! - `fec_parity_sent_total`: Parity shards emitted.
//! - `loss_rate_percent`: Current estimated loss rate multiplied by 100.
//! - `bytes_sent_total`: UDP bytes sent via the core.
//! - `bytes_received_total`: UDP bytes received via the core.
//! - `stealth_fronting`: Domain fronting enabled status.
//! - `stealth_xor`: XOR obfuscation enabled status.
//! - `memory_usage_bytes`: Resident memory usage of the process.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};

lazy_static! {
    pub static ref MTU_OUTGOING: IntGauge =
        register_int_gauge!("mtu_outgoing_bytes", "Active outgoing path MTU").unwrap();
    pub static ref MTU_INCOMING: IntGauge =
        register_int_gauge!("mtu_incoming_bytes", "Active incoming path MTU").unwrap();
    pub static ref MTU_PROBES_SENT: IntCounter =
        register_int_counter!("mtu_probes_sent_total", "MTU probes emitted").unwrap();
    pub static ref MTU_PROBE_FAILURES: IntCounter =
        register_int_counter!("mtu_probe_failures_total", "MTU probes nacked or timed out")
            .unwrap();
    pub static ref MTU_BLACKHOLES: IntCounter =
        register_int_counter!("mtu_blackholes_total", "MTU blackhole declarations").unwrap();
    pub static ref MTU_SEARCHES: IntCounter =
        register_int_counter!("mtu_searches_total", "MTU discovery rounds started").unwrap();
    pub static ref FEC_GROUPS_RECOVERED: IntCounter =
        register_int_counter!("fec_groups_recovered_total", "Shard groups repaired").unwrap();
    pub static ref FEC_PARITY_SENT: IntCounter =
        register_int_counter!("fec_parity_sent_total", "Parity shards emitted").unwrap();
    pub static ref LOSS_RATE: IntGauge =
        register_int_gauge!("loss_rate_percent", "Current loss rate * 100").unwrap();
    pub static ref BYTES_SENT: IntCounter =
        register_int_counter!("bytes_sent_total", "Total UDP bytes sent").unwrap();
    pub static ref BYTES_RECEIVED: IntCounter =
        register_int_counter!("bytes_received_total", "Total UDP bytes received").unwrap();
    pub static ref STEALTH_FRONTING: IntGauge =
        register_int_gauge!("stealth_fronting", "Domain fronting enabled status").unwrap();
    pub static ref STEALTH_XOR: IntGauge =
        register_int_gauge!("stealth_xor", "XOR obfuscation enabled status").unwrap();
    pub static ref MEMORY_USAGE_BYTES: IntGauge =
        register_int_gauge!("memory_usage_bytes", "Resident memory usage of the process").unwrap();
}

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Turns metric recording on or off. Disabled by default; the CLI enables it
/// with `--telemetry`.
pub fn set_enabled(on: bool) {
    ENABLED.store(on, Ordering::Relaxed);
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Records a metric update only when telemetry is enabled.
#[macro_export]
macro_rules! telemetry {
    ($e:expr) => {
        if $crate::telemetry::enabled() {
            $e;
        }
    };
}

pub fn update_memory_usage() {
    if let Ok(pid) = sysinfo::get_current_pid() {
        let mut sys = sysinfo::System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        if let Some(proc) = sys.process(pid) {
            MEMORY_USAGE_BYTES.set(proc.memory() as i64);
        }
    }
}

/// Serves the Prometheus text format on a blocking listener thread.
pub fn serve(addr: &str) {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = match TcpListener::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            log::error!("Failed to bind metrics listener on {}: {}", addr, e);
            return;
        }
    };
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming() {
            if let Ok(mut s) = stream {
                let metrics = prometheus::gather();
                let mut buf = Vec::new();
                if encoder.encode(&metrics, &mut buf).is_ok() {
                    let _ = s.write_all(&buf);
                }
            }
        }
    });
}

pub fn flush() {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metrics, &mut buf).is_ok() {
        log::info!("\n{}", String::from_utf8_lossy(&buf));
    }
}
