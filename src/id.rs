//! Coordinator-free tracking and trace id generation.

use std::io;
use std::net::{IpAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static GLOBAL: Lazy<Arc<IdGenerator>> = Lazy::new(|| Arc::new(IdGenerator::new()));

/// Generates process-unique, sortable correlation ids.
///
/// Every id combines a machine fingerprint (derived from the host's primary
/// IP address), a process fingerprint (derived from the pid and startup
/// time), the current unix time in milliseconds and a per-kind counter.
/// Collisions across restarts within the same millisecond and counter value
/// are possible; the ids are meant for log correlation, not as keys.
///
/// # Example
///
/// ```rust
/// use sea_orm_marking::IdGenerator;
///
/// let generator = IdGenerator::with_fingerprints("0A1B", "002");
/// let tracking = generator.generate_tracking_id();
/// assert!(tracking.starts_with("0A1B-002-"));
/// assert!(tracking.ends_with("-1"));
/// ```
#[derive(Debug)]
pub struct IdGenerator {
    machine_id: String,
    process_id: String,
    tracking_counter: AtomicU64,
    trace_counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator, deriving both fingerprints from the host.
    pub fn new() -> Self {
        let startup_millis = unix_millis();
        let machine_id = machine_fingerprint(startup_millis);
        let process_id = process_fingerprint(std::process::id(), startup_millis);

        tracing::info!(
            machine_id = %machine_id,
            process_id = %process_id,
            "SQL marking id generator initialised"
        );

        Self::with_fingerprints(machine_id, process_id)
    }

    /// Create a generator with fixed fingerprints.
    pub fn with_fingerprints(machine_id: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            process_id: process_id.into(),
            tracking_counter: AtomicU64::new(0),
            trace_counter: AtomicU64::new(0),
        }
    }

    /// The process-wide shared generator, created on first use.
    pub fn global() -> Arc<IdGenerator> {
        Arc::clone(&GLOBAL)
    }

    /// Format: `{machine}-{process}-{unixMillis}-{counter}`.
    pub fn generate_tracking_id(&self) -> String {
        let counter = next(&self.tracking_counter);
        format!(
            "{}-{}-{}-{}",
            self.machine_id,
            self.process_id,
            unix_millis(),
            counter
        )
    }

    /// Format: `{machine}{process}{unixMillis}{counter mod 10^6, 6 digits}`.
    pub fn generate_trace_id(&self) -> String {
        let counter = next(&self.trace_counter);
        format!(
            "{}{}{}{:06}",
            self.machine_id,
            self.process_id,
            unix_millis(),
            counter % 1_000_000
        )
    }

    /// Format: `{machine}-{counter}`. Shares the tracking counter.
    pub fn generate_short_tracking_id(&self) -> String {
        let counter = next(&self.tracking_counter);
        format!("{}-{}", self.machine_id, counter)
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// One-line summary of fingerprints and counter values.
    pub fn statistics(&self) -> String {
        format!(
            "IdGenerator[machine_id={}, process_id={}, tracking_count={}, trace_count={}]",
            self.machine_id,
            self.process_id,
            self.tracking_counter.load(Ordering::Relaxed),
            self.trace_counter.load(Ordering::Relaxed)
        )
    }

    /// Reset both counters to zero. Intended for tests.
    pub fn reset_counters(&self) {
        self.tracking_counter.store(0, Ordering::Relaxed);
        self.trace_counter.store(0, Ordering::Relaxed);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Increment and return the new value; wraps at `u64::MAX`.
fn next(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Low 16 bits of the primary IP as 4 hex digits, or of the current time
/// when the address cannot be determined.
fn machine_fingerprint(now_millis: i64) -> String {
    match primary_ip() {
        Ok(ip) => format!("{:04X}", low_16_bits(&ip)),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Unable to determine host address, deriving machine id from clock"
            );
            format!("{:04X}", now_millis & 0xFFFF)
        }
    }
}

/// `(pid * 31 + startup) & 0xFFF` as 3 hex digits.
fn process_fingerprint(pid: u32, startup_millis: i64) -> String {
    let hash = (pid as u64)
        .wrapping_mul(31)
        .wrapping_add(startup_millis as u64)
        & 0xFFF;
    format!("{:03X}", hash)
}

/// Address of the interface that would route outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
fn primary_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect(("192.0.2.1", 9))?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no routable local address",
        ));
    }
    Ok(ip)
}

fn low_16_bits(ip: &IpAddr) -> u16 {
    let (hi, lo) = match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            (o[2], o[3])
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            (o[14], o[15])
        }
    };
    u16::from_be_bytes([hi, lo])
}
