//! Silo identity and lifecycle status.
//!
//! A [`SiloAddress`] is the pair (endpoint, generation). The generation
//! tells apart successive processes bound to the same endpoint, so every
//! comparison and hash in this crate is over the full pair, never over the
//! endpoint alone.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::MembershipError;

/// Start of the generation clock (2020-01-01T00:00:00Z), in unix seconds.
const GENERATION_EPOCH_SECS: u64 = 1_577_836_800;

/// Byte layout hashed for ring positions: 16 bytes of IP (v4 zero-padded),
/// port, generation, and for uniform codes a trailing bucket index.
const HASH_LAYOUT_LEN: usize = 24;

/// One process instance participating in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    endpoint: SocketAddr,
    generation: i32,
}

impl SiloAddress {
    /// Creates an address with an explicit generation.
    pub fn new(endpoint: SocketAddr, generation: i32) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// Creates an address for a freshly started process, deriving the
    /// generation from the wall clock.
    pub fn new_local(endpoint: SocketAddr) -> Self {
        Self::new(endpoint, Self::allocate_generation())
    }

    /// Seconds since the generation epoch. Monotonic across restarts of the
    /// same endpoint as long as restarts are at least a second apart.
    pub fn allocate_generation() -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        now.saturating_sub(GENERATION_EPOCH_SECS).min(i32::MAX as u64) as i32
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    /// True if both addresses are bound to the same endpoint, whatever
    /// their generation.
    pub fn is_same_endpoint(&self, other: &SiloAddress) -> bool {
        self.endpoint == other.endpoint
    }

    /// Stable 32-bit position of this silo on the hash ring.
    pub fn consistent_hash(&self) -> u32 {
        avalanche(crc32fast::hash(&self.hash_layout()))
    }

    /// `count` independent ring positions for virtual buckets.
    ///
    /// Each code hashes the base layout followed by the bucket index, so the
    /// positions are stable across processes and restarts of the observer.
    pub fn uniform_hash_codes(&self, count: usize) -> Vec<u32> {
        let base = self.hash_layout();
        (0..count)
            .map(|i| {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&base);
                hasher.update(&(i as u32).to_le_bytes());
                avalanche(hasher.finalize())
            })
            .collect()
    }

    fn hash_layout(&self) -> [u8; HASH_LAYOUT_LEN] {
        let mut buf = [0u8; HASH_LAYOUT_LEN];
        match self.endpoint.ip() {
            IpAddr::V4(v4) => buf[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => buf[..16].copy_from_slice(&v6.octets()),
        }
        buf[16..20].copy_from_slice(&(self.endpoint.port() as u32).to_le_bytes());
        buf[20..24].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    /// Renders the `ip:port@generation` form accepted by [`FromStr`].
    pub fn to_parsable_string(&self) -> String {
        format!("{}@{}", self.endpoint, self.generation)
    }
}

/// Murmur3 finalizer. CRC-32 is linear, so codes that differ only in the
/// bucket index would otherwise sit at fixed XOR offsets from each other.
fn avalanche(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

impl Ord for SiloAddress {
    /// Orders by generation, then port, then IP.
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.endpoint.port().cmp(&other.endpoint.port()))
            .then_with(|| self.endpoint.ip().cmp(&other.endpoint.ip()))
    }
}

impl PartialOrd for SiloAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}:{}", self.endpoint, self.generation)
    }
}

impl FromStr for SiloAddress {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, generation) = s
            .rsplit_once('@')
            .ok_or_else(|| MembershipError::parse(format!("missing generation in '{s}'")))?;
        let endpoint: SocketAddr = endpoint
            .parse()
            .map_err(|e| MembershipError::parse(format!("bad endpoint in '{s}': {e}")))?;
        let generation: i32 = generation
            .parse()
            .map_err(|e| MembershipError::parse(format!("bad generation in '{s}': {e}")))?;
        Ok(Self::new(endpoint, generation))
    }
}

/// Lifecycle status of a silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    Created,
    Joining,
    Active,
    ShuttingDown,
    Stopping,
    Dead,
}

impl SiloStatus {
    /// ShuttingDown, Stopping or Dead.
    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            SiloStatus::ShuttingDown | SiloStatus::Stopping | SiloStatus::Dead
        )
    }

    /// Statuses in which a silo still takes part in the membership protocol:
    /// it probes, gossips and reads table updates.
    pub fn is_functional(self) -> bool {
        matches!(
            self,
            SiloStatus::Active | SiloStatus::ShuttingDown | SiloStatus::Stopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SiloStatus::Created => "Created",
            SiloStatus::Joining => "Joining",
            SiloStatus::Active => "Active",
            SiloStatus::ShuttingDown => "ShuttingDown",
            SiloStatus::Stopping => "Stopping",
            SiloStatus::Dead => "Dead",
        }
    }

    /// Wire code used by the liveness message codec.
    pub fn code(self) -> u8 {
        match self {
            SiloStatus::Created => 1,
            SiloStatus::Joining => 2,
            SiloStatus::Active => 3,
            SiloStatus::ShuttingDown => 4,
            SiloStatus::Stopping => 5,
            SiloStatus::Dead => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SiloStatus::Created),
            2 => Some(SiloStatus::Joining),
            3 => Some(SiloStatus::Active),
            4 => Some(SiloStatus::ShuttingDown),
            5 => Some(SiloStatus::Stopping),
            6 => Some(SiloStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiloStatus {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(SiloStatus::Created),
            "Joining" => Ok(SiloStatus::Joining),
            "Active" => Ok(SiloStatus::Active),
            "ShuttingDown" => Ok(SiloStatus::ShuttingDown),
            "Stopping" => Ok(SiloStatus::Stopping),
            "Dead" => Ok(SiloStatus::Dead),
            other => Err(MembershipError::parse(format!("unknown silo status '{other}'"))),
        }
    }
}
