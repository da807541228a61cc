//! Membership and ring configuration.
//!
//! Every field has a default, so a TOML section only needs the options it
//! changes. Durations use humantime notation (`"10s"`, `"5m"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MembershipError, Result};

/// Tuning knobs of the membership protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Expected number of silos. Scales the join jitter and the retry
    /// backoff ceiling.
    pub expected_cluster_size: usize,
    /// Upper bound on the total time spent retrying a table write.
    #[serde(with = "humantime_serde")]
    pub max_join_attempt_time: Duration,
    /// Period of the full table re-read.
    #[serde(with = "humantime_serde")]
    pub table_refresh_timeout: Duration,
    /// Period of the probe round.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// How many ring successors each silo monitors.
    pub num_probed_silos: usize,
    /// Consecutive missed probes before voting against a silo.
    pub num_missed_probes_limit: u32,
    /// Fresh votes needed to declare a silo dead.
    pub num_votes_for_death_declaration: usize,
    /// Age after which a suspicion vote no longer counts.
    #[serde(with = "humantime_serde")]
    pub death_vote_expiration_timeout: Duration,
    /// Period of the IAmAlive heartbeat written to the table.
    #[serde(with = "humantime_serde")]
    pub i_am_alive_table_publish_timeout: Duration,
    /// Heartbeat periods a silo may miss before it is reported as stale.
    pub num_missed_table_i_am_alive_limit: u32,
    /// Ping every Active silo before announcing Active.
    pub validate_initial_connectivity: bool,
    /// Push status changes to peers instead of waiting for their refresh.
    pub use_liveness_gossip: bool,
    /// Timeout of a single ping.
    #[serde(with = "humantime_serde")]
    pub probe_response_timeout: Duration,
    /// Cap on the random delay before a silo first touches the table.
    #[serde(with = "humantime_serde")]
    pub max_startup_delay: Duration,
    /// Minimum backoff after a failed table call.
    #[serde(with = "humantime_serde")]
    pub connection_retry_delay: Duration,
    /// Dead rows silent for longer than this are
    /// deleted when a silo starts. Zero disables the cleanup.
    #[serde(with = "humantime_serde")]
    pub defunct_silo_expiration: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            expected_cluster_size: 20,
            max_join_attempt_time: Duration::from_secs(5 * 60),
            table_refresh_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            num_probed_silos: 3,
            num_missed_probes_limit: 3,
            num_votes_for_death_declaration: 2,
            death_vote_expiration_timeout: Duration::from_secs(120),
            i_am_alive_table_publish_timeout: Duration::from_secs(5 * 60),
            num_missed_table_i_am_alive_limit: 2,
            validate_initial_connectivity: true,
            use_liveness_gossip: true,
            probe_response_timeout: Duration::from_secs(5),
            max_startup_delay: Duration::from_secs(60),
            connection_retry_delay: Duration::from_secs(1),
            defunct_silo_expiration: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl MembershipConfig {
    /// Rejects settings under which the protocol cannot make progress.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("num_votes_for_death_declaration", self.num_votes_for_death_declaration),
            ("num_probed_silos", self.num_probed_silos),
            ("num_missed_probes_limit", self.num_missed_probes_limit as usize),
            ("expected_cluster_size", self.expected_cluster_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(MembershipError::Configuration(format!("{name} must be > 0")));
            }
        }
        let timers = [
            ("table_refresh_timeout", self.table_refresh_timeout),
            ("probe_timeout", self.probe_timeout),
            ("i_am_alive_table_publish_timeout", self.i_am_alive_table_publish_timeout),
            ("probe_response_timeout", self.probe_response_timeout),
            ("death_vote_expiration_timeout", self.death_vote_expiration_timeout),
            ("max_join_attempt_time", self.max_join_attempt_time),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(MembershipError::Configuration(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }

    /// How long a silo may go without a heartbeat before others report it.
    pub fn allowed_i_am_alive_miss_period(&self) -> Duration {
        self.i_am_alive_table_publish_timeout * self.num_missed_table_i_am_alive_limit
    }
}

/// Ring provider selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Use the virtual-bucket ring instead of one point per silo.
    pub use_virtual_buckets: bool,
    /// Ring points per silo in the virtual-bucket ring.
    pub num_buckets_per_silo: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            use_virtual_buckets: true,
            num_buckets_per_silo: 30,
        }
    }
}
