//! Membership table records: one entry per silo, the table version that
//! anchors every conditional write, and read snapshots of the table.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{SiloAddress, SiloStatus};

/// A suspicion vote: who suspected the silo, and when.
pub type SuspectVote = (SiloAddress, SystemTime);

/// One silo's row in the membership table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub silo_address: SiloAddress,
    pub host_name: String,
    pub silo_name: String,
    pub status: SiloStatus,
    /// Client gateway port, 0 when the silo accepts no client connections.
    pub proxy_port: u16,
    pub role_name: String,
    pub instance_name: String,
    pub update_zone: i32,
    pub fault_zone: i32,
    pub start_time: SystemTime,
    /// Last liveness publication. `None` until the first heartbeat lands.
    pub i_am_alive_time: Option<SystemTime>,
    /// Suspicion votes, oldest first. Bounded by the death quorum.
    pub suspect_times: Vec<SuspectVote>,
}

impl MembershipEntry {
    /// Creates a fresh entry with no votes and no heartbeat yet.
    pub fn new(
        silo_address: SiloAddress,
        silo_name: impl Into<String>,
        host_name: impl Into<String>,
        status: SiloStatus,
        start_time: SystemTime,
    ) -> Self {
        Self {
            silo_address,
            host_name: host_name.into(),
            silo_name: silo_name.into(),
            status,
            proxy_port: 0,
            role_name: String::new(),
            instance_name: String::new(),
            update_zone: 0,
            fault_zone: 0,
            start_time,
            i_am_alive_time: None,
            suspect_times: Vec::new(),
        }
    }

    /// Appends a vote without any bound. Used when a silo records itself
    /// as the killer of its own or another row.
    pub fn add_suspector(&mut self, suspector: SiloAddress, time: SystemTime) {
        self.suspect_times.push((suspector, time));
    }

    /// Records `suspector`'s vote, keeping the list at most `max_votes`
    /// long: an existing vote by the same suspector is refreshed in place,
    /// otherwise the vote is appended, or replaces the oldest vote when the
    /// list is full.
    pub fn record_vote(&mut self, suspector: SiloAddress, time: SystemTime, max_votes: usize) {
        if let Some(slot) = self
            .suspect_times
            .iter_mut()
            .find(|(voter, _)| *voter == suspector)
        {
            slot.1 = time;
            return;
        }
        if self.suspect_times.len() < max_votes {
            self.suspect_times.push((suspector, time));
            return;
        }
        let oldest = self
            .suspect_times
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, t))| *t)
            .map(|(i, _)| i);
        match oldest {
            Some(i) => self.suspect_times[i] = (suspector, time),
            None => self.suspect_times.push((suspector, time)),
        }
    }

    /// Votes younger than `expiration` as of `now`. A vote stamped in the
    /// future (clock skew between voters) counts as fresh.
    pub fn fresh_votes(&self, now: SystemTime, expiration: Duration) -> Vec<SuspectVote> {
        self.suspect_times
            .iter()
            .filter(|(_, time)| match now.duration_since(*time) {
                Ok(age) => age < expiration,
                Err(_) => true,
            })
            .copied()
            .collect()
    }

    /// Last sign of life: the heartbeat, or the start time if the silo has
    /// not published one yet.
    pub fn last_alive(&self) -> SystemTime {
        self.i_am_alive_time.unwrap_or(self.start_time)
    }

    /// True if the silo has gone longer than `allowed` without a heartbeat.
    pub fn has_missed_i_am_alives(&self, now: SystemTime, allowed: Duration) -> bool {
        match now.duration_since(self.last_alive()) {
            Ok(silence) => silence > allowed,
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for MembershipEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} {} {} votes={}]",
            self.silo_address,
            self.silo_name,
            self.status,
            self.suspect_times.len()
        )
    }
}

/// Global version of the membership table.
///
/// Writers pass `read_version.next()` with every insert or update; the table
/// accepts the write only if that is exactly one past the stored version and
/// the etag still matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableVersion {
    pub version: i64,
    pub etag: String,
}

impl TableVersion {
    pub fn new(version: i64, etag: impl Into<String>) -> Self {
        Self {
            version,
            etag: etag.into(),
        }
    }

    /// The version a successful write will install. Keeps the etag, which
    /// the table checks against its stored one.
    pub fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            etag: self.etag.clone(),
        }
    }
}

impl std::fmt::Display for TableVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}, {}>", self.version, self.etag)
    }
}

/// A read snapshot of the table: rows with their etags, plus the version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipTableData {
    pub members: Vec<(MembershipEntry, String)>,
    pub version: TableVersion,
}

impl MembershipTableData {
    /// Builds a snapshot with Dead rows sorted last.
    pub fn new(mut members: Vec<(MembershipEntry, String)>, version: TableVersion) -> Self {
        members.sort_by_key(|(entry, _)| entry.status == SiloStatus::Dead);
        Self { members, version }
    }

    pub fn get(&self, silo: &SiloAddress) -> Option<&(MembershipEntry, String)> {
        self.members
            .iter()
            .find(|(entry, _)| entry.silo_address == *silo)
    }

    pub fn contains(&self, silo: &SiloAddress) -> bool {
        self.get(silo).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.members.iter().map(|(entry, _)| entry)
    }

    /// Collapses Dead rows for the same endpoint to the newest generation.
    /// Used for log output, where a long history of restarts is noise.
    pub fn suppress_duplicate_deads(&self) -> Self {
        let mut newest_dead: HashMap<std::net::SocketAddr, SiloAddress> = HashMap::new();
        for entry in self.entries().filter(|e| e.status == SiloStatus::Dead) {
            let slot = newest_dead
                .entry(entry.silo_address.endpoint())
                .or_insert(entry.silo_address);
            if entry.silo_address.generation() > slot.generation() {
                *slot = entry.silo_address;
            }
        }
        let members = self
            .members
            .iter()
            .filter(|(entry, _)| {
                entry.status != SiloStatus::Dead
                    || newest_dead.get(&entry.silo_address.endpoint()) == Some(&entry.silo_address)
            })
            .cloned()
            .collect();
        Self::new(members, self.version.clone())
    }
}

impl std::fmt::Display for MembershipTableData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self
            .entries()
            .filter(|e| e.status == SiloStatus::Active)
            .count();
        write!(
            f,
            "{} silos, {} are Active, version={} [",
            self.members.len(),
            active,
            self.version
        )?;
        for (i, entry) in self.entries().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", entry.silo_address, entry.status)?;
        }
        f.write_str("]")
    }
}
