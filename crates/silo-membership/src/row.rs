//! Flat row form of a membership entry, as stored by key-value and
//! table-style backends.
//!
//! Every field is a string or integer so the row maps onto any store. Each
//! deployment has one row per silo, keyed `ip-port-generation`, plus one
//! well-known [`TABLE_VERSION_ROW`] carrying the table version. Suspicion
//! votes are split across two `|`-joined columns that must line up.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{MembershipEntry, MembershipError, Result, SiloAddress, TableVersion};

/// Row key of the per-deployment table version row.
pub const TABLE_VERSION_ROW: &str = "VersionRow";

const LIST_SEPARATOR: char = '|';

/// One stored row. The version row uses only the deployment, key, etag and
/// `membership_version` columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiloInstanceRow {
    pub deployment_id: String,
    pub row_key: String,
    pub address: String,
    pub port: u16,
    pub generation: i32,
    pub host_name: String,
    pub status: String,
    pub proxy_port: u16,
    pub silo_name: String,
    pub role_name: String,
    pub instance_name: String,
    pub update_zone: i32,
    pub fault_zone: i32,
    pub suspecting_silos: String,
    pub suspecting_times: String,
    pub start_time: String,
    pub i_am_alive_time: String,
    pub membership_version: i64,
    pub etag: String,
}

/// Row key for a silo: `ip-port-generation`.
pub fn row_key(silo: &SiloAddress) -> String {
    format!(
        "{}-{}-{}",
        silo.endpoint().ip(),
        silo.endpoint().port(),
        silo.generation()
    )
}

impl SiloInstanceRow {
    /// Flattens an entry into a row.
    pub fn from_entry(deployment_id: &str, entry: &MembershipEntry, etag: &str) -> Self {
        let (silos, times): (Vec<String>, Vec<String>) = entry
            .suspect_times
            .iter()
            .map(|(voter, time)| (voter.to_parsable_string(), format_time(*time)))
            .unzip();
        Self {
            deployment_id: deployment_id.to_string(),
            row_key: row_key(&entry.silo_address),
            address: entry.silo_address.endpoint().ip().to_string(),
            port: entry.silo_address.endpoint().port(),
            generation: entry.silo_address.generation(),
            host_name: entry.host_name.clone(),
            status: entry.status.to_string(),
            proxy_port: entry.proxy_port,
            silo_name: entry.silo_name.clone(),
            role_name: entry.role_name.clone(),
            instance_name: entry.instance_name.clone(),
            update_zone: entry.update_zone,
            fault_zone: entry.fault_zone,
            suspecting_silos: silos.join("|"),
            suspecting_times: times.join("|"),
            start_time: format_time(entry.start_time),
            i_am_alive_time: entry.i_am_alive_time.map(format_time).unwrap_or_default(),
            membership_version: 0,
            etag: etag.to_string(),
        }
    }

    /// Builds the version row for a deployment.
    pub fn version_row(deployment_id: &str, version: &TableVersion) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            row_key: TABLE_VERSION_ROW.to_string(),
            membership_version: version.version,
            etag: version.etag.clone(),
            ..Default::default()
        }
    }

    pub fn is_version_row(&self) -> bool {
        self.row_key == TABLE_VERSION_ROW
    }

    /// Reads the table version out of a version row.
    pub fn to_table_version(&self) -> TableVersion {
        TableVersion::new(self.membership_version, self.etag.clone())
    }

    /// Parses the row back into an entry.
    pub fn to_entry(&self) -> Result<MembershipEntry> {
        let ip = self
            .address
            .parse()
            .map_err(|e| MembershipError::parse(format!("bad address '{}': {e}", self.address)))?;
        let silo_address = SiloAddress::new(std::net::SocketAddr::new(ip, self.port), self.generation);

        let mut entry = MembershipEntry::new(
            silo_address,
            self.silo_name.clone(),
            self.host_name.clone(),
            self.status.parse()?,
            parse_time(&self.start_time)?,
        );
        entry.proxy_port = self.proxy_port;
        entry.role_name = self.role_name.clone();
        entry.instance_name = self.instance_name.clone();
        entry.update_zone = self.update_zone;
        entry.fault_zone = self.fault_zone;
        if !self.i_am_alive_time.is_empty() {
            entry.i_am_alive_time = Some(parse_time(&self.i_am_alive_time)?);
        }

        let silos = split_list(&self.suspecting_silos);
        let times = split_list(&self.suspecting_times);
        if silos.len() != times.len() {
            return Err(MembershipError::parse(format!(
                "row {} has {} suspecting silos but {} suspecting times",
                self.row_key,
                silos.len(),
                times.len()
            )));
        }
        for (silo, time) in silos.iter().zip(&times) {
            entry.suspect_times.push((silo.parse()?, parse_time(time)?));
        }
        Ok(entry)
    }
}

fn split_list(column: &str) -> Vec<&str> {
    if column.is_empty() {
        return Vec::new();
    }
    column.split(LIST_SEPARATOR).collect()
}

/// RFC 3339 with millisecond precision. Sub-millisecond detail is dropped.
fn format_time(time: SystemTime) -> String {
    humantime::format_rfc3339_millis(time).to_string()
}

fn parse_time(text: &str) -> Result<SystemTime> {
    humantime::parse_rfc3339(text)
        .map_err(|e| MembershipError::parse(format!("bad timestamp '{text}': {e}")))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::SiloStatus;

    fn silo(port: u16, generation: i32) -> SiloAddress {
        SiloAddress::new(SocketAddr::from(([10, 1, 2, 3], port)), generation)
    }

    fn at_millis(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    fn sample_entry() -> MembershipEntry {
        let mut entry = MembershipEntry::new(
            silo(11111, 77),
            "silo-a",
            "host-a",
            SiloStatus::Active,
            at_millis(1_700_000_000_123),
        );
        entry.proxy_port = 30000;
        entry.update_zone = 2;
        entry.fault_zone = 5;
        entry.i_am_alive_time = Some(at_millis(1_700_000_060_456));
        entry
    }

    #[test]
    fn row_key_format() {
        assert_eq!(row_key(&silo(11111, 77)), "10.1.2.3-11111-77");
    }

    #[test]
    fn suspect_votes_roundtrip_in_order() {
        let mut entry = sample_entry();
        entry.add_suspector(silo(22222, 5), at_millis(1_700_000_100_001));
        entry.add_suspector(silo(33333, 6), at_millis(1_700_000_099_999));
        entry.add_suspector(
            SiloAddress::new("[fe80::1]:44444".parse().unwrap(), 8),
            at_millis(1_700_000_100_500),
        );

        let row = SiloInstanceRow::from_entry("deployment", &entry, "etag-1");
        assert_eq!(row.suspecting_silos.matches('|').count(), 2);
        let parsed = row.to_entry().unwrap();

        assert_eq!(parsed.suspect_times, entry.suspect_times);
        assert_eq!(parsed, entry);
    }

    #[test]
    fn empty_vote_list_and_missing_heartbeat() {
        let mut entry = sample_entry();
        entry.i_am_alive_time = None;
        let row = SiloInstanceRow::from_entry("deployment", &entry, "e");
        assert!(row.suspecting_silos.is_empty());
        assert!(row.i_am_alive_time.is_empty());
        let parsed = row.to_entry().unwrap();
        assert!(parsed.suspect_times.is_empty());
        assert_eq!(parsed.i_am_alive_time, None);
    }

    #[test]
    fn mismatched_vote_columns_rejected() {
        let mut entry = sample_entry();
        entry.add_suspector(silo(22222, 5), at_millis(1_700_000_100_001));
        let mut row = SiloInstanceRow::from_entry("deployment", &entry, "e");
        row.suspecting_times.push_str("|2023-11-14T22:13:20.000Z");
        assert!(matches!(row.to_entry(), Err(MembershipError::Parse(_))));
    }

    #[test]
    fn version_row_roundtrip() {
        let row = SiloInstanceRow::version_row("deployment", &TableVersion::new(12, "v-etag"));
        assert!(row.is_version_row());
        assert_eq!(row.to_table_version(), TableVersion::new(12, "v-etag"));
    }

    #[test]
    fn timestamps_keep_millisecond_precision() {
        let t = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        assert_eq!(parse_time(&format_time(t)).unwrap(), at_millis(1_700_000_000_123));
    }
}
