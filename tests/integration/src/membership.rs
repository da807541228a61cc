//! End-to-end membership: silos joining through a hosted table, crash
//! detection and graceful departure.

use std::time::Duration;

use silo_membership::{MembershipTable, RowMembershipTable, SiloStatus};

use crate::helpers::{table_client, wait_for_status, SiloOptions, TestSilo};

const JOIN_TIMEOUT: Duration = Duration::from_secs(20);
const DETECTION_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn two_silos_join_through_hosted_table() {
    let host = TestSilo::host(1);
    let table = table_client(host.table_addr.unwrap());
    wait_for_status(&table, &host.address, SiloStatus::Active, JOIN_TIMEOUT).await;

    let joiner = TestSilo::joiner(host.table_addr.unwrap(), 2);
    let entry = wait_for_status(&table, &joiner.address, SiloStatus::Active, JOIN_TIMEOUT).await;
    assert_eq!(entry.silo_name, format!("silo-{}", joiner.address.endpoint().port()));
    assert!(entry.suspect_times.is_empty());

    let data = table.read_all().await.unwrap();
    assert_eq!(data.members.len(), 2);
    assert!(data.entries().all(|e| e.status == SiloStatus::Active));
    // table version row counts every successful write
    assert!(data.version.version >= 4, "version {}", data.version.version);
}

#[tokio::test]
async fn crashed_silo_is_declared_dead() {
    let host = TestSilo::host(1);
    let addr = host.table_addr.unwrap();
    let table = table_client(addr);
    wait_for_status(&table, &host.address, SiloStatus::Active, JOIN_TIMEOUT).await;

    let other = TestSilo::joiner(addr, 2);
    let mut victim = TestSilo::joiner(addr, 3);
    wait_for_status(&table, &other.address, SiloStatus::Active, JOIN_TIMEOUT).await;
    wait_for_status(&table, &victim.address, SiloStatus::Active, JOIN_TIMEOUT).await;

    victim.crash();

    let dead = wait_for_status(&table, &victim.address, SiloStatus::Dead, DETECTION_TIMEOUT).await;
    let voters: Vec<_> = dead.suspect_times.iter().map(|(suspector, _)| *suspector).collect();
    assert!(
        voters.contains(&host.address) || voters.contains(&other.address),
        "dead row carries no votes from the survivors: {voters:?}"
    );

    let data = table.read_all().await.unwrap();
    assert_eq!(data.get(&host.address).unwrap().0.status, SiloStatus::Active);
    assert_eq!(data.get(&other.address).unwrap().0.status, SiloStatus::Active);
}

#[tokio::test]
async fn file_backed_table_outlives_its_host() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("members.json");
    let mut host = TestSilo::start_with(SiloOptions {
        generation: 7,
        host_table: true,
        table_file: Some(path.clone()),
        ..Default::default()
    });
    let table = table_client(host.table_addr.unwrap());
    wait_for_status(&table, &host.address, SiloStatus::Active, JOIN_TIMEOUT).await;
    host.crash();

    let reopened = RowMembershipTable::open("it", &path).await.unwrap();
    let data = reopened.read_all().await.unwrap();
    assert_eq!(data.members.len(), 1);
    let (entry, _) = data.get(&host.address).unwrap();
    assert_eq!(entry.status, SiloStatus::Active);
    assert_eq!(entry.silo_address.generation(), 7);
}

#[cfg(unix)]
#[tokio::test]
async fn interrupted_silo_leaves_gracefully() {
    let host = TestSilo::host(1);
    let addr = host.table_addr.unwrap();
    let table = table_client(addr);
    wait_for_status(&table, &host.address, SiloStatus::Active, JOIN_TIMEOUT).await;

    let mut leaver = TestSilo::joiner(addr, 2);
    wait_for_status(&table, &leaver.address, SiloStatus::Active, JOIN_TIMEOUT).await;

    let status = std::process::Command::new("kill")
        .args(["-INT", &leaver.pid().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let entry = wait_for_status(&table, &leaver.address, SiloStatus::Dead, JOIN_TIMEOUT).await;
    // nobody else had to vote: the silo wrote its own Dead row
    assert!(entry
        .suspect_times
        .iter()
        .all(|(suspector, _)| *suspector == leaver.address));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while leaver.is_running() {
        assert!(tokio::time::Instant::now() < deadline, "silo did not exit after SIGINT");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
