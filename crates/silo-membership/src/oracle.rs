//! The membership protocol engine.
//!
//! A [`MembershipOracle`] owns this silo's row in the membership table and
//! keeps the local view ([`MembershipOracleData`]) in sync with the table.
//!
//! Lifecycle: [`start`](MembershipOracle::start) cleans up rows left by
//! earlier generations of this endpoint and writes the Joining row;
//! [`become_active`](MembershipOracle::become_active) writes Active and
//! starts the table-refresh and probe timers. Shutdown transitions write
//! ShuttingDown, Stopping or Dead.
//!
//! Failure detection: each Active silo pings its `num_probed_silos`
//! successors on the hash ring. After `num_missed_probes_limit` consecutive
//! misses it votes against the silo in the table, and the voter that brings
//! the fresh votes to the quorum writes the silo as Dead.
//!
//! Every operation that reads the table and applies the result runs under
//! one async lock (the turn), so the local view is always updated from
//! table snapshots in the order they were read. Internal helpers assume
//! the turn is held and never take it themselves.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::oracle_data::{MembershipOracleData, SiloStatusListener};
use crate::retry::{execute_with_retries, ExponentialBackoff};
use crate::table::DynMembershipTable;
use crate::timer::PeriodicTask;
use crate::transport::DynSiloTransport;
use crate::{
    MembershipConfig, MembershipEntry, MembershipError, MembershipTableData, Result, SiloAddress,
    SiloStatus, TableVersion,
};

/// Per-silo share of the startup jitter.
const STARTUP_JITTER_PER_SILO: Duration = Duration::from_millis(500);

/// Static facts about this silo, written into its membership row.
#[derive(Debug, Clone)]
pub struct SiloIdentity {
    pub address: SiloAddress,
    pub silo_name: String,
    pub host_name: String,
    pub proxy_port: u16,
    pub role_name: String,
    pub instance_name: String,
    pub update_zone: i32,
    pub fault_zone: i32,
}

impl SiloIdentity {
    pub fn new(address: SiloAddress, silo_name: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            address,
            silo_name: silo_name.into(),
            host_name: host_name.into(),
            proxy_port: 0,
            role_name: String::new(),
            instance_name: String::new(),
            update_zone: 0,
            fault_zone: 0,
        }
    }
}

/// Decides whether the vote being cast completes the death quorum.
///
/// `fresh_votes` counts unexpired votes already in the row; this silo's vote
/// is added unless it is among them. A silo is declared dead when the total
/// reaches `votes_needed`, or a majority of `active_silos` (rounded as
/// `(active_silos + 1) / 2`), so small clusters can still reach a verdict.
pub fn should_declare_dead(
    fresh_votes: usize,
    already_voted: bool,
    votes_needed: usize,
    active_silos: usize,
) -> bool {
    let total = fresh_votes + usize::from(!already_voted);
    total >= votes_needed || total >= (active_silos + 1) / 2
}

#[derive(Default)]
struct Timers {
    i_am_alive: Option<PeriodicTask>,
    table_refresh: Option<PeriodicTask>,
    probe: Option<PeriodicTask>,
}

impl Timers {
    fn iter(&self) -> impl Iterator<Item = &PeriodicTask> {
        [&self.i_am_alive, &self.table_refresh, &self.probe]
            .into_iter()
            .flatten()
    }
}

/// This silo's membership protocol instance.
pub struct MembershipOracle {
    identity: SiloIdentity,
    config: MembershipConfig,
    table: DynMembershipTable,
    transport: DynSiloTransport,
    data: MembershipOracleData,
    start_time: SystemTime,
    contention_backoff: ExponentialBackoff,
    error_backoff: ExponentialBackoff,
    turn: tokio::sync::Mutex<()>,
    /// Watched silos and their consecutive missed probes.
    probed: Mutex<HashMap<SiloAddress, u32>>,
    timers: Mutex<Timers>,
    ping_counter: AtomicU64,
    terminated: watch::Sender<bool>,
}

impl std::fmt::Debug for MembershipOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipOracle")
            .field("silo", &self.identity.address)
            .field("status", &self.data.my_status())
            .finish_non_exhaustive()
    }
}

impl MembershipOracle {
    pub fn new(
        identity: SiloIdentity,
        config: MembershipConfig,
        table: DynMembershipTable,
        transport: DynSiloTransport,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let data = MembershipOracleData::new(identity.address, identity.silo_name.clone());
        let (terminated, _) = watch::channel(false);
        Ok(Arc::new(Self {
            contention_backoff: ExponentialBackoff::contention(&config),
            error_backoff: ExponentialBackoff::error(&config),
            identity,
            config,
            table,
            transport,
            data,
            start_time: SystemTime::now(),
            turn: tokio::sync::Mutex::new(()),
            probed: Mutex::new(HashMap::new()),
            timers: Mutex::new(Timers::default()),
            ping_counter: AtomicU64::new(0),
            terminated,
        }))
    }

    pub fn my_address(&self) -> SiloAddress {
        self.identity.address
    }

    pub fn current_status(&self) -> SiloStatus {
        self.data.my_status()
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Resolves to `true` once this silo has found itself dead or killed
    /// itself.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    /// Silos currently watched by the probe timer.
    pub fn probed_silos(&self) -> Vec<SiloAddress> {
        let mut silos: Vec<_> = self.probed.lock().keys().copied().collect();
        silos.sort();
        silos
    }

    // -- lifecycle --

    /// Joins the cluster: jitter, clean up rows of earlier generations,
    /// write the Joining row and start publishing IAmAlive.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let me = self.my_address();
        info!(
            "membership oracle starting for {} on host {}",
            me, self.identity.host_name
        );

        let jitter_cap = (STARTUP_JITTER_PER_SILO * self.config.expected_cluster_size as u32)
            .min(self.config.max_join_attempt_time)
            .min(self.config.max_startup_delay);
        let delay_ms = rand::rng().random_range(0..=jitter_cap.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let _turn = self.turn.lock().await;
        self.cleanup_defunct_rows().await;
        self.with_retries("cleanup table", |_| self.cleanup_table()).await?;
        if self.current_status() == SiloStatus::Dead {
            return Err(MembershipError::FoundMyselfDead(me));
        }

        self.update_my_status_global(SiloStatus::Joining).await?;
        self.start_i_am_alive_timer();
        self.detect_node_migration().await
    }

    /// Writes Active, loads the table into the local view and starts the
    /// refresh and probe timers. Safe to call again while Active: the
    /// timers are replaced and an unchanged table fires no notifications.
    /// Fails with [`MembershipError::InvalidStatus`] once the silo is
    /// terminating.
    pub async fn become_active(self: &Arc<Self>) -> Result<()> {
        info!("{} becoming active", self.my_address());
        let _turn = self.turn.lock().await;
        self.check_transition(SiloStatus::Active)?;

        self.update_my_status_global(SiloStatus::Active).await?;
        let table = self.table.read_all().await?;
        self.process_table_update(&table, "become active", true).await?;
        self.gossip_to_others(self.my_address(), self.current_status());

        self.start_liveness_timers();
        info!("{} is active", self.my_address());
        Ok(())
    }

    /// Announces a graceful shutdown.
    pub async fn shut_down(&self) -> Result<()> {
        info!("{} shutting down", self.my_address());
        let _turn = self.turn.lock().await;
        self.check_transition(SiloStatus::ShuttingDown)?;
        self.update_my_status_global(SiloStatus::ShuttingDown).await
    }

    /// Announces an ungraceful stop.
    pub async fn stop(&self) -> Result<()> {
        info!("{} stopping", self.my_address());
        let _turn = self.turn.lock().await;
        self.check_transition(SiloStatus::Stopping)?;
        self.update_my_status_global(SiloStatus::Stopping).await
    }

    /// Statuses only move forward: a terminating silo never becomes
    /// Active again and Stopping never falls back to ShuttingDown.
    /// Repeating the current status is allowed; Dead is always reachable.
    fn check_transition(&self, to: SiloStatus) -> Result<()> {
        let current = self.current_status();
        let allowed = match to {
            SiloStatus::Active => !current.is_terminating(),
            SiloStatus::ShuttingDown => !current.is_terminating() || current == to,
            SiloStatus::Stopping => current != SiloStatus::Dead,
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            warn!("{} cannot become {to} while {current}", self.my_address());
            Err(MembershipError::InvalidStatus(current))
        }
    }

    /// Stops the timers and writes this silo's row as Dead.
    pub async fn kill_myself(&self) -> Result<()> {
        let _turn = self.turn.lock().await;
        self.kill_myself_in_turn().await
    }

    async fn kill_myself_in_turn(&self) -> Result<()> {
        info!("{} marking itself dead", self.my_address());
        // write before disposing: this may run inside one of the timer tasks
        let result = self.update_my_status_global(SiloStatus::Dead).await;
        self.dispose_timers();
        self.terminated.send_replace(true);
        result
    }

    /// Gossip receiver. The payload only hints that the table changed: the
    /// table is re-read and is the sole source of truth.
    pub async fn silo_status_change_notification(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<()> {
        trace!("gossip: {silo} is now {status}, re-reading the table");
        if !self.current_status().is_functional() {
            return Ok(());
        }
        let _turn = self.turn.lock().await;
        let table = self.table.read_all().await?;
        self.process_table_update(&table, "gossip", false).await
    }

    // -- read side --

    pub fn get_approximate_silo_status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.data.approximate_status(silo)
    }

    pub fn get_approximate_silo_statuses(&self, only_active: bool) -> HashMap<SiloAddress, SiloStatus> {
        self.data.approximate_statuses(only_active)
    }

    pub fn try_get_silo_name(&self, silo: &SiloAddress) -> Option<String> {
        self.data.approximate_silo_name(silo)
    }

    /// True unless the silo is known to be terminating. Unknown silos count
    /// as functional.
    pub fn is_functional_directory(&self, silo: &SiloAddress) -> bool {
        if *silo == self.my_address() {
            return true;
        }
        self.data
            .approximate_status(silo)
            .map_or(true, |status| !status.is_terminating())
    }

    /// True only if the silo is known to be Dead. Never true for this silo.
    pub fn is_dead_silo(&self, silo: &SiloAddress) -> bool {
        if *silo == self.my_address() {
            return false;
        }
        self.data.approximate_status(silo) == Some(SiloStatus::Dead)
    }

    pub fn subscribe_to_silo_status_events(&self, listener: Arc<dyn SiloStatusListener>) -> bool {
        self.data.subscribe(listener)
    }

    pub fn unsubscribe_from_silo_status_events(&self, listener: &Arc<dyn SiloStatusListener>) -> bool {
        self.data.unsubscribe(listener)
    }

    /// Checks that every running timer has ticked within two periods.
    pub fn check_health(&self) -> bool {
        let now = tokio::time::Instant::now();
        let mut healthy = true;
        for timer in self.timers.lock().iter() {
            if let Some(problem) = timer.check_health(now) {
                warn!("membership health check: {problem}");
                healthy = false;
            }
        }
        healthy
    }

    // -- timer handlers --

    /// Table refresh tick: re-read the table and apply it.
    pub async fn refresh_table(&self) -> Result<()> {
        let _turn = self.turn.lock().await;
        let table = self.table.read_all().await?;
        self.process_table_update(&table, "timer", false).await
    }

    /// Probe tick: ping every watched silo concurrently, then suspect those
    /// that reached the missed-probe limit.
    pub async fn probe_silos(&self) -> Result<()> {
        let silos: Vec<SiloAddress> = self.probed.lock().keys().copied().collect();
        if silos.is_empty() {
            return Ok(());
        }

        let mut pings = JoinSet::new();
        for silo in silos {
            let transport = Arc::clone(&self.transport);
            let probe_number = self.ping_counter.fetch_add(1, Ordering::Relaxed);
            let timeout = self.config.probe_response_timeout;
            pings.spawn(async move {
                let result = match tokio::time::timeout(timeout, transport.ping(&silo, probe_number)).await {
                    Ok(result) => result,
                    Err(_) => Err(MembershipError::PingFailed {
                        target: silo,
                        reason: format!("no answer within {timeout:?}"),
                    }),
                };
                (silo, probe_number, result)
            });
        }

        let mut to_suspect = Vec::new();
        while let Some(joined) = pings.join_next().await {
            let (silo, probe_number, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("probe task failed: {e}");
                    continue;
                }
            };
            match result {
                Ok(()) => self.reset_failed_probes(&silo),
                Err(e) => {
                    if self.inc_failed_probes(&silo, probe_number, &e) {
                        to_suspect.push(silo);
                    }
                }
            }
        }

        for silo in to_suspect {
            let _turn = self.turn.lock().await;
            let outcome = self
                .with_retries("suspect or kill", |_| self.try_to_suspect_or_kill(silo))
                .await;
            if let Err(e) = outcome {
                error!("failed to suspect {silo}: {e}");
            }
        }
        Ok(())
    }

    /// IAmAlive tick: merge a fresh heartbeat into this silo's row.
    pub async fn publish_i_am_alive(&self) -> Result<()> {
        let mut entry = MembershipEntry::new(
            self.my_address(),
            "",
            "",
            self.current_status(),
            self.start_time,
        );
        entry.i_am_alive_time = Some(SystemTime::now());
        self.table.update_i_am_alive(&entry).await
    }

    fn reset_failed_probes(&self, silo: &SiloAddress) {
        trace!("probe answered by {silo}");
        // only silos still on the watch list are tracked
        if let Some(missed) = self.probed.lock().get_mut(silo) {
            *missed = 0;
        }
    }

    /// Counts a missed probe. Returns true if the silo reached the limit.
    fn inc_failed_probes(&self, silo: &SiloAddress, probe_number: u64, reason: &MembershipError) -> bool {
        let mut probed = self.probed.lock();
        let Some(missed) = probed.get_mut(silo) else {
            debug!("{silo} is no longer watched, ignoring missed probe #{probe_number}");
            return false;
        };
        *missed += 1;
        warn!("missed probe #{probe_number} to {silo} ({} in a row): {reason}", *missed);
        *missed >= self.config.num_missed_probes_limit
    }

    // -- timers --

    fn start_i_am_alive_timer(self: &Arc<Self>) {
        let oracle = Arc::downgrade(self);
        let task = PeriodicTask::spawn(
            "i-am-alive",
            Duration::ZERO,
            self.config.i_am_alive_table_publish_timeout,
            move || {
                let oracle = oracle.clone();
                async move {
                    match oracle.upgrade() {
                        Some(oracle) => oracle.publish_i_am_alive().await,
                        None => Ok(()),
                    }
                }
            },
        );
        self.timers.lock().i_am_alive = Some(task);
    }

    fn start_liveness_timers(self: &Arc<Self>) {
        let (refresh_offset, probe_offset) = {
            let mut rng = rand::rng();
            (
                random_offset(&mut rng, self.config.table_refresh_timeout),
                random_offset(&mut rng, self.config.probe_timeout),
            )
        };

        let oracle = Arc::downgrade(self);
        let refresh = PeriodicTask::spawn(
            "table-refresh",
            refresh_offset,
            self.config.table_refresh_timeout,
            move || {
                let oracle = oracle.clone();
                async move {
                    match oracle.upgrade() {
                        Some(oracle) => oracle.refresh_table().await,
                        None => Ok(()),
                    }
                }
            },
        );

        let oracle = Arc::downgrade(self);
        let probe = PeriodicTask::spawn(
            "probe",
            probe_offset,
            self.config.probe_timeout,
            move || {
                let oracle = oracle.clone();
                async move {
                    match oracle.upgrade() {
                        Some(oracle) => oracle.probe_silos().await,
                        None => Ok(()),
                    }
                }
            },
        );

        let mut timers = self.timers.lock();
        // replacing drops (and aborts) the previous tasks
        timers.table_refresh = Some(refresh);
        timers.probe = Some(probe);
    }

    fn dispose_timers(&self) {
        let old = std::mem::take(&mut *self.timers.lock());
        for timer in old.iter() {
            debug!("disposing {} timer", timer.name());
            timer.dispose();
        }
    }

    // -- table writes --

    async fn with_retries<F, Fut>(&self, op: &'static str, attempt: F) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        execute_with_retries(
            op,
            self.config.max_join_attempt_time,
            self.contention_backoff,
            self.error_backoff,
            attempt,
        )
        .await
    }

    /// Deletes rows of long-gone silos. Failure only delays the cleanup.
    async fn cleanup_defunct_rows(&self) {
        let expiration = self.config.defunct_silo_expiration;
        if expiration.is_zero() {
            return;
        }
        let Some(before) = SystemTime::now().checked_sub(expiration) else {
            return;
        };
        if let Err(e) = self.table.cleanup_defunct_silo_entries(before).await {
            warn!("failed to clean up defunct membership rows: {e}");
        }
    }

    async fn cleanup_table(&self) -> Result<bool> {
        let table = self.table.read_all().await?;
        info!("membership table on startup: {table}");
        self.cleanup_table_entries(&table).await
    }

    /// Resolves conflicts with other generations of this endpoint. Returns
    /// false if some stale row could not be declared dead yet.
    async fn cleanup_table_entries(&self, table: &MembershipTableData) -> Result<bool> {
        let me = self.my_address();
        let mut stale = Vec::new();
        for (entry, etag) in &table.members {
            let silo = entry.silo_address;
            if !silo.is_same_endpoint(&me) {
                continue;
            }
            if silo.generation() == me.generation() {
                if entry.status == SiloStatus::Dead {
                    warn!("found my own row marked dead: {entry}");
                    self.kill_myself_locally("my row is marked dead");
                }
                continue;
            }
            if entry.status == SiloStatus::Dead {
                trace!("skipping dead row of earlier generation {silo}");
                continue;
            }
            if silo.generation() < me.generation() {
                warn!("found older generation {silo} of myself ({me}) alive in the table, declaring it dead");
                stale.push((entry.clone(), etag.clone()));
            } else {
                warn!("found newer generation {silo} of myself ({me}) in the table, stopping");
                if let Err(e) = self.kill_myself_in_turn().await {
                    error!("failed to write my own death: {e}");
                }
                self.kill_myself_locally("a newer generation of this silo exists");
                return Ok(true);
            }
        }

        if stale.is_empty() {
            return Ok(true);
        }
        let mut version = table.version.clone();
        let mut all_ok = true;
        for (entry, etag) in stale {
            all_ok &= self.declare_dead(entry, &etag, &version).await?;
            // a failed write means someone else advanced the version
            version = version.next();
        }
        Ok(all_ok)
    }

    /// Writes this silo's status with retries, then applies it locally and
    /// gossips it.
    async fn update_my_status_global(&self, status: SiloStatus) -> Result<()> {
        let me = self.my_address();
        let outcome = self
            .with_retries("update my status", |attempt| {
                debug!("writing status {status} for {me}, attempt {attempt}");
                self.try_update_my_status_global_once(status)
            })
            .await;
        if let Err(e) = outcome {
            error!("{me} failed to write status {status}: {e}");
            return Err(e);
        }

        if status != SiloStatus::Dead && self.current_status() == SiloStatus::Dead {
            return Err(MembershipError::FoundMyselfDead(me));
        }
        debug!("{me} wrote status {status}");
        self.data.update_my_status_local(status);
        self.gossip_to_others(me, status);
        Ok(())
    }

    async fn try_update_my_status_global_once(&self, status: SiloStatus) -> Result<bool> {
        let me = self.my_address();
        let table = if status == SiloStatus::Active {
            self.table.read_all().await?
        } else {
            self.table.read_row(&me).await?
        };
        self.check_missed_i_am_alives(&table);

        let (mut entry, etag) = match table.get(&me) {
            Some((entry, etag)) => {
                if entry.status == SiloStatus::Dead {
                    warn!("found my own row marked dead while writing {status}: {entry}");
                    self.kill_myself_locally("my row is marked dead");
                    return Ok(true);
                }
                (entry.clone(), Some(etag.clone()))
            }
            None => (self.new_entry(status), None),
        };

        let now = SystemTime::now();
        if status == SiloStatus::Dead {
            entry.add_suspector(me, now);
        }
        entry.status = status;
        entry.i_am_alive_time = Some(now);

        if status == SiloStatus::Active && self.config.validate_initial_connectivity {
            self.validate_initial_connectivity(&table).await?;
        }

        let next = table.version.next();
        match etag {
            Some(etag) => self.table.update_row(&entry, &etag, &next).await,
            None => self.table.insert_row(&entry, &next).await,
        }
    }

    fn new_entry(&self, status: SiloStatus) -> MembershipEntry {
        let id = &self.identity;
        let mut entry = MembershipEntry::new(
            id.address,
            id.silo_name.clone(),
            id.host_name.clone(),
            status,
            self.start_time,
        );
        entry.proxy_port = id.proxy_port;
        entry.role_name = id.role_name.clone();
        entry.instance_name = id.instance_name.clone();
        entry.update_zone = id.update_zone;
        entry.fault_zone = id.fault_zone;
        entry
    }

    /// Pings every Active silo that is still publishing IAmAlive. Any
    /// failure blocks the transition to Active.
    async fn validate_initial_connectivity(&self, table: &MembershipTableData) -> Result<()> {
        let me = self.my_address();
        let now = SystemTime::now();
        let allowed = self.config.allowed_i_am_alive_miss_period();
        let targets: Vec<SiloAddress> = table
            .entries()
            .filter(|e| {
                e.status == SiloStatus::Active
                    && e.silo_address != me
                    && !e.has_missed_i_am_alives(now, allowed)
            })
            .map(|e| e.silo_address)
            .collect();
        info!(
            "validating connectivity to {} active silos before joining",
            targets.len()
        );

        let mut pings = JoinSet::new();
        for silo in &targets {
            let silo = *silo;
            let transport = Arc::clone(&self.transport);
            let probe_number = self.ping_counter.fetch_add(1, Ordering::Relaxed);
            let timeout = self.config.probe_response_timeout;
            pings.spawn(async move {
                match tokio::time::timeout(timeout, transport.ping(&silo, probe_number)).await {
                    Ok(result) => result,
                    Err(_) => Err(MembershipError::PingFailed {
                        target: silo,
                        reason: format!("no answer within {timeout:?}"),
                    }),
                }
            });
        }

        let mut failed = 0;
        while let Some(joined) = pings.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("join connectivity check: {e}");
                    failed += 1;
                }
                Err(e) => {
                    error!("join ping task failed: {e}");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            error!(
                "{failed} of {} active silos did not answer; silos that published IAmAlive within {:?} must be reachable before joining",
                targets.len(),
                allowed
            );
            return Err(MembershipError::ConnectivityCheckFailed {
                failed,
                total: targets.len(),
            });
        }
        Ok(())
    }

    /// One round of the suspicion protocol against `silo`.
    async fn try_to_suspect_or_kill(&self, silo: SiloAddress) -> Result<bool> {
        let me = self.my_address();
        let table = self.table.read_all().await?;
        if let Some((mine, _)) = table.get(&me) {
            if mine.status == SiloStatus::Dead {
                warn!("found my own row marked dead while suspecting {silo}");
                self.kill_myself_locally("my row is marked dead");
                return Ok(true);
            }
        }

        let Some((entry, etag)) = table.get(&silo).cloned() else {
            error!("cannot suspect {silo}: no row in the membership table");
            return Err(MembershipError::UnknownSilo(silo));
        };
        if entry.status == SiloStatus::Dead {
            if self.data.try_update_status_and_notify(&entry) {
                self.update_list_of_probed_silos()?;
            }
            return Ok(true);
        }

        let now = SystemTime::now();
        let votes_needed = self.config.num_votes_for_death_declaration;
        let fresh = entry.fresh_votes(now, self.config.death_vote_expiration_timeout);
        if fresh.len() >= votes_needed {
            let reason = format!(
                "{silo} has {} fresh votes (quorum {votes_needed}) but is not marked dead",
                fresh.len()
            );
            error!("membership protocol violation: {reason}");
            self.kill_myself_locally(&reason);
            return Err(MembershipError::Protocol(reason));
        }

        let active_silos = self.data.active_silo_count();
        let already_voted = fresh.iter().any(|(voter, _)| *voter == me);
        if should_declare_dead(fresh.len(), already_voted, votes_needed, active_silos) {
            info!(
                "declaring {silo} dead: {} fresh votes, already voted: {already_voted}, quorum {votes_needed}, {active_silos} active silos",
                fresh.len()
            );
            return self.declare_dead(entry, &etag, &table.version).await;
        }

        let mut entry = entry;
        entry.record_vote(me, now, votes_needed);
        info!(
            "voting to declare {silo} dead ({} fresh votes before mine)",
            fresh.len()
        );
        self.table.update_row(&entry, &etag, &table.version.next()).await
    }

    /// Writes `entry` as Dead, conditioned on `etag` and `version`.
    async fn declare_dead(&self, mut entry: MembershipEntry, etag: &str, version: &TableVersion) -> Result<bool> {
        let me = self.my_address();
        entry.add_suspector(me, SystemTime::now());
        entry.status = SiloStatus::Dead;
        if !self.table.update_row(&entry, etag, &version.next()).await? {
            info!(
                "lost write race declaring {} dead, will retry",
                entry.silo_address
            );
            return Ok(false);
        }

        debug!("marked {} dead in the membership table", entry.silo_address);
        if !entry.silo_address.is_same_endpoint(&me) && self.data.try_update_status_and_notify(&entry) {
            self.update_list_of_probed_silos()?;
        }
        self.gossip_to_others(entry.silo_address, SiloStatus::Dead);
        Ok(true)
    }

    // -- local view --

    async fn process_table_update(
        &self,
        table: &MembershipTableData,
        caller: &str,
        log_at_info: bool,
    ) -> Result<()> {
        if log_at_info {
            info!("membership table read ({caller}): {table}");
        } else {
            debug!("membership table read ({caller}): {table}");
        }

        // cleanup is retried on the next read
        if let Err(e) = self.cleanup_table_entries(table).await {
            debug!("cleanup of my earlier generations failed: {e}");
        }
        self.check_missed_i_am_alives(table);

        if !self.current_status().is_functional() {
            return Ok(());
        }
        let me = self.my_address();
        let mut changed = false;
        for entry in table.entries() {
            if !entry.silo_address.is_same_endpoint(&me) {
                changed |= self.data.try_update_status_and_notify(entry);
            }
        }
        if changed {
            self.update_list_of_probed_silos()?;
            info!(
                "local view changed ({caller}): {}",
                table.suppress_duplicate_deads()
            );
        }
        Ok(())
    }

    fn check_missed_i_am_alives(&self, table: &MembershipTableData) {
        let now = SystemTime::now();
        let allowed = self.config.allowed_i_am_alive_miss_period();
        for entry in table.entries() {
            if entry.silo_address == self.my_address() || entry.status != SiloStatus::Active {
                continue;
            }
            if entry.has_missed_i_am_alives(now, allowed) {
                warn!(
                    "{} has not updated its IAmAlive for more than {:?} (last at {})",
                    entry.silo_address,
                    allowed,
                    humantime::format_rfc3339_millis(entry.last_alive())
                );
            }
        }
    }

    /// Recomputes the watch list: the next `num_probed_silos` unsuspected
    /// functional silos after this one in hash order, plus every suspected
    /// silo passed on the way. Counters of silos that stay are kept.
    fn update_list_of_probed_silos(&self) -> Result<()> {
        if !self.current_status().is_functional() {
            return Ok(());
        }
        let me = self.my_address();
        let mut ring: Vec<SiloAddress> = self
            .data
            .approximate_statuses(false)
            .into_iter()
            .filter(|(_, status)| status.is_functional())
            .map(|(silo, _)| silo)
            .collect();
        ring.sort_by_key(|silo| (silo.consistent_hash(), *silo));

        let Some(my_index) = ring.iter().position(|silo| *silo == me) else {
            let reason = format!("{me} is missing from its own list of functional silos");
            error!("membership protocol violation: {reason}");
            self.kill_myself_locally(&reason);
            return Err(MembershipError::Protocol(reason));
        };

        let now = SystemTime::now();
        let expiration = self.config.death_vote_expiration_timeout;
        let mut watched = Vec::new();
        let mut suspected = Vec::new();
        for i in 0..ring.len().saturating_sub(1) {
            if watched.len() >= self.config.num_probed_silos {
                break;
            }
            let candidate = ring[(my_index + i + 1) % ring.len()];
            let is_suspected = self
                .data
                .local_entry(&candidate)
                .is_some_and(|entry| !entry.fresh_votes(now, expiration).is_empty());
            if is_suspected {
                suspected.push(candidate);
            } else {
                watched.push(candidate);
            }
        }

        let mut probed = self.probed.lock();
        let next: HashMap<SiloAddress, u32> = watched
            .into_iter()
            .chain(suspected)
            .map(|silo| (silo, probed.get(&silo).copied().unwrap_or(0)))
            .collect();
        let old_keys: HashSet<_> = probed.keys().collect();
        let new_keys: HashSet<_> = next.keys().collect();
        if old_keys != new_keys {
            let list: Vec<String> = next.keys().map(ToString::to_string).collect();
            info!("will watch {} silos: [{}]", next.len(), list.join(", "));
        }
        *probed = next;
        Ok(())
    }

    /// Tells every other Active silo about a status change. Fire and
    /// forget: failures are logged.
    fn gossip_to_others(&self, silo: SiloAddress, status: SiloStatus) {
        if !self.config.use_liveness_gossip {
            return;
        }
        let me = self.my_address();
        let targets: Vec<SiloAddress> = self
            .data
            .approximate_statuses(true)
            .into_keys()
            .filter(|target| *target != me)
            .collect();
        for target in targets {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                trace!("gossiping {silo} -> {status} to {target}");
                if let Err(e) = transport.send_status_notification(&target, &silo, status).await {
                    warn!("gossip to {target} about {silo} failed: {e}");
                }
            });
        }
    }

    fn kill_myself_locally(&self, reason: &str) {
        error!("{} is dead, stopping: {reason}", self.my_address());
        self.dispose_timers();
        self.data.update_my_status_local(SiloStatus::Dead);
        self.terminated.send_replace(true);
    }

    async fn detect_node_migration(&self) -> Result<()> {
        let table = self.table.read_all().await?;
        self.check_missed_i_am_alives(&table);

        let me = self.my_address();
        let name = &self.identity.silo_name;
        let previous = table
            .entries()
            .filter(|e| e.silo_name == *name && e.silo_address.generation() < me.generation())
            .max_by_key(|e| e.silo_address.generation());
        let Some(previous) = previous else {
            return Ok(());
        };

        let host = &self.identity.host_name;
        if previous.host_name != *host || !previous.silo_address.is_same_endpoint(&me) {
            warn!(
                "silo {name} migrated from host {} ({}) to host {host} ({me})",
                previous.host_name, previous.silo_address
            );
        } else {
            warn!(
                "silo {name} restarted on host {host}: new address {me}, previous {}",
                previous.silo_address
            );
        }
        Ok(())
    }
}

fn random_offset(rng: &mut impl Rng, period: Duration) -> Duration {
    Duration::from_millis(rng.random_range(0..=period.as_millis() as u64))
}
