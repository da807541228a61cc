//! Test helpers for spawning silo-server processes and inspecting the
//! membership table they share.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output};
use std::time::Duration;

use silo_membership::{
    MembershipEntry, MembershipTable, RemoteMembershipTable, SiloAddress, SiloStatus,
};

/// Protocol timers short enough for a test to watch a failure play out.
const FAST_MEMBERSHIP: &str = r#"
[membership]
expected_cluster_size = 3
max_join_attempt_time = "20s"
table_refresh_timeout = "500ms"
probe_timeout = "200ms"
probe_response_timeout = "150ms"
num_probed_silos = 3
num_missed_probes_limit = 2
num_votes_for_death_declaration = 2
death_vote_expiration_timeout = "30s"
i_am_alive_table_publish_timeout = "1s"
max_startup_delay = "0s"
connection_retry_delay = "50ms"
"#;

/// A silo-server subprocess managed by the test harness.
pub struct TestSilo {
    child: Child,
    pub address: SiloAddress,
    /// Where this silo serves its table, if it hosts one.
    pub table_addr: Option<SocketAddr>,
    _dir: tempfile::TempDir,
}

/// Options for starting a test silo.
#[derive(Default)]
pub struct SiloOptions {
    pub generation: i32,
    /// Host the table in this process and serve it to others.
    pub host_table: bool,
    /// Keep the hosted table in this file instead of in memory.
    pub table_file: Option<PathBuf>,
    /// Join the cluster whose table is served at this address.
    pub remote_table: Option<SocketAddr>,
}

impl TestSilo {
    /// Starts the silo that hosts the cluster's table.
    pub fn host(generation: i32) -> Self {
        Self::start_with(SiloOptions {
            generation,
            host_table: true,
            ..Default::default()
        })
    }

    /// Starts a silo that joins through `table`.
    pub fn joiner(table: SocketAddr, generation: i32) -> Self {
        Self::start_with(SiloOptions {
            generation,
            remote_table: Some(table),
            ..Default::default()
        })
    }

    /// Spawns the process. Returns as soon as it is running; use
    /// [`wait_for_status`] to know when it has joined.
    pub fn start_with(opts: SiloOptions) -> Self {
        let port = free_udp_port();
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("silo.toml");

        let mut toml = format!(
            "bind = \"127.0.0.1\"\nport = {port}\ngeneration = {}\ndeployment_id = \"it\"\n",
            opts.generation.max(1)
        );
        let table_addr = if opts.host_table {
            let table_port = free_tcp_port();
            toml.push_str(&format!("table_service_port = {table_port}\n"));
            Some(SocketAddr::from(([127, 0, 0, 1], table_port)))
        } else {
            None
        };
        toml.push_str(FAST_MEMBERSHIP);
        if let Some(addr) = opts.remote_table {
            toml.push_str(&format!("\n[table]\nkind = \"remote\"\naddr = \"{addr}\"\n"));
        } else if let Some(ref path) = opts.table_file {
            toml.push_str(&format!(
                "\n[table]\nkind = \"file\"\npath = \"{}\"\n",
                path.display()
            ));
        }
        std::fs::write(&config, toml).unwrap();

        let binary = server_binary();
        let child = Command::new(&binary)
            .arg("--config")
            .arg(&config)
            // suppress tracing output in tests
            .env("RUST_LOG", "error")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn silo-server at {}: {e}", binary.display()));

        let address = SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], port)), opts.generation.max(1));
        Self {
            child,
            address,
            table_addr,
            _dir: dir,
        }
    }

    /// Kills the process without letting it leave the cluster.
    pub fn crash(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// True while the process has not exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for TestSilo {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A client of a table served by a test silo.
pub fn table_client(addr: SocketAddr) -> RemoteMembershipTable {
    RemoteMembershipTable::new(addr, Duration::from_secs(2))
}

/// Reads `silo`'s row, treating connection failures as "not there yet".
pub async fn read_entry(table: &dyn MembershipTable, silo: &SiloAddress) -> Option<MembershipEntry> {
    let data = table.read_row(silo).await.ok()?;
    data.get(silo).map(|(entry, _)| entry.clone())
}

/// Polls the table until `silo` reaches `status`, or panics after `within`.
pub async fn wait_for_status(
    table: &dyn MembershipTable,
    silo: &SiloAddress,
    status: SiloStatus,
    within: Duration,
) -> MembershipEntry {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let entry = read_entry(table, silo).await;
        if let Some(ref e) = entry {
            if e.status == status {
                return e.clone();
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "{silo} did not reach {status} within {within:?}, last seen {:?}",
                entry.map(|e| e.status)
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Runs the server binary with `args` and returns its output.
pub fn run_server(args: &[&str]) -> Output {
    Command::new(server_binary())
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to run silo-server")
}

/// Writes `text` to a config file inside `dir`.
pub fn write_config(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("silo.toml");
    std::fs::write(&path, text).unwrap();
    path
}

fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Locates the silo-server binary in the cargo target directory.
fn server_binary() -> PathBuf {
    // test binary is in target/<profile>/deps/, the server one level up
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("silo-server{}", std::env::consts::EXE_SUFFIX));
    if !path.exists() {
        panic!(
            "silo-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
