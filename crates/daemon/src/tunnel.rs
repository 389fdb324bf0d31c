// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Tunnel Module
// Spawns, supervises and tears down one ssh forward per remote port

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_dash_common::network::MIN_USER_PORT;
use tunnel_dash_common::{
    ForwardLauncher, HostKeyPolicy, TunnelError, TunnelEvent, TunnelInfo, TunnelState,
};

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(500);
pub const DEFAULT_START_PORT: u16 = 9000;

/// Upper bound on how long close waits for a supervisor to reap its process
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for stderr to drain after the process exited
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_STDERR_BYTES: usize = 4096;

/// Write-once notification that a forward died on its own.
///
/// Once fired it stays fired; `is_fired` never blocks.
#[derive(Clone)]
pub struct FailureSignal {
    tx: Arc<watch::Sender<Option<Arc<str>>>>,
}

impl FailureSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record the failure. Returns false if it had already been recorded.
    pub fn fire(&self, reason: impl Into<Arc<str>>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<Arc<str>> {
        (*self.tx.borrow()).clone()
    }

    /// Resolve once the signal fires
    pub async fn fired(&self) -> Arc<str> {
        let mut rx = self.tx.subscribe();
        loop {
            let current = (*rx.borrow_and_update()).clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for FailureSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One live forward. Dropping it cancels the forward.
struct Tunnel {
    local_port: u16,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    failure: FailureSignal,
    /// Owns the child process
    supervisor: JoinHandle<()>,
}

impl Tunnel {
    fn is_healthy(&self) -> bool {
        !self.failure.is_fired() && !self.supervisor.is_finished()
    }

    fn info(&self, remote_port: u16) -> TunnelInfo {
        let failure = self.failure.reason().map(|r| r.to_string());
        let state = if self.is_healthy() {
            TunnelState::Active
        } else {
            TunnelState::Failed
        };

        TunnelInfo {
            remote_port,
            local_port: self.local_port,
            state,
            created_at: self.created_at,
            failure,
        }
    }

    /// Cancel and wait (bounded) for the supervisor to reap the process
    async fn shutdown(mut self, remote_port: u16) {
        self.cancel.cancel();
        if tokio::time::timeout(REAP_TIMEOUT, &mut self.supervisor)
            .await
            .is_err()
        {
            warn!(
                "Forward for remote port {} did not stop within {:?}",
                remote_port, REAP_TIMEOUT
            );
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_port", &self.local_port)
            .field("created_at", &self.created_at)
            .field("failed", &self.failure.is_fired())
            .finish()
    }
}

/// Tunnels keyed by remote port, plus the allocator. Guarded by one lock.
#[derive(Debug)]
struct TunnelTable {
    tunnels: HashMap<u16, Tunnel>,
    /// Wider than u16 so running past 65535 is detectable
    next_port: u32,
    policy: HostKeyPolicy,
}

impl TunnelTable {
    fn is_claimed(&self, local_port: u16) -> bool {
        self.tunnels.values().any(|t| t.local_port == local_port)
    }

    /// Pick a local port: the remote port itself when usable, else the allocator's next free value
    fn allocate(&mut self, remote_port: u16) -> Result<u16, TunnelError> {
        if remote_port >= MIN_USER_PORT && !self.is_claimed(remote_port) {
            return Ok(remote_port);
        }

        loop {
            let candidate = u16::try_from(self.next_port)
                .map_err(|_| TunnelError::PortsExhausted { remote_port })?;
            self.next_port += 1;

            if !self.is_claimed(candidate) {
                return Ok(candidate);
            }
            debug!("Local port {} already claimed, skipping", candidate);
        }
    }
}

/// Construction parameters for [`TunnelManager`]
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    /// First value handed out by the allocator
    pub start_port: u16,
    /// How long a new forward must survive before it is accepted
    pub grace_window: Duration,
    pub policy: HostKeyPolicy,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            start_port: DEFAULT_START_PORT,
            grace_window: DEFAULT_GRACE_WINDOW,
            policy: HostKeyPolicy::default(),
        }
    }
}

/// Owns every forward and the remote-to-local port mapping
#[derive(Clone)]
pub struct TunnelManager {
    table: Arc<Mutex<TunnelTable>>,
    launcher: Arc<dyn ForwardLauncher>,
    grace_window: Duration,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelManager {
    pub fn new(launcher: Arc<dyn ForwardLauncher>, settings: TunnelSettings) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            table: Arc::new(Mutex::new(TunnelTable {
                tunnels: HashMap::new(),
                next_port: u32::from(settings.start_port),
                policy: settings.policy,
            })),
            launcher,
            grace_window: settings.grace_window,
            event_tx,
        }
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    /// Change host key checking for forwards created from now on
    pub async fn set_host_key_policy(&self, policy: HostKeyPolicy) {
        self.table.lock().await.policy = policy;
    }

    pub async fn host_key_policy(&self) -> HostKeyPolicy {
        self.table.lock().await.policy
    }

    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Ensure a healthy forward exists for `remote_port` and return its local port.
    ///
    /// Idempotent while the forward stays healthy. A forward that dies within
    /// the grace window is reported as [`TunnelError::FailedImmediately`] and
    /// leaves nothing behind; later deaths only show up in [`Self::health_check`].
    pub async fn create_tunnel(&self, remote_port: u16) -> Result<u16, TunnelError> {
        if remote_port == 0 {
            return Err(TunnelError::InvalidPort(remote_port));
        }

        let mut table = self.table.lock().await;

        if let Some(existing) = table.tunnels.get(&remote_port) {
            if existing.is_healthy() {
                debug!(
                    "Tunnel for remote port {} already active on local port {}",
                    remote_port, existing.local_port
                );
                return Ok(existing.local_port);
            }

            info!("Replacing failed tunnel for remote port {}", remote_port);
            table.tunnels.remove(&remote_port);
        }

        let local_port = table.allocate(remote_port)?;
        let mut child = self
            .launcher
            .forward_command(table.policy, local_port, remote_port)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                remote_port,
                source,
            })?;

        debug!(
            "Spawned forward localhost:{} -> remote:{} (pid {:?})",
            local_port,
            remote_port,
            child.id()
        );

        let stderr = child.stderr.take().map(|s| tokio::spawn(drain_stderr(s)));
        let cancel = CancellationToken::new();
        let failure = FailureSignal::new();
        let supervisor = tokio::spawn(supervise(
            Forward {
                remote_port,
                local_port,
                child,
                stderr,
            },
            cancel.clone(),
            failure.clone(),
            self.event_tx.clone(),
        ));

        let tunnel = Tunnel {
            local_port,
            created_at: Utc::now(),
            cancel,
            failure,
            supervisor,
        };

        self.emit(TunnelEvent::Starting {
            remote_port,
            local_port,
        });

        let early_failure = tokio::select! {
            reason = tunnel.failure.fired() => Some(reason),
            _ = tokio::time::sleep(self.grace_window) => None,
        };

        if let Some(cause) = early_failure {
            tunnel.shutdown(remote_port).await;
            return Err(TunnelError::FailedImmediately {
                remote_port,
                cause: cause.to_string(),
            });
        }

        table.tunnels.insert(remote_port, tunnel);
        drop(table);

        info!(
            "Tunnel active: localhost:{} -> remote:{}",
            local_port, remote_port
        );
        self.emit(TunnelEvent::Active {
            remote_port,
            local_port,
        });

        Ok(local_port)
    }

    /// Stop the forward for `remote_port`. Returns false if there was none.
    ///
    /// The process is reaped before the lock is released, so the freed local
    /// port is not handed out while the old forward may still hold it.
    pub async fn close_tunnel(&self, remote_port: u16) -> bool {
        let mut table = self.table.lock().await;
        let Some(tunnel) = table.tunnels.remove(&remote_port) else {
            return false;
        };

        tunnel.shutdown(remote_port).await;
        drop(table);

        info!("Tunnel closed for remote port {}", remote_port);
        self.emit(TunnelEvent::Closed { remote_port });
        true
    }

    /// Stop every forward. Safe to call repeatedly.
    pub async fn close_all(&self) {
        let mut table = self.table.lock().await;
        let drained: Vec<(u16, Tunnel)> = table.tunnels.drain().collect();
        if drained.is_empty() {
            return;
        }

        // Cancel all first so the reaps overlap
        for (_, tunnel) in &drained {
            tunnel.cancel.cancel();
        }
        let mut closed = Vec::with_capacity(drained.len());
        for (remote_port, tunnel) in drained {
            tunnel.shutdown(remote_port).await;
            closed.push(remote_port);
        }
        drop(table);

        for &remote_port in &closed {
            self.emit(TunnelEvent::Closed { remote_port });
        }
        info!("Closed {} tunnel(s)", closed.len());
    }

    pub async fn local_port(&self, remote_port: u16) -> Option<u16> {
        let table = self.table.lock().await;
        table.tunnels.get(&remote_port).map(|t| t.local_port)
    }

    /// Process-level health only: true while the forward has not died
    pub async fn health_check(&self, remote_port: u16) -> bool {
        let table = self.table.lock().await;
        table
            .tunnels
            .get(&remote_port)
            .is_some_and(|t| !t.failure.is_fired())
    }

    /// Snapshot of every tunnel, sorted by remote port
    pub async fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let table = self.table.lock().await;
        let mut infos: Vec<TunnelInfo> = table
            .tunnels
            .iter()
            .map(|(remote_port, t)| t.info(*remote_port))
            .collect();
        infos.sort_by_key(|i| i.remote_port);
        infos
    }

    /// Remote port to local port for every tunnel
    pub async fn port_map(&self) -> HashMap<u16, u16> {
        let table = self.table.lock().await;
        table
            .tunnels
            .iter()
            .map(|(remote, t)| (*remote, t.local_port))
            .collect()
    }
}

/// Everything the supervisor takes ownership of
struct Forward {
    remote_port: u16,
    local_port: u16,
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

/// Wait for the process to exit or for cancellation.
///
/// Cancellation kills and reaps quietly. Any other exit, including status 0,
/// fires the failure signal.
async fn supervise(
    mut forward: Forward,
    cancel: CancellationToken,
    failure: FailureSignal,
    events: broadcast::Sender<TunnelEvent>,
) {
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = forward.child.wait() => Some(status),
    };

    let Some(status) = status else {
        if let Err(e) = forward.child.kill().await {
            debug!(
                "Kill of forward for remote port {} failed: {}",
                forward.remote_port, e
            );
        }
        if let Some(stderr) = forward.stderr {
            stderr.abort();
        }
        debug!("Forward for remote port {} stopped", forward.remote_port);
        return;
    };

    let stderr = match forward.stderr {
        Some(handle) => tokio::time::timeout(STDERR_FLUSH_TIMEOUT, handle)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default(),
        None => String::new(),
    };

    let reason = match status {
        Ok(status) if stderr.is_empty() => format!("forward exited ({})", status),
        Ok(status) => format!("forward exited ({}): {}", status, stderr),
        Err(e) => format!("failed to wait for forward: {}", e),
    };

    if failure.fire(reason.as_str()) {
        warn!(
            "Tunnel for remote port {} failed: {}",
            forward.remote_port, reason
        );
        let _ = events.send(TunnelEvent::Failed {
            remote_port: forward.remote_port,
            local_port: forward.local_port,
            reason,
        });
    }
}

/// Keep the first few KiB of stderr while draining the rest
async fn drain_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }

    String::from_utf8_lossy(&kept).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::process::Command;

    type Script = Box<dyn Fn(u16, u16) -> String + Send + Sync>;

    /// Runs a shell script in place of ssh
    struct ScriptLauncher {
        script: Script,
        spawns: AtomicUsize,
        policies: StdMutex<Vec<HostKeyPolicy>>,
    }

    impl ScriptLauncher {
        fn new(script: impl Fn(u16, u16) -> String + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                spawns: AtomicUsize::new(0),
                policies: StdMutex::new(Vec::new()),
            })
        }

        fn resident() -> Arc<Self> {
            Self::new(|_, _| "exec sleep 30".to_string())
        }

        fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        /// Host key policy passed to each spawn, in order
        fn policies(&self) -> Vec<HostKeyPolicy> {
            self.policies.lock().unwrap().clone()
        }
    }

    impl ForwardLauncher for ScriptLauncher {
        fn forward_command(&self, policy: HostKeyPolicy, local_port: u16, remote_port: u16) -> Command {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.policies.lock().unwrap().push(policy);
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg((self.script)(local_port, remote_port))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            cmd
        }
    }

    /// Always fails to spawn
    struct MissingBinary;

    impl ForwardLauncher for MissingBinary {
        fn forward_command(&self, _: HostKeyPolicy, _: u16, _: u16) -> Command {
            Command::new("/nonexistent/tunnel-dash-ssh")
        }
    }

    fn manager(launcher: Arc<dyn ForwardLauncher>, start_port: u16) -> TunnelManager {
        TunnelManager::new(
            launcher,
            TunnelSettings {
                start_port,
                grace_window: Duration::from_millis(250),
                policy: HostKeyPolicy::Strict,
            },
        )
    }

    async fn wait_until_unhealthy(mgr: &TunnelManager, remote_port: u16) {
        for _ in 0..100 {
            if !mgr.health_check(remote_port).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("tunnel for {} never became unhealthy", remote_port);
    }

    #[test]
    fn test_failure_signal_is_write_once() {
        let signal = FailureSignal::new();
        assert!(!signal.is_fired());

        assert!(signal.fire("first"));
        assert!(!signal.fire("second"));
        assert!(signal.is_fired());
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_failure_signal_wakes_waiter() {
        let signal = FailureSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.fired().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire("boom");
        assert_eq!(&*waiter.await.unwrap(), "boom");

        // Already fired resolves immediately
        assert_eq!(&*signal.fired().await, "boom");
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let launcher = ScriptLauncher::resident();
        let mgr = manager(launcher.clone(), 9000);

        let first = mgr.create_tunnel(3000).await.unwrap();
        let second = mgr.create_tunnel(3000).await.unwrap();

        assert_eq!(first, 3000);
        assert_eq!(first, second);
        assert_eq!(launcher.spawns(), 1);
        assert!(mgr.health_check(3000).await);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_immediate_failure_leaves_no_entry() {
        let launcher = ScriptLauncher::new(|_, _| {
            "echo 'bind [127.0.0.1]:80: Permission denied' >&2; exit 255".to_string()
        });
        let mgr = manager(launcher, 9000);

        let err = mgr.create_tunnel(80).await.unwrap_err();
        match &err {
            TunnelError::FailedImmediately { remote_port, cause } => {
                assert_eq!(*remote_port, 80);
                assert!(cause.contains("Permission denied"), "cause was {}", cause);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(mgr.local_port(80).await, None);
        assert!(!mgr.health_check(80).await);
        assert!(mgr.list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_clean_exit_counts_as_failure() {
        let mgr = manager(ScriptLauncher::new(|_, _| "exit 0".to_string()), 9000);

        let err = mgr.create_tunnel(3000).await.unwrap_err();
        assert!(matches!(err, TunnelError::FailedImmediately { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let mgr = manager(Arc::new(MissingBinary), 9000);

        let err = mgr.create_tunnel(3000).await.unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { remote_port: 3000, .. }));
        assert_eq!(mgr.local_port(3000).await, None);
    }

    #[tokio::test]
    async fn test_zero_port_rejected() {
        let mgr = manager(ScriptLauncher::resident(), 9000);
        assert!(matches!(
            mgr.create_tunnel(0).await,
            Err(TunnelError::InvalidPort(0))
        ));
    }

    #[tokio::test]
    async fn test_privileged_ports_use_allocator() {
        let mgr = manager(ScriptLauncher::resident(), 9000);

        assert_eq!(mgr.create_tunnel(22).await.unwrap(), 9000);
        assert_eq!(mgr.create_tunnel(443).await.unwrap(), 9001);
        assert_eq!(mgr.create_tunnel(1023).await.unwrap(), 9002);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_matching_ports_preserved() {
        let mgr = manager(ScriptLauncher::resident(), 9000);

        assert_eq!(mgr.create_tunnel(3000).await.unwrap(), 3000);
        assert_eq!(mgr.create_tunnel(9000).await.unwrap(), 9000);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_claimed_port_falls_back_to_allocator() {
        let mgr = manager(ScriptLauncher::resident(), 9000);

        // Remote 80 takes the allocator's 9000, so remote 9000 cannot keep its number
        assert_eq!(mgr.create_tunnel(3000).await.unwrap(), 3000);
        assert_eq!(mgr.create_tunnel(80).await.unwrap(), 9000);
        assert_eq!(mgr.create_tunnel(9000).await.unwrap(), 9001);
        assert_eq!(mgr.create_tunnel(81).await.unwrap(), 9002);

        let ports = mgr.port_map().await;
        assert_eq!(ports.len(), 4);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_allocator_skips_reused_remote_port() {
        let mgr = manager(ScriptLauncher::resident(), 9000);

        assert_eq!(mgr.create_tunnel(9000).await.unwrap(), 9000);
        // Allocator would hand out 9000, which is taken
        assert_eq!(mgr.create_tunnel(22).await.unwrap(), 9001);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_allocator_exhaustion() {
        let mgr = manager(ScriptLauncher::resident(), 65535);

        assert_eq!(mgr.create_tunnel(80).await.unwrap(), 65535);
        let err = mgr.create_tunnel(81).await.unwrap_err();
        assert!(matches!(err, TunnelError::PortsExhausted { remote_port: 81 }));

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_ports() {
        let launcher = ScriptLauncher::resident();
        let mgr = manager(launcher.clone(), 20000);

        let handles: Vec<_> = (1..=8u16)
            .map(|p| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.create_tunnel(p).await })
            })
            .collect();

        let mut locals = Vec::new();
        for h in handles {
            locals.push(h.await.unwrap().unwrap());
        }

        let mut deduped = locals.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), locals.len());
        assert_eq!(launcher.spawns(), 8);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_close_all_clears_lookups() {
        let mgr = manager(ScriptLauncher::resident(), 9000);

        for port in [3000, 3001, 80] {
            mgr.create_tunnel(port).await.unwrap();
        }

        mgr.close_all().await;

        for port in [3000, 3001, 80] {
            assert_eq!(mgr.local_port(port).await, None);
            assert!(!mgr.health_check(port).await);
        }

        // Idempotent
        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_close_tunnel_unknown_is_noop() {
        let mgr = manager(ScriptLauncher::resident(), 9000);
        assert!(!mgr.close_tunnel(4242).await);

        mgr.create_tunnel(4242).await.unwrap();
        assert!(mgr.close_tunnel(4242).await);
        assert_eq!(mgr.local_port(4242).await, None);
    }

    #[tokio::test]
    async fn test_recreate_after_external_kill() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().to_path_buf();
        let launcher = ScriptLauncher::new(move |_, remote| {
            format!("echo $$ > {}/{}.pid; exec sleep 30", pid_dir.display(), remote)
        });
        let mgr = manager(launcher.clone(), 9000);

        let local = mgr.create_tunnel(3000).await.unwrap();
        assert!(mgr.health_check(3000).await);

        let pid_file = dir.path().join("3000.pid");
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let status = std::process::Command::new("kill")
            .arg("-9")
            .arg(pid.trim())
            .status()
            .unwrap();
        assert!(status.success());

        wait_until_unhealthy(&mgr, 3000).await;

        let infos = mgr.list_tunnels().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].state, TunnelState::Failed);
        assert!(infos[0].failure.is_some());

        let recreated = mgr.create_tunnel(3000).await.unwrap();
        assert_eq!(recreated, local);
        assert_eq!(launcher.spawns(), 2);
        assert!(mgr.health_check(3000).await);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_late_failure_is_broadcast() {
        let mgr = manager(ScriptLauncher::new(|_, _| "sleep 0.3; exit 3".to_string()), 9000);
        let mut events = mgr.subscribe();

        mgr.create_tunnel(3000).await.unwrap();
        wait_until_unhealthy(&mgr, 3000).await;

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if let TunnelEvent::Failed { remote_port, reason, .. } = event {
                assert_eq!(remote_port, 3000);
                assert!(reason.contains("exit status: 3"), "reason was {}", reason);
                saw_failed = true;
            }
        }
        assert!(saw_failed);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_policy_applies_to_new_forwards_only() {
        let launcher = ScriptLauncher::resident();
        let mgr = manager(launcher.clone(), 9000);
        assert_eq!(mgr.host_key_policy().await, HostKeyPolicy::Strict);

        mgr.create_tunnel(3000).await.unwrap();
        mgr.set_host_key_policy(HostKeyPolicy::Disabled).await;
        assert_eq!(mgr.host_key_policy().await, HostKeyPolicy::Disabled);
        mgr.create_tunnel(3001).await.unwrap();

        assert_eq!(
            launcher.policies(),
            vec![HostKeyPolicy::Strict, HostKeyPolicy::Disabled]
        );
        // The first forward keeps running under the policy it started with
        assert!(mgr.health_check(3000).await);
        assert_eq!(launcher.spawns(), 2);

        mgr.close_all().await;
    }

    #[tokio::test]
    async fn test_reopen_after_close_waits_for_old_forward() {
        let dir = tempfile::tempdir().unwrap();
        let pids = dir.path().join("pids");
        // Refuses to start while an earlier forward is still alive, like a second bind would
        let launcher = ScriptLauncher::new(move |_, _| {
            format!(
                "for p in $(cat {pids} 2>/dev/null); do \
                   if kill -0 $p 2>/dev/null; then echo 'bind: Address already in use' >&2; exit 255; fi; \
                 done; \
                 echo $$ >> {pids}; exec sleep 30",
                pids = pids.display()
            )
        });
        let mgr = manager(launcher.clone(), 9000);

        assert_eq!(mgr.create_tunnel(3000).await.unwrap(), 3000);

        let closer = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.close_tunnel(3000).await })
        };
        // Let the close start reaping before the reopen
        tokio::task::yield_now().await;

        assert_eq!(mgr.create_tunnel(3000).await.unwrap(), 3000);
        assert!(closer.await.unwrap());
        assert_eq!(launcher.spawns(), 2);
        assert!(mgr.health_check(3000).await);

        mgr.close_all().await;
    }
}
