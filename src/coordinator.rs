use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::{
    callback::CallbackServer,
    error::Result,
    store::{names, CredentialStore, Lockfile},
};

/// A lockfile older than this is stale regardless of its process state.
const LOCKFILE_TTL: Duration = Duration::from_secs(30 * 60);

/// How long a secondary keeps retrying an unresponsive leader before it
/// deletes the lockfile and takes over.
const LEADER_WAIT_CEILING: Duration = Duration::from_secs(30 * 60);

/// Hard bound on the sibling health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of leader election for one fingerprint.
pub struct Coordination {
    /// The leader's callback server, or a placeholder listener on an
    /// ephemeral port for a secondary (it satisfies the lifecycle contract
    /// but is never asked for a code).
    pub server: Arc<CallbackServer>,
    /// True for secondaries: the browser flow belongs to the leader and
    /// tokens are read from disk.
    pub skip_browser_auth: bool,
    /// Present only on the leader; removing the lockfile is the holder's
    /// job on every exit path.
    pub lockfile: Option<LockfileGuard>,
}

impl Coordination {
    /// Close the callback server and release the lockfile. Safe to call on
    /// every exit path; the signal handler and the fatal-error path both
    /// funnel through here.
    pub fn cleanup(&self) {
        self.server.shutdown();
        if let Some(guard) = &self.lockfile {
            guard.release();
        }
    }
}

/// Deletes the fingerprint's lockfile exactly once, either explicitly from
/// the signal handler or implicitly on drop when the process unwinds.
pub struct LockfileGuard {
    store: CredentialStore,
    fingerprint: String,
    released: AtomicBool,
}

impl LockfileGuard {
    fn new(store: CredentialStore, fingerprint: String) -> Self {
        Self {
            store,
            fingerprint,
            released: AtomicBool::new(false),
        }
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.store.delete(&self.fingerprint, names::LOCK) {
                warn!("failed to remove lockfile: {e}");
            }
        }
    }
}

impl Drop for LockfileGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Elect a leader for `fingerprint`, or wait for the existing one.
///
/// Windows always takes the leader path: the process-existence probe is
/// unreliable there, so an existing lockfile is never trusted.
pub async fn acquire(
    store: &CredentialStore,
    fingerprint: &str,
    preferred_port: u16,
    callback_path: &str,
    auth_timeout: Duration,
) -> Result<Coordination> {
    if !cfg!(windows) {
        if let Some(lockfile) = store.get_json::<Lockfile>(fingerprint, names::LOCK)? {
            if lockfile_valid(&lockfile).await {
                info!(
                    "another instance (pid {}) is authorizing on port {}; waiting",
                    lockfile.pid, lockfile.port
                );
                if wait_for_leader(lockfile.port).await {
                    let placeholder =
                        CallbackServer::bind(0, callback_path, auth_timeout).await?;
                    return Ok(Coordination {
                        server: Arc::new(placeholder),
                        skip_browser_auth: true,
                        lockfile: None,
                    });
                }
                warn!("existing lockfile holder stopped responding; taking over");
                store.delete(fingerprint, names::LOCK)?;
            } else {
                debug!("removing invalid lockfile for {fingerprint}");
                store.delete(fingerprint, names::LOCK)?;
            }
        }
    }

    become_leader(store, fingerprint, preferred_port, callback_path, auth_timeout).await
}

async fn become_leader(
    store: &CredentialStore,
    fingerprint: &str,
    preferred_port: u16,
    callback_path: &str,
    auth_timeout: Duration,
) -> Result<Coordination> {
    let server = CallbackServer::bind(preferred_port, callback_path, auth_timeout).await?;
    let lockfile = Lockfile {
        pid: std::process::id(),
        port: server.port(),
        timestamp: now_ms(),
    };
    store.put_json(fingerprint, names::LOCK, &lockfile)?;
    info!(
        "elected leader for {fingerprint} (pid {}, callback port {})",
        lockfile.pid, lockfile.port
    );

    Ok(Coordination {
        server: Arc::new(server),
        skip_browser_auth: false,
        lockfile: Some(LockfileGuard::new(store.clone(), fingerprint.to_string())),
    })
}

/// A lockfile is valid iff it is younger than 30 minutes, its process still
/// exists, and its callback server answers the health probe.
pub async fn lockfile_valid(lockfile: &Lockfile) -> bool {
    let age_ms = now_ms().saturating_sub(lockfile.timestamp);
    if age_ms >= LOCKFILE_TTL.as_millis() as u64 {
        debug!("lockfile is {age_ms} ms old, past the TTL");
        return false;
    }
    if !process_exists(lockfile.pid) {
        debug!("lockfile process {} is gone", lockfile.pid);
        return false;
    }
    matches!(
        probe_leader(lockfile.port).await,
        Some(StatusCode::OK | StatusCode::ACCEPTED)
    )
}

/// Signal-0 probe for process existence.
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// One bounded `GET /wait-for-auth?poll=false` against a sibling. Loopback
/// traffic never goes through an environment proxy.
async fn probe_leader(port: u16) -> Option<StatusCode> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()
        .ok()?;
    client
        .get(format!("http://127.0.0.1:{port}/wait-for-auth?poll=false"))
        .send()
        .await
        .map(|r| r.status())
        .ok()
}

/// Long-poll the leader until it reports completion. Returns false once the
/// leader has been unresponsive past the ceiling. A leader that keeps
/// answering 202 is making progress and we keep waiting.
async fn wait_for_leader(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/wait-for-auth");
    let Ok(client) = reqwest::Client::builder().no_proxy().build() else {
        return false;
    };
    let started = Instant::now();

    loop {
        match client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => return true,
            Ok(response) if response.status() == StatusCode::ACCEPTED => {
                debug!("leader still authorizing; continuing to wait");
            }
            other => {
                if started.elapsed() >= LEADER_WAIT_CEILING {
                    return false;
                }
                debug!("leader probe failed ({other:?}); retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{DEFAULT_AUTH_TIMEOUT, DEFAULT_CALLBACK_PATH};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stale_lockfile_is_invalid() {
        let lockfile = Lockfile {
            pid: std::process::id(),
            port: 1,
            timestamp: now_ms() - LOCKFILE_TTL.as_millis() as u64 - 1,
        };
        assert!(!lockfile_valid(&lockfile).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_process_is_invalid() {
        // PID far above any default pid_max.
        let lockfile = Lockfile {
            pid: 4_000_000,
            port: 1,
            timestamp: now_ms(),
        };
        assert!(!lockfile_valid(&lockfile).await);
    }

    #[tokio::test]
    async fn test_live_leader_is_valid() {
        let server = CallbackServer::bind(0, DEFAULT_CALLBACK_PATH, DEFAULT_AUTH_TIMEOUT)
            .await
            .unwrap();
        let lockfile = Lockfile {
            pid: std::process::id(),
            port: server.port(),
            timestamp: now_ms(),
        };
        assert!(lockfile_valid(&lockfile).await);
    }

    #[tokio::test]
    async fn test_unbound_port_is_invalid() {
        // Bind then drop to find a port nothing is listening on.
        let port = {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let lockfile = Lockfile {
            pid: std::process::id(),
            port,
            timestamp: now_ms(),
        };
        assert!(!lockfile_valid(&lockfile).await);
    }

    #[tokio::test]
    async fn test_leader_writes_and_guard_removes_lockfile() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::at(tmp.path().to_path_buf());
        let fp = "feedface";

        let coordination = acquire(&store, fp, 0, DEFAULT_CALLBACK_PATH, DEFAULT_AUTH_TIMEOUT)
            .await
            .unwrap();
        assert!(!coordination.skip_browser_auth);

        let lockfile: Lockfile = store.get_json(fp, names::LOCK).unwrap().unwrap();
        assert_eq!(lockfile.pid, std::process::id());
        assert_eq!(lockfile.port, coordination.server.port());

        coordination.lockfile.unwrap().release();
        assert!(store.get_json::<Lockfile>(fp, names::LOCK).unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_lockfile_is_deleted_and_leadership_taken() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::at(tmp.path().to_path_buf());
        let fp = "0badf00d";
        store
            .put_json(
                fp,
                names::LOCK,
                &Lockfile {
                    pid: 4_000_000,
                    port: 1,
                    timestamp: now_ms(),
                },
            )
            .unwrap();

        let coordination = acquire(&store, fp, 0, DEFAULT_CALLBACK_PATH, DEFAULT_AUTH_TIMEOUT)
            .await
            .unwrap();
        assert!(!coordination.skip_browser_auth);

        let lockfile: Lockfile = store.get_json(fp, names::LOCK).unwrap().unwrap();
        assert_eq!(lockfile.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_secondary_waits_for_completed_leader() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::at(tmp.path().to_path_buf());
        let fp = "a1b2c3d4";

        // Stand in for a leader that has already finished authorizing.
        let leader = CallbackServer::bind(0, DEFAULT_CALLBACK_PATH, DEFAULT_AUTH_TIMEOUT)
            .await
            .unwrap();
        leader.complete();
        store
            .put_json(
                fp,
                names::LOCK,
                &Lockfile {
                    pid: std::process::id(),
                    port: leader.port(),
                    timestamp: now_ms(),
                },
            )
            .unwrap();

        let coordination = acquire(&store, fp, 0, DEFAULT_CALLBACK_PATH, DEFAULT_AUTH_TIMEOUT)
            .await
            .unwrap();
        assert!(coordination.skip_browser_auth);
        assert!(coordination.lockfile.is_none());
        // Placeholder listener is bound somewhere else entirely.
        assert_ne!(coordination.server.port(), leader.port());
    }
}
