//! Execution substrate for session workers
//!
//! The manager never touches processes directly; it asks a [`Provisioner`]
//! to start, locate and stop workers. `ProcessProvisioner` runs the
//! `jam-worker` binary on this host.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jam_utils::{JamError, Result};

/// Where a worker's sockets live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAddress {
    pub host: String,
    pub control_port: u16,
    pub file_port: u16,
}

impl WorkerAddress {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }
}

/// Persisted reference to a running worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    pub address: Option<WorkerAddress>,
}

/// Parameters a worker is started with
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionParams {
    pub session_id: String,
    pub title: String,
    pub description: String,
    pub owner_account_id: Option<String>,
    pub length_secs: u64,
    pub max_depth: usize,
    pub max_width: usize,
    /// Where the worker sends its startup handshake
    pub handshake_addr: String,
}

pub trait Provisioner: Send + Sync {
    /// Start a worker; the returned handle may not have an address yet
    fn provision(&self, params: &ProvisionParams) -> Result<WorkerHandle>;

    /// One attempt at locating the worker; `None` means "not yet"
    fn discover_address(&self, handle: &WorkerHandle) -> Result<Option<WorkerAddress>>;

    /// Stop the worker; succeeds if it is already gone
    fn terminate(&self, handle: &WorkerHandle) -> Result<()>;
}

struct SpawnedWorker {
    child: Child,
    address: WorkerAddress,
}

/// Runs workers as child processes on loopback ports
pub struct ProcessProvisioner {
    worker_bin: PathBuf,
    host: String,
    children: Mutex<HashMap<u32, SpawnedWorker>>,
}

impl ProcessProvisioner {
    pub fn new(worker_bin: PathBuf, host: impl Into<String>) -> Self {
        Self {
            worker_bin,
            host: host.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// `jam-worker` next to the running executable
    pub fn default_worker_bin() -> Result<PathBuf> {
        let exe = std::env::current_exe()?;
        Ok(exe.with_file_name("jam-worker"))
    }

    /// Ask the OS for a free port on `host`
    fn free_port(&self) -> Result<u16> {
        let listener = TcpListener::bind((self.host.as_str(), 0))?;
        Ok(listener.local_addr()?.port())
    }
}

/// Command line for a worker
///
/// Free-text values are attached with `=` so a leading hyphen is never read
/// as a flag.
fn worker_args(params: &ProvisionParams, address: &WorkerAddress) -> Vec<String> {
    let mut args = vec![
        format!("--session-id={}", params.session_id),
        format!("--title={}", params.title),
        format!("--description={}", params.description),
        format!("--length-secs={}", params.length_secs),
        format!("--max-depth={}", params.max_depth),
        format!("--max-width={}", params.max_width),
        format!("--host={}", address.host),
        format!("--control-port={}", address.control_port),
        format!("--file-port={}", address.file_port),
        format!("--orchestrator={}", params.handshake_addr),
    ];
    if let Some(owner) = &params.owner_account_id {
        args.push(format!("--owner={}", owner));
    }
    args
}

impl Provisioner for ProcessProvisioner {
    fn provision(&self, params: &ProvisionParams) -> Result<WorkerHandle> {
        let address = WorkerAddress {
            host: self.host.clone(),
            control_port: self.free_port()?,
            file_port: self.free_port()?,
        };

        let mut command = Command::new(&self.worker_bin);
        command
            .args(worker_args(params, &address))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let child = command.spawn().map_err(|e| {
            JamError::ProcessSpawn(format!("{}: {}", self.worker_bin.display(), e))
        })?;
        let pid = child.id();
        info!(
            "Spawned worker {} for session {} (control {}, files {})",
            pid, params.session_id, address.control_port, address.file_port
        );

        self.children.lock().insert(pid, SpawnedWorker { child, address });
        Ok(WorkerHandle {
            pid: Some(pid),
            address: None,
        })
    }

    fn discover_address(&self, handle: &WorkerHandle) -> Result<Option<WorkerAddress>> {
        let Some(pid) = handle.pid else {
            return Ok(handle.address.clone());
        };
        let mut children = self.children.lock();
        let Some(worker) = children.get_mut(&pid) else {
            return Ok(handle.address.clone());
        };
        match worker.child.try_wait()? {
            Some(status) => {
                children.remove(&pid);
                Err(JamError::ProcessSpawn(format!(
                    "worker {} exited early with {}",
                    pid, status
                )))
            }
            None => Ok(Some(worker.address.clone())),
        }
    }

    fn terminate(&self, handle: &WorkerHandle) -> Result<()> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };

        if let Some(mut worker) = self.children.lock().remove(&pid) {
            if let Err(e) = worker.child.kill() {
                debug!("Worker {} already gone: {}", pid, e);
            }
            let _ = worker.child.wait();
            info!("Terminated worker {}", pid);
            return Ok(());
        }

        // Not our child: left over from a previous orchestrator run
        let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
            return Err(JamError::internal(format!("pid {} out of range", pid)));
        };
        // SAFETY: kill(2) only sends a signal; no memory is shared
        let rc = unsafe { libc::kill(raw_pid, libc::SIGTERM) };
        if rc == 0 {
            info!("Sent SIGTERM to worker {}", pid);
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("Failed to signal worker {}: {}", pid, err);
                return Err(err.into());
            }
            debug!("Worker {} no longer exists", pid);
        }
        Ok(())
    }
}
