//! Spawned peas and pods: owned worker processes and their log output.
//!
//! Every process of a handle gets its stdout and stderr read line by line
//! into one shared channel. The log stream ends once all processes have
//! closed both pipes, which in practice means they exited.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::args::{PeaArgs, PodPeas};

const LOG_CHANNEL_CAPACITY: usize = 256;

/// One line a spawned process wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Name of the pea that produced the line.
    pub source: String,
    pub msg: String,
}

/// Turns a pea's arguments into the command that runs it.
pub trait Launcher: Send + Sync {
    fn command(&self, args: &PeaArgs) -> Command;
}

/// Launches `<program> pea <args…>` for every pea.
pub struct WorkerLauncher {
    program: PathBuf,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolve `name` next to the current executable, falling back to `PATH`.
    pub fn locate(name: &str) -> Self {
        Self::new(find_worker_binary(name).unwrap_or_else(|| PathBuf::from(name)))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Launcher for WorkerLauncher {
    fn command(&self, args: &PeaArgs) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("pea").args(args.to_cli_args());
        cmd
    }
}

fn find_worker_binary(name: &str) -> Option<PathBuf> {
    let path = std::path::Path::new(name);
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let file = if cfg!(target_os = "windows") {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    let candidate = dir.join(file);
    candidate.exists().then_some(candidate)
}

// ─── Handles ──────────────────────────────────────────────────────────────────

/// Something the gateway started and must stop on shutdown.
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    /// Stop the underlying processes. Safe to call more than once.
    fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeaPodKind {
    Pea,
    Pod,
}

impl std::fmt::Display for PeaPodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pea => write!(f, "pea"),
            Self::Pod => write!(f, "pod"),
        }
    }
}

/// A running pea (one process) or pod (a group of processes).
pub struct PeaPod {
    id: Uuid,
    name: String,
    kind: PeaPodKind,
    peas: PodPeas,
    children: Mutex<Vec<Child>>,
    logs: Mutex<Option<mpsc::Receiver<LogRecord>>>,
    closed: AtomicBool,
}

impl PeaPod {
    /// Start a single pea.
    pub fn start_pea(args: PeaArgs, launcher: &dyn Launcher) -> Result<Self> {
        let name = args.name.clone();
        let peas = PodPeas {
            head: None,
            tail: None,
            peas: vec![args],
        };
        Self::start(name, PeaPodKind::Pea, peas, launcher)
    }

    /// Start every pea of a pod.
    pub fn start_pod(name: impl Into<String>, peas: PodPeas, launcher: &dyn Launcher) -> Result<Self> {
        Self::start(name.into(), PeaPodKind::Pod, peas, launcher)
    }

    /// Spawns all processes without yielding to the runtime, so process
    /// creation cannot be interrupted halfway. If one spawn fails the ones
    /// already started are killed on drop.
    fn start(name: String, kind: PeaPodKind, peas: PodPeas, launcher: &dyn Launcher) -> Result<Self> {
        anyhow::ensure!(!peas.is_empty(), "{kind} {name} has no peas to start");

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let mut children = Vec::with_capacity(peas.len());

        for pea in peas.iter() {
            let mut cmd = launcher.command(pea);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .with_context(|| format!("Failed to spawn pea {}", pea.name))?;

            if let Some(out) = child.stdout.take() {
                forward_lines(out, pea.name.clone(), tx.clone());
            }
            if let Some(err) = child.stderr.take() {
                forward_lines(err, pea.name.clone(), tx.clone());
            }
            debug!("Spawned pea {} (pid: {:?})", pea.name, child.id());
            children.push(child);
        }

        let id = Uuid::new_v4();
        info!("Started {kind} {name} ({id}) with {} process(es)", children.len());

        Ok(Self {
            id,
            name,
            kind,
            peas,
            children: Mutex::new(children),
            logs: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> PeaPodKind {
        self.kind
    }

    /// Concrete arguments of every process in this handle.
    pub fn peas_args(&self) -> &PodPeas {
        &self.peas
    }

    /// Take the log stream. Only the first caller gets it.
    pub fn take_logs(&self) -> Option<mpsc::Receiver<LogRecord>> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ProcessHandle for PeaPod {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let mut failed = 0;
        for child in children.iter_mut() {
            // An already exited child is fine to skip.
            if let Ok(Some(_)) = child.try_wait() {
                continue;
            }
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill process {:?} of {}: {}", child.id(), self.name, e);
                failed += 1;
            }
        }
        info!("Closed {} {} ({})", self.kind, self.name, self.id);
        anyhow::ensure!(failed == 0, "{failed} process(es) of {} could not be killed", self.name);
        Ok(())
    }
}

impl Drop for PeaPod {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn forward_lines<R>(reader: R, source: String, tx: mpsc::Sender<LogRecord>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(msg)) => {
                    let record = LogRecord {
                        source: source.clone(),
                        msg,
                    };
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Log reader for {source} stopped: {e}");
                    break;
                }
            }
        }
    });
}
