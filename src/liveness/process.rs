//! Per-platform checks that a process id still names a running process.
//!
//! [`platform_probe`] picks the implementation once at startup; call sites
//! only ever see [`ProcessProbe`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::warn;

use crate::substrate::process::ActiveChildren;

/// Answers whether a local process still exists.
pub trait ProcessProbe: Send + Sync {
    /// `true` when `pid` resolves to a live process. Never errors.
    fn is_alive(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Signal-0 check through `kill(2)`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

#[cfg(unix)]
impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            use nix::errno::Errno;
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            let Some(raw) = i32::try_from(pid).ok().filter(|raw| *raw > 0) else {
                return false;
            };
            // EPERM: the process exists but belongs to another user.
            matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
        })
    }
}

/// `/proc/<pid>` check; zombies count as dead.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFsProbe;

#[cfg(target_os = "linux")]
impl ProcessProbe for ProcFsProbe {
    fn is_alive(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if pid == 0 {
                return false;
            }
            match tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await {
                Ok(stat) => !is_zombie_stat(&stat),
                Err(_) => false,
            }
        })
    }
}

/// Parse the state field of a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state is read after the last `)`.
#[cfg(target_os = "linux")]
fn is_zombie_stat(stat: &str) -> bool {
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

/// `tasklist` check.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TasklistProbe;

#[cfg(windows)]
impl ProcessProbe for TasklistProbe {
    fn is_alive(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("tasklist")
                .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
                .output()
                .await;
            match output {
                Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
                Err(err) => {
                    warn!(pid, %err, "tasklist failed");
                    false
                }
            }
        })
    }
}

/// The probe for the current operating system.
#[must_use]
pub fn platform_probe() -> Arc<dyn ProcessProbe> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcFsProbe)
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Arc::new(SignalProbe)
    }
    #[cfg(windows)]
    {
        Arc::new(TasklistProbe)
    }
}

/// Consults children spawned by this process before falling back.
///
/// An exited child is reaped and removed here, so a zombie never reads as
/// alive to the fallback probe.
#[derive(Clone)]
pub struct TrackedProcessProbe {
    children: ActiveChildren,
    fallback: Arc<dyn ProcessProbe>,
}

impl TrackedProcessProbe {
    /// Wrap `fallback` with the shared child table.
    #[must_use]
    pub fn new(children: ActiveChildren, fallback: Arc<dyn ProcessProbe>) -> Self {
        Self { children, fallback }
    }
}

impl ProcessProbe for TrackedProcessProbe {
    fn is_alive(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            {
                let mut children = self.children.lock().await;
                if let Some(child) = children.get_mut(&pid) {
                    match child.try_wait() {
                        Ok(None) => return true,
                        Ok(Some(status)) => {
                            warn!(pid, %status, "preview process exited");
                        }
                        Err(err) => {
                            warn!(pid, %err, "failed to poll preview process");
                        }
                    }
                    children.remove(&pid);
                    return false;
                }
            }
            self.fallback.is_alive(pid).await
        })
    }
}
