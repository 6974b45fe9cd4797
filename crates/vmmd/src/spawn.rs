//! FIFO setup, hypervisor launch, and child reaping.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::stat::Mode;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use vmm_core::{Error, Name, Result};

use crate::engine::{CreatePending, ExitSummary};

/// Everything needed to launch one VM's hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    pub name: Name,
    pub hypervisor: PathBuf,
    pub memory_mb: u32,
    pub cpus: u16,
    pub taps: Vec<String>,
    pub image: String,
    pub args: Vec<String>,
    pub fifo: PathBuf,
}

impl SpawnPlan {
    pub fn new(hypervisor: &Path, pending: &CreatePending) -> SpawnPlan {
        SpawnPlan {
            name: pending.name.clone(),
            hypervisor: hypervisor.to_path_buf(),
            memory_mb: pending.request.memory_mb,
            cpus: pending.request.cpus,
            taps: pending.taps.clone(),
            image: pending.request.image.clone(),
            args: pending.request.args.clone(),
            fifo: pending.fifo.clone(),
        }
    }

    /// Hypervisor argv, binary excluded: reservations, tap devices, then
    /// the image and its passthrough arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            format!("--mem={}", self.memory_mb),
            format!("--cpus={}", self.cpus),
        ];
        for tap in &self.taps {
            argv.push(format!("--net={tap}"));
        }
        argv.push(self.image.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Create the console FIFO. A leftover FIFO from an earlier VM of the same
/// name is reused.
pub fn create_fifo(path: &Path) -> Result<()> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(Error::Resource(format!("mkfifo {}: {e}", path.display()))),
    }
}

/// A spawned hypervisor plus the retained copy of its stdout descriptor.
#[derive(Debug)]
pub struct RunningVm {
    pub pid: u32,
    child: Child,
    /// The FIFO write end backing the child's stdout; dropped exactly once
    /// when the reaper fires.
    stdout: File,
}

impl RunningVm {
    /// Wait for the hypervisor to exit and close the retained stdout.
    pub async fn reap(self) -> ExitSummary {
        let mut child = self.child;
        let exit = match child.wait().await {
            Ok(status) => ExitSummary::from(status),
            Err(e) => {
                warn!("wait for pid {} failed: {e}", self.pid);
                ExitSummary::Exited(-1)
            }
        };
        drop(self.stdout);
        exit
    }
}

/// Open the FIFO write end and launch the hypervisor with its stdout on it.
///
/// The console helper must already hold the FIFO's read end, otherwise the
/// non-blocking open fails with ENXIO; the create protocol guarantees that
/// ordering.
pub fn launch(plan: &SpawnPlan) -> Result<RunningVm> {
    let binary = which::which(&plan.hypervisor)
        .map_err(|e| Error::Resource(format!("hypervisor {}: {e}", plan.hypervisor.display())))?;

    let stdout = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&plan.fifo)
        .map_err(|e| Error::Resource(format!("open fifo {}: {e}", plan.fifo.display())))?;
    // The non-blocking flag was only needed to make the open itself safe;
    // the child gets a regular blocking stdout.
    // SAFETY: plain fcntl on a descriptor we own.
    unsafe {
        libc::fcntl(stdout.as_raw_fd(), libc::F_SETFL, 0);
    }
    let retained = stdout.try_clone().map_err(Error::Io)?;

    let child = Command::new(&binary)
        .args(plan.argv())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Resource(format!("spawn {}: {e}", binary.display())))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Resource("hypervisor exited before it was tracked".into()))?;
    debug!("{}: spawned {} as pid {pid}", plan.name, binary.display());

    Ok(RunningVm {
        pid,
        child,
        stdout: retained,
    })
}

/// Deliver SIGTERM. Unknown pids are ignored (the reaper may have won).
pub fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("kill {pid}: {e}");
    }
}

/// Ignore SIGPIPE process-wide so a disconnected helper or client surfaces
/// as a write error instead of terminating the daemon.
pub fn ignore_sigpipe() {
    // SAFETY: zeroed sigaction is valid; only the handler and flags fields
    // are populated before installation.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = libc::SIG_IGN;
    sa.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigaction(libc::SIGPIPE, &sa, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use tokio::net::unix::pipe;

    use vmm_core::wire::CreateRequest;

    fn plan(dir: &Path, hypervisor: &Path, image: &str) -> SpawnPlan {
        let name: Name = "vm.a".parse().unwrap();
        let pending = CreatePending {
            name: name.clone(),
            request: CreateRequest {
                memory_mb: 64,
                cpus: 1,
                taps: 1,
                image: image.into(),
                args: vec!["extra".into()],
            },
            taps: vec!["tap0".into()],
            fifo: vmm_core::paths::console_fifo(dir, &name),
        };
        SpawnPlan::new(hypervisor, &pending)
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-hypervisor");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn argv_shape() {
        let dir = Path::new("/run/x");
        let plan = plan(dir, Path::new("solo5-hvt"), "/srv/hello.hvt");
        assert_eq!(
            plan.argv(),
            [
                "--mem=64",
                "--cpus=1",
                "--net=tap0",
                "/srv/hello.hvt",
                "extra"
            ]
        );
    }

    #[test]
    fn create_fifo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.a.fifo");
        create_fifo(&path).unwrap();
        create_fifo(&path).unwrap();
    }

    #[test]
    fn create_fifo_refuses_a_bad_parent() {
        let err = create_fifo(Path::new("/nonexistent-dir/vm.fifo")).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn launch_missing_hypervisor_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), Path::new("/nonexistent/hypervisor"), "img");
        let err = launch(&plan).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn launch_without_a_fifo_reader_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0");
        let plan = plan(dir.path(), &script, "img");
        create_fifo(&plan.fifo).unwrap();
        // No read end is open, so the non-blocking open must fail.
        let err = launch(&plan).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn launch_and_reap_reports_the_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 7");
        let plan = plan(dir.path(), &script, "img");
        create_fifo(&plan.fifo).unwrap();
        let _reader = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&plan.fifo)
            .unwrap();

        let running = launch(&plan).unwrap();
        assert!(running.pid > 0);
        let exit = running.reap().await;
        assert_eq!(exit, ExitSummary::Exited(7));
    }

    #[tokio::test]
    async fn terminate_ends_a_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exec sleep 30");
        let plan = plan(dir.path(), &script, "img");
        create_fifo(&plan.fifo).unwrap();
        let _reader = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&plan.fifo)
            .unwrap();

        let running = launch(&plan).unwrap();
        terminate(running.pid);
        let exit = running.reap().await;
        assert_eq!(exit, ExitSummary::Signaled(libc::SIGTERM));
    }

    #[tokio::test]
    async fn child_stdout_reaches_the_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo booted");
        let plan = plan(dir.path(), &script, "img");
        create_fifo(&plan.fifo).unwrap();
        let reader = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&plan.fifo)
            .unwrap();

        let running = launch(&plan).unwrap();
        running.reap().await;

        let mut lines = tokio::io::BufReader::new(reader);
        let mut line = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut lines, &mut line)
            .await
            .unwrap();
        assert_eq!(line, "booted\n");
    }
}
