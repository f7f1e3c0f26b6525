//! External copy tool supervision
//!
//! One `TransferSupervisor` owns one run of the copy tool:
//! - the tool runs in its own process group so a cancel reaches every
//!   helper process it forks
//! - status is polled without blocking; terminal results are memoized
//! - progress is estimated from the size of the partially written file
//! - cancel removes partial output but never a completed file

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::status::{messages, StatusCode, TransferStatus};

/// Default time between two status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Copy tool launch errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Transfer command template is empty")]
    EmptyCommand,
    #[error("Failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Transfer has already been launched")]
    AlreadyLaunched,
    #[error("Transfer was cancelled before launch")]
    Cancelled,
}

/// Copy tool command line; source and destination URL are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    program: String,
    args: Vec<String>,
}

impl TransferCommand {
    pub fn parse(template: &str) -> Result<Self, SupervisorError> {
        let mut words = template.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(SupervisorError::EmptyCommand)?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument vector for one transfer, for logging.
    pub fn render(&self, source: &str, dest_url: &str) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        parts.push(source);
        parts.push(dest_url);
        parts.join(" ")
    }

    fn build(&self, source: &str, dest_url: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(source)
            .arg(dest_url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }
}

#[derive(Default)]
struct SupervisorState {
    child: Option<Child>,
    pid: Option<u32>,
    launched: bool,
    final_status: Option<TransferStatus>,
}

enum Observation {
    Final(TransferStatus),
    Running,
}

/// One run of the copy tool
pub struct TransferSupervisor {
    command: TransferCommand,
    source: String,
    dest: PathBuf,
    expected_size: Option<u64>,
    poll_interval: Duration,
    state: Mutex<SupervisorState>,
    killed: AtomicBool,
    wakeup: Notify,
}

impl TransferSupervisor {
    pub fn new(
        command: TransferCommand,
        source: impl Into<String>,
        dest: impl Into<PathBuf>,
        expected_size: Option<u64>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            command,
            source: source.into(),
            dest: dest.into(),
            expected_size,
            poll_interval,
            state: Mutex::new(SupervisorState::default()),
            killed: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn dest_url(&self) -> String {
        format!("file://{}", self.dest.display())
    }

    pub fn command_line(&self) -> String {
        self.command.render(&self.source, &self.dest_url())
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Start the copy tool without waiting for it.
    ///
    /// A spawn failure is also recorded as the final status so pollers see
    /// a failed transfer rather than one that never starts.
    pub fn spawn(&self) -> Result<(), SupervisorError> {
        let mut state = self.state();
        if self.is_killed() {
            debug!(dest = %self.dest.display(), "Not launching a cancelled transfer");
            return Err(SupervisorError::Cancelled);
        }
        if state.launched {
            warn!(dest = %self.dest.display(), "Transfer launched twice");
            return Err(SupervisorError::AlreadyLaunched);
        }
        state.launched = true;

        info!(command = %self.command_line(), "Launching transfer");
        match self.command.build(&self.source, &self.dest_url()).spawn() {
            Ok(child) => {
                state.pid = child.id();
                state.child = Some(child);
                Ok(())
            }
            Err(source) => {
                state.final_status = Some(TransferStatus::new(
                    StatusCode::TransferFailed,
                    format!("Unable to launch transfer command: {}", source),
                ));
                Err(SupervisorError::SpawnFailed {
                    program: self.command.program().to_string(),
                    source,
                })
            }
        }
    }

    /// Poll until the copy tool exits or the transfer is cancelled.
    pub async fn supervise(&self) {
        loop {
            if self.is_killed() {
                info!(dest = %self.dest.display(), "Stopping supervision; transfer was cancelled");
                return;
            }
            let status = self.status();
            if status.code != StatusCode::InProgress {
                debug!(dest = %self.dest.display(), status = %status, "Supervision finished");
                return;
            }
            debug!(dest = %self.dest.display(), status = %status, "Transfer running");

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wakeup.notified() => {}
            }
        }
    }

    /// Spawn and supervise until done. Returns the last observed status.
    pub async fn launch(&self) -> Result<TransferStatus, SupervisorError> {
        self.spawn()?;
        self.supervise().await;
        Ok(self.status())
    }

    pub fn status(&self) -> TransferStatus {
        match self.observe() {
            Observation::Final(status) => status,
            Observation::Running => TransferStatus::new(StatusCode::InProgress, self.progress_message()),
        }
    }

    fn observe(&self) -> Observation {
        self.observe_locked(&mut self.state())
    }

    fn observe_locked(&self, state: &mut SupervisorState) -> Observation {
        if let Some(status) = &state.final_status {
            return Observation::Final(status.clone());
        }
        let Some(child) = state.child.as_mut() else {
            return Observation::Final(TransferStatus::new(
                StatusCode::TransferProcessNotStarted,
                messages::TRANSFER_PROCESS_NOT_STARTED,
            ));
        };

        match child.try_wait() {
            Ok(None) => Observation::Running,
            Ok(Some(exit)) => {
                let code = exit.code().or_else(|| exit.signal().map(|s| -s)).unwrap_or(-1);
                let status = if code == 0 {
                    info!(dest = %self.dest.display(), "Transfer completed");
                    TransferStatus::done()
                } else {
                    warn!(dest = %self.dest.display(), code, "Transfer failed");
                    TransferStatus::new(StatusCode::TransferFailed, messages::transfer_failed(code))
                };
                state.child = None;
                state.final_status = Some(status.clone());
                Observation::Final(status)
            }
            Err(e) => {
                warn!(dest = %self.dest.display(), error = %e, "Unable to determine transfer status");
                Observation::Final(TransferStatus::new(
                    StatusCode::TransferStatusUnknown,
                    messages::TRANSFER_STATUS_UNKNOWN,
                ))
            }
        }
    }

    fn progress_message(&self) -> String {
        let size = match std::fs::metadata(&self.dest) {
            Ok(meta) => meta.len(),
            Err(_) => return messages::WAITING_FOR_SRM.to_string(),
        };
        if size == 0 {
            return messages::GRIDFTP_NO_MOVEMENT.to_string();
        }
        let percent = match self.expected_size {
            Some(total) if total > 0 => format!("{:.1}%,", size as f64 * 100.0 / total as f64),
            _ => String::new(),
        };
        messages::in_progress(&percent, size)
    }

    /// Stop the transfer: flag it, signal the whole process group and drop
    /// the partial output. Safe to call repeatedly.
    pub fn cancel(&self) {
        let mut state = self.state();
        // An exit nobody has polled yet still counts as completion.
        let running = match self.observe_locked(&mut state) {
            Observation::Final(status) if status.code == StatusCode::Done => {
                info!(dest = %self.dest.display(), "Transfer already completed; leaving output in place");
                return;
            }
            Observation::Final(_) => false,
            Observation::Running => true,
        };
        info!(dest = %self.dest.display(), "Cancelling transfer");
        self.killed.store(true, Ordering::SeqCst);

        match (running, state.pid) {
            (true, Some(pid)) => {
                info!(pid, "Killing transfer process group");
                // SAFETY: killpg only sends a signal; pid is the group leader we spawned.
                let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    warn!(pid, error = %io::Error::last_os_error(), "Unable to signal transfer process group");
                }
            }
            _ => warn!(dest = %self.dest.display(), "No running transfer process to kill"),
        }
        if let Some(mut child) = state.child.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = child.wait().await;
                    });
                }
                Err(_) => debug!("No runtime to reap the cancelled transfer process"),
            }
        }

        match std::fs::remove_file(&self.dest) {
            Ok(()) => info!(dest = %self.dest.display(), "Removed partial destination file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dest = %self.dest.display(), "Destination doesn't exist; nothing to remove")
            }
            Err(e) => warn!(dest = %self.dest.display(), error = %e, "Unable to remove partial destination"),
        }

        if !matches!(&state.final_status, Some(s) if s.is_terminal()) {
            state.final_status = Some(TransferStatus::cancelled());
        }
        drop(state);
        self.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn script(dir: &Path, name: &str, body: &str) -> TransferCommand {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        TransferCommand::parse(&format!("/bin/sh {}", path.display())).unwrap()
    }

    const COPY: &str = r#"dest="${2#file://}"; printf 'hello' > "$dest""#;

    #[test]
    fn test_parse_template() {
        let cmd = TransferCommand::parse("srmcp -debug=true  -retry_num=1").unwrap();
        assert_eq!(cmd.program(), "srmcp");
        assert_eq!(
            cmd.render("srm://a/b", "file:///tmp/x"),
            "srmcp -debug=true -retry_num=1 srm://a/b file:///tmp/x"
        );
        assert!(matches!(TransferCommand::parse("   "), Err(SupervisorError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_not_started() {
        let sup = TransferSupervisor::new(
            TransferCommand::parse("true").unwrap(),
            "src",
            "/nonexistent/dest",
            None,
            Duration::from_millis(10),
        );
        assert_eq!(sup.status().code, StatusCode::TransferProcessNotStarted);
    }

    #[tokio::test]
    async fn test_successful_copy() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.root");
        let sup = TransferSupervisor::new(
            script(dir.path(), "copy.sh", COPY),
            "srm://site/file",
            &dest,
            Some(5),
            Duration::from_millis(10),
        );

        let status = sup.launch().await.unwrap();
        assert_eq!(status, TransferStatus::done());
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        // Memoized.
        assert_eq!(sup.status(), TransferStatus::done());
        assert!(matches!(sup.spawn(), Err(SupervisorError::AlreadyLaunched)));

        // Cancel after completion keeps the file.
        sup.cancel();
        assert!(dest.exists());
        assert_eq!(sup.status(), TransferStatus::done());
    }

    #[tokio::test]
    async fn test_failed_copy_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sup = TransferSupervisor::new(
            script(dir.path(), "fail.sh", "exit 3"),
            "srm://site/file",
            dir.path().join("out.root"),
            None,
            Duration::from_millis(10),
        );
        let status = sup.launch().await.unwrap();
        assert_eq!(status.code, StatusCode::TransferFailed);
        assert_eq!(status.message, "File failed; transfer status code 3.");
    }

    #[tokio::test]
    async fn test_cancelled_before_launch_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.root");
        let sup = TransferSupervisor::new(
            script(dir.path(), "copy.sh", COPY),
            "srm://site/file",
            &dest,
            None,
            Duration::from_millis(10),
        );
        sup.cancel();
        assert!(matches!(sup.launch().await, Err(SupervisorError::Cancelled)));
        assert_eq!(sup.status(), TransferStatus::cancelled());
        assert!(sup.pid().is_none());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let sup = TransferSupervisor::new(
            TransferCommand::parse("/nonexistent/copy-tool").unwrap(),
            "src",
            "/tmp/never-written.root",
            None,
            Duration::from_millis(10),
        );
        assert!(matches!(sup.spawn(), Err(SupervisorError::SpawnFailed { .. })));
        assert_eq!(sup.status().code, StatusCode::TransferFailed);
    }

    #[tokio::test]
    async fn test_cancel_after_unpolled_exit_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.root");
        let sup = TransferSupervisor::new(
            script(dir.path(), "copy.sh", COPY),
            "srm://site/file",
            &dest,
            Some(5),
            Duration::from_secs(3),
        );

        sup.spawn().unwrap();
        // Let the tool exit without anybody polling it.
        for _ in 0..100 {
            if fs::read(&dest).map_or(false, |b| b == b"hello") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        sup.cancel();
        assert!(!sup.is_killed());
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert_eq!(sup.status(), TransferStatus::done());
    }

    fn is_dead(pid: &str) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(true, |rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_progress_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.root");
        let pidfile = dir.path().join("helper.pid");
        let body = format!(
            r#"dest="${{2#file://}}"; head -c 512 /dev/zero > "$dest"; sleep 30 & echo $! > {}; wait"#,
            pidfile.display()
        );
        let sup = std::sync::Arc::new(TransferSupervisor::new(
            script(dir.path(), "slow.sh", &body),
            "srm://site/file",
            &dest,
            Some(1024),
            Duration::from_millis(20),
        ));

        sup.spawn().unwrap();
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.supervise().await })
        };

        let mut status = sup.status();
        for _ in 0..200 {
            let helper_known = fs::read_to_string(&pidfile).map_or(false, |p| p.ends_with('\n'));
            if status.message.contains("50.0%") && helper_known {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = sup.status();
        }
        assert_eq!(status.code, StatusCode::InProgress);
        assert_eq!(status.message, "Data moving; 50.0%, 0.0 MB complete.");
        let helper = fs::read_to_string(&pidfile).unwrap().trim().to_string();

        sup.cancel();
        sup.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();

        assert!(sup.is_killed());
        assert_eq!(sup.status(), TransferStatus::cancelled());
        assert!(!dest.exists());

        // The helper forked by the tool got the signal too.
        let mut dead = false;
        for _ in 0..100 {
            if is_dead(&helper) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dead);
    }
}
