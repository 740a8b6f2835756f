use std::io::{BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log_sanitize::{sanitize_line, tail_lines};

pub mod interrupt;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);
const ERROR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    CommitStarted {
        id: String,
    },
    Log {
        id: String,
        line: String,
    },
    CommitFinished {
        id: String,
        status: CommitStatus,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Complete,
    Failed,
    Skipped,
}

impl CommitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitStatus::Complete => "complete",
            CommitStatus::Failed => "failed",
            CommitStatus::Skipped => "skipped",
        }
    }
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    processed: usize,
    complete: usize,
    failed: usize,
    skipped: usize,
    failed_commits: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::CommitStarted { id } => {
                if let Ok(mut s) = self.state.lock()
                    && s.started_at.is_none()
                {
                    s.started_at = Some(Instant::now());
                }
                println!("[+] Commit {id}");
            }
            ExecEvent::Log { id, line } => {
                println!("[{id}] {line}");
            }
            ExecEvent::CommitFinished {
                id,
                status,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.processed = s.processed.saturating_add(1);
                    match status {
                        CommitStatus::Complete => s.complete = s.complete.saturating_add(1),
                        CommitStatus::Skipped => s.skipped = s.skipped.saturating_add(1),
                        CommitStatus::Failed => {
                            s.failed = s.failed.saturating_add(1);
                            s.failed_commits.push(id.clone());
                        }
                    }
                }
                let marker = if status == CommitStatus::Failed { "-" } else { "+" };
                println!(
                    "[{marker}] {id}: {} ({})",
                    status.as_str(),
                    format_elapsed_hms((elapsed_ms / 1000) as u64)
                );
            }
            ExecEvent::RunDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  commits: processed={} complete={} failed={} skipped={}\n",
                    s.processed, s.complete, s.failed, s.skipped
                ));
                summary.push_str(&format!("  elapsed: {}\n", format_elapsed_hms(wall.as_secs())));
                if !s.failed_commits.is_empty() {
                    summary.push_str(&format!("  failed: {}\n", s.failed_commits.join(", ")));
                }
                if let Some(e) = error {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                *s = StdoutSinkState::default();
                print!("{summary}");
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// How a bounded command ended.
#[derive(Debug, Clone)]
pub struct CmdOutcome {
    pub status: ExitStatus,
    pub stderr: String,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl CmdOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.interrupted && self.status.success()
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub sink: Arc<dyn ExecSink>,
    pub current_commit: Option<String>,
    interrupt: &'static interrupt::InterruptFlag,
}

impl ExecCtx {
    pub fn new(sink: Arc<dyn ExecSink>) -> Self {
        Self {
            sink,
            current_commit: None,
            interrupt: &interrupt::SIGINT,
        }
    }

    #[cfg(test)]
    fn with_interrupt(mut self, flag: &'static interrupt::InterruptFlag) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn set_commit(&mut self, id: impl Into<String>) {
        self.current_commit = Some(id.into());
    }

    pub fn clear_commit(&mut self) {
        self.current_commit = None;
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_commit
            .clone()
            .unwrap_or_else(|| "run".into());
        self.sink.emit(ExecEvent::Log {
            id,
            line: msg.to_string(),
        });
    }

    /// Run to completion; a non-zero exit is an error carrying the stderr tail.
    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        let program = describe(&cmd);
        let out = self.run_bounded(cmd, None)?;
        if out.success() {
            return Ok(());
        }
        let tail = tail_lines(&out.stderr, ERROR_TAIL_LINES).join("\n");
        let status = out.status;
        if tail.is_empty() {
            Err(Error::msg(format!("command failed ({status}): {program}")))
        } else {
            Err(Error::msg(format!(
                "command failed ({status}): {program}\n{tail}"
            )))
        }
    }

    /// Run with an optional wall-clock limit. Timeouts and interrupts kill the
    /// child's process group and are reported in the outcome, not as errors.
    pub fn run_bounded(&self, mut cmd: Command, timeout: Option<Duration>) -> Result<CmdOutcome> {
        let program = describe(&cmd);
        tracing::debug!(command = %program, ?timeout, "spawning");

        // Own process group: a timeout or interrupt can take down make's whole job tree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn failed for {program}: {e}")))?;
        let pgid = child.id();

        let (tx, rx) = mpsc::channel::<(Stream, String)>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, Stream::Stdout, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, Stream::Stderr, tx));
        }
        drop(tx);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stderr = String::new();
        let mut timed_out = false;
        let mut interrupted = false;
        let mut grace_until: Option<Instant> = None;

        let _guard = interrupt::WaitGuard::enter(self.interrupt);
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((stream, line)) => {
                    match stream {
                        Stream::Stdout => tracing::debug!(target: "lpd::cmd", "{}", sanitize_line(&line)),
                        Stream::Stderr => {
                            tracing::debug!(target: "lpd::cmd", "stderr: {}", sanitize_line(&line));
                            stderr.push_str(&line);
                            stderr.push('\n');
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if let Some(until) = grace_until {
                if now >= until {
                    kill_pgroup(pgid, true);
                    break;
                }
                continue;
            }
            if deadline.is_some_and(|d| now >= d) {
                timed_out = true;
                tracing::warn!(command = %program, "timed out; killing");
                kill_pgroup(pgid, true);
                grace_until = Some(now + INTERRUPT_GRACE);
            } else if self.interrupt.take() {
                interrupted = true;
                self.log("interrupted; stopping the running command");
                kill_pgroup(pgid, false);
                grace_until = Some(now + INTERRUPT_GRACE);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        Ok(CmdOutcome {
            status,
            stderr,
            timed_out,
            interrupted,
        })
    }
}

fn describe(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        s.push(' ');
        s.push_str(&a.to_string_lossy());
    }
    s
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_output_stream<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' {
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send((stream, line));
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send((stream, line));
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send((stream, line));
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
