use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, UpdaterError};

/// Status codes reported by the A/B update engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
    Disabled,
}

impl EngineStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => EngineStatus::Idle,
            1 => EngineStatus::CheckingForUpdate,
            2 => EngineStatus::UpdateAvailable,
            3 => EngineStatus::Downloading,
            4 => EngineStatus::Verifying,
            5 => EngineStatus::Finalizing,
            6 => EngineStatus::UpdatedNeedReboot,
            7 => EngineStatus::ReportingErrorEvent,
            8 => EngineStatus::AttemptingRollback,
            9 => EngineStatus::Disabled,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    StatusUpdate { status: EngineStatus, percent: f32 },
    PayloadApplicationComplete { error_code: i32 },
}

pub type EngineCallback = mpsc::UnboundedSender<EngineEvent>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadRequest {
    pub uri: String,
    pub offset: u64,
    /// 0 lets the engine read up to the end of the file.
    pub size: u64,
    pub headers: Vec<String>,
}

/// The privileged component that writes the payload to the inactive slot.
///
/// `apply_payload` returns as soon as the engine accepted the request; all
/// further progress arrives on the callback passed to `bind`.
pub trait UpdateEngine: Send + Sync + 'static {
    fn bind(&self, callback: EngineCallback);
    fn apply_payload(&self, request: &PayloadRequest) -> Result<()>;
    fn set_performance_mode(&self, enabled: bool) -> Result<()>;
}

/// Drives an `update_engine_client` compatible program and follows its output.
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    perf_args: Vec<String>,
    perf_mode: AtomicBool,
    callback: Mutex<Option<EngineCallback>>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, perf_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            perf_args,
            perf_mode: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    fn command(&self, request: &PayloadRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--update")
            .arg("--follow")
            .arg(format!("--payload={}", request.uri))
            .arg(format!("--offset={}", request.offset))
            .arg(format!("--size={}", request.size))
            .arg(format!("--headers={}", request.headers.join("\n")));
        if self.perf_mode.load(Ordering::Relaxed) {
            cmd.args(&self.perf_args);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl UpdateEngine for CommandEngine {
    fn bind(&self, callback: EngineCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// The bound callback moves into the follower task, so the channel closes
    /// once the client exits.
    fn apply_payload(&self, request: &PayloadRequest) -> Result<()> {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| UpdaterError::EngineReported("no callback bound".to_string()))?;

        let mut child = self.command(request).spawn().map_err(|e| {
            UpdaterError::EngineReported(format!("could not start {}: {}", self.program, e))
        })?;
        info!("Started {} for {}", self.program, request.uri);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            let mut out = stdout.map(|s| BufReader::new(s).lines());
            let mut err = stderr.map(|s| BufReader::new(s).lines());
            let mut completed = false;

            loop {
                let line = tokio::select! {
                    Some(line) = next_line(&mut out) => line,
                    Some(line) = next_line(&mut err) => line,
                    else => break,
                };
                debug!("engine: {}", line);
                if let Some(event) = parse_line(&line) {
                    completed |= matches!(event, EngineEvent::PayloadApplicationComplete { .. });
                    if callback.send(event).is_err() {
                        break;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() && !completed => {
                    warn!("Update engine client exited with {}", status);
                    let _ = callback.send(EngineEvent::PayloadApplicationComplete {
                        error_code: status.code().unwrap_or(-1),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("Could not wait for update engine client: {}", e),
            }
        });
        Ok(())
    }

    fn set_performance_mode(&self, enabled: bool) -> Result<()> {
        self.perf_mode.store(enabled, Ordering::Relaxed);
        Ok(())
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        _ => {
            *lines = None;
            None
        }
    }
}

/// Parses `onStatusUpdate(NAME (code), fraction)` and
/// `onPayloadApplicationComplete(NAME (code))` lines.
pub fn parse_line(line: &str) -> Option<EngineEvent> {
    if let Some((_, rest)) = line.split_once("onStatusUpdate(") {
        let (left, percent) = rest.rsplit_once(',')?;
        let status = EngineStatus::from_code(trailing_code(left)?)?;
        let percent = percent.trim().trim_end_matches(')').trim().parse::<f32>().ok()?;
        return Some(EngineEvent::StatusUpdate {
            status,
            percent: percent.clamp(0.0, 1.0),
        });
    }
    if let Some((_, rest)) = line.split_once("onPayloadApplicationComplete(") {
        return Some(EngineEvent::PayloadApplicationComplete {
            error_code: trailing_code(rest)?,
        });
    }
    None
}

fn trailing_code(s: &str) -> Option<i32> {
    let open = s.rfind('(')?;
    let close = s[open..].find(')')? + open;
    s[open + 1..close].trim().parse().ok()
}
