//! 플러그인 서브프로세스 생성, 핸드셰이크 대기, 종료
//!
//! 모든 자식 프로세스는 `kill_on_drop(true)`로 생성됩니다. 시작 도중
//! `start()` future가 드롭되거나 호스트 런타임이 내려가도 고아 프로세스가
//! 남지 않습니다.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use super::error::PluginError;
use crate::plugin::handshake::{HandshakeLine, MAX_HANDSHAKE_LINE};
use crate::plugin::LaunchSpec;

/// Windows: 콘솔 창 숨김
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Pre-flight check so a missing binary is reported as a launch error rather
/// than a generic spawn failure.
pub(crate) fn check_executable(plugin: &str, path: &Path) -> Result<(), PluginError> {
    let meta = std::fs::metadata(path).map_err(|_| PluginError::ExecutableMissing {
        plugin: plugin.to_string(),
        path: path.to_path_buf(),
    })?;
    if !meta.is_file() {
        return Err(PluginError::NotExecutable {
            plugin: plugin.to_string(),
            path: path.to_path_buf(),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(PluginError::NotExecutable {
                plugin: plugin.to_string(),
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

pub(crate) fn spawn(spec: &LaunchSpec) -> Result<Child, PluginError> {
    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    apply_creation_flags(&mut cmd);

    cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PluginError::ExecutableMissing {
            plugin: spec.plugin_name.clone(),
            path: spec.executable.clone(),
        },
        std::io::ErrorKind::PermissionDenied => PluginError::NotExecutable {
            plugin: spec.plugin_name.clone(),
            path: spec.executable.clone(),
        },
        _ => PluginError::Spawn {
            plugin: spec.plugin_name.clone(),
            source: e,
        },
    })
}

/// Plugin stderr → tracing, line by line.
pub(crate) fn forward_stderr(plugin: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("[{}] stderr: {}", plugin, line);
        }
    });
}

/// 핸드셰이크 이후의 stdout 출력도 로그로 전달
pub(crate) fn forward_stdout(plugin: String, stdout: BufReader<ChildStdout>) {
    tokio::spawn(async move {
        let mut lines = stdout.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("[{}] stdout: {}", plugin, line);
        }
    });
}

enum Waited {
    Line(std::io::Result<Option<String>>),
    TimedOut,
    Exited(std::io::Result<ExitStatus>),
}

/// Wait for the first stdout line and decode it.
///
/// Does not terminate the child on failure; the caller owns that decision.
pub(crate) async fn await_handshake(
    plugin: &str,
    child: &mut Child,
    stdout: &mut BufReader<ChildStdout>,
    timeout: Duration,
) -> Result<HandshakeLine, PluginError> {
    // 개행 없이 끝없이 출력하는 플러그인도 MAX_HANDSHAKE_LINE에서 끊음
    let first_line = async {
        let mut line = String::new();
        let n = (&mut *stdout)
            .take(MAX_HANDSHAKE_LINE as u64 + 1)
            .read_line(&mut line)
            .await?;
        Ok::<_, std::io::Error>((n > 0).then_some(line))
    };
    let waited = tokio::select! {
        biased;
        line = tokio::time::timeout(timeout, first_line) => match line {
            Ok(line) => Waited::Line(line),
            Err(_) => Waited::TimedOut,
        },
        status = child.wait() => Waited::Exited(status),
    };

    match waited {
        Waited::Line(Ok(Some(line))) => {
            tracing::debug!("[{}] handshake: {}", plugin, line);
            line.parse::<HandshakeLine>()
                .map_err(|source| PluginError::Handshake {
                    plugin: plugin.to_string(),
                    source,
                })
        }
        Waited::Line(Ok(None)) => {
            // stdout이 닫힘. 보통 프로세스가 종료된 경우
            let status = match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
                Ok(Ok(status)) => status.to_string(),
                _ => "closed stdout before handshake".to_string(),
            };
            Err(PluginError::ProcessCrash {
                plugin: plugin.to_string(),
                status,
            })
        }
        Waited::Line(Err(e)) => Err(PluginError::ProcessCrash {
            plugin: plugin.to_string(),
            status: format!("failed to read stdout: {}", e),
        }),
        Waited::TimedOut => {
            tracing::warn!("Plugin '{}' did not complete handshake within {:?}", plugin, timeout);
            Err(PluginError::HandshakeTimeout {
                plugin: plugin.to_string(),
                timeout,
            })
        }
        Waited::Exited(status) => Err(PluginError::ProcessCrash {
            plugin: plugin.to_string(),
            status: match status {
                Ok(s) => s.to_string(),
                Err(e) => format!("wait failed: {}", e),
            },
        }),
    }
}

/// SIGTERM, then SIGKILL after `grace`. Always reaps the child.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!("SIGTERM to pid {} failed: {}", pid, e);
            } else if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                return Some(status);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill plugin process: {}", e);
    }
    child.try_wait().ok().flatten()
}

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32) -> anyhow::Result<()> {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| anyhow::anyhow!("Failed to kill PID {}: {}", pid, e))?;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| anyhow::anyhow!("Failed to kill PID {}: {}", pid, e))?;
    }
    Ok(())
}
