//! Client Session - one live, handshaken plugin connection
//!
//! 세션 하나당 태스크 세 개가 동작합니다:
//! - writer: 요청 프레임을 스트림에 기록
//! - reader: 응답 프레임을 id로 대기 중인 호출에 전달
//! - monitor: 자식 프로세스를 소유하고 종료/취소를 감시
//!
//! 세션 간에는 어떤 상태도 공유하지 않으므로, 한 세션을 닫아도 다른
//! 세션의 진행 중인 호출에는 영향이 없습니다.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::CallError;
use super::process;
use crate::plugin::tls::TlsIdentity;
use crate::plugin::ServiceDescriptor;
use crate::rpc::{self, BoxedStream, Frame};

/// 연결이 먼저 끊겼을 때 모니터가 프로세스 종료를 확인할 때까지 기다리는 시간
const EXIT_SETTLE: Duration = Duration::from_secs(1);

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CallError>>>>>;

/// 대기 중인 모든 호출을 같은 에러로 실패 처리
fn fail_pending(pending: &PendingCalls, error: CallError) {
    let drained: Vec<_> = {
        let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
        map.drain().collect()
    };
    if !drained.is_empty() {
        tracing::debug!("Failing {} in-flight call(s): {}", drained.len(), error);
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(error.clone()));
    }
}

/// Serializable snapshot of a session, for logs and status output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub plugin: String,
    pub pid: Option<u32>,
    pub protocol_version: u32,
    pub services: Vec<String>,
    pub alive: bool,
}

/// Everything the host hands over once the handshake has succeeded.
pub(crate) struct SessionParts {
    pub plugin: String,
    pub child: Child,
    pub protocol_version: u32,
    pub services: Vec<ServiceDescriptor>,
    pub reader: BufReader<ReadHalf<BoxedStream>>,
    pub writer: WriteHalf<BoxedStream>,
    pub identity: Option<TlsIdentity>,
    pub grace: Duration,
    pub on_exit: Box<dyn FnOnce(Uuid) + Send>,
}

pub struct ClientSession {
    id: Uuid,
    plugin: String,
    pid: Option<u32>,
    protocol_version: u32,
    services: Vec<ServiceDescriptor>,
    outgoing: mpsc::Sender<Frame>,
    pending: PendingCalls,
    next_id: AtomicU64,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
    crash: Arc<Mutex<Option<String>>>,
    disconnected: Arc<AtomicBool>,
    identity: Mutex<Option<TlsIdentity>>,
}

impl ClientSession {
    pub(crate) fn spawn(parts: SessionParts) -> Arc<Self> {
        let SessionParts {
            plugin,
            mut child,
            protocol_version,
            services,
            mut reader,
            mut writer,
            identity,
            grace,
            on_exit,
        } = parts;

        let id = Uuid::new_v4();
        let pid = child.id();
        let cancel = CancellationToken::new();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let crash: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let disconnected = Arc::new(AtomicBool::new(false));
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Frame>(256);
        let (exited_tx, exited_rx) = watch::channel(false);

        // ── writer ───────────────────────────────────────────
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = outgoing_rx.recv() => frame,
                    };
                    let Some(frame) = frame else { break };
                    if let Err(e) = rpc::write_frame(&mut writer, &frame).await {
                        tracing::debug!("Plugin session writer stopped: {}", e);
                        break;
                    }
                }
                let _ = writer.shutdown().await;
            });
        }

        // ── reader ───────────────────────────────────────────
        {
            let cancel = cancel.clone();
            let pending = pending.clone();
            let crash = crash.clone();
            let disconnected = disconnected.clone();
            let plugin = plugin.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = rpc::read_frame(&mut reader) => frame,
                    };
                    match frame {
                        Ok(Some(Frame::Response { id, result, error })) => {
                            let waiter = pending
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .remove(&id);
                            let outcome = match error {
                                Some(message) => Err(CallError::Remote(message)),
                                None => Ok(result.unwrap_or(Value::Null)),
                            };
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(outcome);
                                }
                                // 이미 타임아웃된 호출의 늦은 응답
                                None => tracing::debug!("[{}] dropping late response #{}", plugin, id),
                            }
                        }
                        Ok(Some(other)) => {
                            tracing::warn!("[{}] unexpected frame from plugin: {:?}", plugin, other);
                        }
                        Ok(None) => {
                            tracing::debug!("[{}] plugin closed the connection", plugin);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("[{}] failed to read from plugin: {}", plugin, e);
                            break;
                        }
                    }
                }

                // 프로세스가 죽으면 소켓 EOF가 먼저 도착하므로, 모니터가
                // 종료를 판정할 시간을 줌
                if !cancel.is_cancelled() {
                    let _ = tokio::time::timeout(EXIT_SETTLE, cancel.cancelled()).await;
                }
                let crashed = crash.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let error = match crashed {
                    Some(status) => CallError::ProcessCrash(status),
                    None if cancel.is_cancelled() => CallError::Cancelled,
                    None => CallError::Disconnected,
                };
                if error == CallError::Disconnected {
                    // 프로세스는 살아 있지만 연결이 끊김: 세션을 정리
                    tracing::warn!("[{}] connection lost, stopping session {}", plugin, id);
                    disconnected.store(true, Ordering::SeqCst);
                    fail_pending(&pending, error);
                    cancel.cancel();
                } else {
                    fail_pending(&pending, error);
                }
            });
        }

        // ── monitor ──────────────────────────────────────────
        {
            let cancel = cancel.clone();
            let pending = pending.clone();
            let crash = crash.clone();
            let plugin = plugin.clone();
            tokio::spawn(async move {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = cancel.cancelled() => None,
                };
                match exited {
                    Some(status) => {
                        let status = match status {
                            Ok(s) => s.to_string(),
                            Err(e) => format!("wait failed: {}", e),
                        };
                        tracing::warn!("Plugin '{}' (session {}) exited unexpectedly: {}", plugin, id, status);
                        *crash.lock().unwrap_or_else(|e| e.into_inner()) = Some(status.clone());
                        fail_pending(&pending, CallError::ProcessCrash(status));
                        cancel.cancel();
                    }
                    None => {
                        let status = process::terminate(&mut child, grace).await;
                        tracing::info!(
                            "Plugin '{}' (session {}) stopped: {}",
                            plugin,
                            id,
                            status.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".to_string())
                        );
                    }
                }
                let _ = exited_tx.send(true);
                on_exit(id);
            });
        }

        tracing::info!(
            "Plugin '{}' connected: session {}, protocol v{}, pid {:?}",
            plugin,
            id,
            protocol_version,
            pid
        );

        Arc::new(Self {
            id,
            plugin,
            pid,
            protocol_version,
            services,
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
            exited: exited_rx,
            crash,
            disconnected,
            identity: Mutex::new(identity),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Services of the negotiated protocol version.
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    /// TLS 지문 (AutoMTLS 세션이고 아직 닫히지 않은 경우)
    pub fn client_fingerprint(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|id| id.fingerprint().to_string())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            plugin: self.plugin.clone(),
            pid: self.pid,
            protocol_version: self.protocol_version,
            services: self.services.iter().map(|s| s.name.clone()).collect(),
            alive: self.is_alive(),
        }
    }

    fn closed_error(&self) -> CallError {
        match self.crash.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(status) => CallError::ProcessCrash(status),
            None if self.disconnected.load(Ordering::SeqCst) => CallError::Disconnected,
            None => CallError::Cancelled,
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Call `service.method` on the plugin, bounded by `deadline`.
    pub async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value, CallError> {
        if self.cancel.is_cancelled() {
            return Err(self.closed_error());
        }

        let service = method.split('.').next().unwrap_or(method);
        if !self.services.iter().any(|s| s.name == service) {
            return Err(CallError::UnknownService {
                service: service.to_string(),
                version: self.protocol_version,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };
        if self.outgoing.send(request).await.is_err() {
            self.forget(id);
            return Err(self.closed_error());
        }

        enum Outcome {
            Reply(Result<Result<Value, CallError>, oneshot::error::RecvError>),
            Cancelled,
            Deadline,
        }

        let outcome = tokio::select! {
            biased;
            reply = rx => Outcome::Reply(reply),
            _ = self.cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(deadline) => Outcome::Deadline,
        };

        match outcome {
            Outcome::Reply(Ok(result)) => result,
            Outcome::Reply(Err(_)) => Err(CallError::Disconnected),
            Outcome::Cancelled => {
                self.forget(id);
                Err(self.closed_error())
            }
            Outcome::Deadline => {
                self.forget(id);
                tracing::debug!("[{}] call '{}' #{} exceeded {:?}", self.plugin, method, id, deadline);
                Err(CallError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Terminate the plugin and release per-session key material.
    ///
    /// In-flight calls fail with [`CallError::Cancelled`]. Idempotent.
    pub async fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Closing plugin '{}' session {}", self.plugin, self.id);
        }
        self.cancel.cancel();
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
        self.identity.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn exit_watch(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        // 모니터 태스크가 프로세스를 정리
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("pid", &self.pid)
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_parts(
    child: Child,
    stream: BoxedStream,
    on_exit: Box<dyn FnOnce(Uuid) + Send>,
) -> SessionParts {
    let (read, writer) = tokio::io::split(stream);
    SessionParts {
        plugin: "sh-test".to_string(),
        child,
        protocol_version: 6,
        services: vec![ServiceDescriptor::new("provider")],
        reader: BufReader::new(read),
        writer,
        identity: None,
        grace: Duration::from_millis(200),
        on_exit,
    }
}
