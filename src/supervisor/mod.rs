pub mod error;
pub mod process;
pub mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{HostConfig, SecurityMode};
use crate::plugin::handshake::{HandshakeLine, CORE_PROTOCOL_VERSION, ENV_CORE_PROTOCOL_VERSION};
use crate::plugin::tls::{self, TlsIdentity, ENV_CLIENT_CERT};
use crate::plugin::versions::ENV_PROTOCOL_VERSIONS;
use crate::plugin::{HandshakeConfig, LaunchSpec, PluginMetadata, VersionedProtocols, HANDSHAKE};
use crate::rpc::{self, Frame};
use session::SessionParts;

pub use error::{CallError, PluginError};
pub use session::{ClientSession, SessionInfo};

/// 종료 요청(SIGTERM) 후 강제 종료까지 기다리는 시간
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Book-keeping for one managed session, used for host-wide shutdown.
#[derive(Clone)]
struct ManagedEntry {
    plugin: String,
    pid: Option<u32>,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
}

type SessionRegistry = Arc<Mutex<HashMap<Uuid, ManagedEntry>>>;

/// A launch spec with handshake and security material attached.
pub struct PreparedLaunch {
    pub spec: LaunchSpec,
    identity: Option<TlsIdentity>,
}

impl PreparedLaunch {
    pub fn env(&self) -> &[(String, String)] {
        &self.spec.env
    }

    pub fn client_fingerprint(&self) -> Option<&str> {
        self.identity.as_ref().map(|id| id.fingerprint())
    }
}

/// Launches plugins and tracks their sessions.
///
/// The security mode, handshake descriptor and protocol registry are fixed
/// at construction and shared read-only by every session.
pub struct PluginHost {
    config: HostConfig,
    handshake: HandshakeConfig,
    protocols: Arc<VersionedProtocols>,
    grace: Duration,
    sessions: SessionRegistry,
}

impl PluginHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            handshake: HANDSHAKE,
            protocols: Arc::new(VersionedProtocols::default()),
            grace: DEFAULT_GRACE_PERIOD,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_protocols(mut self, protocols: VersionedProtocols) -> Self {
        self.protocols = Arc::new(protocols);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn security(&self) -> SecurityMode {
        self.config.security
    }

    pub fn protocols(&self) -> &VersionedProtocols {
        &self.protocols
    }

    /// Resolve launch parameters for `metadata` and start it.
    pub async fn start(&self, metadata: &PluginMetadata) -> Result<Arc<ClientSession>, PluginError> {
        tracing::info!(
            "Starting plugin '{}' v{} from {}",
            metadata.name,
            metadata.version,
            metadata.path.display()
        );
        self.start_spec(LaunchSpec::resolve(metadata, &self.config)).await
    }

    /// Attach the cookie, the advertised versions and (AutoMTLS) a fresh
    /// client certificate to the launch environment.
    pub fn prepare(&self, mut spec: LaunchSpec) -> Result<PreparedLaunch, PluginError> {
        spec.set_env(self.handshake.magic_cookie_key, self.handshake.magic_cookie_value);
        spec.set_env(ENV_PROTOCOL_VERSIONS, &self.protocols.advertise());
        spec.set_env(ENV_CORE_PROTOCOL_VERSION, &CORE_PROTOCOL_VERSION.to_string());

        let identity = match self.config.security {
            SecurityMode::AutoMtls => {
                let identity = TlsIdentity::generate("saba-plugin-host")
                    .map_err(|e| PluginError::transport(&spec.plugin_name, e))?;
                spec.set_env(ENV_CLIENT_CERT, identity.cert_pem());
                Some(identity)
            }
            SecurityMode::Insecure => {
                // 호출자가 넣은 인증서가 남아 있지 않도록 제거
                spec.env.retain(|(k, _)| k != ENV_CLIENT_CERT);
                None
            }
        };

        Ok(PreparedLaunch { spec, identity })
    }

    /// Spawn the subprocess, wait for its handshake and connect.
    ///
    /// On any failure after spawn the child is terminated before the error
    /// is returned. Dropping the returned future kills the child as well.
    pub async fn start_spec(&self, spec: LaunchSpec) -> Result<Arc<ClientSession>, PluginError> {
        let plugin = spec.plugin_name.clone();
        // 디버그 모드에서는 디버거와 플러그인 바이너리를 모두 확인
        process::check_executable(&plugin, &spec.executable)?;
        if spec.plugin_path != spec.executable {
            process::check_executable(&plugin, &spec.plugin_path)?;
        }

        let PreparedLaunch { spec, identity } = self.prepare(spec)?;
        let started = Instant::now();
        let mut child = process::spawn(&spec)?;
        tracing::info!(
            "Plugin '{}' spawned (pid {:?}){}",
            plugin,
            child.id(),
            if spec.debug { " under debugger" } else { "" }
        );

        if let Some(stderr) = child.stderr.take() {
            process::forward_stderr(plugin.clone(), stderr);
        }

        match self.handshake_and_connect(&plugin, &spec, &mut child, identity.as_ref(), started).await {
            Ok((line, reader, writer)) => {
                let services = self
                    .protocols
                    .services(line.protocol_version)
                    .map(|s| s.to_vec())
                    .unwrap_or_default();
                let registry = self.sessions.clone();
                let session = ClientSession::spawn(SessionParts {
                    plugin: plugin.clone(),
                    child,
                    protocol_version: line.protocol_version,
                    services,
                    reader,
                    writer,
                    identity,
                    grace: self.grace,
                    on_exit: Box::new(move |id| {
                        registry.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    }),
                });
                self.register(&session);
                Ok(session)
            }
            Err(e) => {
                tracing::error!("{}", e);
                process::terminate(&mut child, self.grace).await;
                Err(e)
            }
        }
    }

    async fn handshake_and_connect(
        &self,
        plugin: &str,
        spec: &LaunchSpec,
        child: &mut Child,
        identity: Option<&TlsIdentity>,
        started: Instant,
    ) -> Result<
        (
            HandshakeLine,
            BufReader<tokio::io::ReadHalf<rpc::BoxedStream>>,
            tokio::io::WriteHalf<rpc::BoxedStream>,
        ),
        PluginError,
    > {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::transport(plugin, "plugin stdout was not captured"))?;
        let mut stdout = BufReader::new(stdout);
        let line = process::await_handshake(plugin, child, &mut stdout, spec.start_timeout).await?;
        process::forward_stdout(plugin.to_string(), stdout);

        if !self.protocols.supports(line.protocol_version) {
            return Err(PluginError::VersionMismatch {
                plugin: plugin.to_string(),
                host: self.protocols.versions(),
                offered: vec![line.protocol_version],
            });
        }

        let tls_config = match identity {
            Some(identity) => {
                let server_cert = line.server_cert.as_deref().ok_or_else(|| {
                    PluginError::transport(plugin, "plugin did not present a certificate under AutoMTLS")
                })?;
                Some(tls::client_config(identity, server_cert).map_err(|e| PluginError::transport(plugin, e))?)
            }
            None => {
                if line.server_cert.is_some() {
                    tracing::warn!("[{}] ignoring plugin certificate, transport TLS is disabled", plugin);
                }
                None
            }
        };

        // 남은 시작 타임아웃 안에서 연결 + hello까지 완료해야 함
        let remaining = spec
            .start_timeout
            .checked_sub(started.elapsed())
            .unwrap_or_default()
            .max(Duration::from_millis(500));

        let connected = tokio::time::timeout(remaining, async {
            let stream = rpc::connect(&line, tls_config)
                .await
                .map_err(|e| PluginError::transport(plugin, e))?;
            let (read, write) = tokio::io::split(stream);
            let mut reader = BufReader::new(read);
            self.expect_hello(plugin, &line, &mut reader).await?;
            Ok::<_, PluginError>((reader, write))
        })
        .await
        .map_err(|_| PluginError::HandshakeTimeout {
            plugin: plugin.to_string(),
            timeout: spec.start_timeout,
        })??;

        Ok((line, connected.0, connected.1))
    }

    /// The plugin must identify itself with the host's cookie before any
    /// call is dispatched.
    async fn expect_hello<R>(&self, plugin: &str, line: &HandshakeLine, reader: &mut R) -> Result<(), PluginError>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        match rpc::read_frame(reader).await {
            Ok(Some(Frame::Hello {
                cookie_key,
                cookie_value,
                protocol_version,
            })) => {
                if !self.handshake.cookie_matches(&cookie_key, &cookie_value) {
                    tracing::warn!("[{}] rejected: magic cookie mismatch", plugin);
                    return Err(PluginError::CookieMismatch {
                        plugin: plugin.to_string(),
                    });
                }
                if protocol_version != line.protocol_version {
                    return Err(PluginError::transport(
                        plugin,
                        format!(
                            "hello announced v{} but handshake line announced v{}",
                            protocol_version, line.protocol_version
                        ),
                    ));
                }
                Ok(())
            }
            Ok(Some(other)) => {
                tracing::warn!("[{}] rejected: expected hello, got {:?}", plugin, other);
                Err(PluginError::CookieMismatch {
                    plugin: plugin.to_string(),
                })
            }
            Ok(None) => Err(PluginError::transport(plugin, "connection closed before hello")),
            Err(e) => Err(PluginError::transport(plugin, e)),
        }
    }

    fn register(&self, session: &Arc<ClientSession>) {
        let entry = ManagedEntry {
            plugin: session.plugin().to_string(),
            pid: session.pid(),
            cancel: session.cancel_token(),
            exited: session.exit_watch(),
        };
        // 모니터는 exited 전송 후 레지스트리 락을 잡고 제거하므로, 락 안에서
        // 확인하면 종료된 세션이 남는 경우가 없음
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if *entry.exited.borrow() {
            return;
        }
        sessions.insert(session.id(), entry);
    }

    /// Snapshot of the sessions this host still manages.
    pub fn active_sessions(&self) -> Vec<(Uuid, String, Option<u32>)> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .map(|(id, e)| (*id, e.plugin.clone(), e.pid))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop every managed plugin. Survivors past the grace period are
    /// force-killed by PID.
    pub async fn shutdown(&self) {
        let entries: Vec<ManagedEntry> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.values().cloned().collect()
        };
        if entries.is_empty() {
            return;
        }
        tracing::info!("Shutting down {} plugin session(s)", entries.len());

        for entry in &entries {
            entry.cancel.cancel();
        }

        let wait = self.grace + Duration::from_secs(2);
        for mut entry in entries {
            let stopped = tokio::time::timeout(wait, entry.exited.wait_for(|done| *done))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if stopped {
                continue;
            }
            if let Some(pid) = entry.pid {
                if crate::process_monitor::is_running_async(pid).await {
                    tracing::warn!("Plugin '{}' (pid {}) did not stop, force killing", entry.plugin, pid);
                    if let Err(e) = process::force_kill_pid(pid) {
                        tracing::error!("{}", e);
                    }
                }
            }
        }
    }
}
