//! Plugin-side serving half
//!
//! 플러그인 바이너리는 `serve()`를 호출해 다음을 수행합니다:
//! 1. 환경 변수의 매직 쿠키 확인 (직접 실행 방지)
//! 2. 호스트가 광고한 버전 목록과 협상
//! 3. AutoMTLS: 자체 인증서 생성, 호스트 인증서 지문 고정
//! 4. 루프백 포트 바인드 후 표준 출력에 핸드셰이크 라인 출력
//! 5. 단일 연결 수락, hello 프레임 전송, 요청 처리

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::plugin::handshake::{HandshakeLine, Network};
use crate::plugin::tls::{self, TlsError, TlsIdentity, ENV_CLIENT_CERT};
use crate::plugin::versions::{parse_version_list, ENV_PROTOCOL_VERSIONS};
use crate::plugin::{HandshakeConfig, VersionedProtocols, HANDSHAKE};
use crate::rpc::{self, BoxedStream, Frame};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Dispatches `service.method` calls. An `Err` is returned to the host as
/// a remote error.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, method: &str, params: Value) -> HandlerFuture;
}

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub handshake: HandshakeConfig,
    pub protocols: VersionedProtocols,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE,
            protocols: VersionedProtocols::default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error(
        "This binary is a plugin. It is not meant to be executed directly; \
         run the host application that uses it instead."
    )]
    NotLaunchedByHost,

    #[error("invalid PLUGIN_PROTOCOL_VERSIONS from host: {0}")]
    InvalidVersionList(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve using the real process environment, announcing on stdout.
pub async fn serve<H: Handler>(config: ServeConfig, handler: H) -> Result<(), ServeError> {
    serve_with_env(config, handler, |key| std::env::var(key).ok(), tokio::io::stdout()).await
}

/// Version chosen by the plugin: highest in common with the host, else its
/// own highest so the host can report the mismatch.
fn choose_version<F>(config: &ServeConfig, lookup: &F) -> Result<u32, ServeError>
where
    F: Fn(&str) -> Option<String>,
{
    let host_versions = match lookup(ENV_PROTOCOL_VERSIONS) {
        Some(list) if !list.trim().is_empty() => {
            parse_version_list(&list).map_err(ServeError::InvalidVersionList)?
        }
        _ => vec![config.handshake.protocol_version],
    };
    let version = config
        .protocols
        .negotiate(&host_versions)
        .or_else(|| config.protocols.highest())
        .unwrap_or(config.handshake.protocol_version);
    if !host_versions.contains(&version) {
        tracing::warn!(
            "No protocol version in common with host (host {:?}, plugin {:?})",
            host_versions,
            config.protocols.versions()
        );
    }
    Ok(version)
}

pub async fn serve_with_env<H, F, W>(
    config: ServeConfig,
    handler: H,
    lookup: F,
    mut announce: W,
) -> Result<(), ServeError>
where
    H: Handler,
    F: Fn(&str) -> Option<String>,
    W: AsyncWrite + Unpin,
{
    let cookie = lookup(config.handshake.magic_cookie_key);
    if cookie.as_deref() != Some(config.handshake.magic_cookie_value) {
        return Err(ServeError::NotLaunchedByHost);
    }

    let version = choose_version(&config, &lookup)?;

    // 호스트가 인증서를 넘겨준 경우에만 TLS
    let mut identity: Option<TlsIdentity> = None;
    let acceptor = match lookup(ENV_CLIENT_CERT).filter(|pem| !pem.trim().is_empty()) {
        Some(pem) => {
            let host_cert = tls::parse_pem_certificate(&pem)?;
            let own = TlsIdentity::generate("saba-plugin")?;
            let server_config = tls::server_config(&own, host_cert.as_ref())?;
            identity = Some(own);
            Some(tokio_rustls::TlsAcceptor::from(server_config))
        }
        None => None,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let mut line = HandshakeLine::new(version, Network::Tcp, &addr.to_string());
    if let Some(own) = &identity {
        line = line.with_server_cert(own.cert_der().to_vec());
    }

    announce.write_all(format!("{}\n", line).as_bytes()).await?;
    announce.flush().await?;
    tracing::info!("Plugin listening on {} (protocol v{}, tls: {})", addr, version, acceptor.is_some());

    let (socket, peer) = listener.accept().await?;
    socket.set_nodelay(true)?;
    drop(listener);
    tracing::debug!("Host connected from {}", peer);

    let stream: BoxedStream = match acceptor {
        Some(acceptor) => Box::new(acceptor.accept(socket).await?),
        None => Box::new(socket),
    };

    run_connection(&config, version, Arc::new(handler), stream).await
}

async fn run_connection<H: Handler>(
    config: &ServeConfig,
    version: u32,
    handler: Arc<H>,
    stream: BoxedStream,
) -> Result<(), ServeError> {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    rpc::write_frame(
        &mut write,
        &Frame::Hello {
            cookie_key: config.handshake.magic_cookie_key.to_string(),
            cookie_value: config.handshake.magic_cookie_value.to_string(),
            protocol_version: version,
        },
    )
    .await?;

    let services: Vec<String> = config
        .protocols
        .services(version)
        .unwrap_or_default()
        .iter()
        .map(|s| s.name.clone())
        .collect();

    let (tx, mut rx) = mpsc::channel::<Frame>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = rpc::write_frame(&mut write, &frame).await {
                tracing::debug!("Response writer stopped: {}", e);
                break;
            }
        }
    });

    loop {
        let frame = match rpc::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!("Host closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Failed to read from host: {}", e);
                break;
            }
        };

        match frame {
            Frame::Request { id, method, params } => {
                let service = method.split('.').next().unwrap_or(&method);
                if !services.iter().any(|s| s == service) {
                    let message = format!("unknown service '{}' at protocol v{}", service, version);
                    let _ = tx.send(Frame::err(id, message)).await;
                    continue;
                }
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = match handler.call(&method, params).await {
                        Ok(result) => Frame::ok(id, result),
                        Err(message) => Frame::err(id, message),
                    };
                    let _ = tx.send(response).await;
                });
            }
            other => tracing::warn!("Ignoring unexpected frame from host: {:?}", other),
        }
    }

    drop(tx);
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::tls::client_config;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::io::AsyncBufReadExt;

    struct Echo;

    impl Handler for Echo {
        fn call(&self, method: &str, params: Value) -> HandlerFuture {
            let method = method.to_string();
            Box::pin(async move {
                match method.as_str() {
                    "provider.echo" => Ok(params),
                    _ => Err(format!("no such method: {}", method)),
                }
            })
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn cookie() -> (&'static str, &'static str) {
        (HANDSHAKE.magic_cookie_key, HANDSHAKE.magic_cookie_value)
    }

    /// Start serving in the background and return the announced line.
    async fn start(pairs: Vec<(String, String)>) -> (HandshakeLine, tokio::task::JoinHandle<Result<(), ServeError>>) {
        let (announce, out) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(async move {
            let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            serve_with_env(ServeConfig::default(), Echo, env(&pairs), announce).await
        });
        let mut lines = tokio::io::BufReader::new(out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        (line.parse().unwrap(), task)
    }

    #[tokio::test]
    async fn test_refuses_without_cookie() {
        let (announce, _out) = tokio::io::duplex(1024);
        let err = serve_with_env(ServeConfig::default(), Echo, env(&[]), announce)
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::NotLaunchedByHost));
        assert!(err.to_string().contains("not meant to be executed directly"));
    }

    #[tokio::test]
    async fn test_refuses_wrong_cookie() {
        let (announce, _out) = tokio::io::duplex(1024);
        let err = serve_with_env(
            ServeConfig::default(),
            Echo,
            env(&[(HANDSHAKE.magic_cookie_key, "nope")]),
            announce,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServeError::NotLaunchedByHost));
    }

    #[test]
    fn test_choose_version() {
        let (k, v) = cookie();
        let config = ServeConfig::default();
        assert_eq!(choose_version(&config, &env(&[(k, v), (ENV_PROTOCOL_VERSIONS, "5,6")])).unwrap(), 6);
        assert_eq!(choose_version(&config, &env(&[(ENV_PROTOCOL_VERSIONS, "5")])).unwrap(), 5);
        // 목록이 없으면 기본 버전
        assert_eq!(choose_version(&config, &env(&[])).unwrap(), HANDSHAKE.protocol_version);
        // 공통 버전이 없으면 자신의 최고 버전을 알림
        assert_eq!(choose_version(&config, &env(&[(ENV_PROTOCOL_VERSIONS, "9")])).unwrap(), 6);
        assert!(matches!(
            choose_version(&config, &env(&[(ENV_PROTOCOL_VERSIONS, "5,x")])),
            Err(ServeError::InvalidVersionList(_))
        ));
    }

    #[tokio::test]
    async fn test_insecure_session() {
        let (k, v) = cookie();
        let (line, task) = start(vec![(k.into(), v.into()), (ENV_PROTOCOL_VERSIONS.into(), "5,6".into())]).await;
        assert_eq!(line.protocol_version, 6);
        assert!(line.server_cert.is_none());

        let stream = rpc::connect(&line, None).await.unwrap();
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);

        let hello = rpc::read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            hello,
            Frame::Hello {
                cookie_key: k.into(),
                cookie_value: v.into(),
                protocol_version: 6
            }
        );

        let req = Frame::Request {
            id: 7,
            method: "provider.echo".into(),
            params: json!({"hi": 1}),
        };
        rpc::write_frame(&mut write, &req).await.unwrap();
        assert_eq!(
            rpc::read_frame(&mut reader).await.unwrap(),
            Some(Frame::ok(7, json!({"hi": 1})))
        );

        // v6에는 provisioner 서비스가 없음
        let req = Frame::Request {
            id: 8,
            method: "provisioner.run".into(),
            params: Value::Null,
        };
        rpc::write_frame(&mut write, &req).await.unwrap();
        match rpc::read_frame(&mut reader).await.unwrap() {
            Some(Frame::Response { id: 8, error: Some(msg), .. }) => assert!(msg.contains("provisioner")),
            other => panic!("unexpected {:?}", other),
        }

        drop(write);
        drop(reader);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mutual_tls_session() {
        let (k, v) = cookie();
        let host = TlsIdentity::generate("host").unwrap();
        let (line, task) = start(vec![
            (k.into(), v.into()),
            (ENV_CLIENT_CERT.into(), host.cert_pem().to_string()),
        ])
        .await;
        let server_cert = line.server_cert.clone().expect("plugin must present a cert");

        let config = client_config(&host, &server_cert).unwrap();
        let stream = rpc::connect(&line, Some(config)).await.unwrap();
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);
        assert!(matches!(
            rpc::read_frame(&mut reader).await.unwrap(),
            Some(Frame::Hello { .. })
        ));

        rpc::write_frame(
            &mut write,
            &Frame::Request {
                id: 1,
                method: "provider.missing".into(),
                params: Value::Null,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            rpc::read_frame(&mut reader).await.unwrap(),
            Some(Frame::err(1, "no such method: provider.missing"))
        );

        drop(write);
        drop(reader);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mutual_tls_rejects_unpinned_host() {
        let (k, v) = cookie();
        let expected = TlsIdentity::generate("host").unwrap();
        let impostor = TlsIdentity::generate("impostor").unwrap();
        let (line, task) = start(vec![
            (k.into(), v.into()),
            (ENV_CLIENT_CERT.into(), expected.cert_pem().to_string()),
        ])
        .await;

        let config = client_config(&impostor, line.server_cert.as_deref().unwrap()).unwrap();
        // 핸드셰이크 또는 첫 읽기 중 하나는 실패해야 함
        let failed = match rpc::connect(&line, Some(config)).await {
            Err(_) => true,
            Ok(stream) => {
                let (read, _write) = tokio::io::split(stream);
                let mut reader = BufReader::new(read);
                !matches!(rpc::read_frame(&mut reader).await, Ok(Some(Frame::Hello { .. })))
            }
        };
        assert!(failed);
        assert!(task.await.unwrap().is_err());
    }
}
