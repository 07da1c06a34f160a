//! 핸드셰이크 이후의 와이어 프레이밍
//!
//! 연결된 스트림 위에서 줄 단위 JSON 프레임을 주고받습니다. 첫 프레임은
//! 항상 플러그인이 보내는 `hello`이며, 이후 `request`/`response`가 id로
//! 짝지어집니다. 메서드 내용 자체는 이 크레이트의 관심사가 아닙니다.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::plugin::handshake::{HandshakeLine, Network};
use crate::plugin::tls;

/// 한 프레임의 최대 크기 (바이트)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        cookie_key: String,
        cookie_value: String,
        protocol_version: u32,
    },
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    pub fn ok(id: u64, result: Value) -> Self {
        Frame::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Frame::Response {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// `Ok(None)` on clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    read_frame_limited(reader, MAX_FRAME_BYTES).await
}

/// 한 줄을 읽는 동안 `limit` 바이트 이상은 버퍼에 쌓지 않음
async fn read_frame_limited<R>(reader: &mut R, limit: usize) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = (&mut *reader).take(limit as u64 + 1).read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > limit && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", limit),
            ));
        }
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
    }
}

/// Any bidirectional byte stream a session can run over.
pub trait PluginStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PluginStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn PluginStream>;

/// Connect to the address announced in a handshake line, wrapping the
/// stream in TLS when a client config is supplied.
pub async fn connect(
    line: &HandshakeLine,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> io::Result<BoxedStream> {
    match line.network {
        Network::Tcp => {
            let stream = TcpStream::connect(&line.address).await?;
            stream.set_nodelay(true)?;
            wrap_client(stream, tls_config).await
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(Path::new(&line.address)).await?;
            wrap_client(stream, tls_config).await
        }
        #[cfg(not(unix))]
        Network::Unix => {
            let _ = Path::new(&line.address);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ))
        }
    }
}

async fn wrap_client<S>(
    stream: S,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> io::Result<BoxedStream>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tls_config {
        Some(config) => {
            let name = tls::server_name().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let connector = tokio_rustls::TlsConnector::from(config);
            let tls_stream = connector.connect(name, stream).await?;
            Ok(Box::new(tls_stream))
        }
        None => Ok(Box::new(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_frame_wire_shape() {
        let hello = Frame::Hello {
            cookie_key: "K".into(),
            cookie_value: "V".into(),
            protocol_version: 6,
        };
        let v = serde_json::to_value(&hello).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["protocol_version"], 6);

        let v = serde_json::to_value(Frame::ok(3, json!({"a": 1}))).unwrap();
        assert_eq!(v, json!({"type": "response", "id": 3, "result": {"a": 1}}));

        let v = serde_json::to_value(Frame::err(4, "boom")).unwrap();
        assert_eq!(v, json!({"type": "response", "id": 4, "error": "boom"}));
    }

    #[test]
    fn test_request_params_default_to_null() {
        let frame: Frame = serde_json::from_str(r#"{"type":"request","id":1,"method":"provider.echo"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Request {
                id: 1,
                method: "provider.echo".into(),
                params: Value::Null
            }
        );
    }

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (mut a, b) = tokio::io::duplex(4096);
        write_frame(&mut a, &Frame::ok(1, json!("x"))).await.unwrap();
        write_frame(&mut a, &Frame::err(2, "nope")).await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Frame::ok(1, json!("x"))));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(Frame::err(2, "nope")));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_while_reading() {
        let (mut a, b) = tokio::io::duplex(4096);
        write_frame(&mut a, &Frame::ok(1, json!("ok"))).await.unwrap();
        a.write_all(&[b'x'; 1024]).await.unwrap();
        a.write_all(b"\n").await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        assert_eq!(
            read_frame_limited(&mut reader, 64).await.unwrap(),
            Some(Frame::ok(1, json!("ok")))
        );
        let err = read_frame_limited(&mut reader, 64).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("64"));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_invalid_data() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b"\n{not json}\n").await.unwrap();
        drop(a);
        let mut reader = BufReader::new(b);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
