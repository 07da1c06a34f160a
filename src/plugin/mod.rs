//! Plugin launch & handshake building blocks.
//!
//! - [`launch`]: `LaunchSpec` 해석 (일반/디버그 모드)
//! - [`handshake`]: 매직 쿠키와 핸드셰이크 라인 문법
//! - [`versions`]: 프로토콜 버전별 서비스 레지스트리
//! - [`tls`]: AutoMTLS 인증서와 지문 고정 검증기

pub mod handshake;
pub mod launch;
pub mod tls;
pub mod versions;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use handshake::{HandshakeConfig, HandshakeLine, HANDSHAKE};
pub use launch::LaunchSpec;
pub use versions::{ServiceDescriptor, VersionedProtocols};

/// A resolved, installed plugin. Discovery happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub path: PathBuf,
    pub version: String,
}

impl PluginMetadata {
    pub fn new(name: &str, path: impl Into<PathBuf>, version: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            version: version.to_string(),
        }
    }

    /// 경로만 있을 때: 파일 이름에서 플러그인 이름을 추정
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string());
        Self {
            name,
            path,
            version: "0.0.0".to_string(),
        }
    }
}
