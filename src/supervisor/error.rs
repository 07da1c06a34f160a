//! 플러그인 실행/연결 에러 타입. 호출자가 플러그인 이름과 실패 종류를
//! 보고 재시도 여부를 결정할 수 있도록 구분합니다.

use std::path::PathBuf;
use std::time::Duration;

use crate::plugin::handshake::HandshakeParseError;

/// Failure to launch or connect to one plugin. Never fatal to the host.
#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    #[error("Plugin '{plugin}': executable {} not found", path.display())]
    ExecutableMissing { plugin: String, path: PathBuf },

    #[error("Plugin '{plugin}': {} is not executable", path.display())]
    NotExecutable { plugin: String, path: PathBuf },

    #[error("Plugin '{plugin}': failed to spawn process: {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin '{plugin}': no handshake within {}s", timeout.as_secs_f32())]
    HandshakeTimeout { plugin: String, timeout: Duration },

    #[error("Plugin '{plugin}': malformed handshake line: {source}")]
    Handshake {
        plugin: String,
        #[source]
        source: HandshakeParseError,
    },

    #[error("Plugin '{plugin}': magic cookie mismatch, not a compatible plugin")]
    CookieMismatch { plugin: String },

    #[error("Plugin '{plugin}': no common protocol version (host {host:?}, plugin {offered:?})")]
    VersionMismatch {
        plugin: String,
        host: Vec<u32>,
        offered: Vec<u32>,
    },

    #[error("Plugin '{plugin}': transport error: {reason}")]
    Transport { plugin: String, reason: String },

    #[error("Plugin '{plugin}': process exited unexpectedly ({status})")]
    ProcessCrash { plugin: String, status: String },
}

impl PluginError {
    pub fn plugin(&self) -> &str {
        match self {
            Self::ExecutableMissing { plugin, .. }
            | Self::NotExecutable { plugin, .. }
            | Self::Spawn { plugin, .. }
            | Self::HandshakeTimeout { plugin, .. }
            | Self::Handshake { plugin, .. }
            | Self::CookieMismatch { plugin }
            | Self::VersionMismatch { plugin, .. }
            | Self::Transport { plugin, .. }
            | Self::ProcessCrash { plugin, .. } => plugin,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutableMissing { .. } | Self::NotExecutable { .. } | Self::Spawn { .. } => {
                "LAUNCH_ERROR"
            }
            Self::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            Self::Handshake { .. } => "HANDSHAKE_INVALID",
            Self::CookieMismatch { .. } => "COOKIE_MISMATCH",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::ProcessCrash { .. } => "PROCESS_CRASH",
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "plugin": self.plugin(),
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    pub(crate) fn transport(plugin: &str, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failure of a single call on an established session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("call cancelled: session closed")]
    Cancelled,

    #[error("call deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),

    #[error("service '{service}' is not available at protocol version {version}")]
    UnknownService { service: String, version: u32 },

    #[error("plugin returned error: {0}")]
    Remote(String),

    #[error("plugin process exited ({0})")]
    ProcessCrash(String),

    #[error("connection to plugin closed")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_per_kind() {
        let errors = vec![
            PluginError::ExecutableMissing {
                plugin: "p".into(),
                path: PathBuf::from("/x"),
            },
            PluginError::HandshakeTimeout {
                plugin: "p".into(),
                timeout: Duration::from_secs(1),
            },
            PluginError::CookieMismatch { plugin: "p".into() },
            PluginError::VersionMismatch {
                plugin: "p".into(),
                host: vec![1],
                offered: vec![2],
            },
            PluginError::transport("p", "bad cert"),
            PluginError::ProcessCrash {
                plugin: "p".into(),
                status: "exit status: 1".into(),
            },
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.error_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(errors.iter().all(|e| e.plugin() == "p"));
    }

    #[test]
    fn test_to_json_carries_plugin_identity() {
        let err = PluginError::VersionMismatch {
            plugin: "hcloud".into(),
            host: vec![1],
            offered: vec![2],
        };
        let json = err.to_json();
        assert_eq!(json["plugin"], "hcloud");
        assert_eq!(json["error_code"], "VERSION_MISMATCH");
        assert!(json["error"].as_str().unwrap().contains("hcloud"));
    }

    #[test]
    fn test_launch_variants_share_code() {
        let missing = PluginError::ExecutableMissing {
            plugin: "p".into(),
            path: PathBuf::from("/x"),
        };
        let spawn = PluginError::Spawn {
            plugin: "p".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(missing.error_code(), spawn.error_code());
    }
}
