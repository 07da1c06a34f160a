//! 호스트 설정. 디버거 오버라이드와 전송 보안 모드를 시작 시 한 번만 해석합니다.
//!
//! 우선순위: 환경 변수 > `config/plugin-host.toml` > 기본값.
//! 잘못된 디버그 오버라이드는 서브프로세스가 생기기 전에 `ConfigError`로 반환되며,
//! 프로세스를 종료할지는 엔트리 포인트가 결정합니다.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_DEBUGGER: &str = "SABA_PLUGIN_DEBUGGER";
pub const ENV_DEBUGGER_LISTEN_ADDR: &str = "SABA_PLUGIN_DEBUGGER_LISTEN_ADDR";
pub const ENV_DEBUGGER_LISTEN_PORT: &str = "SABA_PLUGIN_DEBUGGER_LISTEN_PORT";
pub const ENV_DEBUGGER_API_VERSION: &str = "SABA_PLUGIN_DEBUGGER_API_VERSION";
/// Intended for plugin test harnesses only. End users should leave it unset.
pub const ENV_DISABLE_PLUGIN_TLS: &str = "SABA_DISABLE_PLUGIN_TLS";
pub const ENV_START_TIMEOUT_SECS: &str = "SABA_PLUGIN_START_TIMEOUT_SECS";

/// 기본 설정 파일 경로
pub const DEFAULT_CONFIG_PATH: &str = "config/plugin-host.toml";

/// 일반 모드 기본 시작 타임아웃 (초)
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("SABA_PLUGIN_DEBUGGER={} does not exist", .0.display())]
    DebuggerMissing(PathBuf),

    #[error("SABA_PLUGIN_DEBUGGER={} is not executable", .0.display())]
    DebuggerNotExecutable(PathBuf),

    #[error("SABA_PLUGIN_DEBUGGER_LISTEN_PORT={0} is invalid")]
    InvalidPort(String),

    #[error("SABA_PLUGIN_DEBUGGER_API_VERSION={value} is invalid (must be between {min} and {max})")]
    InvalidApiVersion { value: String, min: u32, max: u32 },

    #[error("SABA_PLUGIN_START_TIMEOUT_SECS={0} is invalid")]
    InvalidTimeout(String),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DebuggerMissing(_) | Self::DebuggerNotExecutable(_) => "DEBUGGER_VALIDATION_FAILED",
            Self::InvalidPort(_) | Self::InvalidApiVersion { .. } | Self::InvalidTimeout(_) => {
                "INVALID_CONFIG"
            }
            Self::Read { .. } | Self::Parse { .. } => "CONFIG_FILE_ERROR",
        }
    }
}

/// Transport security mode for every plugin launched by this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Ephemeral certificates per connection, pinned on both sides.
    #[default]
    AutoMtls,
    /// Cookie-only trust.
    Insecure,
}

impl SecurityMode {
    /// 플래그가 비어 있지 않으면 TLS 비활성화
    pub fn from_flag(flag: Option<&str>) -> Self {
        match flag {
            Some(v) if !v.is_empty() => SecurityMode::Insecure,
            _ => SecurityMode::AutoMtls,
        }
    }

    pub fn is_mtls(&self) -> bool {
        matches!(self, SecurityMode::AutoMtls)
    }
}

/// Policy knobs for debug-mode launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugPolicy {
    pub listen_addr: String,
    pub listen_port: u16,
    pub api_version: u32,
    pub api_versions: RangeInclusive<u32>,
    /// 디버거 세션은 사람이 붙어서 조작하므로 훨씬 긴 타임아웃을 사용
    pub start_timeout: Duration,
}

impl Default for DebugPolicy {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 2345,
            api_version: 2,
            api_versions: 1..=2,
            start_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// A validated debugger launch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerConfig {
    pub executable: PathBuf,
    pub listen_addr: String,
    pub listen_port: u16,
    pub api_version: u32,
}

impl DebuggerConfig {
    pub fn listen(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

/// Raw, unvalidated settings as they appear in the TOML file or the environment.
#[derive(Debug, Clone, Default)]
pub struct RawSettings {
    pub debugger: Option<String>,
    pub debugger_listen_addr: Option<String>,
    pub debugger_listen_port: Option<String>,
    pub debugger_api_version: Option<String>,
    pub disable_plugin_tls: Option<String>,
    pub start_timeout_secs: Option<String>,
}

impl RawSettings {
    /// 설정 파일 읽기. 파일이 없으면 빈 설정.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No plugin host config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// TOML 본문 파싱. 숫자/불리언 값도 문자열로 정규화해서 환경 변수와 같은 경로로 검증합니다.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let table: toml::value::Table = toml::from_str(content)?;
        let get = |key: &str| -> Option<String> {
            table.get(key).and_then(|v| match v {
                toml::Value::String(s) => Some(s.clone()),
                toml::Value::Integer(i) => Some(i.to_string()),
                toml::Value::Boolean(true) => Some("1".to_string()),
                toml::Value::Boolean(false) => None,
                other => Some(other.to_string()),
            })
        };
        Ok(Self {
            debugger: get("debugger"),
            debugger_listen_addr: get("debugger_listen_addr"),
            debugger_listen_port: get("debugger_listen_port"),
            debugger_api_version: get("debugger_api_version"),
            disable_plugin_tls: get("disable_plugin_tls"),
            start_timeout_secs: get("start_timeout_secs"),
        })
    }

    /// Overlay non-empty values from a lookup (normally `std::env::var`).
    pub fn overlay<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |current: Option<String>, key: &str| match lookup(key) {
            Some(v) if !v.is_empty() => Some(v),
            _ => current,
        };
        self.debugger = pick(self.debugger, ENV_DEBUGGER);
        self.debugger_listen_addr = pick(self.debugger_listen_addr, ENV_DEBUGGER_LISTEN_ADDR);
        self.debugger_listen_port = pick(self.debugger_listen_port, ENV_DEBUGGER_LISTEN_PORT);
        self.debugger_api_version = pick(self.debugger_api_version, ENV_DEBUGGER_API_VERSION);
        self.disable_plugin_tls = pick(self.disable_plugin_tls, ENV_DISABLE_PLUGIN_TLS);
        self.start_timeout_secs = pick(self.start_timeout_secs, ENV_START_TIMEOUT_SECS);
        self
    }
}

/// Host-wide plugin launch configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub security: SecurityMode,
    pub debugger: Option<DebuggerConfig>,
    pub start_timeout: Duration,
    pub policy: DebugPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            security: SecurityMode::AutoMtls,
            debugger: None,
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            policy: DebugPolicy::default(),
        }
    }
}

impl HostConfig {
    /// Load from the config file (if present) with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let raw = RawSettings::from_file(path)?.overlay(|k| std::env::var(k).ok());
        Self::resolve(raw, DebugPolicy::default())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::resolve(RawSettings::default().overlay(lookup), DebugPolicy::default())
    }

    /// Validate raw settings against a debug policy.
    pub fn resolve(raw: RawSettings, policy: DebugPolicy) -> Result<Self, ConfigError> {
        let security = SecurityMode::from_flag(raw.disable_plugin_tls.as_deref());

        let start_timeout = match raw.start_timeout_secs.as_deref() {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| ConfigError::InvalidTimeout(v.to_string()))?,
            None => Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
        };

        let debugger = match raw.debugger.as_deref() {
            Some(path) if !path.is_empty() => Some(resolve_debugger(&raw, path, &policy)?),
            _ => None,
        };

        if security == SecurityMode::Insecure {
            tracing::warn!("Plugin transport TLS disabled via {}", ENV_DISABLE_PLUGIN_TLS);
        }
        if let Some(dbg) = &debugger {
            tracing::info!(
                "Plugin debugging enabled: {} listening on {} (api v{})",
                dbg.executable.display(),
                dbg.listen(),
                dbg.api_version
            );
        }

        Ok(Self {
            security,
            debugger,
            start_timeout,
            policy,
        })
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}

fn resolve_debugger(
    raw: &RawSettings,
    path: &str,
    policy: &DebugPolicy,
) -> Result<DebuggerConfig, ConfigError> {
    let executable = PathBuf::from(path);
    check_executable(&executable)?;

    let listen_addr = raw
        .debugger_listen_addr
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| policy.listen_addr.clone());

    let listen_port = match raw.debugger_listen_port.as_deref() {
        Some(v) => v
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(v.to_string()))?,
        None => policy.listen_port,
    };

    let api_version = match raw.debugger_api_version.as_deref() {
        Some(v) => v
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| policy.api_versions.contains(n))
            .ok_or_else(|| ConfigError::InvalidApiVersion {
                value: v.to_string(),
                min: *policy.api_versions.start(),
                max: *policy.api_versions.end(),
            })?,
        None => policy.api_version,
    };

    Ok(DebuggerConfig {
        executable,
        listen_addr,
        listen_port,
        api_version,
    })
}

/// 디버거 실행 파일 존재 + 실행 권한 확인
fn check_executable(path: &Path) -> Result<(), ConfigError> {
    let meta = std::fs::metadata(path).map_err(|_| ConfigError::DebuggerMissing(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(ConfigError::DebuggerNotExecutable(path.to_path_buf()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(ConfigError::DebuggerNotExecutable(path.to_path_buf()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[cfg(unix)]
    fn fake_debugger(dir: &Path, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("dlv");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_overrides() {
        let cfg = HostConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.security, SecurityMode::AutoMtls);
        assert!(cfg.debugger.is_none());
        assert_eq!(cfg.start_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_disable_flag_selects_insecure() {
        let cfg = HostConfig::from_lookup(lookup(&[(ENV_DISABLE_PLUGIN_TLS, "1")])).unwrap();
        assert_eq!(cfg.security, SecurityMode::Insecure);

        // 빈 값은 미설정과 동일
        let cfg = HostConfig::from_lookup(lookup(&[(ENV_DISABLE_PLUGIN_TLS, "")])).unwrap();
        assert_eq!(cfg.security, SecurityMode::AutoMtls);
    }

    #[test]
    fn test_missing_debugger_is_config_error() {
        let err = HostConfig::from_lookup(lookup(&[(ENV_DEBUGGER, "/definitely/not/here/dlv")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DebuggerMissing(_)));
        assert_eq!(err.error_code(), "DEBUGGER_VALIDATION_FAILED");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_debugger_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let dlv = fake_debugger(dir.path(), 0o644);
        let err = HostConfig::from_lookup(lookup(&[(ENV_DEBUGGER, dlv.to_str().unwrap())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DebuggerNotExecutable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_debugger_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let dlv = fake_debugger(dir.path(), 0o755);
        let cfg = HostConfig::from_lookup(lookup(&[(ENV_DEBUGGER, dlv.to_str().unwrap())])).unwrap();
        let dbg = cfg.debugger.unwrap();
        assert_eq!(dbg.executable, dlv);
        assert_eq!(dbg.listen(), "127.0.0.1:2345");
        assert_eq!(dbg.api_version, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_debugger_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let dlv = fake_debugger(dir.path(), 0o755);
        let cfg = HostConfig::from_lookup(lookup(&[
            (ENV_DEBUGGER, dlv.to_str().unwrap()),
            (ENV_DEBUGGER_LISTEN_ADDR, "0.0.0.0"),
            (ENV_DEBUGGER_LISTEN_PORT, "40000"),
            (ENV_DEBUGGER_API_VERSION, "1"),
        ]))
        .unwrap();
        let dbg = cfg.debugger.unwrap();
        assert_eq!(dbg.listen(), "0.0.0.0:40000");
        assert_eq!(dbg.api_version, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_unparsable_debug_numbers_fail() {
        let dir = tempfile::tempdir().unwrap();
        let dlv = fake_debugger(dir.path(), 0o755);
        let dlv = dlv.to_str().unwrap();

        let err = HostConfig::from_lookup(lookup(&[
            (ENV_DEBUGGER, dlv),
            (ENV_DEBUGGER_LISTEN_PORT, "twenty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(ref v) if v == "twenty"));

        let err = HostConfig::from_lookup(lookup(&[
            (ENV_DEBUGGER, dlv),
            (ENV_DEBUGGER_API_VERSION, "abc"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiVersion { .. }));

        // 범위 밖 버전도 거부
        let err = HostConfig::from_lookup(lookup(&[
            (ENV_DEBUGGER, dlv),
            (ENV_DEBUGGER_API_VERSION, "3"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiVersion { min: 1, max: 2, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_api_version_range_is_policy() {
        let dir = tempfile::tempdir().unwrap();
        let dlv = fake_debugger(dir.path(), 0o755);
        let raw = RawSettings::default().overlay(lookup(&[
            (ENV_DEBUGGER, dlv.to_str().unwrap()),
            (ENV_DEBUGGER_API_VERSION, "3"),
        ]));
        let policy = DebugPolicy {
            api_versions: 1..=3,
            ..DebugPolicy::default()
        };
        let cfg = HostConfig::resolve(raw, policy).unwrap();
        assert_eq!(cfg.debugger.unwrap().api_version, 3);
    }

    #[test]
    fn test_debug_numbers_ignored_without_debugger() {
        // 디버거가 설정되지 않으면 디버그 숫자 오버라이드는 검사하지 않음
        let cfg = HostConfig::from_lookup(lookup(&[(ENV_DEBUGGER_LISTEN_PORT, "nope")])).unwrap();
        assert!(cfg.debugger.is_none());
    }

    #[test]
    fn test_invalid_start_timeout() {
        let err = HostConfig::from_lookup(lookup(&[(ENV_START_TIMEOUT_SECS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout(_)));

        let cfg = HostConfig::from_lookup(lookup(&[(ENV_START_TIMEOUT_SECS, "5")])).unwrap();
        assert_eq!(cfg.start_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_toml_then_env_precedence() {
        let raw = RawSettings::from_toml(
            "disable_plugin_tls = true\nstart_timeout_secs = 30\n",
        )
        .unwrap();
        assert_eq!(raw.disable_plugin_tls.as_deref(), Some("1"));
        assert_eq!(raw.start_timeout_secs.as_deref(), Some("30"));

        let raw = raw.overlay(lookup(&[(ENV_START_TIMEOUT_SECS, "90")]));
        let cfg = HostConfig::resolve(raw, DebugPolicy::default()).unwrap();
        assert_eq!(cfg.security, SecurityMode::Insecure);
        assert_eq!(cfg.start_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_toml_false_flag_keeps_mtls() {
        let raw = RawSettings::from_toml("disable_plugin_tls = false\n").unwrap();
        let cfg = HostConfig::resolve(raw, DebugPolicy::default()).unwrap();
        assert_eq!(cfg.security, SecurityMode::AutoMtls);
    }

    #[test]
    fn test_missing_config_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let raw = RawSettings::from_file(&dir.path().join("absent.toml")).unwrap();
        assert!(raw.debugger.is_none());
    }

    #[test]
    fn test_broken_config_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin-host.toml");
        std::fs::write(&path, "debugger = [unterminated").unwrap();
        let err = RawSettings::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
