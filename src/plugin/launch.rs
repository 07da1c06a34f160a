//! 플러그인 실행 파라미터 해석
//!
//! 일반 모드는 플러그인 바이너리를 직접 실행하고, 디버그 모드는 디버거를
//! 헤드리스로 띄워 그 안에서 플러그인을 실행합니다. 이 모듈은 프로세스를
//! 생성하지 않는 순수 빌더입니다.

use crate::config::{DebuggerConfig, HostConfig};
use crate::plugin::PluginMetadata;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything needed to spawn one plugin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub plugin_name: String,
    /// Program actually spawned: the plugin itself, or the debugger.
    pub executable: PathBuf,
    /// 플러그인 바이너리 경로 (디버그 모드에서도 실행 전 확인)
    pub plugin_path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub start_timeout: Duration,
    pub debug: bool,
}

impl LaunchSpec {
    pub fn resolve(metadata: &PluginMetadata, config: &HostConfig) -> Self {
        match &config.debugger {
            Some(debugger) => {
                tracing::debug!(
                    "Launching plugin '{}' under debugger {}",
                    metadata.name,
                    debugger.executable.display()
                );
                Self {
                    plugin_name: metadata.name.clone(),
                    executable: debugger.executable.clone(),
                    plugin_path: metadata.path.clone(),
                    args: debugger_args(debugger, &metadata.path),
                    env: Vec::new(),
                    start_timeout: config.policy.start_timeout,
                    debug: true,
                }
            }
            None => Self {
                plugin_name: metadata.name.clone(),
                executable: metadata.path.clone(),
                plugin_path: metadata.path.clone(),
                args: Vec::new(),
                env: Vec::new(),
                start_timeout: config.start_timeout,
                debug: false,
            },
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.set_env(key, value);
        self
    }

    /// 같은 키가 있으면 덮어씀
    pub fn set_env(&mut self, key: &str, value: &str) {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.env.push((key.to_string(), value.to_string())),
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}

/// `exec --headless --listen=ADDR:PORT --api-version=N -- <plugin>`
pub fn debugger_args(debugger: &DebuggerConfig, plugin_path: &Path) -> Vec<String> {
    vec![
        "exec".to_string(),
        "--headless".to_string(),
        format!("--listen={}", debugger.listen()),
        format!("--api-version={}", debugger.api_version),
        "--".to_string(),
        plugin_path.to_string_lossy().into_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebugPolicy;

    fn metadata() -> PluginMetadata {
        PluginMetadata::new("hcloud", "/opt/plugins/saba-plugin-hcloud", "1.2.0")
    }

    fn debugger() -> DebuggerConfig {
        DebuggerConfig {
            executable: PathBuf::from("/usr/local/bin/dlv"),
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 2345,
            api_version: 2,
        }
    }

    #[test]
    fn test_normal_mode() {
        let spec = LaunchSpec::resolve(&metadata(), &HostConfig::default());
        assert_eq!(spec.plugin_name, "hcloud");
        assert_eq!(spec.executable, PathBuf::from("/opt/plugins/saba-plugin-hcloud"));
        assert_eq!(spec.plugin_path, spec.executable);
        assert!(spec.args.is_empty());
        assert!(spec.env.is_empty());
        assert_eq!(spec.start_timeout, Duration::from_secs(60));
        assert!(!spec.debug);
    }

    #[test]
    fn test_normal_mode_uses_configured_timeout() {
        let config = HostConfig::default().with_start_timeout(Duration::from_secs(5));
        let spec = LaunchSpec::resolve(&metadata(), &config);
        assert_eq!(spec.start_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_debug_mode() {
        let config = HostConfig {
            debugger: Some(debugger()),
            ..HostConfig::default()
        };
        let spec = LaunchSpec::resolve(&metadata(), &config);
        assert!(spec.debug);
        assert_eq!(spec.executable, PathBuf::from("/usr/local/bin/dlv"));
        assert_eq!(spec.plugin_path, PathBuf::from("/opt/plugins/saba-plugin-hcloud"));
        assert_eq!(
            spec.args,
            vec![
                "exec",
                "--headless",
                "--listen=127.0.0.1:2345",
                "--api-version=2",
                "--",
                "/opt/plugins/saba-plugin-hcloud",
            ]
        );
        assert_eq!(spec.start_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_debug_timeout_follows_policy() {
        let config = HostConfig {
            debugger: Some(debugger()),
            policy: DebugPolicy {
                start_timeout: Duration::from_secs(30),
                ..DebugPolicy::default()
            },
            ..HostConfig::default()
        };
        let spec = LaunchSpec::resolve(&metadata(), &config);
        assert_eq!(spec.start_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides_replace() {
        let spec = LaunchSpec::resolve(&metadata(), &HostConfig::default())
            .with_env("A", "1")
            .with_env("B", "2")
            .with_env("A", "3");
        assert_eq!(spec.env.len(), 2);
        assert_eq!(spec.env_value("A"), Some("3"));
        assert_eq!(spec.env_value("C"), None);
    }
}
