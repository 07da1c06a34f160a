//! Minimal plugin used by the integration tests and for manual smoke runs.
//!
//! 동작은 환경 변수로 바꿀 수 있습니다:
//! - `SABA_DEMO_PLUGIN_MODE`: `crash` | `silent` | `garbage` | `forge-cookie`
//! - `SABA_DEMO_PLUGIN_VERSIONS`: 지원 버전 목록 (예: `2,3`)
//! - `SABA_DEMO_PLUGIN_PID_FILE`: 시작 시 PID 기록

use serde_json::{json, Value};
use std::time::Duration;

use saba_plugin::plugin::versions::parse_version_list;
use saba_plugin::plugin::{HandshakeConfig, ServiceDescriptor, VersionedProtocols, HANDSHAKE};
use saba_plugin::server::{self, Handler, HandlerFuture, ServeConfig, ServeError};

const ENV_MODE: &str = "SABA_DEMO_PLUGIN_MODE";
const ENV_VERSIONS: &str = "SABA_DEMO_PLUGIN_VERSIONS";
const ENV_PID_FILE: &str = "SABA_DEMO_PLUGIN_PID_FILE";

const FORGED: HandshakeConfig = HandshakeConfig {
    protocol_version: HANDSHAKE.protocol_version,
    magic_cookie_key: HANDSHAKE.magic_cookie_key,
    magic_cookie_value: "0000000000000000000000000000000000000000000000000000000000000000",
};

struct Demo;

impl Handler for Demo {
    fn call(&self, method: &str, params: Value) -> HandlerFuture {
        let method = method.to_string();
        Box::pin(async move {
            match method.as_str() {
                "provider.echo" => Ok(params),
                "provider.sleep" => {
                    let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(1000);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({ "slept_ms": ms }))
                }
                "provider.pid" => Ok(json!(std::process::id())),
                "provider.fail" => Err("requested failure".to_string()),
                _ => Err(format!("unknown method '{}'", method)),
            }
        })
    }
}

fn protocols() -> anyhow::Result<VersionedProtocols> {
    match std::env::var(ENV_VERSIONS) {
        Ok(list) if !list.trim().is_empty() => {
            let versions = parse_version_list(&list)
                .map_err(|bad| anyhow::anyhow!("invalid {} entry '{}'", ENV_VERSIONS, bad))?;
            Ok(versions.into_iter().fold(VersionedProtocols::new(), |acc, v| {
                acc.with_version(v, vec![ServiceDescriptor::new("provider")])
            }))
        }
        _ => Ok(VersionedProtocols::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout은 핸드셰이크 라인 전용이므로 로그는 stderr로
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Ok(path) = std::env::var(ENV_PID_FILE) {
        std::fs::write(&path, std::process::id().to_string())?;
    }

    let mode = std::env::var(ENV_MODE).unwrap_or_default();
    let mut config = ServeConfig {
        handshake: HANDSHAKE,
        protocols: protocols()?,
    };

    let result = match mode.as_str() {
        "crash" => {
            tracing::error!("Crashing before handshake as requested");
            std::process::exit(3);
        }
        "silent" => loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        },
        "garbage" => {
            println!("this is not a handshake line");
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        "forge-cookie" => {
            config.handshake = FORGED;
            let lookup = |key: &str| {
                if key == FORGED.magic_cookie_key {
                    Some(FORGED.magic_cookie_value.to_string())
                } else {
                    std::env::var(key).ok()
                }
            };
            server::serve_with_env(config, Demo, lookup, tokio::io::stdout()).await
        }
        _ => server::serve(config, Demo).await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(ServeError::NotLaunchedByHost) => {
            eprintln!("{}", ServeError::NotLaunchedByHost);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
