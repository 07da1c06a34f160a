use std::path::PathBuf;
use std::time::Duration;

use saba_plugin::{HostConfig, PluginHost, PluginMetadata};

const USAGE: &str = "usage: saba-plugin <plugin-path> [<service.method> [<params-json>]]";

/// 단발 호출의 기본 데드라인
const CALL_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout은 세션 정보/호출 결과(JSON) 전용
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let method = args.next();
    let params = match args.next() {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("params must be valid JSON: {}", e))?,
        None => serde_json::Value::Null,
    };

    let config = match HostConfig::load(None) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("[{}] {}", e.error_code(), e);
            return Err(e.into());
        }
    };
    let host = PluginHost::new(config);
    let metadata = PluginMetadata::from_path(PathBuf::from(path));

    let session = match host.start(&metadata).await {
        Ok(session) => session,
        Err(e) => {
            println!("{}", e.to_json());
            return Err(e.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&session.info())?);

    match method {
        Some(method) => {
            let result = session.call(&method, params, CALL_DEADLINE).await;
            session.close().await;
            match result {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(e) => {
                    tracing::error!("Call '{}' failed: {}", method, e);
                    return Err(e.into());
                }
            }
        }
        None => {
            tracing::info!("Session {} running, press Ctrl+C to stop", session.id());
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received, cleaning up...");
                }
                _ = wait_exit(&session) => {
                    tracing::warn!("Plugin '{}' exited", session.plugin());
                }
            }
            host.shutdown().await;
        }
    }

    tracing::info!("Plugin host shutting down");
    Ok(())
}

async fn wait_exit(session: &saba_plugin::ClientSession) {
    while session.is_alive() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
