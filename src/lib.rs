pub mod config;
pub mod plugin;
pub mod process_monitor;
pub mod rpc; // 핸드셰이크 이후 줄 단위 JSON 프레이밍
pub mod server;
pub mod supervisor;

pub use config::{ConfigError, HostConfig, SecurityMode};
pub use plugin::{HandshakeConfig, LaunchSpec, PluginMetadata, VersionedProtocols, HANDSHAKE};
pub use supervisor::{CallError, ClientSession, PluginError, PluginHost};
