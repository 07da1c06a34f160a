//! Handshake descriptor and the handshake line decoder.
//!
//! The magic cookie is a guard against a user running a plugin binary by
//! hand (or the host spawning something that is not a plugin). It is not
//! authentication; transport trust comes from [`crate::plugin::tls`].
//!
//! 플러그인은 표준 출력 첫 줄에 다음 형식의 핸드셰이크 라인을 출력해야 합니다:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL[|CERT]
//! 1|6|tcp|127.0.0.1:41234|jsonl|MIIB...
//! ```

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version of the handshake line grammar itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Wire protocol spoken after the handshake.
pub const WIRE_PROTOCOL: &str = "jsonl";

pub const ENV_CORE_PROTOCOL_VERSION: &str = "PLUGIN_CORE_PROTOCOL_VERSION";

/// 핸드셰이크 라인 최대 길이 (인증서 포함, 바이트)
pub const MAX_HANDSHAKE_LINE: usize = 64 * 1024;

/// 인증서 필드 인코딩: 출력은 패딩 없이, 입력은 패딩 유무 모두 허용
const CERT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Application protocol version a plugin assumes when the host
    /// advertises no version list.
    pub protocol_version: u32,
    pub magic_cookie_key: &'static str,
    pub magic_cookie_value: &'static str,
}

impl HandshakeConfig {
    pub fn cookie_matches(&self, key: &str, value: &str) -> bool {
        self.magic_cookie_key == key && self.magic_cookie_value == value
    }
}

/// Shared by the host and every plugin built against this crate.
pub const HANDSHAKE: HandshakeConfig = HandshakeConfig {
    protocol_version: 5,
    magic_cookie_key: "SABA_PLUGIN_MAGIC_COOKIE",
    magic_cookie_value: "302c5dc4afeba2ba4744e9c9d812ea6f48cf66b525d1836c583bd85e5a169462",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeParseError {
    #[error("empty handshake line")]
    Empty,

    #[error("handshake line exceeds {0} bytes")]
    TooLong(usize),

    #[error("expected 5 or 6 '|' separated fields, got {0}")]
    FieldCount(usize),

    #[error("invalid core protocol version '{0}'")]
    InvalidCoreVersion(String),

    #[error("unsupported core protocol version {0} (host speaks {core})", core = CORE_PROTOCOL_VERSION)]
    UnsupportedCoreVersion(u32),

    #[error("invalid application protocol version '{0}'")]
    InvalidProtocolVersion(String),

    #[error("unknown network type '{0}'")]
    UnknownNetwork(String),

    #[error("empty listen address")]
    EmptyAddress,

    #[error("unsupported wire protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("invalid certificate encoding: {0}")]
    InvalidCertificate(String),
}

/// Decoded first line of a plugin's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub protocol_version: u32,
    pub network: Network,
    pub address: String,
    pub protocol: String,
    /// DER encoded server certificate (AutoMTLS only).
    pub server_cert: Option<Vec<u8>>,
}

impl HandshakeLine {
    pub fn new(protocol_version: u32, network: Network, address: &str) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version,
            network,
            address: address.to_string(),
            protocol: WIRE_PROTOCOL.to_string(),
            server_cert: None,
        }
    }

    pub fn with_server_cert(mut self, der: Vec<u8>) -> Self {
        self.server_cert = Some(der);
        self
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.len() > MAX_HANDSHAKE_LINE {
            return Err(HandshakeParseError::TooLong(MAX_HANDSHAKE_LINE));
        }
        if line.is_empty() {
            return Err(HandshakeParseError::Empty);
        }

        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(HandshakeParseError::FieldCount(fields.len()));
        }

        let core_version = fields[0]
            .parse::<u32>()
            .map_err(|_| HandshakeParseError::InvalidCoreVersion(fields[0].to_string()))?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeParseError::UnsupportedCoreVersion(core_version));
        }

        let protocol_version = fields[1]
            .parse::<u32>()
            .map_err(|_| HandshakeParseError::InvalidProtocolVersion(fields[1].to_string()))?;

        let network = match fields[2] {
            "tcp" => Network::Tcp,
            "unix" => Network::Unix,
            other => return Err(HandshakeParseError::UnknownNetwork(other.to_string())),
        };

        let address = fields[3];
        if address.is_empty() {
            return Err(HandshakeParseError::EmptyAddress);
        }

        if fields[4] != WIRE_PROTOCOL {
            return Err(HandshakeParseError::UnsupportedProtocol(fields[4].to_string()));
        }

        let server_cert = match fields.get(5) {
            Some(cert) if !cert.is_empty() => Some(
                CERT_ENGINE
                    .decode(cert)
                    .map_err(|e| HandshakeParseError::InvalidCertificate(e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            core_version,
            protocol_version,
            network,
            address: address.to_string(),
            protocol: fields[4].to_string(),
            server_cert,
        })
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version,
            self.protocol_version,
            self.network.as_str(),
            self.address,
            self.protocol
        )?;
        if let Some(cert) = &self.server_cert {
            write!(f, "|{}", CERT_ENGINE.encode(cert))?;
        }
        Ok(())
    }
}
