use std::env;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default ports match the reference Warpinator implementation.
const DEFAULT_PORT: u16 = 42000;
const DEFAULT_AUTH_PORT: u16 = 42001;
const DEFAULT_GROUP_CODE: &str = "Warpinator";

/// Protocol API version advertised over mDNS. Selects how a peer's
/// certificate is bootstrapped before any TLS channel exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVersion {
    /// Certificate served over a bare UDP request/response.
    V1,
    /// Certificate served by the insecure registration gRPC service.
    V2,
}

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "1",
            ApiVersion::V2 => "2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1" => Some(ApiVersion::V1),
            "2" => Some(ApiVersion::V2),
            _ => None,
        }
    }
}

/// All runtime settings, assembled once in `main` and injected into
/// every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identity, as advertised over mDNS.
    pub uuid: String,
    /// Hostname published in the service TXT record.
    pub hostname: String,
    /// Human-readable name returned by GetRemoteMachineInfo.
    pub display_name: String,
    /// Login name returned by GetRemoteMachineInfo.
    pub user_name: String,
    /// Shared group passphrase; peers must agree on it to exchange certs.
    pub group_code: String,
    /// This node's routable IPv4 on the LAN.
    pub address: IpAddr,
    /// TLS transfer port (the main Warp service).
    pub port: u16,
    /// Bootstrap port (UDP v1 responder + insecure registration service).
    pub auth_port: u16,
    /// Bootstrap protocol we advertise.
    pub api_version: ApiVersion,
    /// Where received files land.
    pub receive_dir: PathBuf,
    /// Where credentials and settings persist.
    pub data_dir: PathBuf,
    /// Overwrite existing files instead of renaming on conflict.
    pub allow_overwrite: bool,
    /// Start inbound transfers without waiting for local acceptance.
    pub auto_accept: bool,
    /// Optional path to an avatar image served to peers.
    pub avatar_path: Option<PathBuf>,
}

impl Config {
    /// Build the configuration from environment variables, falling back
    /// to sensible defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());

        let address = match env::var("LANWARP_BIND_IP") {
            Ok(ip) => ip.parse().context("LANWARP_BIND_IP is not a valid IP")?,
            Err(_) => local_ip_address::local_ip().context("could not determine local IP")?,
        };

        let uuid = env::var("LANWARP_UUID").unwrap_or_else(|_| {
            format!(
                "{}-{}",
                hostname.to_uppercase().replace('.', "-"),
                Uuid::new_v4().simple()
            )
        });

        let receive_dir = env::var("LANWARP_RECEIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::download_dir().unwrap_or_else(|| std::env::temp_dir().join("lanwarp"))
            });

        let data_dir = env::var("LANWARP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("lanwarp")
            });

        let api_version = match env::var("LANWARP_API_VERSION") {
            Ok(v) => ApiVersion::parse(&v).ok_or_else(|| anyhow!("invalid api version: {v}"))?,
            Err(_) => ApiVersion::V2,
        };

        let group_code = env::var("LANWARP_GROUP_CODE").unwrap_or_else(|_| {
            warn!("LANWARP_GROUP_CODE not set, using the default group code");
            DEFAULT_GROUP_CODE.to_string()
        });

        Ok(Self {
            display_name: env::var("LANWARP_DISPLAY_NAME").unwrap_or_else(|_| hostname.clone()),
            user_name: env::var("USER").unwrap_or_else(|_| "nobody".to_string()),
            hostname,
            uuid,
            group_code,
            address,
            port: parse_port("LANWARP_PORT", DEFAULT_PORT)?,
            auth_port: parse_port("LANWARP_AUTH_PORT", DEFAULT_AUTH_PORT)?,
            api_version,
            receive_dir,
            data_dir,
            allow_overwrite: flag("LANWARP_OVERWRITE"),
            auto_accept: flag("LANWARP_AUTO_ACCEPT"),
            avatar_path: env::var("LANWARP_AVATAR").ok().map(PathBuf::from),
        })
    }
}

fn parse_port(var: &str, default: u16) -> Result<u16> {
    match env::var(var) {
        Ok(v) => v.parse().with_context(|| format!("{var} is not a valid port")),
        Err(_) => Ok(default),
    }
}

fn flag(var: &str) -> bool {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_round_trips_through_txt_value() {
        assert_eq!(ApiVersion::parse("1"), Some(ApiVersion::V1));
        assert_eq!(ApiVersion::parse("2"), Some(ApiVersion::V2));
        assert_eq!(ApiVersion::parse("3"), None);
        assert_eq!(ApiVersion::V2.as_str(), "2");
    }
}
