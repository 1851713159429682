//! Server configuration (RFC-agnostic; §6 of the design).
//!
//! Deserialized from YAML via `serde`/`serde_yaml`, then validated with
//! [`Config::validate`] before the server starts. Validation failures are
//! fatal — the process should refuse to start rather than run with a
//! half-sane configuration.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{vc, RtspError};

/// The reserved path name used as a fallback when no specific path matches.
pub const WILDCARD_PATH: &str = "all";

/// Transport protocol a path (or the server as a whole) will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Where a path's media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Accepted from a publishing client via ANNOUNCE/RECORD.
    Record,
    /// Pulled from an upstream RTSP server at this URL.
    Rtsp(String),
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl Source {
    fn parse(raw: &str) -> Self {
        if raw == "record" {
            Source::Record
        } else {
            Source::Rtsp(raw.to_string())
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::Record
    }
}

/// An IP address or CIDR network, as written in `publishIps`/`readIps`.
#[derive(Debug, Clone, Copy)]
pub struct IpOrNet(IpNet);

impl IpOrNet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.0.contains(&addr)
    }
}

impl<'de> Deserialize<'de> for IpOrNet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let net = if raw.contains('/') {
            raw.parse::<IpNet>()
                .map_err(|e| serde::de::Error::custom(format!("invalid CIDR '{raw}': {e}")))?
        } else {
            let ip = raw
                .parse::<IpAddr>()
                .map_err(|e| serde::de::Error::custom(format!("invalid IP '{raw}': {e}")))?;
            IpNet::from(ip)
        };
        Ok(IpOrNet(net))
    }
}

/// Per-path access and sourcing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathConf {
    pub source: Source,
    #[serde(rename = "sourceProtocol")]
    pub source_protocol: Protocol,
    #[serde(rename = "publishUser")]
    pub publish_user: Option<String>,
    #[serde(rename = "publishPass")]
    pub publish_pass: Option<String>,
    #[serde(rename = "publishIps")]
    pub publish_ips: Vec<IpOrNet>,
    #[serde(rename = "readUser")]
    pub read_user: Option<String>,
    #[serde(rename = "readPass")]
    pub read_pass: Option<String>,
    #[serde(rename = "readIps")]
    pub read_ips: Vec<IpOrNet>,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: Source::Record,
            source_protocol: Protocol::Udp,
            publish_user: None,
            publish_pass: None,
            publish_ips: Vec::new(),
            read_user: None,
            read_pass: None,
            read_ips: Vec::new(),
        }
    }
}

impl PathConf {
    fn validate(&self, name: &str) -> crate::error::Result<()> {
        vc(
            !matches!((&self.publish_user, &self.publish_pass), (Some(_), None) | (None, Some(_))),
            format!("path '{name}': publishUser and publishPass must both be set or both empty"),
        )?;
        vc(
            !matches!((&self.read_user, &self.read_pass), (Some(_), None) | (None, Some(_))),
            format!("path '{name}': readUser and readPass must both be set or both empty"),
        )?;
        for (label, user, pass) in [
            ("publish", &self.publish_user, &self.publish_pass),
            ("read", &self.read_user, &self.read_pass),
        ] {
            if let Some(u) = user {
                vc(
                    !u.is_empty() && u.chars().all(|c| c.is_ascii_alphanumeric()),
                    format!("path '{name}': {label}User must be alphanumeric"),
                )?;
            }
            if let Some(p) = pass {
                vc(
                    !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()),
                    format!("path '{name}': {label}Pass must be alphanumeric"),
                )?;
            }
        }
        if name == WILDCARD_PATH {
            vc(
                self.source == Source::Record,
                format!("path '{WILDCARD_PATH}' must have source: record"),
            )?;
        }
        Ok(())
    }
}

fn default_protocols() -> Vec<Protocol> {
    vec![Protocol::Udp, Protocol::Tcp]
}

fn default_rtsp_port() -> u16 {
    8554
}

fn default_rtp_port() -> u16 {
    8000
}

fn default_rtcp_port() -> u16 {
    8001
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_paths() -> HashMap<String, PathConf> {
    let mut m = HashMap::new();
    m.insert(WILDCARD_PATH.to_string(), PathConf::default());
    m
}

/// Top-level, validated server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_protocols")]
    pub protocols: Vec<Protocol>,
    #[serde(rename = "rtspPort", default = "default_rtsp_port")]
    pub rtsp_port: u16,
    #[serde(rename = "rtpPort", default = "default_rtp_port")]
    pub rtp_port: u16,
    #[serde(rename = "rtcpPort", default = "default_rtcp_port")]
    pub rtcp_port: u16,
    #[serde(rename = "readTimeout", with = "humantime_serde", default = "default_timeout")]
    pub read_timeout: Duration,
    #[serde(rename = "writeTimeout", with = "humantime_serde", default = "default_timeout")]
    pub write_timeout: Duration,
    #[serde(rename = "preScript")]
    pub pre_script: Option<PathBuf>,
    #[serde(rename = "postScript")]
    pub post_script: Option<PathBuf>,
    #[serde(default)]
    pub pprof: bool,
    #[serde(default = "default_paths")]
    pub paths: HashMap<String, PathConf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocols: default_protocols(),
            rtsp_port: default_rtsp_port(),
            rtp_port: default_rtp_port(),
            rtcp_port: default_rtcp_port(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
            pre_script: None,
            post_script: None,
            pprof: false,
            paths: default_paths(),
        }
    }
}

impl Config {
    /// Parse and validate a configuration from a YAML document.
    pub fn from_yaml(raw: &str) -> crate::error::Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(raw).map_err(|e| RtspError::Config(format!("invalid YAML: {e}")))?;
        if config.paths.is_empty() {
            config.paths = default_paths();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants (§6 of the design).
    pub fn validate(&self) -> crate::error::Result<()> {
        vc(!self.protocols.is_empty(), "protocols must not be empty")?;
        vc(self.rtp_port % 2 == 0, "rtpPort must be even")?;
        vc(
            self.rtcp_port == self.rtp_port + 1,
            "rtcpPort must equal rtpPort + 1",
        )?;
        for (name, path) in &self.paths {
            path.validate(name)?;
        }
        Ok(())
    }

    /// Resolve the policy for `path`, falling back to the `all` wildcard.
    pub fn path_conf(&self, path: &str) -> Option<&PathConf> {
        self.paths.get(path).or_else(|| self.paths.get(WILDCARD_PATH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.rtsp_port, 8554);
        assert_eq!(config.rtp_port, 8000);
        assert_eq!(config.rtcp_port, 8001);
        assert_eq!(config.protocols, vec![Protocol::Udp, Protocol::Tcp]);
        assert!(config.paths.contains_key(WILDCARD_PATH));
    }

    #[test]
    fn odd_rtp_port_rejected() {
        let mut config = Config::default();
        config.rtp_port = 8001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mismatched_rtcp_port_rejected() {
        let mut config = Config::default();
        config.rtcp_port = config.rtp_port + 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_paths_becomes_wildcard() {
        let config = Config::from_yaml("paths: {}\n").unwrap();
        assert_eq!(config.paths.len(), 1);
        assert!(config.paths.contains_key(WILDCARD_PATH));
    }

    #[test]
    fn wildcard_with_rtsp_source_rejected() {
        let yaml = "paths:\n  all:\n    source: rtsp://upstream/x\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn mismatched_read_credentials_rejected() {
        let yaml = "paths:\n  cam:\n    readUser: bob\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn non_alphanumeric_credentials_rejected() {
        let yaml = "paths:\n  cam:\n    publishUser: bob\n    publishPass: \"has space\"\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn cidr_allow_list_parses() {
        let yaml = "paths:\n  cam:\n    publishIps: [\"127.0.0.0/8\", \"10.0.0.5\"]\n";
        let config = Config::from_yaml(yaml).unwrap();
        let path = config.path_conf("cam").unwrap();
        assert_eq!(path.publish_ips.len(), 2);
        assert!(path.publish_ips[0].contains("127.0.0.1".parse().unwrap()));
        assert!(path.publish_ips[1].contains("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn path_conf_falls_back_to_wildcard() {
        let config = Config::default();
        assert!(config.path_conf("unknown").is_some());
    }

    #[test]
    fn upstream_source_parsed() {
        let yaml = "paths:\n  mirror:\n    source: \"rtsp://upstream/x\"\n    sourceProtocol: tcp\n";
        let config = Config::from_yaml(yaml).unwrap();
        let path = config.path_conf("mirror").unwrap();
        assert_eq!(path.source, Source::Rtsp("rtsp://upstream/x".to_string()));
        assert_eq!(path.source_protocol, Protocol::Tcp);
    }
}
