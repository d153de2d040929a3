//! Node configuration, parsed from an INI file.
//!
//! `[GLOBAL]` supplies the RSA key pair paths shared by every local
//! service; `[gossip]` supplies this module's own settings.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use murmur_protocol::ProtocolParams;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: ini::Error,
    },
    #[error("missing section [{0}]")]
    MissingSection(&'static str),
    #[error("missing key {key:?} in section [{section}]")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid value for {key:?}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Parsed and validated node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub hostkey: PathBuf,
    pub pubkey: PathBuf,
    pub trusted_identities_path: PathBuf,
    pub bootstrapper: Option<SocketAddr>,
    pub api_address: SocketAddr,
    pub listen_address: SocketAddr,
    pub cache_size: u16,
    /// Gossip fan-out per round, 1..=10.
    pub degree: u8,
    /// Raw configured TTL; 0 selects the automatic network-diameter TTL.
    pub max_ttl: u8,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = ini::Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini(&file)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let file = ini::Ini::load_from_str(content).map_err(|e| ConfigError::InvalidValue {
            key: "config",
            reason: e.to_string(),
        })?;
        Self::from_ini(&file)
    }

    fn from_ini(file: &ini::Ini) -> Result<Self, ConfigError> {
        let global = file
            .section(Some("GLOBAL"))
            .ok_or(ConfigError::MissingSection("GLOBAL"))?;
        let gossip = file
            .section(Some("gossip"))
            .ok_or(ConfigError::MissingSection("gossip"))?;

        let get = |section: &ini::Properties,
                   section_name: &'static str,
                   key: &'static str|
         -> Result<String, ConfigError> {
            section
                .get(key)
                .map(str::to_string)
                .ok_or(ConfigError::MissingKey {
                    section: section_name,
                    key,
                })
        };

        let hostkey = PathBuf::from(get(global, "GLOBAL", "hostkey")?);
        let pubkey = PathBuf::from(get(global, "GLOBAL", "pubkey")?);
        let trusted_identities_path =
            PathBuf::from(get(gossip, "gossip", "trusted_identities_path")?);

        let bootstrapper = match gossip.get("bootstrapper") {
            None | Some("") => None,
            Some(addr) => Some(resolve_addr("bootstrapper", addr)?),
        };
        let api_address = resolve_addr("api_address", &get(gossip, "gossip", "api_address")?)?;
        let listen_address =
            resolve_addr("listen_address", &get(gossip, "gossip", "listen_address")?)?;

        let cache_size: u16 = parse_num("cache_size", &get(gossip, "gossip", "cache_size")?)?;
        if cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cache_size",
                reason: "must be positive".into(),
            });
        }
        let degree: u8 = parse_num("degree", &get(gossip, "gossip", "degree")?)?;
        if !(1..=10).contains(&degree) {
            return Err(ConfigError::InvalidValue {
                key: "degree",
                reason: format!("{degree} outside 1..=10"),
            });
        }
        let max_ttl: u8 = match gossip.get("max_ttl") {
            None => 0,
            Some(raw) => parse_num("max_ttl", raw)?,
        };

        Ok(Self {
            hostkey,
            pubkey,
            trusted_identities_path,
            bootstrapper,
            api_address,
            listen_address,
            cache_size,
            degree,
            max_ttl,
        })
    }

    /// The TTL actually used: the configured one, or the automatic
    /// network-diameter bound when configured as 0.
    pub fn effective_max_ttl(&self, params: &ProtocolParams) -> u8 {
        if self.max_ttl == 0 {
            params.auto_max_ttl(self.degree)
        } else {
            self.max_ttl
        }
    }
}

fn resolve_addr(key: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = value.parse() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .map_err(|e| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
        })?
        .next()
        .ok_or(ConfigError::InvalidValue {
            key,
            reason: format!("{value:?} resolves to nothing"),
        })
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::PARAMS;

    const FULL: &str = r#"
[GLOBAL]
hostkey = /etc/murmur/hostkey.pem
pubkey = /etc/murmur/pubkey.pem

[gossip]
trusted_identities_path = /etc/murmur/trusted
bootstrapper = 10.0.0.1:7000
api_address = 127.0.0.1:7011
listen_address = 0.0.0.0:7001
cache_size = 50
degree = 4
max_ttl = 0
"#;

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::from_str(FULL).unwrap();
        assert_eq!(cfg.hostkey, PathBuf::from("/etc/murmur/hostkey.pem"));
        assert_eq!(cfg.bootstrapper, Some("10.0.0.1:7000".parse().unwrap()));
        assert_eq!(cfg.api_address, "127.0.0.1:7011".parse().unwrap());
        assert_eq!(cfg.listen_address, "0.0.0.0:7001".parse().unwrap());
        assert_eq!(cfg.cache_size, 50);
        assert_eq!(cfg.degree, 4);
        assert_eq!(cfg.max_ttl, 0);
    }

    #[test]
    fn test_auto_max_ttl() {
        let cfg = Config::from_str(FULL).unwrap();
        assert_eq!(cfg.effective_max_ttl(&PARAMS), PARAMS.auto_max_ttl(4));

        let explicit = FULL.replace("max_ttl = 0", "max_ttl = 9");
        let cfg = Config::from_str(&explicit).unwrap();
        assert_eq!(cfg.effective_max_ttl(&PARAMS), 9);
    }

    #[test]
    fn test_bootstrapper_optional() {
        let without = FULL.replace("bootstrapper = 10.0.0.1:7000\n", "");
        let cfg = Config::from_str(&without).unwrap();
        assert_eq!(cfg.bootstrapper, None);
    }

    #[test]
    fn test_missing_section_named() {
        let err = Config::from_str("[gossip]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("GLOBAL")));
    }

    #[test]
    fn test_missing_key_named() {
        let broken = FULL.replace("api_address = 127.0.0.1:7011\n", "");
        match Config::from_str(&broken).unwrap_err() {
            ConfigError::MissingKey { section, key } => {
                assert_eq!(section, "gossip");
                assert_eq!(key, "api_address");
            }
            other => panic!("expected MissingKey, got {other}"),
        }
    }

    #[test]
    fn test_degree_bounds() {
        for bad in ["0", "11"] {
            let broken = FULL.replace("degree = 4", &format!("degree = {bad}"));
            assert!(matches!(
                Config::from_str(&broken).unwrap_err(),
                ConfigError::InvalidValue { key: "degree", .. }
            ));
        }
    }

    #[test]
    fn test_cache_size_must_be_positive() {
        let broken = FULL.replace("cache_size = 50", "cache_size = 0");
        assert!(matches!(
            Config::from_str(&broken).unwrap_err(),
            ConfigError::InvalidValue {
                key: "cache_size",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_address_rejected() {
        let broken = FULL.replace("127.0.0.1:7011", "not an address");
        assert!(matches!(
            Config::from_str(&broken).unwrap_err(),
            ConfigError::InvalidValue {
                key: "api_address",
                ..
            }
        ));
    }
}
