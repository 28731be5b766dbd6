//! Provider configuration.
//!
//! Every toggle is read once when a [`Context`](crate::Context) opens and is
//! then passed down by reference. Values come from the process environment
//! ([`Config::from_env`]) or from a TOML document ([`Config::from_toml_str`]).

use std::collections::HashMap;
use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Completion entry size, process-wide for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum CqeSize {
    #[default]
    B64,
    B128,
}

impl CqeSize {
    /// Size in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            CqeSize::B64 => 64,
            CqeSize::B128 => 128,
        }
    }
}

impl TryFrom<u32> for CqeSize {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            64 => Ok(CqeSize::B64),
            128 => Ok(CqeSize::B128),
            other => Err(format!("CQE size must be 64 or 128, got {}", other)),
        }
    }
}

impl From<CqeSize> for u32 {
    fn from(size: CqeSize) -> Self {
        size.bytes() as u32
    }
}

/// How queue buffers are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocType {
    /// Plain anonymous pages.
    Anon,
    /// Huge pages only.
    Huge,
    /// Physically contiguous pages from the device only.
    Contig,
    /// Huge pages, falling back to anonymous pages.
    PreferHuge,
    /// Contiguous pages, falling back to anonymous pages.
    PreferContig,
    /// Try huge, then contiguous, then anonymous pages.
    All,
}

impl AllocType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ANON" => Some(Self::Anon),
            "HUGE" => Some(Self::Huge),
            "CONTIG" => Some(Self::Contig),
            "PREFER_HUGE" => Some(Self::PreferHuge),
            "PREFER_CONTIG" => Some(Self::PreferContig),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }
}

/// Queue kinds that carry their own allocation preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPrefix {
    Qp,
    Cq,
    Srq,
    Rwq,
}

impl AllocPrefix {
    /// Environment key selecting the allocation type of this queue kind.
    pub const fn env_key(self) -> &'static str {
        match self {
            AllocPrefix::Qp => "MLX_QP_ALLOC_TYPE",
            AllocPrefix::Cq => "MLX_CQ_ALLOC_TYPE",
            AllocPrefix::Srq => "MLX_SRQ_ALLOC_TYPE",
            AllocPrefix::Rwq => "MLX_RWQ_ALLOC_TYPE",
        }
    }
}

/// Per-queue-kind allocation type overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    pub qp: Option<AllocType>,
    pub cq: Option<AllocType>,
    pub srq: Option<AllocType>,
    pub rwq: Option<AllocType>,
}

/// Legacy per-transport huge page switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HugeConfig {
    pub rc: bool,
    pub uc: bool,
    pub ud: bool,
    pub raw_eth: bool,
}

/// Provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Completion entry size. Default 64 bytes.
    pub cqe_size: CqeSize,

    /// Scatter small received messages into the CQE. Default on.
    pub scatter_to_cqe: bool,

    /// Software signatures on QP work requests. Default off.
    pub qp_signature: bool,

    /// Software signatures on SRQ descriptors. Default off.
    pub srq_signature: bool,

    /// Software signatures on receive work queue descriptors. Default off.
    pub rwq_signature: bool,

    /// Software completion signatures. Default off.
    pub cq_signature: bool,

    /// The application never touches one context from two threads, so
    /// shared doorbell registers need no lock. Default off.
    pub single_threaded: bool,

    /// Allocation type overrides per queue kind.
    pub alloc: AllocConfig,

    /// Legacy huge page switches per transport.
    pub huge: HugeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cqe_size: CqeSize::B64,
            scatter_to_cqe: true,
            qp_signature: false,
            srq_signature: false,
            rwq_signature: false,
            cq_signature: false,
            single_threaded: false,
            alloc: AllocConfig::default(),
            huge: HugeConfig::default(),
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration from a key lookup function with the same
    /// semantics as the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(size) = lookup("MLX5_CQE_SIZE") {
            let size = size
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidArgument("MLX5_CQE_SIZE is not a number"))?;
            config.cqe_size = CqeSize::try_from(size)
                .map_err(|_| Error::InvalidArgument("MLX5_CQE_SIZE must be 64 or 128"))?;
        }
        if let Some(v) = lookup("MLX5_SCATTER_TO_CQE") {
            config.scatter_to_cqe = v != "0";
        }
        config.qp_signature = lookup("MLX5_QP_SIGNATURE").is_some();
        config.srq_signature = lookup("MLX5_SRQ_SIGNATURE").is_some();
        config.rwq_signature = lookup("MLX5_RWQ_SIGNATURE").is_some();
        config.cq_signature = lookup("MLX5_CQ_SIGNATURE").is_some();
        config.single_threaded = lookup("MLX5_SINGLE_THREADED").as_deref() == Some("1");

        let alloc_type = |prefix: AllocPrefix| {
            lookup(prefix.env_key()).and_then(|v| AllocType::parse(v.trim()))
        };
        config.alloc = AllocConfig {
            qp: alloc_type(AllocPrefix::Qp),
            cq: alloc_type(AllocPrefix::Cq),
            srq: alloc_type(AllocPrefix::Srq),
            rwq: alloc_type(AllocPrefix::Rwq),
        };

        let huge = |key: &str| lookup(key).as_deref() == Some("y");
        config.huge = HugeConfig {
            rc: huge("HUGE_RC"),
            uc: huge("HUGE_UC"),
            ud: huge("HUGE_UD"),
            raw_eth: huge("HUGE_RAW_ETH"),
        };

        log::debug!("rmlx5: configuration {:?}", config);
        Ok(config)
    }

    /// Read the configuration from a key/value map (testing aid).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Resolve the allocation type of a queue kind.
    pub fn alloc_type(&self, prefix: AllocPrefix, default: AllocType) -> AllocType {
        let configured = match prefix {
            AllocPrefix::Qp => self.alloc.qp,
            AllocPrefix::Cq => self.alloc.cq,
            AllocPrefix::Srq => self.alloc.srq,
            AllocPrefix::Rwq => self.alloc.rwq,
        };
        configured.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_map(&HashMap::new()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cqe_size.bytes(), 64);
        assert!(config.scatter_to_cqe);
        assert!(!config.qp_signature && !config.srq_signature && !config.rwq_signature);
        assert_eq!(config.alloc_type(AllocPrefix::Qp, AllocType::Anon), AllocType::Anon);
    }

    #[test]
    fn test_env_toggles() {
        let config = Config::from_map(&map(&[
            ("MLX5_CQE_SIZE", "128"),
            ("MLX5_SCATTER_TO_CQE", "0"),
            ("MLX5_SRQ_SIGNATURE", ""),
            ("MLX_QP_ALLOC_TYPE", "PREFER_HUGE"),
            ("HUGE_UD", "y"),
            ("HUGE_RC", "n"),
        ]))
        .unwrap();
        assert_eq!(config.cqe_size, CqeSize::B128);
        assert!(!config.scatter_to_cqe);
        assert!(config.srq_signature);
        assert!(!config.qp_signature);
        assert_eq!(config.alloc.qp, Some(AllocType::PreferHuge));
        assert!(config.huge.ud);
        assert!(!config.huge.rc);
    }

    #[test]
    fn test_invalid_cqe_size() {
        let err = Config::from_map(&map(&[("MLX5_CQE_SIZE", "96")])).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(Config::from_toml_str("cqe_size = 32").is_err());
    }

    #[test]
    fn test_toml() {
        let config = Config::from_toml_str(
            r#"
            cqe_size = 128
            single_threaded = true

            [alloc]
            cq = "CONTIG"
            "#,
        )
        .unwrap();
        assert_eq!(config.cqe_size, CqeSize::B128);
        assert!(config.single_threaded);
        assert!(config.scatter_to_cqe);
        assert_eq!(config.alloc_type(AllocPrefix::Cq, AllocType::Anon), AllocType::Contig);
    }
}
