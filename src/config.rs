//! Ambient configuration layer.
//!
//! Loaded via the `config` crate (TOML file, overridden by `TSMESH_`-prefixed
//! environment variables), with `clap` supplying the entrypoint's
//! command-line overrides — the minimum needed to start one node, not a rich
//! CLI surface (that remains an external veneer per scope).

use crate::error::{Result, TsMeshError};
use serde::Deserialize;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapPeer {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub peer_allow_list: Vec<String>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapPeer>,
    /// Accepted for shape-compatibility with the original's config record;
    /// the alternate transport itself is out of scope and never read.
    #[serde(default)]
    pub use_domain_socket: bool,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9700
}

impl Config {
    /// Loads defaults, then an optional TOML file, then `TSMESH_`-prefixed
    /// environment variables, in that order of increasing precedence.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("bind", default_bind())?
            .set_default("port", default_port() as i64)?
            .set_default("use_domain_socket", false)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("TSMESH").separator("_"));

        let settings = builder
            .build()
            .map_err(|e| TsMeshError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| TsMeshError::Configuration(e.to_string()))
    }

    pub fn allow_list(&self) -> Result<PeerAllowList> {
        PeerAllowList::parse(&self.peer_allow_list)
    }
}

/// CIDR-based peer allow-list, mirroring `server.py`'s `verify_address` /
/// `utils.mask`. An empty list allows every peer.
#[derive(Clone)]
pub struct PeerAllowList {
    entries: Vec<(u32, u32)>, // (network, mask), both host-order
}

impl PeerAllowList {
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            let (addr_part, bits_part) = entry
                .split_once('/')
                .ok_or_else(|| TsMeshError::Configuration(format!("bad CIDR entry: {entry}")))?;
            let addr: Ipv4Addr = addr_part
                .parse()
                .map_err(|_| TsMeshError::Configuration(format!("bad address: {addr_part}")))?;
            let bits: u32 = bits_part
                .parse()
                .map_err(|_| TsMeshError::Configuration(format!("bad prefix: {bits_part}")))?;
            parsed.push((u32::from(addr), mask(bits)));
        }
        Ok(PeerAllowList { entries: parsed })
    }

    pub fn allows(&self, addr: Ipv4Addr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let candidate = u32::from(addr);
        self.entries
            .iter()
            .any(|(network, mask)| (candidate & mask) == (network & mask))
    }
}

fn mask(bits: u32) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits.min(32))
    }
}

/// Minimal entrypoint CLI: enough to start one node, matching the thin
/// `{bind, port, peer allow-list, optional bootstrap, use_domain_socket}`
/// record the core consumes; anything richer is an external veneer.
#[derive(Debug, clap::Parser)]
#[command(name = "tsmeshd", about = "Distributed Linda tuplespace node")]
pub struct Cli {
    #[arg(long, env = "TSMESH_CONFIG")]
    pub config: Option<String>,

    #[arg(long, env = "TSMESH_BIND")]
    pub bind: Option<String>,

    #[arg(long, env = "TSMESH_PORT")]
    pub port: Option<u16>,

    /// `host:port` of an existing node to join through.
    #[arg(long, env = "TSMESH_CONNECT")]
    pub connect: Option<String>,
}
