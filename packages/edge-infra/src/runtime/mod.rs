//! Hosting runtime detection.
//!
//! Hosts expose no common handshake, so detection is an ordered check of
//! markers, most specific platform first:
//!
//! 1. cache storage → Cloudflare-style isolate
//! 2. Deno global → Deno
//! 3. edge-runtime global → Vercel-edge-style isolate
//! 4. otherwise Node-style process
//!
//! The order is part of the contract: a Node host that polyfills Deno markers
//! for testing must still never be classified as Cloudflare, and a Workers
//! isolate that also carries an edge-runtime marker stays Cloudflare.

pub mod adapter;

use std::fmt;
use std::str::FromStr;

use crate::error::InfraError;

pub use adapter::{
    capabilities_for, BackgroundTask, CloudflareAdapter, DeferredExecution, DenoAdapter,
    NodeAdapter, RuntimeAdapter, RuntimeCapabilities, TaskError, VercelEdgeAdapter,
    WaitUntilQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Node,
    Cloudflare,
    VercelEdge,
    Deno,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 4] = [
        RuntimeKind::Node,
        RuntimeKind::Cloudflare,
        RuntimeKind::VercelEdge,
        RuntimeKind::Deno,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Node => "node",
            RuntimeKind::Cloudflare => "cloudflare",
            RuntimeKind::VercelEdge => "vercel-edge",
            RuntimeKind::Deno => "deno",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node" => Ok(RuntimeKind::Node),
            "cloudflare" => Ok(RuntimeKind::Cloudflare),
            "vercel-edge" | "vercel_edge" => Ok(RuntimeKind::VercelEdge),
            "deno" => Ok(RuntimeKind::Deno),
            other => Err(InfraError::config(format!(
                "unknown runtime '{other}' (expected node, cloudflare, vercel-edge or deno)"
            ))),
        }
    }
}

/// Process-global markers inspected by [`detect`].
pub trait EnvironmentProbe {
    fn has_cache_storage(&self) -> bool;
    fn has_deno_global(&self) -> bool;
    fn has_edge_runtime_global(&self) -> bool;
}

/// Fixed set of markers, for tests and for hosts that already know theirs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeMarkers {
    pub cache_storage: bool,
    pub deno: bool,
    pub edge_runtime: bool,
}

impl EnvironmentProbe for RuntimeMarkers {
    fn has_cache_storage(&self) -> bool {
        self.cache_storage
    }

    fn has_deno_global(&self) -> bool {
        self.deno
    }

    fn has_edge_runtime_global(&self) -> bool {
        self.edge_runtime
    }
}

/// Probe for the current process.
///
/// Workers builds target `wasm32-unknown-unknown`; Deno Deploy and the edge
/// runtime announce themselves through environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl EnvironmentProbe for ProcessProbe {
    fn has_cache_storage(&self) -> bool {
        cfg!(all(target_arch = "wasm32", target_os = "unknown"))
    }

    fn has_deno_global(&self) -> bool {
        std::env::var_os("DENO_DEPLOYMENT_ID").is_some() || std::env::var_os("DENO_REGION").is_some()
    }

    fn has_edge_runtime_global(&self) -> bool {
        std::env::var_os("EdgeRuntime").is_some()
            || std::env::var("NEXT_RUNTIME").as_deref() == Ok("edge")
    }
}

/// Classify the host. Total and side-effect free; defaults to [`RuntimeKind::Node`].
pub fn detect(probe: &dyn EnvironmentProbe) -> RuntimeKind {
    if probe.has_cache_storage() {
        RuntimeKind::Cloudflare
    } else if probe.has_deno_global() {
        RuntimeKind::Deno
    } else if probe.has_edge_runtime_global() {
        RuntimeKind::VercelEdge
    } else {
        RuntimeKind::Node
    }
}

pub fn detect_current() -> RuntimeKind {
    detect(&ProcessProbe)
}
