//! CLI surface and runtime configuration.
//!
//! As spec.md §6: two CLI surfaces (`bl-messaging-broker`, its HTTP-bridge
//! counterpart), both parsed with `clap` derive macros, matching the
//! teacher's own `#[derive(Parser)]` / `#[command(...)]` `main.rs` style.
//! Layering follows the teacher's `config.rs`: CLI flags are the top layer,
//! an optional `--authorization-config-file` JSON file underneath, built-in
//! defaults at the bottom.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::broker::DEFAULT_QUEUE_DEPTH;

/// Process exit codes. `0` is reserved: this process is expected to run
/// until signalled, so a clean `0` exit would mask the fact that it never
/// should have returned — everything else is a distinct, alertable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    GenericFailure = 1,
    InvalidCommandLine = 2,
    AuthenticationExpired = 3,
    InvalidCommand = 4,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// `bl-messaging-broker`'s command-line surface, exactly spec.md §6.
#[derive(Debug, Parser)]
#[command(name = "bl-messaging-broker")]
#[command(version)]
#[command(about = "TLS-framed messaging broker")]
pub struct BrokerArgs {
    #[arg(long, default_value_t = 29300)]
    pub inbound_port: u16,

    /// Defaults to `inbound_port + 1` when omitted.
    #[arg(long)]
    pub outbound_port: Option<u16>,

    #[arg(long)]
    pub processing_threads_count: Option<usize>,

    #[arg(long)]
    pub max_outstanding_operations: Option<usize>,

    #[arg(long)]
    pub max_queue_depth: Option<usize>,

    #[arg(long)]
    pub private_key_file: PathBuf,

    #[arg(long)]
    pub certificate_file: PathBuf,

    #[arg(long)]
    pub authorization_config_file: Option<PathBuf>,

    #[arg(long)]
    pub verify_root_ca: Option<PathBuf>,

    /// Enables proxy mode: forward to these upstream brokers instead of
    /// delivering locally (C10).
    #[arg(long)]
    pub proxy_endpoints: Vec<String>,

    /// Authentication token type this broker presents to its own upstream
    /// when dialing `--proxy-endpoints` (spec.md §4.C3's per-connection
    /// handshake applies to proxy mode too, since it is itself a client of
    /// the upstream broker). Required when `--proxy-endpoints` is set.
    #[arg(long)]
    pub proxy_auth_token_type: Option<String>,

    #[arg(long)]
    pub proxy_auth_token_data: Option<String>,
}

impl BrokerArgs {
    pub fn outbound_port(&self) -> u16 {
        self.outbound_port.unwrap_or(self.inbound_port.saturating_add(1))
    }

    /// The token this process presents when it authenticates *as a client*
    /// to its upstream broker in proxy mode. `None` if the operator omitted
    /// both flags while still requesting `--proxy-endpoints`, which
    /// `build_proxy_routing` treats as a startup error.
    pub fn proxy_auth_token(&self) -> Option<crate::protocol::AuthenticationToken> {
        Some(crate::protocol::AuthenticationToken {
            token_type: self.proxy_auth_token_type.clone()?,
            data: self.proxy_auth_token_data.clone()?,
        })
    }

    pub fn processing_threads_count(&self) -> usize {
        self.processing_threads_count
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }

    pub fn max_outstanding_operations(&self) -> usize {
        self.max_outstanding_operations.unwrap_or(256)
    }

    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH)
    }
}

/// `bl-messaging-http-gateway`'s command-line surface: the broker surface
/// plus the bridge-specific flags from spec.md §6.
#[derive(Debug, Parser)]
#[command(name = "bl-messaging-http-gateway")]
#[command(version)]
#[command(about = "HTTP-to-messaging bridge (C9)")]
pub struct BridgeArgs {
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    #[arg(long)]
    pub private_key_file: PathBuf,

    #[arg(long)]
    pub certificate_file: PathBuf,

    /// The broker this bridge dials into as a forwarding client.
    #[arg(long)]
    pub broker_address: String,

    #[arg(long)]
    pub verify_root_ca: Option<PathBuf>,

    /// The server peer every bridged HTTP request is addressed to.
    #[arg(long)]
    pub target_peer_id: uuid::Uuid,

    #[arg(long, default_value_t = 4)]
    pub stripe_count: usize,

    /// Cookie names to check for a security token, in order; the first
    /// present wins.
    #[arg(long)]
    pub token_cookie_name: Vec<String>,

    #[arg(long)]
    pub token_type_default: Option<String>,

    #[arg(long)]
    pub token_data_default: Option<String>,

    #[arg(long, default_value_t = 30)]
    pub request_timeout_in_seconds: u64,

    #[arg(long, default_value_t = false)]
    pub graphql_error_formatting: bool,

    /// The token type/data this bridge presents when it authenticates *as a
    /// client* to `--broker-address` (spec.md §4.C3's per-connection
    /// handshake) — distinct from `--token-type-default`/`--token-data-default`,
    /// which describe the end user's own security principal carried inside
    /// the bridged request.
    #[arg(long)]
    pub broker_auth_token_type: String,

    #[arg(long)]
    pub broker_auth_token_data: String,
}

impl BridgeArgs {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_seconds)
    }

    pub fn broker_auth_token(&self) -> crate::protocol::AuthenticationToken {
        crate::protocol::AuthenticationToken {
            token_type: self.broker_auth_token_type.clone(),
            data: self.broker_auth_token_data.clone(),
        }
    }
}

/// Optional `--authorization-config-file` JSON overlay: settings an
/// operator wants out of the CLI invocation entirely (e.g. the REST
/// authorizer endpoint and freshness window). CLI flags, where present,
/// always win over this file; this file wins over built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationConfigFile {
    #[serde(default)]
    pub rest_endpoint: Option<String>,
    #[serde(default)]
    pub freshness_seconds: Option<u64>,
    #[serde(default)]
    pub negative_ttl_seconds: Option<u64>,
}

impl AuthorizationConfigFile {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading authorization config file {path:?}: {e}"))?;
        serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parsing authorization config file {path:?}: {e}"))
    }
}
