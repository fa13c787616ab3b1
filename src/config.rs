//! Fully-resolved runtime configuration, layered CLI > env > file the way
//! the teacher's `AppConfig` is loaded, with env prefix `PXA_`.

#![expect(
    non_snake_case,
    reason = "Clap/OrthoConfig derive macros generate helper modules with uppercase names"
)]
#![allow(
    missing_docs,
    reason = "OrthoConfig and Clap derive macros generate items that cannot be documented"
)]
#![allow(
    unfulfilled_lint_expectations,
    reason = "derive macros conditionally generate items"
)]

use clap::Parser;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

/// Every configuration value the request-lifecycle core consumes.
///
/// Loaded via `clap` (CLI) layered over `ortho_config`/`figment` (env + a
/// `.pxa.toml` dotfile), mirroring how the teacher's `AppConfig` is loaded.
#[derive(Parser, OrthoConfig, Serialize, Deserialize, Debug, Clone)]
#[ortho_config(prefix = "PXA_")]
pub struct Configuration {
    /// Root directory for per-transaction results (the spool directory).
    #[ortho_config(default = "/var/run/pxa/spool".to_owned())]
    #[arg(long, default_value_t = String::from("/var/run/pxa/spool"))]
    pub spool_dir: String,

    /// How long a finished transaction's spool directory survives before
    /// the purge loop reclaims it, as a `<n>{d|h|m}` duration string.
    #[ortho_config(default = "14d".to_owned())]
    #[arg(long, default_value_t = String::from("14d"))]
    pub spool_dir_purge_ttl: String,

    /// Root directory external modules are loaded from.
    #[ortho_config(default = "/opt/puppetlabs/pxa/modules".to_owned())]
    #[arg(long, default_value_t = String::from("/opt/puppetlabs/pxa/modules"))]
    pub modules_dir: String,

    /// Root directory task files are resolved under (`<tasks_dir>/<module>/tasks/<task>`).
    #[ortho_config(default = "/opt/puppetlabs/pxa/tasks".to_owned())]
    #[arg(long, default_value_t = String::from("/opt/puppetlabs/pxa/tasks"))]
    pub tasks_dir: String,

    /// Directory holding the bundled helper scripts (e.g. the `apply` Ruby shim).
    #[ortho_config(default = "/opt/puppetlabs/pxa/libexec".to_owned())]
    #[arg(long, default_value_t = String::from("/opt/puppetlabs/pxa/libexec"))]
    pub libexec_dir: String,

    /// Directory holding per-module static configuration files.
    #[ortho_config(default = "/etc/puppetlabs/pxa/modules.d".to_owned())]
    #[arg(long, default_value_t = String::from("/etc/puppetlabs/pxa/modules.d"))]
    pub modules_config_dir: String,

    /// Root of the content-addressed module cache.
    #[ortho_config(default = "/opt/puppetlabs/pxa/cache".to_owned())]
    #[arg(long, default_value_t = String::from("/opt/puppetlabs/pxa/cache"))]
    pub cache_dir: String,

    /// TTL for cache entries, as a `<n>{d|h|m}` duration string.
    #[ortho_config(default = "14d".to_owned())]
    #[arg(long, default_value_t = String::from("14d"))]
    pub cache_dir_purge_ttl: String,

    /// Broker URIs to try in order when dispatching downloads and applies.
    #[ortho_config(default = Vec::<String>::new())]
    #[arg(long)]
    pub master_uris: Vec<String>,

    /// Path to the CA certificate used for broker/master TLS.
    #[arg(long)]
    pub ca: Option<String>,

    /// Path to this agent's TLS client certificate.
    #[arg(long)]
    pub crt: Option<String>,

    /// Path to this agent's TLS private key.
    #[arg(long)]
    pub key: Option<String>,

    /// Path to the certificate revocation list, required only by `apply`.
    #[arg(long)]
    pub crl: Option<String>,

    /// Optional HTTP(S) proxy for downloads.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Connection timeout (seconds) for download requests.
    #[ortho_config(default = 10)]
    #[arg(long, default_value_t = 10)]
    pub download_connect_timeout: u64,

    /// Overall timeout (seconds) for download requests.
    #[ortho_config(default = 300)]
    #[arg(long, default_value_t = 300)]
    pub download_timeout: u64,

    /// How often the agent pings the broker, in seconds.
    #[ortho_config(default = 60)]
    #[arg(long, default_value_t = 60)]
    pub ping_interval_s: u64,
}

/// Top-level CLI entry point consumed by the `pxa-agent` binary.
#[derive(Parser, Deserialize, Serialize, Debug, Clone)]
pub struct Cli {
    /// Fully-resolved agent configuration.
    #[command(flatten)]
    pub config: Configuration,
}
