//! Command-line surface (spec.md §6.1). Argument parsing, help text, and
//! exit-code formatting are themselves out of scope per spec.md §1 beyond
//! what's needed to satisfy §6.1 — this module only defines the shape.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "bdg",
    version,
    about = "Browser telemetry collector driven over the Chrome DevTools Protocol",
    long_about = "bdg launches (or attaches to) a Chrome instance, drives it via the Chrome \
        DevTools Protocol, and records network traffic, console messages, and a final DOM \
        snapshot into structured JSON artifacts under ~/.bdg/. A long-lived daemon supervises \
        the collection session across short CLI invocations: `bdg <url>` starts one, `bdg peek` \
        samples it, `bdg stop` ends it gracefully.",
    term_width = 100
)]
pub struct Cli {
    /// URL to start a collection session against. Omit when using a subcommand.
    pub url: Option<String>,

    #[command(flatten)]
    pub start: StartOpts,

    /// Emit stable JSON on stdout instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to a config file (overrides $BDG_CONFIG and the default search path).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Flags that only apply to the bare `bdg <url>` start form.
#[derive(Args, Debug, Default)]
pub struct StartOpts {
    /// Chrome DevTools Protocol port to launch on or attach to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds to wait for Chrome/CDP to become ready.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Launch Chrome headless.
    #[arg(long)]
    pub headless: bool,

    /// Disable the default analytics/tracking domain exclude list and
    /// dev-server console noise filter.
    #[arg(long = "all")]
    pub include_all: bool,

    /// Maximum response body size to fetch, in megabytes.
    #[arg(long = "max-body-size")]
    pub max_body_size_mb: Option<u64>,

    /// Trim bodies and headers from the final artifact.
    #[arg(long)]
    pub compact: bool,

    /// Chrome user-data-dir to launch with.
    #[arg(long = "user-data-dir")]
    pub user_data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Daemon + session state.
    Status,

    /// Last-N preview of live telemetry.
    Peek(PeekArgs),

    /// Graceful stop of the active session.
    Stop,

    /// Remove stale session files and, optionally, orphaned Chrome processes.
    Cleanup(CleanupArgs),

    /// CDP introspection and raw passthrough.
    Cdp(CdpArgs),

    /// Full record for one network or console item.
    Details(DetailsArgs),

    /// Internal: runs the persistent daemon role. Never invoked directly.
    #[command(name = "__daemon", hide = true)]
    Daemon,

    /// Internal: runs the supervised worker role. Never invoked directly.
    #[command(name = "__worker", hide = true)]
    Worker,
}

#[derive(Args)]
pub struct PeekArgs {
    /// Only show the last N entries of each array.
    #[arg(long)]
    pub last: Option<usize>,

    /// Only show network entries.
    #[arg(long, conflicts_with = "console")]
    pub network: bool,

    /// Only show console entries.
    #[arg(long, conflicts_with = "network")]
    pub console: bool,

    /// Include full headers/bodies instead of a trimmed summary.
    #[arg(long)]
    pub verbose: bool,

    /// Keep polling and printing new entries until interrupted.
    #[arg(long)]
    pub follow: bool,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Remove files even if a named PID looks alive (double-checked first).
    #[arg(long)]
    pub force: bool,

    /// Also remove the daemon's own PID/lock files, not just worker state.
    #[arg(long)]
    pub all: bool,

    /// Additionally kill any Chrome process groups left behind by a prior session.
    #[arg(long)]
    pub aggressive: bool,
}

#[derive(Args)]
pub struct CdpArgs {
    /// CDP method to invoke, e.g. `Page.navigate`.
    pub method: Option<String>,

    /// JSON params for the method call.
    #[arg(long)]
    pub params: Option<String>,

    /// List known CDP methods in the built-in catalog.
    #[arg(long)]
    pub list: bool,

    /// Describe one method from the built-in catalog.
    #[arg(long)]
    pub describe: Option<String>,

    /// Search the built-in catalog by substring.
    #[arg(long)]
    pub search: Option<String>,
}

#[derive(Args)]
pub struct DetailsArgs {
    /// Which telemetry array the id refers to.
    #[arg(value_enum)]
    pub item_type: ItemType,

    /// `requestId` for network items, positional index for console items.
    pub id: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum ItemType {
    Network,
    Console,
}

impl ItemType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Console => "console",
        }
    }
}
