//! Telemetry collectors: translate CDP events into the bounded, filtered
//! in-memory structures that become `session.output.json` (spec.md §4.2).

pub mod console;
pub mod dom;
pub mod filter;
pub mod network;

pub use console::{ConsoleCollector, ConsoleConfig};
pub use dom::capture_dom_snapshot;
pub use filter::UrlFilter;
pub use network::{NetworkCollector, NetworkConfig};
