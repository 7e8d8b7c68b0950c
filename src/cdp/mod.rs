pub mod catalog;
mod client;
mod error;
mod transport;
mod types;

pub use client::{CdpClient, CdpConfig, CdpSession, HandlerId};
pub use error::CdpError;
pub use transport::{KeepaliveConfig, ReconnectConfig};
pub use types::{CdpEvent, CdpResponse};
