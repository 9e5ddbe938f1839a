//! # meetlink-engine
//!
//! Runtime half of the meetlink media engine: transports, the channel
//! registry, connection supervision, and the publisher / subscriber
//! pipelines built on the pure protocol in `meetlink-transport`.
//!
//! ## Crate structure
//!
//! - [`transport`]: Stream, data-channel and socket transport variants
//! - [`registry`]: Named channels, sequence counters, backpressure, configs
//! - [`session`]: Connection lifecycle, reconnect supervisor, status events
//! - [`publisher`]: Capture → encode → frame → send
//! - [`subscriber`]: Receive → gate → decode → playout
//! - [`mixer`]: Shared audio mixing graph and playback clock
//! - [`media`]: Capture, codec and decoder collaborator traits
//! - [`config`]: TOML engine configuration
//! - [`error`]: Transport, media and engine errors

pub mod config;
pub mod error;
pub mod media;
pub mod mixer;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod subscriber;
pub mod transport;

mod util;

use std::sync::Arc;

use config::TransportConfig;
use transport::datachannel::{DataChannelConnector, Signaling};
use transport::socket::SocketConnector;
use transport::stream::StreamConnector;
use transport::{Connector, TransportKind};

/// Dialing connector for a configured transport. Data channels need a
/// signaling function; without one the data-channel kind is rejected.
pub fn connector_for(
    config: &TransportConfig,
    signaling: Option<Signaling>,
) -> Result<Arc<dyn Connector>, error::TransportError> {
    let connector: Arc<dyn Connector> = match config.kind {
        TransportKind::Stream => Arc::new(StreamConnector::new(config.endpoint.clone())),
        TransportKind::Socket => Arc::new(SocketConnector::new(config.endpoint.clone())),
        TransportKind::DataChannel => {
            let signaling = signaling
                .ok_or_else(|| error::TransportError::connect("data-channel transport needs signaling"))?;
            Arc::new(DataChannelConnector::new(signaling))
        }
    };
    Ok(connector)
}
