#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod api;
pub mod data_channel;
pub mod peer_connection;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use api::{API, APIBuilder};
pub use data_channel::{DataChannel, DataChannelFactory};
pub use peer_connection::PeerConnection;
pub use peer_connection::certificate::Certificate;
pub use peer_connection::configuration::{RTCConfiguration, RTCConfigurationBuilder};
pub use peer_connection::state::PeerConnectionState;
