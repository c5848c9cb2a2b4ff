//! guacd link: TCP dialer, handshake state machine, relay halves.

mod client;

pub use client::{connect_values, GuacdClient, GuacdReader, GuacdWriter, HandshakeState};
