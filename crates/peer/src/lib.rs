//! The peer engine: binds the wire codec to an actual session between a
//! host and its clients. Where `netcode-codec` only knows how to read and
//! write bytes, this crate owns the registries, authority rules, property
//! queues and dispatch that give those bytes meaning.
//!
//! [`host::HostPeer`] and [`client::ClientPeer`] are the two entry points;
//! everything else here is a building block both of them share.

pub mod authority;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod forwarding;
pub mod host;
pub mod property_stream;
pub mod registry;
pub mod session;
pub mod time_sync;
pub mod transport;
