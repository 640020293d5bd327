//! Demo host process wiring: a [`HostPeer`] and a [`ClientPeer`] sharing one
//! [`LoopbackTransport`] pair, registering a small position-replication
//! example and walking it through a handful of ticks so the handshake,
//! time-sync round and property stream are all visibly exercised. No real
//! socket is opened — the reliable-datagram transport this crate consumes
//! is an external collaborator (see `netcode_peer::transport`), and
//! `LoopbackTransport` is what both the test suite and this binary plug in.

pub mod config;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::info;

use codec::identifiers::PropertyIndex;
use codec::message_type::{Guid, MessageFlags, MessageKind};
use codec::property::PropertyMask;

use peer::dispatch::Handler;
use peer::host::HostPeer;
use peer::client::ClientPeer;
use peer::property_stream::PropertyDescriptor;
use peer::transport::{ChannelFlags, LoopbackTransport};

use config::Config;

/// The replicated position of the demo's one networked object: an
/// atomic-backed stand-in for whatever component system an embedding game
/// would actually resolve a `BoundObjectIdentifier`'s owner handle into.
#[derive(Default)]
struct Position {
    x: AtomicU32,
    y: AtomicU32,
}

const POSITION_TYPE_GUID: Guid = Guid(1);
const PING_FUNCTION_GUID: Guid = Guid(2);

fn position_properties() -> Vec<PropertyDescriptor> {
    vec![
        PropertyDescriptor {
            guid: Guid(10),
            flags: MessageFlags::default(),
            encode: Box::new(|owner, w| {
                let position = owner.downcast_ref::<Position>().expect("Position owner");
                w.write_bits(position.x.load(Ordering::Relaxed) as u64, 32)
            }),
            decode: Box::new(|owner, r| {
                let position = owner.downcast_ref::<Position>().expect("Position owner");
                position.x.store(r.read_bits(32)? as u32, Ordering::Relaxed);
                Ok(())
            }),
        },
        PropertyDescriptor {
            guid: Guid(11),
            flags: MessageFlags::default(),
            encode: Box::new(|owner, w| {
                let position = owner.downcast_ref::<Position>().expect("Position owner");
                w.write_bits(position.y.load(Ordering::Relaxed) as u64, 32)
            }),
            decode: Box::new(|owner, r| {
                let position = owner.downcast_ref::<Position>().expect("Position owner");
                position.y.store(r.read_bits(32)? as u32, Ordering::Relaxed);
                Ok(())
            }),
        },
    ]
}

/// Builds a connected host/client pair over a loopback transport, runs the
/// handshake and time-sync round to completion, replicates one property
/// change, and round-trips a client-to-host ping. Returns once the demo
/// scenario has played out.
pub fn startup(config: Config) -> anyhow::Result<()> {
    info!("starting demo host, bind address {} (informational; no socket is opened)", config.host.bind_address);
    info!(
        "configured limits: max_clients={} max_channels={} idle_timeout={:?}",
        config.host.max_clients,
        config.host.max_channels,
        config.host.idle_timeout()
    );

    let update_period = config.host.update_period();
    let (host_transport, client_transport) = LoopbackTransport::pair();
    let host = HostPeer::new(host_transport, update_period);
    let client = ClientPeer::new(client_transport, update_period);

    host.register_property_stream(POSITION_TYPE_GUID, position_properties());
    client.register_property_type(POSITION_TYPE_GUID, position_properties());

    host.register_function(
        PING_FUNCTION_GUID,
        MessageFlags::CLIENT_TO_HOST,
        0,
        MessageKind::Plain,
        Handler::Plain(Box::new(|ctx, _reader| {
            info!("host received a ping from client {:?}", ctx.sender_client);
            Ok(())
        })),
    );
    client.register_function(
        PING_FUNCTION_GUID,
        MessageFlags::CLIENT_TO_HOST,
        0,
        MessageKind::Plain,
        Handler::Plain(Box::new(|_ctx, _reader| Ok(()))),
    );

    let position = Arc::new(Position::default());
    let object = host.bind_object(Guid(100), position.clone());

    host.start(config.host.bind_address);
    client.connect(config.host.bind_address);

    // Drives the handshake, the client's `RequestTimeSync` reply and the
    // host's `ReceivedTimeSyncResponse` to completion; two round trips is
    // enough since neither side has anything else queued yet.
    for _ in 0..4 {
        host.tick();
        client.tick();
    }

    info!("client identifier: {:?}, round trip time: {:?}", client.identifier(), client.round_trip_time());

    position.x.store(10, Ordering::Relaxed);
    position.y.store(20, Ordering::Relaxed);
    let mut mask = PropertyMask::EMPTY;
    mask.set(PropertyIndex(0));
    mask.set(PropertyIndex(1));
    host.invalidate_properties_to_all_clients(
        host.message_types.identifier_for_guid(POSITION_TYPE_GUID).expect("registered"),
        object,
        mask,
    );

    for _ in 0..4 {
        host.tick();
        client.tick();
    }

    let ping_identifier = client.find_message_identifier(PING_FUNCTION_GUID).expect("handshake completed");
    client.send_message_to_host(ping_identifier, None, 0, ChannelFlags::Reliable, 0, |_| {})?;
    host.tick();

    info!("demo scenario complete");
    Ok(())
}
