//! The reliable-datagram transport this crate consumes but does not
//! implement (the underlying UDP/reliable-datagram library is an
//! external collaborator). [`Transport`] is the seam: a real deployment
//! plugs in a UDP-backed implementation, tests and the demo plug in
//! [`LoopbackTransport`].

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

/// Per-send reliability/ordering request. Channel 0 is always `Reliable`;
/// channel 1 (property streams) is always `UnreliableUnsequenced`; higher
/// channels are chosen per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFlags {
    Reliable,
    UnreliableUnsequenced,
}

/// A connect, receive or disconnect event drained from the transport during
/// the tick loop's inbound phase.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connect(RemotePeerId),
    Receive(RemotePeerId, u8, Vec<u8>),
    Disconnect(RemotePeerId),
}

/// Opaque handle to whoever is on the other end of a logical connection,
/// scoped to one `Transport` instance. On the host this is one handle per
/// connected client; on the client it is always the single handle bound at
/// `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemotePeerId(pub u32);

/// The seam between this crate's protocol logic and whatever reliable
/// datagram library actually owns a socket. `service` must not block past
/// whatever the implementation considers "no more events right now" — the
/// tick loop calls it in a loop until it returns `None`.
pub trait Transport: Send {
    fn start(&mut self, bind: SocketAddrV4) -> bool;

    fn connect(&mut self, address: SocketAddrV4) -> Option<RemotePeerId>;

    fn send(&mut self, to: RemotePeerId, channel: u8, flags: ChannelFlags, bytes: &[u8]) -> bool;

    fn disconnect(&mut self, who: RemotePeerId);

    fn service(&mut self) -> Option<TransportEvent>;

    fn round_trip_time(&self, who: RemotePeerId) -> Option<std::time::Duration>;
}

/// An in-memory transport double used by tests and the demo binary:
/// `LoopbackTransport`s sharing queues stand in for a host and any number
/// of clients without touching a socket. A host endpoint accumulates one
/// peer entry per client that connects to it; a client endpoint typically
/// has exactly one (the host it dialed).
///
/// # Test
///
/// ```
/// use netcode_peer::transport::{ChannelFlags, LoopbackTransport, Transport};
///
/// let (mut host, mut client) = LoopbackTransport::pair();
/// host.service(); // drain the initial Connect event
/// client.service();
///
/// let remote = host.remote_id().unwrap();
/// host.send(remote, 0, ChannelFlags::Reliable, b"hello");
///
/// let delivered = client.service().unwrap();
/// assert!(matches!(
///     delivered,
///     netcode_peer::transport::TransportEvent::Receive(_, 0, bytes) if bytes == b"hello"
/// ));
/// ```
pub struct LoopbackTransport {
    id: RemotePeerId,
    inbox: Arc<Mutex<VecDeque<TransportEvent>>>,
    peers: Mutex<HashMap<RemotePeerId, Arc<Mutex<VecDeque<TransportEvent>>>>>,
}

impl LoopbackTransport {
    /// Builds an unconnected endpoint. Call [`LoopbackTransport::pair`] for
    /// the common two-sided construction, or [`connect_to`](Self::connect_to)
    /// to wire an already-built endpoint to another — repeatedly, for a
    /// host accepting several clients.
    pub fn new(id: u32) -> Self {
        Self {
            id: RemotePeerId(id),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// This endpoint's own id, as seen by whoever it is connected to.
    pub fn id(&self) -> RemotePeerId {
        self.id
    }

    /// The id to pass as `to` when sending from this endpoint, if it has
    /// exactly one connected peer (the common client-side and paired-test
    /// case). A host with several clients should track ids off the
    /// `TransportEvent::Connect` events it receives instead.
    pub fn remote_id(&self) -> Option<RemotePeerId> {
        let peers = self.peers.lock().unwrap();
        (peers.len() == 1).then(|| *peers.keys().next().unwrap())
    }

    /// Builds a connected host/client pair and delivers the initial
    /// `Connect` event to both sides' queues.
    pub fn pair() -> (Self, Self) {
        let mut host = Self::new(1);
        let mut client = Self::new(2);
        client.connect_to(&mut host);
        (host, client)
    }

    /// Wires `self` to `other`, delivering a `Connect` event to both, without
    /// disturbing either side's other existing connections.
    pub fn connect_to(&mut self, other: &mut Self) -> RemotePeerId {
        self.peers.lock().unwrap().insert(other.id, other.inbox.clone());
        other.peers.lock().unwrap().insert(self.id, self.inbox.clone());

        other.inbox.lock().unwrap().push_back(TransportEvent::Connect(self.id));
        self.inbox.lock().unwrap().push_back(TransportEvent::Connect(other.id));

        other.id
    }
}

impl Transport for LoopbackTransport {
    fn start(&mut self, _bind: SocketAddrV4) -> bool {
        true
    }

    fn connect(&mut self, _address: SocketAddrV4) -> Option<RemotePeerId> {
        self.remote_id()
    }

    fn send(&mut self, to: RemotePeerId, channel: u8, _flags: ChannelFlags, bytes: &[u8]) -> bool {
        let peers = self.peers.lock().unwrap();
        match peers.get(&to) {
            Some(inbox) => {
                inbox
                    .lock()
                    .unwrap()
                    .push_back(TransportEvent::Receive(self.id, channel, bytes.to_vec()));
                true
            }
            None => false,
        }
    }

    fn disconnect(&mut self, who: RemotePeerId) {
        if let Some(inbox) = self.peers.lock().unwrap().remove(&who) {
            inbox.lock().unwrap().push_back(TransportEvent::Disconnect(self.id));
        }
    }

    fn service(&mut self) -> Option<TransportEvent> {
        self.inbox.lock().unwrap().pop_front()
    }

    fn round_trip_time(&self, _who: RemotePeerId) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_millis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_send_on_one_side_is_received_on_the_other() {
        let (mut host, mut client) = LoopbackTransport::pair();
        assert!(matches!(host.service(), Some(TransportEvent::Connect(_))));
        assert!(matches!(client.service(), Some(TransportEvent::Connect(_))));

        host.send(RemotePeerId(2), 0, ChannelFlags::Reliable, b"hi");
        match client.service() {
            Some(TransportEvent::Receive(_, 0, bytes)) => assert_eq!(bytes, b"hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn sending_to_an_unconnected_remote_fails() {
        let mut host = LoopbackTransport::new(1);
        assert!(!host.send(RemotePeerId(99), 0, ChannelFlags::Reliable, b"x"));
    }

    #[test]
    fn a_host_can_reach_several_independently_connected_clients() {
        let mut host = LoopbackTransport::new(1);
        let mut client_a = LoopbackTransport::new(2);
        let mut client_b = LoopbackTransport::new(3);

        client_a.connect_to(&mut host);
        client_b.connect_to(&mut host);

        assert!(matches!(client_a.service(), Some(TransportEvent::Connect(_))));
        assert!(matches!(client_b.service(), Some(TransportEvent::Connect(_))));
        host.service();
        host.service();

        assert!(host.send(RemotePeerId(2), 0, ChannelFlags::Reliable, b"to-a"));
        assert!(host.send(RemotePeerId(3), 0, ChannelFlags::Reliable, b"to-b"));

        match client_a.service() {
            Some(TransportEvent::Receive(_, 0, bytes)) => assert_eq!(bytes, b"to-a"),
            other => panic!("unexpected event: {other:?}"),
        }
        match client_b.service() {
            Some(TransportEvent::Receive(_, 0, bytes)) => assert_eq!(bytes, b"to-b"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
