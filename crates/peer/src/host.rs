//! `HostPeer`: per-client identifier allocation, per-client property
//! queues, authority delegation, broadcast fan-out and forwarding.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::HashMap;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use codec::bitview::{BitReader, BitWriter};
use codec::buffer::MessageBuffer;
use codec::identifiers::{BoundObjectIdentifier, ClientIdentifier, MessageTypeIdentifier, SequenceNumber};
use codec::message_type::{
    BatchMessagesHeader, BoundObjectAuthorityMessage, ConfirmPropagatedPropertyReceipt, DefaultMessageType, Guid,
    LocalPeerConnected, MessageFlags, ObjectBound, RegisterNewMessageType, RegisterPropertyStreamMessageHeader,
};
use codec::property::PropertyMask;

use crate::dispatch::{DispatchContext, Handler};
use crate::error::{Rejection, SendError};
use crate::forwarding::{self, ForwardScope};
use crate::property_stream::{PerPeerPropagatedPropertyData, PropertyDescriptor, PropertyStreamType};
use crate::registry::{BoundObjectRegistry, MessageTypeRegistry, OwnerHandle, Registration};
use crate::time_sync::{ClockOffset, RoundTripTimestamps};
use crate::transport::{ChannelFlags, RemotePeerId, Transport, TransportEvent};

const CHANNEL_CONTROL: u8 = 0;
const CHANNEL_PROPERTIES: u8 = 1;

struct ConnectedClient {
    remote: RemotePeerId,
    self_bound_object: BoundObjectIdentifier,
    propagated: Arc<PerPeerPropagatedPropertyData>,
    clock_offset: ClockOffset,
    host_sent_timestamp: i64,
}

/// The authoritative side of a session: allocates `ClientIdentifier`s,
/// fans messages out, owns every bound object's default authority, and
/// mediates client-to-client forwarding.
pub struct HostPeer<T: Transport> {
    transport: Mutex<T>,
    pub message_types: MessageTypeRegistry,
    property_types: RwLock<HashMap<MessageTypeIdentifier, Arc<PropertyStreamType>>>,
    pub bound_objects: BoundObjectRegistry,
    clients: RwLock<HashMap<ClientIdentifier, ConnectedClient>>,
    remote_to_client: RwLock<HashMap<RemotePeerId, ClientIdentifier>>,
    next_client_slot: AtomicU32,
    update_period: Duration,
    on_client_connected: Mutex<Option<Box<dyn FnMut(ClientIdentifier, BoundObjectIdentifier) + Send>>>,
    on_client_disconnected: Mutex<Option<Box<dyn FnMut(ClientIdentifier) + Send>>>,
}

impl<T: Transport> HostPeer<T> {
    pub fn new(transport: T, update_period: Duration) -> Self {
        Self {
            transport: Mutex::new(transport),
            message_types: MessageTypeRegistry::new(),
            property_types: RwLock::new(HashMap::default()),
            bound_objects: BoundObjectRegistry::new(),
            clients: RwLock::new(HashMap::default()),
            remote_to_client: RwLock::new(HashMap::default()),
            next_client_slot: AtomicU32::new(0),
            update_period,
            on_client_connected: Mutex::new(None),
            on_client_disconnected: Mutex::new(None),
        }
    }

    pub fn start(&self, bind: SocketAddrV4) -> bool {
        self.transport.lock().start(bind)
    }

    pub fn on_client_connected(&self, f: impl FnMut(ClientIdentifier, BoundObjectIdentifier) + Send + 'static) {
        *self.on_client_connected.lock() = Some(Box::new(f));
    }

    pub fn on_client_disconnected(&self, f: impl FnMut(ClientIdentifier) + Send + 'static) {
        *self.on_client_disconnected.lock() = Some(Box::new(f));
    }

    /// Registers a remotely invokable function, assigning the next free
    /// session-scoped `MessageTypeIdentifier`.
    pub fn register_function(
        &self,
        function_guid: Guid,
        flags: MessageFlags,
        fixed_compressed_bits: u32,
        kind: codec::message_type::MessageKind,
        handler: Handler,
    ) -> MessageTypeIdentifier {
        self.message_types.register(function_guid, |identifier| Registration {
            message_type: codec::message_type::MessageType {
                identifier,
                function_guid,
                kind,
                flags,
                fixed_compressed_bits,
            },
            handler,
        })
    }

    /// Registers a property-stream type; the property count and the
    /// per-property GUIDs are what the handshake advertises to clients.
    pub fn register_property_stream(&self, type_guid: Guid, properties: Vec<PropertyDescriptor>) -> MessageTypeIdentifier {
        let identifier = self.message_types.register(type_guid, |identifier| Registration {
            message_type: codec::message_type::MessageType {
                identifier,
                function_guid: type_guid,
                kind: codec::message_type::MessageKind::StreamedProperty,
                flags: MessageFlags::default(),
                fixed_compressed_bits: 0,
            },
            handler: Handler::Plain(Box::new(|_, _| Ok(()))),
        });

        self.property_types.write().insert(
            identifier,
            Arc::new(PropertyStreamType {
                identifier,
                type_guid,
                properties,
            }),
        );

        identifier
    }

    /// `BindObject(persistentGuid, object)`: also broadcasts `ObjectBound`
    /// to every already-connected client.
    pub fn bind_object(&self, persistent_guid: Guid, owner: OwnerHandle) -> BoundObjectIdentifier {
        let id = self.bound_objects.bind(Some(persistent_guid), owner);

        let clients: Vec<RemotePeerId> = self.clients.read().values().map(|c| c.remote).collect();
        if !clients.is_empty() {
            let mut bytes = vec![0u8; 16];
            let written = {
                let mut writer = BitWriter::new(&mut bytes);
                let _ = DefaultMessageType::ObjectBound.identifier().pack(&mut writer);
                let _ = (ObjectBound {
                    bound_object: id,
                    persistent_guid,
                })
                .pack(&mut writer);
                writer.position()
            };
            bytes.truncate(written.div_ceil(8));

            let mut transport = self.transport.lock();
            for remote in clients {
                transport.send(remote, CHANNEL_CONTROL, ChannelFlags::Reliable, &bytes);
            }
        }

        id
    }

    /// `DelegateBoundObjectAuthority(obj, newClient)`.
    pub fn delegate_bound_object_authority(&self, obj: BoundObjectIdentifier, new_client: ClientIdentifier) {
        if let Some(current) = self.bound_objects.authority_delegate(obj) {
            if current != new_client {
                self.send_authority_message(current, DefaultMessageType::BoundObjectAuthorityRevokedFromLocalClient, obj);
            }
        }

        self.send_authority_message(new_client, DefaultMessageType::BoundObjectAuthorityGivenToLocalClient, obj);
        self.bound_objects.set_authority_delegate(obj, new_client);
    }

    /// `RevokeBoundObjectAuthority(obj)`.
    pub fn revoke_bound_object_authority(&self, obj: BoundObjectIdentifier) {
        if let Some(current) = self.bound_objects.authority_delegate(obj) {
            self.send_authority_message(current, DefaultMessageType::BoundObjectAuthorityRevokedFromLocalClient, obj);
        }
        self.bound_objects.clear_authority_delegate(obj);
    }

    fn send_authority_message(&self, client: ClientIdentifier, kind: DefaultMessageType, obj: BoundObjectIdentifier) {
        let Some(remote) = self.remote_for(client) else { return };
        let mut bytes = vec![0u8; 8];
        let written = {
            let mut writer = BitWriter::new(&mut bytes);
            let _ = kind.identifier().pack(&mut writer);
            let _ = BoundObjectAuthorityMessage { bound_object: obj }.pack(&mut writer);
            writer.position()
        };
        bytes.truncate(written.div_ceil(8));
        self.transport.lock().send(remote, CHANNEL_CONTROL, ChannelFlags::Reliable, &bytes);
    }

    fn remote_for(&self, client: ClientIdentifier) -> Option<RemotePeerId> {
        self.clients.read().get(&client).map(|c| c.remote)
    }

    fn client_for(&self, remote: RemotePeerId) -> Option<ClientIdentifier> {
        self.remote_to_client.read().get(&remote).copied()
    }

    /// `InvalidatePropertiesToClient`.
    pub fn invalidate_properties_to_client(
        &self,
        client: ClientIdentifier,
        message_type: MessageTypeIdentifier,
        obj: BoundObjectIdentifier,
        mask: PropertyMask,
    ) {
        if let Some(c) = self.clients.read().get(&client) {
            c.propagated.invalidate(message_type, obj, mask);
        }
    }

    /// `InvalidatePropertiesToAllClients`.
    pub fn invalidate_properties_to_all_clients(
        &self,
        message_type: MessageTypeIdentifier,
        obj: BoundObjectIdentifier,
        mask: PropertyMask,
    ) {
        for c in self.clients.read().values() {
            c.propagated.invalidate(message_type, obj, mask);
        }
    }

    pub fn flush_properties_to_client(&self, client: ClientIdentifier, message_type: MessageTypeIdentifier) {
        if let Some(c) = self.clients.read().get(&client) {
            c.propagated.flush(message_type);
        }
    }

    pub fn flush_properties_to_all_clients(&self, message_type: MessageTypeIdentifier) {
        for c in self.clients.read().values() {
            c.propagated.flush(message_type);
        }
    }

    pub fn client_round_trip_time(&self, client: ClientIdentifier) -> Option<Duration> {
        let remote = self.remote_for(client)?;
        self.transport.lock().round_trip_time(remote)
    }

    pub fn convert_client_timestamp_to_local(&self, client: ClientIdentifier, ts: i64) -> Option<i64> {
        self.clients.read().get(&client).map(|c| c.clock_offset.convert_to_local(ts))
    }

    /// The `BoundObjectIdentifier` the host allocated to represent a
    /// connected client itself (e.g. as the owner of its player pawn).
    pub fn client_bound_object(&self, client: ClientIdentifier) -> Option<BoundObjectIdentifier> {
        self.clients.read().get(&client).map(|c| c.self_bound_object)
    }

    /// `SendMessageTo(clientId, …)`: a plain, non-object-targeted message.
    pub fn send_message_to(
        &self,
        client: ClientIdentifier,
        channel: u8,
        channel_flags: ChannelFlags,
        message_type: MessageTypeIdentifier,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) -> Result<(), SendError> {
        let registration = self.message_types.lookup(message_type).ok_or(SendError::Unregistered)?;
        if !registration.message_type.flags.contains(MessageFlags::HOST_TO_CLIENT) {
            return Err(SendError::DirectionMismatch);
        }

        let remote = self.remote_for(client).ok_or(SendError::UnknownBoundObject)?;
        let bytes = self.encode(message_type, bits, pack);

        if self.transport.lock().send(remote, channel, channel_flags, &bytes) {
            Ok(())
        } else {
            Err(SendError::TransportFailure)
        }
    }

    /// `BroadcastMessageToAllClients<Function>(…)`.
    pub fn broadcast_to_all_clients(
        &self,
        channel: u8,
        channel_flags: ChannelFlags,
        message_type: MessageTypeIdentifier,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) {
        let bytes = self.encode(message_type, bits, pack);
        let remotes: Vec<_> = self.clients.read().values().map(|c| c.remote).collect();
        let mut transport = self.transport.lock();
        for remote in remotes {
            transport.send(remote, channel, channel_flags, &bytes);
        }
    }

    /// `BroadcastMessageToOtherClients<Function>(…)` / `ToRemoteClients`:
    /// every connected client except `excluding`. The two spec names cover
    /// the same exclusion semantics — whichever single client the caller is
    /// already acting on behalf of.
    pub fn broadcast_to_other_clients(
        &self,
        excluding: ClientIdentifier,
        channel: u8,
        channel_flags: ChannelFlags,
        message_type: MessageTypeIdentifier,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) {
        let bytes = self.encode(message_type, bits, pack);
        let remotes: Vec<_> = self
            .clients
            .read()
            .iter()
            .filter(|(id, _)| **id != excluding)
            .map(|(_, c)| c.remote)
            .collect();
        let mut transport = self.transport.lock();
        for remote in remotes {
            transport.send(remote, channel, channel_flags, &bytes);
        }
    }

    fn encode(&self, message_type: MessageTypeIdentifier, bits: usize, pack: impl FnOnce(&mut BitWriter)) -> Vec<u8> {
        let header_bits = MessageTypeIdentifier::BITS as usize;
        let mut buffer = MessageBuffer::with_bit_count(header_bits + bits);
        let written = {
            let mut writer = buffer.writer();
            let _ = message_type.pack(&mut writer);
            pack(&mut writer);
            writer.position()
        };
        let mut bytes = buffer.as_bytes().to_vec();
        bytes.truncate(written.div_ceil(8));
        bytes
    }

    /// Runs the two-phase tick: outbound property streaming, then inbound
    /// drain, in that order.
    pub fn tick(&self) {
        self.send_due_properties();
        while self.service_one_event() {}
    }

    fn send_due_properties(&self) {
        let now = Instant::now();
        let snapshot: Vec<(ClientIdentifier, RemotePeerId, Arc<PerPeerPropagatedPropertyData>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, c)| (*id, c.remote, c.propagated.clone()))
            .collect();

        for (_client, remote, propagated) in snapshot {
            for (message_type, seq, objects) in propagated.due_for_send(now, self.update_period) {
                if let Some(bytes) = self.encode_property_stream(message_type, seq, &objects) {
                    self.transport
                        .lock()
                        .send(remote, CHANNEL_PROPERTIES, ChannelFlags::UnreliableUnsequenced, &bytes);
                }
            }
        }
    }

    fn encode_property_stream(
        &self,
        message_type: MessageTypeIdentifier,
        seq: SequenceNumber,
        objects: &[(BoundObjectIdentifier, PropertyMask)],
    ) -> Option<Vec<u8>> {
        let stream_type = self.property_types.read().get(&message_type).cloned()?;
        let mask_bits = stream_type.mask_bits();

        let mut bits = MessageTypeIdentifier::BITS as usize + 16 + BoundObjectIdentifier::BITS as usize;
        for (obj, mask) in objects {
            bits += BoundObjectIdentifier::BITS as usize + mask_bits as usize;
            for idx in mask.iter_set(stream_type.property_count()) {
                let _ = idx;
            }
            let _ = obj;
        }
        // Dynamic property payload sizes are added while packing below; the
        // reservation above covers the header and masks, which is all the
        // caller needs to know to size the buffer conservatively — we grow
        // the `Vec` instead of failing if a dynamically sized property
        // needs more room than the fixed estimate.
        let mut bytes = vec![0u8; bits.div_ceil(8) + 64];

        loop {
            let mut writer = BitWriter::new(&mut bytes);
            let mut ok = true;
            ok &= message_type.pack(&mut writer).is_ok();
            ok &= seq.pack(&mut writer).is_ok();
            ok &= writer.write_bits(objects.len() as u64, BoundObjectIdentifier::BITS).is_ok();

            for (obj, mask) in objects {
                ok &= obj.pack(&mut writer).is_ok();
                ok &= mask.pack(&mut writer, stream_type.property_count()).is_ok();

                for idx in mask.iter_set(stream_type.property_count()) {
                    if let Some(owner) = self.bound_objects.resolve(*obj) {
                        let prop = &stream_type.properties[idx.0 as usize];
                        if (prop.encode)(&owner, &mut writer).is_err() {
                            ok = false;
                        }
                    } else {
                        ok = false;
                    }
                }
            }

            if ok {
                let used = writer.position();
                bytes.truncate(used.div_ceil(8));
                return Some(bytes);
            }

            if bytes.len() > 1 << 20 {
                error!("property stream for {message_type:?} exceeded the growth ceiling");
                return None;
            }
            bytes.resize(bytes.len() * 2, 0);
        }
    }

    fn service_one_event(&self) -> bool {
        let event = self.transport.lock().service();
        match event {
            Some(TransportEvent::Connect(remote)) => {
                self.handle_connect(remote);
                true
            }
            Some(TransportEvent::Receive(remote, channel, bytes)) => {
                self.handle_receive(remote, channel, &bytes);
                true
            }
            Some(TransportEvent::Disconnect(remote)) => {
                self.handle_disconnect(remote);
                true
            }
            None => false,
        }
    }

    fn handle_connect(&self, remote: RemotePeerId) {
        let slot = self.next_client_slot.fetch_add(1, Ordering::Relaxed) as usize;
        let client_identifier = ClientIdentifier::from_slot(slot, 0);
        let self_bound_object = self.bound_objects.bind(None, Arc::new(client_identifier));

        let host_sent_timestamp = now_nanos();

        self.clients.write().insert(
            client_identifier,
            ConnectedClient {
                remote,
                self_bound_object,
                propagated: Arc::new(PerPeerPropagatedPropertyData::default()),
                clock_offset: ClockOffset::default(),
                host_sent_timestamp,
            },
        );
        self.remote_to_client.write().insert(remote, client_identifier);

        let handshake = self.build_handshake(client_identifier, self_bound_object, host_sent_timestamp);
        self.transport.lock().send(remote, CHANNEL_CONTROL, ChannelFlags::Reliable, &handshake);

        if let Some(cb) = self.on_client_connected.lock().as_mut() {
            cb(client_identifier, self_bound_object);
        }
    }

    fn build_handshake(
        &self,
        client_identifier: ClientIdentifier,
        self_bound_object: BoundObjectIdentifier,
        host_sent_timestamp: i64,
    ) -> Vec<u8> {
        let functions: Vec<_> = self
            .message_types
            .iter_registered()
            .into_iter()
            .filter(|(id, _)| self.property_types.read().get(id).is_none())
            .collect();
        let property_types: Vec<_> = self.property_types.read().values().cloned().collect();
        let bound: Vec<_> = self.bound_objects.persistent_guids();

        let id_bits = MessageTypeIdentifier::BITS as usize;
        let guid_bits = Guid::BITS as usize;

        let mut total_bits = id_bits + 16; // BatchMessages envelope
        for _ in &functions {
            total_bits += id_bits + (id_bits + guid_bits + 16);
        }
        for p in &property_types {
            total_bits += id_bits + (id_bits + guid_bits + 16) + p.properties.len() * guid_bits;
        }
        for _ in &bound {
            total_bits += id_bits + (BoundObjectIdentifier::BITS as usize + guid_bits);
        }
        total_bits += id_bits + (ClientIdentifier::BITS as usize + BoundObjectIdentifier::BITS as usize + 64);

        let message_count = functions.len() + property_types.len() + bound.len() + 1;

        let mut buffer = MessageBuffer::with_bit_count(total_bits);
        {
            let mut writer = buffer.writer();
            let _ = DefaultMessageType::BatchMessages.identifier().pack(&mut writer);
            let _ = (BatchMessagesHeader {
                message_count: message_count as u16,
            })
            .pack(&mut writer);

            for (id, registration) in &functions {
                let _ = DefaultMessageType::RegisterNewMessageType.identifier().pack(&mut writer);
                let _ = (RegisterNewMessageType {
                    message_type: *id,
                    function_guid: registration.message_type.function_guid,
                    fixed_compressed_data_size_bits: registration.message_type.fixed_compressed_bits as u16,
                })
                .pack(&mut writer);
            }

            for p in &property_types {
                let _ = DefaultMessageType::RegisterPropertyStreamMessage.identifier().pack(&mut writer);
                let _ = (RegisterPropertyStreamMessageHeader {
                    message_type: p.identifier,
                    type_guid: p.type_guid,
                    property_count: p.properties.len() as u16,
                })
                .pack(&mut writer);
                for prop in &p.properties {
                    let _ = prop.guid.pack(&mut writer);
                }
            }

            for (id, guid) in &bound {
                let _ = DefaultMessageType::ObjectBound.identifier().pack(&mut writer);
                let _ = (ObjectBound {
                    bound_object: *id,
                    persistent_guid: *guid,
                })
                .pack(&mut writer);
            }

            let _ = DefaultMessageType::LocalPeerConnected.identifier().pack(&mut writer);
            let _ = (LocalPeerConnected {
                client_identifier,
                client_bound_object: self_bound_object,
                host_timestamp: host_sent_timestamp,
            })
            .pack(&mut writer);
        }

        buffer.as_bytes().to_vec()
    }

    fn handle_disconnect(&self, remote: RemotePeerId) {
        if let Some(client) = self.remote_to_client.write().remove(&remote) {
            self.clients.write().remove(&client);
            if let Some(cb) = self.on_client_disconnected.lock().as_mut() {
                cb(client);
            }
        }
    }

    fn handle_receive(&self, remote: RemotePeerId, channel: u8, bytes: &[u8]) {
        let Some(client) = self.client_for(remote) else {
            warn!("received datagram from unconnected remote {remote:?}");
            return;
        };

        let mut reader = BitReader::new(bytes);
        if let Err(rejection) = self.dispatch_top_level(client, remote, channel, &mut reader) {
            error!("rejected datagram from client {client:?}: {rejection}");
        }
    }

    fn dispatch_top_level(
        &self,
        client: ClientIdentifier,
        remote: RemotePeerId,
        channel: u8,
        reader: &mut BitReader,
    ) -> Result<(), Rejection> {
        let identifier = MessageTypeIdentifier::unpack(reader, 0).map_err(|_| Rejection::MalformedArguments)?;

        if let Ok(default_type) = DefaultMessageType::try_from(identifier.slot().unwrap_or(u16::MAX as usize) as u16) {
            return self.dispatch_default(default_type, client, remote, channel, reader);
        }

        let registration = self.message_types.lookup(identifier).ok_or(Rejection::UnknownMessageType)?;

        if registration.message_type.kind == codec::message_type::MessageKind::StreamedProperty {
            return self.receive_property_stream(client, identifier, reader);
        }

        if !registration.message_type.flags.contains(MessageFlags::CLIENT_TO_HOST) {
            return Err(Rejection::DirectionMismatch);
        }

        let ctx = DispatchContext {
            remote,
            channel,
            sender_client: Some(client),
        };

        match &registration.handler {
            Handler::Plain(handler) => handler(&ctx, reader),
            Handler::Object(handler) => {
                let obj = BoundObjectIdentifier::unpack(reader, 0).map_err(|_| Rejection::MalformedArguments)?;
                if !self.bound_objects.contains(obj) {
                    return Err(Rejection::UnknownBoundObject);
                }
                if !crate::authority::host_can_handle(&self.bound_objects, obj, client, registration.message_type.flags) {
                    return Err(Rejection::AuthorityDenied);
                }
                let owner = self.bound_objects.resolve(obj).ok_or(Rejection::UnknownBoundObject)?;
                handler(&ctx, &owner, reader)
            }
        }
    }

    fn dispatch_default(
        &self,
        default_type: DefaultMessageType,
        client: ClientIdentifier,
        remote: RemotePeerId,
        channel: u8,
        reader: &mut BitReader,
    ) -> Result<(), Rejection> {
        match default_type {
            DefaultMessageType::BatchMessages => {
                let header = BatchMessagesHeader::unpack(reader).map_err(|_| Rejection::MalformedArguments)?;
                for _ in 0..header.message_count {
                    self.dispatch_top_level(client, remote, channel, reader)?;
                }
                Ok(())
            }
            DefaultMessageType::ConfirmPropagatedPropertyReceipt => {
                let msg = ConfirmPropagatedPropertyReceipt::unpack(reader).map_err(|_| Rejection::MalformedArguments)?;
                if let Some(c) = self.clients.read().get(&client) {
                    c.propagated.process_confirmation(msg.message_type, msg.sequence_number);
                }
                Ok(())
            }
            DefaultMessageType::RequestForwardMessageToOtherClients | DefaultMessageType::RequestForwardMessageToAllRemotes => {
                self.handle_forward_request(default_type, client, channel, reader)
            }
            DefaultMessageType::RequestTimeSync => {
                let msg = codec::message_type::RequestTimeSync::unpack(reader).map_err(|_| Rejection::MalformedArguments)?;
                self.handle_time_sync(client, msg);
                Ok(())
            }
            // The remaining reserved types are host→client only and should
            // never arrive from a client.
            _ => Err(Rejection::DirectionMismatch),
        }
    }

    fn handle_forward_request(
        &self,
        request: DefaultMessageType,
        sender: ClientIdentifier,
        channel: u8,
        reader: &mut BitReader,
    ) -> Result<(), Rejection> {
        let remaining_bits = reader.remaining_bits();
        let mut inner = vec![0u8; remaining_bits.div_ceil(8)];
        {
            let mut writer = BitWriter::new(&mut inner);
            for _ in 0..remaining_bits {
                let bit = reader.read_bits(1).map_err(|_| Rejection::MalformedArguments)?;
                let _ = writer.write_bits(bit, 1);
            }
        }

        forwarding::revalidate_inner_message(&self.message_types, &self.bound_objects, sender, channel, &inner)?;

        let scope = match request {
            DefaultMessageType::RequestForwardMessageToOtherClients => ForwardScope::OtherClients,
            _ => ForwardScope::AllRemotes,
        };

        let wrapped = forwarding::wrap_forwarded(&inner);
        let targets: Vec<RemotePeerId> = {
            let clients = self.clients.read();
            forwarding::targets(clients.keys().copied(), sender)
                .filter_map(|c| clients.get(&c).map(|s| s.remote))
                .collect()
        };

        {
            let mut transport = self.transport.lock();
            for target in targets {
                transport.send(target, channel, ChannelFlags::Reliable, &wrapped);
            }
        }

        if scope == ForwardScope::AllRemotes {
            let mut local_reader = BitReader::new(&inner);
            self.dispatch_top_level(sender, RemotePeerId(0), channel, &mut local_reader)?;
        }

        Ok(())
    }

    /// Decodes an inbound property-stream delta: the sequence number,
    /// then per object its dirty mask and each flagged property's payload,
    /// applied straight into the owner handle the properties were bound
    /// against. Acknowledges on success so the sender's `SendWindow` can
    /// retire the sequence.
    ///
    /// Property-stream messages don't go through the `CLIENT_TO_HOST`/
    /// `HOST_TO_CLIENT` direction gate that guards ordinary registered
    /// functions: a stream's direction is whichever side calls
    /// `invalidate_properties*`, not a flag on the registration.
    fn receive_property_stream(
        &self,
        client: ClientIdentifier,
        identifier: MessageTypeIdentifier,
        reader: &mut BitReader,
    ) -> Result<(), Rejection> {
        let stream_type = self
            .property_types
            .read()
            .get(&identifier)
            .cloned()
            .ok_or(Rejection::UnknownMessageType)?;

        let seq = SequenceNumber::unpack(reader).map_err(|_| Rejection::MalformedArguments)?;
        let object_count = reader
            .read_bits(BoundObjectIdentifier::BITS)
            .map_err(|_| Rejection::MalformedArguments)?;
        if object_count == 0 {
            return Err(Rejection::EmptyPropertyStream);
        }

        for _ in 0..object_count {
            let obj = BoundObjectIdentifier::unpack(reader, 0).map_err(|_| Rejection::MalformedArguments)?;
            let mask = PropertyMask::unpack(reader, stream_type.property_count()).map_err(|_| Rejection::MalformedArguments)?;
            let owner = self.bound_objects.resolve(obj).ok_or(Rejection::UnknownBoundObject)?;

            let mut relay_mask = PropertyMask::EMPTY;
            for idx in mask.iter_set(stream_type.property_count()) {
                let prop = &stream_type.properties[idx.0 as usize];
                (prop.decode)(&owner, reader).map_err(|_| Rejection::MalformedArguments)?;
                if prop.flags.contains(MessageFlags::PROPAGATE_CLIENT_TO_CLIENT) {
                    relay_mask.set(idx);
                }
            }

            if !relay_mask.is_empty() {
                for (other_client, other) in self.clients.read().iter() {
                    if *other_client != client {
                        other.propagated.invalidate(identifier, obj, relay_mask);
                    }
                }
            }
        }

        self.send_property_confirmation(client, identifier, seq);
        Ok(())
    }

    fn send_property_confirmation(&self, client: ClientIdentifier, message_type: MessageTypeIdentifier, seq: SequenceNumber) {
        let Some(remote) = self.remote_for(client) else { return };
        let mut bytes = vec![0u8; 16];
        let written = {
            let mut writer = BitWriter::new(&mut bytes);
            let _ = DefaultMessageType::ConfirmPropagatedPropertyReceipt.identifier().pack(&mut writer);
            let _ = (ConfirmPropagatedPropertyReceipt {
                sequence_number: seq,
                message_type,
            })
            .pack(&mut writer);
            writer.position()
        };
        bytes.truncate(written.div_ceil(8));
        // §4.6: acknowledgements ride the same unreliable channel as the
        // stream they confirm, not the reliable control channel — a lost ack
        // just means the sender's SendWindow resends the same dirty mask.
        self.transport
            .lock()
            .send(remote, CHANNEL_PROPERTIES, ChannelFlags::UnreliableUnsequenced, &bytes);
    }

    fn handle_time_sync(&self, client: ClientIdentifier, msg: codec::message_type::RequestTimeSync) {
        let host_received = now_nanos();
        let stamps = RoundTripTimestamps {
            host_sent: msg.host_timestamp,
            client_received: msg.client_received_timestamp,
            client_sent: msg.client_sent_timestamp,
            host_received,
        };

        let client_to_host = stamps.client_to_host_offset_nanos();

        // `ConvertClientTimestampToLocal(c, ts) = ts + m_clientTimeOffsetNanoseconds[c]`:
        // the offset stored here is exactly the client->host offset computed
        // above (and mirrors the value sent back to the client below), not
        // its negation — `client_to_host_offset_nanos` is already the
        // amount to add to a client timestamp to land in host-local time.
        if let Some(entry) = self.clients.write().get_mut(&client) {
            entry.clock_offset = ClockOffset::from_nanos(client_to_host);
        }

        let Some(remote) = self.remote_for(client) else { return };
        // Identifier (12 bits) + the i64 offset (64 bits): a flat 8-byte
        // buffer is one byte short and silently truncates the response to
        // just the identifier (`write_bits` fails without advancing `pos`,
        // so the dropped result below used to hide it).
        let total_bits = MessageTypeIdentifier::BITS as usize + 64;
        let mut bytes = vec![0u8; total_bits.div_ceil(8)];
        let written = {
            let mut writer = BitWriter::new(&mut bytes);
            let mut ok = true;
            ok &= DefaultMessageType::ReceivedTimeSyncResponse.identifier().pack(&mut writer).is_ok();
            ok &= (codec::message_type::ReceivedTimeSyncResponse {
                time_offset_nanoseconds: client_to_host,
            })
            .pack(&mut writer)
            .is_ok();
            if !ok {
                error!("failed to encode ReceivedTimeSyncResponse for client {client:?}");
                return;
            }
            writer.position()
        };
        bytes.truncate(written.div_ceil(8));
        self.transport.lock().send(remote, CHANNEL_CONTROL, ChannelFlags::Reliable, &bytes);
    }
}

fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
