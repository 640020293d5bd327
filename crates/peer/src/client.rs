//! `ClientPeer`: the non-authoritative side of a session. Learns its
//! entire message-type and property-stream table from the host's handshake
//! rather than assigning its own identifiers, and accepts any message the
//! host sends without an authority check.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashSet};
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use codec::bitview::{BitReader, BitWriter};
use codec::buffer::MessageBuffer;
use codec::identifiers::{BoundObjectIdentifier, ClientIdentifier, MessageTypeIdentifier};
use codec::message_type::{
    BatchMessagesHeader, BoundObjectAuthorityMessage, ConfirmPropagatedPropertyReceipt, DefaultMessageType,
    Guid, LocalPeerConnected, MessageFlags, MessageKind, MessageType, ObjectBound, ReceivedTimeSyncResponse,
    RegisterNewMessageType, RegisterPropertyStreamMessageHeader, RequestTimeSync,
};
use codec::property::PropertyMask;

use crate::dispatch::{DispatchContext, Handler};
use crate::error::{Rejection, SendError};
use crate::forwarding;
use crate::property_stream::{PerPeerPropagatedPropertyData, PropertyDescriptor, PropertyStreamType};
use crate::registry::{BoundObjectRegistry, MessageTypeRegistry, OwnerHandle, Registration};
use crate::time_sync::ClockOffset;
use crate::transport::{ChannelFlags, RemotePeerId, Transport, TransportEvent};

const CHANNEL_CONTROL: u8 = 0;
const CHANNEL_PROPERTIES: u8 = 1;

/// A function registration staged ahead of the handshake: the client knows
/// its own `flags`/`kind`/handler from the embedding application, but not
/// the `MessageTypeIdentifier` the host will assign until
/// `RegisterNewMessageType` names it.
struct PendingFunction {
    flags: MessageFlags,
    kind: MessageKind,
    fixed_compressed_bits: u32,
    handler: Handler,
}

/// Resolution state of a `BindObject` call keyed by persistent GUID: either
/// the host has already announced the identifier and we're waiting for the
/// application to call `bind_object`, or the application called first and
/// we're waiting on the host's `ObjectBound`.
enum BindingState {
    Known(BoundObjectIdentifier),
    Pending(OwnerHandle, Box<dyn FnMut(BoundObjectIdentifier) + Send>),
}

/// The non-authoritative side of a session.
pub struct ClientPeer<T: Transport> {
    transport: Mutex<T>,
    pub message_types: MessageTypeRegistry,
    property_types: RwLock<HashMap<MessageTypeIdentifier, Arc<PropertyStreamType>>>,
    pub bound_objects: BoundObjectRegistry,
    pending_functions: Mutex<HashMap<Guid, PendingFunction>>,
    pending_properties: Mutex<HashMap<Guid, HashMap<Guid, PropertyDescriptor>>>,
    bindings: Mutex<HashMap<Guid, BindingState>>,
    authority: RwLock<HashSet<BoundObjectIdentifier>>,
    propagated: Arc<PerPeerPropagatedPropertyData>,
    update_period: Duration,
    remote: Mutex<Option<RemotePeerId>>,
    identifier: Mutex<Option<ClientIdentifier>>,
    self_bound_object: Mutex<Option<BoundObjectIdentifier>>,
    host_clock_offset: Mutex<ClockOffset>,
    on_connected: Mutex<Option<Box<dyn FnMut(ClientIdentifier, BoundObjectIdentifier) + Send>>>,
    on_disconnected: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl<T: Transport> ClientPeer<T> {
    pub fn new(transport: T, update_period: Duration) -> Self {
        Self {
            transport: Mutex::new(transport),
            message_types: MessageTypeRegistry::new(),
            property_types: RwLock::new(HashMap::default()),
            bound_objects: BoundObjectRegistry::new(),
            pending_functions: Mutex::new(HashMap::default()),
            pending_properties: Mutex::new(HashMap::default()),
            bindings: Mutex::new(HashMap::default()),
            authority: RwLock::new(HashSet::default()),
            propagated: Arc::new(PerPeerPropagatedPropertyData::default()),
            update_period,
            remote: Mutex::new(None),
            identifier: Mutex::new(None),
            self_bound_object: Mutex::new(None),
            host_clock_offset: Mutex::new(ClockOffset::default()),
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
        }
    }

    pub fn on_connected(&self, f: impl FnMut(ClientIdentifier, BoundObjectIdentifier) + Send + 'static) {
        *self.on_connected.lock() = Some(Box::new(f));
    }

    pub fn on_disconnected(&self, f: impl FnMut() + Send + 'static) {
        *self.on_disconnected.lock() = Some(Box::new(f));
    }

    pub fn connect(&self, address: SocketAddrV4) -> bool {
        self.transport.lock().connect(address).is_some()
    }

    pub fn disconnect(&self) {
        if let Some(remote) = *self.remote.lock() {
            self.transport.lock().disconnect(remote);
        }
    }

    pub fn force_disconnect(&self) {
        self.reset_session_state();
    }

    /// Stages a locally-known function ahead of the handshake. The
    /// identifier is assigned by the host; until `RegisterNewMessageType`
    /// names this GUID, the registration doesn't exist in
    /// `message_types`.
    pub fn register_function(
        &self,
        function_guid: Guid,
        flags: MessageFlags,
        fixed_compressed_bits: u32,
        kind: MessageKind,
        handler: Handler,
    ) {
        self.pending_functions.lock().insert(
            function_guid,
            PendingFunction {
                flags,
                kind,
                fixed_compressed_bits,
                handler,
            },
        );
    }

    /// Stages a property-stream type's descriptors ahead of the handshake,
    /// keyed by each property's own GUID so they can be reordered to match
    /// whatever order the host announces them in.
    pub fn register_property_type(&self, type_guid: Guid, properties: Vec<PropertyDescriptor>) {
        let mut by_guid = HashMap::default();
        for property in properties {
            by_guid.insert(property.guid, property);
        }
        self.pending_properties.lock().insert(type_guid, by_guid);
    }

    /// `FindMessageIdentifier<Function>()`.
    pub fn find_message_identifier(&self, guid: Guid) -> Option<MessageTypeIdentifier> {
        self.message_types.identifier_for_guid(guid)
    }

    pub fn identifier(&self) -> Option<ClientIdentifier> {
        *self.identifier.lock()
    }

    pub fn self_bound_object(&self) -> Option<BoundObjectIdentifier> {
        *self.self_bound_object.lock()
    }

    pub fn has_authority_of_bound_object(&self, obj: BoundObjectIdentifier) -> bool {
        self.authority.read().contains(&obj)
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        let remote = (*self.remote.lock())?;
        self.transport.lock().round_trip_time(remote)
    }

    pub fn convert_host_timestamp_to_local(&self, host_timestamp_nanos: i64) -> i64 {
        self.host_clock_offset.lock().convert_to_local(host_timestamp_nanos)
    }

    pub fn convert_local_timestamp_to_host(&self, local_timestamp_nanos: i64) -> i64 {
        self.host_clock_offset.lock().convert_to_remote(local_timestamp_nanos)
    }

    /// `BindObject(persistentGuid, object, callback)`: resolves immediately
    /// if the host already announced this persistent GUID's identifier,
    /// otherwise stages the owner and callback for `ObjectBound` to
    /// resolve later.
    pub fn bind_object(
        &self,
        persistent_guid: Guid,
        owner: OwnerHandle,
        callback: impl FnMut(BoundObjectIdentifier) + Send + 'static,
    ) {
        let mut callback = callback;
        let mut bindings = self.bindings.lock();
        match bindings.remove(&persistent_guid) {
            Some(BindingState::Known(identifier)) => {
                drop(bindings);
                self.bound_objects.bind_at(identifier, persistent_guid, owner);
                callback(identifier);
            }
            _ => {
                bindings.insert(persistent_guid, BindingState::Pending(owner, Box::new(callback)));
            }
        }
    }

    pub fn invalidate_properties(
        &self,
        message_type: MessageTypeIdentifier,
        bound_object: BoundObjectIdentifier,
        mask: PropertyMask,
    ) {
        self.propagated.invalidate(message_type, bound_object, mask);
    }

    pub fn flush_properties(&self, message_type: MessageTypeIdentifier) {
        self.propagated.flush(message_type);
    }

    /// `SendMessageToHost<Function>(boundObject, channel, args...)`.
    pub fn send_message_to_host(
        &self,
        message_type: MessageTypeIdentifier,
        bound_object: Option<BoundObjectIdentifier>,
        channel: u8,
        channel_flags: ChannelFlags,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) -> Result<(), SendError> {
        let registration = self.message_types.lookup(message_type).ok_or(SendError::Unregistered)?;
        if !registration.message_type.flags.contains(MessageFlags::CLIENT_TO_HOST) {
            return Err(SendError::DirectionMismatch);
        }
        self.check_authority(&registration.message_type, bound_object)?;

        let remote = (*self.remote.lock()).ok_or(SendError::NotConnected)?;
        let bytes = self.encode(message_type, bound_object, bits, pack);

        if self.transport.lock().send(remote, channel, channel_flags, &bytes) {
            Ok(())
        } else {
            Err(SendError::TransportFailure)
        }
    }

    /// `SendMessageToRemoteClients<Function>(boundObject, channel, args...)`:
    /// wraps the message in `RequestForwardMessageToOtherClients` for the
    /// host to relay.
    pub fn send_message_to_remote_clients(
        &self,
        message_type: MessageTypeIdentifier,
        bound_object: Option<BoundObjectIdentifier>,
        channel: u8,
        channel_flags: ChannelFlags,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) -> Result<(), SendError> {
        self.send_forward(
            DefaultMessageType::RequestForwardMessageToOtherClients,
            message_type,
            bound_object,
            channel,
            channel_flags,
            bits,
            pack,
        )
    }

    /// `SendMessageToAllRemotes<Function>(boundObject, channel, args...)`:
    /// wraps the message in `RequestForwardMessageToAllRemotes`, which the
    /// host additionally dispatches to itself.
    pub fn send_message_to_all_remotes(
        &self,
        message_type: MessageTypeIdentifier,
        bound_object: Option<BoundObjectIdentifier>,
        channel: u8,
        channel_flags: ChannelFlags,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) -> Result<(), SendError> {
        self.send_forward(
            DefaultMessageType::RequestForwardMessageToAllRemotes,
            message_type,
            bound_object,
            channel,
            channel_flags,
            bits,
            pack,
        )
    }

    fn send_forward(
        &self,
        scope: DefaultMessageType,
        message_type: MessageTypeIdentifier,
        bound_object: Option<BoundObjectIdentifier>,
        channel: u8,
        channel_flags: ChannelFlags,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) -> Result<(), SendError> {
        let registration = self.message_types.lookup(message_type).ok_or(SendError::Unregistered)?;
        if !registration.message_type.flags.contains(MessageFlags::CLIENT_TO_CLIENT) {
            return Err(SendError::DirectionMismatch);
        }
        self.check_authority(&registration.message_type, bound_object)?;

        let remote = (*self.remote.lock()).ok_or(SendError::NotConnected)?;
        let inner = self.encode(message_type, bound_object, bits, pack);
        let wrapped = forwarding::wrap_with(scope, &inner);

        if self.transport.lock().send(remote, channel, channel_flags, &wrapped) {
            Ok(())
        } else {
            Err(SendError::TransportFailure)
        }
    }

    fn check_authority(&self, message_type: &MessageType, bound_object: Option<BoundObjectIdentifier>) -> Result<(), SendError> {
        let Some(obj) = bound_object else { return Ok(()) };
        if message_type.flags.contains(MessageFlags::ALLOW_WITHOUT_AUTHORITY) || self.has_authority_of_bound_object(obj) {
            Ok(())
        } else {
            Err(SendError::NoAuthority)
        }
    }

    fn encode(
        &self,
        message_type: MessageTypeIdentifier,
        bound_object: Option<BoundObjectIdentifier>,
        bits: usize,
        pack: impl FnOnce(&mut BitWriter),
    ) -> Vec<u8> {
        let mut total_bits = MessageTypeIdentifier::BITS as usize + bits;
        if bound_object.is_some() {
            total_bits += BoundObjectIdentifier::BITS as usize;
        }

        let mut buffer = MessageBuffer::with_bit_count(total_bits);
        let written = {
            let mut writer = buffer.writer();
            let _ = message_type.pack(&mut writer);
            if let Some(obj) = bound_object {
                let _ = obj.pack(&mut writer);
            }
            pack(&mut writer);
            writer.position()
        };
        let mut bytes = buffer.as_bytes().to_vec();
        bytes.truncate(written.div_ceil(8));
        bytes
    }

    /// Runs the two-phase tick: outbound property streaming toward the
    /// host, then inbound drain, mirroring [`crate::host::HostPeer::tick`].
    pub fn tick(&self) {
        self.send_due_properties();
        while self.service_one_event() {}
    }

    fn send_due_properties(&self) {
        let Some(remote) = *self.remote.lock() else { return };
        let now = Instant::now();
        for (message_type, seq, objects) in self.propagated.due_for_send(now, self.update_period) {
            if let Some(bytes) = self.encode_property_stream(message_type, seq, &objects) {
                self.transport
                    .lock()
                    .send(remote, CHANNEL_PROPERTIES, ChannelFlags::UnreliableUnsequenced, &bytes);
            }
        }
    }

    fn encode_property_stream(
        &self,
        message_type: MessageTypeIdentifier,
        seq: codec::identifiers::SequenceNumber,
        objects: &[(BoundObjectIdentifier, PropertyMask)],
    ) -> Option<Vec<u8>> {
        let stream_type = self.property_types.read().get(&message_type).cloned()?;

        let mut bytes = vec![0u8; 64];
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
                *self.remote.lock() = Some(remote);
                true
            }
            Some(TransportEvent::Receive(remote, channel, bytes)) => {
                self.handle_receive(remote, channel, &bytes);
                true
            }
            Some(TransportEvent::Disconnect(_)) => {
                self.reset_session_state();
                if let Some(cb) = self.on_disconnected.lock().as_mut() {
                    cb();
                }
                true
            }
            None => false,
        }
    }

    fn reset_session_state(&self) {
        self.message_types.reset();
        self.property_types.write().clear();
        self.bound_objects.clear();
        self.bindings.lock().clear();
        self.authority.write().clear();
        self.propagated.clear();
        *self.remote.lock() = None;
        *self.identifier.lock() = None;
        *self.self_bound_object.lock() = None;
        *self.host_clock_offset.lock() = ClockOffset::default();
    }

    fn handle_receive(&self, remote: RemotePeerId, channel: u8, bytes: &[u8]) {
        let mut reader = BitReader::new(bytes);
        if let Err(rejection) = self.dispatch_top_level(remote, channel, &mut reader) {
            error!("rejected datagram from host: {rejection}");
        }
    }

    fn dispatch_top_level(&self, remote: RemotePeerId, channel: u8, reader: &mut BitReader) -> Result<(), Rejection> {
        let identifier = MessageTypeIdentifier::unpack(reader, 0)?;

        if let Ok(default_type) = DefaultMessageType::try_from(identifier.slot().unwrap_or(u16::MAX as usize) as u16) {
            return self.dispatch_default(default_type, remote, channel, reader);
        }

        let registration = self.message_types.lookup(identifier).ok_or(Rejection::UnknownMessageType)?;

        if registration.message_type.kind == MessageKind::StreamedProperty {
            return self.receive_property_stream(identifier, reader);
        }

        if !registration.message_type.flags.contains(MessageFlags::HOST_TO_CLIENT) {
            return Err(Rejection::DirectionMismatch);
        }

        let ctx = DispatchContext {
            remote,
            channel,
            sender_client: None,
        };

        // No authority check here: every message from the host is accepted
        // (see `crate::authority::host_can_handle`'s doc comment).
        match &registration.handler {
            Handler::Plain(handler) => handler(&ctx, reader),
            Handler::Object(handler) => {
                let obj = BoundObjectIdentifier::unpack(reader, 0)?;
                let owner = self.bound_objects.resolve(obj).ok_or(Rejection::UnknownBoundObject)?;
                handler(&ctx, &owner, reader)
            }
        }
    }

    fn dispatch_default(
        &self,
        default_type: DefaultMessageType,
        remote: RemotePeerId,
        channel: u8,
        reader: &mut BitReader,
    ) -> Result<(), Rejection> {
        match default_type {
            DefaultMessageType::BatchMessages => {
                let header = BatchMessagesHeader::unpack(reader)?;
                for _ in 0..header.message_count {
                    self.dispatch_top_level(remote, channel, reader)?;
                }
                Ok(())
            }
            DefaultMessageType::RegisterNewMessageType => {
                let msg = RegisterNewMessageType::unpack(reader)?;
                self.apply_register_new_message_type(msg);
                Ok(())
            }
            DefaultMessageType::RegisterPropertyStreamMessage => {
                let header = RegisterPropertyStreamMessageHeader::unpack(reader)?;
                self.apply_register_property_stream(header, reader)
            }
            DefaultMessageType::ObjectBound => {
                let msg = ObjectBound::unpack(reader)?;
                self.apply_object_bound(msg);
                Ok(())
            }
            DefaultMessageType::LocalPeerConnected => {
                let msg = LocalPeerConnected::unpack(reader)?;
                self.apply_local_peer_connected(msg);
                Ok(())
            }
            DefaultMessageType::ConfirmPropagatedPropertyReceipt => {
                let msg = ConfirmPropagatedPropertyReceipt::unpack(reader)?;
                self.propagated.process_confirmation(msg.message_type, msg.sequence_number);
                Ok(())
            }
            DefaultMessageType::BoundObjectAuthorityGivenToLocalClient => {
                let msg = BoundObjectAuthorityMessage::unpack(reader)?;
                self.authority.write().insert(msg.bound_object);
                Ok(())
            }
            DefaultMessageType::BoundObjectAuthorityRevokedFromLocalClient => {
                let msg = BoundObjectAuthorityMessage::unpack(reader)?;
                self.authority.write().remove(&msg.bound_object);
                Ok(())
            }
            DefaultMessageType::ReceivedForwardedMessage => {
                let remaining_bits = reader.remaining_bits();
                let mut inner = vec![0u8; remaining_bits.div_ceil(8)];
                {
                    let mut writer = BitWriter::new(&mut inner);
                    for _ in 0..remaining_bits {
                        let bit = reader.read_bits(1)?;
                        writer.write_bits(bit, 1)?;
                    }
                }
                let mut local_reader = BitReader::new(&inner);
                self.dispatch_top_level(remote, channel, &mut local_reader)
            }
            DefaultMessageType::ReceivedTimeSyncResponse => {
                let msg = ReceivedTimeSyncResponse::unpack(reader)?;
                *self.host_clock_offset.lock() = ClockOffset::from_nanos(-msg.time_offset_nanoseconds);
                Ok(())
            }
            // Client→host-only reserved types should never arrive here.
            DefaultMessageType::RequestForwardMessageToOtherClients
            | DefaultMessageType::RequestForwardMessageToAllRemotes
            | DefaultMessageType::RequestTimeSync => Err(Rejection::DirectionMismatch),
        }
    }

    /// Decodes an inbound property-stream delta and acknowledges it, mirroring
    /// [`crate::host::HostPeer::receive_property_stream`]. Not gated by the
    /// `HOST_TO_CLIENT` direction flag — see that method's doc comment.
    fn receive_property_stream(&self, identifier: MessageTypeIdentifier, reader: &mut BitReader) -> Result<(), Rejection> {
        let stream_type = self
            .property_types
            .read()
            .get(&identifier)
            .cloned()
            .ok_or(Rejection::UnknownMessageType)?;

        let seq = codec::identifiers::SequenceNumber::unpack(reader).map_err(|_| Rejection::MalformedArguments)?;
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

            for idx in mask.iter_set(stream_type.property_count()) {
                let prop = &stream_type.properties[idx.0 as usize];
                (prop.decode)(&owner, reader).map_err(|_| Rejection::MalformedArguments)?;
            }
        }

        self.send_property_confirmation(identifier, seq);
        Ok(())
    }

    fn send_property_confirmation(&self, message_type: MessageTypeIdentifier, seq: codec::identifiers::SequenceNumber) {
        let Some(remote) = *self.remote.lock() else { return };
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

    fn apply_register_new_message_type(&self, msg: RegisterNewMessageType) {
        let Some(pending) = self.pending_functions.lock().remove(&msg.function_guid) else {
            warn!("host registered unknown function {:?}", msg.function_guid);
            return;
        };

        if pending.fixed_compressed_bits != msg.fixed_compressed_data_size_bits as u32 {
            warn!(
                "locally registered fixed size for {:?} ({} bits) disagrees with the host's ({} bits)",
                msg.function_guid, pending.fixed_compressed_bits, msg.fixed_compressed_data_size_bits
            );
        }

        self.message_types.register_at(
            msg.message_type,
            msg.function_guid,
            Registration {
                message_type: MessageType {
                    identifier: msg.message_type,
                    function_guid: msg.function_guid,
                    kind: pending.kind,
                    flags: pending.flags,
                    fixed_compressed_bits: msg.fixed_compressed_data_size_bits as u32,
                },
                handler: pending.handler,
            },
        );
    }

    fn apply_register_property_stream(
        &self,
        header: RegisterPropertyStreamMessageHeader,
        reader: &mut BitReader,
    ) -> Result<(), Rejection> {
        let mut guids = Vec::with_capacity(header.property_count as usize);
        for _ in 0..header.property_count {
            guids.push(Guid::unpack(reader)?);
        }

        let mut pending = self
            .pending_properties
            .lock()
            .remove(&header.type_guid)
            .unwrap_or_default();

        let mut properties = Vec::with_capacity(guids.len());
        for guid in &guids {
            match pending.remove(guid) {
                Some(descriptor) => properties.push(descriptor),
                None => warn!("host announced unknown property {guid:?} for type {:?}", header.type_guid),
            }
        }

        self.message_types.register_at(
            header.message_type,
            header.type_guid,
            Registration {
                message_type: MessageType {
                    identifier: header.message_type,
                    function_guid: header.type_guid,
                    kind: MessageKind::StreamedProperty,
                    flags: MessageFlags::default(),
                    fixed_compressed_bits: 0,
                },
                handler: Handler::Plain(Box::new(|_, _| Ok(()))),
            },
        );

        self.property_types.write().insert(
            header.message_type,
            Arc::new(PropertyStreamType {
                identifier: header.message_type,
                type_guid: header.type_guid,
                properties,
            }),
        );

        Ok(())
    }

    fn apply_object_bound(&self, msg: ObjectBound) {
        let mut bindings = self.bindings.lock();
        match bindings.remove(&msg.persistent_guid) {
            Some(BindingState::Pending(owner, mut callback)) => {
                drop(bindings);
                self.bound_objects.bind_at(msg.bound_object, msg.persistent_guid, owner);
                callback(msg.bound_object);
            }
            _ => {
                bindings.insert(msg.persistent_guid, BindingState::Known(msg.bound_object));
            }
        }
    }

    fn apply_local_peer_connected(&self, msg: LocalPeerConnected) {
        let client_received = now_nanos();
        *self.identifier.lock() = Some(msg.client_identifier);
        *self.self_bound_object.lock() = Some(msg.client_bound_object);

        if let Some(cb) = self.on_connected.lock().as_mut() {
            cb(msg.client_identifier, msg.client_bound_object);
        }

        let client_sent = now_nanos();
        let request = RequestTimeSync {
            host_timestamp: msg.host_timestamp,
            client_received_timestamp: client_received,
            client_sent_timestamp: client_sent,
        };

        let Some(remote) = *self.remote.lock() else { return };
        let mut bytes = vec![0u8; 32];
        let written = {
            let mut writer = BitWriter::new(&mut bytes);
            let _ = DefaultMessageType::RequestTimeSync.identifier().pack(&mut writer);
            let _ = request.pack(&mut writer);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostPeer;
    use crate::transport::LoopbackTransport;

    fn pair() -> (HostPeer<LoopbackTransport>, ClientPeer<LoopbackTransport>) {
        let (host_t, client_t) = LoopbackTransport::pair();
        (
            HostPeer::new(host_t, Duration::from_millis(16)),
            ClientPeer::new(client_t, Duration::from_millis(16)),
        )
    }

    #[test]
    fn handshake_assigns_a_client_identifier_and_completes_time_sync() {
        let (host, client) = pair();
        host.tick();
        client.tick();
        host.tick();
        client.tick();

        assert!(client.identifier().is_some());
        assert!(client.self_bound_object().is_some());
    }

    #[test]
    fn a_registered_function_resolves_to_the_same_identifier_on_both_sides() {
        let (host, client) = pair();
        let guid = Guid(7);

        client.register_function(guid, MessageFlags::CLIENT_TO_HOST, 0, MessageKind::Plain, Handler::Plain(Box::new(|_, _| Ok(()))));
        let host_id = host.register_function(
            guid,
            MessageFlags::CLIENT_TO_HOST,
            0,
            MessageKind::Plain,
            Handler::Plain(Box::new(|_, _| Ok(()))),
        );

        host.tick();
        client.tick();

        assert_eq!(client.find_message_identifier(guid), Some(host_id));
    }

    #[test]
    fn object_bound_known_before_bind_object_resolves_synchronously() {
        let (host, client) = pair();
        host.tick();
        client.tick();

        let guid = Guid(99);
        let id = host.bind_object(guid, Arc::new(()));
        host.tick();
        client.tick();

        let resolved = Arc::new(Mutex::new(None));
        let resolved_inner = resolved.clone();
        client.bind_object(guid, Arc::new(()), move |bound_id| {
            *resolved_inner.lock() = Some(bound_id);
        });

        assert_eq!(*resolved.lock(), Some(id));
        assert!(client.bound_objects.contains(id));
    }

    #[test]
    fn sending_an_object_targeted_message_without_authority_is_refused() {
        let (host, client) = pair();
        host.tick();
        client.tick();

        let guid = Guid(5);
        client.register_function(
            guid,
            MessageFlags::CLIENT_TO_CLIENT,
            0,
            MessageKind::Object,
            Handler::Object(Box::new(|_, _, _| Ok(()))),
        );
        host.register_function(
            guid,
            MessageFlags::CLIENT_TO_CLIENT,
            0,
            MessageKind::Object,
            Handler::Object(Box::new(|_, _, _| Ok(()))),
        );
        host.tick();
        client.tick();

        let obj = host.bind_object(Guid(123), Arc::new(()));
        host.tick();
        client.tick();

        let identifier = client.find_message_identifier(guid).unwrap();
        let result = client.send_message_to_remote_clients(identifier, Some(obj), 2, ChannelFlags::Reliable, 0, |_| {});
        assert_eq!(result, Err(SendError::NoAuthority));
    }
}
