//! The host side of the HCI (host controller interface)
//!
//! This module contains the two flow controlled channels between the host and
//! the Bluetooth controller as described in the Bluetooth Specification
//! (v5 | Vol 2, Part E). The [`CommandChannel`] sends commands and matches the
//! returned events to them, the [`AclDataChannel`] moves ACL data packets in
//! both directions, and [`Transport`] ties the two together by routing the
//! inbound event stream.
//!
//! Nothing in here talks to hardware. The transport driver is abstracted as
//! the pair of interface traits [`HciCommandInterface`] and
//! [`HciAclDataInterface`], and inbound bytes are pushed into the stack with
//! [`Transport::on_event`] and [`Transport::on_acl_data`].
//!
//! [`CommandChannel`]: command_channel/struct.CommandChannel.html
//! [`AclDataChannel`]: acl_data_channel/struct.AclDataChannel.html
//! [`Transport`]: struct.Transport.html
//! [`HciCommandInterface`]: trait.HciCommandInterface.html
//! [`HciAclDataInterface`]: trait.HciAclDataInterface.html
//! [`Transport::on_event`]: struct.Transport.html#method.on_event
//! [`Transport::on_acl_data`]: struct.Transport.html#method.on_acl_data

pub mod opcodes;
pub mod common;
pub mod error;
pub mod events;
pub mod cb;
pub mod link_control;
pub mod info_params;
pub mod le;
pub mod command_channel;
pub mod command_runner;
pub mod acl_data_channel;

use core::fmt::Debug;
use core::fmt::Display;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use self::acl_data_channel::AclDataChannel;
use self::command_channel::CommandChannel;

/// Interface to the command pipe of the controller
///
/// This is implemented by the transport driver. `send_command` is called with
/// a complete HCI command packet (opcode, parameter length, parameters) and
/// must either hand it to the controller or fail. The core never retries a
/// failed send, a failure is reported through the transport error callback
/// and the command's credit stays consumed.
pub trait HciCommandInterface {
    type Error: Debug + Display;

    fn send_command(&mut self, packet: &[u8]) -> Result<(), Self::Error>;
}

/// Interface to the ACL data pipe of the controller
///
/// This is the trait that must be implemented by the platform specific HCI
/// transport. `send_acl_data` is called with a complete HCI ACL data packet
/// (handle and flags, data length, data).
pub trait HciAclDataInterface {
    type Error: Debug + Display;

    fn send_acl_data(&mut self, packet: &[u8]) -> Result<(), Self::Error>;
}

/// An HCI command packet ready to be sent
///
/// The packet is framed lazily, the opcode is kept alongside the parameter
/// bytes because the command channel keys its bookkeeping by opcode.
#[derive(Debug,Clone)]
pub struct CommandPacket {
    opcode: u16,
    parameters: Box<[u8]>,
}

impl CommandPacket {
    /// The largest parameter payload a command packet can carry
    pub const MAX_PARAMETER_SIZE: usize = 255;

    pub fn new(opcode: u16, parameters: &[u8]) -> Self {
        CommandPacket {
            opcode,
            parameters: Box::from(parameters),
        }
    }

    pub fn get_opcode(&self) -> u16 {
        self.opcode
    }

    pub fn get_parameters(&self) -> &[u8] {
        &self.parameters
    }

    /// Check that the parameters fit the one byte length field
    pub fn is_valid(&self) -> bool {
        self.parameters.len() <= Self::MAX_PARAMETER_SIZE
    }

    /// Convert into the bytes sent over the command pipe
    pub fn into_packet(&self) -> Box<[u8]> {
        let mut v = Vec::with_capacity( self.parameters.len() + 3 );

        v.extend_from_slice( &self.opcode.to_le_bytes() );

        v.push( self.parameters.len() as u8 );

        v.extend_from_slice( &self.parameters );

        v.into_boxed_slice()
    }
}

/// Used to get the information required for sending a command from the host to the controller
pub trait CommandParameter {
    /// The command to send to the Bluetooth Controller.
    ///
    /// This is the OGF & OCF pair.
    const COMMAND: opcodes::HCICommand;

    /// The parameter bytes of the command, little endian encoded
    fn get_parameter(&self) -> Vec<u8>;

    /// Get the command packet to be sent to the controller
    fn as_command_packet(&self) -> CommandPacket {
        CommandPacket::new(
            Self::COMMAND.as_opcode_pair().as_opcode(),
            &self.get_parameter(),
        )
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum AclPacketBoundary {
    FirstNonFlushable,
    ContinuingFragment,
    FirstAutoFlushable,
    CompleteL2capPdu,
}

impl AclPacketBoundary {
    /// Get the value shifted into the correct place of the Packet Boundary Flag in the HCI ACL
    /// data packet. The returned value is in host byte order.
    fn get_shifted_val(&self) -> u16 {
        ( match self {
            AclPacketBoundary::FirstNonFlushable => 0x0,
            AclPacketBoundary::ContinuingFragment => 0x1,
            AclPacketBoundary::FirstAutoFlushable => 0x2,
            AclPacketBoundary::CompleteL2capPdu => 0x3,
        } ) << 12
    }

    /// Get the `AclPacketBoundary` from the first 16 bits of a HCI ACL data packet.
    fn from_shifted_val(val: u16) -> Self {
        match (val >> 12) & 3 {
            0x0 => AclPacketBoundary::FirstNonFlushable,
            0x1 => AclPacketBoundary::ContinuingFragment,
            0x2 => AclPacketBoundary::FirstAutoFlushable,
            0x3 => AclPacketBoundary::CompleteL2capPdu,
            _ => unreachable!(),
        }
    }

    /// Check if this boundary flag starts a new L2CAP PDU
    pub fn is_start(&self) -> bool {
        match *self {
            AclPacketBoundary::FirstNonFlushable |
            AclPacketBoundary::FirstAutoFlushable |
            AclPacketBoundary::CompleteL2capPdu => true,
            AclPacketBoundary::ContinuingFragment => false,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum AclBroadcastFlag {
    /// Point-to-point message
    NoBroadcast,
    /// Broadcast to all active peripherals
    ActiveBroadcast,
}

impl AclBroadcastFlag {
    /// Get the value shifted into the correct place of the Broadcast Flag in the HCI ACL
    /// data packet. The returned value is in host byte order.
    fn get_shifted_val(&self) -> u16 {
        ( match self {
            AclBroadcastFlag::NoBroadcast => 0x0,
            AclBroadcastFlag::ActiveBroadcast => 0x1,
        } ) << 14
    }

    fn try_from_shifted_val(val: u16) -> Result<Self, ()> {
        match (val >> 14) & 3 {
            0x0 => Ok(AclBroadcastFlag::NoBroadcast),
            0x1 => Ok(AclBroadcastFlag::ActiveBroadcast),
            _ => Err( () ),
        }
    }
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub enum HciAclPacketError {
    PacketTooSmall,
    PayloadLengthIncorrect,
    InvalidBroadcastFlag,
    InvalidConnectionHandle( &'static str ),
}

impl Display for HciAclPacketError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            HciAclPacketError::PacketTooSmall =>
                write!(f, "Packet is too small to be a valid HCI ACL data packet"),
            HciAclPacketError::PayloadLengthIncorrect =>
                write!(f, "Specified payload length didn't match the actual payload length"),
            HciAclPacketError::InvalidBroadcastFlag =>
                write!(f, "Packet has invalid broadcast flag"),
            HciAclPacketError::InvalidConnectionHandle(reason) =>
                write!(f, "Invalid connection handle, {}", reason),
        }
    }
}

impl std::error::Error for HciAclPacketError {}

/// A single HCI ACL data packet
///
/// One of these is a fragment on the wire. The payload is at most the
/// controller's reported maximum data length, larger L2CAP PDUs span several
/// packets chained by the packet boundary flag.
#[derive(Debug,Clone)]
pub struct HciAclData {
    connection_handle: common::ConnectionHandle,
    packet_boundary_flag: AclPacketBoundary,
    broadcast_flag: AclBroadcastFlag,
    payload: Box<[u8]>,
}

impl HciAclData {
    pub fn new(
        connection_handle: common::ConnectionHandle,
        packet_boundary_flag: AclPacketBoundary,
        broadcast_flag: AclBroadcastFlag,
        payload: Box<[u8]>,
    ) -> Self
    {
        HciAclData { connection_handle, packet_boundary_flag, broadcast_flag, payload }
    }

    pub fn get_handle(&self) -> common::ConnectionHandle {
        self.connection_handle
    }

    pub fn get_payload(&self) -> &[u8] { &self.payload }

    pub fn get_packet_boundary_flag(&self) -> AclPacketBoundary { self.packet_boundary_flag }

    pub fn get_broadcast_flag(&self) -> AclBroadcastFlag { self.broadcast_flag }

    /// Convert the HciAclData into a raw packet
    ///
    /// This will convert HciAclData into a packet that can be sent between the
    /// host and controller.
    pub fn into_packet(&self) -> Box<[u8]> {
        let mut v = Vec::with_capacity( self.payload.len() + 4 );

        let first_2_bytes = self.connection_handle.get_raw_handle()
            | self.packet_boundary_flag.get_shifted_val()
            | self.broadcast_flag.get_shifted_val();

        v.extend_from_slice( &first_2_bytes.to_le_bytes() );

        v.extend_from_slice( &(self.payload.len() as u16).to_le_bytes() );

        v.extend_from_slice( &self.payload );

        v.into_boxed_slice()
    }

    /// Attempt to create a `HciAclData` from a raw packet
    ///
    /// A `HciAclData` is created if the packet is in the correct HCI ACL data
    /// packet format. If not, then an error is returned.
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, HciAclPacketError> {
        if packet.len() < 4 {
            return Err( HciAclPacketError::PacketTooSmall );
        }

        let first_2_bytes = u16::from_le_bytes( [ packet[0], packet[1] ] );

        let connection_handle = common::ConnectionHandle::try_from( first_2_bytes & 0xFFF )
            .map_err( HciAclPacketError::InvalidConnectionHandle )?;

        let packet_boundary_flag = AclPacketBoundary::from_shifted_val( first_2_bytes );

        let broadcast_flag = AclBroadcastFlag::try_from_shifted_val( first_2_bytes )
            .or( Err(HciAclPacketError::InvalidBroadcastFlag) )?;

        let length = u16::from_le_bytes( [ packet[2], packet[3] ] ) as usize;

        if packet[4..].len() != length {
            return Err( HciAclPacketError::PayloadLengthIncorrect );
        }

        Ok(
            HciAclData {
                connection_handle,
                packet_boundary_flag,
                broadcast_flag,
                payload: Box::from( &packet[4..] ),
            }
        )
    }
}

/// The HCI transport layer
///
/// Owns the command channel and the ACL data channel and routes the inbound
/// event stream between them. Number of Completed Packets events are consumed
/// here to credit the ACL flow controller, everything else goes to the
/// command channel for transaction matching and handler dispatch.
pub struct Transport<C,A>
where C: HciCommandInterface,
      A: HciAclDataInterface,
{
    command_channel: CommandChannel<C>,
    acl_data_channel: AclDataChannel<A>,
}

impl<C,A> Transport<C,A>
where C: HciCommandInterface + 'static,
      A: HciAclDataInterface + 'static,
{
    pub fn new(command_interface: C, acl_data_interface: A) -> Self {
        Transport {
            command_channel: CommandChannel::new(command_interface),
            acl_data_channel: AclDataChannel::new(acl_data_interface),
        }
    }

    /// Get a handle to the command and event flow control channel
    pub fn get_command_channel(&self) -> CommandChannel<C> {
        self.command_channel.clone()
    }

    /// Get a handle to the ACL data flow control channel
    pub fn get_acl_data_channel(&self) -> AclDataChannel<A> {
        self.acl_data_channel.clone()
    }

    /// Process an event packet received from the controller
    ///
    /// `packet` is the raw event, starting at the event code byte.
    pub fn on_event(&self, packet: &[u8]) {
        let event = match events::EventPacket::try_from_packet(packet) {
            Ok(event) => event,
            Err(e) => {
                log::error!("Dropping malformed HCI event: {}", e);
                return
            },
        };

        if event.get_event_code() == events::Events::NumberOfCompletedPackets.to_val() {
            match events::NumberOfCompletedPacketsData::try_from_raw_slice(event.get_parameters()) {
                Ok(completed) => self.acl_data_channel.handle_completed_packets(&completed),
                Err(e) => log::error!("Dropping malformed Number of Completed Packets event: {}", e),
            }
        } else {
            self.command_channel.receive_event(event);
        }
    }

    /// Process an ACL data packet received from the controller
    ///
    /// `packet` is the raw ACL data packet, starting at the handle field.
    pub fn on_acl_data(&self, packet: &[u8]) {
        match HciAclData::try_from_packet(packet) {
            Ok(data) => self.acl_data_channel.receive_packet(data),
            Err(e) => log::error!("Dropping malformed HCI ACL data packet: {}", e),
        }
    }

    /// Set the callback invoked when either channel fails to write to its interface
    ///
    /// When this fires the transport is in an unusable state and the whole
    /// core should be torn down by the embedder.
    pub fn set_closed_callback(&self, callback: Box<dyn FnMut()>) {
        let shared = Rc::new(RefCell::new(callback));

        let cloned = shared.clone();

        self.command_channel.set_transport_error_callback(
            Box::new( move || (cloned.borrow_mut())() )
        );

        self.acl_data_channel.set_transport_error_callback(
            Box::new( move || (shared.borrow_mut())() )
        );
    }

    /// The next instant a timeout of the command channel is due
    pub fn next_timeout(&self) -> Option<Instant> {
        self.command_channel.next_timeout()
    }

    /// Fire every command timeout that is due at `now`
    pub fn run_timers(&self, now: Instant) {
        self.command_channel.run_timers(now);
    }
}
