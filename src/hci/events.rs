//! Events sent from the controller
//!
//! The core recognizes a small set of events on its own. Command Complete and
//! Command Status feed the command pipeline, Number of Completed Packets feeds
//! ACL flow control, and LE Meta events are further dispatched by their
//! subevent code. Every other event is carried as a raw [`EventPacket`] and is
//! only meaningful to registered event handlers.

use crate::hci::common::ConnectionHandle;
use crate::hci::error::Error;

macro_rules! make_u16 {
    ( $packet:ident, $start:expr ) => {
        u16::from_le_bytes( [ $packet[$start], $packet[$start + 1] ] )
    };
}

/// "chews-off" and returns the first byte of $packet
macro_rules! chew {
    ( $packet:ident ) => {
        {
            let chewed_byte = $packet[0];
            $packet = &$packet[1..];
            chewed_byte
        }
    };
}

macro_rules! chew_u16 {
    ($packet:ident) => {
        {
            let chewed = make_u16!($packet, 0);
            $packet = &$packet[2..];
            chewed
        }
    };
}

macro_rules! chew_handle {
    ($packet:ident) => {
        {
            let raw = chew_u16!($packet);

            ConnectionHandle::try_from(raw & 0xFFF).map_err(|e| e.to_string())?
        }
    };
}

/// Create a TryFrom<&[u8]> implementation for $name
///
/// The parameter name for the try_from method is "raw" and its type is &[u8].
/// $inner is the contents of the try_from method.
macro_rules! impl_try_from_for_raw_packet {
    ( $name:ty, $param:tt, $inner:block ) => {

        #[allow(unused_assignments)]
        #[allow(unused_mut)]
        impl<'a> core::convert::TryFrom<&'a [u8]> for $name {
            type Error = String;
            fn try_from( param: &'a [u8] ) -> Result<Self, Self::Error> {
                let mut $param = param;
                $inner
            }
        }

    }
}

/// The events recognized by the core
///
/// Everything not listed here is only ever handled by registered event
/// handlers.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum Events {
    DisconnectionComplete,
    CommandComplete,
    CommandStatus,
    NumberOfCompletedPackets,
    LEMeta,
}

impl Events {
    pub fn to_val(&self) -> u8 {
        match *self {
            Events::DisconnectionComplete => 0x05,
            Events::CommandComplete => 0x0E,
            Events::CommandStatus => 0x0F,
            Events::NumberOfCompletedPackets => 0x13,
            Events::LEMeta => 0x3E,
        }
    }

    pub fn try_from_raw(raw: u8) -> Option<Events> {
        match raw {
            0x05 => Some(Events::DisconnectionComplete),
            0x0E => Some(Events::CommandComplete),
            0x0F => Some(Events::CommandStatus),
            0x13 => Some(Events::NumberOfCompletedPackets),
            0x3E => Some(Events::LEMeta),
            _ => None,
        }
    }
}

/// Raw event packet errors
#[derive(Debug,Clone,PartialEq,Eq)]
pub enum EventError {
    PacketTooSmall,
    IncorrectParameterLength,
}

impl core::fmt::Display for EventError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            EventError::PacketTooSmall =>
                write!(f, "Packet is too small to be a valid HCI event"),
            EventError::IncorrectParameterLength =>
                write!(f, "Event parameter length field doesn't match the actual parameter length"),
        }
    }
}

impl std::error::Error for EventError {}

/// An HCI event packet in raw form
///
/// The header is validated on creation, the parameters are only interpreted
/// when one of the typed event data structures is created from them.
#[derive(Debug,Clone)]
pub struct EventPacket {
    event_code: u8,
    parameters: Box<[u8]>,
}

impl EventPacket {
    /// Create an `EventPacket` from the bytes of a received event
    ///
    /// The input must be the full event packet, starting with the event code
    /// byte.
    ///
    /// # Errors
    /// * The length of the raw data must be >= 2
    /// * The parameter total length field must equal the length of the data
    ///   following the header
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, EventError> {
        if packet.len() < 2 {
            return Err( EventError::PacketTooSmall );
        }

        if packet[1] as usize != packet[2..].len() {
            return Err( EventError::IncorrectParameterLength );
        }

        Ok( EventPacket {
            event_code: packet[0],
            parameters: Box::from(&packet[2..]),
        })
    }

    /// Create an event packet without going over the wire
    ///
    /// Used by tests and for events synthesized by the host.
    pub fn new(event_code: u8, parameters: Box<[u8]>) -> Self {
        EventPacket { event_code, parameters }
    }

    pub fn get_event_code(&self) -> u8 {
        self.event_code
    }

    pub fn get_parameters(&self) -> &[u8] {
        &self.parameters
    }

    /// The subevent code, if this is an LE Meta event with parameters
    pub fn get_le_meta_subevent(&self) -> Option<u8> {
        if self.event_code == Events::LEMeta.to_val() {
            self.parameters.get(0).copied()
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct CommandCompleteData {
    pub number_of_hci_command_packets: u8,
    pub command_opcode: Option<u16>,
    /// The return parameter bytes of the completed command
    pub raw_data: Box<[u8]>,
}

impl_try_from_for_raw_packet! {
    CommandCompleteData,
    packet,
    {
        if packet.len() < 3 {
            return Err( "Command Complete event parameters are too short".to_string() );
        }

        Ok(CommandCompleteData {
            number_of_hci_command_packets: chew!(packet),
            command_opcode: {
                let opcode = chew_u16!(packet);

                if opcode != 0 { Some(opcode) } else { None }
            },
            raw_data: Box::from(packet),
        })
    }
}

#[derive(Clone)]
pub struct CommandStatusData {
    pub status: Error,
    pub number_of_hci_command_packets: u8,
    pub command_opcode: Option<u16>,
}

impl_try_from_for_raw_packet! {
    CommandStatusData,
    packet,
    {
        if packet.len() < 4 {
            return Err( "Command Status event parameters are too short".to_string() );
        }

        Ok(CommandStatusData {
            status: Error::from(chew!(packet)),
            number_of_hci_command_packets: chew!(packet),
            command_opcode: {
                let opcode = chew_u16!(packet);

                if opcode != 0 { Some(opcode) } else { None }
            },
        })
    }
}

#[derive(Clone)]
pub struct DisconnectionCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub reason: u8,
}

impl_try_from_for_raw_packet! {
    DisconnectionCompleteData,
    packet,
    {
        if packet.len() < 4 {
            return Err( "Disconnection Complete event parameters are too short".to_string() );
        }

        Ok(DisconnectionCompleteData {
            status: Error::from(chew!(packet)),
            connection_handle: chew_handle!(packet),
            reason: chew!(packet),
        })
    }
}

#[derive(Clone)]
pub struct NumberOfCompletedPacketsData {
    pub connection_handle: ConnectionHandle,
    pub number_of_completed_packets: u16,
}

impl NumberOfCompletedPacketsData {
    /// Parse the Number of Completed Packets event parameters into a boxed
    /// slice of entries
    ///
    /// This is an inherent method rather than a `TryFrom<&[u8]>` impl on
    /// `Box<[NumberOfCompletedPacketsData]>` because implementing a foreign
    /// trait for a doubly-foreign-wrapped local type (`Box<[Local]>`)
    /// violates Rust's orphan rules.
    #[allow(unused_assignments, unused_mut)]
    pub fn try_from_raw_slice(param: &[u8]) -> Result<Box<[Self]>, String> {
        let mut packet = param;

        if packet.is_empty() {
            return Err( "Number of Completed Packets event parameters are too short".to_string() );
        }

        let handle_count = packet[0] as usize;

        if packet[1..].len() < handle_count * 4 {
            return Err( "Number of Completed Packets event parameters are too short".to_string() );
        }

        // Each entry is 4 bytes, a connection handle followed by a count
        let mut vec = Vec::with_capacity(handle_count);

        for chunk in packet[1..].chunks_exact( 4 ).take(handle_count) {
            let mut chunk = chunk;

            vec.push( NumberOfCompletedPacketsData {
                connection_handle: chew_handle!(chunk),
                number_of_completed_packets: chew_u16!(chunk),
            });
        }

        Ok( vec.into_boxed_slice() )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn event_packet_header_test() {
        let packet = EventPacket::try_from_packet(&[0x0E, 0x03, 0x01, 0x03, 0x0C]).unwrap();

        assert_eq!( packet.get_event_code(), 0x0E );
        assert_eq!( packet.get_parameters(), &[0x01, 0x03, 0x0C] );
        assert_eq!( packet.get_le_meta_subevent(), None );

        assert!( matches!(
            EventPacket::try_from_packet(&[0x0E]),
            Err(EventError::PacketTooSmall)
        ));

        assert!( matches!(
            EventPacket::try_from_packet(&[0x0E, 0x04, 0x01]),
            Err(EventError::IncorrectParameterLength)
        ));
    }

    #[test]
    fn le_meta_subevent_test() {
        let packet = EventPacket::try_from_packet(&[0x3E, 0x02, 0x0A, 0x00]).unwrap();

        assert_eq!( packet.get_le_meta_subevent(), Some(0x0A) );
    }

    #[test]
    fn command_complete_test() {
        // Command Complete for Reset (opcode 0x0C03) with one credit and a
        // success status return parameter
        let data = CommandCompleteData::try_from(&[0x01, 0x03, 0x0C, 0x00][..]).unwrap();

        assert_eq!( data.number_of_hci_command_packets, 1 );
        assert_eq!( data.command_opcode, Some(0x0C03) );
        assert_eq!( &*data.raw_data, &[0x00] );
    }

    #[test]
    fn command_complete_no_opcode_test() {
        let data = CommandCompleteData::try_from(&[0x02, 0x00, 0x00][..]).unwrap();

        assert_eq!( data.number_of_hci_command_packets, 2 );
        assert_eq!( data.command_opcode, None );
    }

    #[test]
    fn command_status_test() {
        let data = CommandStatusData::try_from(&[0x00, 0x01, 0x01, 0x04][..]).unwrap();

        assert!( data.status.is_ok() );
        assert_eq!( data.number_of_hci_command_packets, 1 );
        assert_eq!( data.command_opcode, Some(0x0401) );
    }

    #[test]
    fn number_of_completed_packets_test() {
        let raw = [
            0x02,                   // two handles
            0x01, 0x00, 0x03, 0x00, // handle 0x001, 3 packets
            0x02, 0x00, 0x01, 0x00, // handle 0x002, 1 packet
        ];

        let data = NumberOfCompletedPacketsData::try_from_raw_slice(&raw[..]).unwrap();

        assert_eq!( data.len(), 2 );
        assert_eq!( data[0].connection_handle.get_raw_handle(), 0x001 );
        assert_eq!( data[0].number_of_completed_packets, 3 );
        assert_eq!( data[1].connection_handle.get_raw_handle(), 0x002 );
        assert_eq!( data[1].number_of_completed_packets, 1 );
    }

    #[test]
    fn disconnection_complete_test() {
        let data = DisconnectionCompleteData::try_from(&[0x00, 0x01, 0x00, 0x13][..]).unwrap();

        assert!( data.status.is_ok() );
        assert_eq!( data.connection_handle.get_raw_handle(), 0x001 );
        assert_eq!( data.reason, 0x13 );
    }
}
