//! Link Control Commands

/// Start an inquiry
///
/// The inquiry procedure completes asynchronously with the Inquiry Complete
/// event (code 0x01), so send the packet with the completion event set to
/// that code.
pub mod inquiry {

    use crate::hci::*;

    const COMMAND: opcodes::HCICommand = opcodes::HCICommand::LinkControl(opcodes::LinkControl::Inquiry);

    /// Inquiry Complete, the event ending the inquiry procedure
    pub const COMPLETE_EVENT_CODE: u8 = 0x01;

    /// The General Inquiry Access Code
    pub const GIAC: [u8;3] = [0x33, 0x8B, 0x9E];

    #[derive(Clone,Copy)]
    struct Parameter {
        lap: [u8;3],
        inquiry_length: u8,
        num_responses: u8,
    }

    impl CommandParameter for Parameter {
        const COMMAND: opcodes::HCICommand = COMMAND;

        fn get_parameter(&self) -> Vec<u8> {
            let mut v = self.lap.to_vec();

            v.push(self.inquiry_length);
            v.push(self.num_responses);

            v
        }
    }

    /// Build the command packet
    ///
    /// `inquiry_length` is in units of 1.28 s, clamped to the specification
    /// range 0x01..=0x30. `num_responses` of zero means unlimited.
    pub fn command( lap: [u8;3], inquiry_length: u8, num_responses: u8 ) -> CommandPacket {
        Parameter {
            lap,
            inquiry_length: inquiry_length.max(0x01).min(0x30),
            num_responses,
        }
        .as_command_packet()
    }
}

/// Disconnect a connection
///
/// Completes asynchronously with the Disconnection Complete event, the
/// Command Status event only says the controller started the procedure.
pub mod disconnect {

    use crate::hci::*;
    use crate::hci::common::ConnectionHandle;

    const COMMAND: opcodes::HCICommand = opcodes::HCICommand::LinkControl(opcodes::LinkControl::Disconnect);

    #[derive(Clone,Copy)]
    struct Parameter {
        connection_handle: u16,
        reason: u8,
    }

    impl CommandParameter for Parameter {
        const COMMAND: opcodes::HCICommand = COMMAND;

        fn get_parameter(&self) -> Vec<u8> {
            let mut v = self.connection_handle.to_le_bytes().to_vec();

            v.push(self.reason);

            v
        }
    }

    pub fn command( handle: ConnectionHandle, reason: u8 ) -> CommandPacket {
        Parameter {
            connection_handle: handle.get_raw_handle(),
            reason,
        }
        .as_command_packet()
    }
}

#[cfg(test)]
mod tests {
    use crate::hci::common::ConnectionHandle;

    #[test]
    fn inquiry_packet_test() {
        let packet = super::inquiry::command(super::inquiry::GIAC, 0x08, 0x00);

        assert_eq!( packet.get_opcode(), 0x0401 );
        assert_eq!( packet.get_parameters(), &[0x33, 0x8B, 0x9E, 0x08, 0x00] );
    }

    #[test]
    fn disconnect_packet_test() {
        let handle = ConnectionHandle::try_from(0x0001).unwrap();

        // reason 0x13, remote user terminated connection
        let packet = super::disconnect::command(handle, 0x13);

        assert_eq!( packet.get_opcode(), 0x0406 );
        assert_eq!( packet.get_parameters(), &[0x01, 0x00, 0x13] );
    }
}
