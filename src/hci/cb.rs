//! Controller and Baseband Commands

/// Reset the controller
///
/// This will reset the Controller and the appropriate link Layer. For BR/EDR the Link
/// Manager is reset, for LE the Link Layer is reset, and for AMP the PAL is reset.
pub mod reset {

    use crate::hci::*;

    const COMMAND: opcodes::HCICommand = opcodes::HCICommand::ControllerAndBaseband(opcodes::ControllerAndBaseband::Reset);

    #[derive(Clone,Copy)]
    struct Parameter;

    impl CommandParameter for Parameter {
        const COMMAND: opcodes::HCICommand = COMMAND;
        fn get_parameter(&self) -> Vec<u8> { Vec::new() }
    }

    /// Build the command packet to send over a command channel
    pub fn command() -> CommandPacket {
        Parameter.as_command_packet()
    }
}

/// Enable events
///
/// The mask is the raw 8 byte bit field of Set Event Mask
/// (v5 | Vol 2, Part E, Section 7.3.1). Bit positions for reserved events
/// are passed through untouched.
pub mod set_event_mask {

    use crate::hci::*;

    const COMMAND: opcodes::HCICommand = opcodes::HCICommand::ControllerAndBaseband(opcodes::ControllerAndBaseband::SetEventMask);

    #[derive(Clone,Copy)]
    struct Parameter {
        mask: [u8;8],
    }

    impl CommandParameter for Parameter {
        const COMMAND: opcodes::HCICommand = COMMAND;
        fn get_parameter(&self) -> Vec<u8> { self.mask.to_vec() }
    }

    pub fn command( mask: [u8;8] ) -> CommandPacket {
        Parameter { mask }.as_command_packet()
    }
}
