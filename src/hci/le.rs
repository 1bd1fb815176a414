//! LE Controller Commands

/// LE Read Buffer Size Command
///
/// Reads the dedicated LE ACL data buffer capacities. A controller that
/// shares its BR/EDR buffer with the LE transport reports zero for both
/// values, in which case the values of Read Buffer Size apply.
pub mod read_buffer_size {

    use crate::hci::*;
    use crate::hci::acl_data_channel::DataBufferInfo;

    const COMMAND: opcodes::HCICommand = opcodes::HCICommand::LEController(opcodes::LEController::ReadBufferSize);

    #[derive(Clone,Copy)]
    struct Parameter;

    impl CommandParameter for Parameter {
        const COMMAND: opcodes::HCICommand = COMMAND;
        fn get_parameter(&self) -> Vec<u8> { Vec::new() }
    }

    pub fn command() -> CommandPacket {
        Parameter.as_command_packet()
    }

    /// The LE buffer capacities reported by the controller
    ///
    /// Both values being zero means the LE transport shares the BR/EDR
    /// buffers, which [`as_buffer_info`](#method.as_buffer_info) renders as
    /// an unavailable buffer info.
    #[derive(Debug,Clone,Copy)]
    pub struct BufferSize {
        pub le_acl_data_packet_length: u16,
        pub total_num_le_acl_data_packets: u8,
    }

    impl BufferSize {
        /// Parse the Command Complete return parameters
        ///
        /// # Errors
        /// The controller returned an error status, or the return parameters
        /// were too short.
        pub fn try_from_return(raw: &[u8]) -> Result<BufferSize, error::Error> {
            if raw.len() < 4 {
                return Err( error::Error::UnspecifiedError );
            }

            let status = error::Error::from(raw[0]);

            if !status.is_ok() {
                return Err( status );
            }

            Ok( BufferSize {
                le_acl_data_packet_length: u16::from_le_bytes([raw[1], raw[2]]),
                total_num_le_acl_data_packets: raw[3],
            })
        }

        pub fn as_buffer_info(&self) -> DataBufferInfo {
            DataBufferInfo::new(
                self.le_acl_data_packet_length as usize,
                self.total_num_le_acl_data_packets as usize,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::read_buffer_size::BufferSize;

    #[test]
    fn le_read_buffer_size_packet_test() {
        let packet = super::read_buffer_size::command();

        assert_eq!( packet.get_opcode(), 0x2002 );
    }

    #[test]
    fn shared_buffer_test() {
        let buffer_size = BufferSize::try_from_return(&[0x00, 0x00, 0x00, 0x00]).unwrap();

        // all zero means "use the BR/EDR buffer"
        assert!( !buffer_size.as_buffer_info().is_available() );
    }
}
