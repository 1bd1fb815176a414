//! Informational Parameter Commands

/// Read Buffer Size Command
///
/// Reads the ACL data buffer capacities of the BR/EDR transport. The return
/// parameters feed the configuration of the ACL data channel.
pub mod read_buffer_size {

    use crate::hci::*;
    use crate::hci::acl_data_channel::DataBufferInfo;

    const COMMAND: opcodes::HCICommand = opcodes::HCICommand::InformationParameters(opcodes::InformationParameters::ReadBufferSize);

    #[derive(Clone,Copy)]
    struct Parameter;

    impl CommandParameter for Parameter {
        const COMMAND: opcodes::HCICommand = COMMAND;
        fn get_parameter(&self) -> Vec<u8> { Vec::new() }
    }

    pub fn command() -> CommandPacket {
        Parameter.as_command_packet()
    }

    /// The buffer capacities reported by the controller
    #[derive(Debug,Clone,Copy)]
    pub struct BufferSize {
        /// The maximum size of the data portion of each HCI ACL data packet
        pub acl_data_packet_length: u16,
        /// The number of ACL data packets the controller can hold
        pub total_num_acl_data_packets: u16,
    }

    impl BufferSize {
        /// Parse the Command Complete return parameters
        ///
        /// # Errors
        /// The controller returned an error status, or the return parameters
        /// were too short.
        pub fn try_from_return(raw: &[u8]) -> Result<BufferSize, error::Error> {
            if raw.len() < 8 {
                return Err( error::Error::UnspecifiedError );
            }

            let status = error::Error::from(raw[0]);

            if !status.is_ok() {
                return Err( status );
            }

            Ok( BufferSize {
                acl_data_packet_length: u16::from_le_bytes([raw[1], raw[2]]),
                // raw[3] and raw[4..6] are the synchronous packet length and
                // count, unused by this host
                total_num_acl_data_packets: u16::from_le_bytes([raw[6], raw[7]]),
            })
        }

        pub fn as_buffer_info(&self) -> DataBufferInfo {
            DataBufferInfo::new(
                self.acl_data_packet_length as usize,
                self.total_num_acl_data_packets as usize,
            )
        }
    }
}
