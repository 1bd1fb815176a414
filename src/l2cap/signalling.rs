//! Signalling channel commands
//!
//! Every command on the signalling channel is a code, a one byte identifier
//! chosen by the sender (echoed by the responder) and a length framed
//! payload. Several commands may share one C-frame on the ACL-U signalling
//! channel, [`parse_commands`] returns them all.
//!
//! This module only encodes and decodes, the request/response state lives
//! with the logical link.
//!
//! # Specification Reference
//! See Bluetooth Specification V5 | Vol 3, Part A Section 4
//!
//! [`parse_commands`]: fn.parse_commands.html

use crate::hci::common::BoundsErr;

/// Command codes understood by this implementation
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum SignallingCode {
    CommandReject,
    ConnectionRequest,
    ConnectionResponse,
    ConfigurationRequest,
    ConfigurationResponse,
    DisconnectionRequest,
    DisconnectionResponse,
    InformationRequest,
    InformationResponse,
    ConnectionParameterUpdateRequest,
    ConnectionParameterUpdateResponse,
}

impl SignallingCode {
    pub fn to_val(&self) -> u8 {
        use self::SignallingCode::*;

        match *self {
            CommandReject => 0x01,
            ConnectionRequest => 0x02,
            ConnectionResponse => 0x03,
            ConfigurationRequest => 0x04,
            ConfigurationResponse => 0x05,
            DisconnectionRequest => 0x06,
            DisconnectionResponse => 0x07,
            InformationRequest => 0x0A,
            InformationResponse => 0x0B,
            ConnectionParameterUpdateRequest => 0x12,
            ConnectionParameterUpdateResponse => 0x13,
        }
    }

    pub fn try_from_raw(raw: u8) -> Option<SignallingCode> {
        use self::SignallingCode::*;

        match raw {
            0x01 => Some(CommandReject),
            0x02 => Some(ConnectionRequest),
            0x03 => Some(ConnectionResponse),
            0x04 => Some(ConfigurationRequest),
            0x05 => Some(ConfigurationResponse),
            0x06 => Some(DisconnectionRequest),
            0x07 => Some(DisconnectionResponse),
            0x0A => Some(InformationRequest),
            0x0B => Some(InformationResponse),
            0x12 => Some(ConnectionParameterUpdateRequest),
            0x13 => Some(ConnectionParameterUpdateResponse),
            _ => None,
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum SignallingError {
    TooShort,
    Malformed,
}

/// One command received on a signalling channel
#[derive(Debug,Clone,PartialEq,Eq)]
pub(crate) struct SignallingCommand {
    /// None for codes this implementation doesn't know, they are answered
    /// with a Command Reject
    pub code: Option<SignallingCode>,
    pub identifier: u8,
    pub data: Vec<u8>,
}

/// Split the payload of a signalling channel B-frame into its commands
pub(crate) fn parse_commands(mut payload: &[u8]) -> Result<Vec<SignallingCommand>, SignallingError> {
    let mut commands = Vec::new();

    while !payload.is_empty() {
        if payload.len() < 4 {
            return Err( SignallingError::TooShort );
        }

        let length = u16::from_le_bytes([payload[2], payload[3]]) as usize;

        if payload[4..].len() < length {
            return Err( SignallingError::TooShort );
        }

        commands.push( SignallingCommand {
            code: SignallingCode::try_from_raw(payload[0]),
            identifier: payload[1],
            data: payload[4..4 + length].to_vec(),
        });

        payload = &payload[4 + length..];
    }

    Ok(commands)
}

/// Frame a command for a signalling channel
pub(crate) fn make_command(code: SignallingCode, identifier: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity( payload.len() + 4 );

    v.push( code.to_val() );
    v.push( identifier );
    v.extend_from_slice( &(payload.len() as u16).to_le_bytes() );
    v.extend_from_slice( payload );

    v
}

/// Reason field of a Command Reject
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum RejectReason {
    CommandNotUnderstood,
    SignallingMtuExceeded { actual_mtu: u16 },
    InvalidCid { local_cid: u16, remote_cid: u16 },
}

impl RejectReason {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            RejectReason::CommandNotUnderstood => vec![0x00, 0x00],
            RejectReason::SignallingMtuExceeded { actual_mtu } => {
                let mut v = vec![0x01, 0x00];
                v.extend_from_slice(&actual_mtu.to_le_bytes());
                v
            },
            RejectReason::InvalidCid { local_cid, remote_cid } => {
                let mut v = vec![0x02, 0x00];
                v.extend_from_slice(&local_cid.to_le_bytes());
                v.extend_from_slice(&remote_cid.to_le_bytes());
                v
            },
        }
    }

    pub fn decode(data: &[u8]) -> Result<RejectReason, SignallingError> {
        if data.len() < 2 {
            return Err( SignallingError::TooShort );
        }

        match u16::from_le_bytes([data[0], data[1]]) {
            0x0000 => Ok( RejectReason::CommandNotUnderstood ),
            0x0001 => {
                if data.len() < 4 {
                    return Err( SignallingError::TooShort );
                }

                Ok( RejectReason::SignallingMtuExceeded {
                    actual_mtu: u16::from_le_bytes([data[2], data[3]]),
                })
            },
            0x0002 => {
                if data.len() < 6 {
                    return Err( SignallingError::TooShort );
                }

                Ok( RejectReason::InvalidCid {
                    local_cid: u16::from_le_bytes([data[2], data[3]]),
                    remote_cid: u16::from_le_bytes([data[4], data[5]]),
                })
            },
            _ => Err( SignallingError::Malformed ),
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) struct ConnectionRequestData {
    pub psm: u16,
    pub source_cid: u16,
}

impl ConnectionRequestData {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = self.psm.to_le_bytes().to_vec();
        v.extend_from_slice(&self.source_cid.to_le_bytes());
        v
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 4 {
            return Err( SignallingError::TooShort );
        }

        Ok( ConnectionRequestData {
            psm: u16::from_le_bytes([data[0], data[1]]),
            source_cid: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// Result field of a Connection Response
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum ConnectionResult {
    Success,
    Pending,
    PsmNotSupported,
    SecurityBlock,
    NoResources,
    InvalidSourceCid,
    SourceCidAlreadyAllocated,
    Unknown(u16),
}

impl ConnectionResult {
    pub fn to_val(&self) -> u16 {
        use self::ConnectionResult::*;

        match *self {
            Success => 0x0000,
            Pending => 0x0001,
            PsmNotSupported => 0x0002,
            SecurityBlock => 0x0003,
            NoResources => 0x0004,
            InvalidSourceCid => 0x0006,
            SourceCidAlreadyAllocated => 0x0007,
            Unknown(val) => val,
        }
    }

    pub fn from_raw(raw: u16) -> Self {
        use self::ConnectionResult::*;

        match raw {
            0x0000 => Success,
            0x0001 => Pending,
            0x0002 => PsmNotSupported,
            0x0003 => SecurityBlock,
            0x0004 => NoResources,
            0x0006 => InvalidSourceCid,
            0x0007 => SourceCidAlreadyAllocated,
            _ => Unknown(raw),
        }
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) struct ConnectionResponseData {
    pub destination_cid: u16,
    pub source_cid: u16,
    pub result: ConnectionResult,
    pub status: u16,
}

impl ConnectionResponseData {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = self.destination_cid.to_le_bytes().to_vec();
        v.extend_from_slice(&self.source_cid.to_le_bytes());
        v.extend_from_slice(&self.result.to_val().to_le_bytes());
        v.extend_from_slice(&self.status.to_le_bytes());
        v
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 8 {
            return Err( SignallingError::TooShort );
        }

        Ok( ConnectionResponseData {
            destination_cid: u16::from_le_bytes([data[0], data[1]]),
            source_cid: u16::from_le_bytes([data[2], data[3]]),
            result: ConnectionResult::from_raw(u16::from_le_bytes([data[4], data[5]])),
            status: u16::from_le_bytes([data[6], data[7]]),
        })
    }
}

/// Retransmission and Flow Control configuration option payload
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) struct RetransmissionAndFlowControl {
    pub mode: u8,
    pub tx_window_size: u8,
    pub max_transmit: u8,
    pub retransmission_timeout: u16,
    pub monitor_timeout: u16,
    pub mps: u16,
}

impl RetransmissionAndFlowControl {
    pub const MODE_BASIC: u8 = 0x00;
    pub const MODE_ENHANCED_RETRANSMISSION: u8 = 0x03;

    /// Sensible defaults for an Enhanced Retransmission mode request
    pub fn enhanced_retransmission() -> Self {
        RetransmissionAndFlowControl {
            mode: Self::MODE_ENHANCED_RETRANSMISSION,
            tx_window_size: 32,
            max_transmit: 8,
            retransmission_timeout: 2000,
            monitor_timeout: 12000,
            mps: 1010,
        }
    }

    pub fn basic() -> Self {
        RetransmissionAndFlowControl {
            mode: Self::MODE_BASIC,
            tx_window_size: 0,
            max_transmit: 0,
            retransmission_timeout: 0,
            monitor_timeout: 0,
            mps: 0,
        }
    }
}

/// A configuration option of a Configuration Request or Response
///
/// Option types with the most significant bit set are *hints*, an
/// implementation that doesn't know them must skip them silently. Unknown
/// non-hint options make the whole request fail with `UnknownOptions`.
#[derive(Debug,Clone,PartialEq,Eq)]
pub(crate) enum ConfigOption {
    Mtu(u16),
    RetransmissionAndFlowControl(RetransmissionAndFlowControl),
    Unknown { option_type: u8, data: Vec<u8> },
}

impl ConfigOption {
    pub const MTU_TYPE: u8 = 0x01;
    pub const RETRANSMISSION_AND_FLOW_CONTROL_TYPE: u8 = 0x04;

    pub fn is_hint(option_type: u8) -> bool {
        option_type & 0x80 != 0
    }

    fn encode_into(&self, v: &mut Vec<u8>) {
        match self {
            ConfigOption::Mtu(mtu) => {
                v.push(Self::MTU_TYPE);
                v.push(2);
                v.extend_from_slice(&mtu.to_le_bytes());
            },
            ConfigOption::RetransmissionAndFlowControl(rfc) => {
                v.push(Self::RETRANSMISSION_AND_FLOW_CONTROL_TYPE);
                v.push(9);
                v.push(rfc.mode);
                v.push(rfc.tx_window_size);
                v.push(rfc.max_transmit);
                v.extend_from_slice(&rfc.retransmission_timeout.to_le_bytes());
                v.extend_from_slice(&rfc.monitor_timeout.to_le_bytes());
                v.extend_from_slice(&rfc.mps.to_le_bytes());
            },
            ConfigOption::Unknown { option_type, data } => {
                v.push(*option_type);
                v.push(data.len() as u8);
                v.extend_from_slice(data);
            },
        }
    }
}

/// Parse the option list of a Configuration Request or Response
///
/// Hint options that are not understood are dropped here, unknown non-hint
/// options are returned as `ConfigOption::Unknown` for the caller to reject.
pub(crate) fn parse_config_options(mut data: &[u8]) -> Result<Vec<ConfigOption>, SignallingError> {
    let mut options = Vec::new();

    while !data.is_empty() {
        if data.len() < 2 {
            return Err( SignallingError::TooShort );
        }

        let option_type = data[0];
        let length = data[1] as usize;

        if data[2..].len() < length {
            return Err( SignallingError::TooShort );
        }

        let payload = &data[2..2 + length];

        match option_type {
            ConfigOption::MTU_TYPE => {
                if length < 2 {
                    return Err( SignallingError::Malformed );
                }

                options.push( ConfigOption::Mtu(u16::from_le_bytes([payload[0], payload[1]])) );
            },
            ConfigOption::RETRANSMISSION_AND_FLOW_CONTROL_TYPE => {
                if length < 9 {
                    return Err( SignallingError::Malformed );
                }

                options.push( ConfigOption::RetransmissionAndFlowControl(
                    RetransmissionAndFlowControl {
                        mode: payload[0],
                        tx_window_size: payload[1],
                        max_transmit: payload[2],
                        retransmission_timeout: u16::from_le_bytes([payload[3], payload[4]]),
                        monitor_timeout: u16::from_le_bytes([payload[5], payload[6]]),
                        mps: u16::from_le_bytes([payload[7], payload[8]]),
                    }
                ));
            },
            _ if ConfigOption::is_hint(option_type) => (),
            _ => options.push( ConfigOption::Unknown {
                option_type,
                data: payload.to_vec(),
            }),
        }

        data = &data[2 + length..];
    }

    Ok(options)
}

pub(crate) fn encode_config_options(options: &[ConfigOption]) -> Vec<u8> {
    let mut v = Vec::new();

    for option in options {
        option.encode_into(&mut v);
    }

    v
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub(crate) struct ConfigurationRequestData {
    pub destination_cid: u16,
    pub flags: u16,
    pub options: Vec<ConfigOption>,
}

impl ConfigurationRequestData {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = self.destination_cid.to_le_bytes().to_vec();
        v.extend_from_slice(&self.flags.to_le_bytes());
        v.extend_from_slice(&encode_config_options(&self.options));
        v
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 4 {
            return Err( SignallingError::TooShort );
        }

        Ok( ConfigurationRequestData {
            destination_cid: u16::from_le_bytes([data[0], data[1]]),
            flags: u16::from_le_bytes([data[2], data[3]]),
            options: parse_config_options(&data[4..])?,
        })
    }
}

/// Result field of a Configuration Response
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum ConfigurationResult {
    Success,
    UnacceptableParameters,
    Rejected,
    UnknownOptions,
    Unknown(u16),
}

impl ConfigurationResult {
    pub fn to_val(&self) -> u16 {
        use self::ConfigurationResult::*;

        match *self {
            Success => 0x0000,
            UnacceptableParameters => 0x0001,
            Rejected => 0x0002,
            UnknownOptions => 0x0003,
            Unknown(val) => val,
        }
    }

    pub fn from_raw(raw: u16) -> Self {
        use self::ConfigurationResult::*;

        match raw {
            0x0000 => Success,
            0x0001 => UnacceptableParameters,
            0x0002 => Rejected,
            0x0003 => UnknownOptions,
            _ => Unknown(raw),
        }
    }
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub(crate) struct ConfigurationResponseData {
    pub source_cid: u16,
    pub flags: u16,
    pub result: ConfigurationResult,
    pub options: Vec<ConfigOption>,
}

impl ConfigurationResponseData {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = self.source_cid.to_le_bytes().to_vec();
        v.extend_from_slice(&self.flags.to_le_bytes());
        v.extend_from_slice(&self.result.to_val().to_le_bytes());
        v.extend_from_slice(&encode_config_options(&self.options));
        v
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 6 {
            return Err( SignallingError::TooShort );
        }

        Ok( ConfigurationResponseData {
            source_cid: u16::from_le_bytes([data[0], data[1]]),
            flags: u16::from_le_bytes([data[2], data[3]]),
            result: ConfigurationResult::from_raw(u16::from_le_bytes([data[4], data[5]])),
            options: parse_config_options(&data[6..])?,
        })
    }
}

/// Payload of both the Disconnection Request and Response
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) struct DisconnectionData {
    pub destination_cid: u16,
    pub source_cid: u16,
}

impl DisconnectionData {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = self.destination_cid.to_le_bytes().to_vec();
        v.extend_from_slice(&self.source_cid.to_le_bytes());
        v
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 4 {
            return Err( SignallingError::TooShort );
        }

        Ok( DisconnectionData {
            destination_cid: u16::from_le_bytes([data[0], data[1]]),
            source_cid: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// Information request/response type field
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum InformationType {
    ConnectionlessMtu,
    ExtendedFeatures,
    FixedChannels,
    Unknown(u16),
}

impl InformationType {
    pub fn to_val(&self) -> u16 {
        use self::InformationType::*;

        match *self {
            ConnectionlessMtu => 0x0001,
            ExtendedFeatures => 0x0002,
            FixedChannels => 0x0003,
            Unknown(val) => val,
        }
    }

    pub fn from_raw(raw: u16) -> Self {
        use self::InformationType::*;

        match raw {
            0x0001 => ConnectionlessMtu,
            0x0002 => ExtendedFeatures,
            0x0003 => FixedChannels,
            _ => Unknown(raw),
        }
    }
}

pub(crate) const INFORMATION_RESULT_SUCCESS: u16 = 0x0000;
pub(crate) const INFORMATION_RESULT_NOT_SUPPORTED: u16 = 0x0001;

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) struct InformationRequestData {
    pub info_type: InformationType,
}

impl InformationRequestData {
    pub fn encode(&self) -> Vec<u8> {
        self.info_type.to_val().to_le_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 2 {
            return Err( SignallingError::TooShort );
        }

        Ok( InformationRequestData {
            info_type: InformationType::from_raw(u16::from_le_bytes([data[0], data[1]])),
        })
    }
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub(crate) struct InformationResponseData {
    pub info_type: InformationType,
    pub result: u16,
    pub data: Vec<u8>,
}

impl InformationResponseData {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = self.info_type.to_val().to_le_bytes().to_vec();
        v.extend_from_slice(&self.result.to_le_bytes());
        v.extend_from_slice(&self.data);
        v
    }

    pub fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 4 {
            return Err( SignallingError::TooShort );
        }

        Ok( InformationResponseData {
            info_type: InformationType::from_raw(u16::from_le_bytes([data[0], data[1]])),
            result: u16::from_le_bytes([data[2], data[3]]),
            data: data[4..].to_vec(),
        })
    }
}

/// Connection parameters requested by an LE peripheral
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub struct ConnectionParameterUpdate {
    pub interval_min: u16,
    pub interval_max: u16,
    pub peripheral_latency: u16,
    pub timeout_multiplier: u16,
}

impl ConnectionParameterUpdate {
    /// Check the request against the ranges of the specification
    ///
    /// The ranges are those of Vol 3, Part A Section 4.20: interval values in
    /// 6..=3200, latency at most 499, timeout multiplier in 10..=3200, and
    /// the minimum interval no larger than the maximum.
    pub fn is_valid(&self) -> bool {
        BoundsErr::check(self.interval_min, 0x0006, 0x0C80).is_ok()
            && BoundsErr::check(self.interval_max, 0x0006, 0x0C80).is_ok()
            && self.interval_min <= self.interval_max
            && self.peripheral_latency <= 0x01F3
            && BoundsErr::check(self.timeout_multiplier, 0x000A, 0x0C80).is_ok()
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut v = self.interval_min.to_le_bytes().to_vec();
        v.extend_from_slice(&self.interval_max.to_le_bytes());
        v.extend_from_slice(&self.peripheral_latency.to_le_bytes());
        v.extend_from_slice(&self.timeout_multiplier.to_le_bytes());
        v
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, SignallingError> {
        if data.len() < 8 {
            return Err( SignallingError::TooShort );
        }

        Ok( ConnectionParameterUpdate {
            interval_min: u16::from_le_bytes([data[0], data[1]]),
            interval_max: u16::from_le_bytes([data[2], data[3]]),
            peripheral_latency: u16::from_le_bytes([data[4], data[5]]),
            timeout_multiplier: u16::from_le_bytes([data[6], data[7]]),
        })
    }
}

pub(crate) const CONN_PARAM_RESULT_ACCEPTED: u16 = 0x0000;
pub(crate) const CONN_PARAM_RESULT_REJECTED: u16 = 0x0001;
