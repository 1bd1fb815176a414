//! Per connection L2CAP state
//!
//! A `LogicalLink` exists for every registered connection handle. It owns the
//! channel states of the link, the PDU recombination buffer, and the request
//! bookkeeping of its signalling channel. Everything that needs the ACL
//! channel or creates user facing [`Channel`] handles lives in the channel
//! manager, which keeps this module free of the transport type parameter.
//!
//! [`Channel`]: ../channel/struct.Channel.html

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::hci::common::{ConnectionHandle, LinkRole, LinkType};
use crate::timer::TimerId;

use super::channel::{
    ChannelMode,
    ClosedCallback,
    ConnectionParameterUpdateCallback,
    LinkErrorCallback,
    RxCallback,
    SecurityProperties,
    SecurityUpgradeCallback,
};
use super::signalling::InformationType;
use super::DynChannelId;

bitflags::bitflags! {
    /// The extended feature mask of the Information Response
    /// (Bluetooth Specification V5 | Vol 3, Part A Section 4.12)
    pub struct ExtendedFeatures: u32 {
        const FLOW_CONTROL_MODE        = 1 << 0;
        const RETRANSMISSION_MODE      = 1 << 1;
        const ENHANCED_RETRANSMISSION  = 1 << 3;
        const STREAMING_MODE           = 1 << 4;
        const FCS_OPTION               = 1 << 5;
        const FIXED_CHANNELS           = 1 << 7;
        const UNICAST_CONNECTIONLESS   = 1 << 9;
    }
}

bitflags::bitflags! {
    /// The fixed channel mask of the Information Response
    /// (Bluetooth Specification V5 | Vol 3, Part A Section 4.13)
    pub struct FixedChannelsSupported: u64 {
        const SIGNALLING     = 1 << 1;
        const CONNECTIONLESS = 1 << 2;
        const SMP            = 1 << 7;
    }
}

/// The features this implementation reports in its own Information Responses
pub(crate) fn local_extended_features() -> ExtendedFeatures {
    ExtendedFeatures::ENHANCED_RETRANSMISSION | ExtendedFeatures::FIXED_CHANNELS
}

pub(crate) fn local_fixed_channels() -> FixedChannelsSupported {
    FixedChannelsSupported::SIGNALLING | FixedChannelsSupported::SMP
}

/// The state of a dynamic channel as seen from this side
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum DynamicChannelState {
    /// Connection Request sent, waiting for the Connection Response
    WaitingConnectionResponse,
    /// Connected, the configuration handshake is running
    WaitingConfig,
    Open,
    /// Disconnection Request sent, waiting for the Disconnection Response
    WaitingDisconnectResponse,
}

/// Configuration handshake progress and identity of a dynamic channel
pub(crate) struct DynamicChannelData {
    pub psm: u16,
    pub state: DynamicChannelState,
    /// Whether this side initiated the channel (and an open callback waits)
    pub locally_initiated: bool,
    pub local_config_sent: bool,
    pub local_config_acked: bool,
    pub remote_config_done: bool,
    /// The mode this side put in its Configuration Request
    pub requested_mode: Option<ChannelMode>,
    /// A renegotiation after `UnacceptableParameters` already happened
    pub config_retried: bool,
}

impl DynamicChannelData {
    pub fn handshake_done(&self) -> bool {
        self.local_config_sent && self.local_config_acked && self.remote_config_done
    }
}

/// The state of one channel endpoint on a link
pub(crate) struct ChannelState {
    pub local_cid: u16,
    /// 0 while unknown (dynamic channel before the Connection Response)
    pub remote_cid: u16,
    pub mode: ChannelMode,
    pub max_rx_sdu_size: u16,
    pub max_tx_sdu_size: u16,
    pub rx_callback: Option<RxCallback>,
    pub closed_callback: Option<ClosedCallback>,
    pub activated: bool,
    /// Set by a local deactivate, the channel no longer accepts anything
    pub deactivated: bool,
    /// SDUs received before activation, replayed on activate
    pub pending_rx: VecDeque<Vec<u8>>,
    /// `None` for fixed channels
    pub dynamic: Option<DynamicChannelData>,
}

impl ChannelState {
    pub fn new_fixed(cid: u16, mtu: u16) -> Self {
        ChannelState {
            local_cid: cid,
            remote_cid: cid,
            mode: ChannelMode::Basic,
            max_rx_sdu_size: mtu,
            max_tx_sdu_size: mtu,
            rx_callback: None,
            closed_callback: None,
            activated: false,
            deactivated: false,
            pending_rx: VecDeque::new(),
            dynamic: None,
        }
    }

    pub fn new_dynamic(
        local_cid: u16,
        psm: u16,
        locally_initiated: bool,
        requested_mode: Option<ChannelMode>,
        max_rx_sdu_size: u16,
        state: DynamicChannelState,
    ) -> Self
    {
        ChannelState {
            local_cid,
            remote_cid: 0,
            mode: ChannelMode::Basic,
            max_rx_sdu_size,
            max_tx_sdu_size: super::DEFAULT_MTU,
            rx_callback: None,
            closed_callback: None,
            activated: false,
            deactivated: false,
            pending_rx: VecDeque::new(),
            dynamic: Some( DynamicChannelData {
                psm,
                state,
                locally_initiated,
                local_config_sent: false,
                local_config_acked: false,
                remote_config_done: false,
                requested_mode,
                config_retried: false,
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        match self.dynamic {
            None => true,
            Some(ref dynamic) => dynamic.state == DynamicChannelState::Open,
        }
    }

    /// Inbound data for a channel being torn down is discarded
    pub fn discards_inbound(&self) -> bool {
        match self.dynamic {
            Some(ref dynamic) => dynamic.state == DynamicChannelState::WaitingDisconnectResponse,
            None => false,
        }
    }
}

/// What an outstanding signalling request was for
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub(crate) enum RequestKind {
    Connection { local_cid: u16 },
    Configuration { local_cid: u16 },
    Disconnection { local_cid: u16 },
    Information { info_type: InformationType },
}

/// An outstanding request on the signalling channel
///
/// The encoded command is kept for retransmission by the response timer.
pub(crate) struct PendingSignallingRequest {
    pub kind: RequestKind,
    pub packet: Vec<u8>,
    pub timer: TimerId,
    pub interval: Duration,
    pub elapsed: Duration,
}

/// Response timer constants (Vol 3, Part A Section 6.2.1 posture)
pub(crate) const RTX_INITIAL: Duration = Duration::from_secs(2);
pub(crate) const RTX_MAX: Duration = Duration::from_secs(4);
pub(crate) const RTX_TOTAL: Duration = Duration::from_secs(60);

/// The disconnection handshake gets one timer and no retransmission
pub(crate) const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// In progress recombination of a fragmented PDU
///
/// HCI delivers the fragments of one PDU back to back on a link, so a single
/// buffer per link suffices; the channel id of the PDU under recombination
/// identifies the only channel that may have a frame in flight.
pub(crate) struct PduRecombination {
    pub cid: u16,
    pub declared_length: usize,
    pub buffer: Vec<u8>,
}

/// Dropping inbound data this many times in a row is a broken link
pub(crate) const MAX_CONSECUTIVE_MALFORMED: usize = 3;

pub(crate) struct LogicalLink {
    handle: ConnectionHandle,
    link_type: LinkType,
    role: LinkRole,
    pub channels: HashMap<u16, ChannelState>,
    pub recombination: Option<PduRecombination>,
    pub consecutive_malformed: usize,
    /// Identifier for the next locally issued signalling request
    next_signalling_id: u8,
    pub pending_requests: HashMap<u8, PendingSignallingRequest>,
    pub link_error_callback: LinkErrorCallback,
    pub conn_param_callback: Option<ConnectionParameterUpdateCallback>,
    pub security_callback: Option<SecurityUpgradeCallback>,
    pub security: SecurityProperties,
    /// `None` until the Extended Features information exchange finished
    pub extended_features: Option<ExtendedFeatures>,
    /// `None` until the Fixed Channels information exchange finished
    pub fixed_channels: Option<FixedChannelsSupported>,
    next_dynamic_cid: u16,
}

impl LogicalLink {
    pub fn new(
        handle: ConnectionHandle,
        link_type: LinkType,
        role: LinkRole,
        link_error_callback: LinkErrorCallback,
        conn_param_callback: Option<ConnectionParameterUpdateCallback>,
        security_callback: Option<SecurityUpgradeCallback>,
    ) -> Self
    {
        LogicalLink {
            handle,
            link_type,
            role,
            channels: HashMap::new(),
            recombination: None,
            consecutive_malformed: 0,
            next_signalling_id: 1,
            pending_requests: HashMap::new(),
            link_error_callback,
            conn_param_callback,
            security_callback,
            security: SecurityProperties::default(),
            extended_features: None,
            fixed_channels: None,
            next_dynamic_cid: *Self::dynamic_bounds(link_type).start(),
        }
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn get_link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn get_role(&self) -> LinkRole {
        self.role
    }

    pub fn get_security(&self) -> SecurityProperties {
        self.security
    }

    fn dynamic_bounds(link_type: LinkType) -> core::ops::RangeInclusive<u16> {
        match link_type {
            LinkType::Acl => DynChannelId::ACL_BOUNDS,
            LinkType::Le => DynChannelId::LE_BOUNDS,
        }
    }

    /// Allocate a dynamic channel id not in use on this link
    ///
    /// Walks the dynamic range with a rotating cursor so ids aren't reused
    /// immediately after a channel closes. Returns `None` when the whole
    /// range is occupied.
    pub fn allocate_dynamic_cid(&mut self) -> Option<u16> {
        let bounds = Self::dynamic_bounds(self.link_type);

        let span = *bounds.end() - *bounds.start() + 1;

        for _ in 0..span {
            let candidate = self.next_dynamic_cid;

            self.next_dynamic_cid = if candidate == *bounds.end() {
                *bounds.start()
            } else {
                candidate + 1
            };

            if !self.channels.contains_key(&candidate) {
                return Some(candidate);
            }
        }

        None
    }

    /// Whether a remote cid is already the peer endpoint of one of our channels
    pub fn remote_cid_in_use(&self, remote_cid: u16) -> bool {
        self.channels.values().any(|channel| {
            channel.dynamic.is_some() && channel.remote_cid == remote_cid
        })
    }

    /// Allocate an identifier for a locally issued signalling request
    ///
    /// Identifiers are one byte, zero is reserved, and an identifier may not
    /// be reused while a request with it is outstanding.
    pub fn allocate_signalling_id(&mut self) -> u8 {
        loop {
            let candidate = self.next_signalling_id;

            self.next_signalling_id = if candidate == 255 { 1 } else { candidate + 1 };

            if !self.pending_requests.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Whether the extended features of the peer are known (or given up on)
    pub fn features_known(&self) -> bool {
        self.extended_features.is_some()
    }

    /// Whether the peer supports Enhanced Retransmission mode
    pub fn peer_supports_ertm(&self) -> bool {
        self.extended_features
            .map(|features| features.contains(ExtendedFeatures::ENHANCED_RETRANSMISSION))
            .unwrap_or(false)
    }
}
