//! A host side Bluetooth stack core
//!
//! This library implements the three subsystems that turn a raw byte pipe to
//! a Bluetooth controller into typed, flow controlled channels for the upper
//! protocol layers (ATT, SMP, SDP, RFCOMM):
//!
//! * the HCI command channel, which paces commands to the controller's
//!   command pipeline and matches response events back to them,
//! * the HCI ACL data channel, which fragments outbound L2CAP PDUs and
//!   enforces the controller's packet buffer budgets, and
//! * the L2CAP channel manager, which owns the logical links, reassembles
//!   B-frames, runs the signalling protocol for dynamic channels and hands
//!   out [`Channel`] endpoints.
//!
//! The whole core is single threaded and cooperatively scheduled. Every
//! public method must be called from one thread, every callback is invoked on
//! it, and there are no internal locks. The transport driver feeds inbound
//! bytes in with [`Transport::on_event`] and [`Transport::on_acl_data`] and
//! drives timeouts by polling `next_timeout()` / calling `run_timers(now)` on
//! the transport and the channel manager.
//!
//! [`Channel`]: l2cap/channel/struct.Channel.html
//! [`Transport::on_event`]: hci/struct.Transport.html#method.on_event
//! [`Transport::on_acl_data`]: hci/struct.Transport.html#method.on_acl_data

pub mod hci;
pub mod l2cap;

mod timer;

use core::fmt;

/// The errors surfaced to users of the stack
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum Error {
    /// Unknown handle, channel id or unregistered service
    NotFound,
    /// Malformed arguments, a reserved identifier or an oversized payload
    InvalidParameters,
    /// The operation collides with one already outstanding
    InProgress,
    /// The underlying link closed while the operation was in flight
    LinkError,
    /// A command, signalling exchange or configuration handshake did not
    /// complete in time
    Timeout,
    /// The controller or the peer answered with the contained non success
    /// status code
    Protocol(u8),
    /// Inbound data was not understood
    Malformed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NotFound => write!(f, "Not found"),
            Error::InvalidParameters => write!(f, "Invalid parameters"),
            Error::InProgress => write!(f, "Already in progress"),
            Error::LinkError => write!(f, "The logical link failed"),
            Error::Timeout => write!(f, "Timed out"),
            Error::Protocol(status) => write!(f, "Protocol error status {:#04X}", status),
            Error::Malformed => write!(f, "Malformed packet"),
        }
    }
}

impl std::error::Error for Error {}
