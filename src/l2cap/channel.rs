//! Channel endpoints handed to the upper layers
//!
//! A [`Channel`] is the user's view of one L2CAP channel. It is a cloneable
//! handle; when the last clone is dropped the channel is deactivated as if
//! [`deactivate`] had been called. A channel whose logical link has gone away
//! stays usable as a handle but reports itself closed and drops everything
//! sent through it.
//!
//! [`Channel`]: struct.Channel.html
//! [`deactivate`]: struct.Channel.html#method.deactivate

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::hci::common::{ConnectionHandle, LinkType};
use crate::hci::HciAclDataInterface;
use crate::Error;

use super::channel_manager::{self, ManagerInner};

/// The mode of a dynamic channel
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ChannelMode {
    Basic,
    EnhancedRetransmission,
}

impl Default for ChannelMode {
    fn default() -> Self {
        ChannelMode::Basic
    }
}

/// Preferences for a dynamic channel, used on both ends of an open
///
/// `None` fields mean "use the default": Basic mode and the default MTU of
/// the link type.
#[derive(Debug,Clone,Copy,Default,PartialEq,Eq)]
pub struct ChannelParameters {
    pub mode: Option<ChannelMode>,
    /// The largest SDU this side is willing to receive on the channel
    pub max_rx_sdu_size: Option<u16>,
}

/// The link security level known to L2CAP
///
/// Security is managed elsewhere (SMP or the BR/EDR security manager), the
/// channel manager only records what it is told and hands it to channel
/// users.
#[derive(Debug,Clone,Copy,PartialEq,Eq,PartialOrd,Ord)]
pub enum SecurityLevel {
    None,
    Encrypted,
    Authenticated,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::None
    }
}

#[derive(Debug,Clone,Copy,Default,PartialEq,Eq)]
pub struct SecurityProperties {
    pub level: SecurityLevel,
}

/// Inbound SDU delivery
pub type RxCallback = Box<dyn FnMut(Vec<u8>)>;

/// Invoked once when the channel is closed from below (link loss or peer
/// disconnection), never by a local deactivate
pub type ClosedCallback = Box<dyn FnOnce()>;

/// Completion of an outbound dynamic channel open
pub type ChannelCallback<I> = Box<dyn FnOnce(Option<Channel<I>>)>;

/// Delivery of inbound dynamic channels for a registered service
pub type ServiceCallback<I> = Box<dyn FnMut(Channel<I>)>;

/// Notification that a channel on the link signalled a fatal link error
pub type LinkErrorCallback = Box<dyn FnMut()>;

/// Acceptance of LE connection parameters requested by the peripheral
pub type ConnectionParameterUpdateCallback =
    Box<dyn FnMut(super::signalling::ConnectionParameterUpdate)>;

/// Request to raise the link security level
///
/// The second argument reports the outcome of the upgrade back to the
/// requesting channel user.
pub type SecurityUpgradeCallback =
    Box<dyn FnMut(SecurityLevel, Box<dyn FnOnce(Result<(), Error>)>)>;

pub(crate) struct ChannelToken<I: HciAclDataInterface> {
    pub(crate) manager: Weak<RefCell<ManagerInner<I>>>,
    pub(crate) handle: ConnectionHandle,
    pub(crate) local_cid: u16,
}

impl<I: HciAclDataInterface> Drop for ChannelToken<I> {
    fn drop(&mut self) {
        channel_manager::deactivate_channel(&self.manager, self.handle, self.local_cid);
    }
}

/// A logical endpoint of one L2CAP channel
///
/// Obtained from the channel manager by opening a fixed channel, opening a
/// dynamic channel, or registering a service. Clones refer to the same
/// channel; dropping the last clone deactivates it.
pub struct Channel<I: HciAclDataInterface> {
    pub(crate) token: Rc<ChannelToken<I>>,
}

impl<I: HciAclDataInterface> Clone for Channel<I> {
    fn clone(&self) -> Self {
        Channel { token: self.token.clone() }
    }
}

impl<I> Channel<I>
where I: HciAclDataInterface,
{
    /// Start delivery of inbound SDUs
    ///
    /// Must be called exactly once. SDUs received before activation were
    /// buffered and are replayed, in order, to `rx_callback` before this
    /// returns. `closed_callback` runs once if the channel is closed from
    /// below (peer disconnection or link loss).
    ///
    /// # Errors
    /// * `InProgress` when the channel was already activated
    /// * `LinkError` when the channel's link is gone
    pub fn activate(
        &self,
        rx_callback: RxCallback,
        closed_callback: ClosedCallback,
    ) -> Result<(), Error>
    {
        channel_manager::activate_channel(&self.token, rx_callback, closed_callback)
    }

    /// Stop the channel
    ///
    /// Idempotent. Drops the callbacks; a dynamic channel additionally
    /// starts the disconnection handshake with the peer. The closed callback
    /// does not run for a local deactivation.
    pub fn deactivate(&self) {
        channel_manager::deactivate_channel(&self.token.manager, self.token.handle, self.token.local_cid);
    }

    /// Send an SDU to the connected device
    ///
    /// The SDU is framed as a B-frame and queued to the ACL data channel.
    /// Returns false if the SDU exceeds the peer's MTU, the channel is not
    /// open, or the link is gone.
    pub fn send(&self, sdu: &[u8]) -> bool {
        channel_manager::channel_send(&self.token, sdu)
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.token.handle
    }

    /// The channel id of this endpoint
    pub fn local_cid(&self) -> u16 {
        self.token.local_cid
    }

    /// The channel id of the peer's endpoint
    ///
    /// Fixed channels use the same id on both ends. `None` when the link is
    /// gone.
    pub fn remote_cid(&self) -> Option<u16> {
        channel_manager::with_channel(&self.token, |state, _| state.remote_cid)
    }

    /// The negotiated mode of the channel
    pub fn get_mode(&self) -> Option<ChannelMode> {
        channel_manager::with_channel(&self.token, |state, _| state.mode)
    }

    /// The largest SDU the peer may send here
    pub fn max_rx_sdu_size(&self) -> Option<u16> {
        channel_manager::with_channel(&self.token, |state, _| state.max_rx_sdu_size)
    }

    /// The largest SDU the peer accepts from us
    pub fn max_tx_sdu_size(&self) -> Option<u16> {
        channel_manager::with_channel(&self.token, |state, _| state.max_tx_sdu_size)
    }

    pub fn get_link_type(&self) -> Option<LinkType> {
        channel_manager::with_channel(&self.token, |_, link| link.get_link_type())
    }

    /// Whether the channel is open and its link is alive
    pub fn is_open(&self) -> bool {
        channel_manager::with_channel(&self.token, |state, _| state.is_open()).unwrap_or(false)
    }

    /// An identifier unique among all channels of this stack instance
    ///
    /// Combines the connection handle and the local channel id.
    pub fn unique_id(&self) -> u32 {
        (self.token.handle.get_raw_handle() as u32) << 16 | self.token.local_cid as u32
    }

    /// Tell the owning link that this channel saw a fatal error
    ///
    /// The link's error callback is invoked, the expected reaction is a
    /// disconnect and `unregister_link`.
    pub fn signal_link_error(&self) {
        channel_manager::signal_link_error(&self.token);
    }

    /// Ask the link to raise its security level
    ///
    /// Forwarded to the security upgrade callback the link was registered
    /// with; `callback` receives the outcome. Fails with `LinkError` when
    /// the link is gone and `NotFound` when no upgrade path was registered.
    pub fn upgrade_security(
        &self,
        level: SecurityLevel,
        callback: Box<dyn FnOnce(Result<(), Error>)>,
    ) {
        channel_manager::upgrade_security(&self.token, level, callback);
    }

    /// The security properties recorded for the link
    pub fn security(&self) -> Option<SecurityProperties> {
        channel_manager::with_channel(&self.token, |_, link| link.get_security())
    }
}
