//! ACL data flow control
//!
//! The controller buffers a fixed number of ACL data packets per transport
//! (BR/EDR and LE may share one pool or have separate ones) and reports the
//! consumed buffers back with the *Number of Completed Packets* event. The
//! [`AclDataChannel`] tracks those budgets, fragments outbound L2CAP PDUs to
//! the controller's maximum data length, and schedules queued traffic across
//! logical links.
//!
//! Scheduling rules:
//!
//! * High priority PDUs (signalling, security) are served before Low priority
//!   ones on the same link.
//! * Within one priority PDUs of a link are sent first-in-first-out.
//! * Links take turns (round robin) at fragment granularity.
//! * The fragments of one PDU are never interleaved with another PDU on the
//!   same link, and a PDU mid transmission finishes before a later High
//!   priority PDU may overtake it.
//!
//! Inbound packets are not buffered here, every received packet is handed to
//! the rx handler as is. Reassembly is L2CAP's business.
//!
//! [`AclDataChannel`]: struct.AclDataChannel.html

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use crate::hci::common::{ConnectionHandle, LinkType};
use crate::hci::events::NumberOfCompletedPacketsData;
use crate::hci::{
    AclBroadcastFlag,
    AclPacketBoundary,
    HciAclData,
    HciAclDataInterface,
};
use crate::Error;

/// The controller data buffer settings for the BR/EDR or LE transport
#[derive(Debug,Clone,Copy,PartialEq,Eq,Default)]
pub struct DataBufferInfo {
    max_data_length: usize,
    max_num_packets: usize,
}

impl DataBufferInfo {
    pub fn new(max_data_length: usize, max_num_packets: usize) -> Self {
        DataBufferInfo { max_data_length, max_num_packets }
    }

    /// The maximum length of the data portion of each HCI ACL data packet
    pub fn get_max_data_length(&self) -> usize {
        self.max_data_length
    }

    /// The total number of HCI ACL data packets the controller can store
    pub fn get_max_num_packets(&self) -> usize {
        self.max_num_packets
    }

    /// A default constructed buffer info means "this buffer does not exist"
    pub fn is_available(&self) -> bool {
        self.max_data_length != 0 && self.max_num_packets != 0
    }
}

/// Priority of a submitted PDU
///
/// High priority traffic (signalling and security) is served before Low
/// priority (user data) whenever both are queued.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum AclPriority {
    High,
    Low,
}

/// An outbound PDU, pre fragmented at submission
struct OutboundPdu {
    /// Caller chosen tag used to drop queued PDUs (the channel manager tags
    /// with the destination channel id)
    tag: Option<u16>,
    fragments: VecDeque<HciAclData>,
}

#[derive(Default)]
struct LinkQueues {
    high: VecDeque<OutboundPdu>,
    low: VecDeque<OutboundPdu>,
    /// A PDU whose first fragment went out, it must finish before anything
    /// else is taken from this link
    current: Option<OutboundPdu>,
}

impl LinkQueues {
    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty() && self.current.is_none()
    }

    /// Whether there is a fragment ready to be sent
    fn has_ready_fragment(&self) -> bool {
        !self.is_empty()
    }
}

/// The number of packets of one link sitting in the controller's buffer
struct PendingPacketData {
    link_type: LinkType,
    count: usize,
}

struct AclDataChannelInner<I> {
    interface: I,
    bredr_buffer_info: DataBufferInfo,
    le_buffer_info: DataBufferInfo,
    initialized: bool,
    /// Packets sent to the controller and not yet completed, per transport.
    /// LE counts against the BR/EDR counter when the controller has no
    /// dedicated LE buffer.
    bredr_sent_packets: usize,
    le_sent_packets: usize,
    pending_links: HashMap<u16, PendingPacketData>,
    /// Link type hints from `register_link`
    registered_links: HashMap<u16, LinkType>,
    send_queues: BTreeMap<u16, LinkQueues>,
    /// The raw handle served last, the scheduler continues after it
    round_robin_cursor: u16,
    rx_callback: Option<Box<dyn FnMut(HciAclData)>>,
    transport_error_callback: Option<Box<dyn FnMut()>>,
}

/// The HCI ACL data channel
///
/// An `AclDataChannel` is a cheap handle, clones share the same channel
/// state. All methods must be called from the single thread the core runs
/// on.
pub struct AclDataChannel<I> {
    inner: Rc<RefCell<AclDataChannelInner<I>>>,
}

impl<I> Clone for AclDataChannel<I> {
    fn clone(&self) -> Self {
        AclDataChannel { inner: self.inner.clone() }
    }
}

impl<I> AclDataChannel<I>
where I: HciAclDataInterface,
{
    pub fn new(interface: I) -> Self {
        AclDataChannel {
            inner: Rc::new(RefCell::new( AclDataChannelInner {
                interface,
                bredr_buffer_info: DataBufferInfo::default(),
                le_buffer_info: DataBufferInfo::default(),
                initialized: false,
                bredr_sent_packets: 0,
                le_sent_packets: 0,
                pending_links: HashMap::new(),
                registered_links: HashMap::new(),
                send_queues: BTreeMap::new(),
                round_robin_cursor: 0,
                rx_callback: None,
                transport_error_callback: None,
            })),
        }
    }

    /// Configure the channel with the controller's buffer capacities
    ///
    /// At least one of the two buffers must be available. An unavailable
    /// `le` buffer means the controller shares its BR/EDR buffer with the LE
    /// transport.
    ///
    /// # Error
    /// Both buffer infos were empty.
    pub fn configure(&self, bredr: DataBufferInfo, le: DataBufferInfo) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if !bredr.is_available() && !le.is_available() {
            return Err( Error::InvalidParameters );
        }

        inner.bredr_buffer_info = bredr;
        inner.le_buffer_info = le;
        inner.initialized = true;

        Ok(())
    }

    /// The BR/EDR buffer information the channel was configured with
    pub fn get_buffer_info(&self) -> DataBufferInfo {
        self.inner.borrow().bredr_buffer_info
    }

    /// The LE buffer information the channel was configured with
    ///
    /// This is the BR/EDR buffer when the controller has no dedicated LE
    /// buffer.
    pub fn get_le_buffer_info(&self) -> DataBufferInfo {
        let inner = self.inner.borrow();

        if inner.le_buffer_info.is_available() {
            inner.le_buffer_info
        } else {
            inner.bredr_buffer_info
        }
    }

    /// Register a logical link
    ///
    /// Registration is a hint that records the transport type of the link so
    /// its packets are counted against the right buffer. Sending works
    /// without it (packets then charge the BR/EDR pool when it exists).
    pub fn register_link(&self, handle: ConnectionHandle, link_type: LinkType) {
        self.inner.borrow_mut().registered_links.insert(handle.get_raw_handle(), link_type);
    }

    /// Unregister a logical link
    ///
    /// Drops every queued outbound packet of the link and forgets the
    /// controller's outstanding packet count for it. The controller will not
    /// report Number of Completed Packets for a dead link, so the count must
    /// be reclaimed here or the budget leaks.
    pub fn unregister_link(&self, handle: ConnectionHandle) {
        let send_failed = {
            let mut inner = self.inner.borrow_mut();

            inner.registered_links.remove(&handle.get_raw_handle());

            inner.clear_link_state(handle);

            inner.try_send_queued()
        };

        if send_failed { self.notify_transport_error() }
    }

    /// Like [`unregister_link`](#method.unregister_link) but keeps the link type hint
    pub fn clear_link_state(&self, handle: ConnectionHandle) {
        let send_failed = {
            let mut inner = self.inner.borrow_mut();

            inner.clear_link_state(handle);

            inner.try_send_queued()
        };

        if send_failed { self.notify_transport_error() }
    }

    /// Queue an ordered list of L2CAP PDUs for one logical link
    ///
    /// The whole list is queued atomically. Each PDU is fragmented to the
    /// transport's maximum data length; the first fragment of a PDU carries
    /// the "first non-flushable" boundary flag and the rest carry
    /// "continuing".
    ///
    /// `tag` is an opaque caller value that can later be matched by
    /// [`drop_queued`](#method.drop_queued) (the L2CAP layer tags PDUs with
    /// their destination channel id).
    ///
    /// Returns false if the channel is not configured, the list is empty, or
    /// a PDU cannot be represented in ACL data packets.
    pub fn send_packets(
        &self,
        handle: ConnectionHandle,
        tag: Option<u16>,
        pdus: Vec<Box<[u8]>>,
        priority: AclPriority,
    ) -> bool
    {
        let send_failed = {
            let mut inner = self.inner.borrow_mut();

            if !inner.initialized || pdus.is_empty() {
                return false;
            }

            let max_data_length = inner.max_data_length_for(handle);

            if max_data_length == 0 {
                return false;
            }

            if pdus.iter().any(|pdu| pdu.is_empty() || pdu.len() > u16::max_value() as usize) {
                return false;
            }

            for pdu in pdus {
                let mut fragments = VecDeque::new();

                let mut boundary = AclPacketBoundary::FirstNonFlushable;

                for chunk in pdu.chunks(max_data_length) {
                    fragments.push_back( HciAclData::new(
                        handle,
                        boundary,
                        AclBroadcastFlag::NoBroadcast,
                        Box::from(chunk),
                    ));

                    boundary = AclPacketBoundary::ContinuingFragment;
                }

                let queues = inner.send_queues.entry(handle.get_raw_handle()).or_default();

                let pdu = OutboundPdu { tag, fragments };

                match priority {
                    AclPriority::High => queues.high.push_back(pdu),
                    AclPriority::Low => queues.low.push_back(pdu),
                }
            }

            inner.try_send_queued()
        };

        if send_failed { self.notify_transport_error() }

        true
    }

    /// Drop queued PDUs of a link whose tag matches
    ///
    /// A PDU that is mid transmission is not dropped, its remaining
    /// fragments still go out (aborting it would desynchronize the peer's
    /// recombination).
    pub fn drop_queued(&self, handle: ConnectionHandle, tag: u16) {
        let mut inner = self.inner.borrow_mut();

        if let Some(queues) = inner.send_queues.get_mut(&handle.get_raw_handle()) {
            queues.high.retain(|pdu| pdu.tag != Some(tag));
            queues.low.retain(|pdu| pdu.tag != Some(tag));
        }
    }

    /// Set the handler invoked once per inbound ACL data packet
    pub fn set_rx_handler(&self, callback: Box<dyn FnMut(HciAclData)>) {
        self.inner.borrow_mut().rx_callback = Some(callback);
    }

    /// Set the callback fired when a write to the ACL interface fails
    pub fn set_transport_error_callback(&self, callback: Box<dyn FnMut()>) {
        self.inner.borrow_mut().transport_error_callback = Some(callback);
    }

    /// Process an ACL data packet received from the controller
    ///
    /// The packet is handed to the rx handler unchanged, nothing is buffered
    /// here.
    pub fn receive_packet(&self, packet: HciAclData) {
        let callback = self.inner.borrow_mut().rx_callback.take();

        match callback {
            Some(mut callback) => {
                callback(packet);

                let mut inner = self.inner.borrow_mut();

                if inner.rx_callback.is_none() {
                    inner.rx_callback = Some(callback);
                }
            },
            None => log::warn!(
                "Dropping inbound ACL data packet for handle {}, no rx handler",
                packet.get_handle()
            ),
        }
    }

    /// Credit back completed packets reported by the controller
    ///
    /// Called with the parsed entries of a Number of Completed Packets
    /// event. Counts for handles this channel never sent on are ignored.
    pub fn handle_completed_packets(&self, completed: &[NumberOfCompletedPacketsData]) {
        let send_failed = {
            let mut inner = self.inner.borrow_mut();

            for entry in completed {
                let raw_handle = entry.connection_handle.get_raw_handle();
                let count = entry.number_of_completed_packets as usize;

                match inner.pending_links.get_mut(&raw_handle) {
                    Some(pending) => {
                        if count > pending.count {
                            log::warn!(
                                "Controller reported {} completed packets for handle {} but only \
                                {} are outstanding",
                                count,
                                entry.connection_handle,
                                pending.count
                            );
                        }

                        let credited = core::cmp::min(count, pending.count);

                        pending.count -= credited;

                        let link_type = pending.link_type;

                        if pending.count == 0 {
                            inner.pending_links.remove(&raw_handle);
                        }

                        inner.decrement_sent_count(link_type, credited);
                    },
                    None => log::warn!(
                        "Ignoring completed packets for unknown handle {}",
                        entry.connection_handle
                    ),
                }
            }

            inner.try_send_queued()
        };

        if send_failed { self.notify_transport_error() }
    }

    fn notify_transport_error(&self) {
        let callback = self.inner.borrow_mut().transport_error_callback.take();

        if let Some(mut callback) = callback {
            callback();

            let mut inner = self.inner.borrow_mut();

            if inner.transport_error_callback.is_none() {
                inner.transport_error_callback = Some(callback);
            }
        }
    }
}

impl<I> AclDataChannelInner<I>
where I: HciAclDataInterface,
{
    /// The transport whose buffer a link's packets charge
    fn transport_for(&self, raw_handle: u16) -> LinkType {
        match self.registered_links.get(&raw_handle) {
            Some(LinkType::Le) if self.le_buffer_info.is_available() => LinkType::Le,
            // either a BR/EDR link or an LE link sharing the BR/EDR pool
            Some(_) => LinkType::Acl,
            None => {
                if self.bredr_buffer_info.is_available() {
                    LinkType::Acl
                } else {
                    LinkType::Le
                }
            },
        }
    }

    fn max_data_length_for(&self, handle: ConnectionHandle) -> usize {
        match self.transport_for(handle.get_raw_handle()) {
            LinkType::Le => self.le_buffer_info.get_max_data_length(),
            LinkType::Acl => self.bredr_buffer_info.get_max_data_length(),
        }
    }

    fn has_free_space(&self, transport: LinkType) -> bool {
        match transport {
            LinkType::Le => self.le_sent_packets < self.le_buffer_info.get_max_num_packets(),
            LinkType::Acl => self.bredr_sent_packets < self.bredr_buffer_info.get_max_num_packets(),
        }
    }

    fn increment_sent_count(&mut self, transport: LinkType) {
        match transport {
            LinkType::Le => self.le_sent_packets += 1,
            LinkType::Acl => self.bredr_sent_packets += 1,
        }
    }

    fn decrement_sent_count(&mut self, transport: LinkType, count: usize) {
        match transport {
            LinkType::Le => {
                self.le_sent_packets = self.le_sent_packets.saturating_sub(count)
            },
            LinkType::Acl => {
                self.bredr_sent_packets = self.bredr_sent_packets.saturating_sub(count)
            },
        }
    }

    fn clear_link_state(&mut self, handle: ConnectionHandle) {
        let raw_handle = handle.get_raw_handle();

        self.send_queues.remove(&raw_handle);

        if let Some(pending) = self.pending_links.remove(&raw_handle) {
            self.decrement_sent_count(pending.link_type, pending.count);
        }
    }

    /// Send queued fragments for as long as buffer space is available
    ///
    /// Links are visited round robin starting after the last served handle.
    /// Returns true if a write to the interface failed.
    fn try_send_queued(&mut self) -> bool {
        let mut send_failed = false;

        loop {
            let mut handles: Vec<u16> = self.send_queues.iter()
                .filter(|(_, queues)| queues.has_ready_fragment())
                .map(|(&handle, _)| handle)
                .collect();

            if handles.is_empty() {
                break;
            }

            // continue the rotation after the cursor
            let cursor = self.round_robin_cursor;

            handles.sort_unstable_by_key(|&handle| (handle <= cursor, handle));

            let mut sent_any = false;

            for raw_handle in handles {
                let transport = self.transport_for(raw_handle);

                if !self.has_free_space(transport) {
                    continue;
                }

                let fragment = match self.take_next_fragment(raw_handle) {
                    Some(fragment) => fragment,
                    None => continue,
                };

                if let Err(e) = self.interface.send_acl_data(&fragment.into_packet()) {
                    // the controller buffer slot is charged regardless so the
                    // budget stays consistent with what was attempted
                    log::error!("Failed to send ACL data packet: {}", e);

                    send_failed = true;
                }

                self.increment_sent_count(transport);

                self.pending_links.entry(raw_handle)
                    .or_insert( PendingPacketData { link_type: transport, count: 0 } )
                    .count += 1;

                self.round_robin_cursor = raw_handle;

                sent_any = true;
            }

            if !sent_any {
                break;
            }
        }

        send_failed
    }

    /// Take the next fragment of a link honoring PDU contiguity and priority
    fn take_next_fragment(&mut self, raw_handle: u16) -> Option<HciAclData> {
        let queues = self.send_queues.get_mut(&raw_handle)?;

        if queues.current.is_none() {
            queues.current = queues.high.pop_front().or_else(|| queues.low.pop_front());
        }

        let fragment = queues.current.as_mut()?.fragments.pop_front();

        if queues.current.as_ref().map(|pdu| pdu.fragments.is_empty()).unwrap_or(false) {
            queues.current = None;
        }

        if queues.is_empty() {
            self.send_queues.remove(&raw_handle);
        }

        fragment
    }
}
