//! The L2CAP channel manager
//!
//! One [`ChannelManager`] exists per ACL data channel. It routes every
//! inbound ACL packet to the logical link it belongs to, recombines
//! fragmented PDUs, runs the signalling protocol of each link, and owns the
//! lifetime of every channel. Packets for a handle that has no registered
//! link yet are held back until the link is registered.
//!
//! All state is kept behind one `RefCell`; user callbacks are only ever
//! invoked after the borrow is released, so a callback may call straight
//! back into the manager (closing a channel from its own closed callback is
//! fine).
//!
//! [`ChannelManager`]: struct.ChannelManager.html

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::hci::acl_data_channel::{AclDataChannel, AclPriority};
use crate::hci::common::{ConnectionHandle, LinkRole, LinkType};
use crate::hci::{HciAclData, HciAclDataInterface};
use crate::timer::DeadlineQueue;
use crate::Error;

use super::channel::{
    Channel,
    ChannelCallback,
    ChannelMode,
    ChannelParameters,
    ChannelToken,
    ClosedCallback,
    ConnectionParameterUpdateCallback,
    LinkErrorCallback,
    RxCallback,
    SecurityLevel,
    SecurityProperties,
    SecurityUpgradeCallback,
    ServiceCallback,
};
use super::link::{
    local_extended_features,
    local_fixed_channels,
    ChannelState,
    DynamicChannelState,
    ExtendedFeatures,
    FixedChannelsSupported,
    LogicalLink,
    PduRecombination,
    PendingSignallingRequest,
    RequestKind,
    DISCONNECT_TIMEOUT,
    MAX_CONSECUTIVE_MALFORMED,
    RTX_INITIAL,
    RTX_MAX,
    RTX_TOTAL,
};
use super::signalling::{
    self,
    ConfigOption,
    ConfigurationRequestData,
    ConfigurationResponseData,
    ConfigurationResult,
    ConnectionParameterUpdate,
    ConnectionRequestData,
    ConnectionResponseData,
    ConnectionResult,
    DisconnectionData,
    InformationRequestData,
    InformationResponseData,
    InformationType,
    RejectReason,
    RetransmissionAndFlowControl,
    SignallingCode,
    CONN_PARAM_RESULT_ACCEPTED,
    CONN_PARAM_RESULT_REJECTED,
    INFORMATION_RESULT_NOT_SUPPORTED,
    INFORMATION_RESULT_SUCCESS,
};
use super::{
    make_basic_frame,
    parse_basic_header,
    AclUChannelIdentifier,
    ChannelIdentifier,
    LeUChannelIdentifier,
    Psm,
    BASIC_HEADER_SIZE,
    DEFAULT_MTU,
    MINIMUM_ACL_MTU,
};

#[derive(Debug,Clone,Copy)]
enum TimerToken {
    Signalling { raw_handle: u16, identifier: u8 },
}

/// A user callback collected while the manager state was borrowed, run after
/// the borrow is released
enum Action<I: HciAclDataInterface> {
    Rx { raw_handle: u16, cid: u16, sdu: Vec<u8> },
    OpenResult { callback: ChannelCallback<I>, handle: ConnectionHandle, cid: u16, success: bool },
    NewInboundChannel { psm: u16, handle: ConnectionHandle, cid: u16 },
    Closed { callback: ClosedCallback },
    LinkError { raw_handle: u16 },
    ConnParam { raw_handle: u16, update: ConnectionParameterUpdate },
}

struct ServiceRegistration<I: HciAclDataInterface> {
    params: ChannelParameters,
    callback: Option<ServiceCallback<I>>,
}

pub(crate) struct ManagerInner<I: HciAclDataInterface> {
    pub(crate) weak_self: Weak<RefCell<ManagerInner<I>>>,
    acl: AclDataChannel<I>,
    links: HashMap<u16, LogicalLink>,
    /// Packets received before their link was registered
    pending_packets: HashMap<u16, VecDeque<HciAclData>>,
    services: HashMap<u16, ServiceRegistration<I>>,
    /// Open callbacks of outbound dynamic channels, keyed by (handle, local cid)
    pending_opens: HashMap<(u16, u16), ChannelCallback<I>>,
    timers: DeadlineQueue<TimerToken>,
}

/// The L2CAP channel multiplexer over one ACL data channel
pub struct ChannelManager<I: HciAclDataInterface> {
    inner: Rc<RefCell<ManagerInner<I>>>,
}

impl<I> ChannelManager<I>
where I: HciAclDataInterface + 'static,
{
    pub fn new(acl: AclDataChannel<I>) -> Self {
        let inner = Rc::new(RefCell::new( ManagerInner {
            weak_self: Weak::new(),
            acl: acl.clone(),
            links: HashMap::new(),
            pending_packets: HashMap::new(),
            services: HashMap::new(),
            pending_opens: HashMap::new(),
            timers: DeadlineQueue::new(),
        }));

        inner.borrow_mut().weak_self = Rc::downgrade(&inner);

        let weak = Rc::downgrade(&inner);

        acl.set_rx_handler( Box::new( move |packet| {
            if let Some(inner) = weak.upgrade() {
                let actions = inner.borrow_mut().process_inbound(packet);

                run_actions(&inner, actions);
            }
        }));

        ChannelManager { inner }
    }

    /// Register a BR/EDR connection
    ///
    /// Channels can be opened on the link once this returns. The manager
    /// immediately asks the peer for its extended features and supported
    /// fixed channels on the signalling channel; until those answers arrive
    /// dynamic channels that want optional modes stay in configuration.
    pub fn register_acl_link(
        &self,
        handle: ConnectionHandle,
        role: LinkRole,
        link_error_callback: LinkErrorCallback,
        security_callback: Option<SecurityUpgradeCallback>,
    ) {
        let actions = {
            let mut inner = self.inner.borrow_mut();

            let raw_handle = handle.get_raw_handle();

            if inner.links.contains_key(&raw_handle) {
                log::error!("Handle {} is already registered", handle);
                return;
            }

            inner.links.insert(
                raw_handle,
                LogicalLink::new(handle, LinkType::Acl, role, link_error_callback, None, security_callback),
            );

            inner.acl.register_link(handle, LinkType::Acl);

            inner.send_information_request(raw_handle, InformationType::ExtendedFeatures);
            inner.send_information_request(raw_handle, InformationType::FixedChannels);

            inner.flush_pending_packets(raw_handle)
        };

        run_actions(&self.inner, actions);
    }

    /// Register an LE connection
    ///
    /// `conn_param_callback` is invoked when, as the central, a connection
    /// parameter update request of the peripheral was accepted.
    pub fn register_le_link(
        &self,
        handle: ConnectionHandle,
        role: LinkRole,
        conn_param_callback: ConnectionParameterUpdateCallback,
        link_error_callback: LinkErrorCallback,
        security_callback: Option<SecurityUpgradeCallback>,
    ) {
        let actions = {
            let mut inner = self.inner.borrow_mut();

            let raw_handle = handle.get_raw_handle();

            if inner.links.contains_key(&raw_handle) {
                log::error!("Handle {} is already registered", handle);
                return;
            }

            inner.links.insert(
                raw_handle,
                LogicalLink::new(
                    handle,
                    LinkType::Le,
                    role,
                    link_error_callback,
                    Some(conn_param_callback),
                    security_callback,
                ),
            );

            inner.acl.register_link(handle, LinkType::Le);

            inner.flush_pending_packets(raw_handle)
        };

        run_actions(&self.inner, actions);
    }

    /// Remove a registered connection
    ///
    /// Every channel of the link runs its closed callback, dynamic channel
    /// operations in flight fail their callers, and queued outbound data of
    /// the link is dropped.
    pub fn unregister_link(&self, handle: ConnectionHandle) {
        let actions = {
            let mut inner = self.inner.borrow_mut();

            inner.unregister_link(handle)
        };

        run_actions(&self.inner, actions);
    }

    /// Record the security properties of a link
    ///
    /// No effect if the handle is not registered.
    pub fn assign_link_security(&self, handle: ConnectionHandle, security: SecurityProperties) {
        if let Some(link) = self.inner.borrow_mut().links.get_mut(&handle.get_raw_handle()) {
            link.security = security;
        }
    }

    /// Open a fixed channel of the link
    ///
    /// Returns `None` when the link is not registered, the channel id does
    /// not name a fixed channel of the link's type, or the channel is
    /// already open.
    pub fn open_fixed_channel(
        &self,
        handle: ConnectionHandle,
        channel_id: ChannelIdentifier,
    ) -> Option<Channel<I>> {
        let mut inner = self.inner.borrow_mut();

        let raw_handle = handle.get_raw_handle();

        let link = inner.links.get_mut(&raw_handle)?;

        let valid = match (link.get_link_type(), channel_id) {
            (LinkType::Acl, ChannelIdentifier::Acl(AclUChannelIdentifier::SecurityManagerProtocol)) => true,
            (LinkType::Le, ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol)) => true,
            (LinkType::Le, ChannelIdentifier::Le(LeUChannelIdentifier::SecurityManagerProtocol)) => true,
            _ => false,
        };

        if !valid {
            return None;
        }

        let cid = channel_id.to_val();

        if link.channels.contains_key(&cid) {
            return None;
        }

        link.channels.insert(cid, ChannelState::new_fixed(cid, DEFAULT_MTU));

        let weak = inner.weak_self.clone();

        Some( make_channel(weak, handle, cid) )
    }

    /// Open an outbound dynamic channel
    ///
    /// Sends a Connection Request for `psm` and runs the configuration
    /// handshake. `callback` receives the open channel, or `None` when the
    /// peer refused, a timeout hit, or the arguments were invalid.
    pub fn open_channel(
        &self,
        handle: ConnectionHandle,
        psm: u16,
        params: ChannelParameters,
        callback: ChannelCallback<I>,
    ) {
        let actions = {
            let mut inner = self.inner.borrow_mut();

            inner.open_channel(handle, psm, params, callback)
        };

        run_actions(&self.inner, actions);
    }

    /// Register a listener for inbound dynamic channels on a PSM
    ///
    /// Returns false when the PSM violates the encoding rules or is already
    /// taken.
    pub fn register_service(
        &self,
        psm: u16,
        params: ChannelParameters,
        callback: ServiceCallback<I>,
    ) -> bool {
        let mut inner = self.inner.borrow_mut();

        if Psm::new(psm).is_err() {
            log::warn!("Refusing service registration for invalid PSM {:#06X}", psm);
            return false;
        }

        if inner.services.contains_key(&psm) {
            return false;
        }

        inner.services.insert(psm, ServiceRegistration { params, callback: Some(callback) });

        true
    }

    /// Remove a PSM listener
    ///
    /// Channels already handed out stay alive.
    pub fn unregister_service(&self, psm: u16) {
        self.inner.borrow_mut().services.remove(&psm);
    }

    /// The next instant a signalling timer is due
    pub fn next_timeout(&self) -> Option<Instant> {
        self.inner.borrow().timers.next_deadline()
    }

    /// Fire every signalling timer that is due at `now`
    pub fn run_timers(&self, now: Instant) {
        loop {
            let actions = {
                let mut inner = self.inner.borrow_mut();

                match inner.timers.pop_expired(now) {
                    Some((_, TimerToken::Signalling { raw_handle, identifier })) =>
                        inner.on_signalling_timeout(raw_handle, identifier, now),
                    None => break,
                }
            };

            run_actions(&self.inner, actions);
        }
    }
}

impl<I> Drop for ChannelManager<I>
where I: HciAclDataInterface,
{
    fn drop(&mut self) {
        // every channel user observes closure when the manager goes away
        let handles: Vec<ConnectionHandle> = self.inner.borrow().links.values()
            .map(|link| link.get_handle())
            .collect();

        for handle in handles {
            let actions = self.inner.borrow_mut().unregister_link(handle);

            run_actions(&self.inner, actions);
        }
    }
}

impl<I> ManagerInner<I>
where I: HciAclDataInterface,
{
    fn signalling_cid(link_type: LinkType) -> u16 {
        ChannelIdentifier::signalling_channel(link_type).to_val()
    }

    fn send_signalling_packet(&mut self, raw_handle: u16, bytes: &[u8]) {
        let (handle, link_type) = match self.links.get(&raw_handle) {
            Some(link) => (link.get_handle(), link.get_link_type()),
            None => return,
        };

        let cid = Self::signalling_cid(link_type);

        let frame = make_basic_frame(cid, bytes);

        self.acl.send_packets(handle, Some(cid), vec![frame], AclPriority::High);
    }

    /// Send a response or reject (nothing to retransmit, no bookkeeping)
    fn send_signalling_response(&mut self, raw_handle: u16, code: SignallingCode, identifier: u8, payload: &[u8]) {
        let bytes = signalling::make_command(code, identifier, payload);

        self.send_signalling_packet(raw_handle, &bytes);
    }

    fn send_reject(&mut self, raw_handle: u16, identifier: u8, reason: RejectReason) {
        self.send_signalling_response(
            raw_handle,
            SignallingCode::CommandReject,
            identifier,
            &reason.encode(),
        );
    }

    /// Send a request, arming its response timer
    fn send_signalling_request(&mut self, raw_handle: u16, kind: RequestKind, code: SignallingCode, payload: &[u8]) {
        let identifier = match self.links.get_mut(&raw_handle) {
            Some(link) => link.allocate_signalling_id(),
            None => return,
        };

        let bytes = signalling::make_command(code, identifier, payload);

        let interval = match kind {
            RequestKind::Disconnection { .. } => DISCONNECT_TIMEOUT,
            _ => RTX_INITIAL,
        };

        let timer = self.timers.add(
            Instant::now() + interval,
            TimerToken::Signalling { raw_handle, identifier },
        );

        if let Some(link) = self.links.get_mut(&raw_handle) {
            link.pending_requests.insert(identifier, PendingSignallingRequest {
                kind,
                packet: bytes.clone(),
                timer,
                interval,
                elapsed: std::time::Duration::from_secs(0),
            });
        }

        self.send_signalling_packet(raw_handle, &bytes);
    }

    fn send_information_request(&mut self, raw_handle: u16, info_type: InformationType) {
        self.send_signalling_request(
            raw_handle,
            RequestKind::Information { info_type },
            SignallingCode::InformationRequest,
            &InformationRequestData { info_type }.encode(),
        );
    }

    fn flush_pending_packets(&mut self, raw_handle: u16) -> Vec<Action<I>> {
        let mut actions = Vec::new();

        if let Some(packets) = self.pending_packets.remove(&raw_handle) {
            for packet in packets {
                actions.extend( self.process_link_packet(raw_handle, packet) );
            }
        }

        actions
    }

    fn unregister_link(&mut self, handle: ConnectionHandle) -> Vec<Action<I>> {
        let raw_handle = handle.get_raw_handle();

        self.pending_packets.remove(&raw_handle);

        let mut link = match self.links.remove(&raw_handle) {
            Some(link) => link,
            None => {
                log::debug!("Unregister for unknown handle {}", handle);
                return Vec::new();
            },
        };

        for request in link.pending_requests.values() {
            self.timers.remove(request.timer);
        }

        let mut actions = Vec::new();

        for (cid, mut channel) in link.channels.drain() {
            if let Some(callback) = channel.closed_callback.take() {
                actions.push( Action::Closed { callback } );
            }

            if let Some(callback) = self.pending_opens.remove(&(raw_handle, cid)) {
                actions.push( Action::OpenResult { callback, handle, cid, success: false } );
            }
        }

        self.acl.unregister_link(handle);

        actions
    }

    fn open_channel(
        &mut self,
        handle: ConnectionHandle,
        psm: u16,
        params: ChannelParameters,
        callback: ChannelCallback<I>,
    ) -> Vec<Action<I>> {
        let raw_handle = handle.get_raw_handle();

        let fail = |callback| vec![ Action::OpenResult { callback, handle, cid: 0, success: false } ];

        if Psm::new(psm).is_err() {
            log::warn!("Refusing channel open for invalid PSM {:#06X}", psm);
            return fail(callback);
        }

        let local_cid = match self.links.get_mut(&raw_handle) {
            Some(link) if link.get_link_type() == LinkType::Acl => {
                match link.allocate_dynamic_cid() {
                    Some(cid) => cid,
                    None => return fail(callback),
                }
            },
            _ => return fail(callback),
        };

        let max_rx = params.max_rx_sdu_size.unwrap_or(DEFAULT_MTU).max(MINIMUM_ACL_MTU);

        if let Some(link) = self.links.get_mut(&raw_handle) {
            link.channels.insert(local_cid, ChannelState::new_dynamic(
                local_cid,
                psm,
                true,
                params.mode,
                max_rx,
                DynamicChannelState::WaitingConnectionResponse,
            ));
        }

        self.pending_opens.insert((raw_handle, local_cid), callback);

        self.send_signalling_request(
            raw_handle,
            RequestKind::Connection { local_cid },
            SignallingCode::ConnectionRequest,
            &ConnectionRequestData { psm, source_cid: local_cid }.encode(),
        );

        Vec::new()
    }

    /// Route one inbound ACL packet
    fn process_inbound(&mut self, packet: HciAclData) -> Vec<Action<I>> {
        let raw_handle = packet.get_handle().get_raw_handle();

        if !self.links.contains_key(&raw_handle) {
            log::debug!("Holding packet for unregistered handle {:#05X}", raw_handle);

            self.pending_packets.entry(raw_handle).or_insert_with(VecDeque::new).push_back(packet);

            return Vec::new();
        }

        self.process_link_packet(raw_handle, packet)
    }

    /// Recombine and dispatch a packet of a registered link
    fn process_link_packet(&mut self, raw_handle: u16, packet: HciAclData) -> Vec<Action<I>> {
        let mut actions = Vec::new();

        let mut malformed = false;

        let completed: Option<(u16, Vec<u8>)> = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return actions,
            };

            let payload = packet.get_payload();

            if packet.get_packet_boundary_flag().is_start() {
                if link.recombination.take().is_some() {
                    // a new frame started before the previous one finished
                    log::warn!("Discarding incomplete PDU recombination on handle {:#05X}", raw_handle);
                    malformed = true;
                }

                match parse_basic_header(payload) {
                    None => {
                        log::warn!("Dropping short PDU fragment on handle {:#05X}", raw_handle);
                        malformed = true;
                        None
                    },
                    Some((declared_length, cid)) => {
                        let declared_length = declared_length as usize;

                        let cap = link.channels.get(&cid)
                            .map(|channel| channel.max_rx_sdu_size)
                            .unwrap_or(DEFAULT_MTU) as usize;

                        let body = &payload[BASIC_HEADER_SIZE..];

                        if declared_length > cap {
                            log::warn!(
                                "Dropping PDU for channel {:#06X} that exceeds its MTU ({} > {})",
                                cid,
                                declared_length,
                                cap
                            );
                            malformed = true;
                            None
                        } else if body.len() == declared_length {
                            Some((cid, body.to_vec()))
                        } else if body.len() < declared_length {
                            link.recombination = Some( PduRecombination {
                                cid,
                                declared_length,
                                buffer: body.to_vec(),
                            });
                            None
                        } else {
                            log::warn!("Dropping over-long PDU on handle {:#05X}", raw_handle);
                            malformed = true;
                            None
                        }
                    },
                }
            } else {
                match link.recombination.as_mut() {
                    None => {
                        log::warn!("Dropping continuation with no PDU in flight on handle {:#05X}", raw_handle);
                        malformed = true;
                        None
                    },
                    Some(recombination) => {
                        recombination.buffer.extend_from_slice(payload);

                        if recombination.buffer.len() == recombination.declared_length {
                            link.recombination.take().map(|r| (r.cid, r.buffer))
                        } else if recombination.buffer.len() > recombination.declared_length {
                            log::warn!("Dropping over-long recombined PDU on handle {:#05X}", raw_handle);
                            link.recombination = None;
                            malformed = true;
                            None
                        } else {
                            None
                        }
                    },
                }
            }
        };

        if malformed {
            if let Some(link) = self.links.get_mut(&raw_handle) {
                link.consecutive_malformed += 1;

                if link.consecutive_malformed >= MAX_CONSECUTIVE_MALFORMED {
                    link.consecutive_malformed = 0;

                    actions.push( Action::LinkError { raw_handle } );
                }
            }
        }

        if let Some((cid, sdu)) = completed {
            if let Some(link) = self.links.get_mut(&raw_handle) {
                link.consecutive_malformed = 0;
            }

            self.deliver(raw_handle, cid, sdu, &mut actions);
        }

        actions
    }

    /// Hand a recombined PDU to its channel or the signalling handler
    fn deliver(&mut self, raw_handle: u16, cid: u16, sdu: Vec<u8>, actions: &mut Vec<Action<I>>) {
        let link_type = match self.links.get(&raw_handle) {
            Some(link) => link.get_link_type(),
            None => return,
        };

        if cid == Self::signalling_cid(link_type) {
            self.handle_signalling(raw_handle, &sdu, actions);
            return;
        }

        let link = match self.links.get_mut(&raw_handle) {
            Some(link) => link,
            None => return,
        };

        match link.channels.get_mut(&cid) {
            Some(channel) if channel.discards_inbound() || channel.deactivated => {
                log::debug!("Discarding PDU for closing channel {:#06X}", cid);
            },
            Some(channel) if !channel.is_open() => {
                log::debug!("Discarding PDU for unconfigured channel {:#06X}", cid);
            },
            Some(channel) => {
                if channel.activated {
                    actions.push( Action::Rx { raw_handle, cid, sdu } );
                } else {
                    channel.pending_rx.push_back(sdu);
                }
            },
            None => {
                log::debug!("Dropping PDU for unknown channel {:#06X} on handle {:#05X}", cid, raw_handle);
            },
        }
    }

    fn handle_signalling(&mut self, raw_handle: u16, payload: &[u8], actions: &mut Vec<Action<I>>) {
        let commands = match signalling::parse_commands(payload) {
            Ok(commands) => commands,
            Err(_) => {
                log::warn!("Dropping malformed signalling PDU on handle {:#05X}", raw_handle);
                return;
            },
        };

        for command in commands {
            match command.code {
                Some(code) => {
                    self.handle_signalling_command(raw_handle, command.identifier, code, &command.data, actions)
                },
                None => {
                    self.send_reject(raw_handle, command.identifier, RejectReason::CommandNotUnderstood)
                },
            }
        }
    }

    fn handle_signalling_command(
        &mut self,
        raw_handle: u16,
        identifier: u8,
        code: SignallingCode,
        data: &[u8],
        actions: &mut Vec<Action<I>>,
    ) {
        let link_type = match self.links.get(&raw_handle) {
            Some(link) => link.get_link_type(),
            None => return,
        };

        use self::SignallingCode::*;

        // commands outside their channel's command set get a reject
        let acl_only = matches!(
            code,
            ConnectionRequest | ConnectionResponse | ConfigurationRequest | ConfigurationResponse
                | InformationRequest | InformationResponse
        );

        let le_only = matches!(
            code,
            ConnectionParameterUpdateRequest | ConnectionParameterUpdateResponse
        );

        if (acl_only && link_type != LinkType::Acl) || (le_only && link_type != LinkType::Le) {
            self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
            return;
        }

        match code {
            CommandReject => self.on_command_reject(raw_handle, identifier, data, actions),
            ConnectionRequest => self.on_connection_request(raw_handle, identifier, data),
            ConnectionResponse => self.on_connection_response(raw_handle, identifier, data, actions),
            ConfigurationRequest => self.on_configuration_request(raw_handle, identifier, data, actions),
            ConfigurationResponse => self.on_configuration_response(raw_handle, identifier, data, actions),
            DisconnectionRequest => self.on_disconnection_request(raw_handle, identifier, data, actions),
            DisconnectionResponse => self.on_disconnection_response(raw_handle, identifier, data),
            InformationRequest => self.on_information_request(raw_handle, identifier, data),
            InformationResponse => self.on_information_response(raw_handle, identifier, data),
            ConnectionParameterUpdateRequest =>
                self.on_conn_param_update_request(raw_handle, identifier, data, actions),
            ConnectionParameterUpdateResponse => {
                // this side never issues the request (it is the central)
                log::debug!("Ignoring unsolicited connection parameter update response");
            },
        }
    }

    fn on_connection_request(&mut self, raw_handle: u16, identifier: u8, data: &[u8]) {
        let request = match ConnectionRequestData::decode(data) {
            Ok(request) => request,
            Err(_) => {
                self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
                return;
            },
        };

        let respond = |manager: &mut Self, destination_cid: u16, result: ConnectionResult| {
            manager.send_signalling_response(
                raw_handle,
                SignallingCode::ConnectionResponse,
                identifier,
                &ConnectionResponseData {
                    destination_cid,
                    source_cid: request.source_cid,
                    result,
                    status: 0,
                }.encode(),
            );
        };

        if Psm::new(request.psm).is_err() || !self.services.contains_key(&request.psm) {
            respond(self, 0, ConnectionResult::PsmNotSupported);
            return;
        }

        if super::DynChannelId::new_acl(request.source_cid).is_err() {
            respond(self, 0, ConnectionResult::InvalidSourceCid);
            return;
        }

        let params = self.services.get(&request.psm).map(|s| s.params).unwrap_or_default();

        let (remote_in_use, allocated) = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            if link.remote_cid_in_use(request.source_cid) {
                (true, None)
            } else {
                (false, link.allocate_dynamic_cid())
            }
        };

        if remote_in_use {
            respond(self, 0, ConnectionResult::SourceCidAlreadyAllocated);
            return;
        }

        let local_cid = match allocated {
            Some(cid) => cid,
            None => {
                respond(self, 0, ConnectionResult::NoResources);
                return;
            },
        };

        let max_rx = params.max_rx_sdu_size.unwrap_or(DEFAULT_MTU).max(MINIMUM_ACL_MTU);

        if let Some(link) = self.links.get_mut(&raw_handle) {
            let mut channel = ChannelState::new_dynamic(
                local_cid,
                request.psm,
                false,
                params.mode,
                max_rx,
                DynamicChannelState::WaitingConfig,
            );

            channel.remote_cid = request.source_cid;

            link.channels.insert(local_cid, channel);
        }

        respond(self, local_cid, ConnectionResult::Success);

        self.maybe_send_local_config(raw_handle, local_cid);
    }

    fn on_connection_response(&mut self, raw_handle: u16, identifier: u8, data: &[u8], actions: &mut Vec<Action<I>>) {
        let response = match ConnectionResponseData::decode(data) {
            Ok(response) => response,
            Err(_) => return,
        };

        let local_cid = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            match link.pending_requests.get(&identifier).map(|r| r.kind) {
                Some(RequestKind::Connection { local_cid }) => local_cid,
                _ => {
                    log::debug!("Ignoring connection response with unknown identifier {}", identifier);
                    return;
                },
            }
        };

        match response.result {
            ConnectionResult::Pending => {
                // keep waiting, restart the response timer
                if let Some(link) = self.links.get_mut(&raw_handle) {
                    if let Some(request) = link.pending_requests.get_mut(&identifier) {
                        self.timers.remove(request.timer);

                        request.timer = self.timers.add(
                            Instant::now() + request.interval,
                            TimerToken::Signalling { raw_handle, identifier },
                        );
                    }
                }
            },
            ConnectionResult::Success => {
                self.remove_pending_request(raw_handle, identifier);

                if let Some(link) = self.links.get_mut(&raw_handle) {
                    if let Some(channel) = link.channels.get_mut(&local_cid) {
                        channel.remote_cid = response.destination_cid;

                        if let Some(dynamic) = channel.dynamic.as_mut() {
                            dynamic.state = DynamicChannelState::WaitingConfig;
                        }
                    }
                }

                self.maybe_send_local_config(raw_handle, local_cid);
            },
            other => {
                log::info!("Peer refused channel {:#06X}: {:?}", local_cid, other);

                self.remove_pending_request(raw_handle, identifier);

                self.fail_dynamic_channel(raw_handle, local_cid, actions);
            },
        }
    }

    fn on_configuration_request(&mut self, raw_handle: u16, identifier: u8, data: &[u8], actions: &mut Vec<Action<I>>) {
        let request = match ConfigurationRequestData::decode(data) {
            Ok(request) => request,
            Err(_) => {
                self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
                return;
            },
        };

        if request.flags & 0x0001 != 0 {
            log::warn!("Treating continuation flagged configuration request as complete");
        }

        let local_cid = request.destination_cid;

        let lookup = {
            let link = match self.links.get(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            let peer_supports_ertm = link.peer_supports_ertm();

            link.channels.get(&local_cid)
                .and_then(|channel| channel.dynamic.as_ref().map(|dynamic| {
                    let wants_ertm =
                        dynamic.requested_mode == Some(ChannelMode::EnhancedRetransmission);

                    let our_mode = if wants_ertm && peer_supports_ertm {
                        ChannelMode::EnhancedRetransmission
                    } else {
                        ChannelMode::Basic
                    };

                    (channel.remote_cid, our_mode)
                }))
        };

        let (remote_cid, our_mode) = match lookup {
            Some(lookup) => lookup,
            None => {
                self.send_reject(
                    raw_handle,
                    identifier,
                    RejectReason::InvalidCid { local_cid, remote_cid: 0 },
                );
                return;
            },
        };

        // unknown non-hint options fail the request as a whole
        let unknown: Vec<ConfigOption> = request.options.iter()
            .filter(|option| matches!(option, ConfigOption::Unknown { .. }))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            self.send_signalling_response(
                raw_handle,
                SignallingCode::ConfigurationResponse,
                identifier,
                &ConfigurationResponseData {
                    source_cid: remote_cid,
                    flags: 0,
                    result: ConfigurationResult::UnknownOptions,
                    options: unknown,
                }.encode(),
            );
            return;
        }

        let mut response_result = ConfigurationResult::Success;
        let mut response_options = Vec::new();

        let mut new_tx_mtu = None;

        let mut peer_mode = ChannelMode::Basic;

        for option in &request.options {
            match option {
                ConfigOption::Mtu(mtu) => {
                    if *mtu < MINIMUM_ACL_MTU {
                        response_result = ConfigurationResult::UnacceptableParameters;
                        response_options.push( ConfigOption::Mtu(MINIMUM_ACL_MTU) );
                    } else {
                        new_tx_mtu = Some(*mtu);
                    }
                },
                ConfigOption::RetransmissionAndFlowControl(rfc) => {
                    peer_mode = if rfc.mode == RetransmissionAndFlowControl::MODE_ENHANCED_RETRANSMISSION {
                        ChannelMode::EnhancedRetransmission
                    } else {
                        ChannelMode::Basic
                    };
                },
                ConfigOption::Unknown { .. } => (),
            }
        }

        if peer_mode != our_mode {
            response_result = ConfigurationResult::UnacceptableParameters;

            let rfc = match our_mode {
                ChannelMode::EnhancedRetransmission =>
                    RetransmissionAndFlowControl::enhanced_retransmission(),
                ChannelMode::Basic => RetransmissionAndFlowControl::basic(),
            };

            response_options.push( ConfigOption::RetransmissionAndFlowControl(rfc) );
        }

        self.send_signalling_response(
            raw_handle,
            SignallingCode::ConfigurationResponse,
            identifier,
            &ConfigurationResponseData {
                source_cid: remote_cid,
                flags: 0,
                result: response_result,
                options: response_options,
            }.encode(),
        );

        if response_result == ConfigurationResult::Success {
            if let Some(link) = self.links.get_mut(&raw_handle) {
                if let Some(channel) = link.channels.get_mut(&local_cid) {
                    if let Some(mtu) = new_tx_mtu {
                        channel.max_tx_sdu_size = mtu;
                    }

                    channel.mode = our_mode;

                    if let Some(dynamic) = channel.dynamic.as_mut() {
                        dynamic.remote_config_done = true;
                    }
                }
            }

            self.maybe_open(raw_handle, local_cid, actions);
        }
    }

    fn on_configuration_response(&mut self, raw_handle: u16, identifier: u8, data: &[u8], actions: &mut Vec<Action<I>>) {
        let response = match ConfigurationResponseData::decode(data) {
            Ok(response) => response,
            Err(_) => return,
        };

        let local_cid = {
            let link = match self.links.get(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            match link.pending_requests.get(&identifier).map(|r| r.kind) {
                Some(RequestKind::Configuration { local_cid }) => local_cid,
                _ => {
                    log::debug!("Ignoring configuration response with unknown identifier {}", identifier);
                    return;
                },
            }
        };

        self.remove_pending_request(raw_handle, identifier);

        match response.result {
            ConfigurationResult::Success => {
                if let Some(link) = self.links.get_mut(&raw_handle) {
                    if let Some(channel) = link.channels.get_mut(&local_cid) {
                        if let Some(dynamic) = channel.dynamic.as_mut() {
                            dynamic.local_config_acked = true;
                        }
                    }
                }

                self.maybe_open(raw_handle, local_cid, actions);
            },
            ConfigurationResult::UnacceptableParameters => {
                // fall back to Basic once if the peer rejected our mode
                let retry = {
                    let suggested_basic = response.options.iter().any(|option| matches!(
                        option,
                        ConfigOption::RetransmissionAndFlowControl(rfc)
                            if rfc.mode == RetransmissionAndFlowControl::MODE_BASIC
                    ));

                    self.links.get_mut(&raw_handle)
                        .and_then(|link| link.channels.get_mut(&local_cid))
                        .and_then(|channel| channel.dynamic.as_mut())
                        .map(|dynamic| {
                            let retry = suggested_basic && !dynamic.config_retried;

                            if retry {
                                dynamic.config_retried = true;
                                dynamic.requested_mode = Some(ChannelMode::Basic);
                                dynamic.local_config_sent = false;
                                dynamic.local_config_acked = false;
                            }

                            retry
                        })
                        .unwrap_or(false)
                };

                if retry {
                    self.maybe_send_local_config(raw_handle, local_cid);
                } else {
                    self.close_dynamic_channel_with_peer(raw_handle, local_cid);
                    self.fail_dynamic_channel(raw_handle, local_cid, actions);
                }
            },
            _ => {
                self.close_dynamic_channel_with_peer(raw_handle, local_cid);
                self.fail_dynamic_channel(raw_handle, local_cid, actions);
            },
        }
    }

    fn on_disconnection_request(&mut self, raw_handle: u16, identifier: u8, data: &[u8], actions: &mut Vec<Action<I>>) {
        let request = match DisconnectionData::decode(data) {
            Ok(request) => request,
            Err(_) => {
                self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
                return;
            },
        };

        let known = self.links.get(&raw_handle)
            .and_then(|link| link.channels.get(&request.destination_cid))
            .map(|channel| channel.dynamic.is_some() && channel.remote_cid == request.source_cid)
            .unwrap_or(false);

        if !known {
            self.send_reject(
                raw_handle,
                identifier,
                RejectReason::InvalidCid {
                    local_cid: request.destination_cid,
                    remote_cid: request.source_cid,
                },
            );
            return;
        }

        self.send_signalling_response(
            raw_handle,
            SignallingCode::DisconnectionResponse,
            identifier,
            &request.encode(),
        );

        self.destroy_channel(raw_handle, request.destination_cid, true, actions);
    }

    fn on_disconnection_response(&mut self, raw_handle: u16, identifier: u8, data: &[u8]) {
        if DisconnectionData::decode(data).is_err() {
            return;
        }

        let local_cid = {
            let link = match self.links.get(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            match link.pending_requests.get(&identifier).map(|r| r.kind) {
                Some(RequestKind::Disconnection { local_cid }) => local_cid,
                _ => return,
            }
        };

        self.remove_pending_request(raw_handle, identifier);

        // locally initiated teardown, no callbacks left to run
        let mut ignored = Vec::new();

        self.destroy_channel(raw_handle, local_cid, false, &mut ignored);
    }

    fn on_information_request(&mut self, raw_handle: u16, identifier: u8, data: &[u8]) {
        let request = match InformationRequestData::decode(data) {
            Ok(request) => request,
            Err(_) => {
                self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
                return;
            },
        };

        let response = match request.info_type {
            InformationType::ExtendedFeatures => InformationResponseData {
                info_type: request.info_type,
                result: INFORMATION_RESULT_SUCCESS,
                data: local_extended_features().bits().to_le_bytes().to_vec(),
            },
            InformationType::FixedChannels => InformationResponseData {
                info_type: request.info_type,
                result: INFORMATION_RESULT_SUCCESS,
                data: local_fixed_channels().bits().to_le_bytes().to_vec(),
            },
            _ => InformationResponseData {
                info_type: request.info_type,
                result: INFORMATION_RESULT_NOT_SUPPORTED,
                data: Vec::new(),
            },
        };

        self.send_signalling_response(
            raw_handle,
            SignallingCode::InformationResponse,
            identifier,
            &response.encode(),
        );
    }

    fn on_information_response(&mut self, raw_handle: u16, identifier: u8, data: &[u8]) {
        let info_type = {
            let link = match self.links.get(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            match link.pending_requests.get(&identifier).map(|r| r.kind) {
                Some(RequestKind::Information { info_type }) => info_type,
                _ => {
                    log::debug!("Ignoring information response with unknown identifier {}", identifier);
                    return;
                },
            }
        };

        self.remove_pending_request(raw_handle, identifier);

        let response = InformationResponseData::decode(data).ok();

        if let Some(link) = self.links.get_mut(&raw_handle) {
            match info_type {
                InformationType::ExtendedFeatures => {
                    let features = response
                        .filter(|r| r.result == INFORMATION_RESULT_SUCCESS && r.data.len() >= 4)
                        .map(|r| {
                            ExtendedFeatures::from_bits_truncate(
                                u32::from_le_bytes([r.data[0], r.data[1], r.data[2], r.data[3]])
                            )
                        })
                        .unwrap_or_else(ExtendedFeatures::empty);

                    link.extended_features = Some(features);
                },
                InformationType::FixedChannels => {
                    let channels = response
                        .filter(|r| r.result == INFORMATION_RESULT_SUCCESS && r.data.len() >= 8)
                        .map(|r| {
                            let mut bytes = [0u8; 8];
                            bytes.copy_from_slice(&r.data[..8]);
                            FixedChannelsSupported::from_bits_truncate(u64::from_le_bytes(bytes))
                        })
                        .unwrap_or_else(FixedChannelsSupported::empty);

                    link.fixed_channels = Some(channels);
                },
                _ => (),
            }
        }

        self.flush_deferred_configs(raw_handle);
    }

    fn on_command_reject(&mut self, raw_handle: u16, identifier: u8, data: &[u8], actions: &mut Vec<Action<I>>) {
        let reason = RejectReason::decode(data).ok();

        log::info!("Peer rejected signalling command {}: {:?}", identifier, reason);

        let kind = {
            let link = match self.links.get(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            match link.pending_requests.get(&identifier).map(|r| r.kind) {
                Some(kind) => kind,
                None => return,
            }
        };

        self.remove_pending_request(raw_handle, identifier);

        match kind {
            RequestKind::Connection { local_cid } | RequestKind::Configuration { local_cid } => {
                self.fail_dynamic_channel(raw_handle, local_cid, actions);
            },
            RequestKind::Disconnection { local_cid } => {
                let mut ignored = Vec::new();

                self.destroy_channel(raw_handle, local_cid, false, &mut ignored);
            },
            RequestKind::Information { info_type } => {
                // a reject means "no optional features"
                if let Some(link) = self.links.get_mut(&raw_handle) {
                    match info_type {
                        InformationType::ExtendedFeatures =>
                            link.extended_features = Some(ExtendedFeatures::empty()),
                        InformationType::FixedChannels =>
                            link.fixed_channels = Some(FixedChannelsSupported::empty()),
                        _ => (),
                    }
                }

                self.flush_deferred_configs(raw_handle);
            },
        }
    }

    fn on_conn_param_update_request(&mut self, raw_handle: u16, identifier: u8, data: &[u8], actions: &mut Vec<Action<I>>) {
        let role = match self.links.get(&raw_handle) {
            Some(link) => link.get_role(),
            None => return,
        };

        // only the central processes this request
        if role != LinkRole::Central {
            self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
            return;
        }

        let update = match ConnectionParameterUpdate::decode(data) {
            Ok(update) => update,
            Err(_) => {
                self.send_reject(raw_handle, identifier, RejectReason::CommandNotUnderstood);
                return;
            },
        };

        let result = if update.is_valid() {
            CONN_PARAM_RESULT_ACCEPTED
        } else {
            CONN_PARAM_RESULT_REJECTED
        };

        self.send_signalling_response(
            raw_handle,
            SignallingCode::ConnectionParameterUpdateResponse,
            identifier,
            &result.to_le_bytes(),
        );

        if result == CONN_PARAM_RESULT_ACCEPTED {
            actions.push( Action::ConnParam { raw_handle, update } );
        }
    }

    /// Send our Configuration Request when the prerequisites are met
    ///
    /// A channel that wants Enhanced Retransmission mode waits for the
    /// extended features exchange before configuring, everything else
    /// configures immediately.
    fn maybe_send_local_config(&mut self, raw_handle: u16, local_cid: u16) {
        let (remote_cid, mode, mtu) = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            let features_known = link.features_known();
            let peer_supports_ertm = link.peer_supports_ertm();

            let channel = match link.channels.get_mut(&local_cid) {
                Some(channel) => channel,
                None => return,
            };

            let dynamic = match channel.dynamic.as_mut() {
                Some(dynamic) => dynamic,
                None => return,
            };

            if dynamic.local_config_sent || dynamic.state != DynamicChannelState::WaitingConfig {
                return;
            }

            let wants_ertm = dynamic.requested_mode == Some(ChannelMode::EnhancedRetransmission);

            if wants_ertm && !features_known {
                // configure once the information exchange settles
                return;
            }

            let mode = if wants_ertm && peer_supports_ertm {
                ChannelMode::EnhancedRetransmission
            } else {
                ChannelMode::Basic
            };

            dynamic.local_config_sent = true;

            channel.mode = mode;

            (channel.remote_cid, mode, channel.max_rx_sdu_size)
        };

        let mut options = vec![ ConfigOption::Mtu(mtu) ];

        if mode == ChannelMode::EnhancedRetransmission {
            options.push( ConfigOption::RetransmissionAndFlowControl(
                RetransmissionAndFlowControl::enhanced_retransmission()
            ));
        }

        self.send_signalling_request(
            raw_handle,
            RequestKind::Configuration { local_cid },
            SignallingCode::ConfigurationRequest,
            &ConfigurationRequestData {
                destination_cid: remote_cid,
                flags: 0,
                options,
            }.encode(),
        );
    }

    /// Send deferred Configuration Requests after the features became known
    fn flush_deferred_configs(&mut self, raw_handle: u16) {
        let waiting: Vec<u16> = match self.links.get(&raw_handle) {
            Some(link) => link.channels.values()
                .filter(|channel| channel.dynamic.as_ref()
                    .map(|d| d.state == DynamicChannelState::WaitingConfig && !d.local_config_sent)
                    .unwrap_or(false))
                .map(|channel| channel.local_cid)
                .collect(),
            None => return,
        };

        for local_cid in waiting {
            self.maybe_send_local_config(raw_handle, local_cid);
        }
    }

    /// Open the channel once both configuration directions succeeded
    fn maybe_open(&mut self, raw_handle: u16, local_cid: u16, actions: &mut Vec<Action<I>>) {
        let opened = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            let handle = link.get_handle();

            match link.channels.get_mut(&local_cid).and_then(|c| c.dynamic.as_mut()) {
                Some(dynamic)
                    if dynamic.state == DynamicChannelState::WaitingConfig
                        && dynamic.handshake_done() =>
                {
                    dynamic.state = DynamicChannelState::Open;

                    Some((dynamic.locally_initiated, dynamic.psm, handle))
                },
                _ => None,
            }
        };

        if let Some((locally_initiated, psm, handle)) = opened {
            log::info!("Dynamic channel {:#06X} on handle {} is open", local_cid, handle);

            if locally_initiated {
                if let Some(callback) = self.pending_opens.remove(&(raw_handle, local_cid)) {
                    actions.push( Action::OpenResult { callback, handle, cid: local_cid, success: true } );
                }
            } else {
                actions.push( Action::NewInboundChannel { psm, handle, cid: local_cid } );
            }
        }
    }

    fn remove_pending_request(&mut self, raw_handle: u16, identifier: u8) {
        if let Some(link) = self.links.get_mut(&raw_handle) {
            if let Some(request) = link.pending_requests.remove(&identifier) {
                self.timers.remove(request.timer);
            }
        }
    }

    /// Cancel pending requests that refer to a channel being destroyed
    fn cancel_channel_requests(&mut self, raw_handle: u16, local_cid: u16) {
        let identifiers: Vec<u8> = match self.links.get(&raw_handle) {
            Some(link) => link.pending_requests.iter()
                .filter(|(_, request)| match request.kind {
                    RequestKind::Connection { local_cid: cid }
                    | RequestKind::Configuration { local_cid: cid }
                    | RequestKind::Disconnection { local_cid: cid } => cid == local_cid,
                    RequestKind::Information { .. } => false,
                })
                .map(|(&identifier, _)| identifier)
                .collect(),
            None => return,
        };

        for identifier in identifiers {
            self.remove_pending_request(raw_handle, identifier);
        }
    }

    /// A failed open: remove the channel and notify whoever waited on it
    fn fail_dynamic_channel(&mut self, raw_handle: u16, local_cid: u16, actions: &mut Vec<Action<I>>) {
        self.cancel_channel_requests(raw_handle, local_cid);

        let removed = self.links.get_mut(&raw_handle)
            .and_then(|link| link.channels.remove(&local_cid));

        if let Some(mut channel) = removed {
            if let Some(link) = self.links.get(&raw_handle) {
                if channel.remote_cid != 0 {
                    self.acl.drop_queued(link.get_handle(), channel.remote_cid);
                }
            }

            if let Some(callback) = channel.closed_callback.take() {
                actions.push( Action::Closed { callback } );
            }
        }

        if let Some(link) = self.links.get(&raw_handle) {
            if let Some(callback) = self.pending_opens.remove(&(raw_handle, local_cid)) {
                actions.push( Action::OpenResult {
                    callback,
                    handle: link.get_handle(),
                    cid: local_cid,
                    success: false,
                });
            }
        }
    }

    /// Tear down an open channel, optionally notifying the user
    fn destroy_channel(&mut self, raw_handle: u16, local_cid: u16, peer_initiated: bool, actions: &mut Vec<Action<I>>) {
        self.cancel_channel_requests(raw_handle, local_cid);

        let handle = match self.links.get(&raw_handle) {
            Some(link) => link.get_handle(),
            None => return,
        };

        let removed = self.links.get_mut(&raw_handle)
            .and_then(|link| link.channels.remove(&local_cid));

        if let Some(mut channel) = removed {
            if channel.remote_cid != 0 {
                self.acl.drop_queued(handle, channel.remote_cid);
            }

            if peer_initiated {
                if let Some(callback) = channel.closed_callback.take() {
                    actions.push( Action::Closed { callback } );
                }

                if let Some(callback) = self.pending_opens.remove(&(raw_handle, local_cid)) {
                    actions.push( Action::OpenResult { callback, handle, cid: local_cid, success: false } );
                }
            }
        }
    }

    /// Start the disconnection handshake for a channel this side gives up on
    fn close_dynamic_channel_with_peer(&mut self, raw_handle: u16, local_cid: u16) {
        let request = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return,
            };

            match link.channels.get_mut(&local_cid) {
                Some(channel) if channel.remote_cid != 0 => {
                    Some( DisconnectionData {
                        destination_cid: channel.remote_cid,
                        source_cid: local_cid,
                    })
                },
                _ => None,
            }
        };

        if let Some(request) = request {
            self.send_signalling_request(
                raw_handle,
                RequestKind::Disconnection { local_cid },
                SignallingCode::DisconnectionRequest,
                &request.encode(),
            );
        }
    }

    /// User facing deactivation, shared by `Channel::deactivate` and drop
    fn deactivate(&mut self, raw_handle: u16, local_cid: u16) -> Vec<Action<I>> {
        let mut actions = Vec::new();

        let handle = match self.links.get(&raw_handle) {
            Some(link) => link.get_handle(),
            None => return actions,
        };

        enum Teardown {
            Fixed,
            Handshake { remote_cid: u16 },
            InFlight,
            Nothing,
        }

        let teardown = {
            let channel = match self.links.get_mut(&raw_handle)
                .and_then(|link| link.channels.get_mut(&local_cid))
            {
                Some(channel) => channel,
                None => return actions,
            };

            channel.rx_callback = None;
            channel.closed_callback = None;
            channel.deactivated = true;
            channel.pending_rx.clear();

            match channel.dynamic.as_ref() {
                None => Teardown::Fixed,
                Some(dynamic) => match dynamic.state {
                    DynamicChannelState::Open | DynamicChannelState::WaitingConfig =>
                        Teardown::Handshake { remote_cid: channel.remote_cid },
                    DynamicChannelState::WaitingConnectionResponse => Teardown::InFlight,
                    DynamicChannelState::WaitingDisconnectResponse => Teardown::Nothing,
                },
            }
        };

        match teardown {
            Teardown::Fixed => {
                if let Some(link) = self.links.get_mut(&raw_handle) {
                    link.channels.remove(&local_cid);
                }

                self.acl.drop_queued(handle, local_cid);
            },
            Teardown::Handshake { remote_cid } => {
                if remote_cid != 0 {
                    self.acl.drop_queued(handle, remote_cid);
                }

                if let Some(dynamic) = self.links.get_mut(&raw_handle)
                    .and_then(|link| link.channels.get_mut(&local_cid))
                    .and_then(|channel| channel.dynamic.as_mut())
                {
                    dynamic.state = DynamicChannelState::WaitingDisconnectResponse;
                }

                // a config request may still be outstanding
                self.cancel_channel_requests(raw_handle, local_cid);

                self.close_dynamic_channel_with_peer(raw_handle, local_cid);
            },
            Teardown::InFlight => {
                self.fail_dynamic_channel(raw_handle, local_cid, &mut actions);
            },
            Teardown::Nothing => (),
        }

        actions
    }

    fn on_signalling_timeout(&mut self, raw_handle: u16, identifier: u8, now: Instant) -> Vec<Action<I>> {
        let mut actions = Vec::new();

        let decision = {
            let link = match self.links.get_mut(&raw_handle) {
                Some(link) => link,
                None => return actions,
            };

            let request = match link.pending_requests.get_mut(&identifier) {
                Some(request) => request,
                None => return actions,
            };

            request.elapsed += request.interval;

            let give_up = matches!(request.kind, RequestKind::Disconnection { .. })
                || request.elapsed >= RTX_TOTAL;

            if give_up {
                Err( link.pending_requests.remove(&identifier)
                    .map(|request| request.kind) )
            } else {
                Ok( request.packet.clone() )
            }
        };

        match decision {
            Ok(packet) => {
                log::debug!("Retransmitting signalling request {} on handle {:#05X}", identifier, raw_handle);

                self.send_signalling_packet(raw_handle, &packet);

                let timer = self.timers.add(
                    now + RTX_MAX,
                    TimerToken::Signalling { raw_handle, identifier },
                );

                if let Some(link) = self.links.get_mut(&raw_handle) {
                    if let Some(request) = link.pending_requests.get_mut(&identifier) {
                        request.interval = RTX_MAX;
                        request.timer = timer;
                    }
                }
            },
            Err(kind) => {
                log::warn!("Signalling request {} on handle {:#05X} timed out", identifier, raw_handle);

                match kind {
                    Some(RequestKind::Connection { local_cid })
                    | Some(RequestKind::Configuration { local_cid }) => {
                        self.fail_dynamic_channel(raw_handle, local_cid, &mut actions);
                    },
                    Some(RequestKind::Disconnection { local_cid }) => {
                        let mut ignored = Vec::new();

                        self.destroy_channel(raw_handle, local_cid, false, &mut ignored);
                    },
                    Some(RequestKind::Information { info_type }) => {
                        if let Some(link) = self.links.get_mut(&raw_handle) {
                            match info_type {
                                InformationType::ExtendedFeatures =>
                                    link.extended_features = Some(ExtendedFeatures::empty()),
                                InformationType::FixedChannels =>
                                    link.fixed_channels = Some(FixedChannelsSupported::empty()),
                                _ => (),
                            }
                        }

                        self.flush_deferred_configs(raw_handle);
                    },
                    None => (),
                }
            },
        }

        actions
    }
}

fn make_channel<I: HciAclDataInterface>(
    manager: Weak<RefCell<ManagerInner<I>>>,
    handle: ConnectionHandle,
    local_cid: u16,
) -> Channel<I> {
    Channel {
        token: Rc::new( ChannelToken {
            manager,
            handle,
            local_cid,
        }),
    }
}

/// Run collected user callbacks with the manager borrow released
fn run_actions<I: HciAclDataInterface>(
    inner: &Rc<RefCell<ManagerInner<I>>>,
    actions: Vec<Action<I>>,
) {
    for action in actions {
        match action {
            Action::Rx { raw_handle, cid, sdu } => {
                let callback = {
                    let mut manager = inner.borrow_mut();

                    manager.links.get_mut(&raw_handle)
                        .and_then(|link| link.channels.get_mut(&cid))
                        .and_then(|channel| channel.rx_callback.take())
                };

                if let Some(mut callback) = callback {
                    callback(sdu);

                    let mut manager = inner.borrow_mut();

                    if let Some(channel) = manager.links.get_mut(&raw_handle)
                        .and_then(|link| link.channels.get_mut(&cid))
                    {
                        if channel.rx_callback.is_none() && !channel.deactivated {
                            channel.rx_callback = Some(callback);
                        }
                    }
                }
            },
            Action::OpenResult { callback, handle, cid, success } => {
                let channel = if success {
                    Some( make_channel(Rc::downgrade(inner), handle, cid) )
                } else {
                    None
                };

                callback(channel);
            },
            Action::NewInboundChannel { psm, handle, cid } => {
                let callback = {
                    let mut manager = inner.borrow_mut();

                    manager.services.get_mut(&psm).and_then(|service| service.callback.take())
                };

                if let Some(mut callback) = callback {
                    callback( make_channel(Rc::downgrade(inner), handle, cid) );

                    let mut manager = inner.borrow_mut();

                    if let Some(service) = manager.services.get_mut(&psm) {
                        if service.callback.is_none() {
                            service.callback = Some(callback);
                        }
                    }
                } else {
                    log::warn!("No service callback for PSM {:#06X}, dropping inbound channel", psm);
                }
            },
            Action::Closed { callback } => callback(),
            Action::LinkError { raw_handle } => {
                let callback = {
                    let mut manager = inner.borrow_mut();

                    manager.links.get_mut(&raw_handle).map(|link| {
                        core::mem::replace(&mut link.link_error_callback, Box::new(|| ()))
                    })
                };

                if let Some(mut callback) = callback {
                    callback();

                    let mut manager = inner.borrow_mut();

                    if let Some(link) = manager.links.get_mut(&raw_handle) {
                        link.link_error_callback = callback;
                    }
                }
            },
            Action::ConnParam { raw_handle, update } => {
                let callback = {
                    let mut manager = inner.borrow_mut();

                    manager.links.get_mut(&raw_handle)
                        .and_then(|link| link.conn_param_callback.take())
                };

                if let Some(mut callback) = callback {
                    callback(update);

                    let mut manager = inner.borrow_mut();

                    if let Some(link) = manager.links.get_mut(&raw_handle) {
                        if link.conn_param_callback.is_none() {
                            link.conn_param_callback = Some(callback);
                        }
                    }
                }
            },
        }
    }
}

// --- support for the methods of `Channel` ---

pub(super) fn activate_channel<I: HciAclDataInterface>(
    token: &ChannelToken<I>,
    rx_callback: RxCallback,
    closed_callback: ClosedCallback,
) -> Result<(), Error> {
    let inner = token.manager.upgrade().ok_or(Error::LinkError)?;

    let raw_handle = token.handle.get_raw_handle();

    let replay = {
        let mut manager = inner.borrow_mut();

        let channel = manager.links.get_mut(&raw_handle)
            .and_then(|link| link.channels.get_mut(&token.local_cid))
            .ok_or(Error::LinkError)?;

        if channel.deactivated {
            return Err( Error::LinkError );
        }

        if channel.activated {
            return Err( Error::InProgress );
        }

        channel.activated = true;
        channel.closed_callback = Some(closed_callback);

        channel.pending_rx.drain(..).collect::<Vec<_>>()
    };

    let mut rx_callback = rx_callback;

    for sdu in replay {
        rx_callback(sdu);
    }

    let mut manager = inner.borrow_mut();

    if let Some(channel) = manager.links.get_mut(&raw_handle)
        .and_then(|link| link.channels.get_mut(&token.local_cid))
    {
        if channel.activated && !channel.deactivated && channel.rx_callback.is_none() {
            channel.rx_callback = Some(rx_callback);
        }
    }

    Ok(())
}

pub(super) fn deactivate_channel<I: HciAclDataInterface>(
    manager: &Weak<RefCell<ManagerInner<I>>>,
    handle: ConnectionHandle,
    local_cid: u16,
) {
    let inner = match manager.upgrade() {
        Some(inner) => inner,
        None => return,
    };

    let actions = inner.borrow_mut().deactivate(handle.get_raw_handle(), local_cid);

    run_actions(&inner, actions);
}

pub(super) fn channel_send<I: HciAclDataInterface>(
    token: &ChannelToken<I>,
    sdu: &[u8],
) -> bool {
    let inner = match token.manager.upgrade() {
        Some(inner) => inner,
        None => return false,
    };

    let manager = inner.borrow();

    let link = match manager.links.get(&token.handle.get_raw_handle()) {
        Some(link) => link,
        None => return false,
    };

    let channel = match link.channels.get(&token.local_cid) {
        Some(channel) => channel,
        None => return false,
    };

    if channel.deactivated || !channel.is_open() {
        return false;
    }

    if sdu.len() > channel.max_tx_sdu_size as usize {
        log::warn!(
            "Refusing SDU of {} bytes on channel {:#06X}, peer MTU is {}",
            sdu.len(),
            token.local_cid,
            channel.max_tx_sdu_size
        );
        return false;
    }

    // signalling and security traffic overtakes user data
    let priority = match token.local_cid {
        0x0006 | 0x0007 => AclPriority::High,
        _ => AclPriority::Low,
    };

    let frame = make_basic_frame(channel.remote_cid, sdu);

    manager.acl.send_packets(token.handle, Some(channel.remote_cid), vec![frame], priority)
}

pub(super) fn with_channel<I, F, R>(token: &ChannelToken<I>, f: F) -> Option<R>
where I: HciAclDataInterface,
      F: FnOnce(&ChannelState, &LogicalLink) -> R,
{
    let inner = token.manager.upgrade()?;

    let manager = inner.borrow();

    let link = manager.links.get(&token.handle.get_raw_handle())?;

    let channel = link.channels.get(&token.local_cid)?;

    Some( f(channel, link) )
}

pub(super) fn signal_link_error<I: HciAclDataInterface>(token: &ChannelToken<I>) {
    let inner = match token.manager.upgrade() {
        Some(inner) => inner,
        None => return,
    };

    let raw_handle = token.handle.get_raw_handle();

    let exists = inner.borrow().links.contains_key(&raw_handle);

    if exists {
        run_actions(&inner, vec![ Action::LinkError { raw_handle } ]);
    }
}

pub(super) fn upgrade_security<I: HciAclDataInterface>(
    token: &ChannelToken<I>,
    level: SecurityLevel,
    callback: Box<dyn FnOnce(Result<(), Error>)>,
) {
    let inner = match token.manager.upgrade() {
        Some(inner) => inner,
        None => {
            callback( Err(Error::LinkError) );
            return;
        },
    };

    let raw_handle = token.handle.get_raw_handle();

    let security_callback = {
        let mut manager = inner.borrow_mut();

        match manager.links.get_mut(&raw_handle) {
            Some(link) => match link.security_callback.take() {
                Some(security_callback) => security_callback,
                None => {
                    drop(manager);
                    callback( Err(Error::NotFound) );
                    return;
                },
            },
            None => {
                drop(manager);
                callback( Err(Error::LinkError) );
                return;
            },
        }
    };

    let mut security_callback = security_callback;

    security_callback(level, callback);

    let mut manager = inner.borrow_mut();

    if let Some(link) = manager.links.get_mut(&raw_handle) {
        if link.security_callback.is_none() {
            link.security_callback = Some(security_callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::acl_data_channel::DataBufferInfo;
    use crate::hci::{AclBroadcastFlag, AclPacketBoundary};

    #[derive(Clone, Default)]
    struct TestInterface {
        sent: Rc<RefCell<Vec<Box<[u8]>>>>,
    }

    impl HciAclDataInterface for TestInterface {
        type Error = &'static str;

        fn send_acl_data(&mut self, packet: &[u8]) -> Result<(), Self::Error> {
            self.sent.borrow_mut().push(Box::from(packet));
            Ok(())
        }
    }

    type Sent = Rc<RefCell<Vec<Box<[u8]>>>>;

    fn handle(raw: u16) -> ConnectionHandle {
        ConnectionHandle::try_from(raw).unwrap()
    }

    fn setup() -> (ChannelManager<TestInterface>, AclDataChannel<TestInterface>, Sent) {
        let interface = TestInterface::default();
        let sent = interface.sent.clone();

        let acl = AclDataChannel::new(interface);

        acl.configure(DataBufferInfo::new(64, 32), DataBufferInfo::default()).unwrap();

        let manager = ChannelManager::new(acl.clone());

        (manager, acl, sent)
    }

    /// Feed a complete single fragment PDU into the stack
    fn inbound(acl: &AclDataChannel<TestInterface>, raw_handle: u16, cid: u16, payload: &[u8]) {
        let frame = make_basic_frame(cid, payload);

        acl.receive_packet( HciAclData::new(
            handle(raw_handle),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            frame,
        ));
    }

    fn inbound_signalling(
        acl: &AclDataChannel<TestInterface>,
        raw_handle: u16,
        sig_cid: u16,
        code: SignallingCode,
        identifier: u8,
        payload: &[u8],
    ) {
        inbound(acl, raw_handle, sig_cid, &signalling::make_command(code, identifier, payload));
    }

    /// Decode and drain the signalling commands sent so far
    fn drain_signalling(sent: &Sent, sig_cid: u16) -> Vec<(u8, u8, Vec<u8>)> {
        let packets: Vec<Box<[u8]>> = sent.borrow_mut().drain(..).collect();

        let mut commands = Vec::new();

        for packet in packets {
            let data = HciAclData::try_from_packet(&packet).unwrap();

            let payload = data.get_payload();

            let (_, cid) = parse_basic_header(payload).unwrap();

            if cid != sig_cid {
                continue;
            }

            for command in signalling::parse_commands(&payload[BASIC_HEADER_SIZE..]).unwrap() {
                commands.push((
                    command.code.map(|code| code.to_val()).unwrap_or(0xFF),
                    command.identifier,
                    command.data,
                ));
            }
        }

        commands
    }

    /// Answer the information requests sent on ACL registration
    fn answer_information_requests(
        acl: &AclDataChannel<TestInterface>,
        raw_handle: u16,
        requests: &[(u8, u8, Vec<u8>)],
        features: u32,
    ) {
        for (code, identifier, data) in requests {
            if *code != SignallingCode::InformationRequest.to_val() {
                continue;
            }

            let info_type = u16::from_le_bytes([data[0], data[1]]);

            let mut payload = info_type.to_le_bytes().to_vec();

            payload.extend_from_slice(&INFORMATION_RESULT_SUCCESS.to_le_bytes());

            match info_type {
                0x0002 => payload.extend_from_slice(&features.to_le_bytes()),
                0x0003 => payload.extend_from_slice(&2u64.to_le_bytes()),
                _ => panic!("unexpected information request type {}", info_type),
            }

            inbound_signalling(
                acl,
                raw_handle,
                0x0001,
                SignallingCode::InformationResponse,
                *identifier,
                &payload,
            );
        }
    }

    /// Register an ACL link and settle the information exchange
    fn registered_acl_link(
        manager: &ChannelManager<TestInterface>,
        acl: &AclDataChannel<TestInterface>,
        sent: &Sent,
        raw_handle: u16,
        features: u32,
    ) {
        manager.register_acl_link(handle(raw_handle), LinkRole::Central, Box::new(|| ()), None);

        let requests = drain_signalling(sent, 0x0001);

        answer_information_requests(acl, raw_handle, &requests, features);

        drain_signalling(sent, 0x0001);
    }

    #[test]
    fn acl_registration_sends_information_requests_test() {
        let (manager, _acl, sent) = setup();

        manager.register_acl_link(handle(1), LinkRole::Central, Box::new(|| ()), None);

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 2 );

        assert_eq!( commands[0].0, SignallingCode::InformationRequest.to_val() );
        assert_eq!( commands[0].2, vec![0x02, 0x00] );

        assert_eq!( commands[1].0, SignallingCode::InformationRequest.to_val() );
        assert_eq!( commands[1].2, vec![0x03, 0x00] );
    }

    #[test]
    fn outbound_dynamic_channel_and_peer_disconnect_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        let opened: Rc<RefCell<Option<Option<Channel<TestInterface>>>>> =
            Rc::new(RefCell::new(None));

        let slot = opened.clone();

        manager.open_channel(
            handle(1),
            0x0001,
            ChannelParameters::default(),
            Box::new(move |channel| *slot.borrow_mut() = Some(channel)),
        );

        // the connection request goes out with our allocated source cid
        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::ConnectionRequest.to_val() );

        let request = ConnectionRequestData::decode(&commands[0].2).unwrap();

        assert_eq!( request.psm, 0x0001 );
        assert_eq!( request.source_cid, 0x0040 );

        let connection_identifier = commands[0].1;

        // peer accepts with its endpoint 0x9042
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionResponse, connection_identifier,
            &ConnectionResponseData {
                destination_cid: 0x9042,
                source_cid: 0x0040,
                result: ConnectionResult::Success,
                status: 0,
            }.encode(),
        );

        // which triggers our configuration request
        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::ConfigurationRequest.to_val() );

        let config = ConfigurationRequestData::decode(&commands[0].2).unwrap();

        assert_eq!( config.destination_cid, 0x9042 );
        assert!( config.options.contains(&ConfigOption::Mtu(DEFAULT_MTU)) );

        let config_identifier = commands[0].1;

        // the peer configures its direction, announcing a smaller MTU
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationRequest, 0x20,
            &ConfigurationRequestData {
                destination_cid: 0x0040,
                flags: 0,
                options: vec![ConfigOption::Mtu(256)],
            }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::ConfigurationResponse.to_val() );

        let response = ConfigurationResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.source_cid, 0x9042 );
        assert_eq!( response.result, ConfigurationResult::Success );

        // not open until our own configuration is acknowledged
        assert!( opened.borrow().is_none() );

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationResponse, config_identifier,
            &ConfigurationResponseData {
                source_cid: 0x0040,
                flags: 0,
                result: ConfigurationResult::Success,
                options: Vec::new(),
            }.encode(),
        );

        let channel = opened.borrow_mut().take().unwrap().unwrap();

        assert_eq!( channel.local_cid(), 0x0040 );
        assert_eq!( channel.remote_cid(), Some(0x9042) );
        assert_eq!( channel.max_tx_sdu_size(), Some(256) );
        assert!( channel.is_open() );

        let received = Rc::new(RefCell::new(Vec::new()));
        let closed = Rc::new(RefCell::new(false));

        let received_slot = received.clone();
        let closed_slot = closed.clone();

        channel.activate(
            Box::new(move |sdu| received_slot.borrow_mut().push(sdu)),
            Box::new(move || *closed_slot.borrow_mut() = true),
        ).unwrap();

        // peer tears the channel down
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::DisconnectionRequest, 0x30,
            &DisconnectionData { destination_cid: 0x0040, source_cid: 0x9042 }.encode(),
        );

        assert!( *closed.borrow() );

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::DisconnectionResponse.to_val() );

        let echo = DisconnectionData::decode(&commands[0].2).unwrap();

        assert_eq!( echo.destination_cid, 0x0040 );
        assert_eq!( echo.source_cid, 0x9042 );

        // data for the destroyed channel is dropped
        inbound(&acl, 1, 0x0040, &[1, 2, 3]);

        assert!( received.borrow().is_empty() );
        assert!( !channel.is_open() );
    }

    #[test]
    fn inbound_dynamic_channel_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        let delivered: Rc<RefCell<Vec<Channel<TestInterface>>>> = Rc::new(RefCell::new(Vec::new()));

        let slot = delivered.clone();

        assert!( manager.register_service(
            0x0003,
            ChannelParameters::default(),
            Box::new(move |channel| slot.borrow_mut().push(channel)),
        ));

        // a second registration on the same PSM is refused
        assert!( !manager.register_service(0x0003, ChannelParameters::default(), Box::new(|_| ())) );

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionRequest, 0x09,
            &ConnectionRequestData { psm: 0x0003, source_cid: 0x9042 }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        // the success response and our configuration request
        assert_eq!( commands.len(), 2 );
        assert_eq!( commands[0].0, SignallingCode::ConnectionResponse.to_val() );

        let response = ConnectionResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.result, ConnectionResult::Success );
        assert_eq!( response.source_cid, 0x9042 );
        assert_eq!( response.destination_cid, 0x0040 );

        assert_eq!( commands[1].0, SignallingCode::ConfigurationRequest.to_val() );

        let config_identifier = commands[1].1;

        // both configuration directions succeed
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationRequest, 0x0A,
            &ConfigurationRequestData { destination_cid: 0x0040, flags: 0, options: Vec::new() }.encode(),
        );

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationResponse, config_identifier,
            &ConfigurationResponseData {
                source_cid: 0x0040,
                flags: 0,
                result: ConfigurationResult::Success,
                options: Vec::new(),
            }.encode(),
        );

        assert_eq!( delivered.borrow().len(), 1 );

        let channel = delivered.borrow_mut().pop().unwrap();

        assert_eq!( channel.local_cid(), 0x0040 );
        assert_eq!( channel.remote_cid(), Some(0x9042) );
        assert!( channel.is_open() );
    }

    #[test]
    fn connection_request_for_unknown_psm_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionRequest, 0x09,
            &ConnectionRequestData { psm: 0x000F, source_cid: 0x9042 }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );

        let response = ConnectionResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.result, ConnectionResult::PsmNotSupported );
        assert_eq!( response.destination_cid, 0 );
    }

    #[test]
    fn le_connection_parameter_update_central_test() {
        let (manager, acl, sent) = setup();

        let updates = Rc::new(RefCell::new(Vec::new()));

        let slot = updates.clone();

        manager.register_le_link(
            handle(1),
            LinkRole::Central,
            Box::new(move |update| slot.borrow_mut().push(update)),
            Box::new(|| ()),
            None,
        );

        let update = ConnectionParameterUpdate {
            interval_min: 6,
            interval_max: 7,
            peripheral_latency: 1,
            timeout_multiplier: 10,
        };

        inbound_signalling(&acl, 1, 0x0005,
            SignallingCode::ConnectionParameterUpdateRequest, 0x09, &update.encode());

        assert_eq!( updates.borrow().as_slice(), &[update] );

        let commands = drain_signalling(&sent, 0x0005);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::ConnectionParameterUpdateResponse.to_val() );
        assert_eq!( commands[0].1, 0x09 );
        assert_eq!( commands[0].2, CONN_PARAM_RESULT_ACCEPTED.to_le_bytes().to_vec() );
    }

    #[test]
    fn le_connection_parameter_update_out_of_range_test() {
        let (manager, acl, sent) = setup();

        let updates = Rc::new(RefCell::new(Vec::new()));

        let slot = updates.clone();

        manager.register_le_link(
            handle(1),
            LinkRole::Central,
            Box::new(move |update| slot.borrow_mut().push(update)),
            Box::new(|| ()),
            None,
        );

        let update = ConnectionParameterUpdate {
            interval_min: 5,
            interval_max: 7,
            peripheral_latency: 1,
            timeout_multiplier: 10,
        };

        inbound_signalling(&acl, 1, 0x0005,
            SignallingCode::ConnectionParameterUpdateRequest, 0x09, &update.encode());

        assert!( updates.borrow().is_empty() );

        let commands = drain_signalling(&sent, 0x0005);

        assert_eq!( commands[0].2, CONN_PARAM_RESULT_REJECTED.to_le_bytes().to_vec() );
    }

    #[test]
    fn le_connection_parameter_update_peripheral_test() {
        let (manager, acl, sent) = setup();

        let updates = Rc::new(RefCell::new(Vec::new()));

        let slot = updates.clone();

        manager.register_le_link(
            handle(1),
            LinkRole::Peripheral,
            Box::new(move |update| slot.borrow_mut().push(update)),
            Box::new(|| ()),
            None,
        );

        let update = ConnectionParameterUpdate {
            interval_min: 6,
            interval_max: 7,
            peripheral_latency: 1,
            timeout_multiplier: 10,
        };

        inbound_signalling(&acl, 1, 0x0005,
            SignallingCode::ConnectionParameterUpdateRequest, 0x09, &update.encode());

        // a peripheral rejects the command outright and no callback runs
        assert!( updates.borrow().is_empty() );

        let commands = drain_signalling(&sent, 0x0005);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::CommandReject.to_val() );
    }

    #[test]
    fn fixed_channel_open_rules_test() {
        let (manager, _acl, _sent) = setup();

        let att = ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol);

        // no link registered yet
        assert!( manager.open_fixed_channel(handle(1), att).is_none() );

        manager.register_le_link(handle(1), LinkRole::Central, Box::new(|_| ()), Box::new(|| ()), None);

        let channel = manager.open_fixed_channel(handle(1), att).unwrap();

        assert_eq!( channel.local_cid(), 0x0004 );
        assert!( channel.is_open() );

        // a second handle for the same fixed channel is refused
        assert!( manager.open_fixed_channel(handle(1), att).is_none() );

        // the BR/EDR SMP channel doesn't exist on an LE link
        assert!( manager.open_fixed_channel(
            handle(1),
            ChannelIdentifier::Acl(AclUChannelIdentifier::SecurityManagerProtocol),
        ).is_none() );

        // the signalling channel is never handed out
        assert!( manager.open_fixed_channel(
            handle(1),
            ChannelIdentifier::Le(LeUChannelIdentifier::LowEnergyL2capSignalingChannel),
        ).is_none() );
    }

    #[test]
    fn fixed_channel_data_and_buffering_test() {
        let (manager, acl, sent) = setup();

        manager.register_le_link(handle(1), LinkRole::Central, Box::new(|_| ()), Box::new(|| ()), None);

        let att = ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol);

        let channel = manager.open_fixed_channel(handle(1), att).unwrap();

        // data before activation is buffered
        inbound(&acl, 1, 0x0004, &[0x02, 0x17, 0x00]);
        inbound(&acl, 1, 0x0004, &[0x0A, 0x05, 0x00]);

        let received = Rc::new(RefCell::new(Vec::new()));

        let slot = received.clone();

        channel.activate(
            Box::new(move |sdu| slot.borrow_mut().push(sdu)),
            Box::new(|| ()),
        ).unwrap();

        // replayed in order
        assert_eq!(
            received.borrow().as_slice(),
            &[vec![0x02, 0x17, 0x00], vec![0x0A, 0x05, 0x00]]
        );

        // activating twice is an error
        assert_eq!(
            channel.activate(Box::new(|_| ()), Box::new(|| ())).unwrap_err(),
            Error::InProgress
        );

        // outbound data is framed as a B-frame to the fixed cid
        assert!( channel.send(&[0x03, 0x17, 0x00]) );

        let packet = sent.borrow_mut().pop().unwrap();

        assert_eq!( &packet[4..], &[0x03, 0x00, 0x04, 0x00, 0x03, 0x17, 0x00][..] );

        // an SDU over the MTU is refused
        assert!( !channel.send(&vec![0u8; DEFAULT_MTU as usize + 1]) );
    }

    #[test]
    fn unregister_link_closes_channels_test() {
        let (manager, _acl, _sent) = setup();

        manager.register_le_link(handle(1), LinkRole::Central, Box::new(|_| ()), Box::new(|| ()), None);

        let att = ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol);

        let channel = manager.open_fixed_channel(handle(1), att).unwrap();

        let closed = Rc::new(RefCell::new(false));

        let slot = closed.clone();

        channel.activate(Box::new(|_| ()), Box::new(move || *slot.borrow_mut() = true)).unwrap();

        manager.unregister_link(handle(1));

        assert!( *closed.borrow() );
        assert!( !channel.is_open() );
        assert!( !channel.send(&[1]) );
    }

    #[test]
    fn inbound_fragmented_pdu_test() {
        let (manager, acl, _sent) = setup();

        manager.register_le_link(handle(1), LinkRole::Central, Box::new(|_| ()), Box::new(|| ()), None);

        let att = ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol);

        let channel = manager.open_fixed_channel(handle(1), att).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));

        let slot = received.clone();

        channel.activate(Box::new(move |sdu| slot.borrow_mut().push(sdu)), Box::new(|| ())).unwrap();

        let frame = make_basic_frame(0x0004, b"hello");

        acl.receive_packet( HciAclData::new(
            handle(1),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            Box::from(&frame[..6]),
        ));

        // nothing delivered until the final fragment
        assert!( received.borrow().is_empty() );

        acl.receive_packet( HciAclData::new(
            handle(1),
            AclPacketBoundary::ContinuingFragment,
            AclBroadcastFlag::NoBroadcast,
            Box::from(&frame[6..]),
        ));

        assert_eq!( received.borrow().as_slice(), &[b"hello".to_vec()] );
    }

    #[test]
    fn recombination_reset_on_new_start_test() {
        let (manager, acl, _sent) = setup();

        manager.register_le_link(handle(1), LinkRole::Central, Box::new(|_| ()), Box::new(|| ()), None);

        let att = ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol);

        let channel = manager.open_fixed_channel(handle(1), att).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));

        let slot = received.clone();

        channel.activate(Box::new(move |sdu| slot.borrow_mut().push(sdu)), Box::new(|| ())).unwrap();

        // a fragment that never finishes
        let incomplete = make_basic_frame(0x0004, &[1, 2, 3, 4]);

        acl.receive_packet( HciAclData::new(
            handle(1),
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            Box::from(&incomplete[..6]),
        ));

        // a fresh complete frame discards the stale recombination
        inbound(&acl, 1, 0x0004, &[9, 9]);

        assert_eq!( received.borrow().as_slice(), &[vec![9, 9]] );
    }

    #[test]
    fn ertm_negotiation_test() {
        let (manager, acl, sent) = setup();

        // the peer advertises Enhanced Retransmission support
        registered_acl_link(&manager, &acl, &sent, 1, 1 << 3);

        let params = ChannelParameters {
            mode: Some(ChannelMode::EnhancedRetransmission),
            max_rx_sdu_size: None,
        };

        manager.open_channel(handle(1), 0x0001, params, Box::new(|_| ()));

        let commands = drain_signalling(&sent, 0x0001);

        let identifier = commands[0].1;

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionResponse, identifier,
            &ConnectionResponseData {
                destination_cid: 0x9042,
                source_cid: 0x0040,
                result: ConnectionResult::Success,
                status: 0,
            }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands[0].0, SignallingCode::ConfigurationRequest.to_val() );

        let config = ConfigurationRequestData::decode(&commands[0].2).unwrap();

        let requested_ertm = config.options.iter().any(|option| matches!(
            option,
            ConfigOption::RetransmissionAndFlowControl(rfc)
                if rfc.mode == RetransmissionAndFlowControl::MODE_ENHANCED_RETRANSMISSION
        ));

        assert!( requested_ertm );

        // a peer configuration request insisting on Basic mode is unacceptable
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationRequest, 0x21,
            &ConfigurationRequestData {
                destination_cid: 0x0040,
                flags: 0,
                options: vec![ConfigOption::RetransmissionAndFlowControl(
                    RetransmissionAndFlowControl::basic()
                )],
            }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        let response = ConfigurationResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.result, ConfigurationResult::UnacceptableParameters );
    }

    #[test]
    fn ertm_falls_back_to_basic_without_peer_support_test() {
        let (manager, acl, sent) = setup();

        // no optional features at all
        registered_acl_link(&manager, &acl, &sent, 1, 0);

        let params = ChannelParameters {
            mode: Some(ChannelMode::EnhancedRetransmission),
            max_rx_sdu_size: None,
        };

        manager.open_channel(handle(1), 0x0001, params, Box::new(|_| ()));

        let commands = drain_signalling(&sent, 0x0001);

        let identifier = commands[0].1;

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionResponse, identifier,
            &ConnectionResponseData {
                destination_cid: 0x9042,
                source_cid: 0x0040,
                result: ConnectionResult::Success,
                status: 0,
            }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        let config = ConfigurationRequestData::decode(&commands[0].2).unwrap();

        // no retransmission option, the channel falls back to Basic mode
        assert!( !config.options.iter().any(|option| matches!(
            option,
            ConfigOption::RetransmissionAndFlowControl(_)
        )));
    }

    #[test]
    fn unknown_config_option_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        let delivered: Rc<RefCell<Vec<Channel<TestInterface>>>> = Rc::new(RefCell::new(Vec::new()));

        let slot = delivered.clone();

        manager.register_service(
            0x0003,
            ChannelParameters::default(),
            Box::new(move |channel| slot.borrow_mut().push(channel)),
        );

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionRequest, 0x09,
            &ConnectionRequestData { psm: 0x0003, source_cid: 0x9042 }.encode(),
        );

        drain_signalling(&sent, 0x0001);

        // an unknown non-hint option fails the configuration
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationRequest, 0x0A,
            &ConfigurationRequestData {
                destination_cid: 0x0040,
                flags: 0,
                options: vec![ConfigOption::Unknown { option_type: 0x05, data: vec![0xAA] }],
            }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        let response = ConfigurationResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.result, ConfigurationResult::UnknownOptions );
        assert_eq!(
            response.options,
            vec![ConfigOption::Unknown { option_type: 0x05, data: vec![0xAA] }]
        );
    }

    #[test]
    fn unknown_signalling_command_is_rejected_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        // Echo Request, not implemented here
        inbound(&acl, 1, 0x0001, &[0x08, 0x44, 0x00, 0x00]);

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::CommandReject.to_val() );
        assert_eq!( commands[0].1, 0x44 );
        assert_eq!( commands[0].2, vec![0x00, 0x00] );
    }

    #[test]
    fn peer_information_requests_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::InformationRequest, 0x05, &[0x02, 0x00]);

        let commands = drain_signalling(&sent, 0x0001);

        let response = InformationResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.result, INFORMATION_RESULT_SUCCESS );

        let features = u32::from_le_bytes([
            response.data[0], response.data[1], response.data[2], response.data[3],
        ]);

        assert_ne!( features & (1 << 3), 0 );
        assert_ne!( features & (1 << 7), 0 );

        // connectionless MTU is not supported by this implementation
        inbound_signalling(&acl, 1, 0x0001, SignallingCode::InformationRequest, 0x06, &[0x01, 0x00]);

        let commands = drain_signalling(&sent, 0x0001);

        let response = InformationResponseData::decode(&commands[0].2).unwrap();

        assert_eq!( response.result, INFORMATION_RESULT_NOT_SUPPORTED );
    }

    #[test]
    fn signalling_retransmission_test() {
        let (manager, _acl, sent) = setup();

        manager.register_acl_link(handle(1), LinkRole::Central, Box::new(|| ()), None);

        let first = drain_signalling(&sent, 0x0001);

        assert_eq!( first.len(), 2 );

        // no response: both information requests are retransmitted verbatim
        manager.run_timers(Instant::now() + RTX_INITIAL + std::time::Duration::from_secs(1));

        let retransmitted = drain_signalling(&sent, 0x0001);

        assert_eq!( retransmitted.len(), 2 );
        assert_eq!( first, retransmitted );
    }

    #[test]
    fn dynamic_open_times_out_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        let opened: Rc<RefCell<Option<Option<Channel<TestInterface>>>>> =
            Rc::new(RefCell::new(None));

        let slot = opened.clone();

        manager.open_channel(
            handle(1),
            0x0001,
            ChannelParameters::default(),
            Box::new(move |channel| *slot.borrow_mut() = Some(channel)),
        );

        // the peer never answers the connection request
        let base = Instant::now();

        for step in 1..=20 {
            manager.run_timers(base + std::time::Duration::from_secs(5 * step));
        }

        assert!( opened.borrow_mut().take().unwrap().is_none() );
    }

    #[test]
    fn data_before_link_registration_is_held_test() {
        let (manager, acl, _sent) = setup();

        // arrives before the link exists, parked at the manager
        inbound(&acl, 1, 0x0004, &[0x0B, 0x00]);

        manager.register_le_link(handle(1), LinkRole::Central, Box::new(|_| ()), Box::new(|| ()), None);

        // the held packet had no channel to go to and was dropped on flush
        let channel = manager.open_fixed_channel(
            handle(1),
            ChannelIdentifier::Le(LeUChannelIdentifier::AttributeProtocol),
        ).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));

        let slot = received.clone();

        channel.activate(Box::new(move |sdu| slot.borrow_mut().push(sdu)), Box::new(|| ())).unwrap();

        assert!( received.borrow().is_empty() );

        // data after registration flows normally
        inbound(&acl, 1, 0x0004, &[0x0B, 0x01]);

        assert_eq!( received.borrow().as_slice(), &[vec![0x0B, 0x01]] );
    }

    #[test]
    fn dropping_last_handle_disconnects_dynamic_channel_test() {
        let (manager, acl, sent) = setup();

        registered_acl_link(&manager, &acl, &sent, 1, 0);

        let opened: Rc<RefCell<Option<Option<Channel<TestInterface>>>>> =
            Rc::new(RefCell::new(None));

        let slot = opened.clone();

        manager.open_channel(
            handle(1),
            0x0001,
            ChannelParameters::default(),
            Box::new(move |channel| *slot.borrow_mut() = Some(channel)),
        );

        let commands = drain_signalling(&sent, 0x0001);

        let identifier = commands[0].1;

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConnectionResponse, identifier,
            &ConnectionResponseData {
                destination_cid: 0x9042,
                source_cid: 0x0040,
                result: ConnectionResult::Success,
                status: 0,
            }.encode(),
        );

        let commands = drain_signalling(&sent, 0x0001);

        let config_identifier = commands[0].1;

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationRequest, 0x0A,
            &ConfigurationRequestData { destination_cid: 0x0040, flags: 0, options: Vec::new() }.encode(),
        );

        inbound_signalling(&acl, 1, 0x0001, SignallingCode::ConfigurationResponse, config_identifier,
            &ConfigurationResponseData {
                source_cid: 0x0040,
                flags: 0,
                result: ConfigurationResult::Success,
                options: Vec::new(),
            }.encode(),
        );

        drain_signalling(&sent, 0x0001);

        // drop the only user handle
        let channel = opened.borrow_mut().take().unwrap().unwrap();

        drop(channel);

        let commands = drain_signalling(&sent, 0x0001);

        assert_eq!( commands.len(), 1 );
        assert_eq!( commands[0].0, SignallingCode::DisconnectionRequest.to_val() );

        let request = DisconnectionData::decode(&commands[0].2).unwrap();

        assert_eq!( request.destination_cid, 0x9042 );
        assert_eq!( request.source_cid, 0x0040 );
    }
}
