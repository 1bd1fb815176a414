//! HCI command and event flow control
//!
//! The controller only accepts a limited number of outstanding commands, it
//! reports how many with the *Num HCI Command Packets* parameter of every
//! Command Status and Command Complete event (v5 | Vol 2, Part E, Section
//! 4.4). The [`CommandChannel`] enforces that pipeline, matches response
//! events back to the commands that caused them, and routes every other event
//! to registered event handlers.
//!
//! Commands are queued first-come-first-served. A queued command is skipped
//! over (without blocking unrelated commands behind it) while
//!
//! * the controller reports no free command credits,
//! * a command with the same opcode is in flight,
//! * a command whose opcode is in this command's exclusion set (or the
//!   reverse) is in flight, or
//! * this command is asynchronous and another command awaiting the same
//!   completion event (or LE subevent) is in flight.
//!
//! Skipping preserves per opcode ordering while letting unrelated commands
//! through.
//!
//! [`CommandChannel`]: struct.CommandChannel.html

use core::convert::TryFrom;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::hci::events::{
    CommandCompleteData,
    CommandStatusData,
    EventPacket,
    Events,
};
use crate::hci::{CommandPacket, HciCommandInterface};
use crate::timer::{DeadlineQueue, TimerId};

/// Identifies one command transaction, 0 is never a valid id
pub type TransactionId = u64;

/// Identifies one registered event handler, 0 is never a valid id
pub type EventHandlerId = u64;

/// The default time a command may stay unanswered before its caller is notified
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(12);

/// An event delivered to a command's callback
pub enum CommandEvent {
    /// A Command Status event for the command
    ///
    /// This is the completion when the command was sent expecting completion
    /// on Command Status, otherwise it is an intermediate event and the
    /// completion follows.
    Status(CommandStatusData),
    /// The completion event of the command
    Complete(EventPacket),
    /// The command went unanswered past the command timeout
    ///
    /// This is terminal for the caller, but the opcode stays occupied until
    /// the controller answers or the transport is reset.
    TimedOut,
}

/// Return value of event handler callbacks
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum EventCallbackResult {
    /// Keep the handler registered
    Continue,
    /// Remove this handler, it will see no event after the current one
    Remove,
}

pub type CommandCallback = Box<dyn FnMut(TransactionId, CommandEvent)>;

pub type EventCallback = Box<dyn FnMut(&EventPacket) -> EventCallbackResult>;

struct QueuedCommand {
    id: TransactionId,
    packet: CommandPacket,
    complete_event_code: u8,
    subevent_code: Option<u8>,
    exclusions: HashSet<u16>,
    callback: Option<CommandCallback>,
}

struct PendingCommand {
    id: TransactionId,
    complete_event_code: u8,
    subevent_code: Option<u8>,
    exclusions: HashSet<u16>,
    callback: Option<CommandCallback>,
    timer: TimerId,
    timed_out: bool,
}

struct EventHandlerData {
    event_code: u8,
    is_le_meta_subevent: bool,
    callback: Option<EventCallback>,
}

struct CommandChannelInner<I> {
    interface: I,
    /// Credits as last reported by the controller
    allowed_command_packets: usize,
    next_transaction_id: TransactionId,
    next_event_handler_id: EventHandlerId,
    send_queue: VecDeque<QueuedCommand>,
    /// In flight commands, keyed by opcode
    pending: HashMap<u16, PendingCommand>,
    handlers: HashMap<EventHandlerId, EventHandlerData>,
    /// Handler ids per event code, in registration order
    event_code_handlers: HashMap<u8, Vec<EventHandlerId>>,
    /// Handler ids per LE Meta subevent code, in registration order
    subevent_code_handlers: HashMap<u8, Vec<EventHandlerId>>,
    /// Command timeout deadlines, tokens are pending opcodes
    timeouts: DeadlineQueue<u16>,
    command_timeout: Duration,
    timeout_callback: Option<Box<dyn FnMut()>>,
    transport_error_callback: Option<Box<dyn FnMut()>>,
}

/// The HCI command channel
///
/// A `CommandChannel` is a cheap handle, clones share the same channel state.
/// All methods must be called from the single thread the core runs on.
pub struct CommandChannel<I> {
    inner: Rc<RefCell<CommandChannelInner<I>>>,
}

impl<I> Clone for CommandChannel<I> {
    fn clone(&self) -> Self {
        CommandChannel { inner: self.inner.clone() }
    }
}

impl<I> CommandChannel<I>
where I: HciCommandInterface,
{
    pub fn new(interface: I) -> Self {
        CommandChannel {
            inner: Rc::new(RefCell::new( CommandChannelInner {
                interface,
                // a freshly powered controller accepts one command
                allowed_command_packets: 1,
                next_transaction_id: 1,
                next_event_handler_id: 1,
                send_queue: VecDeque::new(),
                pending: HashMap::new(),
                handlers: HashMap::new(),
                event_code_handlers: HashMap::new(),
                subevent_code_handlers: HashMap::new(),
                timeouts: DeadlineQueue::new(),
                command_timeout: COMMAND_TIMEOUT,
                timeout_callback: None,
                transport_error_callback: None,
            })),
        }
    }

    /// Send a command that completes on a Command Complete event
    ///
    /// The returned transaction id is non zero on success. The callback is
    /// invoked with every event belonging to the transaction.
    pub fn send_command(&self, packet: CommandPacket, callback: CommandCallback) -> TransactionId {
        self.send_internal(packet, callback, Events::CommandComplete.to_val(), None, HashSet::new())
    }

    /// Send a command that completes on `complete_event_code`
    ///
    /// The callback first receives the Command Status event for the command
    /// and then the completion event. Passing the Command Status event code
    /// makes the status itself the completion.
    ///
    /// Returns 0 if `complete_event_code` is claimed by a registered event
    /// handler, or is the LE Meta event code (use
    /// [`send_le_async_command`](#method.send_le_async_command)).
    pub fn send_async_command(
        &self,
        packet: CommandPacket,
        callback: CommandCallback,
        complete_event_code: u8,
    ) -> TransactionId
    {
        self.send_internal(packet, callback, complete_event_code, None, HashSet::new())
    }

    /// Send a command that completes on an LE Meta subevent
    pub fn send_le_async_command(
        &self,
        packet: CommandPacket,
        callback: CommandCallback,
        subevent_code: u8,
    ) -> TransactionId
    {
        self.send_internal(
            packet,
            callback,
            Events::LEMeta.to_val(),
            Some(subevent_code),
            HashSet::new(),
        )
    }

    /// Send a command that must not run concurrently with the excluded opcodes
    ///
    /// While this command is queued or in flight, commands whose opcode is in
    /// `exclusions` stay queued, and the other way around. Useful for
    /// controller procedures that cannot overlap (such as Inquiry and
    /// Create Connection).
    pub fn send_exclusive_command(
        &self,
        packet: CommandPacket,
        callback: CommandCallback,
        complete_event_code: u8,
        exclusions: &[u16],
    ) -> TransactionId
    {
        self.send_internal(
            packet,
            callback,
            complete_event_code,
            None,
            exclusions.iter().copied().collect(),
        )
    }

    fn send_internal(
        &self,
        packet: CommandPacket,
        callback: CommandCallback,
        complete_event_code: u8,
        subevent_code: Option<u8>,
        exclusions: HashSet<u16>,
    ) -> TransactionId
    {
        let (id, send_failed) = {
            let mut inner = self.inner.borrow_mut();

            if !packet.is_valid() {
                log::error!("Command {:#06X} parameters exceed the maximum length", packet.get_opcode());
                return 0;
            }

            let is_async = complete_event_code != Events::CommandComplete.to_val()
                && complete_event_code != Events::CommandStatus.to_val();

            if is_async {
                // completion on the LE Meta event itself is ambiguous, a
                // subevent code is required
                if complete_event_code == Events::LEMeta.to_val() && subevent_code.is_none() {
                    return 0;
                }

                if inner.handler_registered(complete_event_code, subevent_code) {
                    return 0;
                }
            }

            let id = inner.next_transaction_id;

            inner.next_transaction_id += 1;

            inner.send_queue.push_back( QueuedCommand {
                id,
                packet,
                complete_event_code,
                subevent_code,
                exclusions,
                callback: Some(callback),
            });

            (id, inner.try_send_queued())
        };

        if send_failed { self.notify_transport_error() }

        id
    }

    /// Remove a queued command
    ///
    /// Succeeds only when the command has not been sent to the controller
    /// yet. Its callback is never invoked. Returns false if the command was
    /// already sent or is unknown.
    pub fn remove_queued(&self, id: TransactionId) -> bool {
        let mut inner = self.inner.borrow_mut();

        match inner.send_queue.iter().position(|queued| queued.id == id) {
            Some(index) => {
                inner.send_queue.remove(index);
                true
            },
            None => false,
        }
    }

    /// Register a handler for an event code
    ///
    /// The handler sees every received event with this code that is not a
    /// Command Complete or Command Status event. Multiple handlers may be
    /// registered for one code, they are invoked in registration order.
    ///
    /// Returns 0 when `event_code` is the Command Complete, Command Status or
    /// LE Meta event code, or when an asynchronous command awaiting
    /// completion on this code is outstanding.
    pub fn add_event_handler(&self, event_code: u8, callback: EventCallback) -> EventHandlerId {
        let mut inner = self.inner.borrow_mut();

        if event_code == Events::CommandComplete.to_val()
            || event_code == Events::CommandStatus.to_val()
            || event_code == Events::LEMeta.to_val()
        {
            return 0;
        }

        if inner.async_command_claims(event_code, None) {
            return 0;
        }

        let id = inner.new_handler(event_code, false, callback);

        inner.event_code_handlers.entry(event_code).or_insert_with(Vec::new).push(id);

        id
    }

    /// Register a handler for an LE Meta subevent code
    ///
    /// Works like [`add_event_handler`](#method.add_event_handler) within the
    /// LE Meta subevent namespace. `subevent_code` cannot be 0.
    pub fn add_le_meta_event_handler(&self, subevent_code: u8, callback: EventCallback) -> EventHandlerId {
        let mut inner = self.inner.borrow_mut();

        if subevent_code == 0 {
            return 0;
        }

        if inner.async_command_claims(Events::LEMeta.to_val(), Some(subevent_code)) {
            return 0;
        }

        let id = inner.new_handler(subevent_code, true, callback);

        inner.subevent_code_handlers.entry(subevent_code).or_insert_with(Vec::new).push(id);

        id
    }

    /// Remove a registered event handler
    ///
    /// Does nothing if no handler with `id` exists, removing twice is safe.
    pub fn remove_event_handler(&self, id: EventHandlerId) {
        self.inner.borrow_mut().remove_handler(id);
    }

    /// Set the callback fired once per command that exceeds the command timeout
    pub fn set_timeout_callback(&self, callback: Box<dyn FnMut()>) {
        self.inner.borrow_mut().timeout_callback = Some(callback);
    }

    /// Override the default command timeout
    pub fn set_command_timeout(&self, timeout: Duration) {
        self.inner.borrow_mut().command_timeout = timeout;
    }

    /// Set the callback fired when a write to the command interface fails
    pub fn set_transport_error_callback(&self, callback: Box<dyn FnMut()>) {
        self.inner.borrow_mut().transport_error_callback = Some(callback);
    }

    /// Process an event received from the controller
    ///
    /// This is normally called by [`Transport::on_event`], call it directly
    /// when driving the channel without the transport wrapper.
    ///
    /// [`Transport::on_event`]: ../struct.Transport.html#method.on_event
    pub fn receive_event(&self, event: EventPacket) {
        let code = event.get_event_code();

        if code == Events::CommandComplete.to_val() {
            self.on_command_complete(event);
        } else if code == Events::CommandStatus.to_val() {
            self.on_command_status(event);
        } else {
            self.on_other_event(event);
        }
    }

    /// The next instant a command timeout is due
    pub fn next_timeout(&self) -> Option<Instant> {
        self.inner.borrow().timeouts.next_deadline()
    }

    /// Fire every command timeout that is due at `now`
    ///
    /// Each expired command gets a final `TimedOut` callback and the user
    /// visible timeout callback is invoked. The command's credit is *not*
    /// restored and its opcode stays occupied, recovery is up to the embedder.
    pub fn run_timers(&self, now: Instant) {
        loop {
            let expired = {
                let mut inner = self.inner.borrow_mut();

                match inner.timeouts.pop_expired(now) {
                    Some((_, opcode)) => {
                        match inner.pending.get_mut(&opcode) {
                            Some(pending) => {
                                pending.timed_out = true;

                                pending.callback.take().map(|callback| (pending.id, callback))
                            },
                            None => None,
                        }
                    },
                    None => break,
                }
            };

            if let Some((id, mut callback)) = expired {
                log::warn!("Command transaction {} timed out", id);

                callback(id, CommandEvent::TimedOut);

                self.notify_timeout();
            }
        }
    }

    fn on_command_complete(&self, event: EventPacket) {
        let (finished, send_failed) = {
            let mut inner = self.inner.borrow_mut();

            let data = match CommandCompleteData::try_from(event.get_parameters()) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Dropping malformed Command Complete event: {}", e);
                    return;
                },
            };

            inner.allowed_command_packets = data.number_of_hci_command_packets as usize;

            let finished = match data.command_opcode {
                Some(opcode) => match inner.pending.remove(&opcode) {
                    Some(mut pending) => {
                        inner.timeouts.remove(pending.timer);

                        pending.callback.take().map(|callback| (pending.id, callback))
                    },
                    None => {
                        log::debug!(
                            "Command Complete for opcode {:#06X} without a pending command",
                            opcode
                        );
                        None
                    },
                },
                // an opcode of zero is just a credit refresh
                None => None,
            };

            (finished, inner.try_send_queued())
        };

        if let Some((id, mut callback)) = finished {
            callback(id, CommandEvent::Complete(event));
        }

        if send_failed { self.notify_transport_error() }
    }

    fn on_command_status(&self, event: EventPacket) {
        enum Disposition {
            Terminal(TransactionId, CommandCallback, CommandStatusData),
            Intermediate(TransactionId, CommandCallback, CommandStatusData, u16),
            None,
        }

        let (disposition, send_failed) = {
            let mut inner = self.inner.borrow_mut();

            let data = match CommandStatusData::try_from(event.get_parameters()) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Dropping malformed Command Status event: {}", e);
                    return;
                },
            };

            inner.allowed_command_packets = data.number_of_hci_command_packets as usize;

            let disposition = match data.command_opcode {
                Some(opcode) if inner.pending.contains_key(&opcode) => {
                    let completes = inner.pending.get(&opcode)
                        .map(|p| p.complete_event_code == Events::CommandStatus.to_val())
                        .unwrap_or(false);

                    if completes {
                        let mut pending = inner.pending.remove(&opcode).unwrap_or_else(|| unreachable!());

                        inner.timeouts.remove(pending.timer);

                        match pending.callback.take() {
                            Some(callback) => Disposition::Terminal(pending.id, callback, data),
                            None => Disposition::None,
                        }
                    } else {
                        let pending = inner.pending.get_mut(&opcode).unwrap_or_else(|| unreachable!());

                        match pending.callback.take() {
                            Some(callback) =>
                                Disposition::Intermediate(pending.id, callback, data, opcode),
                            None => Disposition::None,
                        }
                    }
                },
                // a status with no (or an unassociated) opcode refreshes
                // credits without completing anything
                _ => Disposition::None,
            };

            (disposition, inner.try_send_queued())
        };

        match disposition {
            Disposition::Terminal(id, mut callback, data) => {
                callback(id, CommandEvent::Status(data));
            },
            Disposition::Intermediate(id, mut callback, data, opcode) => {
                callback(id, CommandEvent::Status(data));

                let mut inner = self.inner.borrow_mut();

                if let Some(pending) = inner.pending.get_mut(&opcode) {
                    if pending.callback.is_none() && !pending.timed_out {
                        pending.callback = Some(callback);
                    }
                }
            },
            Disposition::None => (),
        }

        if send_failed { self.notify_transport_error() }
    }

    fn on_other_event(&self, event: EventPacket) {
        let code = event.get_event_code();

        let handler_ids: Vec<EventHandlerId> = {
            let inner = self.inner.borrow();

            let mut ids = inner.event_code_handlers.get(&code).cloned().unwrap_or_default();

            if code == Events::LEMeta.to_val() {
                if let Some(subevent) = event.get_le_meta_subevent() {
                    if let Some(sub_ids) = inner.subevent_code_handlers.get(&subevent) {
                        ids.extend_from_slice(sub_ids);
                    }
                }
            }

            ids
        };

        for id in handler_ids {
            let callback = {
                let mut inner = self.inner.borrow_mut();

                inner.handlers.get_mut(&id).and_then(|handler| handler.callback.take())
            };

            if let Some(mut callback) = callback {
                let result = callback(&event);

                let mut inner = self.inner.borrow_mut();

                match result {
                    EventCallbackResult::Continue => {
                        if let Some(handler) = inner.handlers.get_mut(&id) {
                            if handler.callback.is_none() {
                                handler.callback = Some(callback);
                            }
                        }
                    },
                    EventCallbackResult::Remove => inner.remove_handler(id),
                }
            }
        }

        // the event may be the awaited completion of an asynchronous command
        let (completion, send_failed) = {
            let mut inner = self.inner.borrow_mut();

            let opcode = inner.pending.iter()
                .find(|(_, pending)| match pending.subevent_code {
                    Some(subevent) => code == Events::LEMeta.to_val()
                        && event.get_le_meta_subevent() == Some(subevent),
                    None => pending.complete_event_code == code,
                })
                .map(|(opcode, _)| *opcode);

            let completion = opcode.and_then(|opcode| inner.pending.remove(&opcode))
                .and_then(|mut pending| {
                    inner.timeouts.remove(pending.timer);

                    pending.callback.take().map(|callback| (pending.id, callback))
                });

            (completion, inner.try_send_queued())
        };

        if let Some((id, mut callback)) = completion {
            callback(id, CommandEvent::Complete(event));
        }

        if send_failed { self.notify_transport_error() }
    }

    fn notify_timeout(&self) {
        let callback = self.inner.borrow_mut().timeout_callback.take();

        if let Some(mut callback) = callback {
            callback();

            let mut inner = self.inner.borrow_mut();

            if inner.timeout_callback.is_none() {
                inner.timeout_callback = Some(callback);
            }
        }
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

impl<I> CommandChannelInner<I>
where I: HciCommandInterface,
{
    fn handler_registered(&self, event_code: u8, subevent_code: Option<u8>) -> bool {
        match subevent_code {
            Some(subevent) => self.subevent_code_handlers.get(&subevent)
                .map(|ids| !ids.is_empty())
                .unwrap_or(false),
            None => self.event_code_handlers.get(&event_code)
                .map(|ids| !ids.is_empty())
                .unwrap_or(false),
        }
    }

    /// Check if an in flight or queued asynchronous command claims the event
    fn async_command_claims(&self, event_code: u8, subevent_code: Option<u8>) -> bool {
        let matches = |code: u8, subevent: Option<u8>| {
            code == event_code && subevent == subevent_code
                && code != Events::CommandComplete.to_val()
                && code != Events::CommandStatus.to_val()
        };

        self.pending.values()
            .any(|pending| matches(pending.complete_event_code, pending.subevent_code))
        || self.send_queue.iter()
            .any(|queued| matches(queued.complete_event_code, queued.subevent_code))
    }

    fn new_handler(&mut self, event_code: u8, is_le_meta_subevent: bool, callback: EventCallback) -> EventHandlerId {
        let id = self.next_event_handler_id;

        self.next_event_handler_id += 1;

        self.handlers.insert(id, EventHandlerData {
            event_code,
            is_le_meta_subevent,
            callback: Some(callback),
        });

        id
    }

    fn remove_handler(&mut self, id: EventHandlerId) {
        if let Some(handler) = self.handlers.remove(&id) {
            let list = if handler.is_le_meta_subevent {
                self.subevent_code_handlers.get_mut(&handler.event_code)
            } else {
                self.event_code_handlers.get_mut(&handler.event_code)
            };

            if let Some(ids) = list {
                ids.retain(|&entry| entry != id);
            }
        }
    }

    /// Check whether the queued command is currently blocked by an in flight one
    fn is_blocked(&self, queued: &QueuedCommand) -> bool {
        let opcode = queued.packet.get_opcode();

        if self.pending.contains_key(&opcode) {
            return true;
        }

        let excluded = self.pending.iter().any(|(pending_opcode, pending)| {
            pending.exclusions.contains(&opcode) || queued.exclusions.contains(pending_opcode)
        });

        if excluded {
            return true;
        }

        let is_async = queued.complete_event_code != Events::CommandComplete.to_val()
            && queued.complete_event_code != Events::CommandStatus.to_val();

        is_async && self.pending.values().any(|pending| {
            pending.complete_event_code == queued.complete_event_code
                && pending.subevent_code == queued.subevent_code
        })
    }

    /// Send every queued command that is unblocked, in queue order
    ///
    /// Returns true if a write to the interface failed.
    fn try_send_queued(&mut self) -> bool {
        let mut send_failed = false;

        let mut index = 0;

        while index < self.send_queue.len() {
            if self.allowed_command_packets == 0 {
                break;
            }

            if self.is_blocked(&self.send_queue[index]) {
                index += 1;
                continue;
            }

            let mut queued = match self.send_queue.remove(index) {
                Some(queued) => queued,
                None => break,
            };

            self.allowed_command_packets -= 1;

            let opcode = queued.packet.get_opcode();

            log::debug!("Sending command {:#06X} (transaction {})", opcode, queued.id);

            if let Err(e) = self.interface.send_command(&queued.packet.into_packet()) {
                // the credit is gone either way, the transport error callback
                // tells the embedder to reset everything
                log::error!("Failed to send command {:#06X}: {}", opcode, e);

                send_failed = true;
            }

            let timer = self.timeouts.add(Instant::now() + self.command_timeout, opcode);

            self.pending.insert(opcode, PendingCommand {
                id: queued.id,
                complete_event_code: queued.complete_event_code,
                subevent_code: queued.subevent_code,
                exclusions: core::mem::take(&mut queued.exclusions),
                callback: queued.callback.take(),
                timer,
                timed_out: false,
            });
        }

        send_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::events::EventPacket;

    /// Records every packet written to the command pipe
    #[derive(Clone, Default)]
    struct TestInterface {
        sent: Rc<RefCell<Vec<Box<[u8]>>>>,
    }

    impl HciCommandInterface for TestInterface {
        type Error = &'static str;

        fn send_command(&mut self, packet: &[u8]) -> Result<(), Self::Error> {
            self.sent.borrow_mut().push(Box::from(packet));
            Ok(())
        }
    }

    const RESET: u16 = 0x0C03;
    const INQUIRY: u16 = 0x0401;
    const INQUIRY_COMPLETE: u8 = 0x01;

    fn channel() -> (CommandChannel<TestInterface>, Rc<RefCell<Vec<Box<[u8]>>>>) {
        let interface = TestInterface::default();
        let sent = interface.sent.clone();

        (CommandChannel::new(interface), sent)
    }

    fn command_complete(opcode: u16, credits: u8, return_parameters: &[u8]) -> EventPacket {
        let mut parameters = vec![credits, opcode as u8, (opcode >> 8) as u8];

        parameters.extend_from_slice(return_parameters);

        EventPacket::new(Events::CommandComplete.to_val(), parameters.into_boxed_slice())
    }

    fn command_status(status: u8, credits: u8, opcode: u16) -> EventPacket {
        EventPacket::new(
            Events::CommandStatus.to_val(),
            Box::from(&[status, credits, opcode as u8, (opcode >> 8) as u8][..]),
        )
    }

    fn record_events(log: &Rc<RefCell<Vec<String>>>) -> CommandCallback {
        let log = log.clone();

        Box::new(move |id, event| {
            let entry = match event {
                CommandEvent::Status(data) =>
                    format!("{}:status:{}", id, if data.status.is_ok() { "ok" } else { "err" }),
                CommandEvent::Complete(packet) =>
                    format!("{}:complete:{:#04X}", id, packet.get_event_code()),
                CommandEvent::TimedOut => format!("{}:timeout", id),
            };

            log.borrow_mut().push(entry);
        })
    }

    #[test]
    fn credit_refresh_test() {
        let (channel, sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = channel.send_command(CommandPacket::new(RESET, &[]), record_events(&log));
        let second = channel.send_command(CommandPacket::new(RESET, &[]), record_events(&log));

        assert_ne!(first, 0);
        assert_ne!(second, 0);

        // one credit, and the second reset also waits on the first's opcode
        assert_eq!(sent.borrow().len(), 1);

        // complete the first but report zero credits
        channel.receive_event(command_complete(RESET, 0, &[0x00]));

        assert_eq!(log.borrow().as_slice(), &[format!("{}:complete:0x0E", first)]);
        assert_eq!(sent.borrow().len(), 1);

        // an unassociated Command Status refreshes the credits
        channel.receive_event(command_status(0x00, 1, 0x0000));

        assert_eq!(sent.borrow().len(), 2);
    }

    #[test]
    fn async_command_completion_test() {
        let (channel, sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let id = channel.send_async_command(
            CommandPacket::new(INQUIRY, &[0x33, 0x8B, 0x9E, 0x08, 0x00]),
            record_events(&log),
            INQUIRY_COMPLETE,
        );

        assert_ne!(id, 0);
        assert_eq!(sent.borrow().len(), 1);

        channel.receive_event(command_status(0x00, 1, INQUIRY));

        // status is intermediate, the command is still in flight
        assert_eq!(log.borrow().as_slice(), &[format!("{}:status:ok", id)]);

        channel.receive_event(EventPacket::new(INQUIRY_COMPLETE, Box::from(&[0x00][..])));

        assert_eq!(
            log.borrow().as_slice(),
            &[format!("{}:status:ok", id), format!("{}:complete:0x01", id)]
        );

        // the completion slot is free again, a second inquiry goes right out
        let second = channel.send_async_command(
            CommandPacket::new(INQUIRY, &[0x33, 0x8B, 0x9E, 0x08, 0x00]),
            record_events(&log),
            INQUIRY_COMPLETE,
        );

        assert_ne!(second, 0);
        assert_eq!(sent.borrow().len(), 2);
    }

    #[test]
    fn handler_and_async_command_collision_test() {
        let (channel, _sent) = channel();

        let handler_id = channel.add_event_handler(
            0xFE,
            Box::new(|_| EventCallbackResult::Continue),
        );

        assert_ne!(handler_id, 0);

        // an async command cannot await an event a handler is registered for
        assert_eq!(
            channel.send_async_command(
                CommandPacket::new(INQUIRY, &[]),
                Box::new(|_, _| ()),
                0xFE,
            ),
            0
        );

        channel.remove_event_handler(handler_id);

        let id = channel.send_async_command(
            CommandPacket::new(INQUIRY, &[]),
            Box::new(|_, _| ()),
            0xFE,
        );

        assert_ne!(id, 0);

        // and the other way around
        assert_eq!(
            channel.add_event_handler(0xFE, Box::new(|_| EventCallbackResult::Continue)),
            0
        );

        // unrelated codes are unaffected
        assert_ne!(
            channel.add_event_handler(0xFD, Box::new(|_| EventCallbackResult::Continue)),
            0
        );
    }

    #[test]
    fn reserved_event_handler_codes_test() {
        let (channel, _sent) = channel();

        let cb = || Box::new(|_: &EventPacket| EventCallbackResult::Continue);

        assert_eq!(channel.add_event_handler(Events::CommandComplete.to_val(), cb()), 0);
        assert_eq!(channel.add_event_handler(Events::CommandStatus.to_val(), cb()), 0);
        assert_eq!(channel.add_event_handler(Events::LEMeta.to_val(), cb()), 0);
        assert_eq!(channel.add_le_meta_event_handler(0, cb()), 0);
    }

    #[test]
    fn exclusive_command_test() {
        let (channel, sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        // plenty of credits
        channel.receive_event(command_status(0x00, 5, 0x0000));

        let inquiry = channel.send_exclusive_command(
            CommandPacket::new(INQUIRY, &[]),
            record_events(&log),
            INQUIRY_COMPLETE,
            &[0x0405],
        );

        // excluded by the in flight inquiry
        let create_connection = channel.send_exclusive_command(
            CommandPacket::new(0x0405, &[]),
            record_events(&log),
            0x03,
            &[INQUIRY],
        );

        // unrelated command skips past the blocked one
        let reset = channel.send_command(CommandPacket::new(RESET, &[]), record_events(&log));

        assert_ne!(inquiry, 0);
        assert_ne!(create_connection, 0);
        assert_ne!(reset, 0);

        assert_eq!(sent.borrow().len(), 2);
        assert_eq!(u16::from_le_bytes([sent.borrow()[1][0], sent.borrow()[1][1]]), RESET);

        // inquiry completes, the excluded command may now go out
        channel.receive_event(command_status(0x00, 5, INQUIRY));
        channel.receive_event(EventPacket::new(INQUIRY_COMPLETE, Box::from(&[0x00][..])));

        assert_eq!(sent.borrow().len(), 3);
        assert_eq!(u16::from_le_bytes([sent.borrow()[2][0], sent.borrow()[2][1]]), 0x0405);
    }

    #[test]
    fn remove_queued_command_test() {
        let (channel, sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = channel.send_command(CommandPacket::new(RESET, &[]), record_events(&log));
        let second = channel.send_command(CommandPacket::new(RESET, &[]), record_events(&log));

        // the first was sent immediately so it cannot be removed
        assert!(!channel.remove_queued(first));

        // the second is still queued
        assert!(channel.remove_queued(second));
        assert!(!channel.remove_queued(second));

        channel.receive_event(command_complete(RESET, 1, &[0x00]));

        // the removed command was never sent and its callback never ran
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn command_timeout_test() {
        let (channel, sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        let timeout_fired = Rc::new(RefCell::new(0));

        let fired = timeout_fired.clone();

        channel.set_timeout_callback(Box::new(move || *fired.borrow_mut() += 1));

        let first = channel.send_command(CommandPacket::new(RESET, &[]), record_events(&log));
        let _second = channel.send_command(CommandPacket::new(0x0C01, &[0; 8]), record_events(&log));

        assert_eq!(sent.borrow().len(), 1);

        channel.run_timers(Instant::now() + COMMAND_TIMEOUT + Duration::from_secs(1));

        assert_eq!(log.borrow().as_slice(), &[format!("{}:timeout", first)]);
        assert_eq!(*timeout_fired.borrow(), 1);

        // the timed out command still occupies the credit, nothing else was sent
        assert_eq!(sent.borrow().len(), 1);

        // a late Command Complete frees the slot and restores the credits
        channel.receive_event(command_complete(RESET, 1, &[0x00]));

        assert_eq!(sent.borrow().len(), 2);

        // the timed out caller gets nothing after the TimedOut event
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn event_handler_dispatch_order_test() {
        let (channel, _sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second"].iter() {
            let log = log.clone();
            let name = *name;

            channel.add_event_handler(0x10, Box::new(move |_| {
                log.borrow_mut().push(name);
                EventCallbackResult::Continue
            }));
        }

        channel.receive_event(EventPacket::new(0x10, Box::from(&[][..])));

        assert_eq!(log.borrow().as_slice(), &["first", "second"]);
    }

    #[test]
    fn event_handler_remove_during_dispatch_test() {
        let (channel, _sent) = channel();
        let count = Rc::new(RefCell::new(0));

        let counter = count.clone();

        let id = channel.add_event_handler(0x10, Box::new(move |_| {
            *counter.borrow_mut() += 1;
            EventCallbackResult::Remove
        }));

        assert_ne!(id, 0);

        channel.receive_event(EventPacket::new(0x10, Box::from(&[][..])));
        channel.receive_event(EventPacket::new(0x10, Box::from(&[][..])));

        // removed itself after the first event
        assert_eq!(*count.borrow(), 1);

        // removing again is harmless
        channel.remove_event_handler(id);
    }

    #[test]
    fn le_meta_subevent_test() {
        let (channel, sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));
        let handled = Rc::new(RefCell::new(Vec::new()));

        let subevents = handled.clone();

        channel.add_le_meta_event_handler(0x02, Box::new(move |event| {
            subevents.borrow_mut().push(event.get_le_meta_subevent());
            EventCallbackResult::Continue
        }));

        channel.receive_event(command_status(0x00, 5, 0x0000));

        // two LE commands awaiting the same subevent are serialized
        let first = channel.send_le_async_command(
            CommandPacket::new(0x200D, &[]),
            record_events(&log),
            0x0A,
        );

        let second = channel.send_le_async_command(
            CommandPacket::new(0x2019, &[]),
            record_events(&log),
            0x0A,
        );

        assert_ne!(first, 0);
        assert_ne!(second, 0);
        assert_eq!(sent.borrow().len(), 1);

        // an advertising report goes to the subevent handler only
        channel.receive_event(EventPacket::new(0x3E, Box::from(&[0x02, 0x00][..])));

        assert_eq!(handled.borrow().as_slice(), &[Some(0x02)]);
        assert!(log.borrow().is_empty());

        // subevent 0x0A completes the first command, freeing the second
        channel.receive_event(EventPacket::new(0x3E, Box::from(&[0x0A, 0x00][..])));

        assert_eq!(log.borrow().as_slice(), &[format!("{}:complete:0x3E", first)]);
        assert_eq!(sent.borrow().len(), 2);
    }

    #[test]
    fn status_completion_test() {
        let (channel, _sent) = channel();
        let log = Rc::new(RefCell::new(Vec::new()));

        // completes on the Command Status event itself
        let id = channel.send_async_command(
            CommandPacket::new(0x0406, &[0x01, 0x00, 0x13]),
            record_events(&log),
            Events::CommandStatus.to_val(),
        );

        channel.receive_event(command_status(0x00, 1, 0x0406));

        assert_eq!(log.borrow().as_slice(), &[format!("{}:status:ok", id)]);

        // completed, so the opcode can be sent again
        let second = channel.send_async_command(
            CommandPacket::new(0x0406, &[0x02, 0x00, 0x13]),
            record_events(&log),
            Events::CommandStatus.to_val(),
        );

        assert_ne!(second, 0);
    }
}
