//! Strictly ordered command sequences
//!
//! The command channel only orders commands sharing an opcode or completion
//! event, everything else may overtake a queued command. Controller bring up
//! and procedure setup usually need a stronger guarantee: run these commands
//! one after the other and stop at the first failure. The
//! [`SequentialCommandRunner`] provides that on top of a [`CommandChannel`].
//!
//! [`SequentialCommandRunner`]: struct.SequentialCommandRunner.html
//! [`CommandChannel`]: ../command_channel/struct.CommandChannel.html

use core::convert::TryFrom;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::hci::command_channel::{CommandChannel, CommandEvent};
use crate::hci::events::{CommandCompleteData, Events};
use crate::hci::{CommandPacket, HciCommandInterface};
use crate::Error;

pub type ResultCallback = Box<dyn FnOnce(Result<(), Error>)>;

struct RunnerState {
    queue: VecDeque<(CommandPacket, u8)>,
    /// Bumped on cancel, events of stale sequences are ignored
    sequence: u64,
    running: bool,
    result_callback: Option<ResultCallback>,
}

/// Runs queued commands strictly one at a time
///
/// Each command must complete successfully before the next one is sent. The
/// first failure (error status, protocol error or timeout) aborts the rest of
/// the sequence and is reported through the result callback.
pub struct SequentialCommandRunner<I> {
    channel: CommandChannel<I>,
    state: Rc<RefCell<RunnerState>>,
}

impl<I> SequentialCommandRunner<I>
where I: HciCommandInterface + 'static,
{
    pub fn new(channel: CommandChannel<I>) -> Self {
        SequentialCommandRunner {
            channel,
            state: Rc::new(RefCell::new( RunnerState {
                queue: VecDeque::new(),
                sequence: 0,
                running: false,
                result_callback: None,
            })),
        }
    }

    /// Queue a command completing on Command Complete
    pub fn queue_command(&self, packet: CommandPacket) {
        self.state.borrow_mut().queue.push_back((packet, Events::CommandComplete.to_val()));
    }

    /// Queue a command completing on the given event code
    pub fn queue_async_command(&self, packet: CommandPacket, complete_event_code: u8) {
        self.state.borrow_mut().queue.push_back((packet, complete_event_code));
    }

    /// Whether no sequence is currently running
    pub fn is_ready(&self) -> bool {
        !self.state.borrow().running
    }

    /// Whether commands are queued
    pub fn has_queued_commands(&self) -> bool {
        !self.state.borrow().queue.is_empty()
    }

    /// Start running the queued commands
    ///
    /// `result_callback` is called once, either with `Ok(())` after the queue
    /// drained or with the first error. Returns false if a sequence is
    /// already running.
    pub fn run_commands(&self, result_callback: ResultCallback) -> bool {
        {
            let mut state = self.state.borrow_mut();

            if state.running {
                return false;
            }

            state.running = true;
            state.result_callback = Some(result_callback);
        }

        self.send_next();

        true
    }

    /// Abandon the current sequence and every queued command
    ///
    /// The result callback of a cancelled sequence is never invoked and the
    /// result of a command in flight is discarded. The runner can be reused
    /// right away.
    pub fn cancel(&self) {
        let mut state = self.state.borrow_mut();

        state.sequence += 1;
        state.running = false;
        state.queue.clear();
        state.result_callback = None;
    }

    fn send_next(&self) {
        let (packet, complete_event_code, sequence) = {
            let mut state = self.state.borrow_mut();

            match state.queue.pop_front() {
                Some((packet, code)) => (packet, code, state.sequence),
                None => {
                    state.running = false;

                    match state.result_callback.take() {
                        Some(callback) => {
                            drop(state);
                            callback(Ok(()));
                            return;
                        },
                        None => return,
                    }
                },
            }
        };

        let runner = self.clone_parts();

        let callback: crate::hci::command_channel::CommandCallback =
            Box::new( move |_, event| runner.on_command_event(sequence, &event) );

        let id = if complete_event_code == Events::CommandComplete.to_val() {
            self.channel.send_command(packet, callback)
        } else {
            self.channel.send_async_command(packet, callback, complete_event_code)
        };

        if id == 0 {
            self.finish(Err(Error::InProgress));
        }
    }

    fn clone_parts(&self) -> SequentialCommandRunner<I> {
        SequentialCommandRunner {
            channel: self.channel.clone(),
            state: self.state.clone(),
        }
    }

    fn on_command_event(&self, sequence: u64, event: &CommandEvent) {
        if self.state.borrow().sequence != sequence {
            // the sequence was cancelled while this command was in flight
            return;
        }

        match event {
            CommandEvent::Status(data) => {
                if !data.status.is_ok() {
                    self.finish(Err(Error::Protocol(data.status.to_val())));
                }
                // a successful status on an async command is intermediate
            },
            CommandEvent::Complete(packet) => {
                // for a Command Complete the first return parameter byte is
                // the command status
                if packet.get_event_code() == Events::CommandComplete.to_val() {
                    match CommandCompleteData::try_from(packet.get_parameters()) {
                        Ok(data) => match data.raw_data.first() {
                            Some(&status) if status != 0 => {
                                self.finish(Err(Error::Protocol(status)));
                                return;
                            },
                            _ => (),
                        },
                        Err(_) => {
                            self.finish(Err(Error::Malformed));
                            return;
                        },
                    }
                }

                self.send_next();
            },
            CommandEvent::TimedOut => self.finish(Err(Error::Timeout)),
        }
    }

    fn finish(&self, result: Result<(), Error>) {
        let callback = {
            let mut state = self.state.borrow_mut();

            state.running = false;
            state.queue.clear();

            state.result_callback.take()
        };

        if let Some(callback) = callback {
            callback(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::command_channel::CommandChannel;
    use crate::hci::events::EventPacket;

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

    fn setup() -> (
        CommandChannel<TestInterface>,
        SequentialCommandRunner<TestInterface>,
        Rc<RefCell<Vec<Box<[u8]>>>>,
    ) {
        let interface = TestInterface::default();
        let sent = interface.sent.clone();
        let channel = CommandChannel::new(interface);
        let runner = SequentialCommandRunner::new(channel.clone());

        (channel, runner, sent)
    }

    fn command_complete(opcode: u16, credits: u8, status: u8) -> EventPacket {
        EventPacket::new(
            0x0E,
            Box::from(&[credits, opcode as u8, (opcode >> 8) as u8, status][..]),
        )
    }

    #[test]
    fn commands_run_in_sequence_test() {
        let (channel, runner, sent) = setup();
        let result = Rc::new(RefCell::new(None));

        runner.queue_command(CommandPacket::new(0x0C03, &[]));
        runner.queue_command(CommandPacket::new(0x0C01, &[0u8; 8]));

        let result_slot = result.clone();

        assert!( runner.run_commands(Box::new(move |r| *result_slot.borrow_mut() = Some(r))) );
        assert!( !runner.is_ready() );

        // only the first command was sent even though credits are available
        assert_eq!( sent.borrow().len(), 1 );

        channel.receive_event(command_complete(0x0C03, 1, 0x00));

        assert_eq!( sent.borrow().len(), 2 );
        assert!( result.borrow().is_none() );

        channel.receive_event(command_complete(0x0C01, 1, 0x00));

        assert_eq!( *result.borrow(), Some(Ok(())) );
        assert!( runner.is_ready() );
    }

    #[test]
    fn sequence_aborts_on_failure_test() {
        let (channel, runner, sent) = setup();
        let result = Rc::new(RefCell::new(None));

        runner.queue_command(CommandPacket::new(0x0C03, &[]));
        runner.queue_command(CommandPacket::new(0x0C01, &[0u8; 8]));

        let result_slot = result.clone();

        runner.run_commands(Box::new(move |r| *result_slot.borrow_mut() = Some(r)));

        // command disallowed
        channel.receive_event(command_complete(0x0C03, 1, 0x0C));

        assert_eq!( *result.borrow(), Some(Err(Error::Protocol(0x0C))) );

        // the second command was dropped
        assert_eq!( sent.borrow().len(), 1 );
        assert!( !runner.has_queued_commands() );
    }

    #[test]
    fn cancel_discards_sequence_test() {
        let (channel, runner, sent) = setup();
        let result = Rc::new(RefCell::new(None));

        runner.queue_command(CommandPacket::new(0x0C03, &[]));
        runner.queue_command(CommandPacket::new(0x0C01, &[0u8; 8]));

        let result_slot = result.clone();

        runner.run_commands(Box::new(move |r| *result_slot.borrow_mut() = Some(r)));

        runner.cancel();

        // the in flight command's completion is discarded
        channel.receive_event(command_complete(0x0C03, 1, 0x00));

        assert!( result.borrow().is_none() );
        assert_eq!( sent.borrow().len(), 1 );

        // the runner is usable again
        let rerun_result = Rc::new(RefCell::new(None));

        runner.queue_command(CommandPacket::new(0x1005, &[]));

        let result_slot = rerun_result.clone();

        assert!( runner.run_commands(Box::new(move |r| *result_slot.borrow_mut() = Some(r))) );

        channel.receive_event(command_complete(0x1005, 1, 0x00));

        assert_eq!( *rerun_result.borrow(), Some(Ok(())) );
    }
}
