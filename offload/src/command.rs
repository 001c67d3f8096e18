//! Command objects and the per-context command queues.
//!
//! A command carries its request id, a submit thunk that moves it onto
//! the wire (or runs it locally for host-side commands), an optional
//! reply thunk that digests the remote's answer, and the status/return
//! value surfaced to the caller. Ownership walks the pipeline: pending
//! until submitted, in-flight until the reply arrives, completions until
//! a peek or wait consumes it.

use std::collections::VecDeque;
use std::sync::Mutex;

use urpc::{Mailbox, Peer};

use crate::RequestStatus;

/// Thunk that submits the command; non-zero means submission failed.
pub(crate) type SubmitFn = Box<dyn FnOnce(&mut Command, &mut Peer) -> i32 + Send>;

/// Thunk that digests the reply; negative means a transport-level
/// failure that poisons the context.
pub(crate) type ReplyFn = Box<dyn FnOnce(&mut Command, Mailbox, &[u8]) -> i32 + Send>;

/// What kind of work a command describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    /// Remote call: submit puts a record on the wire, the reply thunk
    /// runs when the answer comes back.
    Remote,
    /// Runs on the host, gated on an empty in-flight queue.
    HostSide,
    /// Terminal command: tears the pipeline down and completes itself.
    Close,
}

pub(crate) struct Command {
    pub id: u64,
    pub kind: CommandKind,
    submit: Option<SubmitFn>,
    reply: Option<ReplyFn>,
    /// Wire-level request number recorded at submit time.
    pub wire_req: Option<i64>,
    pub status: RequestStatus,
    pub retval: u64,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("wire_req", &self.wire_req)
            .field("status", &self.status)
            .field("retval", &self.retval)
            .finish()
    }
}

impl Command {
    pub fn new_remote(id: u64, submit: SubmitFn, reply: ReplyFn) -> Self {
        Self {
            id,
            kind: CommandKind::Remote,
            submit: Some(submit),
            reply: Some(reply),
            wire_req: None,
            status: RequestStatus::Unfinished,
            retval: 0,
        }
    }

    pub fn new_host_side(id: u64, submit: SubmitFn) -> Self {
        Self {
            id,
            kind: CommandKind::HostSide,
            submit: Some(submit),
            reply: None,
            wire_req: None,
            status: RequestStatus::Unfinished,
            retval: 0,
        }
    }

    pub fn new_close(id: u64) -> Self {
        Self {
            id,
            kind: CommandKind::Close,
            submit: None,
            reply: None,
            wire_req: None,
            status: RequestStatus::Unfinished,
            retval: 0,
        }
    }

    pub fn set_result(&mut self, retval: u64, status: RequestStatus) {
        self.retval = retval;
        self.status = status;
    }

    /// Run the submit thunk. Must be called at most once.
    pub fn run_submit(&mut self, peer: &mut Peer) -> i32 {
        let submit = self.submit.take().expect("submit thunk already consumed");
        submit(self, peer)
    }

    /// Run the reply thunk, if any.
    pub fn run_reply(&mut self, m: Mailbox, payload: &[u8]) -> i32 {
        match self.reply.take() {
            Some(reply) => reply(self, m, payload),
            None => 0,
        }
    }
}

struct PendingQueue {
    q: VecDeque<Command>,
    terminal: bool,
}

/// The three ordered queues of one context.
pub(crate) struct CommandQueues {
    pending: Mutex<PendingQueue>,
    in_flight: Mutex<VecDeque<Command>>,
    completions: Mutex<VecDeque<Command>>,
}

impl CommandQueues {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(PendingQueue {
                q: VecDeque::new(),
                terminal: false,
            }),
            in_flight: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to pending; hands the command back once the context is in a
    /// terminal state.
    pub fn push_pending(&self, cmd: Command) -> Result<(), Command> {
        let mut pending = self.pending.lock().unwrap();
        if pending.terminal {
            return Err(cmd);
        }
        pending.q.push_back(cmd);
        Ok(())
    }

    /// Put a deferred command back at the head of pending.
    pub fn push_pending_front(&self, cmd: Command) {
        self.pending.lock().unwrap().q.push_front(cmd);
    }

    pub fn try_pop_pending(&self) -> Option<Command> {
        self.pending.lock().unwrap().q.pop_front()
    }

    pub fn empty_pending(&self) -> bool {
        self.pending.lock().unwrap().q.is_empty()
    }

    /// Append in submission order.
    pub fn push_in_flight(&self, cmd: Command) {
        self.in_flight.lock().unwrap().push_back(cmd);
    }

    /// Head of the in-flight queue; the next reply must belong to it.
    pub fn pop_in_flight(&self) -> Option<Command> {
        self.in_flight.lock().unwrap().pop_front()
    }

    pub fn empty_in_flight(&self) -> bool {
        self.in_flight.lock().unwrap().is_empty()
    }

    pub fn push_completion(&self, cmd: Command) {
        self.completions.lock().unwrap().push_back(cmd);
    }

    /// Remove the completion with the given request id, if present.
    pub fn take_completion(&self, id: u64) -> Option<Command> {
        let mut completions = self.completions.lock().unwrap();
        let pos = completions.iter().position(|c| c.id == id)?;
        completions.remove(pos)
    }

    /// Mark the context terminal and drain pending and in-flight into
    /// completions with Error status, oldest first.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.terminal = true;
        let drained_pending: Vec<Command> = pending.q.drain(..).collect();
        drop(pending);

        let drained_in_flight: Vec<Command> =
            self.in_flight.lock().unwrap().drain(..).collect();

        let mut completions = self.completions.lock().unwrap();
        for mut cmd in drained_in_flight.into_iter().chain(drained_pending) {
            cmd.set_result(0, RequestStatus::Error);
            completions.push_back(cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_cmd(id: u64, retval: u64) -> Command {
        Command::new_host_side(
            id,
            Box::new(move |cmd, _peer| {
                cmd.set_result(retval, RequestStatus::Ok);
                0
            }),
        )
    }

    #[test]
    fn test_pending_fifo() {
        let q = CommandQueues::new();
        q.push_pending(host_cmd(1, 0)).unwrap();
        q.push_pending(host_cmd(2, 0)).unwrap();
        assert!(!q.empty_pending());

        assert_eq!(q.try_pop_pending().unwrap().id, 1);

        // A deferred command goes back to the head.
        q.push_pending_front(host_cmd(1, 0));
        assert_eq!(q.try_pop_pending().unwrap().id, 1);
        assert_eq!(q.try_pop_pending().unwrap().id, 2);
        assert!(q.try_pop_pending().is_none());
    }

    #[test]
    fn test_completion_lookup_by_id() {
        let q = CommandQueues::new();
        for id in 0..4 {
            q.push_completion(host_cmd(id, 0));
        }

        assert_eq!(q.take_completion(2).unwrap().id, 2);
        assert!(q.take_completion(2).is_none());
        assert_eq!(q.take_completion(0).unwrap().id, 0);
        assert_eq!(q.take_completion(3).unwrap().id, 3);
    }

    #[test]
    fn test_cancel_all() {
        let q = CommandQueues::new();
        q.push_in_flight(host_cmd(1, 0));
        q.push_in_flight(host_cmd(2, 0));
        q.push_pending(host_cmd(3, 0)).unwrap();

        q.cancel_all();

        assert!(q.empty_pending());
        assert!(q.empty_in_flight());
        for id in [1, 2, 3] {
            let cmd = q.take_completion(id).unwrap();
            assert_eq!(cmd.status, RequestStatus::Error);
        }

        // Terminal state rejects new submissions.
        assert!(q.push_pending(host_cmd(4, 0)).is_err());
    }
}
