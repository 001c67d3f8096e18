//! Context: the public call API and the progress state machine.
//!
//! A context owns one peer and its command pipeline. All transport
//! progress happens cooperatively inside the public calls, serialized by
//! the progress lock (the peer mutex); a separate submit lock lets one
//! thread enqueue new calls while another drains progress.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use urpc::codec::{self, Value};
use urpc::{Error, Peer, CMD_CALL, CMD_EXCEPTION, CMD_RESULT};

use crate::args::CallArgs;
use crate::command::{Command, CommandKind, CommandQueues, ReplyFn, SubmitFn};
use crate::{RequestStatus, REQUEST_ID_INVALID};

const STATE_RUNNING: u8 = 0;
const STATE_EXIT: u8 = 1;

// Negative POSIX errno magnitudes surfaced by the thunks.
const EAGAIN: i32 = 11;
const ENOMEM: i32 = 12;
const EPROTO: i32 = 71;

/// Completion-tracked call pipeline over one peer.
pub struct Context {
    /// The peer; its mutex doubles as the progress lock.
    peer: Mutex<Peer>,
    comq: CommandQueues,
    /// Serializes submissions without blocking progress.
    submit_lock: Mutex<()>,
    /// Outstanding request ids, consumed exactly once by peek/wait.
    issued: Mutex<HashSet<u64>>,
    seq: AtomicU64,
    state: AtomicU8,
    main: bool,
}

impl Context {
    /// Wrap a peer into a context.
    pub fn new(peer: Peer) -> Self {
        Self {
            peer: Mutex::new(peer),
            comq: CommandQueues::new(),
            submit_lock: Mutex::new(()),
            issued: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
            state: AtomicU8::new(STATE_RUNNING),
            main: false,
        }
    }

    /// Wrap the main context of a process handle; `close` is a no-op on
    /// it, teardown goes through the process-level shutdown instead.
    pub fn new_main(peer: Peer) -> Self {
        Self {
            main: true,
            ..Self::new(peer)
        }
    }

    fn issue_request_id(&self) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        debug_assert_ne!(id, REQUEST_ID_INVALID);
        id
    }

    fn is_exit(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_EXIT
    }

    fn fatal(&self) {
        self.state.store(STATE_EXIT, Ordering::Release);
        self.comq.cancel_all();
    }

    /// Call the remote function at `addr` asynchronously.
    ///
    /// Returns the request id to collect the result with, or
    /// [`REQUEST_ID_INVALID`] when `addr` is null or the context has
    /// exited.
    pub fn call_async(&self, addr: u64, args: CallArgs) -> u64 {
        if addr == 0 || self.is_exit() {
            return REQUEST_ID_INVALID;
        }

        let id = self.issue_request_id();
        let image = args.marshal();

        let submit: SubmitFn = Box::new(move |cmd, peer| {
            match peer.send_generic(CMD_CALL, "LP", &[Value::U64(addr), Value::Bytes(&image)]) {
                Ok(req) => {
                    cmd.wire_req = Some(req);
                    0
                }
                Err(e) => {
                    cmd.set_result(0, RequestStatus::Error);
                    match e {
                        Error::PayloadExhausted { .. } => -ENOMEM,
                        _ => -EAGAIN,
                    }
                }
            }
        });

        let reply: ReplyFn = Box::new(move |cmd, m, payload| match m.cmd {
            CMD_RESULT => match codec::unpack(payload, "L") {
                Ok(fields) => {
                    cmd.set_result(fields[0].as_u64().unwrap_or(0), RequestStatus::Ok);
                    0
                }
                Err(_) => {
                    cmd.set_result(0, RequestStatus::Error);
                    -EPROTO
                }
            },
            CMD_EXCEPTION => match codec::unpack(payload, "L") {
                Ok(fields) => {
                    cmd.set_result(fields[0].as_u64().unwrap_or(0), RequestStatus::Exception);
                    0
                }
                Err(_) => {
                    cmd.set_result(0, RequestStatus::Error);
                    -EPROTO
                }
            },
            _ => {
                cmd.set_result(0, RequestStatus::Error);
                -EPROTO
            }
        });

        if !self.enqueue(Command::new_remote(id, submit, reply), id) {
            return REQUEST_ID_INVALID;
        }
        self.progress(3);
        id
    }

    /// Run `f` on the host, ordered after every earlier remote call on
    /// this context: the command only executes once the in-flight queue
    /// is empty, so it observes all of their effects.
    pub fn call_host_async<F>(&self, f: F) -> u64
    where
        F: FnOnce() -> u64 + Send + 'static,
    {
        if self.is_exit() {
            return REQUEST_ID_INVALID;
        }

        let id = self.issue_request_id();
        let submit: SubmitFn = Box::new(move |cmd, _peer| {
            let rv = f();
            cmd.set_result(rv, RequestStatus::Ok);
            0
        });

        if !self.enqueue(Command::new_host_side(id, submit), id) {
            return REQUEST_ID_INVALID;
        }
        self.progress(3);
        id
    }

    fn enqueue(&self, cmd: Command, id: u64) -> bool {
        let _guard = self.submit_lock.lock().unwrap();
        self.issued.lock().unwrap().insert(id);
        if self.comq.push_pending(cmd).is_err() {
            self.issued.lock().unwrap().remove(&id);
            return false;
        }
        true
    }

    /// Check whether the result of request `id` is available.
    ///
    /// Consumes the completion on success; a request is observable
    /// exactly once. Unknown ids report [`RequestStatus::Error`].
    pub fn peek_result(&self, id: u64) -> (RequestStatus, u64) {
        self.progress(3);

        let issued = self.issued.lock().unwrap();
        if !issued.contains(&id) {
            return (RequestStatus::Error, 0);
        }
        drop(issued);

        match self.comq.take_completion(id) {
            Some(cmd) => {
                self.issued.lock().unwrap().remove(&id);
                (cmd.status, cmd.retval)
            }
            None => (RequestStatus::Unfinished, 0),
        }
    }

    /// Spin on [`peek_result`] until the request finishes.
    ///
    /// [`peek_result`]: Context::peek_result
    pub fn wait_result(&self, id: u64) -> (RequestStatus, u64) {
        loop {
            let (status, retval) = self.peek_result(id);
            if status != RequestStatus::Unfinished {
                return (status, retval);
            }
            std::hint::spin_loop();
        }
    }

    /// Drive progress until both pending and in-flight are empty. Blocks
    /// other threads from submitting while it runs.
    pub fn synchronize(&self) {
        let _guard = self.submit_lock.lock().unwrap();
        while !(self.comq.empty_pending() && self.comq.empty_in_flight()) {
            self.progress(0);
            if self.is_exit() {
                break;
            }
        }
    }

    /// Close this context.
    ///
    /// Outstanding requests complete with [`RequestStatus::Error`]; the
    /// close completion itself returns 0. No-op on an already-exited or
    /// main context.
    pub fn close(&self) -> u64 {
        if self.is_exit() || self.main {
            return 0;
        }

        let id = self.issue_request_id();
        if !self.enqueue(Command::new_close(id), id) {
            return 0;
        }
        self.progress(3);
        let (_status, retval) = self.wait_result(id);
        retval
    }

    /// Transport progress, bounded by `ops` rounds (0 = run while any
    /// forward progress is made).
    fn progress(&self, ops: u32) {
        let mut peer = self.peer.lock().unwrap();
        self.progress_locked(&mut peer, ops);
    }

    fn progress_locked(&self, peer: &mut Peer, ops: u32) {
        let mut remaining = ops;
        loop {
            if self.is_exit() {
                return;
            }
            let mut recvd = 0u32;
            let mut sent = 0u32;

            // Inbound: the next reply belongs to the head of in-flight.
            match peer.recv_next() {
                Ok(Some((req, m))) => {
                    let Some(mut cmd) = self.comq.pop_in_flight() else {
                        eprintln!("offload: reply {} without an in-flight command", req);
                        self.fatal();
                        return;
                    };
                    if let Some(expected) = cmd.wire_req {
                        if expected != req {
                            eprintln!(
                                "offload: reply {} does not match submitted request {}",
                                req, expected
                            );
                            self.fatal();
                            return;
                        }
                    }

                    let rv = cmd.run_reply(m, peer.recv_payload(m));
                    peer.recv_done(req, m);
                    self.comq.push_completion(cmd);
                    if rv < 0 {
                        self.fatal();
                        return;
                    }
                    recvd += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    eprintln!("offload: inbound transfer failed: {}", e);
                    self.fatal();
                    return;
                }
            }

            // Outbound: submit the next pending command if the wire has
            // room for it.
            if peer.send_slot_free() {
                if let Some(mut cmd) = self.comq.try_pop_pending() {
                    match cmd.kind {
                        CommandKind::HostSide => {
                            if self.comq.empty_in_flight() {
                                let _ = cmd.run_submit(peer);
                                self.comq.push_completion(cmd);
                                sent += 1;
                            } else {
                                // Earlier remote calls are still in the
                                // air; keep issue order.
                                self.comq.push_pending_front(cmd);
                            }
                        }
                        CommandKind::Close => {
                            // Purely local: drain the pipeline and
                            // complete; peer-level shutdown is a separate
                            // handshake.
                            self.state.store(STATE_EXIT, Ordering::Release);
                            self.comq.cancel_all();
                            cmd.set_result(0, RequestStatus::Ok);
                            self.comq.push_completion(cmd);
                            return;
                        }
                        CommandKind::Remote => {
                            if cmd.run_submit(peer) == 0 {
                                self.comq.push_in_flight(cmd);
                                sent += 1;
                            } else {
                                // Status was set by the thunk.
                                self.comq.push_completion(cmd);
                            }
                        }
                    }
                }
            }

            if recvd + sent == 0 {
                break;
            }
            if ops != 0 {
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use urpc::PeerConfig;

    fn lone_context() -> Context {
        Context::new(Peer::create(PeerConfig::default()).unwrap())
    }

    #[test]
    fn test_null_address_rejected() {
        let ctx = lone_context();
        assert_eq!(ctx.call_async(0, CallArgs::new()), REQUEST_ID_INVALID);
    }

    #[test]
    fn test_unknown_id_reports_error() {
        let ctx = lone_context();
        assert_eq!(ctx.peek_result(12345), (RequestStatus::Error, 0));
    }

    #[test]
    fn test_host_side_call_completes_alone() {
        let ctx = lone_context();
        let id = ctx.call_host_async(|| 40 + 2);
        assert_ne!(id, REQUEST_ID_INVALID);
        assert_eq!(ctx.wait_result(id), (RequestStatus::Ok, 42));

        // Exactly-once observation.
        assert_eq!(ctx.peek_result(id), (RequestStatus::Error, 0));
    }

    #[test]
    fn test_close_then_reject() {
        let ctx = lone_context();
        assert_eq!(ctx.close(), 0);
        assert_eq!(ctx.call_async(0x1000, CallArgs::new()), REQUEST_ID_INVALID);
        assert_eq!(ctx.call_host_async(|| 0), REQUEST_ID_INVALID);
        // Closing again is a no-op.
        assert_eq!(ctx.close(), 0);
    }

    #[test]
    fn test_main_context_ignores_close() {
        let ctx = Context::new_main(Peer::create(PeerConfig::default()).unwrap());
        assert_eq!(ctx.close(), 0);
        // Still alive.
        let id = ctx.call_host_async(|| 7);
        assert_eq!(ctx.wait_result(id), (RequestStatus::Ok, 7));
    }
}
