//! Peer: both directions of the channel plus the handler registry.
//!
//! A peer binds a send and a recv transfer queue over the mapped segment
//! and drives the inbound progress loop. The host accesses payload bytes
//! in the segment directly; the remote stages them through a local mirror
//! of each data ring, moved by a [`BlockTransfer`] engine.

use std::slice;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::unistd::Pid;

use crate::codec::{self, Value};
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::payload::PayloadRing;
use crate::queue::{align8, req_slot, Mailbox, TransferQueue};
use crate::shm::SharedMemory;
use crate::{
    CMD_CLOSE, CMD_CLOSE_ACK, URPC_BUFF_LEN, URPC_DATA_BUFF_LEN, URPC_MAX_HANDLERS,
    URPC_MAX_PEERS,
};

/// Bulk copy primitive between local mirror memory and the shared data
/// ring. On the accelerator this wraps the DMA engine; [`MemcpyTransfer`]
/// stands in for it everywhere the CPU can reach the segment.
///
/// Implementations must copy exactly `len` bytes from `src` to `dst`; both
/// pointers are valid for `len` bytes and never overlap.
pub trait BlockTransfer: Send + Sync {
    fn block_transfer(&self, dst: *mut u8, src: *const u8, len: usize) -> std::io::Result<()>;
}

/// CPU-copy block-transfer engine.
#[derive(Debug, Default)]
pub struct MemcpyTransfer;

impl BlockTransfer for MemcpyTransfer {
    fn block_transfer(&self, dst: *mut u8, src: *const u8, len: usize) -> std::io::Result<()> {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
        Ok(())
    }
}

/// How payload bytes of one direction are accessed.
enum DataPath {
    /// Read and write the segment directly (host side).
    Direct,
    /// Stage through a local mirror of the data ring (remote side).
    Mirrored {
        mirror: Box<[u8]>,
        dma: Arc<dyn BlockTransfer>,
    },
}

impl DataPath {
    fn mirrored(dma: Arc<dyn BlockTransfer>) -> Self {
        DataPath::Mirrored {
            mirror: vec![0u8; URPC_DATA_BUFF_LEN as usize].into_boxed_slice(),
            dma,
        }
    }
}

/// One direction of the channel from this peer's perspective: the transfer
/// queue plus the sender-side payload allocator and the data path.
pub struct Comm {
    tq: TransferQueue,
    ring: PayloadRing,
    path: DataPath,
    alloc_timeout_us: u64,
    put_timeout_us: Option<u64>,
}

impl Comm {
    fn new(tq: TransferQueue, path: DataPath, config: &PeerConfig) -> Self {
        Self {
            tq,
            ring: PayloadRing::new(),
            path,
            alloc_timeout_us: config.alloc_timeout_us,
            put_timeout_us: config.put_timeout_us,
        }
    }

    /// The underlying transfer queue (flag words, sequence counters).
    pub fn queue(&self) -> &TransferQueue {
        &self.tq
    }

    /// Allocate a payload region on this direction's data ring.
    pub fn alloc_payload(&mut self, size: u32) -> Result<Mailbox> {
        self.ring.alloc(&self.tq, size, self.alloc_timeout_us)
    }

    /// Publish a command into the next mailbox slot, waiting for the slot
    /// to be free. Sender side only. Returns the request number.
    pub fn put_cmd(&mut self, m: Mailbox) -> Result<i64> {
        let req = self.tq.last_put_req() + 1;
        let slot = req_slot(req);

        let start = Instant::now();
        while !self.tq.read_slot(slot).is_empty() {
            if let Some(timeout_us) = self.put_timeout_us {
                if start.elapsed().as_micros() as u64 >= timeout_us {
                    return Err(Error::QueueFull);
                }
            }
            std::hint::spin_loop();
        }

        self.ring.note_put(slot, m);
        self.tq.write_slot(slot, m);
        self.tq.set_last_put_req(req);
        Ok(req)
    }

    /// Assemble a record described by `fmt` on the data ring and publish
    /// it under `cmd`. Returns the request number.
    pub fn send_generic(&mut self, cmd: u8, fmt: &str, args: &[Value<'_>]) -> Result<i64> {
        let size = align8(codec::packed_size(fmt, args)? as u32);

        let mut m = if size > 0 {
            let m = self.alloc_payload(size)?;
            let region = self.payload_region_mut(m);
            region.fill(0);
            codec::pack(region, fmt, args)?;
            self.flush_send_payload(m)?;
            m
        } else {
            Mailbox::EMPTY
        };

        m.cmd = cmd;
        match self.put_cmd(m) {
            Ok(req) => Ok(req),
            Err(e) => {
                self.ring.undo_alloc(m);
                Err(e)
            }
        }
    }

    /// Writable view of an allocated payload region, in the segment for
    /// the direct path or in the mirror for the staged one.
    fn payload_region_mut(&mut self, m: Mailbox) -> &mut [u8] {
        let offs = m.offs as usize;
        let len = align8(m.len) as usize;
        match &mut self.path {
            DataPath::Direct => unsafe {
                slice::from_raw_parts_mut(self.tq.data_ptr().add(offs), len)
            },
            DataPath::Mirrored { mirror, .. } => &mut mirror[offs..offs + len],
        }
    }

    /// Move a packed payload from the mirror out to the segment. No-op on
    /// the direct path.
    fn flush_send_payload(&mut self, m: Mailbox) -> Result<()> {
        let Self { tq, path, .. } = self;
        if let DataPath::Mirrored { mirror, dma } = path {
            let offs = m.offs as usize;
            let len = align8(m.len) as usize;
            dma.block_transfer(
                unsafe { tq.data_ptr().add(offs) },
                mirror[offs..].as_ptr(),
                len,
            )
            .map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Bring an inbound payload into local reach. No-op on the direct
    /// path; on the staged path payloads of at most 16 bytes are copied
    /// word by word to amortize the engine's startup latency.
    pub(crate) fn stage_recv_payload(&mut self, m: Mailbox) -> Result<()> {
        if m.len == 0 {
            return Ok(());
        }
        let Self { tq, path, .. } = self;
        if let DataPath::Mirrored { mirror, dma } = path {
            let offs = m.offs as usize;
            if m.len <= 16 {
                let words = (m.len as usize + 7) / 8;
                for i in 0..words {
                    let word = unsafe {
                        (*(tq.data_ptr().add(offs) as *const AtomicU64).add(i))
                            .load(Ordering::Relaxed)
                    };
                    mirror[offs + i * 8..offs + (i + 1) * 8]
                        .copy_from_slice(&word.to_le_bytes());
                }
            } else {
                dma.block_transfer(
                    mirror[offs..].as_mut_ptr(),
                    unsafe { tq.data_ptr().add(offs) },
                    m.len as usize,
                )
                .map_err(Error::Io)?;
            }
        }
        Ok(())
    }

    /// Borrow an inbound payload. The bytes stay valid until the owning
    /// slot is marked done; copy them to keep them longer.
    pub fn payload(&self, m: Mailbox) -> &[u8] {
        if m.len == 0 {
            return &[];
        }
        let offs = m.offs as usize;
        match &self.path {
            DataPath::Direct => unsafe {
                slice::from_raw_parts(self.tq.data_ptr().add(offs), m.len as usize)
            },
            DataPath::Mirrored { mirror, .. } => &mirror[offs..offs + m.len as usize],
        }
    }
}

/// Inbound command handler. Receives the send-side channel for replies,
/// the mailbox contents, the request number and the payload bytes. A
/// non-zero return is logged; it does not stop the progress loop.
pub type Handler = Box<dyn FnMut(&mut Comm, Mailbox, i64, &[u8]) -> i32 + Send>;

static LIVE_PEERS: AtomicUsize = AtomicUsize::new(0);
static NEXT_SEGMENT: AtomicUsize = AtomicUsize::new(0);

/// One end of the channel: send and recv directions plus the handler
/// table. Created by the host ([`Peer::create`]), attached to by the
/// remote ([`Peer::attach`] / [`Peer::attach_with_transfer`]).
pub struct Peer {
    shm: SharedMemory,
    send: Comm,
    recv: Comm,
    handlers: Vec<Option<Handler>>,
    pub(crate) child: Option<Pid>,
    is_host: bool,
    attach_timeout_us: u64,
}

impl Peer {
    /// Create the shared segment and initialize both directions in place.
    ///
    /// The returned peer is the host: its send direction is the first
    /// queue of the segment.
    pub fn create(config: PeerConfig) -> Result<Peer> {
        if LIVE_PEERS.load(Ordering::Relaxed) >= URPC_MAX_PEERS {
            return Err(Error::TooManyPeers);
        }

        let name = format!(
            "/urpc_{}_{}",
            std::process::id(),
            NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed)
        );
        let shm = unsafe { SharedMemory::create(&name, 2 * URPC_BUFF_LEN) }?;
        LIVE_PEERS.fetch_add(1, Ordering::Relaxed);

        let base = shm.as_ptr();
        let send_tq = unsafe { TransferQueue::from_raw(base) };
        let recv_tq = unsafe { TransferQueue::from_raw(base.add(URPC_BUFF_LEN)) };
        send_tq.init();
        recv_tq.init();

        Ok(Peer {
            shm,
            send: Comm::new(send_tq, DataPath::Direct, &config),
            recv: Comm::new(recv_tq, DataPath::Direct, &config),
            handlers: new_handler_table(),
            child: None,
            is_host: true,
            attach_timeout_us: config.attach_timeout_us,
        })
    }

    /// Attach to an existing segment with direct payload access.
    pub fn attach(name: &str, config: PeerConfig) -> Result<Peer> {
        Self::attach_inner(name, config, None)
    }

    /// Attach to an existing segment, staging payloads through local
    /// mirror memory moved by `dma`.
    pub fn attach_with_transfer(
        name: &str,
        config: PeerConfig,
        dma: Arc<dyn BlockTransfer>,
    ) -> Result<Peer> {
        Self::attach_inner(name, config, Some(dma))
    }

    fn attach_inner(
        name: &str,
        config: PeerConfig,
        dma: Option<Arc<dyn BlockTransfer>>,
    ) -> Result<Peer> {
        let shm = unsafe { SharedMemory::open(name, 2 * URPC_BUFF_LEN) }?;

        // The remote's directions are the host's, swapped.
        let base = shm.as_ptr();
        let recv_tq = unsafe { TransferQueue::from_raw(base) };
        let send_tq = unsafe { TransferQueue::from_raw(base.add(URPC_BUFF_LEN)) };

        let (send_path, recv_path) = match dma {
            Some(dma) => (
                DataPath::mirrored(Arc::clone(&dma)),
                DataPath::mirrored(dma),
            ),
            None => (DataPath::Direct, DataPath::Direct),
        };

        let peer = Peer {
            shm,
            send: Comm::new(send_tq, send_path, &config),
            recv: Comm::new(recv_tq, recv_path, &config),
            handlers: new_handler_table(),
            child: None,
            is_host: false,
            attach_timeout_us: config.attach_timeout_us,
        };

        // Confirm attachment through the first queue's header.
        peer.ctrl_queue().bump_attach_count();
        Ok(peer)
    }

    /// The queue carrying the attach counter (first queue of the segment).
    fn ctrl_queue(&self) -> &TransferQueue {
        if self.is_host {
            self.send.queue()
        } else {
            self.recv.queue()
        }
    }

    /// Segment name, for the remote bootstrap.
    pub fn segment_name(&self) -> &str {
        self.shm.name()
    }

    /// True on the creating side.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Send direction of this peer.
    pub fn send_comm(&mut self) -> &mut Comm {
        &mut self.send
    }

    /// Recv direction of this peer.
    pub fn recv_comm(&mut self) -> &mut Comm {
        &mut self.recv
    }

    /// Remove the segment name if this side still owns it. Safe to call
    /// more than once; the mapping itself lives until drop.
    pub(crate) fn detach_name(&mut self) {
        self.shm.unlink();
    }

    /// Block until the remote has attached, then unlink the segment name
    /// so process death cleans the segment up.
    pub fn wait_peer_attach(&mut self) -> Result<()> {
        let start = Instant::now();
        while self.ctrl_queue().attach_count() == 0 {
            if start.elapsed().as_micros() as u64 >= self.attach_timeout_us {
                return Err(Error::AttachTimeout);
            }
            std::thread::yield_now();
        }
        self.shm.unlink();
        Ok(())
    }

    /// Register `handler` for `cmd`. The code must be in
    /// `1..=URPC_MAX_HANDLERS` and free.
    pub fn register(&mut self, cmd: u8, handler: Handler) -> Result<u8> {
        if cmd == 0 || cmd > URPC_MAX_HANDLERS {
            return Err(Error::InvalidCommand(cmd));
        }
        let slot = &mut self.handlers[cmd as usize];
        if slot.is_some() {
            return Err(Error::HandlerExists(cmd));
        }
        *slot = Some(handler);
        Ok(cmd)
    }

    /// Remove the handler for `cmd`.
    pub fn unregister(&mut self, cmd: u8) -> Result<()> {
        if cmd == 0 || cmd > URPC_MAX_HANDLERS {
            return Err(Error::InvalidCommand(cmd));
        }
        self.handlers[cmd as usize] = None;
        Ok(())
    }

    /// Process up to `ncmds` inbound commands through the handler table.
    ///
    /// Commands without a registered handler are skipped; either way the
    /// slot is freed so the sender is never stuck on our side.
    pub fn recv_progress(&mut self, ncmds: usize) -> Result<usize> {
        let Peer {
            send,
            recv,
            handlers,
            ..
        } = self;

        let mut done = 0;
        while done < ncmds {
            let Some((req, m)) = recv.tq.get_cmd() else {
                break;
            };
            recv.stage_recv_payload(m)?;
            let payload = recv.payload(m);

            match handlers.get_mut(m.cmd as usize).and_then(Option::as_mut) {
                Some(handler) => {
                    let rv = handler(send, m, req, payload);
                    if rv != 0 {
                        eprintln!("urpc: warning: handler {} returned {}", m.cmd, rv);
                    }
                }
                None if m.cmd > URPC_MAX_HANDLERS => {
                    eprintln!("urpc: dropping request {} with unknown command {}", req, m.cmd);
                }
                None => {}
            }

            recv.tq.slot_done(req_slot(req), m);
            done += 1;
        }
        Ok(done)
    }

    /// Loop [`recv_progress`] until no work has been seen for
    /// `timeout_us`. Returns the total number of commands processed.
    ///
    /// [`recv_progress`]: Peer::recv_progress
    pub fn recv_progress_timeout(&mut self, ncmds: usize, timeout_us: u64) -> Result<usize> {
        let mut total = 0;
        let mut idle_since: Option<Instant> = None;
        loop {
            let done = self.recv_progress(ncmds)?;
            total += done;
            if done == 0 {
                let since = idle_since.get_or_insert_with(Instant::now);
                if since.elapsed().as_micros() as u64 >= timeout_us {
                    return Ok(total);
                }
                std::hint::spin_loop();
            } else {
                idle_since = None;
            }
        }
    }

    /// Pull the next inbound command without dispatching it, staging its
    /// payload. The caller reads it with [`recv_payload`] and must finish
    /// with [`recv_done`].
    ///
    /// [`recv_payload`]: Peer::recv_payload
    /// [`recv_done`]: Peer::recv_done
    pub fn recv_next(&mut self) -> Result<Option<(i64, Mailbox)>> {
        match self.recv.tq.get_cmd() {
            Some((req, m)) => {
                self.recv.stage_recv_payload(m)?;
                Ok(Some((req, m)))
            }
            None => Ok(None),
        }
    }

    /// Borrow the payload of an inbound command.
    pub fn recv_payload(&self, m: Mailbox) -> &[u8] {
        self.recv.payload(m)
    }

    /// Release an inbound command's slot and payload back to the sender.
    pub fn recv_done(&self, req: i64, m: Mailbox) {
        self.recv.tq.slot_done(req_slot(req), m);
    }

    /// Wait up to `timeout_us` for one specific inbound request and stage
    /// its payload. Supports selective waits; the consumed-sequence
    /// counter only advances when `req` is the next in line.
    pub fn recv_req_timeout(&mut self, req: i64, timeout_us: u64) -> Result<Option<Mailbox>> {
        let start = Instant::now();
        loop {
            if let Some(m) = self.recv.tq.get_req(req) {
                self.recv.stage_recv_payload(m)?;
                return Ok(Some(m));
            }
            if start.elapsed().as_micros() as u64 >= timeout_us {
                return Ok(None);
            }
            std::hint::spin_loop();
        }
    }

    /// Assemble and publish an outbound record. See [`Comm::send_generic`].
    pub fn send_generic(&mut self, cmd: u8, fmt: &str, args: &[Value<'_>]) -> Result<i64> {
        self.send.send_generic(cmd, fmt, args)
    }

    /// True if the next outbound publish would not have to wait.
    pub fn send_slot_free(&self) -> bool {
        self.send.tq.next_slot_free()
    }

    /// Ask the remote peer to shut down and wait for the acknowledgement.
    ///
    /// Returns `Ok(true)` once the acknowledgement arrived, `Ok(false)` on
    /// timeout; callers then fall back to forced termination. Other
    /// commands arriving during teardown are drained and dropped.
    pub fn request_shutdown(&mut self, timeout_us: u64) -> Result<bool> {
        self.send_generic(CMD_CLOSE, "", &[])?;

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed().as_micros() as u64;
            if elapsed >= timeout_us {
                return Ok(false);
            }
            match self.recv.tq.get_cmd_timeout(timeout_us - elapsed) {
                Some((req, m)) => {
                    let cmd = m.cmd;
                    self.recv.tq.slot_done(req_slot(req), m);
                    if cmd == CMD_CLOSE_ACK {
                        return Ok(true);
                    }
                }
                None => return Ok(false),
            }
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if self.is_host {
            LIVE_PEERS.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn new_handler_table() -> Vec<Option<Handler>> {
    let mut table = Vec::with_capacity(URPC_MAX_HANDLERS as usize + 1);
    table.resize_with(URPC_MAX_HANDLERS as usize + 1, || None);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CMD_NONE;

    fn pair() -> (Peer, Peer) {
        let host = Peer::create(PeerConfig::default()).unwrap();
        let remote = Peer::attach(host.segment_name(), PeerConfig::default()).unwrap();
        (host, remote)
    }

    #[test]
    fn test_register_validation() {
        let mut host = Peer::create(PeerConfig::default()).unwrap();

        assert!(matches!(
            host.register(0, Box::new(|_, _, _, _| 0)),
            Err(Error::InvalidCommand(0))
        ));
        assert!(matches!(
            host.register(URPC_MAX_HANDLERS + 1, Box::new(|_, _, _, _| 0)),
            Err(Error::InvalidCommand(_))
        ));

        assert_eq!(host.register(9, Box::new(|_, _, _, _| 0)).unwrap(), 9);
        assert!(matches!(
            host.register(9, Box::new(|_, _, _, _| 0)),
            Err(Error::HandlerExists(9))
        ));

        host.unregister(9).unwrap();
        assert_eq!(host.register(9, Box::new(|_, _, _, _| 0)).unwrap(), 9);
    }

    #[test]
    fn test_attach_handshake() {
        let mut host = Peer::create(PeerConfig::default()).unwrap();
        let name = host.segment_name().to_string();

        let attacher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Peer::attach(&name, PeerConfig::default()).unwrap()
        });

        host.wait_peer_attach().unwrap();
        let _remote = attacher.join().unwrap();

        // The name is unlinked once attachment was observed.
        assert!(Peer::attach(host.segment_name(), PeerConfig::default()).is_err());
    }

    #[test]
    fn test_attach_timeout() {
        let mut host = Peer::create(
            PeerConfig::default().with_attach_timeout_us(20_000),
        )
        .unwrap();
        assert!(matches!(host.wait_peer_attach(), Err(Error::AttachTimeout)));
    }

    #[test]
    fn test_send_and_handle() {
        let (mut host, mut remote) = pair();

        host.send_generic(7, "ILx", &[Value::U32(3), Value::U64(4)])
            .unwrap();
        host.send_generic(7, "I", &[Value::U32(5)]).unwrap();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = std::sync::Arc::clone(&seen);
        remote
            .register(
                7,
                Box::new(move |_send, _m, req, payload| {
                    let fields = match codec::unpack(payload, "I") {
                        Ok(f) => f,
                        Err(_) => return -1,
                    };
                    seen2.lock().unwrap().push((req, fields[0].as_u32().unwrap()));
                    0
                }),
            )
            .unwrap();

        assert_eq!(remote.recv_progress(16).unwrap(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 3), (1, 5)]);

        // Slots are free again for the sender.
        assert!(host.send_comm().queue().next_slot_free());
    }

    #[test]
    fn test_unregistered_command_is_skipped() {
        let (mut host, mut remote) = pair();

        host.send_generic(12, "I", &[Value::U32(1)]).unwrap();
        assert_eq!(remote.recv_progress(16).unwrap(), 1);

        // Slot freed even though nothing handled the command.
        assert_eq!(
            host.send_comm().queue().read_slot(0).cmd,
            CMD_NONE
        );
    }

    #[test]
    fn test_echo_roundtrip() {
        let (mut host, mut remote) = pair();

        remote
            .register(
                7,
                Box::new(|send, _m, _req, payload| {
                    let fields = match codec::unpack(payload, "P") {
                        Ok(f) => f,
                        Err(_) => return -1,
                    };
                    let bytes = fields[0].as_bytes().unwrap();
                    match send.send_generic(8, "P", &[Value::Bytes(bytes)]) {
                        Ok(_) => 0,
                        Err(_) => -1,
                    }
                }),
            )
            .unwrap();

        let data = [0xDEu8, 0xAD, 0xBE, 0xEF];
        host.send_generic(7, "P", &[Value::Bytes(&data)]).unwrap();
        remote.recv_progress(1).unwrap();

        let (req, m) = host.recv_next().unwrap().expect("echo reply");
        assert_eq!(m.cmd, 8);
        let fields = codec::unpack(host.recv_payload(m), "P").unwrap();
        assert_eq!(fields[0].as_bytes().unwrap(), &data);
        host.recv_done(req, m);
    }

    #[test]
    fn test_mirrored_paths_roundtrip() {
        let host = Peer::create(PeerConfig::default()).unwrap();
        let mut remote = Peer::attach_with_transfer(
            host.segment_name(),
            PeerConfig::default(),
            Arc::new(MemcpyTransfer),
        )
        .unwrap();
        let mut host = host;

        // Small payload takes the word-copy path, large one the engine.
        let small = [1u8, 2, 3];
        let large = vec![7u8; 1000];
        host.send_generic(7, "P", &[Value::Bytes(&small)]).unwrap();
        host.send_generic(7, "P", &[Value::Bytes(&large)]).unwrap();

        let (req, m) = remote.recv_next().unwrap().unwrap();
        let fields = codec::unpack(remote.recv_payload(m), "P").unwrap();
        assert_eq!(fields[0].as_bytes().unwrap(), &small);
        remote.recv_done(req, m);

        let (req, m) = remote.recv_next().unwrap().unwrap();
        let fields = codec::unpack(remote.recv_payload(m), "P").unwrap();
        assert_eq!(fields[0].as_bytes().unwrap(), large.as_slice());
        remote.recv_done(req, m);

        // And back through the remote's mirrored send direction.
        remote.send_generic(9, "P", &[Value::Bytes(&large)]).unwrap();
        let (req, m) = host.recv_next().unwrap().unwrap();
        let fields = codec::unpack(host.recv_payload(m), "P").unwrap();
        assert_eq!(fields[0].as_bytes().unwrap(), large.as_slice());
        host.recv_done(req, m);
    }

    #[test]
    fn test_recv_req_timeout_selective() {
        let (mut host, mut remote) = pair();

        host.send_generic(13, "L", &[Value::U64(11)]).unwrap();
        host.send_generic(14, "L", &[Value::U64(22)]).unwrap();

        // Waiting for request 1 does not consume request 0.
        let m = remote.recv_req_timeout(1, 50_000).unwrap().unwrap();
        assert_eq!(m.cmd, 14);
        assert_eq!(remote.recv_comm().queue().last_get_req(), -1);

        // Request 0 is still there and advances the counter.
        let m0 = remote.recv_req_timeout(0, 50_000).unwrap().unwrap();
        assert_eq!(m0.cmd, 13);
        assert_eq!(remote.recv_comm().queue().last_get_req(), 0);

        // Nothing published at request 5.
        assert!(remote.recv_req_timeout(5, 10_000).unwrap().is_none());
    }

    #[test]
    fn test_shutdown_handshake() {
        let (mut host, mut remote) = pair();

        remote
            .register(
                CMD_CLOSE,
                Box::new(|send, _m, _req, _payload| {
                    match send.send_generic(CMD_CLOSE_ACK, "", &[]) {
                        Ok(_) => 0,
                        Err(_) => -1,
                    }
                }),
            )
            .unwrap();

        let server = std::thread::spawn(move || {
            remote.recv_progress_timeout(8, 200_000).unwrap();
            remote
        });

        assert!(host.request_shutdown(1_000_000).unwrap());
        server.join().unwrap();
    }
}
