//! Transfer queue: one direction of the SPSC channel.
//!
//! A transfer queue is a fixed array of 8-byte mailbox slots followed by a
//! byte ring carrying the payloads the slots describe. Exactly one process
//! writes and exactly one process reads each direction. Sequence counters
//! grow monotonically; the slot for request `req` is `req mod URPC_LEN_MB`.
//!
//! Memory contract: every mailbox publish is preceded by full
//! initialization of its payload bytes and a release fence; every mailbox
//! read is followed by an acquire fence before the payload is consumed.
//! Nothing else synchronizes the two processes.

use std::sync::atomic::{fence, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::{CMD_NONE, URPC_LEN_MB};

/// Payload lengths and offsets are rounded up to this many bytes.
pub const ALIGN: u32 = 8;

/// Round `v` up to the payload alignment.
#[inline]
pub fn align8(v: u32) -> u32 {
    (v + (ALIGN - 1)) & !(ALIGN - 1)
}

/// Map a request number to its mailbox slot.
#[inline]
pub fn req_slot(req: i64) -> usize {
    (req as u64 as usize) & (URPC_LEN_MB - 1)
}

/// Decoded mailbox slot contents.
///
/// `cmd == 0` marks the slot empty; `offs` and `len` describe a payload
/// region inside the same direction's data ring. The whole slot travels as
/// one little-endian 64-bit word: `cmd:8 | offs:24 | len:32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    pub cmd: u8,
    pub offs: u32,
    pub len: u32,
}

impl Mailbox {
    /// The empty/done slot value.
    pub const EMPTY: Mailbox = Mailbox {
        cmd: CMD_NONE,
        offs: 0,
        len: 0,
    };

    /// Build a slot descriptor.
    pub fn new(cmd: u8, offs: u32, len: u32) -> Self {
        Self { cmd, offs, len }
    }

    /// Encode into the 64-bit wire word.
    #[inline]
    pub fn encode(self) -> u64 {
        debug_assert!(self.offs < (1 << 24), "payload offset exceeds 24 bits");
        (self.cmd as u64) | (((self.offs as u64) & 0xFF_FFFF) << 8) | ((self.len as u64) << 32)
    }

    /// Decode from the 64-bit wire word.
    #[inline]
    pub fn decode(word: u64) -> Self {
        Self {
            cmd: (word & 0xFF) as u8,
            offs: ((word >> 8) & 0xFF_FFFF) as u32,
            len: (word >> 32) as u32,
        }
    }

    /// True if the slot is empty/done.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.cmd == CMD_NONE
    }
}

/// Queue header at the start of each direction.
///
/// The attach counter participates in the bootstrap handshake only through
/// the first queue of the segment (the host's send direction): the remote
/// increments it after mapping, the host waits for it before unlinking the
/// segment name.
#[repr(C)]
pub(crate) struct QueueHeader {
    mb: [AtomicU64; URPC_LEN_MB],
    sender_flags: AtomicU32,
    receiver_flags: AtomicU32,
    attach_count: AtomicU32,
    _pad: u32,
    last_put_req: AtomicI64,
    last_get_req: AtomicI64,
    _reserved: [u8; 32],
}

/// Fixed header size; the data ring starts right after it.
pub const QUEUE_HEADER_LEN: usize = 8 * URPC_LEN_MB + 64;

const _: () = assert!(std::mem::size_of::<QueueHeader>() == QUEUE_HEADER_LEN);
const _: () = assert!(URPC_LEN_MB.is_power_of_two());

#[inline]
fn load_u64(a: &AtomicU64) -> u64 {
    let v = a.load(Ordering::Relaxed);
    fence(Ordering::Acquire);
    v
}

#[inline]
fn store_u64(a: &AtomicU64, v: u64) {
    fence(Ordering::Release);
    a.store(v, Ordering::Relaxed);
}

#[inline]
fn load_i64(a: &AtomicI64) -> i64 {
    let v = a.load(Ordering::Relaxed);
    fence(Ordering::Acquire);
    v
}

#[inline]
fn store_i64(a: &AtomicI64, v: i64) {
    fence(Ordering::Release);
    a.store(v, Ordering::Relaxed);
}

/// View over one direction of the shared channel.
///
/// Holds raw pointers into the mapped segment; the [`crate::Peer`] that
/// owns the mapping keeps it alive for as long as the view exists.
pub struct TransferQueue {
    header: std::ptr::NonNull<QueueHeader>,
    data: std::ptr::NonNull<u8>,
}

unsafe impl Send for TransferQueue {}
unsafe impl Sync for TransferQueue {}

impl TransferQueue {
    /// Build a view over `base`.
    ///
    /// # Safety
    /// `base` must point to at least `URPC_BUFF_LEN` bytes of 8-byte
    /// aligned memory that outlives the view; only one writer and one
    /// reader may use the direction at a time.
    pub(crate) unsafe fn from_raw(base: *mut u8) -> Self {
        Self {
            header: std::ptr::NonNull::new_unchecked(base as *mut QueueHeader),
            data: std::ptr::NonNull::new_unchecked(base.add(QUEUE_HEADER_LEN)),
        }
    }

    #[inline]
    fn hdr(&self) -> &QueueHeader {
        unsafe { self.header.as_ref() }
    }

    /// Pointer to the data ring.
    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// One-time in-place initialization, done by the creating side only.
    pub(crate) fn init(&self) {
        let hdr = self.hdr();
        for slot in hdr.mb.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        hdr.sender_flags.store(0, Ordering::Relaxed);
        hdr.receiver_flags.store(0, Ordering::Relaxed);
        hdr.attach_count.store(0, Ordering::Relaxed);
        hdr.last_put_req.store(-1, Ordering::Relaxed);
        hdr.last_get_req.store(-1, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Read a slot under the acquire half of the memory contract.
    #[inline]
    pub fn read_slot(&self, slot: usize) -> Mailbox {
        Mailbox::decode(load_u64(&self.hdr().mb[slot]))
    }

    /// Publish a slot under the release half of the memory contract.
    #[inline]
    pub(crate) fn write_slot(&self, slot: usize, m: Mailbox) {
        store_u64(&self.hdr().mb[slot], m.encode());
    }

    /// Most recently published request number (-1 before the first).
    #[inline]
    pub fn last_put_req(&self) -> i64 {
        load_i64(&self.hdr().last_put_req)
    }

    /// Most recently consumed request number (-1 before the first).
    #[inline]
    pub fn last_get_req(&self) -> i64 {
        load_i64(&self.hdr().last_get_req)
    }

    #[inline]
    pub(crate) fn set_last_put_req(&self, req: i64) {
        store_i64(&self.hdr().last_put_req, req);
    }

    /// True if the writer's next slot is free, i.e. a publish would not
    /// have to wait on the receiver.
    #[inline]
    pub fn next_slot_free(&self) -> bool {
        self.read_slot(req_slot(self.last_put_req() + 1)).is_empty()
    }

    /// Pull the next command from the queue.
    ///
    /// Advances the consumed-sequence counter. The payload described by the
    /// returned slot stays owned by the sender until [`slot_done`] runs.
    ///
    /// [`slot_done`]: TransferQueue::slot_done
    pub fn get_cmd(&self) -> Option<(i64, Mailbox)> {
        let last_put = self.last_put_req();
        let last_get = self.last_get_req();
        if last_put <= last_get {
            return None;
        }
        let req = last_get + 1;
        let m = self.read_slot(req_slot(req));
        store_i64(&self.hdr().last_get_req, req);
        Some((req, m))
    }

    /// Wait up to `timeout_us` for the next command.
    pub fn get_cmd_timeout(&self, timeout_us: u64) -> Option<(i64, Mailbox)> {
        let start = Instant::now();
        loop {
            if let Some(got) = self.get_cmd() {
                return Some(got);
            }
            if start.elapsed().as_micros() as u64 >= timeout_us {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Non-destructive fetch of a specific request, for selective waits.
    ///
    /// Returns `None` when the request was already consumed or has not been
    /// published yet. Advances the consumed-sequence counter only when
    /// `req` is exactly the next in line.
    pub fn get_req(&self, req: i64) -> Option<Mailbox> {
        let last_put = self.last_put_req();
        let last_get = self.last_get_req();

        if last_get >= req {
            return None;
        }
        if last_put >= req {
            let m = self.read_slot(req_slot(req));
            if last_get + 1 == req {
                store_i64(&self.hdr().last_get_req, req);
            }
            return Some(m);
        }
        None
    }

    /// Mark a slot done, releasing it and its payload back to the sender.
    ///
    /// Receiver side only. The command field is cleared; offset and length
    /// are written back as the sender left them.
    pub fn slot_done(&self, slot: usize, m: Mailbox) {
        self.write_slot(
            slot,
            Mailbox {
                cmd: CMD_NONE,
                ..m
            },
        );
    }

    /// Side-band flag word written by the sender of this direction.
    pub fn sender_flags(&self) -> u32 {
        load_u32(&self.hdr().sender_flags)
    }

    pub fn set_sender_flags(&self, flags: u32) {
        store_u32(&self.hdr().sender_flags, flags);
    }

    /// Side-band flag word written by the receiver of this direction.
    pub fn receiver_flags(&self) -> u32 {
        load_u32(&self.hdr().receiver_flags)
    }

    pub fn set_receiver_flags(&self, flags: u32) {
        store_u32(&self.hdr().receiver_flags, flags);
    }

    /// Attach counter of this queue header (bootstrap handshake).
    pub(crate) fn attach_count(&self) -> u32 {
        self.hdr().attach_count.load(Ordering::Acquire)
    }

    pub(crate) fn bump_attach_count(&self) {
        self.hdr().attach_count.fetch_add(1, Ordering::AcqRel);
    }
}

#[inline]
fn load_u32(a: &AtomicU32) -> u32 {
    let v = a.load(Ordering::Relaxed);
    fence(Ordering::Acquire);
    v
}

#[inline]
fn store_u32(a: &AtomicU32, v: u32) {
    fence(Ordering::Release);
    a.store(v, Ordering::Relaxed);
}


#[cfg(test)]
mod tests {
    use super::testutil::HeapQueue;
    use super::*;

    #[test]
    fn test_mailbox_encoding() {
        let m = Mailbox::new(7, 0x12_3456, 0xDEAD_BEEF);
        let decoded = Mailbox::decode(m.encode());
        assert_eq!(decoded, m);

        assert!(Mailbox::EMPTY.is_empty());
        assert_eq!(Mailbox::decode(0), Mailbox::EMPTY);
        assert!(!Mailbox::new(1, 0, 0).is_empty());
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn test_empty_queue() {
        let hq = HeapQueue::new();
        assert_eq!(hq.q.last_put_req(), -1);
        assert_eq!(hq.q.last_get_req(), -1);
        assert!(hq.q.get_cmd().is_none());
        assert!(hq.q.next_slot_free());
    }

    #[test]
    fn test_put_get_slot_done() {
        let hq = HeapQueue::new();
        let q = &hq.q;

        // Publish request 0 the way the sender does.
        let m = Mailbox::new(3, 0, 16);
        q.write_slot(req_slot(0), m);
        q.set_last_put_req(0);

        let (req, got) = q.get_cmd().unwrap();
        assert_eq!(req, 0);
        assert_eq!(got, m);
        assert_eq!(q.last_get_req(), 0);
        assert!(q.get_cmd().is_none());

        // The slot stays busy until the receiver marks it done.
        assert!(!q.read_slot(req_slot(0)).is_empty());
        q.slot_done(req_slot(0), got);
        let done = q.read_slot(req_slot(0));
        assert!(done.is_empty());
        assert_eq!(done.offs, m.offs);
        assert_eq!(done.len, m.len);
    }

    #[test]
    fn test_get_req_selective() {
        let hq = HeapQueue::new();
        let q = &hq.q;

        for req in 0..3i64 {
            q.write_slot(req_slot(req), Mailbox::new(1, 0, req as u32));
            q.set_last_put_req(req);
        }

        // Not yet published.
        assert!(q.get_req(5).is_none());

        // Fetching ahead does not advance the consumed counter.
        let m = q.get_req(2).unwrap();
        assert_eq!(m.len, 2);
        assert_eq!(q.last_get_req(), -1);

        // Fetching exactly the next request does.
        let m = q.get_req(0).unwrap();
        assert_eq!(m.len, 0);
        assert_eq!(q.last_get_req(), 0);

        // Already consumed.
        assert!(q.get_req(0).is_none());
    }

    #[test]
    fn test_sequence_invariant_threaded() {
        use std::sync::Arc;
        use std::thread;

        let hq = Arc::new(HeapQueue::new());
        let iterations = 20_000i64;

        let consumer = {
            let hq = Arc::clone(&hq);
            thread::spawn(move || {
                let q = &hq.q;
                let mut next = 0i64;
                while next < iterations {
                    if let Some((req, m)) = q.get_cmd() {
                        assert_eq!(req, next);
                        assert_eq!(m.cmd, 1);
                        assert_eq!(m.len, req as u32 & 0xFFFF);
                        q.slot_done(req_slot(req), m);
                        next += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let q = &hq.q;
        for req in 0..iterations {
            let slot = req_slot(req);
            // Producer back-pressure: wait for the head slot to empty.
            while !q.read_slot(slot).is_empty() {
                std::hint::spin_loop();
            }
            let last_get = q.last_get_req();
            assert!(req - 1 - last_get <= URPC_LEN_MB as i64);
            q.write_slot(slot, Mailbox::new(1, 0, req as u32 & 0xFFFF));
            q.set_last_put_req(req);
        }

        consumer.join().unwrap();
        assert_eq!(hq.q.last_get_req(), iterations - 1);
    }

    #[test]
    fn test_flags_roundtrip() {
        let hq = HeapQueue::new();
        hq.q.set_sender_flags(0xAA55);
        hq.q.set_receiver_flags(0x1234);
        assert_eq!(hq.q.sender_flags(), 0xAA55);
        assert_eq!(hq.q.receiver_flags(), 0x1234);
    }
}
