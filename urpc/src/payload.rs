//! Payload ring allocator.
//!
//! Each direction's sender owns a bump allocator over the data ring. The
//! free interval `[free_begin, free_end)` is handed out front-to-back; a
//! side table (`mlist`) records the region owned by each mailbox slot at
//! publish time. Because the queue is SPSC and slots are reused in order,
//! finished payloads form a contiguous run that `gc` reclaims in one pass,
//! folding the fragment at the end of the ring into the most recent
//! request when wrapping.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::queue::{align8, req_slot, Mailbox, TransferQueue};
use crate::{URPC_DATA_BUFF_LEN, URPC_LEN_MB};

/// Region of the data ring owned by a mailbox slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MemBlock {
    pub offs: u32,
    pub len: u32,
}

/// Sender-side allocator state for one direction.
pub(crate) struct PayloadRing {
    free_begin: u32,
    free_end: u32,
    mlist: [MemBlock; URPC_LEN_MB],
}

impl PayloadRing {
    pub fn new() -> Self {
        Self {
            free_begin: 0,
            free_end: URPC_DATA_BUFF_LEN,
            mlist: [MemBlock::default(); URPC_LEN_MB],
        }
    }

    /// Bytes currently available in the free interval.
    #[inline]
    pub fn free_bytes(&self) -> u32 {
        self.free_end - self.free_begin
    }

    #[cfg(test)]
    pub fn free_interval(&self) -> (u32, u32) {
        (self.free_begin, self.free_end)
    }

    #[cfg(test)]
    pub fn live_regions(&self) -> Vec<MemBlock> {
        self.mlist.iter().copied().filter(|b| b.len > 0).collect()
    }

    /// Record the publish-time bookkeeping for `slot`.
    ///
    /// If the slot's previous payload is adjacent to the free interval it
    /// is reclaimed on the spot; the new region (if any) replaces it in
    /// the side table.
    pub fn note_put(&mut self, slot: usize, m: Mailbox) {
        let ml = &mut self.mlist[slot];
        if ml.len > 0 && self.free_end < URPC_DATA_BUFF_LEN && ml.offs == self.free_end {
            self.free_end = align8(ml.offs + ml.len);
        }
        *ml = if m.len > 0 {
            MemBlock {
                offs: m.offs,
                len: m.len,
            }
        } else {
            MemBlock::default()
        };
    }

    /// Reclaim finished payloads and adjust the free interval.
    ///
    /// Walks the slots in submission order starting right after the most
    /// recently published one (i.e. from the oldest outstanding request)
    /// and extends `free_end` over each finished region that continues the
    /// free interval. Stops at the first still-live slot or at a region
    /// that would leave a hole. Returns the new free-byte count.
    pub fn gc(&mut self, tq: &TransferQueue) -> u32 {
        let last_slot = req_slot(tq.last_put_req());

        // At the end of the ring, fold the remaining fragment into the
        // most recent request so a single free interval survives the wrap.
        if self.free_end == URPC_DATA_BUFF_LEN {
            let ml = &mut self.mlist[last_slot];
            if ml.len == 0 {
                ml.offs = self.free_begin;
            }
            ml.len = self.free_end - ml.offs;
            self.free_begin = 0;
            self.free_end = 0;
        }

        for i in 1..=URPC_LEN_MB {
            let slot = (last_slot + i) & (URPC_LEN_MB - 1);
            let ml = self.mlist[slot];
            if ml.len == 0 {
                continue;
            }
            if !tq.read_slot(slot).is_empty() {
                break;
            }
            if self.free_end >= URPC_DATA_BUFF_LEN || ml.offs != self.free_end {
                break;
            }
            self.free_end = align8(ml.offs + ml.len);
            self.mlist[slot] = MemBlock::default();
            tq.write_slot(slot, Mailbox::EMPTY);
        }

        self.free_bytes()
    }

    /// Allocate a payload region of `size` bytes.
    ///
    /// Returns a descriptor with the command field still empty. Keeps
    /// running `gc` while the free interval is too small; fails with
    /// `PayloadExhausted` once `timeout_us` has elapsed.
    pub fn alloc(&mut self, tq: &TransferQueue, size: u32, timeout_us: u64) -> Result<Mailbox> {
        let asize = align8(size);
        if asize > URPC_DATA_BUFF_LEN {
            return Err(Error::PayloadExhausted { requested: size });
        }

        let start = Instant::now();
        while self.free_bytes() < asize {
            if self.gc(tq) >= asize {
                break;
            }
            if start.elapsed().as_micros() as u64 > timeout_us {
                eprintln!("urpc: payload allocation of {} bytes timed out", size);
                return Err(Error::PayloadExhausted { requested: size });
            }
            std::hint::spin_loop();
        }
        if self.free_begin + asize > self.free_end {
            return Err(Error::PayloadExhausted { requested: size });
        }

        let m = Mailbox {
            cmd: 0,
            offs: self.free_begin,
            len: size,
        };
        self.free_begin += asize;
        Ok(m)
    }

    /// Return the most recent allocation to the free interval, for the
    /// case where its publish failed and no slot ever owned it.
    pub fn undo_alloc(&mut self, m: Mailbox) {
        if m.len > 0 && m.offs + align8(m.len) == self.free_begin {
            self.free_begin = m.offs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::testutil::HeapQueue;

    /// Publish an allocated payload and return its request number.
    fn publish(ring: &mut PayloadRing, q: &TransferQueue, mut m: Mailbox, cmd: u8) -> i64 {
        let req = q.last_put_req() + 1;
        let slot = req_slot(req);
        assert!(q.read_slot(slot).is_empty(), "send queue full in test");
        m.cmd = cmd;
        ring.note_put(slot, m);
        q.write_slot(slot, m);
        q.set_last_put_req(req);
        req
    }

    /// Consume the next request the way the receiver does.
    fn consume(q: &TransferQueue) -> (i64, Mailbox) {
        let (req, m) = q.get_cmd().expect("queue unexpectedly empty");
        q.slot_done(req_slot(req), m);
        (req, m)
    }

    #[test]
    fn test_bump_allocation() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();

        let a = ring.alloc(&hq.q, 100, 1000).unwrap();
        assert_eq!(a.offs, 0);
        assert_eq!(a.len, 100);

        let b = ring.alloc(&hq.q, 1, 1000).unwrap();
        assert_eq!(b.offs, align8(100));
        assert_eq!(ring.free_bytes(), URPC_DATA_BUFF_LEN - align8(100) - align8(1));
    }

    #[test]
    fn test_alloc_larger_than_ring_fails_fast() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();

        let start = std::time::Instant::now();
        let err = ring.alloc(&hq.q, URPC_DATA_BUFF_LEN + 1, 60_000_000);
        assert!(matches!(err, Err(Error::PayloadExhausted { .. })));
        assert!(start.elapsed().as_secs() < 1);
    }

    #[test]
    fn test_alloc_times_out_when_nothing_finishes() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();

        // One live request holding most of the ring.
        let m = ring.alloc(&hq.q, URPC_DATA_BUFF_LEN - 64, 1000).unwrap();
        publish(&mut ring, &hq.q, m, 1);

        let err = ring.alloc(&hq.q, 1024, 20_000);
        assert!(matches!(err, Err(Error::PayloadExhausted { .. })));
    }

    #[test]
    fn test_reclaim_after_slot_done() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();

        let m = ring.alloc(&hq.q, URPC_DATA_BUFF_LEN - 64, 1000).unwrap();
        publish(&mut ring, &hq.q, m, 1);
        consume(&hq.q);

        // The finished payload is reclaimed once gc runs inside alloc.
        let m2 = ring.alloc(&hq.q, URPC_DATA_BUFF_LEN / 2, 1000).unwrap();
        assert_eq!(m2.len, URPC_DATA_BUFF_LEN / 2);
    }

    #[test]
    fn test_wrap_in_two_halves() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();
        let half = URPC_DATA_BUFF_LEN / 2;

        // Fill the ring completely with two halves, drain, then wrap.
        let a = ring.alloc(&hq.q, half, 1000).unwrap();
        publish(&mut ring, &hq.q, a, 1);
        let b = ring.alloc(&hq.q, half, 1000).unwrap();
        publish(&mut ring, &hq.q, b, 1);
        assert_eq!(ring.free_bytes(), 0);

        consume(&hq.q);
        consume(&hq.q);

        // Both halves again, landing at the start of the wrapped ring.
        let c = ring.alloc(&hq.q, half, 1000).unwrap();
        assert_eq!(c.offs, 0);
        publish(&mut ring, &hq.q, c, 1);
        let d = ring.alloc(&hq.q, half, 1000).unwrap();
        assert_eq!(d.offs, half);
        publish(&mut ring, &hq.q, d, 1);

        consume(&hq.q);
        consume(&hq.q);

        let (fb, fe) = ring.free_interval();
        assert!(fb <= fe && fe <= URPC_DATA_BUFF_LEN);
    }

    #[test]
    fn test_wrap_fragment_folded_into_last_request() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();

        // Leave a fragment shorter than the next allocation at the end.
        let a = ring
            .alloc(&hq.q, URPC_DATA_BUFF_LEN - 1000, 1000)
            .unwrap();
        publish(&mut ring, &hq.q, a, 1);
        consume(&hq.q);

        // 1000 bytes remain but 2000 are needed: gc wraps, folds the tail
        // fragment into the last request's region and reclaims everything.
        let b = ring.alloc(&hq.q, 2000, 1000).unwrap();
        assert_eq!(b.offs, 0);

        let (fb, fe) = ring.free_interval();
        assert_eq!(fb, align8(2000));
        assert!(fe <= URPC_DATA_BUFF_LEN);
    }

    /// Small deterministic generator for the mixed-traffic test.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    /// Live regions stay pairwise disjoint and outside the free interval
    /// across an arbitrary mix of allocations and completions.
    #[test]
    fn test_live_regions_disjoint() {
        let hq = HeapQueue::new();
        let mut ring = PayloadRing::new();
        let mut rng = XorShift(0x9E3779B97F4A7C15);
        let mut outstanding = 0usize;

        for _ in 0..4000 {
            let roll = rng.next();
            if outstanding < 64 && roll % 3 != 0 {
                let size = (roll >> 8) as u32 % 30_000 + 1;
                let m = ring.alloc(&hq.q, size, 1_000_000).unwrap();
                publish(&mut ring, &hq.q, m, 1);
                outstanding += 1;
            } else if outstanding > 0 {
                consume(&hq.q);
                outstanding -= 1;
            }

            let (fb, fe) = ring.free_interval();
            assert!(fb <= fe && fe <= URPC_DATA_BUFF_LEN);

            let mut regions = ring.live_regions();
            regions.sort_by_key(|b| b.offs);
            for pair in regions.windows(2) {
                assert!(
                    pair[0].offs + pair[0].len <= pair[1].offs,
                    "overlapping live regions: {:?}",
                    pair
                );
            }
            for b in &regions {
                let end = b.offs + b.len;
                assert!(end <= URPC_DATA_BUFF_LEN);
                assert!(
                    end <= fb || b.offs >= fe,
                    "live region {:?} intersects free interval [{}, {})",
                    b,
                    fb,
                    fe
                );
            }
        }
    }
}
