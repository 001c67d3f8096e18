//! Configuration for a urpc peer.

/// Peer configuration.
///
/// Controls the busy-wait deadlines of the transport. The ring geometry
/// (slot count, data ring size) is compile-time and must match between the
/// two peers; only timing is tunable here.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Deadline for a payload allocation, in microseconds. While the ring
    /// is short on space the allocator keeps reclaiming finished payloads
    /// until this much time has passed.
    /// Default: 3_000_000 (3s)
    pub alloc_timeout_us: u64,
    /// Deadline for publishing into a busy mailbox slot, in microseconds.
    /// `None` spins until the receiver frees the slot.
    /// Default: None
    pub put_timeout_us: Option<u64>,
    /// How long the host waits for the remote to attach to the segment.
    /// Default: 10_000_000 (10s)
    pub attach_timeout_us: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            alloc_timeout_us: 3_000_000,
            put_timeout_us: None,
            attach_timeout_us: 10_000_000,
        }
    }
}

impl PeerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload allocation deadline.
    pub fn with_alloc_timeout_us(mut self, alloc_timeout_us: u64) -> Self {
        self.alloc_timeout_us = alloc_timeout_us;
        self
    }

    /// Set the mailbox publish deadline.
    pub fn with_put_timeout_us(mut self, put_timeout_us: Option<u64>) -> Self {
        self.put_timeout_us = put_timeout_us;
        self
    }

    /// Set the attach deadline.
    pub fn with_attach_timeout_us(mut self, attach_timeout_us: u64) -> Self {
        self.attach_timeout_us = attach_timeout_us;
        self
    }
}
