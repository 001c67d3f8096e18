//! urpc - micro-RPC transport between a host process and a remote peer
//! process over a shared-memory segment.
//!
//! # Architecture
//!
//! ```text
//! ┌──────── host ────────┐          ┌─────── remote ───────┐
//! │        Peer          │          │        Peer          │
//! │  ┌──────┐ ┌───────┐  │  shared  │  ┌──────┐ ┌───────┐  │
//! │  │ send │ │ recv  │  │  segment │  │ recv │ │ send  │  │
//! │  └──┬───┘ └───▲───┘  │          │  └──▲───┘ └───┬───┘  │
//! └─────┼─────────┼──────┘          └─────┼─────────┼──────┘
//!       │   ┌─────┴──────────────────┐    │         │
//!       └──►│ queue 0: mailbox + data├────┘         │
//!           ├────────────────────────┤              │
//!       ┌───┤ queue 1: mailbox + data│◄─────────────┘
//!       ▼   └────────────────────────┘
//! ```
//!
//! Each direction of the channel is a single-producer/single-consumer
//! transfer queue: a ring of 8-byte mailbox slots plus a byte ring that
//! carries variable-length payloads. The host creates and initializes the
//! segment; the remote attaches and confirms attachment through a counter
//! embedded in the first queue header. On the remote side, payload bytes
//! move between the segment and local mirror memory through a
//! [`BlockTransfer`] engine; the host reads and writes the segment
//! directly.
//!
//! - **Mailbox slot**: one 64-bit word, `cmd:8 | offs:24 | len:32`,
//!   published and consumed with explicit acquire/release fences.
//! - **Payload ring**: bump-allocated; finished regions are reclaimed in
//!   submission order once the receiver marks the owning slot done.
//! - **Handlers**: command codes `1..=URPC_MAX_HANDLERS` dispatch to
//!   registered callbacks from the inbound progress loop.

pub mod codec;
pub mod config;
pub mod error;
pub mod peer;
pub mod proc;
pub mod queue;
pub mod shm;

mod payload;

pub use codec::Value;
pub use config::PeerConfig;
pub use error::{Error, Result};
pub use peer::{BlockTransfer, Comm, MemcpyTransfer, Peer};
pub use queue::{Mailbox, TransferQueue};

/// Number of mailbox slots per direction. Must be a power of two and must
/// match between the two peers.
pub const URPC_LEN_MB: usize = 256;

/// Size in bytes of the payload data ring of one direction.
pub const URPC_DATA_BUFF_LEN: u32 = 4 * 1024 * 1024;

/// Highest usable command code. Code 0 is reserved for the empty slot.
pub const URPC_MAX_HANDLERS: u8 = 64;

/// Total size of one direction: queue header followed by its data ring.
pub const URPC_BUFF_LEN: usize = queue::QUEUE_HEADER_LEN + URPC_DATA_BUFF_LEN as usize;

/// Maximum number of peers a single process may own at a time.
pub const URPC_MAX_PEERS: usize = 32;

/// Empty slot marker.
pub const CMD_NONE: u8 = 0;
/// Remote function call request.
pub const CMD_CALL: u8 = 1;
/// Successful call reply carrying the return value.
pub const CMD_RESULT: u8 = 2;
/// Call reply reporting that the callee raised an exception.
pub const CMD_EXCEPTION: u8 = 3;
/// Request that the receiving peer shut down.
pub const CMD_CLOSE: u8 = 4;
/// Acknowledgement of a shutdown request.
pub const CMD_CLOSE_ACK: u8 = 5;
