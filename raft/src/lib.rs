#![deny(unused_must_use)]

pub mod process;

mod error;
pub mod requester;
pub mod service;

pub use error::Error;
pub use process::thread::ThreadHandle;
pub use process::{ApplyMsg, LogEntry, RaftConfig, RaftProcess};

use bytes::Bytes;

/// Identifier of a peer within its replica group.
/// The peer set of a group is static, so a position in the peer list suffices.
pub type NodeId = u64;

/// Election term. Only one leader can be elected per term.
pub type Term = u64;

/// Log index. Indices are dense from the snapshot anchor onward.
pub type Index = u64;

/// Durable storage consumed by the replica.
///
/// `save_state_and_snapshot` must write both blobs atomically: a crash may
/// lose the pair but must never leave one side updated without the other.
pub trait Persister: Send + Sync + 'static {
    fn save_raft_state(&self, state: Bytes);
    fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes);
    fn read_raft_state(&self) -> Bytes;
    fn read_snapshot(&self) -> Bytes;
    fn raft_state_size(&self) -> usize;
}

/// One-shot RPC fabric.
///
/// `Err` means the call did not receive a reply within the transport's own
/// timeout. The outcome is unknown and the caller must retry.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, peer: &str, method: &str, args: Bytes) -> anyhow::Result<Bytes>;
}
