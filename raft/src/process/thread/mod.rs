use super::*;

use tokio::task::AbortHandle;

pub mod advance_apply;
pub mod advance_commit;
pub mod election;
pub mod replication;

/// Wrapper around an `AbortHandle` that aborts when it is dropped.
pub struct ThreadHandle(AbortHandle);

impl ThreadHandle {
    pub fn new(hdl: AbortHandle) -> Self {
        Self(hdl)
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
