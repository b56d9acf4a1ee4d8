use super::*;

use crate::process::{request, response};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Method names understood by `service::handle`.
pub mod method {
    pub const REQUEST_VOTE: &str = "raft.request_vote";
    pub const APPEND_ENTRIES: &str = "raft.append_entries";
    pub const INSTALL_SNAPSHOT: &str = "raft.install_snapshot";
}

/// Typed connection to one peer over the byte-level transport.
pub struct Connection {
    transport: Arc<dyn Transport>,
    peer: String,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, peer: String) -> Self {
        Self { transport, peer }
    }

    async fn call<A: Serialize, R: DeserializeOwned>(&self, method: &str, args: &A) -> Result<R> {
        let bytes = bincode::serialize(args)?;
        let reply = self.transport.send(&self.peer, method, bytes.into()).await?;
        Ok(bincode::deserialize(&reply)?)
    }

    pub async fn request_vote(
        &self,
        req: &request::RequestVote,
    ) -> Result<response::RequestVote> {
        self.call(method::REQUEST_VOTE, req).await
    }

    pub async fn append_entries(
        &self,
        req: &request::AppendEntries,
    ) -> Result<response::AppendEntries> {
        self.call(method::APPEND_ENTRIES, req).await
    }

    pub async fn install_snapshot(
        &self,
        req: &request::InstallSnapshot,
    ) -> Result<response::InstallSnapshot> {
        self.call(method::INSTALL_SNAPSHOT, req).await
    }
}
