use super::*;

use crate::requester::method;
use anyhow::Result;

/// True if `service::handle` understands `method_name`.
pub fn owns_method(method_name: &str) -> bool {
    method_name.starts_with("raft.")
}

/// Dispatch an inbound consensus RPC to `process`.
///
/// The transport fabric routes `Transport::send` payloads here, so the
/// replica stays agnostic to how bytes actually move between nodes.
pub fn handle(process: &RaftProcess, method_name: &str, args: Bytes) -> Result<Bytes> {
    let reply = match method_name {
        method::REQUEST_VOTE => {
            let req = bincode::deserialize(&args)?;
            bincode::serialize(&process.receive_vote_request(req))?
        }
        method::APPEND_ENTRIES => {
            let req = bincode::deserialize(&args)?;
            bincode::serialize(&process.receive_append_entries(req))?
        }
        method::INSTALL_SNAPSHOT => {
            let req = bincode::deserialize(&args)?;
            bincode::serialize(&process.receive_install_snapshot(req))?
        }
        other => anyhow::bail!(Error::UnknownMethod(other.to_owned())),
    };
    Ok(reply.into())
}
