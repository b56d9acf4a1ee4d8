use super::*;

use serde::de::DeserializeOwned;
use shoal_raft::Transport;

/// Method names understood by `ShardKv::handle_rpc`.
pub mod method {
    pub const GET: &str = "kv.get";
    pub const PUT_APPEND: &str = "kv.put_append";
    pub const FETCH_SHARD_DATA: &str = "kv.fetch_shard_data";
    pub const CLEAN_SHARD_DATA: &str = "kv.clean_shard_data";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: u64,
    pub msg_id: u64,
    pub config_num: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReply {
    pub status: Status,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: OpKind,
    pub client_id: u64,
    pub msg_id: u64,
    pub config_num: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub status: Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchShardDataArgs {
    pub config_num: u64,
    pub shard: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchShardDataReply {
    pub success: bool,
    pub data: HashMap<String, String>,
    pub last_applied: HashMap<u64, u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanShardDataArgs {
    pub config_num: u64,
    pub shard: usize,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CleanShardDataReply {
    pub success: bool,
}

/// Frozen copy of one shard: its data plus the per-client deduplication
/// evidence, which must travel with the shard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPayload {
    pub data: HashMap<String, String>,
    pub last_applied: HashMap<u64, u64>,
}

/// Commands carried by the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    ClientOp {
        client_id: u64,
        msg_id: u64,
        req_id: u64,
        config_num: u64,
        op: OpKind,
        key: String,
        value: String,
    },
    ConfigChange(Config),
    ShardMerge {
        config_num: u64,
        shard: usize,
        payload: ShardPayload,
    },
    ShardCleanup {
        config_num: u64,
        shard: usize,
    },
}

impl Command {
    pub fn serialize(&self) -> Bytes {
        bincode::serialize(self).unwrap().into()
    }

    /// A committed command that fails to decode means the peers are running
    /// divergent code; continuing would corrupt the replicated state.
    pub fn deserialize(x: &[u8]) -> Command {
        bincode::deserialize(x).expect("undecodable command in the log")
    }
}

/// One typed call over the byte-level transport.
pub async fn call<A: Serialize, R: DeserializeOwned>(
    transport: &dyn Transport,
    peer: &str,
    method: &str,
    args: &A,
) -> anyhow::Result<R> {
    let bytes = bincode::serialize(args)?;
    let reply = transport.send(peer, method, bytes.into()).await?;
    Ok(bincode::deserialize(&reply)?)
}
