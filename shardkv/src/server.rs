use super::*;

use crate::applier::{self, KvState, NotifyMsg};
use crate::migrator;
use crate::msg;
use anyhow::Result;
use derive_more::Deref;
use log::*;
use shoal_raft::{Index, NodeId, Persister, RaftConfig, RaftProcess, ThreadHandle, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a gateway request waits for its command to apply.
pub(crate) const CMD_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a cleanup request waits for apply confirmation.
pub(crate) const CLEANUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Point-in-time view of the migration state, for monitoring.
#[derive(Clone, Debug)]
pub struct ShardReport {
    pub config_num: u64,
    pub own_shards: Vec<usize>,
    pub wait_shards: Vec<usize>,
    /// `(config_num, shard)` pairs still frozen for the new owner.
    pub frozen: Vec<(u64, usize)>,
}

pub struct Inner {
    pub(crate) gid: Gid,
    pub(crate) me: NodeId,
    pub(crate) replica: RaftProcess,
    pub(crate) persister: Arc<dyn Persister>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) controller: Arc<dyn ShardController>,
    pub(crate) max_raft_state: Option<usize>,
    pub(crate) state: Mutex<KvState>,
    /// Single-shot notification slots, keyed by the server-local request id
    /// so a retried client request waiting twice gets two independent slots.
    notify: spin::Mutex<HashMap<u64, mpsc::Sender<NotifyMsg>>>,
    next_req_id: AtomicU64,
    killed: AtomicBool,
    threads: Mutex<Vec<ThreadHandle>>,
}

#[derive(Deref, Clone)]
pub struct ShardKv(Arc<Inner>);

impl ShardKv {
    /// Start one peer of a replica group. `group_servers[me]` is this node's
    /// own transport name. `max_raft_state = None` disables snapshotting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gid: Gid,
        me: NodeId,
        group_servers: Vec<String>,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn Transport>,
        controller: Arc<dyn ShardController>,
        max_raft_state: Option<usize>,
        raft_config: RaftConfig,
    ) -> Self {
        let (replica, apply_rx) = RaftProcess::new(
            me,
            group_servers,
            persister.clone(),
            transport.clone(),
            raft_config,
        );
        let state = KvState::from_snapshot(&persister.read_snapshot());

        let inner = Inner {
            gid,
            me,
            replica,
            persister,
            transport,
            controller,
            max_raft_state,
            state: Mutex::new(state),
            notify: spin::Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
            killed: AtomicBool::new(false),
            threads: Mutex::new(vec![]),
        };
        let this = Self(Arc::new(inner));

        let handles = vec![
            applier::new(this.clone(), apply_rx),
            migrator::pull_config::new(this.clone()),
            migrator::pull_shards::new(this.clone()),
        ];
        *this.threads.lock().unwrap() = handles;
        this
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.replica.kill();
        self.threads.lock().unwrap().clear();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.replica.is_leader()
    }

    pub async fn get(&self, args: msg::GetArgs) -> msg::GetReply {
        let cmd = msg::Command::ClientOp {
            client_id: args.client_id,
            msg_id: args.msg_id,
            req_id: 0,
            config_num: args.config_num,
            op: msg::OpKind::Get,
            key: args.key,
            value: String::new(),
        };
        let res = self.wait_cmd(cmd).await;
        msg::GetReply {
            status: res.status,
            value: res.value,
        }
    }

    pub async fn put_append(&self, args: msg::PutAppendArgs) -> msg::PutAppendReply {
        let cmd = msg::Command::ClientOp {
            client_id: args.client_id,
            msg_id: args.msg_id,
            req_id: 0,
            config_num: args.config_num,
            op: args.op,
            key: args.key,
            value: args.value,
        };
        let res = self.wait_cmd(cmd).await;
        msg::PutAppendReply { status: res.status }
    }

    /// Propose a client command and block until the applier answers or the
    /// wait times out. Deduplication happens inside the applier; here a
    /// fresh slot is registered per attempt.
    async fn wait_cmd(&self, mut cmd: msg::Command) -> NotifyMsg {
        if self.is_killed() || !self.replica.is_leader() {
            return NotifyMsg::status(Status::WrongLeader);
        }
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        if let msg::Command::ClientOp { req_id: slot, .. } = &mut cmd {
            *slot = req_id;
        }

        // Register before proposing so a fast applier cannot win the race.
        // The slot buffers one message: a late notification on a slot whose
        // waiter already gave up never blocks the applier.
        let (tx, mut rx) = mpsc::channel(1);
        self.notify.lock().insert(req_id, tx);

        if self.replica.start(cmd.serialize()).is_none() {
            self.notify.lock().remove(&req_id);
            return NotifyMsg::status(Status::WrongLeader);
        }

        let res = match tokio::time::timeout(CMD_TIMEOUT, rx.recv()).await {
            Ok(Some(res)) => res,
            _ => NotifyMsg::status(Status::Timeout),
        };
        self.notify.lock().remove(&req_id);
        res
    }

    pub(crate) fn notify_waiter(&self, req_id: u64, res: NotifyMsg) {
        if let Some(tx) = self.notify.lock().get(&req_id) {
            let _ = tx.try_send(res);
        }
    }

    /// Serve a frozen shard to its new owner. The copy is cloned out of
    /// `history_shards`: a later cleanup must not mutate a reply in flight.
    pub fn fetch_shard_data(&self, args: msg::FetchShardDataArgs) -> msg::FetchShardDataReply {
        if !self.replica.is_leader() {
            return msg::FetchShardDataReply::default();
        }
        let state = self.state.lock().unwrap();
        if state.config.num <= args.config_num {
            // We have not moved past that epoch yet.
            return msg::FetchShardDataReply::default();
        }
        match state.history(args.config_num, args.shard) {
            Some(p) => msg::FetchShardDataReply {
                success: true,
                data: p.data.clone(),
                last_applied: p.last_applied.clone(),
            },
            None => msg::FetchShardDataReply::default(),
        }
    }

    /// Drop our frozen copy of a migrated shard, through the log so every
    /// replica of this group drops it. Acknowledged only once applied.
    pub async fn clean_shard_data(&self, args: msg::CleanShardDataArgs) -> msg::CleanShardDataReply {
        let failed = msg::CleanShardDataReply { success: false };
        if self.is_killed() || !self.replica.is_leader() {
            return failed;
        }
        let cmd = msg::Command::ShardCleanup {
            config_num: args.config_num,
            shard: args.shard,
        };
        if self.replica.start(cmd.serialize()).is_none() {
            return failed;
        }
        let deadline = tokio::time::Instant::now() + CLEANUP_TIMEOUT;
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.history(args.config_num, args.shard).is_none() {
                    return msg::CleanShardDataReply { success: true };
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return failed;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Inbound dispatch for the transport fabric: client operations,
    /// inter-group shard transfer, and the replica's consensus RPCs.
    pub async fn handle_rpc(&self, method: &str, args: Bytes) -> Result<Bytes> {
        if shoal_raft::service::owns_method(method) {
            return shoal_raft::service::handle(&self.replica, method, args);
        }
        let reply = match method {
            msg::method::GET => {
                bincode::serialize(&self.get(bincode::deserialize(&args)?).await)?
            }
            msg::method::PUT_APPEND => {
                bincode::serialize(&self.put_append(bincode::deserialize(&args)?).await)?
            }
            msg::method::FETCH_SHARD_DATA => {
                bincode::serialize(&self.fetch_shard_data(bincode::deserialize(&args)?))?
            }
            msg::method::CLEAN_SHARD_DATA => {
                bincode::serialize(&self.clean_shard_data(bincode::deserialize(&args)?).await)?
            }
            other => anyhow::bail!(Error::UnknownMethod(other.to_owned())),
        };
        Ok(reply.into())
    }

    pub fn shard_report(&self) -> ShardReport {
        let state = self.state.lock().unwrap();
        let mut own_shards: Vec<usize> = state.own_shards.iter().copied().collect();
        own_shards.sort_unstable();
        let mut wait_shards: Vec<usize> = state.wait_shards.iter().copied().collect();
        wait_shards.sort_unstable();
        let mut frozen: Vec<(u64, usize)> = state
            .history_shards
            .iter()
            .flat_map(|(num, shards)| shards.keys().map(|s| (*num, *s)))
            .collect();
        frozen.sort_unstable();
        ShardReport {
            config_num: state.config.num,
            own_shards,
            wait_shards,
            frozen,
        }
    }

    pub(crate) fn maybe_snapshot(&self, index: Index, state: &KvState) {
        let Some(max) = self.max_raft_state else {
            return;
        };
        if self.persister.raft_state_size() < max {
            return;
        }
        debug!("group {} peer {} snapshots through {}", self.gid, self.me, index);
        self.replica.save_snapshot(index, state.encode());
    }
}
