use crate::lab::{LabNet, MemPersister, RpcService, ScriptedController};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use shoal_raft::{ApplyMsg, Index, NodeId, RaftConfig, RaftProcess};
use shoal_shardkv::{Clerk, Config, Gid, ShardKv, N_SHARDS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// raw consensus groups

/// What one node's "state machine" has observed from the apply channel.
#[derive(Default)]
pub struct AppliedLog {
    pub last_index: Index,
    pub commands: HashMap<Index, Bytes>,
    pub reloads: usize,
}

struct RaftService(RaftProcess);

#[async_trait]
impl RpcService for RaftService {
    async fn handle(&self, method: &str, args: Bytes) -> Result<Bytes> {
        shoal_raft::service::handle(&self.0, method, args)
    }
}

pub struct RaftNode {
    pub process: RaftProcess,
    pub persister: Arc<MemPersister>,
    pub applied: Arc<Mutex<AppliedLog>>,
}

/// One consensus group wired over a `LabNet`, with a trivial state machine
/// that records every applied command.
pub struct RaftCluster {
    pub net: Arc<LabNet>,
    pub names: Vec<String>,
    pub nodes: Vec<RaftNode>,
}

fn collect_applies(
    applied: Arc<Mutex<AppliedLog>>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ApplyMsg>,
) {
    let _ = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut log = applied.lock().unwrap();
            if msg.valid {
                log.commands.insert(msg.index, msg.command);
                log.last_index = msg.index;
            } else {
                log.reloads += 1;
                log.last_index = msg.index;
            }
        }
    });
}

impl RaftCluster {
    pub fn new(n: usize) -> Self {
        let net = LabNet::new();
        let names: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        let mut nodes = vec![];
        for i in 0..n {
            let persister = MemPersister::new();
            nodes.push(Self::boot(&net, &names, i as NodeId, persister));
        }
        Self { net, names, nodes }
    }

    fn boot(
        net: &Arc<LabNet>,
        names: &[String],
        me: NodeId,
        persister: Arc<MemPersister>,
    ) -> RaftNode {
        let (process, apply_rx) = RaftProcess::new(
            me,
            names.to_vec(),
            persister.clone(),
            net.transport(&names[me as usize]),
            RaftConfig::default(),
        );
        net.register(
            &names[me as usize],
            Arc::new(RaftService(process.clone())),
        );
        let applied = Arc::new(Mutex::new(AppliedLog::default()));
        collect_applies(applied.clone(), apply_rx);
        RaftNode {
            process,
            persister,
            applied,
        }
    }

    /// Kill node `i` and boot a fresh process from its persisted state.
    pub fn restart(&mut self, i: usize) {
        self.nodes[i].process.kill();
        let persister = self.nodes[i].persister.clone();
        self.nodes[i] = Self::boot(&self.net, &self.names, i as NodeId, persister);
    }

    pub fn disconnect(&self, i: usize) {
        self.net.set_connected(&self.names[i], false);
    }

    pub fn connect(&self, i: usize) {
        self.net.set_connected(&self.names[i], true);
    }

    /// The connected leader, if the group currently agrees on one.
    pub fn leader(&self, connected: &[usize]) -> Option<usize> {
        let leaders: Vec<usize> = connected
            .iter()
            .copied()
            .filter(|&i| self.nodes[i].process.is_leader())
            .collect();
        match leaders.as_slice() {
            [one] => Some(*one),
            _ => None,
        }
    }

    /// Propose through whichever node accepts it.
    pub fn submit(&self, command: &[u8]) -> Option<Index> {
        for node in &self.nodes {
            if let Some((index, _)) = node.process.start(Bytes::copy_from_slice(command)) {
                return Some(index);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// full shardkv deployments

struct KvService(ShardKv);

#[async_trait]
impl RpcService for KvService {
    async fn handle(&self, method: &str, args: Bytes) -> Result<Bytes> {
        self.0.handle_rpc(method, args).await
    }
}

pub struct KvGroup {
    pub gid: Gid,
    pub names: Vec<String>,
    pub servers: Vec<ShardKv>,
    pub persisters: Vec<Arc<MemPersister>>,
}

pub struct KvCluster {
    pub net: Arc<LabNet>,
    pub controller: Arc<ScriptedController>,
    pub groups: Vec<KvGroup>,
    max_raft_state: Option<usize>,
}

pub fn server_name(gid: Gid, i: usize) -> String {
    format!("s{gid}-{i}")
}

impl KvCluster {
    pub fn new(group_sizes: &[(Gid, usize)], max_raft_state: Option<usize>) -> Self {
        let net = LabNet::new();
        let controller = ScriptedController::new();
        let mut groups = vec![];
        for &(gid, n) in group_sizes {
            let names: Vec<String> = (0..n).map(|i| server_name(gid, i)).collect();
            let mut servers = vec![];
            let mut persisters = vec![];
            for (i, name) in names.iter().enumerate() {
                let persister = MemPersister::new();
                let kv = ShardKv::new(
                    gid,
                    i as NodeId,
                    names.clone(),
                    persister.clone(),
                    net.transport(name),
                    controller.clone(),
                    max_raft_state,
                    RaftConfig::default(),
                );
                net.register(name, Arc::new(KvService(kv.clone())));
                servers.push(kv);
                persisters.push(persister);
            }
            groups.push(KvGroup {
                gid,
                names,
                servers,
                persisters,
            });
        }
        Self {
            net,
            controller,
            groups,
            max_raft_state,
        }
    }

    pub fn group(&self, gid: Gid) -> &KvGroup {
        self.groups.iter().find(|g| g.gid == gid).unwrap()
    }

    /// Publish the next configuration assigning each shard to the given gid.
    /// Gid 0 leaves the shard unassigned.
    pub fn publish(&self, shards: [Gid; N_SHARDS]) {
        let mut groups = HashMap::new();
        for g in &self.groups {
            if shards.contains(&g.gid) {
                groups.insert(g.gid, g.names.clone());
            }
        }
        self.controller.publish(Config {
            num: self.controller.latest_num() + 1,
            shards,
            groups,
        });
    }

    pub fn clerk(&self) -> Clerk {
        Clerk::new(
            self.controller.clone(),
            self.net.transport("client"),
        )
    }

    /// Kill one peer and boot a replacement from its persisted state.
    pub fn restart(&mut self, gid: Gid, i: usize) {
        let max_raft_state = self.max_raft_state;
        let net = self.net.clone();
        let controller = self.controller.clone();
        let group = self.groups.iter_mut().find(|g| g.gid == gid).unwrap();
        group.servers[i].kill();
        let name = group.names[i].clone();
        let kv = ShardKv::new(
            gid,
            i as NodeId,
            group.names.clone(),
            group.persisters[i].clone(),
            net.transport(&name),
            controller,
            max_raft_state,
            RaftConfig::default(),
        );
        net.register(&name, Arc::new(KvService(kv.clone())));
        group.servers[i] = kv;
    }

    pub fn disconnect(&self, gid: Gid, i: usize) {
        self.net.set_connected(&server_name(gid, i), false);
    }

    pub fn connect(&self, gid: Gid, i: usize) {
        self.net.set_connected(&server_name(gid, i), true);
    }

    pub fn leader_of(&self, gid: Gid) -> Option<usize> {
        let group = self.group(gid);
        group
            .servers
            .iter()
            .position(|kv| !kv.is_killed() && kv.is_leader())
    }
}
