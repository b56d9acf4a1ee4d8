use super::*;

use crate::msg;
use log::*;
use shoal_raft::Transport;
use std::sync::Arc;
use std::time::Duration;

const CHANGE_LEADER_INTERVAL: Duration = Duration::from_millis(20);

/// Client handle for the sharded store.
///
/// Operations are issued strictly sequentially. Each carries a fresh random
/// 63-bit `msg_id` that stays stable across retries, and the servers
/// deduplicate by the last `msg_id` seen per client on each shard. Issuing
/// operations from one `Clerk` concurrently voids the at-most-once
/// guarantee.
pub struct Clerk {
    controller: Arc<dyn ShardController>,
    transport: Arc<dyn Transport>,
    client_id: u64,
    config: Config,
    leader_hint: HashMap<Gid, usize>,
}

impl Clerk {
    pub fn new(controller: Arc<dyn ShardController>, transport: Arc<dyn Transport>) -> Self {
        Self {
            controller,
            transport,
            client_id: fresh_id(),
            config: Config::default(),
            leader_hint: HashMap::new(),
        }
    }

    /// Fetch the current value for a key. `None` if the key does not exist.
    /// Keeps trying forever in the face of all other errors.
    pub async fn get(&mut self, key: &str) -> Option<String> {
        let msg_id = fresh_id();
        loop {
            let Some((gid, servers)) = self.route(key).await else {
                continue;
            };
            let mut hint = self.leader_hint.get(&gid).copied().unwrap_or(0);
            let mut wrong_group = false;
            for _ in 0..servers.len() {
                let at = hint % servers.len();
                let args = msg::GetArgs {
                    key: key.to_owned(),
                    client_id: self.client_id,
                    msg_id,
                    config_num: self.config.num,
                };
                let resp = msg::call::<_, msg::GetReply>(
                    &*self.transport,
                    &servers[at],
                    msg::method::GET,
                    &args,
                )
                .await;
                match resp {
                    Ok(reply) => match reply.status {
                        Status::Ok => {
                            self.leader_hint.insert(gid, at);
                            return Some(reply.value);
                        }
                        Status::NoKey => {
                            self.leader_hint.insert(gid, at);
                            return None;
                        }
                        Status::WrongGroup => {
                            wrong_group = true;
                            break;
                        }
                        Status::WrongLeader | Status::Timeout => hint += 1,
                    },
                    Err(_) => hint += 1,
                }
                tokio::time::sleep(CHANGE_LEADER_INTERVAL).await;
            }
            self.refresh_config().await;
            if !wrong_group {
                tokio::time::sleep(CHANGE_LEADER_INTERVAL).await;
            }
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, msg::OpKind::Put).await
    }

    pub async fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, msg::OpKind::Append).await
    }

    async fn put_append(&mut self, key: &str, value: &str, op: msg::OpKind) {
        let msg_id = fresh_id();
        loop {
            let Some((gid, servers)) = self.route(key).await else {
                continue;
            };
            let mut hint = self.leader_hint.get(&gid).copied().unwrap_or(0);
            let mut wrong_group = false;
            for _ in 0..servers.len() {
                let at = hint % servers.len();
                let args = msg::PutAppendArgs {
                    key: key.to_owned(),
                    value: value.to_owned(),
                    op,
                    client_id: self.client_id,
                    msg_id,
                    config_num: self.config.num,
                };
                let resp = msg::call::<_, msg::PutAppendReply>(
                    &*self.transport,
                    &servers[at],
                    msg::method::PUT_APPEND,
                    &args,
                )
                .await;
                match resp {
                    Ok(reply) => match reply.status {
                        Status::Ok | Status::NoKey => {
                            self.leader_hint.insert(gid, at);
                            return;
                        }
                        Status::WrongGroup => {
                            wrong_group = true;
                            break;
                        }
                        Status::WrongLeader | Status::Timeout => hint += 1,
                    },
                    Err(_) => hint += 1,
                }
                tokio::time::sleep(CHANGE_LEADER_INTERVAL).await;
            }
            self.refresh_config().await;
            if !wrong_group {
                tokio::time::sleep(CHANGE_LEADER_INTERVAL).await;
            }
        }
    }

    /// Resolve the group currently owning the key's shard, refreshing the
    /// cached configuration when it is unknown or stale.
    async fn route(&mut self, key: &str) -> Option<(Gid, Vec<String>)> {
        if self.config.num == 0 {
            self.refresh_config().await;
        }
        let gid = self.config.owner(shard_of(key));
        let servers = self.config.servers(gid).to_vec();
        if gid == 0 || servers.is_empty() {
            self.refresh_config().await;
            tokio::time::sleep(CHANGE_LEADER_INTERVAL).await;
            return None;
        }
        Some((gid, servers))
    }

    async fn refresh_config(&mut self) {
        let latest = self.controller.query(None).await;
        if latest.num != self.config.num {
            debug!("client {} moves to configuration {}", self.client_id, latest.num);
        }
        self.config = latest;
    }
}

fn fresh_id() -> u64 {
    rand::random::<u64>() >> 1
}
