use super::*;

use crate::msg;
use crate::server::ShardKv;
use log::*;
use std::time::Duration;

pub(crate) const PULL_CONFIG_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const PULL_SHARDS_INTERVAL: Duration = Duration::from_millis(200);

/// Pull the next configuration from the controller and propose it.
/// Runs on every peer but acts only on the leader.
pub(crate) mod pull_config {
    use super::*;
    use shoal_raft::ThreadHandle;

    #[derive(Clone)]
    pub struct Thread {
        kv: ShardKv,
    }

    impl Thread {
        async fn run_once(&self) {
            if !self.kv.replica.is_leader() {
                return;
            }
            let cur_num = {
                let state = self.kv.state.lock().unwrap();
                // One migration in flight at a time: no new configuration
                // while shards are still being pulled.
                if !state.wait_shards.is_empty() {
                    return;
                }
                state.config.num
            };
            let next = self.kv.controller.query(Some(cur_num + 1)).await;
            if next.num != cur_num + 1 {
                return;
            }
            // Re-check: the applier may have moved while we queried.
            {
                let state = self.kv.state.lock().unwrap();
                if !state.wait_shards.is_empty() || state.config.num != cur_num {
                    return;
                }
            }
            info!("group {} proposes configuration {}", self.kv.gid, next.num);
            let _ = self
                .kv
                .replica
                .start(msg::Command::ConfigChange(next).serialize());
        }

        fn do_loop(self) -> ThreadHandle {
            let hdl = tokio::spawn(async move {
                let mut interval = tokio::time::interval(PULL_CONFIG_INTERVAL);
                loop {
                    interval.tick().await;
                    if self.kv.is_killed() {
                        break;
                    }
                    self.run_once().await;
                }
            })
            .abort_handle();
            ThreadHandle::new(hdl)
        }
    }

    pub fn new(kv: ShardKv) -> ThreadHandle {
        Thread { kv }.do_loop()
    }
}

/// Pull every waiting shard from its previous owner and propose the merge.
/// Runs on every peer but acts only on the leader.
pub(crate) mod pull_shards {
    use super::*;
    use shoal_raft::ThreadHandle;

    #[derive(Clone)]
    pub struct Thread {
        kv: ShardKv,
    }

    impl Thread {
        async fn run_once(&self) {
            if !self.kv.replica.is_leader() {
                return;
            }
            let (old_config, shards) = {
                let state = self.kv.state.lock().unwrap();
                if state.wait_shards.is_empty() {
                    return;
                }
                (
                    state.old_config.clone(),
                    state.wait_shards.iter().copied().collect::<Vec<_>>(),
                )
            };
            for shard in shards {
                self.pull_one(&old_config, shard).await;
            }
        }

        async fn pull_one(&self, old_config: &Config, shard: usize) {
            let source = old_config.owner(shard);
            let args = msg::FetchShardDataArgs {
                config_num: old_config.num,
                shard,
            };
            for server in old_config.servers(source) {
                if self.kv.is_killed() {
                    return;
                }
                let resp = msg::call::<_, msg::FetchShardDataReply>(
                    &*self.kv.transport,
                    server,
                    msg::method::FETCH_SHARD_DATA,
                    &args,
                )
                .await;
                if let Ok(reply) = resp {
                    if reply.success {
                        debug!(
                            "group {} pulled shard {} from group {}",
                            self.kv.gid, shard, source
                        );
                        // Installed through the log, never directly: every
                        // replica of the group converges on the same
                        // post-merge state.
                        let cmd = msg::Command::ShardMerge {
                            config_num: old_config.num,
                            shard,
                            payload: msg::ShardPayload {
                                data: reply.data,
                                last_applied: reply.last_applied,
                            },
                        };
                        let _ = self.kv.replica.start(cmd.serialize());
                        return;
                    }
                }
            }
        }

        fn do_loop(self) -> ThreadHandle {
            let hdl = tokio::spawn(async move {
                let mut interval = tokio::time::interval(PULL_SHARDS_INTERVAL);
                loop {
                    interval.tick().await;
                    if self.kv.is_killed() {
                        break;
                    }
                    self.run_once().await;
                }
            })
            .abort_handle();
            ThreadHandle::new(hdl)
        }
    }

    pub fn new(kv: ShardKv) -> ThreadHandle {
        Thread { kv }.do_loop()
    }
}

/// Ask the previous owner of `shard` to drop its frozen copy. Retried for a
/// bounded window; the cleanup command is idempotent, so lost acks only
/// leave a harmless frozen copy behind.
pub(crate) fn request_cleanup(kv: ShardKv, old_config: Config, shard: usize) {
    let _ = tokio::spawn(async move {
        let source = old_config.owner(shard);
        let args = msg::CleanShardDataArgs {
            config_num: old_config.num,
            shard,
        };
        for _ in 0..3 {
            for server in old_config.servers(source) {
                if kv.is_killed() {
                    return;
                }
                let resp = msg::call::<_, msg::CleanShardDataReply>(
                    &*kv.transport,
                    server,
                    msg::method::CLEAN_SHARD_DATA,
                    &args,
                )
                .await;
                if let Ok(reply) = resp {
                    if reply.success {
                        debug!(
                            "group {} confirmed cleanup of shard {} at group {}",
                            kv.gid, shard, source
                        );
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
}
