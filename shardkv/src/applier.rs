use super::*;

use crate::msg::{Command, OpKind, ShardPayload};
use crate::server::ShardKv;
use log::*;
use shoal_raft::{ApplyMsg, Index, Persister, ThreadHandle};
use tokio::sync::mpsc;

/// Outcome handed to a gateway request waiting on its notify slot.
#[derive(Clone, Debug)]
pub struct NotifyMsg {
    pub status: Status,
    pub value: String,
}

impl NotifyMsg {
    pub(crate) fn status(status: Status) -> Self {
        Self {
            status,
            value: String::new(),
        }
    }
}

/// The replicated, shard-partitioned state machine. Mutated only by the
/// applier consuming committed log entries, so every replica of the group
/// walks through the same sequence of states.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct KvState {
    pub data: [HashMap<String, String>; N_SHARDS],
    pub last_applied: [HashMap<u64, u64>; N_SHARDS],
    pub config: Config,
    pub old_config: Config,
    pub own_shards: HashSet<usize>,
    pub wait_shards: HashSet<usize>,
    /// configNum -> shard -> frozen copy, kept to serve shard pulls from the
    /// new owner until it acknowledges cleanup.
    pub history_shards: HashMap<u64, HashMap<usize, ShardPayload>>,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a persisted snapshot; an empty blob is a fresh node.
    /// A corrupt blob is fatal: the replicas would diverge otherwise.
    pub fn from_snapshot(raw: &[u8]) -> Self {
        if raw.is_empty() {
            Self::new()
        } else {
            bincode::deserialize(raw).expect("state machine snapshot is corrupt")
        }
    }

    pub fn encode(&self) -> Bytes {
        bincode::serialize(self).unwrap().into()
    }

    /// A shard is serviceable iff the request was issued under the exact
    /// configuration we are at, we own the shard, and it is not still in
    /// flight from its previous owner.
    fn serviceable(&self, config_num: u64, shard: usize) -> bool {
        config_num != 0
            && config_num == self.config.num
            && self.own_shards.contains(&shard)
            && !self.wait_shards.contains(&shard)
    }

    pub fn history(&self, config_num: u64, shard: usize) -> Option<&ShardPayload> {
        self.history_shards.get(&config_num)?.get(&shard)
    }

    pub fn apply_client_op(
        &mut self,
        client_id: u64,
        msg_id: u64,
        config_num: u64,
        op: OpKind,
        key: &str,
        value: String,
    ) -> NotifyMsg {
        let shard = shard_of(key);
        if !self.serviceable(config_num, shard) {
            return NotifyMsg::status(Status::WrongGroup);
        }
        // A retried request replays the committed command; the mutation runs
        // at most once, the waiter is answered either way.
        let repeated = self.last_applied[shard].get(&client_id) == Some(&msg_id);
        match op {
            OpKind::Put if !repeated => {
                self.data[shard].insert(key.to_owned(), value);
                self.last_applied[shard].insert(client_id, msg_id);
            }
            OpKind::Append if !repeated => {
                self.data[shard].entry(key.to_owned()).or_default().push_str(&value);
                self.last_applied[shard].insert(client_id, msg_id);
            }
            _ => {}
        }
        match op {
            OpKind::Get => match self.data[shard].get(key) {
                Some(v) => NotifyMsg {
                    status: Status::Ok,
                    value: v.clone(),
                },
                None => NotifyMsg::status(Status::NoKey),
            },
            _ => NotifyMsg::status(Status::Ok),
        }
    }

    /// Move to the next configuration: freeze every shard we lose, record
    /// the ones we gain as waiting. Configurations apply strictly one at a
    /// time; a gap means the puller is broken and the state is not to be
    /// trusted.
    pub fn apply_config_change(&mut self, me: Gid, next: Config) {
        if next.num <= self.config.num {
            return;
        }
        assert_eq!(
            next.num,
            self.config.num + 1,
            "configuration {} arrived while at {}",
            next.num,
            self.config.num
        );

        let old = self.config.clone();
        let mut frozen = HashMap::new();
        for shard in 0..N_SHARDS {
            if old.owner(shard) == me && next.owner(shard) != me {
                frozen.insert(
                    shard,
                    ShardPayload {
                        data: std::mem::take(&mut self.data[shard]),
                        last_applied: std::mem::take(&mut self.last_applied[shard]),
                    },
                );
            }
        }
        if !frozen.is_empty() {
            self.history_shards.insert(old.num, frozen);
        }

        self.own_shards = (0..N_SHARDS).filter(|&s| next.owner(s) == me).collect();
        // Initial shards are born empty; nothing to pull under config 1.
        self.wait_shards = if old.num == 0 {
            HashSet::new()
        } else {
            self.own_shards
                .iter()
                .copied()
                .filter(|&s| old.owner(s) != me)
                .collect()
        };
        self.old_config = old;
        self.config = next;
    }

    /// Install a pulled shard. Anything not matching the one migration in
    /// flight is stale or redundant and dropped silently.
    pub fn apply_shard_merge(&mut self, config_num: u64, shard: usize, payload: ShardPayload) -> bool {
        if self.config.num != config_num + 1 || !self.wait_shards.contains(&shard) {
            return false;
        }
        self.data[shard] = payload.data;
        self.last_applied[shard] = payload.last_applied;
        self.wait_shards.remove(&shard);
        true
    }

    /// Deleting an absent entry is a no-op, so retried cleanups are safe.
    pub fn apply_shard_cleanup(&mut self, config_num: u64, shard: usize) {
        if let Some(h) = self.history_shards.get_mut(&config_num) {
            h.remove(&shard);
            if h.is_empty() {
                self.history_shards.remove(&config_num);
            }
        }
    }
}

/// Drain the apply channel serially, in commit order.
pub(crate) fn new(kv: ShardKv, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) -> ThreadHandle {
    let hdl = tokio::spawn(async move {
        while let Some(msg) = apply_rx.recv().await {
            if kv.is_killed() {
                break;
            }
            if !msg.valid {
                kv.reload_snapshot();
                continue;
            }
            kv.apply(msg.index, Command::deserialize(&msg.command));
        }
    })
    .abort_handle();
    ThreadHandle::new(hdl)
}

impl ShardKv {
    fn reload_snapshot(&self) {
        let raw = self.persister.read_snapshot();
        let mut state = self.state.lock().unwrap();
        *state = KvState::from_snapshot(&raw);
        info!("group {} peer {} reloaded from snapshot", self.gid, self.me);
    }

    fn apply(&self, index: Index, cmd: Command) {
        match cmd {
            Command::ClientOp {
                client_id,
                msg_id,
                req_id,
                config_num,
                op,
                key,
                value,
            } => {
                let mut state = self.state.lock().unwrap();
                let res = state.apply_client_op(client_id, msg_id, config_num, op, &key, value);
                if res.status != Status::WrongGroup {
                    self.maybe_snapshot(index, &state);
                }
                drop(state);
                self.notify_waiter(req_id, res);
            }
            Command::ConfigChange(next) => {
                let mut state = self.state.lock().unwrap();
                state.apply_config_change(self.gid, next);
                self.maybe_snapshot(index, &state);
            }
            Command::ShardMerge {
                config_num,
                shard,
                payload,
            } => {
                let mut state = self.state.lock().unwrap();
                let installed = state.apply_shard_merge(config_num, shard, payload);
                let source = if installed {
                    info!("group {} now serves shard {}", self.gid, shard);
                    Some(state.old_config.clone())
                } else {
                    None
                };
                self.maybe_snapshot(index, &state);
                drop(state);
                if let Some(old) = source {
                    // The previous owner keeps its frozen copy until we ask
                    // it to clean up.
                    crate::migrator::request_cleanup(self.clone(), old, shard);
                }
            }
            Command::ShardCleanup { config_num, shard } => {
                let mut state = self.state.lock().unwrap();
                state.apply_shard_cleanup(config_num, shard);
                self.maybe_snapshot(index, &state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num: u64, owners: [Gid; N_SHARDS]) -> Config {
        let mut groups = HashMap::new();
        for gid in owners {
            if gid != 0 {
                groups
                    .entry(gid)
                    .or_insert_with(|| vec![format!("g{gid}-0")]);
            }
        }
        Config {
            num,
            shards: owners,
            groups,
        }
    }

    /// Shards 0..4 -> G1, 5..9 -> G2.
    fn split_config(num: u64) -> Config {
        config(num, [1, 1, 1, 1, 1, 2, 2, 2, 2, 2])
    }

    #[test]
    fn initial_config_owns_without_waiting() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(1));
        assert_eq!(st.own_shards, (0..5).collect());
        assert!(st.wait_shards.is_empty());
        assert!(st.history_shards.is_empty());
    }

    #[test]
    fn put_get_and_dedup() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(1));

        let res = st.apply_client_op(7, 42, 1, OpKind::Append, "d", "x".into());
        assert_eq!(res.status, Status::Ok);
        // the committed retry of the same request must not mutate again
        let res = st.apply_client_op(7, 42, 1, OpKind::Append, "d", "x".into());
        assert_eq!(res.status, Status::Ok);
        let res = st.apply_client_op(7, 43, 1, OpKind::Get, "d", String::new());
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.value, "x");
    }

    #[test]
    fn stale_or_foreign_config_num_is_wrong_group() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(1));
        assert_eq!(
            st.apply_client_op(7, 1, 0, OpKind::Put, "d", "v".into()).status,
            Status::WrongGroup
        );
        assert_eq!(
            st.apply_client_op(7, 2, 2, OpKind::Put, "d", "v".into()).status,
            Status::WrongGroup
        );
        // 'i' maps to shard 5, which belongs to the other group
        assert_eq!(
            st.apply_client_op(7, 3, 1, OpKind::Put, "i", "v".into()).status,
            Status::WrongGroup
        );
    }

    #[test]
    fn losing_a_shard_freezes_it() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(1));
        let _ = st.apply_client_op(7, 1, 1, OpKind::Put, "d", "v".into());
        let shard = shard_of("d");

        // shard 3 moves to G2
        let mut owners = [1, 1, 1, 1, 1, 2, 2, 2, 2, 2];
        owners[shard] = 2;
        st.apply_config_change(1, config(2, owners));

        assert!(!st.own_shards.contains(&shard));
        assert!(st.data[shard].is_empty());
        let frozen = st.history(1, shard).unwrap();
        assert_eq!(frozen.data.get("d").unwrap(), "v");
        assert_eq!(frozen.last_applied.get(&7), Some(&1));
        // requests for the moved shard are refused at the old config number
        assert_eq!(
            st.apply_client_op(7, 2, 1, OpKind::Put, "d", "w".into()).status,
            Status::WrongGroup
        );
    }

    #[test]
    fn gaining_a_shard_waits_for_the_pull() {
        let mut st = KvState::new();
        st.apply_config_change(2, split_config(1));
        let shard = shard_of("d");
        let mut owners = [1, 1, 1, 1, 1, 2, 2, 2, 2, 2];
        owners[shard] = 2;
        st.apply_config_change(2, config(2, owners));

        assert!(st.wait_shards.contains(&shard));
        // not serviceable until the merge lands
        assert_eq!(
            st.apply_client_op(7, 1, 2, OpKind::Get, "d", String::new()).status,
            Status::WrongGroup
        );

        let payload = ShardPayload {
            data: [("d".to_string(), "v".to_string())].into(),
            last_applied: [(7u64, 9u64)].into(),
        };
        // a merge for the wrong epoch is dropped
        assert!(!st.apply_shard_merge(9, shard, payload.clone()));
        assert!(st.apply_shard_merge(1, shard, payload.clone()));
        // redundant merge after install is dropped too
        assert!(!st.apply_shard_merge(1, shard, payload));

        assert!(st.wait_shards.is_empty());
        let res = st.apply_client_op(7, 2, 2, OpKind::Get, "d", String::new());
        assert_eq!(res.value, "v");
        // the dedup evidence migrated with the shard
        let res = st.apply_client_op(7, 9, 2, OpKind::Append, "d", "!".into());
        assert_eq!(res.status, Status::Ok);
        assert_eq!(st.data[shard].get("d").unwrap(), "v");
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(1));
        let _ = st.apply_client_op(7, 1, 1, OpKind::Put, "d", "v".into());
        let shard = shard_of("d");
        let mut owners = [1, 1, 1, 1, 1, 2, 2, 2, 2, 2];
        owners[shard] = 2;
        st.apply_config_change(1, config(2, owners));
        assert!(st.history(1, shard).is_some());

        st.apply_shard_cleanup(1, shard);
        let once = st.clone();
        st.apply_shard_cleanup(1, shard);
        assert_eq!(st, once);
        assert!(st.history(1, shard).is_none());
    }

    #[test]
    #[should_panic]
    fn skipping_a_configuration_is_fatal() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(2));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut st = KvState::new();
        st.apply_config_change(1, split_config(1));
        let _ = st.apply_client_op(7, 1, 1, OpKind::Put, "d", "1".into());
        let _ = st.apply_client_op(8, 2, 1, OpKind::Append, "e", "2".into());
        let decoded = KvState::from_snapshot(&st.encode());
        assert_eq!(st, decoded);
    }
}
