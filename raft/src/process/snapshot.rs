use super::*;

/// On-disk layout of the replica state. The tail excludes the sentinel; the
/// anchor is carried explicitly so both ends agree on the encoding.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    current_term: Term,
    voted_for: Option<NodeId>,
    last_snapshot_index: Index,
    last_snapshot_term: Term,
    tail: Vec<LogEntry>,
}

/// Rebuild the mutable core from durable storage. An empty blob means a
/// fresh node. A corrupt blob is fatal: restarting with guessed state would
/// break the promises made to the rest of the group.
pub(crate) fn restore(persister: &dyn Persister, n_peers: usize) -> RaftCore {
    let raw = persister.read_raft_state();
    let (current_term, voted_for, log) = if raw.is_empty() {
        (0, None, CommandLog::new())
    } else {
        let state: PersistedState =
            bincode::deserialize(&raw).expect("persisted replica state is corrupt");
        (
            state.current_term,
            state.voted_for,
            CommandLog::from_parts(
                state.last_snapshot_index,
                state.last_snapshot_term,
                state.tail,
            ),
        )
    };
    let anchor = log.first_index();
    RaftCore {
        role: Role::Follower,
        current_term,
        voted_for,
        log,
        commit_index: anchor,
        applied_index: anchor,
        next_index: vec![0; n_peers],
        match_index: vec![0; n_peers],
        election_deadline: Instant::now(),
    }
}

impl RaftProcess {
    pub(crate) fn encode_state(&self, core: &RaftCore) -> Bytes {
        let state = PersistedState {
            current_term: core.current_term,
            voted_for: core.voted_for,
            last_snapshot_index: core.log.first_index(),
            last_snapshot_term: core.log.first_term(),
            tail: core.log.tail().to_vec(),
        };
        bincode::serialize(&state).unwrap().into()
    }

    pub(crate) fn persist(&self, core: &RaftCore) {
        self.persister.save_raft_state(self.encode_state(core));
    }

    /// Accept a snapshot of the applied state from the state machine and
    /// compact the log through `index`. State and snapshot hit storage
    /// atomically.
    pub fn save_snapshot(&self, index: Index, snapshot: Bytes) {
        let mut core = self.core.lock().unwrap();
        if index <= core.log.first_index() {
            return;
        }
        assert!(
            index <= core.commit_index,
            "snapshot index {} ahead of commit index {}",
            index,
            core.commit_index
        );
        let term = core
            .log
            .term_at(index)
            .expect("snapshot index is not in the log");
        core.log.compact(index, term);
        self.persister
            .save_state_and_snapshot(self.encode_state(&core), snapshot);
    }
}
