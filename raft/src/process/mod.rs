use super::*;

use anyhow::{ensure, Context, Result};
use derive_more::Deref;
use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

mod api;
pub use api::{request, response};
mod command_log;
use command_log::CommandLog;
mod election;
mod replication;
mod snapshot;
pub mod thread;

/// Role of the replica in the current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// One slot of the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub command: Bytes,
}

/// Message sent to the state machine over the apply channel.
///
/// `valid = false` signals that a snapshot was installed and the state
/// machine must reload itself from the persisted snapshot. `valid = true`
/// messages arrive in strictly increasing index order with no gaps relative
/// to previously applied or snapshotted indices.
#[derive(Clone, Debug)]
pub struct ApplyMsg {
    pub valid: bool,
    pub index: Index,
    pub command: Bytes,
}

#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

/// Mutable replica state. Guarded by the one replica lock and never held
/// across an RPC: callers capture what they need, release, then call out.
pub(crate) struct RaftCore {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: CommandLog,
    commit_index: Index,
    applied_index: Index,
    next_index: Vec<Index>,
    match_index: Vec<Index>,
    election_deadline: Instant,
}

pub struct Inner {
    me: NodeId,
    peers: Vec<String>,
    config: RaftConfig,
    core: Mutex<RaftCore>,
    persister: Arc<dyn Persister>,
    transport: Arc<dyn Transport>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    replication_notify: Vec<Notify>,
    commit_notify: Notify,
    apply_notify: Notify,
    killed: AtomicBool,
    threads: Mutex<Vec<thread::ThreadHandle>>,
}

#[derive(Deref, Clone)]
pub struct RaftProcess(Arc<Inner>);

impl RaftProcess {
    /// Restore the replica from `persister` and start its background tasks.
    /// `peers[me]` is this node's own transport name.
    pub fn new(
        me: NodeId,
        peers: Vec<String>,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn Transport>,
        config: RaftConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ApplyMsg>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let core = snapshot::restore(&*persister, peers.len());
        let replication_notify = (0..peers.len()).map(|_| Notify::new()).collect();

        let inner = Inner {
            me,
            peers,
            config,
            core: Mutex::new(core),
            persister,
            transport,
            apply_tx,
            replication_notify,
            commit_notify: Notify::new(),
            apply_notify: Notify::new(),
            killed: AtomicBool::new(false),
            threads: Mutex::new(vec![]),
        };
        let this = Self(Arc::new(inner));

        {
            let mut core = this.core.lock().unwrap();
            this.reset_election_timer(&mut core);
        }
        this.spawn_threads();
        (this, apply_rx)
    }

    fn spawn_threads(&self) {
        let mut handles = vec![
            thread::election::new(self.clone()),
            thread::advance_commit::new(self.clone()),
            thread::advance_apply::new(self.clone()),
        ];
        for peer in self.other_peers() {
            handles.push(thread::replication::new(self.clone(), peer));
        }
        *self.threads.lock().unwrap() = handles;
    }

    pub(crate) fn other_peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.peers.len() as NodeId).filter(move |p| *p != self.me)
    }

    pub(crate) fn connect(&self, peer: NodeId) -> requester::Connection {
        requester::Connection::new(self.transport.clone(), self.peers[peer as usize].clone())
    }

    pub(crate) fn wake_replicators(&self) {
        for n in &self.replication_notify {
            n.notify_one();
        }
    }

    /// Propose a command. Returns the slot the command will occupy if this
    /// replica is currently the leader, `None` otherwise.
    pub fn start(&self, command: Bytes) -> Option<(Index, Term)> {
        if self.is_killed() {
            return None;
        }
        let mut core = self.core.lock().unwrap();
        if core.role != Role::Leader {
            return None;
        }
        let term = core.current_term;
        let index = core.log.last_index() + 1;
        core.log.push(LogEntry {
            term,
            index,
            command,
        });
        let me = self.me as usize;
        core.match_index[me] = index;
        self.persist(&core);
        drop(core);

        self.wake_replicators();
        self.commit_notify.notify_one();
        Some((index, term))
    }

    pub fn get_state(&self) -> (Term, bool) {
        let core = self.core.lock().unwrap();
        (core.current_term, core.role == Role::Leader)
    }

    pub fn is_leader(&self) -> bool {
        self.get_state().1
    }

    /// Stop every background task. A killed replica answers all RPCs with a
    /// neutral not-leader reply.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.wake_replicators();
        self.commit_notify.notify_one();
        self.apply_notify.notify_one();
        self.threads.lock().unwrap().clear();
        info!("replica {} killed", self.me);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Step down to follower after observing `term` somewhere in the cluster.
    pub(crate) fn step_down(&self, core: &mut RaftCore, term: Term) {
        if term > core.current_term {
            info!(
                "saw newer term {} (own {}). step down",
                term, core.current_term
            );
            core.current_term = term;
            core.voted_for = None;
        }
        core.role = Role::Follower;
        self.reset_election_timer(core);
        self.persist(core);
    }

    /// Feed the next committed entry into the apply channel.
    /// Returns whether an entry was delivered.
    pub(crate) fn advance_apply(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.applied_index >= core.commit_index {
            return false;
        }
        let index = core.applied_index + 1;
        let Some(entry) = core.log.get(index) else {
            error!("entry {} missing below commit index", index);
            return false;
        };
        let msg = ApplyMsg {
            valid: true,
            index,
            command: entry.command.clone(),
        };
        core.applied_index = index;
        let _ = self.apply_tx.send(msg);
        true
    }
}
