use super::*;

use futures::stream::{FuturesUnordered, StreamExt};

impl RaftProcess {
    pub(crate) fn reset_election_timer(&self, core: &mut RaftCore) {
        // Timeouts are randomized so concurrent candidacies are unlikely.
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let timeout = rand::thread_rng().gen_range(min..=max);
        core.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    /// Vote request handler.
    pub(crate) fn receive_vote_request(&self, req: request::RequestVote) -> response::RequestVote {
        let mut core = self.core.lock().unwrap();
        if self.is_killed() || req.term < core.current_term {
            return response::RequestVote {
                term: core.current_term,
                vote_granted: false,
            };
        }
        let mut changed = false;
        if req.term > core.current_term {
            core.current_term = req.term;
            core.voted_for = None;
            core.role = Role::Follower;
            changed = true;
        }

        // Election restriction: only candidates whose log is at least as
        // up-to-date as ours can get this vote.
        let up_to_date = req.last_log_term > core.log.last_term()
            || (req.last_log_term == core.log.last_term()
                && req.last_log_index >= core.log.last_index());

        // Only one vote is granted per term. This is why the ballot must be
        // persistent.
        let free_to_vote = match core.voted_for {
            None => true,
            Some(id) => id == req.candidate_id,
        };

        let grant = up_to_date && free_to_vote;
        if grant {
            info!(
                "grant vote to {} at term {}",
                req.candidate_id, core.current_term
            );
            core.voted_for = Some(req.candidate_id);
            core.role = Role::Follower;
            self.reset_election_timer(&mut core);
            changed = true;
        } else {
            debug!(
                "reject vote for {} at term {}",
                req.candidate_id, core.current_term
            );
        }
        if changed {
            self.persist(&core);
        }
        response::RequestVote {
            term: core.current_term,
            vote_granted: grant,
        }
    }

    /// One candidacy round: bump the term, vote for ourselves and ask every
    /// peer. A strict majority promotes us to leader.
    pub(crate) async fn run_election(&self) {
        let (vote_term, last_log_index, last_log_term) = {
            let mut core = self.core.lock().unwrap();
            if core.role == Role::Leader {
                return;
            }
            core.role = Role::Candidate;
            core.current_term += 1;
            core.voted_for = Some(self.me);
            self.reset_election_timer(&mut core);
            self.persist(&core);
            info!("start election at term {}", core.current_term);
            (
                core.current_term,
                core.log.last_index(),
                core.log.last_term(),
            )
        };

        let me = self.me;
        let mut requests = FuturesUnordered::new();
        for peer in self.other_peers() {
            let conn = self.connect(peer);
            requests.push(async move {
                let req = request::RequestVote {
                    term: vote_term,
                    candidate_id: me,
                    last_log_index,
                    last_log_term,
                };
                conn.request_vote(&req).await
            });
        }

        let majority = self.peers.len() / 2 + 1;
        let mut granted = 1;
        while let Some(resp) = requests.next().await {
            let Ok(resp) = resp else { continue };
            if resp.term > vote_term {
                let mut core = self.core.lock().unwrap();
                if resp.term > core.current_term {
                    self.step_down(&mut core, resp.term);
                }
                return;
            }
            if resp.vote_granted {
                granted += 1;
            }
            if granted >= majority {
                break;
            }
        }
        if granted < majority {
            debug!(
                "election at term {} failed ({granted}/{} votes)",
                vote_term,
                self.peers.len()
            );
            return;
        }

        let mut core = self.core.lock().unwrap();
        // The world may have moved on while votes were in flight.
        if core.role != Role::Candidate || core.current_term != vote_term {
            return;
        }
        core.role = Role::Leader;
        let last = core.log.last_index();
        for p in 0..self.peers.len() {
            core.next_index[p] = last + 1;
            core.match_index[p] = 0;
        }
        core.match_index[self.me as usize] = last;
        info!("promoted to leader at term {vote_term}");
        drop(core);

        // Announce leadership right away.
        self.wake_replicators();
    }
}
