use super::*;

enum Payload {
    Entries(request::AppendEntries),
    Snapshot(request::InstallSnapshot),
}

impl RaftProcess {
    /// One round of replication to `peer`: AppendEntries when the needed
    /// entries are still in the log, InstallSnapshot when they were compacted
    /// away. An empty AppendEntries doubles as the heartbeat.
    ///
    /// Returns whether more entries are pending for this peer.
    pub(crate) async fn advance_replication(&self, peer: NodeId) -> Result<bool> {
        let payload = {
            let core = self.core.lock().unwrap();
            ensure!(core.role == Role::Leader, Error::NotLeader);
            let term = core.current_term;
            let next = core.next_index[peer as usize];
            if next <= core.log.first_index() {
                Payload::Snapshot(request::InstallSnapshot {
                    term,
                    leader_id: self.me,
                    last_included_index: core.log.first_index(),
                    last_included_term: core.log.first_term(),
                    data: self.persister.read_snapshot().to_vec(),
                })
            } else {
                let prev = next - 1;
                let prev_term = core.log.term_at(prev).context(Error::EntryNotFound(prev))?;
                Payload::Entries(request::AppendEntries {
                    term,
                    leader_id: self.me,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    entries: core.log.suffix(next),
                    leader_commit: core.commit_index,
                })
            }
        };

        // The lock is released while the RPC is in flight.
        let conn = self.connect(peer);
        let p = peer as usize;
        match payload {
            Payload::Entries(req) => {
                let sent_term = req.term;
                let prev = req.prev_log_index;
                let n = req.entries.len() as u64;
                let resp = conn.append_entries(&req).await?;

                let mut core = self.core.lock().unwrap();
                if core.role != Role::Leader || core.current_term != sent_term {
                    return Ok(false);
                }
                if resp.term > core.current_term {
                    self.step_down(&mut core, resp.term);
                    return Ok(false);
                }
                if resp.success {
                    if prev + n > core.match_index[p] {
                        core.match_index[p] = prev + n;
                        core.next_index[p] = prev + n + 1;
                        self.commit_notify.notify_one();
                    }
                } else {
                    let next = match resp.conflict_term {
                        Some(t) => match core.log.last_index_of_term(t) {
                            Some(i) => i + 1,
                            None => resp.conflict_index,
                        },
                        None => resp.conflict_index,
                    };
                    core.next_index[p] = next.clamp(1, core.log.last_index() + 1);
                }
                Ok(core.log.last_index() >= core.next_index[p])
            }
            Payload::Snapshot(req) => {
                let sent_term = req.term;
                let included = req.last_included_index;
                let resp = conn.install_snapshot(&req).await?;

                let mut core = self.core.lock().unwrap();
                if core.role != Role::Leader || core.current_term != sent_term {
                    return Ok(false);
                }
                if resp.term > core.current_term {
                    self.step_down(&mut core, resp.term);
                    return Ok(false);
                }
                if included > core.match_index[p] {
                    core.match_index[p] = included;
                }
                if included + 1 > core.next_index[p] {
                    core.next_index[p] = included + 1;
                }
                Ok(core.log.last_index() >= core.next_index[p])
            }
        }
    }

    /// Advance the leader's commit index: the highest slot replicated on a
    /// majority whose entry carries the current term. Prior-term entries are
    /// never committed by count alone.
    pub(crate) fn advance_commit_index(&self) {
        let mut core = self.core.lock().unwrap();
        if core.role != Role::Leader {
            return;
        }
        let majority = self.peers.len() / 2 + 1;
        for n in ((core.commit_index + 1)..=core.log.last_index()).rev() {
            if core.log.term_at(n) != Some(core.current_term) {
                break;
            }
            let count = core.match_index.iter().filter(|&&m| m >= n).count();
            if count >= majority {
                debug!("commit -> {n}");
                core.commit_index = n;
                self.apply_notify.notify_one();
                break;
            }
        }
    }

    /// AppendEntries handler.
    pub(crate) fn receive_append_entries(
        &self,
        req: request::AppendEntries,
    ) -> response::AppendEntries {
        let mut core = self.core.lock().unwrap();
        if self.is_killed() || req.term < core.current_term {
            return response::AppendEntries {
                term: core.current_term,
                success: false,
                conflict_index: 0,
                conflict_term: None,
            };
        }
        let mut changed = false;
        if req.term > core.current_term {
            core.current_term = req.term;
            core.voted_for = None;
            changed = true;
        }
        core.role = Role::Follower;
        self.reset_election_timer(&mut core);

        let first = core.log.first_index();
        let last = core.log.last_index();
        let resp = if req.prev_log_index < first {
            // Our snapshot already covers the leader's prefix.
            response::AppendEntries {
                term: core.current_term,
                success: false,
                conflict_index: first + 1,
                conflict_term: None,
            }
        } else if req.prev_log_index > last {
            response::AppendEntries {
                term: core.current_term,
                success: false,
                conflict_index: last + 1,
                conflict_term: None,
            }
        } else if core.log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            let t = core.log.term_at(req.prev_log_index).unwrap();
            response::AppendEntries {
                term: core.current_term,
                success: false,
                conflict_index: core.log.first_index_of_term(t).unwrap_or(first + 1),
                conflict_term: Some(t),
            }
        } else {
            // Truncate any divergent suffix and append the remainder.
            for (i, e) in req.entries.iter().enumerate() {
                if core.log.term_at(e.index) == Some(e.term) {
                    continue;
                }
                core.log.truncate_from(e.index);
                for e in &req.entries[i..] {
                    core.log.push(e.clone());
                }
                changed = true;
                break;
            }
            let last_new = req.prev_log_index + req.entries.len() as u64;
            if req.leader_commit > core.commit_index {
                core.commit_index = req.leader_commit.min(last_new);
                self.apply_notify.notify_one();
            }
            response::AppendEntries {
                term: core.current_term,
                success: true,
                conflict_index: 0,
                conflict_term: None,
            }
        };
        if changed {
            self.persist(&core);
        }
        resp
    }

    /// InstallSnapshot handler.
    pub(crate) fn receive_install_snapshot(
        &self,
        req: request::InstallSnapshot,
    ) -> response::InstallSnapshot {
        let mut core = self.core.lock().unwrap();
        if self.is_killed() || req.term < core.current_term {
            return response::InstallSnapshot {
                term: core.current_term,
            };
        }
        let mut changed = false;
        if req.term > core.current_term {
            core.current_term = req.term;
            core.voted_for = None;
            changed = true;
        }
        core.role = Role::Follower;
        self.reset_election_timer(&mut core);

        // Ignore a snapshot that would rewind us. The leader still learns
        // our position and falls back to AppendEntries from there.
        if core.log.first_index() >= req.last_included_index
            || core.applied_index >= req.last_included_index
        {
            if changed {
                self.persist(&core);
            }
            return response::InstallSnapshot {
                term: core.current_term,
            };
        }

        warn!(
            "log is behind the leader's snapshot. installing through index {}",
            req.last_included_index
        );
        core.log
            .compact(req.last_included_index, req.last_included_term);
        core.commit_index = core.commit_index.max(req.last_included_index);
        core.applied_index = core.applied_index.max(req.last_included_index);
        self.persister
            .save_state_and_snapshot(self.encode_state(&core), req.data.into());

        // Tell the state machine to reload from the snapshot. Sent under the
        // lock so it is ordered against the apply pump.
        let _ = self.apply_tx.send(ApplyMsg {
            valid: false,
            index: req.last_included_index,
            command: Bytes::new(),
        });
        self.apply_notify.notify_one();

        response::InstallSnapshot {
            term: core.current_term,
        }
    }
}
