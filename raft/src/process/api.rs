use super::*;

pub mod request {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct RequestVote {
        pub term: Term,
        pub candidate_id: NodeId,
        pub last_log_index: Index,
        pub last_log_term: Term,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AppendEntries {
        pub term: Term,
        pub leader_id: NodeId,
        pub prev_log_index: Index,
        pub prev_log_term: Term,
        pub entries: Vec<LogEntry>,
        pub leader_commit: Index,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct InstallSnapshot {
        pub term: Term,
        pub leader_id: NodeId,
        pub last_included_index: Index,
        pub last_included_term: Term,
        #[serde(with = "serde_bytes")]
        pub data: Vec<u8>,
    }
}

pub mod response {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct RequestVote {
        pub term: Term,
        pub vote_granted: bool,
    }

    /// On rejection the conflict hint lets the leader back `next_index` up by
    /// a full term per round instead of by one entry.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AppendEntries {
        pub term: Term,
        pub success: bool,
        pub conflict_index: Index,
        pub conflict_term: Option<Term>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct InstallSnapshot {
        pub term: Term,
    }
}
