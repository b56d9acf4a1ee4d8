use super::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not the leader")]
    NotLeader,
    #[error("entry not found at index {0}")]
    EntryNotFound(Index),
    #[error("replica is killed")]
    Killed,
    #[error("unknown rpc method {0}")]
    UnknownMethod(String),
}
