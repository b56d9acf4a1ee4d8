use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown rpc method {0}")]
    UnknownMethod(String),
}
