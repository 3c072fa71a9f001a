use foxy_protocol::ErrorCode;
use foxy_protocol::service::ServiceParseError;
use foxy_protocol::tcp::TcpParseError;
use thiserror::Error;

use crate::upstream::UpstreamError;

#[derive(Error, Debug)]
pub enum FoxyError {
    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    #[error("name matches more than one token: {0}")]
    VagueName(String),

    #[error("worker for {0} stopped before acknowledging work")]
    WorkerLost(String),

    #[error("no result from worker for {0} in time")]
    Timeout(String),

    #[error("alternate results are only delivered to a waiting caller")]
    NoWaiter,

    #[error("malformed tcp request: {0}")]
    TcpRequest(#[from] TcpParseError),

    #[error("malformed service request: {0}")]
    ServiceRequest(#[from] ServiceParseError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FoxyError {
    /// Convert to the code reported to clients.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            FoxyError::ReaderNotFound(_) => ErrorCode::ReaderNotFound,
            FoxyError::VagueName(_) => ErrorCode::VagueName,
            FoxyError::TcpRequest(_) | FoxyError::ServiceRequest(_) => ErrorCode::WrongData,
            FoxyError::WorkerLost(_)
            | FoxyError::Timeout(_)
            | FoxyError::NoWaiter
            | FoxyError::Upstream(_)
            | FoxyError::Certificate(_)
            | FoxyError::Io(_) => ErrorCode::InternalError,
        }
    }
}
