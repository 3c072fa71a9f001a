pub mod codec;
pub mod csp;
pub mod dispatcher;
pub mod error;
pub mod http_upstream;
pub mod inventory;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod monitor;
pub mod storage;
pub mod upstream;
pub mod work;
pub mod worker;

pub use csp::{CspConfig, IcaService, PostSignumService, Provider, TokenService, token_service};
pub use dispatcher::{Accepted, Dispatcher, Rejected};
pub use error::FoxyError;
pub use inventory::CardLayout;
pub use http_upstream::HttpUpstream;
pub use storage::{Inventory, TokenState};
pub use upstream::{UpstreamError, UpstreamProvider, UpstreamSession};
pub use work::{Origin, ResultKind, Routing, WorkItem, WorkKind, WorkResult};
pub use worker::PoolConfig;
