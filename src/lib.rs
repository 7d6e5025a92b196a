pub mod auth;
pub mod backend;
pub mod ber;
pub mod config;
pub mod control;
pub mod dn;
pub mod entry;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod result_code;
pub mod retry;
pub mod sasl;
pub mod search;
pub mod session;

#[cfg(test)]
mod mock;

pub use auth::{AuthenticationResponse, PooledBindAuthenticator};
pub use backend::{connect, Ldap3Session, Ldap3SessionFactory};
pub use config::Config;
pub use control::{
    Control, ControlDirection, ControlRegistry, PagedResultsControl, RequestControl,
    ResponseControl, SortKey, SortRequestControl, SortResponseControl,
};
pub use entry::{merge_entries, Attribute, AttributeValue, DirectoryEntry};
pub use error::{LdapError, LdapResult};
pub use executor::{ExecutorConfig, OperationExecutor};
pub use metrics::Metrics;
pub use pool::{ConnectionPool, PoolStats, PooledConnection, SearchValidator, Validator};
pub use request::{
    AddRequest, BindRequest, CompareRequest, DerefAliases, Modification, ModifyRequest,
    Operation, Payload, RenameRequest, Request, Response, SearchRequest, SearchScope,
};
pub use result_code::ResultCode;
pub use retry::{execute_with_retry, RetryPolicy};
pub use search::{IteratorState, SearchIterator};
pub use session::{DirectorySession, SearchCursor, SessionFactory};
