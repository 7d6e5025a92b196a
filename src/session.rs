//! Backend session capability.
//!
//! A [`DirectorySession`] is one connected, stateful conversation with a
//! directory server. Implementations own the transport and translate their
//! native faults into a [`BackendError`] carrying a normalized
//! [`ResultCode`]. Server status codes are reported in [`RawResult`] and are
//! classified by the executor, not here.
//!
//! A session runs one operation at a time; every primitive takes `&mut self`.

use async_trait::async_trait;
use thiserror::Error;

use crate::control::Control;
use crate::entry::AttributeValue;
use crate::error::LdapResult;
use crate::request::{Modification, SearchRequest};
use crate::result_code::ResultCode;
use crate::sasl::SaslRequest;

/// Protocol version used for every simple bind.
pub const PROTOCOL_VERSION: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBind {
    Anonymous,
    Simple {
        dn: String,
        password: String,
        version: u8,
    },
    Sasl(SaslRequest),
}

/// Final status of one backend round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawResult {
    /// Numeric status as sent by the server.
    pub code: u32,
    pub matched_dn: String,
    pub message: String,
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
}

impl RawResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_code(code: ResultCode) -> Self {
        Self {
            code: code.code(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<Vec<u8>>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSearchItem {
    Entry(RawEntry),
    /// Search result reference URLs.
    Referral(Vec<String>),
    /// Search done; no more items follow.
    Done(RawResult),
}

/// Transport or client side failure, already mapped to a result code.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ResultCode,
    pub message: String,
    pub controls: Vec<Control>,
}

impl BackendError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            controls: Vec::new(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Pull-based stream of one search round trip.
#[async_trait]
pub trait SearchCursor: Send {
    /// Next entry or reference, then exactly one `Done`.
    async fn next_item(&mut self) -> BackendResult<RawSearchItem>;

    /// Asks the server to stop a search that has not reached `Done`. The
    /// session stays usable afterwards.
    async fn abandon(&mut self) -> BackendResult<()>;
}

#[async_trait]
pub trait DirectorySession: Send {
    async fn bind(&mut self, bind: &SessionBind, controls: &[Control]) -> BackendResult<RawResult>;

    async fn add(
        &mut self,
        dn: &str,
        attributes: &[(String, Vec<AttributeValue>)],
        controls: &[Control],
    ) -> BackendResult<RawResult>;

    async fn compare(
        &mut self,
        dn: &str,
        attribute: &str,
        value: &AttributeValue,
        controls: &[Control],
    ) -> BackendResult<RawResult>;

    async fn delete(&mut self, dn: &str, controls: &[Control]) -> BackendResult<RawResult>;

    async fn modify(
        &mut self,
        dn: &str,
        modifications: &[Modification],
        controls: &[Control],
    ) -> BackendResult<RawResult>;

    async fn modify_dn(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
        controls: &[Control],
    ) -> BackendResult<RawResult>;

    async fn search(
        &mut self,
        request: &SearchRequest,
        controls: &[Control],
    ) -> BackendResult<Box<dyn SearchCursor>>;

    async fn close(&mut self) -> BackendResult<()>;
}

/// Creates connected sessions for the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> LdapResult<Box<dyn DirectorySession>>;
}
