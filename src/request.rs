//! Typed operation requests and the normalized response.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::{PagedResultsControl, RequestControl, ResponseControl};
use crate::entry::{AttributeValue, DirectoryEntry};
use crate::result_code::ResultCode;
use crate::sasl::SaslConfig;

/// Attribute list that asks the server for no attributes at all.
pub const NO_ATTRIBUTES: &str = "1.1";
/// Attribute list entry asking for every user attribute.
pub const ALL_USER_ATTRIBUTES: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    Base,
    OneLevel,
    #[default]
    Subtree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefAliases {
    #[default]
    Never,
    Searching,
    Finding,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindRequest {
    Anonymous,
    Simple {
        dn: String,
        password: String,
    },
    Sasl {
        authentication_id: String,
        credentials: Option<Vec<u8>>,
        config: SaslConfig,
    },
}

impl BindRequest {
    pub fn simple(dn: impl Into<String>, password: impl Into<String>) -> Self {
        BindRequest::Simple {
            dn: dn.into(),
            password: password.into(),
        }
    }

    pub fn sasl(
        authentication_id: impl Into<String>,
        credentials: Option<Vec<u8>>,
        config: SaslConfig,
    ) -> Self {
        BindRequest::Sasl {
            authentication_id: authentication_id.into(),
            credentials,
            config,
        }
    }

    pub(crate) fn target(&self) -> &str {
        match self {
            BindRequest::Anonymous => "",
            BindRequest::Simple { dn, .. } => dn,
            BindRequest::Sasl {
                authentication_id, ..
            } => authentication_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<(String, Vec<AttributeValue>)>,
}

impl AddRequest {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: &str, values: Vec<AttributeValue>) -> Self {
        self.attributes.push((name.to_string(), values));
        self
    }
}

impl From<DirectoryEntry> for AddRequest {
    fn from(entry: DirectoryEntry) -> Self {
        Self {
            dn: entry.dn().to_string(),
            attributes: entry
                .attributes()
                .iter()
                .map(|a| (a.name().to_string(), a.values().to_vec()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: AttributeValue,
}

impl CompareRequest {
    pub fn new(
        dn: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        Self {
            dn: dn.into(),
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub op: ModOp,
    pub attribute: String,
    pub values: Vec<AttributeValue>,
}

impl Modification {
    pub fn add(attribute: &str, values: Vec<AttributeValue>) -> Self {
        Self {
            op: ModOp::Add,
            attribute: attribute.to_string(),
            values,
        }
    }

    /// Deletes the listed values, or the whole attribute when `values` is empty.
    pub fn delete(attribute: &str, values: Vec<AttributeValue>) -> Self {
        Self {
            op: ModOp::Delete,
            attribute: attribute.to_string(),
            values,
        }
    }

    pub fn replace(attribute: &str, values: Vec<AttributeValue>) -> Self {
        Self {
            op: ModOp::Replace,
            attribute: attribute.to_string(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub modifications: Vec<Modification>,
}

/// Moves `dn` to `new_dn`. The old RDN value is always removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest {
    pub dn: String,
    pub new_dn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub filter: String,
    /// Empty asks for no attributes.
    pub attributes: Vec<String>,
    /// Attributes whose values are always returned as binary.
    pub binary_attributes: Vec<String>,
    pub deref_aliases: DerefAliases,
    /// 0 for no limit.
    pub size_limit: i32,
    /// Zero for no limit.
    pub time_limit: Duration,
    pub types_only: bool,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: SearchScope::default(),
            filter: filter.into(),
            attributes: vec![ALL_USER_ATTRIBUTES.to_string()],
            binary_attributes: Vec::new(),
            deref_aliases: DerefAliases::default(),
            size_limit: 0,
            time_limit: Duration::ZERO,
            types_only: false,
        }
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn binary_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.binary_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn size_limit(mut self, limit: i32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Attribute list as sent to the server.
    pub fn wire_attributes(&self) -> Vec<String> {
        if self.attributes.is_empty() {
            vec![NO_ATTRIBUTES.to_string()]
        } else {
            self.attributes.clone()
        }
    }
}

/// Operation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Bind(BindRequest),
    Add(AddRequest),
    Compare(CompareRequest),
    Delete { dn: String },
    Modify(ModifyRequest),
    Rename(RenameRequest),
    Search(SearchRequest),
    /// Search issued page by page with the paged results control.
    PagedSearch { search: SearchRequest, page_size: i32 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Bind(_) => "bind",
            Operation::Add(_) => "add",
            Operation::Compare(_) => "compare",
            Operation::Delete { .. } => "delete",
            Operation::Modify(_) => "modify",
            Operation::Rename(_) => "modify_dn",
            Operation::Search(_) | Operation::PagedSearch { .. } => "search",
        }
    }

    pub fn dn(&self) -> &str {
        match self {
            Operation::Bind(bind) => bind.target(),
            Operation::Add(r) => &r.dn,
            Operation::Compare(r) => &r.dn,
            Operation::Delete { dn } => dn,
            Operation::Modify(r) => &r.dn,
            Operation::Rename(r) => &r.dn,
            Operation::Search(s) | Operation::PagedSearch { search: s, .. } => &s.base_dn,
        }
    }
}

/// A submitted operation with its ordered request controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    pub controls: Vec<RequestControl>,
}

impl Request {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            controls: Vec::new(),
        }
    }

    pub fn with_control(mut self, control: RequestControl) -> Self {
        self.controls.push(control);
        self
    }

    pub fn bind(bind: BindRequest) -> Self {
        Self::new(Operation::Bind(bind))
    }

    pub fn add(add: AddRequest) -> Self {
        Self::new(Operation::Add(add))
    }

    pub fn compare(compare: CompareRequest) -> Self {
        Self::new(Operation::Compare(compare))
    }

    pub fn delete(dn: impl Into<String>) -> Self {
        Self::new(Operation::Delete { dn: dn.into() })
    }

    pub fn modify(dn: impl Into<String>, modifications: Vec<Modification>) -> Self {
        Self::new(Operation::Modify(ModifyRequest {
            dn: dn.into(),
            modifications,
        }))
    }

    pub fn rename(dn: impl Into<String>, new_dn: impl Into<String>) -> Self {
        Self::new(Operation::Rename(RenameRequest {
            dn: dn.into(),
            new_dn: new_dn.into(),
        }))
    }

    pub fn search(search: SearchRequest) -> Self {
        Self::new(Operation::Search(search))
    }

    pub fn paged_search(search: SearchRequest, page_size: i32) -> Self {
        Self::new(Operation::PagedSearch { search, page_size })
    }

    /// Controls for the first round trip. A paged search gets its paged
    /// results control appended unless the caller supplied one.
    pub(crate) fn initial_controls(&self) -> Vec<RequestControl> {
        match &self.operation {
            Operation::PagedSearch { page_size, .. } => with_paging(self.controls.clone(), *page_size),
            _ => self.controls.clone(),
        }
    }
}

/// Appends a first-page paged results control unless one is present.
pub(crate) fn with_paging(mut controls: Vec<RequestControl>, page_size: i32) -> Vec<RequestControl> {
    let has_paging = controls
        .iter()
        .any(|c| matches!(c, RequestControl::PagedResults(_)));
    if !has_paging {
        controls.push(RequestControl::PagedResults(PagedResultsControl::new(page_size)));
    }
    controls
}

/// Payload of a generically executed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Unit,
    Bool(bool),
    Entries(Vec<DirectoryEntry>),
}

/// Normalized outcome of one logical round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
    pub result: T,
    pub code: ResultCode,
    pub controls: Vec<ResponseControl>,
    pub matched_dn: String,
    pub message: String,
}

impl<T> Response<T> {
    pub fn new(result: T, code: ResultCode) -> Self {
        Self {
            result,
            code,
            controls: Vec::new(),
            matched_dn: String::new(),
            message: String::new(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            result: f(self.result),
            code: self.code,
            controls: self.controls,
            matched_dn: self.matched_dn,
            message: self.message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}
