//! In-memory directory backing the unit tests.
//!
//! `MockDirectory` is shared state (entries, passwords, scripted failures);
//! every `MockSession` opened on it records the primitives it was asked to run.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::control::{
    Control, ControlRegistry, PagedResultsControl, ResponseControl, PAGED_RESULTS_OID,
};
use crate::dn;
use crate::entry::{AttributeValue, DirectoryEntry};
use crate::error::{LdapError, LdapResult};
use crate::request::{ModOp, Modification, SearchRequest, SearchScope, NO_ATTRIBUTES};
use crate::result_code::ResultCode;
use crate::session::{
    BackendError, BackendResult, DirectorySession, RawEntry, RawResult, RawSearchItem,
    SearchCursor, SessionBind, SessionFactory,
};

#[derive(Default)]
struct DirectoryState {
    entries: Vec<DirectoryEntry>,
    /// Lowercased DN to password.
    passwords: HashMap<String, String>,
    scripted: VecDeque<RawResult>,
    search_controls: Vec<Control>,
    search_end: Option<(usize, BackendResult<RawResult>)>,
    referrals: Vec<String>,
    down: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockDirectory {
    state: Arc<Mutex<DirectoryState>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    abandoned: Arc<AtomicUsize>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, entry: DirectoryEntry) {
        let mut state = self.lock();
        match position(&state.entries, entry.dn()) {
            Some(pos) => state.entries[pos] = entry,
            None => state.entries.push(entry),
        }
    }

    pub fn get(&self, dn: &str) -> Option<DirectoryEntry> {
        let state = self.lock();
        position(&state.entries, dn).map(|pos| state.entries[pos].clone())
    }

    pub fn set_password(&self, dn: &str, password: &str) {
        self.lock()
            .passwords
            .insert(dn.to_ascii_lowercase(), password.to_string());
    }

    /// The next primitive answers `code` without touching the entries.
    pub fn fail_next(&self, code: ResultCode) {
        self.respond_next(RawResult::with_code(code));
    }

    pub fn respond_next(&self, raw: RawResult) {
        self.lock().scripted.push_back(raw);
    }

    /// Controls added to the final result of every search.
    pub fn attach_search_controls(&self, controls: Vec<Control>) {
        self.lock().search_controls = controls;
    }

    /// The next search stops after `entries` entries with `end`.
    pub fn end_search_after(&self, entries: usize, end: BackendResult<RawResult>) {
        self.lock().search_end = Some((entries, end));
    }

    pub fn add_search_referral(&self, url: &str) {
        self.lock().referrals.push(url.to_string());
    }

    /// While down, every primitive and every new connection fails.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Searches abandoned before their final result.
    pub fn searches_abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

fn position(entries: &[DirectoryEntry], dn: &str) -> Option<usize> {
    entries.iter().position(|e| e.dn().eq_ignore_ascii_case(dn))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    Bind(SessionBind),
    Add {
        dn: String,
    },
    Compare {
        dn: String,
        attribute: String,
    },
    Delete {
        dn: String,
    },
    Modify {
        dn: String,
    },
    ModifyDn {
        dn: String,
        new_rdn: String,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    },
    Search {
        base: String,
        filter: String,
        /// Paged results cookie sent, `None` when the search was not paged.
        cookie: Option<Vec<u8>>,
    },
    Close,
}

pub(crate) struct MockSession {
    directory: MockDirectory,
    calls: Vec<Recorded>,
    last_controls: Vec<Control>,
}

impl MockSession {
    pub fn new(directory: MockDirectory) -> Self {
        Self {
            directory,
            calls: Vec::new(),
            last_controls: Vec::new(),
        }
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.clone()
    }

    pub fn last_controls(&self) -> Vec<Control> {
        self.last_controls.clone()
    }

    /// Records the call and returns a scripted result if one is queued.
    fn begin(&mut self, call: Recorded, controls: &[Control]) -> BackendResult<Option<RawResult>> {
        self.calls.push(call);
        self.last_controls = controls.to_vec();
        let mut state = self.directory.lock();
        if state.down {
            return Err(BackendError::new(ResultCode::ServerDown, "Directory is down"));
        }
        Ok(state.scripted.pop_front())
    }
}

fn no_such_object(dn: &str) -> RawResult {
    RawResult {
        message: format!("No such object: {}", dn),
        ..RawResult::with_code(ResultCode::NoSuchObject)
    }
}

#[async_trait]
impl DirectorySession for MockSession {
    async fn bind(&mut self, bind: &SessionBind, controls: &[Control]) -> BackendResult<RawResult> {
        if let Some(raw) = self.begin(Recorded::Bind(bind.clone()), controls)? {
            return Ok(raw);
        }
        let state = self.directory.lock();
        Ok(match bind {
            SessionBind::Anonymous => RawResult::success(),
            SessionBind::Simple { dn, password, .. } => {
                match state.passwords.get(&dn.to_ascii_lowercase()) {
                    Some(expected) if expected == password => RawResult::success(),
                    _ => RawResult {
                        message: "Invalid credentials".to_string(),
                        ..RawResult::with_code(ResultCode::InvalidCredentials)
                    },
                }
            }
            SessionBind::Sasl(_) => RawResult::with_code(ResultCode::AuthMethodNotSupported),
        })
    }

    async fn add(
        &mut self,
        dn: &str,
        attributes: &[(String, Vec<AttributeValue>)],
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        if let Some(raw) = self.begin(Recorded::Add { dn: dn.to_string() }, controls)? {
            return Ok(raw);
        }
        let mut state = self.directory.lock();
        if position(&state.entries, dn).is_some() {
            return Ok(RawResult::with_code(ResultCode::EntryAlreadyExists));
        }
        let mut entry = DirectoryEntry::new(dn);
        for (name, values) in attributes {
            for value in values {
                entry.add_value(name, value.clone());
            }
        }
        state.entries.push(entry);
        Ok(RawResult::success())
    }

    async fn compare(
        &mut self,
        dn: &str,
        attribute: &str,
        value: &AttributeValue,
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        let call = Recorded::Compare {
            dn: dn.to_string(),
            attribute: attribute.to_string(),
        };
        if let Some(raw) = self.begin(call, controls)? {
            return Ok(raw);
        }
        let state = self.directory.lock();
        let Some(pos) = position(&state.entries, dn) else {
            return Ok(no_such_object(dn));
        };
        let matched = state.entries[pos]
            .attribute(attribute)
            .map(|a| a.values().iter().any(|v| v.as_bytes() == value.as_bytes()))
            .unwrap_or(false);
        Ok(RawResult::with_code(if matched {
            ResultCode::CompareTrue
        } else {
            ResultCode::CompareFalse
        }))
    }

    async fn delete(&mut self, dn: &str, controls: &[Control]) -> BackendResult<RawResult> {
        if let Some(raw) = self.begin(Recorded::Delete { dn: dn.to_string() }, controls)? {
            return Ok(raw);
        }
        let mut state = self.directory.lock();
        match position(&state.entries, dn) {
            Some(pos) => {
                state.entries.remove(pos);
                Ok(RawResult::success())
            }
            None => Ok(no_such_object(dn)),
        }
    }

    async fn modify(
        &mut self,
        dn: &str,
        modifications: &[Modification],
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        if let Some(raw) = self.begin(Recorded::Modify { dn: dn.to_string() }, controls)? {
            return Ok(raw);
        }
        let mut state = self.directory.lock();
        let Some(pos) = position(&state.entries, dn) else {
            return Ok(no_such_object(dn));
        };
        let entry = &mut state.entries[pos];
        for modification in modifications {
            let name = modification.attribute.as_str();
            match modification.op {
                ModOp::Add => {
                    for value in &modification.values {
                        entry.add_value(name, value.clone());
                    }
                }
                ModOp::Delete if modification.values.is_empty() => {
                    if entry.remove_attribute(name).is_none() {
                        return Ok(RawResult::with_code(ResultCode::NoSuchAttribute));
                    }
                }
                ModOp::Delete => {
                    for value in &modification.values {
                        if !entry.remove_value(name, value) {
                            return Ok(RawResult::with_code(ResultCode::NoSuchAttribute));
                        }
                    }
                }
                ModOp::Replace => {
                    entry.remove_attribute(name);
                    for value in &modification.values {
                        entry.add_value(name, value.clone());
                    }
                }
            }
        }
        Ok(RawResult::success())
    }

    async fn modify_dn(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        let call = Recorded::ModifyDn {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
            delete_old_rdn,
            new_superior: new_superior.map(str::to_string),
        };
        if let Some(raw) = self.begin(call, controls)? {
            return Ok(raw);
        }
        let mut state = self.directory.lock();
        let Some(pos) = position(&state.entries, dn) else {
            return Ok(no_such_object(dn));
        };
        let superior = match new_superior {
            Some(s) => Some(s.to_string()),
            None => dn::parent(dn).map_err(|e| BackendError::new(ResultCode::InvalidDnSyntax, e.to_string()))?,
        };
        let new_dn = match superior {
            Some(s) => format!("{},{}", new_rdn, s),
            None => new_rdn.to_string(),
        };
        if position(&state.entries, &new_dn).is_some() {
            return Ok(RawResult::with_code(ResultCode::EntryAlreadyExists));
        }
        let mut old = state.entries[pos].clone();
        let old_rdn = dn::rdn(dn).unwrap_or_default();
        if delete_old_rdn {
            if let Some((attr, value)) = old_rdn.split_once('=') {
                old.remove_value(attr, &AttributeValue::from(value));
            }
        }
        let mut renamed = DirectoryEntry::new(new_dn);
        renamed.merge(old);
        if let Some((attr, value)) = new_rdn.split_once('=') {
            renamed.add_value(attr, value);
        }
        state.entries[pos] = renamed;
        Ok(RawResult::success())
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
        controls: &[Control],
    ) -> BackendResult<Box<dyn SearchCursor>> {
        let paged = requested_paging(controls);
        let call = Recorded::Search {
            base: request.base_dn.clone(),
            filter: request.filter.clone(),
            cookie: paged.as_ref().map(|p| p.cookie.clone()),
        };
        if let Some(raw) = self.begin(call, controls)? {
            return Ok(MockCursor::boxed(&self.directory, vec![Ok(RawSearchItem::Done(raw))]));
        }
        let filter = Filter::parse(&request.filter)
            .map_err(|msg| BackendError::new(ResultCode::ProtocolError, msg))?;
        let mut state = self.directory.lock();

        if request.base_dn.is_empty() && request.scope == SearchScope::Base {
            let root = DirectoryEntry::new("").with_value("objectClass", "top");
            return Ok(MockCursor::boxed(&self.directory, vec![
                Ok(RawSearchItem::Entry(to_raw(&root, request))),
                Ok(RawSearchItem::Done(RawResult::success())),
            ]));
        }
        let base_known = state
            .entries
            .iter()
            .any(|e| in_scope(e.dn(), &request.base_dn, SearchScope::Subtree));
        if !request.base_dn.is_empty() && !base_known {
            return Ok(MockCursor::boxed(&self.directory, vec![Ok(RawSearchItem::Done(no_such_object(
                &request.base_dn,
            )))]));
        }

        let mut matches: Vec<RawEntry> = state
            .entries
            .iter()
            .filter(|e| in_scope(e.dn(), &request.base_dn, request.scope) && filter.matches(e))
            .map(|e| to_raw(e, request))
            .collect();
        let mut code = ResultCode::Success;
        if request.size_limit > 0 && matches.len() > request.size_limit as usize {
            matches.truncate(request.size_limit as usize);
            code = ResultCode::SizeLimitExceeded;
        }

        let mut done = RawResult::with_code(code);
        let mut last_page = true;
        if let Some(paged) = &paged {
            let total = matches.len();
            let offset: usize = std::str::from_utf8(&paged.cookie)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
                .min(total);
            let size = if paged.size > 0 { paged.size as usize } else { total };
            let end = (offset + size).min(total);
            let page: Vec<RawEntry> = matches.drain(offset..end).collect();
            matches = page;
            let cookie = if end < total {
                last_page = false;
                end.to_string().into_bytes()
            } else {
                Vec::new()
            };
            done.controls.push(
                PagedResultsControl {
                    size: total as i32,
                    cookie,
                    critical: false,
                }
                .to_control(),
            );
        }
        done.controls.extend(state.search_controls.iter().cloned());

        let mut items: Vec<BackendResult<RawSearchItem>> = Vec::new();
        let end = state.search_end.take();
        let stop_after = end.as_ref().map(|(n, _)| *n).unwrap_or(usize::MAX);
        items.extend(
            matches
                .into_iter()
                .take(stop_after)
                .map(|e| Ok(RawSearchItem::Entry(e))),
        );
        match end {
            Some((_, Ok(raw))) => items.push(Ok(RawSearchItem::Done(raw))),
            Some((_, Err(err))) => items.push(Err(err)),
            None => {
                if last_page && !state.referrals.is_empty() {
                    items.push(Ok(RawSearchItem::Referral(state.referrals.clone())));
                }
                items.push(Ok(RawSearchItem::Done(done)));
            }
        }
        Ok(MockCursor::boxed(&self.directory, items))
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.calls.push(Recorded::Close);
        self.directory.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn requested_paging(controls: &[Control]) -> Option<PagedResultsControl> {
    let control = controls.iter().find(|c| c.oid == PAGED_RESULTS_OID)?;
    let decoded = ControlRegistry::with_defaults()
        .decode_response_controls(std::slice::from_ref(control), &[])
        .ok()?;
    match decoded.into_iter().next() {
        Some(ResponseControl::PagedResults(paged)) => Some(paged),
        _ => None,
    }
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    let dn_lower = dn.to_ascii_lowercase();
    let base_lower = base.to_ascii_lowercase();
    match scope {
        SearchScope::Base => dn_lower == base_lower,
        SearchScope::OneLevel => dn::parent(dn)
            .ok()
            .flatten()
            .map(|p| p.eq_ignore_ascii_case(base))
            .unwrap_or(base.is_empty() && !dn.is_empty()),
        SearchScope::Subtree => {
            base.is_empty() || dn_lower == base_lower || dn_lower.ends_with(&format!(",{}", base_lower))
        }
    }
}

fn to_raw(entry: &DirectoryEntry, request: &SearchRequest) -> RawEntry {
    let wanted = request.wire_attributes();
    let all = wanted.iter().any(|a| a == "*");
    let none = wanted.iter().all(|a| a == NO_ATTRIBUTES);
    let attributes = entry
        .attributes()
        .iter()
        .filter(|a| !none && (all || wanted.iter().any(|w| w.eq_ignore_ascii_case(a.name()))))
        .map(|a| {
            let values = if request.types_only {
                Vec::new()
            } else {
                a.values().iter().map(|v| v.as_bytes().to_vec()).collect()
            };
            (a.name().to_string(), values)
        })
        .collect();
    RawEntry {
        dn: entry.dn().to_string(),
        attributes,
    }
}

/// Equality, presence and boolean filters; enough for the tests.
#[derive(Debug)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equality(String, String),
}

impl Filter {
    fn parse(s: &str) -> Result<Filter, String> {
        let (filter, rest) = Self::parse_inner(s.trim())?;
        if !rest.is_empty() {
            return Err(format!("Trailing characters in filter: {}", rest));
        }
        Ok(filter)
    }

    fn parse_inner(s: &str) -> Result<(Filter, &str), String> {
        let body = s
            .strip_prefix('(')
            .ok_or_else(|| format!("Filter must start with '(': {}", s))?;
        match body.chars().next() {
            Some(op @ ('&' | '|')) => {
                let mut rest = &body[1..];
                let mut items = Vec::new();
                while rest.starts_with('(') {
                    let (item, r) = Self::parse_inner(rest)?;
                    items.push(item);
                    rest = r;
                }
                let rest = rest
                    .strip_prefix(')')
                    .ok_or_else(|| format!("Unclosed filter: {}", s))?;
                Ok((if op == '&' { Filter::And(items) } else { Filter::Or(items) }, rest))
            }
            Some('!') => {
                let (inner, rest) = Self::parse_inner(&body[1..])?;
                let rest = rest
                    .strip_prefix(')')
                    .ok_or_else(|| format!("Unclosed filter: {}", s))?;
                Ok((Filter::Not(Box::new(inner)), rest))
            }
            _ => {
                let end = body
                    .find(')')
                    .ok_or_else(|| format!("Unclosed filter: {}", s))?;
                let (attr, value) = body[..end]
                    .split_once('=')
                    .ok_or_else(|| format!("Bad filter item: {}", &body[..end]))?;
                let filter = if value == "*" {
                    Filter::Present(attr.to_string())
                } else {
                    Filter::Equality(attr.to_string(), value.to_string())
                };
                Ok((filter, &body[end + 1..]))
            }
        }
    }

    fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|f| f.matches(entry)),
            Filter::Or(items) => items.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attr) => {
                attr.eq_ignore_ascii_case("objectClass") || entry.attribute(attr).is_some()
            }
            Filter::Equality(attr, value) => entry
                .attribute(attr)
                .map(|a| {
                    a.values().iter().any(|v| match v.as_str() {
                        Some(text) => text.eq_ignore_ascii_case(value),
                        None => v.as_bytes() == value.as_bytes(),
                    })
                })
                .unwrap_or(false),
        }
    }
}

struct MockCursor {
    items: VecDeque<BackendResult<RawSearchItem>>,
    abandoned: Arc<AtomicUsize>,
}

impl MockCursor {
    fn boxed(
        directory: &MockDirectory,
        items: Vec<BackendResult<RawSearchItem>>,
    ) -> Box<dyn SearchCursor> {
        Box::new(MockCursor {
            items: items.into(),
            abandoned: Arc::clone(&directory.abandoned),
        })
    }
}

#[async_trait]
impl SearchCursor for MockCursor {
    async fn next_item(&mut self) -> BackendResult<RawSearchItem> {
        self.items
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::new(ResultCode::ProtocolError, "Search already done")))
    }

    async fn abandon(&mut self) -> BackendResult<()> {
        self.items.clear();
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens sessions on a `MockDirectory`, optionally after a delay.
pub(crate) struct MockFactory {
    directory: MockDirectory,
    delay: Duration,
}

impl MockFactory {
    pub fn new(directory: MockDirectory) -> Self {
        Self {
            directory,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self) -> LdapResult<Box<dyn DirectorySession>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.directory.lock().down {
            return Err(LdapError::connection("Directory is down"));
        }
        self.directory.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession::new(self.directory.clone())))
    }
}
