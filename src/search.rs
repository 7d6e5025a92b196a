//! Pull-based search cursor.
//!
//! ```text
//! Init --has_next--> Fetching --entry--> HasEntry --next--> Fetching
//!                       |  ^
//!                       |  +-- page done, cookie returned: reissue
//!                       +----- done, no cookie / ignorable fault --> Exhausted
//!  any state -- unrecoverable fault --> Failed
//! ```
//!
//! The iterator borrows its session and never closes it; the caller or the
//! pool owns the session.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ReferralBehavior;
use crate::control::{continuation_cookie, PagedResultsControl, RequestControl};
use crate::entry::DirectoryEntry;
use crate::error::{LdapError, LdapResult};
use crate::executor::OperationExecutor;
use crate::request::{Response, SearchRequest};
use crate::result_code::ResultCode;
use crate::session::{DirectorySession, RawEntry, RawResult, RawSearchItem, SearchCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Init,
    Fetching,
    HasEntry,
    Exhausted,
    Failed,
}

pub struct SearchIterator<'s> {
    executor: OperationExecutor,
    session: &'s mut dyn DirectorySession,
    request: SearchRequest,
    /// Controls for the next round trip. Paging cookies are updated in place.
    controls: Vec<RequestControl>,
    paged: bool,
    state: IteratorState,
    cursor: Option<Box<dyn SearchCursor>>,
    pending: Option<RawEntry>,
    response: Option<Response<()>>,
    started: Instant,
    pages: usize,
    entries: usize,
}

impl<'s> SearchIterator<'s> {
    pub(crate) fn new(
        executor: OperationExecutor,
        session: &'s mut dyn DirectorySession,
        request: SearchRequest,
        controls: Vec<RequestControl>,
        paged: bool,
    ) -> Self {
        Self {
            executor,
            session,
            request,
            controls,
            paged,
            state: IteratorState::Init,
            cursor: None,
            pending: None,
            response: None,
            started: Instant::now(),
            pages: 0,
            entries: 0,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    /// Round trips issued so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// True when another entry is available. The first call submits the search.
    pub async fn has_next(&mut self) -> LdapResult<bool> {
        match self.state {
            IteratorState::HasEntry => Ok(true),
            IteratorState::Exhausted | IteratorState::Failed => Ok(false),
            IteratorState::Init => {
                self.started = Instant::now();
                self.submit().await?;
                self.fetch().await
            }
            IteratorState::Fetching => self.fetch().await,
        }
    }

    /// Decodes and returns the next entry, or `None` once exhausted.
    pub async fn next(&mut self) -> LdapResult<Option<DirectoryEntry>> {
        if !self.has_next().await? {
            return Ok(None);
        }
        let Some(raw) = self.pending.take() else {
            self.state = IteratorState::Fetching;
            return Ok(None);
        };
        self.state = IteratorState::Fetching;
        match DirectoryEntry::from_raw(raw, &self.request.binary_attributes) {
            Ok(entry) => {
                self.entries += 1;
                Ok(Some(entry))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Terminal response, `None` until the iterator is exhausted.
    pub fn response(&self) -> Option<&Response<()>> {
        self.response.as_ref()
    }

    /// Stops the iteration, abandoning a search still in flight so the
    /// server stops sending results. Safe to call repeatedly; the session
    /// stays open.
    pub async fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            debug!("Search on {} closed before completion", self.request.base_dn);
            if let Err(e) = cursor.abandon().await {
                warn!("Failed to abandon search on {}: {}", self.request.base_dn, e);
            }
        }
        self.pending = None;
        if !matches!(self.state, IteratorState::Exhausted | IteratorState::Failed) {
            self.state = IteratorState::Exhausted;
        }
    }

    /// Drains the iterator.
    pub async fn collect(mut self) -> LdapResult<(Vec<DirectoryEntry>, Response<()>)> {
        let mut entries = Vec::new();
        loop {
            match self.next().await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            }
        }
        let response = self
            .response
            .take()
            .ok_or_else(|| LdapError::decode("Search ended without a final result"))?;
        Ok((entries, response))
    }

    async fn submit(&mut self) -> LdapResult<()> {
        self.state = IteratorState::Fetching;
        let raw_controls = match self.executor.registry().encode_request_controls(&self.controls) {
            Ok(c) => c,
            Err(e) => return Err(self.fail(e)),
        };
        debug!(
            "search base={} filter={} page={}",
            self.request.base_dn, self.request.filter, self.pages
        );
        match self.session.search(&self.request, &raw_controls).await {
            Ok(cursor) => {
                self.cursor = Some(cursor);
                self.pages += 1;
                Ok(())
            }
            Err(err) => {
                let fault = self.executor.backend_fault(err, &self.controls);
                self.fault_or_finish(fault).map(|_| ())
            }
        }
    }

    async fn fetch(&mut self) -> LdapResult<bool> {
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(self.state == IteratorState::HasEntry);
            };
            let item = cursor.next_item().await;
            match item {
                Ok(RawSearchItem::Entry(raw)) => {
                    self.pending = Some(raw);
                    self.state = IteratorState::HasEntry;
                    return Ok(true);
                }
                Ok(RawSearchItem::Referral(urls)) => self.on_referral(urls)?,
                Ok(RawSearchItem::Done(raw)) => {
                    self.cursor = None;
                    if !self.on_done(raw)? {
                        return Ok(false);
                    }
                    self.submit().await?;
                }
                Err(err) => {
                    self.cursor = None;
                    let fault = self.executor.backend_fault(err, &self.controls);
                    return self.fault_or_finish(fault);
                }
            }
        }
    }

    fn on_referral(&mut self, urls: Vec<String>) -> LdapResult<()> {
        match self.executor.config().referral {
            ReferralBehavior::Ignore => {
                info!("Ignoring search reference {:?} under {}", urls, self.request.base_dn);
                Ok(())
            }
            ReferralBehavior::Follow => Err(self.fail(LdapError::config(format!(
                "Following referrals is not supported: {:?}",
                urls
            )))),
            ReferralBehavior::Throw => Err(self.fail(LdapError::Protocol {
                code: ResultCode::Referral,
                message: urls.join(" "),
                matched_dn: String::new(),
                controls: Vec::new(),
            })),
        }
    }

    /// Handles the end of one round trip. `Ok(true)` means reissue for the
    /// next page.
    fn on_done(&mut self, raw: RawResult) -> LdapResult<bool> {
        if raw.code == ResultCode::Referral.code() {
            self.on_referral(raw.referrals.clone())?;
            self.finish(Response {
                result: (),
                code: ResultCode::Referral,
                controls: Vec::new(),
                matched_dn: raw.matched_dn,
                message: raw.message,
            });
            return Ok(false);
        }
        let response = match self.executor.classify(raw, &self.controls) {
            Ok(response) => response,
            Err(fault) => return self.fault_or_finish(fault).map(|_| false),
        };
        if self.paged {
            if let Some(cookie) = continuation_cookie(&response.controls) {
                let cookie = cookie.to_vec();
                self.set_cookie(cookie);
                return Ok(true);
            }
        }
        self.finish(response);
        Ok(false)
    }

    fn set_cookie(&mut self, cookie: Vec<u8>) {
        for control in &mut self.controls {
            if let RequestControl::PagedResults(paged) = control {
                paged.cookie = cookie;
                return;
            }
        }
        let mut paged = PagedResultsControl::new(0);
        paged.cookie = cookie;
        self.controls.push(RequestControl::PagedResults(paged));
    }

    fn finish(&mut self, response: Response<()>) {
        debug!(
            "search base={} done: {} entries, {} pages, {}",
            self.request.base_dn, self.entries, self.pages, response.code
        );
        self.executor
            .record::<()>("search", self.started.elapsed(), &Ok(()));
        self.response = Some(response);
        self.state = IteratorState::Exhausted;
    }

    /// Ends the stream on an ignorable fault, keeping what was yielded, or
    /// fails outward.
    /// Only server status faults are ignorable; decode and client faults
    /// always fail.
    fn fault_or_finish(&mut self, fault: LdapError) -> LdapResult<bool> {
        let status = match &fault {
            LdapError::Protocol { code, .. } | LdapError::Retryable { code, .. } => Some(*code),
            _ => None,
        };
        match status {
            Some(code) if self.executor.config().search_ignore_result_codes.contains(&code) => {
                warn!(
                    "Search on {} ended early with {} after {} entries",
                    self.request.base_dn, code, self.entries
                );
                let message = match &fault {
                    LdapError::Protocol { message, .. } | LdapError::Retryable { message, .. } => {
                        message.clone()
                    }
                    other => other.to_string(),
                };
                self.finish(Response {
                    result: (),
                    code,
                    controls: fault.controls().to_vec(),
                    matched_dn: String::new(),
                    message,
                });
                Ok(false)
            }
            _ => Err(self.fail(fault)),
        }
    }

    /// Marks the iteration failed. A cursor still streaming is kept for
    /// [`close`](Self::close) to abandon.
    fn fail(&mut self, fault: LdapError) -> LdapError {
        self.pending = None;
        self.state = IteratorState::Failed;
        if let Some(metrics) = self.executor.metrics() {
            metrics.observe_duration("search", self.started.elapsed());
            metrics.inc_error("search", fault.result_code());
        }
        fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::control::{Control, ControlRegistry};
    use crate::executor::ExecutorConfig;
    use crate::mock::{MockDirectory, MockSession, Recorded};
    use crate::request::SearchScope;
    use crate::session::BackendError;

    fn people(n: usize) -> MockDirectory {
        let directory = MockDirectory::new();
        directory.insert(DirectoryEntry::new("ou=people,dc=example,dc=org").with_value("ou", "people"));
        for i in 0..n {
            directory.insert(
                DirectoryEntry::new(format!("uid=user{},ou=people,dc=example,dc=org", i))
                    .with_value("uid", format!("user{}", i).as_str())
                    .with_value("objectClass", "person"),
            );
        }
        directory
    }

    fn executor_with(referral: ReferralBehavior) -> OperationExecutor {
        OperationExecutor::new(
            Arc::new(ControlRegistry::with_defaults()),
            ExecutorConfig {
                referral,
                ..ExecutorConfig::default()
            },
        )
    }

    fn person_search() -> SearchRequest {
        SearchRequest::new("ou=people,dc=example,dc=org", "(objectClass=person)")
            .scope(SearchScope::OneLevel)
    }

    fn dns(entries: &[DirectoryEntry]) -> Vec<String> {
        entries.iter().map(|e| e.dn().to_string()).collect()
    }

    #[tokio::test]
    async fn test_lazy_until_first_has_next() {
        let mut session = MockSession::new(people(2));
        let exec = OperationExecutor::default();
        {
            let mut iter = exec.search(&mut session, person_search(), vec![]);
            assert_eq!(iter.state(), IteratorState::Init);
            assert!(iter.response().is_none());
            iter.close().await;
            iter.close().await;
            assert!(!iter.has_next().await.unwrap());
        }
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_paged_equals_unpaged() {
        let exec = OperationExecutor::default();

        let mut session = MockSession::new(people(7));
        let (unpaged, response) = exec
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap();
        assert_eq!(unpaged.len(), 7);
        assert_eq!(response.code, ResultCode::Success);

        for page_size in [1, 2, 3, 7, 10] {
            let mut session = MockSession::new(people(7));
            let mut iter = exec.paged_search(&mut session, person_search(), page_size, vec![]);
            let mut paged = Vec::new();
            while iter.has_next().await.unwrap() {
                paged.push(iter.next().await.unwrap().unwrap());
            }
            let expected_pages = (7 + page_size as usize - 1) / page_size as usize;
            assert_eq!(iter.pages(), expected_pages.max(1), "page size {}", page_size);
            assert_eq!(iter.response().unwrap().code, ResultCode::Success);
            assert_eq!(dns(&paged), dns(&unpaged), "page size {}", page_size);
        }
    }

    #[tokio::test]
    async fn test_paged_reissue_sends_cookie() {
        let mut session = MockSession::new(people(3));
        let exec = OperationExecutor::default();
        let (entries, _) = exec
            .paged_search(&mut session, person_search(), 2, vec![])
            .collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        let cookies: Vec<Option<Vec<u8>>> = session
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Recorded::Search { cookie, .. } => Some(cookie),
                _ => None,
            })
            .collect();
        assert_eq!(cookies, vec![Some(Vec::new()), Some(b"2".to_vec())]);
    }

    #[tokio::test]
    async fn test_ignorable_code_preserves_partial_results() {
        let directory = people(5);
        directory.end_search_after(2, Ok(RawResult::with_code(ResultCode::SizeLimitExceeded)));
        let mut session = MockSession::new(directory);
        let (entries, response) = OperationExecutor::default()
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(response.code, ResultCode::SizeLimitExceeded);
    }

    #[tokio::test]
    async fn test_ignorable_backend_error_mid_stream() {
        let directory = people(5);
        directory.end_search_after(
            3,
            Err(BackendError::new(ResultCode::TimeLimitExceeded, "time limit")),
        );
        let mut session = MockSession::new(directory);
        let mut iter = OperationExecutor::default().search(&mut session, person_search(), vec![]);
        let mut count = 0;
        while iter.next().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(iter.state(), IteratorState::Exhausted);
        assert_eq!(iter.response().unwrap().code, ResultCode::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn test_unrecoverable_fault_fails() {
        let directory = people(5);
        directory.end_search_after(1, Err(BackendError::new(ResultCode::ServerDown, "gone")));
        let mut session = MockSession::new(directory);
        let mut iter = OperationExecutor::default().search(&mut session, person_search(), vec![]);
        assert!(iter.next().await.unwrap().is_some());
        let err = iter.next().await.unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::ServerDown));
        assert_eq!(iter.state(), IteratorState::Failed);
        assert!(iter.response().is_none());
        assert!(iter.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decode_fault_is_never_ignored() {
        let directory = people(2);
        directory.attach_search_controls(vec![Control::new("1.3.6.1.4.1.99.1", true, None)]);
        let mut session = MockSession::new(directory);
        let exec = OperationExecutor::new(
            Arc::new(ControlRegistry::with_defaults()),
            ExecutorConfig {
                search_ignore_result_codes: vec![ResultCode::DecodingError],
                ..ExecutorConfig::default()
            },
        );
        let mut iter = exec.search(&mut session, person_search(), vec![]);
        assert!(iter.next().await.unwrap().is_some());
        assert!(iter.next().await.unwrap().is_some());
        let err = iter.next().await.unwrap_err();
        assert!(matches!(err, LdapError::Decode(_)));
        assert_eq!(iter.state(), IteratorState::Failed);
        assert!(iter.response().is_none());
    }

    #[tokio::test]
    async fn test_referral_ignore_skips() {
        let directory = people(2);
        directory.add_search_referral("ldap://other.example.org/ou=people,dc=example,dc=org");
        let mut session = MockSession::new(directory);
        let (entries, response) = executor_with(ReferralBehavior::Ignore)
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(response.code, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_referral_throw() {
        let directory = people(2);
        directory.add_search_referral("ldap://other.example.org/");
        let mut session = MockSession::new(directory);
        let err = executor_with(ReferralBehavior::Throw)
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::Referral));
        assert!(matches!(err, LdapError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_referral_follow_is_unsupported() {
        let directory = people(2);
        directory.add_search_referral("ldap://other.example.org/");
        let mut session = MockSession::new(directory);
        let err = executor_with(ReferralBehavior::Follow)
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_no_such_object_fails() {
        let mut session = MockSession::new(people(1));
        let err = OperationExecutor::default()
            .search(
                &mut session,
                SearchRequest::new("ou=missing,dc=example,dc=org", "(objectClass=*)"),
                vec![],
            )
            .collect()
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NoSuchObject));
    }

    #[tokio::test]
    async fn test_close_leaves_session_usable() {
        let mut session = MockSession::new(people(4));
        let exec = OperationExecutor::default();
        {
            let mut iter = exec.search(&mut session, person_search(), vec![]);
            assert!(iter.next().await.unwrap().is_some());
            iter.close().await;
            assert!(iter.response().is_none());
            assert!(iter.next().await.unwrap().is_none());
        }
        let (entries, _) = exec
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 4);
        assert!(!session.calls().contains(&Recorded::Close));
    }

    #[tokio::test]
    async fn test_close_abandons_unfinished_search() {
        let directory = people(4);
        let mut session = MockSession::new(directory.clone());
        let exec = OperationExecutor::default();
        let mut iter = exec.search(&mut session, person_search(), vec![]);
        assert!(iter.next().await.unwrap().is_some());
        iter.close().await;
        iter.close().await;
        assert_eq!(directory.searches_abandoned(), 1);
        assert_eq!(iter.state(), IteratorState::Exhausted);
    }

    #[tokio::test]
    async fn test_close_after_completion_does_not_abandon() {
        let directory = people(2);
        let mut session = MockSession::new(directory.clone());
        let exec = OperationExecutor::default();
        let mut iter = exec.search(&mut session, person_search(), vec![]);
        while iter.next().await.unwrap().is_some() {}
        iter.close().await;
        assert_eq!(directory.searches_abandoned(), 0);
        assert_eq!(iter.response().unwrap().code, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_failed_collect_abandons_stream() {
        let directory = people(3);
        directory.add_search_referral("ldap://other.example.org/");
        let mut session = MockSession::new(directory.clone());
        let err = executor_with(ReferralBehavior::Throw)
            .search(&mut session, person_search(), vec![])
            .collect()
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::Referral));
        assert_eq!(directory.searches_abandoned(), 1);
    }

    #[tokio::test]
    async fn test_binary_attributes_stay_binary() {
        let directory = MockDirectory::new();
        directory.insert(
            DirectoryEntry::new("cn=x,dc=org")
                .with_value("cn", "x")
                .with_value("objectGUID", "text-looking"),
        );
        let mut session = MockSession::new(directory);
        let request = SearchRequest::new("cn=x,dc=org", "(objectClass=*)")
            .scope(SearchScope::Base)
            .binary_attributes(["objectGUID"]);
        let (entries, _) = OperationExecutor::default()
            .search(&mut session, request, vec![])
            .collect()
            .await
            .unwrap();
        assert!(entries[0].attribute("objectguid").unwrap().values()[0].is_binary());
        assert_eq!(entries[0].first_text("cn"), Some("x"));
    }
}
