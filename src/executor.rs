//! Operation executor.
//!
//! Every operation follows the same path: encode request controls, call the
//! session primitive, then classify the result. A code in the configured
//! retry set becomes [`LdapError::Retryable`], any other non-success code
//! becomes [`LdapError::Protocol`], and success yields a [`Response`] with
//! decoded response controls. The executor never loops; see
//! [`crate::retry`] for resubmission.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{Config, ReferralBehavior};
use crate::control::{Control, ControlRegistry, RequestControl, ResponseControl};
use crate::dn;
use crate::error::{LdapError, LdapResult};
use crate::metrics::Metrics;
use crate::request::{
    with_paging, AddRequest, BindRequest, CompareRequest, ModifyRequest, Operation, Payload,
    RenameRequest, Request, Response, SearchRequest,
};
use crate::result_code::ResultCode;
use crate::sasl::SaslMechanisms;
use crate::search::SearchIterator;
use crate::session::{BackendError, DirectorySession, RawResult, SessionBind, PROTOCOL_VERSION};

/// Result classification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub retry_result_codes: Vec<ResultCode>,
    pub search_ignore_result_codes: Vec<ResultCode>,
    pub referral: ReferralBehavior,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let search = crate::config::SearchConfig::default();
        Self {
            retry_result_codes: Vec::new(),
            search_ignore_result_codes: search.ignore_result_codes,
            referral: search.referral,
        }
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            retry_result_codes: config.operation.retry_result_codes.clone(),
            search_ignore_result_codes: config.search.ignore_result_codes.clone(),
            referral: config.search.referral,
        }
    }
}

/// Stateless operation runner; cheap to clone and share between tasks.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    registry: Arc<ControlRegistry>,
    sasl: Arc<SaslMechanisms>,
    config: Arc<ExecutorConfig>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for OperationExecutor {
    fn default() -> Self {
        Self::new(Arc::new(ControlRegistry::with_defaults()), ExecutorConfig::default())
    }
}

impl OperationExecutor {
    pub fn new(registry: Arc<ControlRegistry>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            sasl: Arc::new(SaslMechanisms::with_defaults()),
            config: Arc::new(config),
            metrics: None,
        }
    }

    /// Executor with the default control registry and the retry and search
    /// settings of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ControlRegistry::with_defaults()),
            ExecutorConfig::from(config),
        )
    }

    pub fn with_sasl_mechanisms(mut self, sasl: SaslMechanisms) -> Self {
        self.sasl = Arc::new(sasl);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub async fn bind(
        &self,
        session: &mut dyn DirectorySession,
        request: &BindRequest,
        controls: &[RequestControl],
    ) -> LdapResult<Response<()>> {
        // Mechanism resolution happens before anything reaches the backend.
        let bind = match request {
            BindRequest::Anonymous => SessionBind::Anonymous,
            BindRequest::Simple { dn, password } => SessionBind::Simple {
                dn: dn.clone(),
                password: password.clone(),
                version: PROTOCOL_VERSION,
            },
            BindRequest::Sasl {
                authentication_id,
                credentials,
                config,
            } => SessionBind::Sasl(self.sasl.build_request(
                config,
                authentication_id,
                credentials.as_deref(),
            )?),
        };
        let raw_controls = self.registry.encode_request_controls(controls)?;
        let started = Instant::now();
        let outcome = session.bind(&bind, &raw_controls).await;
        self.complete("bind", request.target(), controls, started, outcome)
    }

    pub async fn add(
        &self,
        session: &mut dyn DirectorySession,
        request: &AddRequest,
        controls: &[RequestControl],
    ) -> LdapResult<Response<()>> {
        let raw_controls = self.registry.encode_request_controls(controls)?;
        let started = Instant::now();
        let outcome = session
            .add(&request.dn, &request.attributes, &raw_controls)
            .await;
        self.complete("add", &request.dn, controls, started, outcome)
    }

    /// Compares one attribute value. The server's compareTrue/compareFalse
    /// status becomes the boolean payload and the response code is Success.
    pub async fn compare(
        &self,
        session: &mut dyn DirectorySession,
        request: &CompareRequest,
        controls: &[RequestControl],
    ) -> LdapResult<Response<bool>> {
        let raw_controls = self.registry.encode_request_controls(controls)?;
        let started = Instant::now();
        let outcome = session
            .compare(&request.dn, &request.attribute, &request.value, &raw_controls)
            .await;
        let response = self.complete_as(
            "compare",
            &request.dn,
            controls,
            started,
            outcome,
            |code| code.is_success() || code.is_compare_result(),
        )?;
        let matched = match response.code {
            ResultCode::CompareTrue => true,
            ResultCode::CompareFalse => false,
            other => {
                return Err(LdapError::decode(format!(
                    "Compare on {} returned {} instead of a compare status",
                    request.dn, other
                )))
            }
        };
        let mut response = response.map(|_| matched);
        response.code = ResultCode::Success;
        Ok(response)
    }

    pub async fn delete(
        &self,
        session: &mut dyn DirectorySession,
        dn: &str,
        controls: &[RequestControl],
    ) -> LdapResult<Response<()>> {
        let raw_controls = self.registry.encode_request_controls(controls)?;
        let started = Instant::now();
        let outcome = session.delete(dn, &raw_controls).await;
        self.complete("delete", dn, controls, started, outcome)
    }

    pub async fn modify(
        &self,
        session: &mut dyn DirectorySession,
        request: &ModifyRequest,
        controls: &[RequestControl],
    ) -> LdapResult<Response<()>> {
        let raw_controls = self.registry.encode_request_controls(controls)?;
        let started = Instant::now();
        let outcome = session
            .modify(&request.dn, &request.modifications, &raw_controls)
            .await;
        self.complete("modify", &request.dn, controls, started, outcome)
    }

    /// Issues a modify-DN with the new DN split into RDN and superior. The
    /// old RDN value is always deleted.
    pub async fn rename(
        &self,
        session: &mut dyn DirectorySession,
        request: &RenameRequest,
        controls: &[RequestControl],
    ) -> LdapResult<Response<()>> {
        dn::split_rdn(&request.dn)?;
        let (new_rdn, new_superior) = dn::split_rdn(&request.new_dn)?;
        let raw_controls = self.registry.encode_request_controls(controls)?;
        let started = Instant::now();
        let outcome = session
            .modify_dn(
                &request.dn,
                &new_rdn,
                true,
                new_superior.as_deref(),
                &raw_controls,
            )
            .await;
        self.complete("modify_dn", &request.dn, controls, started, outcome)
    }

    /// Lazily searches; nothing is sent until the iterator is first polled.
    pub fn search<'s>(
        &self,
        session: &'s mut dyn DirectorySession,
        request: SearchRequest,
        controls: Vec<RequestControl>,
    ) -> SearchIterator<'s> {
        SearchIterator::new(self.clone(), session, request, controls, false)
    }

    /// Lazily searches page by page, reissuing with the server cookie until
    /// the result set is exhausted.
    pub fn paged_search<'s>(
        &self,
        session: &'s mut dyn DirectorySession,
        request: SearchRequest,
        page_size: i32,
        controls: Vec<RequestControl>,
    ) -> SearchIterator<'s> {
        let controls = with_paging(controls, page_size);
        SearchIterator::new(self.clone(), session, request, controls, true)
    }

    /// Runs any request and collects its payload. Searches are drained.
    pub async fn execute(
        &self,
        session: &mut dyn DirectorySession,
        request: &Request,
    ) -> LdapResult<Response<Payload>> {
        let controls = &request.controls;
        match &request.operation {
            Operation::Bind(bind) => Ok(self
                .bind(session, bind, controls)
                .await?
                .map(|_| Payload::Unit)),
            Operation::Add(add) => Ok(self.add(session, add, controls).await?.map(|_| Payload::Unit)),
            Operation::Compare(compare) => Ok(self
                .compare(session, compare, controls)
                .await?
                .map(Payload::Bool)),
            Operation::Delete { dn } => Ok(self
                .delete(session, dn, controls)
                .await?
                .map(|_| Payload::Unit)),
            Operation::Modify(modify) => Ok(self
                .modify(session, modify, controls)
                .await?
                .map(|_| Payload::Unit)),
            Operation::Rename(rename) => Ok(self
                .rename(session, rename, controls)
                .await?
                .map(|_| Payload::Unit)),
            Operation::Search(search) => {
                let iter = self.search(session, search.clone(), controls.clone());
                let (entries, response) = iter.collect().await?;
                Ok(response.map(|_| Payload::Entries(entries)))
            }
            Operation::PagedSearch { search, page_size } => {
                let iter = self.paged_search(session, search.clone(), *page_size, controls.clone());
                let (entries, response) = iter.collect().await?;
                Ok(response.map(|_| Payload::Entries(entries)))
            }
        }
    }

    /// Best effort decode for controls riding on a failure.
    fn decode_failure_controls(
        &self,
        raw: &[Control],
        requested: &[RequestControl],
    ) -> Vec<ResponseControl> {
        match self.registry.decode_response_controls(raw, requested) {
            Ok(controls) => controls,
            Err(e) => {
                warn!("Dropping undecodable controls on failed response: {}", e);
                raw.iter().cloned().map(ResponseControl::Opaque).collect()
            }
        }
    }

    pub(crate) fn backend_fault(&self, err: BackendError, requested: &[RequestControl]) -> LdapError {
        let controls = self.decode_failure_controls(&err.controls, requested);
        self.fault(err.code, err.message, String::new(), controls)
    }

    fn fault(
        &self,
        code: ResultCode,
        message: String,
        matched_dn: String,
        controls: Vec<ResponseControl>,
    ) -> LdapError {
        if self.config.retry_result_codes.contains(&code) {
            LdapError::Retryable {
                code,
                message,
                controls,
            }
        } else {
            LdapError::Protocol {
                code,
                message,
                matched_dn,
                controls,
            }
        }
    }

    /// Classifies a final backend result; only Success counts as success.
    pub(crate) fn classify(
        &self,
        raw: RawResult,
        requested: &[RequestControl],
    ) -> LdapResult<Response<()>> {
        self.classify_as(raw, requested, ResultCode::is_success)
    }

    /// Classifies a final backend result, treating codes accepted by
    /// `success` as success.
    fn classify_as(
        &self,
        raw: RawResult,
        requested: &[RequestControl],
        success: fn(ResultCode) -> bool,
    ) -> LdapResult<Response<()>> {
        let code = ResultCode::try_from(raw.code)?;
        if !success(code) {
            let controls = self.decode_failure_controls(&raw.controls, requested);
            return Err(self.fault(code, raw.message, raw.matched_dn, controls));
        }
        let controls = self
            .registry
            .decode_response_controls(&raw.controls, requested)
            .map_err(|e| {
                if let Some(m) = &self.metrics {
                    Metrics::inc(&m.decode_errors);
                }
                e
            })?;
        Ok(Response {
            result: (),
            code,
            controls,
            matched_dn: raw.matched_dn,
            message: raw.message,
        })
    }

    fn complete(
        &self,
        op: &'static str,
        dn: &str,
        requested: &[RequestControl],
        started: Instant,
        outcome: Result<RawResult, BackendError>,
    ) -> LdapResult<Response<()>> {
        self.complete_as(op, dn, requested, started, outcome, ResultCode::is_success)
    }

    fn complete_as(
        &self,
        op: &'static str,
        dn: &str,
        requested: &[RequestControl],
        started: Instant,
        outcome: Result<RawResult, BackendError>,
        success: fn(ResultCode) -> bool,
    ) -> LdapResult<Response<()>> {
        let result = match outcome {
            Ok(raw) => self.classify_as(raw, requested, success),
            Err(err) => Err(self.backend_fault(err, requested)),
        };
        self.record(op, started.elapsed(), &result);
        match &result {
            Ok(response) => debug!("{} {} -> {}", op, dn, response.code),
            Err(e) => debug!("{} {} failed: {}", op, dn, e),
        }
        result
    }

    pub(crate) fn record<T>(&self, op: &'static str, elapsed: Duration, result: &LdapResult<T>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.observe_duration(op, elapsed);
        match result {
            Ok(_) => metrics.inc_request(op),
            Err(e) => metrics.inc_error(op, e.result_code()),
        }
    }
}
