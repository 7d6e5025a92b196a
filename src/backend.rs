//! ldap3 backed sessions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry, SearchOptions, SearchStream};
use tracing::{debug, info, warn};

use crate::config::{Config, ConnectionConfig};
use crate::control::Control;
use crate::entry::AttributeValue;
use crate::error::{LdapError, LdapResult};
use crate::executor::OperationExecutor;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::request::{BindRequest, DerefAliases, ModOp, Modification, SearchRequest, SearchScope};
use crate::result_code::ResultCode;
use crate::session::{
    BackendError, BackendResult, DirectorySession, RawEntry, RawResult, RawSearchItem,
    SearchCursor, SessionBind, SessionFactory,
};

/// Maps an ldap3 client fault onto the result code it stands for.
fn backend_error(err: ldap3::LdapError) -> BackendError {
    let code = match &err {
        ldap3::LdapError::LdapResult { result } => {
            return BackendError {
                code: ResultCode::try_from(result.rc).unwrap_or(ResultCode::Other),
                message: result.text.clone(),
                controls: result.ctrls.iter().map(|c| from_raw_control(&c.1)).collect(),
            };
        }
        ldap3::LdapError::Timeout { .. } => ResultCode::Timeout,
        ldap3::LdapError::Io { .. } | ldap3::LdapError::EndOfStream => ResultCode::ServerDown,
        ldap3::LdapError::FilterParsing => ResultCode::EncodingError,
        ldap3::LdapError::UrlParsing { .. } | ldap3::LdapError::UnknownScheme(_) => {
            ResultCode::ConnectError
        }
        _ => ResultCode::LocalError,
    };
    BackendError::new(code, err.to_string())
}

fn to_raw_control(control: &Control) -> ldap3::controls::RawControl {
    ldap3::controls::RawControl {
        ctype: control.oid.clone(),
        crit: control.critical,
        val: control.value.clone(),
    }
}

fn from_raw_control(raw: &ldap3::controls::RawControl) -> Control {
    Control::new(raw.ctype.clone(), raw.crit, raw.val.clone())
}

fn to_raw_result(result: ldap3::LdapResult) -> RawResult {
    RawResult {
        code: result.rc,
        matched_dn: result.matched,
        message: result.text,
        referrals: result.refs,
        controls: result.ctrls.iter().map(|c| from_raw_control(&c.1)).collect(),
    }
}

fn to_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

fn to_deref(deref: DerefAliases) -> ldap3::DerefAliases {
    match deref {
        DerefAliases::Never => ldap3::DerefAliases::Never,
        DerefAliases::Searching => ldap3::DerefAliases::Searching,
        DerefAliases::Finding => ldap3::DerefAliases::Finding,
        DerefAliases::Always => ldap3::DerefAliases::Always,
    }
}

fn value_set(values: &[AttributeValue]) -> HashSet<Vec<u8>> {
    values.iter().map(|v| v.as_bytes().to_vec()).collect()
}

fn to_mod(modification: &Modification) -> Mod<Vec<u8>> {
    let attr = modification.attribute.as_bytes().to_vec();
    let values = value_set(&modification.values);
    match modification.op {
        ModOp::Add => Mod::Add(attr, values),
        ModOp::Delete => Mod::Delete(attr, values),
        ModOp::Replace => Mod::Replace(attr, values),
    }
}

fn to_raw_entry(entry: SearchEntry) -> RawEntry {
    let mut attributes: Vec<(String, Vec<Vec<u8>>)> = entry
        .attrs
        .into_iter()
        .map(|(name, values)| (name, values.into_iter().map(String::into_bytes).collect()))
        .collect();
    attributes.extend(entry.bin_attrs);
    RawEntry {
        dn: entry.dn,
        attributes,
    }
}

/// One connection to a directory server.
pub struct Ldap3Session {
    ldap: Ldap,
    url: String,
    operation_timeout: Option<Duration>,
}

impl Ldap3Session {
    pub fn new(ldap: Ldap, url: impl Into<String>, operation_timeout: Option<Duration>) -> Self {
        Self {
            ldap,
            url: url.into(),
            operation_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Applies the timeout and controls to the next operation only.
    fn prepare(&mut self, controls: &[Control]) -> &mut Ldap {
        if let Some(timeout) = self.operation_timeout {
            self.ldap.with_timeout(timeout);
        }
        if !controls.is_empty() {
            self.ldap
                .with_controls(controls.iter().map(to_raw_control).collect::<Vec<_>>());
        }
        &mut self.ldap
    }
}

#[async_trait]
impl DirectorySession for Ldap3Session {
    async fn bind(&mut self, bind: &SessionBind, controls: &[Control]) -> BackendResult<RawResult> {
        let (dn, password) = match bind {
            SessionBind::Anonymous => ("", ""),
            SessionBind::Simple { dn, password, .. } => (dn.as_str(), password.as_str()),
            SessionBind::Sasl(request) => {
                return Err(BackendError::new(
                    ResultCode::AuthMethodNotSupported,
                    format!("SASL {} binds are not supported by this backend", request.mechanism),
                ));
            }
        };
        let result = self
            .prepare(controls)
            .simple_bind(dn, password)
            .await
            .map_err(backend_error)?;
        Ok(to_raw_result(result))
    }

    async fn add(
        &mut self,
        dn: &str,
        attributes: &[(String, Vec<AttributeValue>)],
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .iter()
            .map(|(name, values)| (name.as_bytes().to_vec(), value_set(values)))
            .collect();
        let result = self
            .prepare(controls)
            .add(dn, attrs)
            .await
            .map_err(backend_error)?;
        Ok(to_raw_result(result))
    }

    async fn compare(
        &mut self,
        dn: &str,
        attribute: &str,
        value: &AttributeValue,
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        let result = self
            .prepare(controls)
            .compare(dn, attribute, value.as_bytes())
            .await
            .map_err(backend_error)?;
        Ok(to_raw_result(result.0))
    }

    async fn delete(&mut self, dn: &str, controls: &[Control]) -> BackendResult<RawResult> {
        let result = self
            .prepare(controls)
            .delete(dn)
            .await
            .map_err(backend_error)?;
        Ok(to_raw_result(result))
    }

    async fn modify(
        &mut self,
        dn: &str,
        modifications: &[Modification],
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        let mods: Vec<Mod<Vec<u8>>> = modifications.iter().map(to_mod).collect();
        let result = self
            .prepare(controls)
            .modify(dn, mods)
            .await
            .map_err(backend_error)?;
        Ok(to_raw_result(result))
    }

    async fn modify_dn(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
        controls: &[Control],
    ) -> BackendResult<RawResult> {
        let result = self
            .prepare(controls)
            .modifydn(dn, new_rdn, delete_old_rdn, new_superior)
            .await
            .map_err(backend_error)?;
        Ok(to_raw_result(result))
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
        controls: &[Control],
    ) -> BackendResult<Box<dyn SearchCursor>> {
        let options = SearchOptions::new()
            .deref(to_deref(request.deref_aliases))
            .sizelimit(request.size_limit)
            .timelimit(request.time_limit.as_secs().min(i32::MAX as u64) as i32)
            .typesonly(request.types_only);
        let ldap = self.prepare(controls);
        ldap.with_search_options(options);
        let stream = ldap
            .streaming_search(
                &request.base_dn,
                to_scope(request.scope),
                &request.filter,
                request.wire_attributes(),
            )
            .await
            .map_err(backend_error)?;
        Ok(Box::new(Ldap3Cursor { stream }))
    }

    async fn close(&mut self) -> BackendResult<()> {
        debug!("Closing session to {}", self.url);
        self.ldap.unbind().await.map_err(backend_error)
    }
}

struct Ldap3Cursor {
    stream: SearchStream<'static, String, Vec<String>>,
}

#[async_trait]
impl SearchCursor for Ldap3Cursor {
    async fn next_item(&mut self) -> BackendResult<RawSearchItem> {
        loop {
            match self.stream.next().await.map_err(backend_error)? {
                Some(entry) if entry.is_intermediate() => continue,
                Some(entry) if entry.is_ref() => {
                    return Ok(RawSearchItem::Referral(ldap3::parse_refs(entry.0)));
                }
                Some(entry) => return Ok(RawSearchItem::Entry(to_raw_entry(SearchEntry::construct(entry)))),
                None => {
                    let result = self.stream.finish().await;
                    return Ok(RawSearchItem::Done(to_raw_result(result)));
                }
            }
        }
    }

    async fn abandon(&mut self) -> BackendResult<()> {
        let ldap = self.stream.ldap_handle();
        let msgid = ldap.last_id();
        ldap.abandon(msgid).await.map_err(backend_error)
    }
}

/// Opens [`Ldap3Session`]s and performs the configured service bind.
pub struct Ldap3SessionFactory {
    config: ConnectionConfig,
    executor: OperationExecutor,
    service_bind: Option<BindRequest>,
}

impl Ldap3SessionFactory {
    pub fn new(config: ConnectionConfig, executor: OperationExecutor) -> LdapResult<Self> {
        let service_bind = match &config.bind {
            Some(bind) => Some(bind.to_request()?),
            None => None,
        };
        Ok(Self {
            config,
            executor,
            service_bind,
        })
    }

    fn settings(&self) -> LdapConnSettings {
        let mut settings = LdapConnSettings::new()
            .set_starttls(self.config.starttls.unwrap_or(false))
            .set_no_tls_verify(self.config.tls_skip_verify.unwrap_or(false));
        if let Some(secs) = self.config.connect_timeout_sec {
            settings = settings.set_conn_timeout(Duration::from_secs(secs));
        }
        settings
    }

    async fn connect(&self) -> Result<Ldap3Session> {
        let url = &self.config.url;
        let (conn, ldap) = LdapConnAsync::with_settings(self.settings(), url)
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        let driven = url.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!("LDAP connection to {} closed: {}", driven, e);
            }
        });
        let timeout = self.config.operation_timeout_sec.map(Duration::from_secs);
        Ok(Ldap3Session::new(ldap, url.clone(), timeout))
    }
}

#[async_trait]
impl SessionFactory for Ldap3SessionFactory {
    async fn create(&self) -> LdapResult<Box<dyn DirectorySession>> {
        let mut session = self
            .connect()
            .await
            .map_err(|e| LdapError::connection(format!("{:#}", e)))?;
        if let Some(bind) = &self.service_bind {
            if let Err(e) = self.executor.bind(&mut session, bind, &[]).await {
                warn!("Service bind to {} failed: {}", self.config.url, e);
                let _ = session.close().await;
                return Err(e);
            }
        }
        debug!("Connected to {}", self.config.url);
        Ok(Box::new(session))
    }
}

/// Builds the executor and a started session pool from configuration.
pub async fn connect(
    config: &Config,
    metrics: Option<Arc<Metrics>>,
) -> LdapResult<(OperationExecutor, ConnectionPool)> {
    let mut executor = OperationExecutor::from_config(config);
    if let Some(metrics) = &metrics {
        executor = executor.with_metrics(Arc::clone(metrics));
    }
    let factory = Ldap3SessionFactory::new(config.connection.clone(), executor.clone())?;
    let mut pool = ConnectionPool::new(Arc::new(factory), config.pool.clone());
    if let Some(metrics) = metrics {
        pool = pool.with_metrics(metrics);
    }
    pool.initialize().await?;
    pool.spawn_prune_task();
    info!("Directory client ready for {}", config.connection.url);
    Ok((executor, pool))
}
