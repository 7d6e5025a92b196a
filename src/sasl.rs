//! SASL bind request construction.
//!
//! A [`SaslMechanism`] strategy turns the configured mechanism settings plus
//! the caller's identity into the [`SaslRequest`] a backend session executes.
//! Mechanism lookup happens before any backend call, so an unsupported name
//! never reaches the server.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LdapError, LdapResult};

pub const DIGEST_MD5: &str = "DIGEST-MD5";
pub const CRAM_MD5: &str = "CRAM-MD5";
pub const GSSAPI: &str = "GSSAPI";
pub const EXTERNAL: &str = "EXTERNAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityOfProtection {
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "auth-int")]
    AuthInt,
    #[serde(rename = "auth-conf")]
    AuthConf,
}

impl QualityOfProtection {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityOfProtection::Auth => "auth",
            QualityOfProtection::AuthInt => "auth-int",
            QualityOfProtection::AuthConf => "auth-conf",
        }
    }
}

impl fmt::Display for QualityOfProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SASL settings from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslConfig {
    pub mechanism: String,
    pub authorization_id: Option<String>,
    pub realm: Option<String>,
    #[serde(default)]
    pub qop: Vec<QualityOfProtection>,
    /// GSSAPI mutual authentication.
    pub mutual_auth: Option<bool>,
}

impl SaslConfig {
    pub fn new(mechanism: impl Into<String>) -> Self {
        Self {
            mechanism: mechanism.into(),
            ..Default::default()
        }
    }
}

/// Mechanism-specific bind request handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslRequest {
    pub mechanism: &'static str,
    pub authentication_id: String,
    pub credentials: Option<Vec<u8>>,
    pub authorization_id: Option<String>,
    pub realm: Option<String>,
    pub qop: Vec<QualityOfProtection>,
    pub mutual_auth: bool,
}

pub trait SaslMechanism: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_request(
        &self,
        config: &SaslConfig,
        authentication_id: &str,
        credentials: Option<&[u8]>,
    ) -> LdapResult<SaslRequest>;
}

fn require_credentials(mechanism: &str, credentials: Option<&[u8]>) -> LdapResult<Vec<u8>> {
    credentials
        .map(<[u8]>::to_vec)
        .ok_or_else(|| LdapError::config(format!("{} bind requires a credential", mechanism)))
}

/// RFC 2831 digest challenge.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestMd5;

impl SaslMechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        DIGEST_MD5
    }

    fn build_request(
        &self,
        config: &SaslConfig,
        authentication_id: &str,
        credentials: Option<&[u8]>,
    ) -> LdapResult<SaslRequest> {
        Ok(SaslRequest {
            mechanism: DIGEST_MD5,
            authentication_id: authentication_id.to_string(),
            credentials: Some(require_credentials(DIGEST_MD5, credentials)?),
            authorization_id: config.authorization_id.clone(),
            realm: config.realm.clone(),
            qop: config.qop.clone(),
            mutual_auth: false,
        })
    }
}

/// RFC 2195 challenge-response. Carries no realm or protection layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct CramMd5;

impl SaslMechanism for CramMd5 {
    fn name(&self) -> &'static str {
        CRAM_MD5
    }

    fn build_request(
        &self,
        _config: &SaslConfig,
        authentication_id: &str,
        credentials: Option<&[u8]>,
    ) -> LdapResult<SaslRequest> {
        Ok(SaslRequest {
            mechanism: CRAM_MD5,
            authentication_id: authentication_id.to_string(),
            credentials: Some(require_credentials(CRAM_MD5, credentials)?),
            authorization_id: None,
            realm: None,
            qop: Vec::new(),
            mutual_auth: false,
        })
    }
}

/// Kerberos negotiated security. Credentials come from the ticket cache, so
/// a password is optional.
#[derive(Debug, Default, Clone, Copy)]
pub struct GssApi;

impl SaslMechanism for GssApi {
    fn name(&self) -> &'static str {
        GSSAPI
    }

    fn build_request(
        &self,
        config: &SaslConfig,
        authentication_id: &str,
        credentials: Option<&[u8]>,
    ) -> LdapResult<SaslRequest> {
        Ok(SaslRequest {
            mechanism: GSSAPI,
            authentication_id: authentication_id.to_string(),
            credentials: credentials.map(<[u8]>::to_vec),
            authorization_id: config.authorization_id.clone(),
            realm: config.realm.clone(),
            qop: config.qop.clone(),
            mutual_auth: config.mutual_auth.unwrap_or(false),
        })
    }
}

/// Mechanism strategies by upper-case name.
#[derive(Clone)]
pub struct SaslMechanisms {
    mechanisms: HashMap<String, Arc<dyn SaslMechanism>>,
}

impl fmt::Debug for SaslMechanisms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.mechanisms.keys().collect();
        names.sort();
        f.debug_struct("SaslMechanisms").field("names", &names).finish()
    }
}

impl Default for SaslMechanisms {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SaslMechanisms {
    pub fn with_defaults() -> Self {
        let mut mechanisms = Self {
            mechanisms: HashMap::new(),
        };
        mechanisms.register(Arc::new(DigestMd5));
        mechanisms.register(Arc::new(CramMd5));
        mechanisms.register(Arc::new(GssApi));
        mechanisms
    }

    pub fn register(&mut self, mechanism: Arc<dyn SaslMechanism>) {
        self.mechanisms
            .insert(mechanism.name().to_ascii_uppercase(), mechanism);
    }

    pub fn resolve(&self, name: &str) -> LdapResult<&dyn SaslMechanism> {
        let key = name.trim().to_ascii_uppercase();
        if key == EXTERNAL {
            return Err(LdapError::config("SASL EXTERNAL is not supported"));
        }
        self.mechanisms
            .get(&key)
            .map(|m| m.as_ref())
            .ok_or_else(|| {
                LdapError::config(format!("Unknown SASL authentication mechanism: {}", name))
            })
    }

    /// Resolves the configured mechanism and builds its bind request.
    pub fn build_request(
        &self,
        config: &SaslConfig,
        authentication_id: &str,
        credentials: Option<&[u8]>,
    ) -> LdapResult<SaslRequest> {
        self.resolve(&config.mechanism)?
            .build_request(config, authentication_id, credentials)
    }
}
