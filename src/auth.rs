//! Bind authentication over pooled sessions.

use tracing::{debug, info};

use crate::control::{RequestControl, ResponseControl};
use crate::error::{LdapError, LdapResult};
use crate::executor::OperationExecutor;
use crate::pool::ConnectionPool;
use crate::request::BindRequest;
use crate::result_code::ResultCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResponse {
    pub success: bool,
    pub code: ResultCode,
    pub message: String,
    pub controls: Vec<ResponseControl>,
}

impl AuthenticationResponse {
    fn rejected(message: impl Into<String>, controls: Vec<ResponseControl>) -> Self {
        Self {
            success: false,
            code: ResultCode::InvalidCredentials,
            message: message.into(),
            controls,
        }
    }
}

/// Authenticates users by binding as them on a session checked out of the
/// pool. Sessions stay bound as the last user, so give the authenticator a
/// pool of its own.
#[derive(Debug, Clone)]
pub struct PooledBindAuthenticator {
    pool: ConnectionPool,
    executor: OperationExecutor,
}

impl PooledBindAuthenticator {
    pub fn new(pool: ConnectionPool, executor: OperationExecutor) -> Self {
        Self { pool, executor }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Binds with `request`. Wrong credentials yield an unsuccessful
    /// response; any other fault is returned as an error. The session goes
    /// back to the pool either way.
    pub async fn authenticate(
        &self,
        request: &BindRequest,
        controls: &[RequestControl],
    ) -> LdapResult<AuthenticationResponse> {
        // An empty simple password is an unauthenticated bind, which servers accept.
        if let BindRequest::Simple { dn, password } = request {
            if password.is_empty() {
                debug!("Rejecting empty password for {}", dn);
                return Ok(AuthenticationResponse::rejected("Empty password", Vec::new()));
            }
        }

        let mut conn = self.pool.checkout().await?;
        let outcome = self.executor.bind(&mut *conn, request, controls).await;
        self.pool.checkin(conn).await;

        match outcome {
            Ok(response) => {
                info!("Authenticated {}", request.target());
                Ok(AuthenticationResponse {
                    success: true,
                    code: response.code,
                    message: response.message,
                    controls: response.controls,
                })
            }
            Err(LdapError::Protocol {
                code: ResultCode::InvalidCredentials,
                message,
                controls,
                ..
            })
            | Err(LdapError::Retryable {
                code: ResultCode::InvalidCredentials,
                message,
                controls,
            }) => {
                info!("Authentication failed for {}: invalid credentials", request.target());
                Ok(AuthenticationResponse::rejected(message, controls))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn authenticate_simple(
        &self,
        dn: &str,
        password: &str,
    ) -> LdapResult<AuthenticationResponse> {
        self.authenticate(&BindRequest::simple(dn, password), &[]).await
    }
}
