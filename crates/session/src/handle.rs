//! One authenticated session
//!
//! A `SessionHandle` is created only by a successful authentication and is
//! bound to one identity for its whole life. Its privilege level is a
//! capability flag that selects the rotation policy; there is no separate
//! administrator session type.
//!
//! State transitions:
//! - Connecting → Active (authenticated)
//! - Connecting → Expired (server reported the password expired)
//! - Connecting → Failed (any other authentication error)
//! - Active → Closed (explicit close, or the server no longer knows the session)

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use endpoint::{Error, ErrorKind, PrivilegeLevel, Result, ServerEndpoint, SessionToken};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::params::{ConnectOptions, PasswordChange};
use crate::rotator::{CredentialRotator, RotationPolicy};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Expired,
    Failed,
    Closed,
}

impl SessionState {
    /// Terminal state reached by a failed authentication.
    fn after_failure(error: &Error) -> Self {
        if error.kind() == ErrorKind::CredentialExpired {
            SessionState::Expired
        } else {
            SessionState::Failed
        }
    }
}

/// Client-side session identifier, distinct from the server token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// A live authenticated connection to the endpoint.
pub struct SessionHandle {
    id: SessionId,
    user: String,
    privilege: PrivilegeLevel,
    token: SessionToken,
    state: SessionState,
    created_at: Instant,
    last_used_at: Instant,
    rotator: CredentialRotator,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("privilege", &self.privilege)
            .field("state", &self.state)
            .field("age", &self.created_at.elapsed())
            .field("idle", &self.last_used_at.elapsed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Authenticate a new session.
    ///
    /// With a non-empty `options.new_password` the password is rotated in the
    /// same exchange and the session is authenticated under the new value.
    /// No handle exists unless the whole exchange succeeded.
    pub async fn connect(
        endpoint: Arc<dyn ServerEndpoint>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let id = SessionId::new();
        debug!(
            session_id = %id,
            user = %options.user,
            privilege = options.privilege.label(),
            state = ?SessionState::Connecting,
            "authenticating session"
        );

        let rotator = CredentialRotator::new(endpoint);
        match rotator.authenticate(options).await {
            Ok(token) => {
                let now = Instant::now();
                debug!(session_id = %id, user = %options.user, "session active");
                Ok(Self {
                    id,
                    user: options.user.clone(),
                    privilege: options.privilege,
                    token,
                    state: SessionState::Active,
                    created_at: now,
                    last_used_at: now,
                    rotator,
                })
            }
            Err(e) => {
                warn!(
                    session_id = %id,
                    user = %options.user,
                    state = ?SessionState::after_failure(&e),
                    error = %e,
                    "authentication failed"
                );
                Err(e)
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Account this session is authenticated as.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Check with the server that the session is still alive.
    ///
    /// A `SessionClosed` answer moves the handle to `Closed`.
    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_active()?;
        let result = self.rotator.endpoint().ping(&self.token).await;
        match &result {
            Ok(()) => self.touch(),
            Err(e) if e.kind() == ErrorKind::SessionClosed => {
                debug!(session_id = %self.id, "session gone on server");
                self.state = SessionState::Closed;
            }
            Err(_) => {}
        }
        result
    }

    /// Change a password through this session.
    ///
    /// Standard sessions use the self-service policy, administrator sessions
    /// the privileged one. Other sessions of the same account stay valid.
    pub async fn change_password(&mut self, change: &PasswordChange) -> Result<RotationPolicy> {
        self.ensure_active()?;
        let policy = self
            .rotator
            .change_password(&self.token, self.privilege, change)
            .await?;
        self.touch();
        Ok(policy)
    }

    /// Log the session off. The handle is consumed either way.
    pub async fn close(mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = SessionState::Closed;
        let result = self.rotator.endpoint().logoff(&self.token).await;
        debug!(session_id = %self.id, user = %self.user, ok = result.is_ok(), "session closed");
        result
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::session_closed())
        }
    }

    fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}

impl Drop for SessionHandle {
    /// Sessions dropped while active are logged off in the background.
    fn drop(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        self.state = SessionState::Closed;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.id, "session dropped outside a runtime, not logged off");
            return;
        };
        let endpoint = Arc::clone(self.rotator.endpoint());
        let token = self.token.clone();
        let id = self.id;
        runtime.spawn(async move {
            if let Err(e) = endpoint.logoff(&token).await {
                debug!(session_id = %id, error = %e, "background logoff failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint::MemoryEndpoint;
    use serde_json::json;

    async fn endpoint() -> Arc<MemoryEndpoint> {
        let endpoint = Arc::new(MemoryEndpoint::new());
        endpoint.create_account("scott", "tiger").await;
        endpoint.create_account("sys", "manager").await;
        endpoint.grant_administrator("sys").await.unwrap();
        endpoint
    }

    async fn connect(
        endpoint: &Arc<MemoryEndpoint>,
        user: &str,
        password: &str,
    ) -> Result<SessionHandle> {
        SessionHandle::connect(endpoint.clone(), &ConnectOptions::new(user, password)).await
    }

    async fn admin(endpoint: &Arc<MemoryEndpoint>) -> SessionHandle {
        SessionHandle::connect(
            endpoint.clone(),
            &ConnectOptions::new("sys", "manager").privilege(PrivilegeLevel::Administrator),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn self_service_rotation_switches_credentials() {
        let endpoint = endpoint().await;
        let mut session = connect(&endpoint, "scott", "tiger").await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        session
            .change_password(&PasswordChange::new("scott", "tiger", "secret"))
            .await
            .unwrap();
        session.close().await.unwrap();

        let err = connect(&endpoint, "scott", "tiger").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        let mut session = connect(&endpoint, "scott", "secret").await.unwrap();

        // Restore
        session
            .change_password(&PasswordChange::new("scott", "secret", "tiger"))
            .await
            .unwrap();
        session.close().await.unwrap();
        assert!(connect(&endpoint, "scott", "tiger").await.is_ok());
    }

    #[tokio::test]
    async fn wrong_old_password_leaves_credential_unchanged() {
        let endpoint = endpoint().await;
        let mut session = connect(&endpoint, "scott", "tiger").await.unwrap();

        let err = session
            .change_password(&PasswordChange::new("scott", "wrongOne", "secret"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOldCredential);
        assert!(err.to_string().starts_with("invalid-old-credential: "));

        let err = connect(&endpoint, "scott", "secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert!(session.is_active(), "failed change must not close the session");
    }

    #[tokio::test]
    async fn administrator_ignores_old_password() {
        let endpoint = endpoint().await;
        let mut sys = admin(&endpoint).await;

        for old in ["", "foobar"] {
            let policy = sys
                .change_password(&PasswordChange::new("scott", old, "secret"))
                .await
                .unwrap();
            assert_eq!(policy, RotationPolicy::Privileged);

            let err = connect(&endpoint, "scott", "tiger").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
            assert!(connect(&endpoint, "scott", "secret").await.is_ok());

            sys.change_password(&PasswordChange::new("scott", "", "tiger"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn standard_session_cannot_change_other_account() {
        let endpoint = endpoint().await;
        endpoint.create_account("adams", "wood").await;
        let mut other = connect(&endpoint, "adams", "wood").await.unwrap();

        let err = other
            .change_password(&PasswordChange::new("scott", "tiger", "secret"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientPrivilege);
        assert!(connect(&endpoint, "scott", "tiger").await.is_ok());
        let err = connect(&endpoint, "scott", "secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
    }

    #[tokio::test]
    async fn expired_password_gate() {
        let endpoint = endpoint().await;
        endpoint.expire_password("scott").await.unwrap();

        let err = connect(&endpoint, "scott", "tiger").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialExpired);
        assert_eq!(endpoint.live_sessions().await, 0);

        let session = SessionHandle::connect(
            endpoint.clone(),
            &ConnectOptions::new("scott", "tiger").new_password("secret"),
        )
        .await
        .unwrap();
        assert!(session.is_active());
        session.close().await.unwrap();

        assert_eq!(
            connect(&endpoint, "scott", "tiger").await.unwrap_err().kind(),
            ErrorKind::InvalidCredentials
        );
        assert!(connect(&endpoint, "scott", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn empty_new_password_keeps_account_expired() {
        let endpoint = endpoint().await;
        endpoint.expire_password("scott").await.unwrap();

        let err = SessionHandle::connect(
            endpoint.clone(),
            &ConnectOptions::new("scott", "tiger").new_password(""),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialExpired);

        let err = connect(&endpoint, "scott", "tiger").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialExpired);
        assert_eq!(endpoint.is_expired("scott").await, Some(true));
    }

    #[tokio::test]
    async fn invalid_new_password_type_never_reaches_server() {
        let endpoint = endpoint().await;
        let mut session = connect(&endpoint, "scott", "tiger").await.unwrap();
        let calls = endpoint.call_count();

        let err = PasswordChange::from_values(&json!("scott"), &json!("tiger"), &json!(123))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameterType);

        let err = ConnectOptions::from_value(&json!({
            "user": "scott",
            "password": "tiger",
            "newPassword": 123
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameterType);

        assert_eq!(endpoint.call_count(), calls, "validation must not do I/O");
        assert!(session.ping().await.is_ok());
    }

    #[tokio::test]
    async fn existing_sessions_survive_rotation() {
        let endpoint = endpoint().await;
        let mut first = connect(&endpoint, "scott", "tiger").await.unwrap();
        let mut second = connect(&endpoint, "scott", "tiger").await.unwrap();

        first
            .change_password(&PasswordChange::new("scott", "tiger", "secret"))
            .await
            .unwrap();
        assert!(second.ping().await.is_ok());
    }

    #[tokio::test]
    async fn killed_session_becomes_closed() {
        let endpoint = endpoint().await;
        let mut session = connect(&endpoint, "scott", "tiger").await.unwrap();
        endpoint.kill_sessions("scott").await;

        let err = session.ping().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .change_password(&PasswordChange::new("scott", "tiger", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[tokio::test]
    async fn dropped_session_is_logged_off() {
        let endpoint = endpoint().await;
        let session = connect(&endpoint, "scott", "tiger").await.unwrap();
        assert_eq!(endpoint.live_sessions().await, 1);
        drop(session);

        for _ in 0..50 {
            if endpoint.live_sessions().await == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped session was never logged off");
    }

    #[test]
    fn failure_state_classification() {
        assert_eq!(
            SessionState::after_failure(&Error::credential_expired()),
            SessionState::Expired
        );
        assert_eq!(
            SessionState::after_failure(&Error::invalid_credentials()),
            SessionState::Failed
        );
    }
}
