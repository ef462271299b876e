//! In-process endpoint backed by an account directory
//!
//! Models the server side of the authentication protocol: each account holds
//! a salted SHA-256 password verifier, an expiry flag and an administrator
//! grant; each authenticated session is tracked until logoff. Rotating a
//! password never terminates sessions that are already authenticated.
//!
//! A per-call latency can be configured to exercise cancellation and
//! timeout paths, and every protocol call is counted so callers can assert
//! that validation failures never reached the server.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    AuthRequest, BoxFuture, CredentialChange, Error, PrivilegeLevel, Result, ServerEndpoint,
    SessionToken,
};

/// Server-side account record.
struct Account {
    verifier: String,
    expired: bool,
    administrator: bool,
}

/// Server-side view of an authenticated session.
struct LiveSession {
    user: String,
    privilege: PrivilegeLevel,
}

/// Account directory and session table kept in memory.
pub struct MemoryEndpoint {
    accounts: Mutex<HashMap<String, Account>>,
    sessions: Mutex<HashMap<SessionToken, LiveSession>>,
    calls: AtomicU64,
    latency: Duration,
}

impl Default for MemoryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Delay every protocol call by `latency` before it is processed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Create (or replace) an account with the given password.
    pub async fn create_account(&self, user: &str, password: &str) {
        let account = Account {
            verifier: make_verifier(password),
            expired: false,
            administrator: false,
        };
        self.accounts.lock().await.insert(user.to_owned(), account);
        info!(user, "account created");
    }

    /// Allow `user` to authenticate with administrator privilege.
    pub async fn grant_administrator(&self, user: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.get_mut(user).ok_or_else(|| unknown_user(user))?;
        account.administrator = true;
        Ok(())
    }

    /// Flag the account's password as expired.
    pub async fn expire_password(&self, user: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.get_mut(user).ok_or_else(|| unknown_user(user))?;
        account.expired = true;
        info!(user, "password expired");
        Ok(())
    }

    /// Terminate every live session of `user` without touching the account.
    pub async fn kill_sessions(&self, user: &str) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.user != user);
        before - sessions.len()
    }

    pub async fn is_expired(&self, user: &str) -> Option<bool> {
        self.accounts.lock().await.get(user).map(|a| a.expired)
    }

    /// Number of sessions currently authenticated.
    pub async fn live_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of protocol calls received so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn round_trip(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    async fn do_authenticate(&self, request: &AuthRequest) -> Result<SessionToken> {
        self.round_trip().await;

        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&request.user)
            .filter(|a| verify(&a.verifier, request.password.expose()))
            .ok_or_else(Error::invalid_credentials)?;

        if request.privilege.is_privileged() && !account.administrator {
            return Err(Error::insufficient_privilege());
        }

        // An empty replacement is treated as not supplied.
        match request.new_password.as_ref().filter(|p| !p.is_empty()) {
            Some(new_password) => {
                account.verifier = make_verifier(new_password.expose());
                account.expired = false;
                info!(user = %request.user, "password rotated during authentication");
            }
            None if account.expired => return Err(Error::credential_expired()),
            None => {}
        }
        drop(accounts);

        let token = SessionToken::new(uuid::Uuid::new_v4().to_string());
        self.sessions.lock().await.insert(
            token.clone(),
            LiveSession {
                user: request.user.clone(),
                privilege: request.privilege,
            },
        );
        debug!(
            user = %request.user,
            privilege = request.privilege.label(),
            "session authenticated"
        );
        Ok(token)
    }

    async fn do_change_credential(&self, change: &CredentialChange) -> Result<()> {
        self.round_trip().await;

        let (caller_user, caller_privilege) = {
            let sessions = self.sessions.lock().await;
            let caller = sessions
                .get(&change.caller)
                .ok_or_else(Error::session_closed)?;
            (caller.user.clone(), caller.privilege)
        };

        if change.as_privileged {
            if !caller_privilege.is_privileged() {
                return Err(Error::insufficient_privilege());
            }
        } else if caller_user != change.user {
            return Err(Error::insufficient_privilege());
        }

        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&change.user)
            .ok_or_else(|| unknown_user(&change.user))?;

        if !change.as_privileged {
            let old_matches = change
                .old_password
                .as_ref()
                .is_some_and(|old| verify(&account.verifier, old.expose()));
            if !old_matches {
                return Err(Error::invalid_old_credential());
            }
        }

        if change.new_password.is_empty() {
            debug!(user = %change.user, "empty new password, credential left unchanged");
            return Ok(());
        }

        account.verifier = make_verifier(change.new_password.expose());
        account.expired = false;
        info!(
            user = %change.user,
            by = %caller_user,
            privileged = change.as_privileged,
            "password changed"
        );
        Ok(())
    }

    async fn do_ping(&self, token: &SessionToken) -> Result<()> {
        self.round_trip().await;
        if self.sessions.lock().await.contains_key(token) {
            Ok(())
        } else {
            Err(Error::session_closed())
        }
    }

    async fn do_logoff(&self, token: &SessionToken) -> Result<()> {
        self.round_trip().await;
        match self.sessions.lock().await.remove(token) {
            Some(session) => {
                debug!(user = %session.user, "session logged off");
                Ok(())
            }
            None => Err(Error::session_closed()),
        }
    }
}

impl ServerEndpoint for MemoryEndpoint {
    fn id(&self) -> &str {
        "memory"
    }

    fn authenticate<'a>(&'a self, request: &'a AuthRequest) -> BoxFuture<'a, Result<SessionToken>> {
        boxed(self.do_authenticate(request))
    }

    fn change_credential<'a>(&'a self, change: &'a CredentialChange) -> BoxFuture<'a, Result<()>> {
        boxed(self.do_change_credential(change))
    }

    fn ping<'a>(&'a self, token: &'a SessionToken) -> BoxFuture<'a, Result<()>> {
        boxed(self.do_ping(token))
    }

    fn logoff<'a>(&'a self, token: &'a SessionToken) -> BoxFuture<'a, Result<()>> {
        boxed(self.do_logoff(token))
    }
}

fn boxed<'a, T>(fut: impl Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

fn unknown_user(user: &str) -> Error {
    Error::invalid_parameter_value(format!("user \"{user}\" does not exist"))
}

/// Build a `salt$digest` verifier for a password.
fn make_verifier(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::rng().fill(&mut salt);
    format!(
        "{}${}",
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(digest(&salt, password))
    )
}

fn verify(verifier: &str, password: &str) -> bool {
    let Some((salt, expected)) = verifier.split_once('$') else {
        return false;
    };
    match STANDARD_NO_PAD.decode(salt) {
        Ok(salt) => STANDARD_NO_PAD.encode(digest(&salt, password)) == expected,
        Err(_) => false,
    }
}

fn digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}
