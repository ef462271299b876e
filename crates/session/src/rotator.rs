//! Password change protocol
//!
//! Three legitimacy policies decide what the server is asked to do:
//! - `SelfService`: a standard session changes its own password and must
//!   present the current one; the server checks it
//! - `Privileged`: an administrator session resets any account; the old
//!   password is never sent, so a wrong or empty value still succeeds
//! - `ExpiredForced`: authentication carries a replacement password and the
//!   server rotates it in the same exchange
//!
//! Failures are returned exactly as the endpoint reported them and are never
//! retried.

use std::sync::Arc;

use endpoint::{CredentialChange, PrivilegeLevel, Result, ServerEndpoint, SessionToken};
use tracing::{info, warn};

use crate::params::{ConnectOptions, PasswordChange};

/// Which rule authorized a credential change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    SelfService,
    Privileged,
    ExpiredForced,
}

impl RotationPolicy {
    /// Policy label for metrics/logging.
    pub fn label(&self) -> &'static str {
        match self {
            RotationPolicy::SelfService => "self_service",
            RotationPolicy::Privileged => "privileged",
            RotationPolicy::ExpiredForced => "expired_forced",
        }
    }
}

/// Issues authentication and credential-change requests to an endpoint.
#[derive(Clone)]
pub struct CredentialRotator {
    endpoint: Arc<dyn ServerEndpoint>,
}

impl CredentialRotator {
    pub fn new(endpoint: Arc<dyn ServerEndpoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<dyn ServerEndpoint> {
        &self.endpoint
    }

    /// Policy a session with `privilege` uses for `change_password`.
    pub fn policy_for(privilege: PrivilegeLevel) -> RotationPolicy {
        if privilege.is_privileged() {
            RotationPolicy::Privileged
        } else {
            RotationPolicy::SelfService
        }
    }

    /// Change `change.user`'s password on behalf of the session `caller`.
    ///
    /// Returns the policy that was applied. The endpoint decides whether a
    /// standard caller may touch the target account.
    pub async fn change_password(
        &self,
        caller: &SessionToken,
        privilege: PrivilegeLevel,
        change: &PasswordChange,
    ) -> Result<RotationPolicy> {
        let policy = Self::policy_for(privilege);
        let request = CredentialChange {
            caller: caller.clone(),
            user: change.user.clone(),
            old_password: match policy {
                RotationPolicy::Privileged => None,
                _ => Some(change.old_password.clone()),
            },
            new_password: change.new_password.clone(),
            as_privileged: policy == RotationPolicy::Privileged,
        };

        let result = self.endpoint.change_credential(&request).await;
        record(policy, &result);
        match &result {
            Ok(()) => info!(user = %change.user, policy = policy.label(), "password changed"),
            Err(e) => warn!(
                user = %change.user,
                policy = policy.label(),
                error = %e,
                "password change rejected"
            ),
        }
        result.map(|()| policy)
    }

    /// Authenticate, rotating the password first when the options carry a
    /// non-empty replacement.
    ///
    /// A rotating attempt is a single exchange: success yields a session under
    /// the new password, any failure leaves nothing behind.
    pub async fn authenticate(&self, options: &ConnectOptions) -> Result<SessionToken> {
        let request = options.to_request();
        let result = self.endpoint.authenticate(&request).await;
        if request.new_password.is_some() {
            record(RotationPolicy::ExpiredForced, &result);
            if result.is_ok() {
                info!(user = %options.user, "password rotated at authentication");
            }
        }
        result
    }
}

fn record<T>(policy: RotationPolicy, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().code(),
    };
    metrics::counter!(
        "credential_rotations_total",
        "policy" => policy.label(),
        "outcome" => outcome
    )
    .increment(1);
}
