//! Request shapes and their validation
//!
//! Callers arriving through a dynamically typed surface (JSON bodies, the
//! gateway API) pass `serde_json::Value`s. Validation here is synchronous
//! and runs before any endpoint call, so a wrong-typed password is reported
//! without a network round trip. Positions in error messages are 1-based.

use common::Secret;
use endpoint::{AuthRequest, Error, PrivilegeLevel, Result};
use serde_json::{Map, Value};

/// Options for one authentication attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub user: String,
    pub password: Secret<String>,
    pub connect_string: String,
    pub privilege: PrivilegeLevel,
    pub new_password: Option<Secret<String>>,
}

impl ConnectOptions {
    pub fn new(user: impl Into<String>, password: impl Into<Secret<String>>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            connect_string: String::new(),
            privilege: PrivilegeLevel::Standard,
            new_password: None,
        }
    }

    pub fn connect_string(mut self, connect_string: impl Into<String>) -> Self {
        self.connect_string = connect_string.into();
        self
    }

    pub fn privilege(mut self, privilege: PrivilegeLevel) -> Self {
        self.privilege = privilege;
        self
    }

    /// Rotate to `new_password` as part of authentication.
    pub fn new_password(mut self, new_password: impl Into<Secret<String>>) -> Self {
        self.new_password = Some(new_password.into());
        self
    }

    /// Whether this attempt carries a replacement password.
    ///
    /// An empty replacement counts as not supplied.
    pub fn rotates(&self) -> bool {
        self.new_password.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Validate a JSON options object (parameter 1 of a connect call).
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid_parameter_type(1))?;

        let user = required_text(object, "user")?;
        let password = required_text(object, "password")?;
        let connect_string = optional_text(object, "connectString")?.unwrap_or_default();
        let privilege = match optional_text(object, "privilege")? {
            Some(level) => level.parse::<PrivilegeLevel>()?,
            None => PrivilegeLevel::Standard,
        };
        let new_password = optional_text(object, "newPassword")?;

        Ok(Self {
            user,
            password: Secret::new(password),
            connect_string,
            privilege,
            new_password: new_password.map(Secret::new),
        })
    }

    /// Wire request for this attempt. Empty replacement passwords are dropped.
    pub(crate) fn to_request(&self) -> AuthRequest {
        AuthRequest {
            user: self.user.clone(),
            password: self.password.clone(),
            connect_string: self.connect_string.clone(),
            privilege: self.privilege,
            new_password: self.new_password.clone().filter(|p| !p.is_empty()),
        }
    }
}

/// A password change requested through an open session.
#[derive(Debug, Clone)]
pub struct PasswordChange {
    pub user: String,
    pub old_password: Secret<String>,
    pub new_password: Secret<String>,
}

impl PasswordChange {
    pub fn new(
        user: impl Into<String>,
        old_password: impl Into<Secret<String>>,
        new_password: impl Into<Secret<String>>,
    ) -> Self {
        Self {
            user: user.into(),
            old_password: old_password.into(),
            new_password: new_password.into(),
        }
    }

    /// Validate positional arguments `(user, oldPassword, newPassword)`.
    ///
    /// Each must be a string; the first offending position is reported.
    /// Empty strings are well-formed and passed through unchanged.
    pub fn from_values(user: &Value, old_password: &Value, new_password: &Value) -> Result<Self> {
        let user = text_param(user, 1)?;
        let old_password = text_param(old_password, 2)?;
        let new_password = text_param(new_password, 3)?;
        if user.is_empty() {
            return Err(Error::invalid_parameter_value("user must not be empty"));
        }
        Ok(Self {
            user,
            old_password: Secret::new(old_password),
            new_password: Secret::new(new_password),
        })
    }
}

fn text_param(value: &Value, position: usize) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::invalid_parameter_type(position))
}

fn required_text(object: &Map<String, Value>, name: &str) -> Result<String> {
    optional_text(object, name)?
        .ok_or_else(|| Error::invalid_parameter_value(format!("\"{name}\" is required")))
}

fn optional_text(object: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match object.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Error::invalid_property_type(name, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint::ErrorKind;
    use serde_json::json;

    #[test]
    fn numeric_new_password_names_parameter_three() {
        let err = PasswordChange::from_values(&json!("scott"), &json!("tiger"), &json!(123))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameterType);
        assert_eq!(
            err.to_string(),
            "invalid-parameter-type: invalid type for parameter 3"
        );
    }

    #[test]
    fn first_bad_position_is_reported() {
        let err = PasswordChange::from_values(&json!(7), &json!(false), &json!(123)).unwrap_err();
        assert!(err.message().ends_with("parameter 1"));
        let err =
            PasswordChange::from_values(&json!("scott"), &json!(null), &json!("x")).unwrap_err();
        assert!(err.message().ends_with("parameter 2"));
    }

    #[test]
    fn empty_passwords_are_well_formed() {
        let change = PasswordChange::from_values(&json!("scott"), &json!(""), &json!("")).unwrap();
        assert!(change.old_password.is_empty());
        assert!(change.new_password.is_empty());
    }

    #[test]
    fn empty_user_is_a_value_error() {
        let err = PasswordChange::from_values(&json!(""), &json!("a"), &json!("b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameterValue);
    }

    #[test]
    fn connect_options_from_json() {
        let options = ConnectOptions::from_value(&json!({
            "user": "scott",
            "password": "tiger",
            "connectString": "localhost/XEPDB1",
            "privilege": "administrator",
            "newPassword": "lion"
        }))
        .unwrap();
        assert_eq!(options.user, "scott");
        assert_eq!(options.connect_string, "localhost/XEPDB1");
        assert_eq!(options.privilege, PrivilegeLevel::Administrator);
        assert!(options.rotates());
    }

    #[test]
    fn numeric_new_password_property_is_rejected() {
        let err = ConnectOptions::from_value(&json!({
            "user": "scott",
            "password": "tiger",
            "newPassword": 123
        }))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid-parameter-type: invalid type for \"newPassword\" in parameter 1"
        );
    }

    #[test]
    fn non_object_options_are_rejected() {
        let err = ConnectOptions::from_value(&json!("scott/tiger")).unwrap_err();
        assert_eq!(err.message(), "invalid type for parameter 1");
    }

    #[test]
    fn missing_password_is_a_value_error() {
        let err = ConnectOptions::from_value(&json!({ "user": "scott" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameterValue);
    }

    #[test]
    fn empty_new_password_is_not_a_rotation() {
        let options = ConnectOptions::new("scott", "tiger").new_password("");
        assert!(!options.rotates());
        assert!(options.to_request().new_password.is_none());

        let options = ConnectOptions::new("scott", "tiger").new_password("lion");
        assert!(options.to_request().new_password.is_some());
    }
}
