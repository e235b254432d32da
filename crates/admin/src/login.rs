//! Credentials for remote calls

use std::fmt;

use serde::{Deserialize, Serialize};

/// Credentials handed to the node registry when resolving handles.
///
/// Opaque to plans and tasks.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginContext {
    user: Option<String>,
    token: Option<String>,
}

impl LoginContext {
    /// Login for an unsecured store
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Login with a user and session token
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            token: Some(token.into()),
        }
    }

    /// User name, if any
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Session token, if any
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl fmt::Debug for LoginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginContext")
            .field("user", &self.user)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
