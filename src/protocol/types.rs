//! Frame shapes exchanged over the control socket

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ERROR_AUTHENTICATION_FAILED, STATUS_AUTHENTICATED};

/// First frame a panel sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub auth_token: String,
}

impl AuthFrame {
    /// Build an auth frame carrying the given token
    #[must_use]
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
        }
    }
}

/// Runner reply to an [`AuthFrame`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthReply {
    /// Reply sent when the token matched
    #[must_use]
    pub fn authenticated() -> Self {
        Self {
            status: Some(STATUS_AUTHENTICATED.to_string()),
            error: None,
        }
    }

    /// Reply sent right before the runner drops the connection
    #[must_use]
    pub fn failed() -> Self {
        Self {
            status: None,
            error: Some(ERROR_AUTHENTICATION_FAILED.to_string()),
        }
    }

    /// The failure message, if the reply carries a non-empty error
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

/// An action invocation from the panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub action: String,
    #[serde(default)]
    pub data: Value,
    pub echo: String,
}

/// The runner's answer to a [`RequestFrame`]
///
/// At most one of `data` / `error` is meaningful; neither means empty success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub echo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    /// Empty response pre-populated with the request's echo
    #[must_use]
    pub fn reply_to(request: &RequestFrame) -> Self {
        Self::with_echo(request.echo.clone())
    }

    /// Empty response carrying the given echo
    #[must_use]
    pub fn with_echo(echo: impl Into<String>) -> Self {
        Self {
            echo: echo.into(),
            data: None,
            error: None,
        }
    }

    /// Set the error field, clearing any data
    pub fn fail(&mut self, message: impl Into<String>) {
        self.data = None;
        self.error = Some(message.into());
    }

    /// Split into the payload or the remote error message
    ///
    /// # Errors
    ///
    /// Returns the error text when the frame carries a non-empty `error`
    pub fn into_result(self) -> std::result::Result<Option<Value>, String> {
        match self.error {
            Some(error) if !error.is_empty() => Err(error),
            _ => Ok(self.data.filter(|d| !d.is_null())),
        }
    }
}
