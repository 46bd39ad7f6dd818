//! Action routing for authenticated control connections

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::{
    Action, AuthFrame, ERROR_INVALID_REQUEST, ERROR_UNKNOWN_ACTION, RequestFrame, ResponseFrame,
};

/// Error text when a handler's result cannot be serialized
pub const ERROR_GENERATE_RESPONSE: &str = "Failed to generate response";

/// A handler failure
///
/// `message` goes on the wire verbatim; `cause` is only logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
    cause: Option<String>,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {cause}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Typed handler for one action
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send;

    /// Wire message when the payload does not decode as `Request`
    const INVALID_PAYLOAD: &'static str;

    /// Turn the raw `data` field into a request
    ///
    /// # Errors
    ///
    /// Returns [`Self::INVALID_PAYLOAD`] when the payload has the wrong shape
    fn decode(data: Value) -> Result<Self::Request, HandlerError> {
        serde_json::from_value(data).map_err(|e| HandlerError::with_cause(Self::INVALID_PAYLOAD, e))
    }

    /// Run the action
    ///
    /// A response that serializes to `null` is sent as an empty success.
    async fn handle(&self, request: Self::Request) -> Result<Self::Response, HandlerError>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(&self, data: Value) -> Result<Option<Value>, HandlerError>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: ActionHandler> ErasedHandler for Typed<H> {
    async fn call(&self, data: Value) -> Result<Option<Value>, HandlerError> {
        let request = H::decode(data)?;
        let response = self.0.handle(request).await?;
        let value = serde_json::to_value(&response)
            .map_err(|e| HandlerError::with_cause(ERROR_GENERATE_RESPONSE, e))?;
        Ok(Some(value).filter(|v| !v.is_null()))
    }
}

/// Action → handler lookup
#[derive(Clone, Default)]
pub struct ActionTable {
    handlers: HashMap<Action, Arc<dyn ErasedHandler>>,
}

impl ActionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any previous one
    pub fn register<H: ActionHandler>(&mut self, action: Action, handler: H) -> &mut Self {
        self.handlers.insert(action, Arc::new(Typed(handler)));
        self
    }

    #[must_use]
    pub fn contains(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn ErasedHandler>> {
        Action::from_name(name).and_then(|action| self.handlers.get(&action))
    }
}

impl fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Authentication and request routing for the control socket
#[derive(Debug)]
pub struct ControlService {
    auth_token: String,
    table: ActionTable,
}

impl ControlService {
    #[must_use]
    pub fn new(auth_token: impl Into<String>, table: ActionTable) -> Self {
        Self {
            auth_token: auth_token.into(),
            table,
        }
    }

    /// Check the first frame of a connection
    ///
    /// A frame that is not a valid [`AuthFrame`] fails.
    #[must_use]
    pub fn authenticate(&self, text: &str) -> bool {
        match serde_json::from_str::<AuthFrame>(text) {
            Ok(frame) => !self.auth_token.is_empty() && frame.auth_token == self.auth_token,
            Err(e) => {
                tracing::debug!(error = %e, "malformed auth frame");
                false
            }
        }
    }

    /// Decode and answer one request frame
    ///
    /// Frames that do not decode get `Invalid request`, echoing the
    /// frame's `echo` if one can be found.
    pub async fn handle_text(&self, text: &str) -> ResponseFrame {
        match serde_json::from_str::<RequestFrame>(text) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request frame");
                let mut response = ResponseFrame::with_echo(recover_echo(text));
                response.fail(ERROR_INVALID_REQUEST);
                response
            }
        }
    }

    /// Route a request to its handler and build the response
    pub async fn handle(&self, request: RequestFrame) -> ResponseFrame {
        let mut response = ResponseFrame::reply_to(&request);

        let Some(handler) = self.table.get(&request.action) else {
            tracing::warn!(action = %request.action, echo = %request.echo, "unknown action");
            response.fail(ERROR_UNKNOWN_ACTION);
            return response;
        };

        match handler.call(request.data).await {
            Ok(data) => {
                tracing::debug!(action = %request.action, echo = %request.echo, "action handled");
                response.data = data;
            }
            Err(e) => {
                tracing::error!(
                    action = %request.action,
                    echo = %request.echo,
                    error = %e,
                    "action failed"
                );
                response.fail(e.message);
            }
        }

        response
    }
}

fn recover_echo(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| match value.get("echo") {
            Some(Value::String(echo)) => Some(echo.clone()),
            Some(Value::Number(echo)) => Some(echo.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}
