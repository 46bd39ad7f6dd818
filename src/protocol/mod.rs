//! Runner control protocol wire model
//!
//! Every frame is one JSON object in a UTF-8 WebSocket text message.
//!
//! ```json
//! // Panel -> Runner, first frame
//! {"authToken": "secret"}
//! // Runner -> Panel
//! {"status": "Authenticated"}            // or {"error": "Authentication failed"}
//!
//! // Panel -> Runner
//! {"action": "ListInstances", "data": {"page": 1, "pageSize": 10}, "echo": "4211"}
//! // Runner -> Panel
//! {"echo": "4211", "data": {"total": 1, "items": [...]}}
//! ```

pub mod action;
pub mod instance;
pub mod types;

pub use action::Action;
pub use instance::{
    DEFAULT_PAGE, DEFAULT_PAGE_SIZE, Instance, InstanceId, NewInstance, PageQuery, PageResult,
};
pub use types::{AuthFrame, AuthReply, RequestFrame, ResponseFrame};

/// Path the runner serves its control socket on
pub const CONTROL_SOCKET_PATH: &str = "/lcsm-node.socket";

/// Status value of a successful auth reply
pub const STATUS_AUTHENTICATED: &str = "Authenticated";

/// Error text of a failed auth reply
pub const ERROR_AUTHENTICATION_FAILED: &str = "Authentication failed";

/// Error text for an action name with no handler
pub const ERROR_UNKNOWN_ACTION: &str = "Unknown action";

/// Error text for a request frame that could not be decoded
pub const ERROR_INVALID_REQUEST: &str = "Invalid request";
