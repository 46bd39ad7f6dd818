//! Instance payloads and pagination

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default page when the caller sends a value below 1
pub const DEFAULT_PAGE: i64 = 1;

/// Default page size when the caller sends a value below 1
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Longest accepted instance name
pub const MAX_NAME_LEN: usize = 48;

/// Longest accepted launch command or working directory
pub const MAX_PATH_LEN: usize = 512;

/// Identifier of an instance on one runner
pub type InstanceId = i64;

/// A managed external process tracked by a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub launch_command: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Filled in by the runner from its process table
    #[serde(default)]
    pub is_running: bool,
}

/// `AddInstance` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstance {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub launch_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl NewInstance {
    /// Check field lengths
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field
    pub fn validate(&self) -> Result<(), String> {
        let name_len = self.name.chars().count();
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(format!("name must be 1 to {MAX_NAME_LEN} characters"));
        }
        if self.launch_command.trim().is_empty() {
            return Err("launch command must not be empty".to_string());
        }
        if self.launch_command.chars().count() > MAX_PATH_LEN {
            return Err(format!("launch command longer than {MAX_PATH_LEN} characters"));
        }
        if self
            .working_directory
            .as_ref()
            .is_some_and(|dir| dir.chars().count() > MAX_PATH_LEN)
        {
            return Err(format!("working directory longer than {MAX_PATH_LEN} characters"));
        }
        Ok(())
    }
}

/// `ListInstances` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageQuery {
    #[must_use]
    pub const fn new(page: i64, page_size: i64) -> Self {
        Self { page, page_size }
    }

    /// Replace values below 1 with the defaults
    #[must_use]
    pub const fn normalized(self) -> Self {
        Self {
            page: if self.page <= 0 { DEFAULT_PAGE } else { self.page },
            page_size: if self.page_size <= 0 {
                DEFAULT_PAGE_SIZE
            } else {
                self.page_size
            },
        }
    }

    /// Row offset of the first item on this page
    ///
    /// Only meaningful on a normalized query.
    #[must_use]
    pub const fn offset(self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// `ListInstances` result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    pub total: i64,
    pub items: Vec<Instance>,
}
