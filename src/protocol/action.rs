//! Action vocabulary shared by panel and runner

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of actions a runner serves
///
/// Names are case-sensitive and matched exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    ListInstances,
    AddInstance,
    StartInstance,
    StopInstance,
    KillInstance,
    DeleteInstance,
}

impl Action {
    /// Every action in catalog order
    pub const ALL: [Self; 6] = [
        Self::ListInstances,
        Self::AddInstance,
        Self::StartInstance,
        Self::StopInstance,
        Self::KillInstance,
        Self::DeleteInstance,
    ];

    /// Wire name of the action
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ListInstances => "ListInstances",
            Self::AddInstance => "AddInstance",
            Self::StartInstance => "StartInstance",
            Self::StopInstance => "StopInstance",
            Self::KillInstance => "KillInstance",
            Self::DeleteInstance => "DeleteInstance",
        }
    }

    /// Look up an action by its wire name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.name() == name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
