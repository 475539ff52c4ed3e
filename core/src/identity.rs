/// Actors and the session context passed into every messaging call
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Provider,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::Provider => write!(f, "provider"),
        }
    }
}

/// A participant as issued by the session layer. Immutable for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    pub display_name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
        }
    }

    pub fn patient(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(id, Role::Patient, display_name)
    }

    pub fn provider(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::new(id, Role::Provider, display_name)
    }
}

/// Explicit session context. An anonymous session has no actor.
#[derive(Debug, Clone, Default)]
pub struct Session {
    actor: Option<Identity>,
}

impl Session {
    pub fn authenticated(actor: Identity) -> Self {
        Self { actor: Some(actor) }
    }

    pub fn anonymous() -> Self {
        Self { actor: None }
    }

    pub fn actor(&self) -> Option<&Identity> {
        self.actor.as_ref()
    }

    /// Current actor, or `NotAuthenticated`
    pub fn require(&self) -> Result<&Identity> {
        self.actor
            .as_ref()
            .filter(|a| !a.id.trim().is_empty())
            .ok_or_else(|| ChatError::NotAuthenticated("session has no actor".to_string()))
    }
}
