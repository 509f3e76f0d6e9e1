//! Operational role checks for lock and team management.

use crate::error::{MatchError, MatchResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Client,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id:   String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    /// Internal actor used by the background sweeps.
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }

    pub fn is_operational(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Operator)
    }

    /// Fails with `Forbidden` unless the actor may perform `action`.
    pub fn require_operational(&self, action: &'static str) -> MatchResult<()> {
        if self.is_operational() {
            Ok(())
        } else {
            log::warn!("access: {} ({:?}) denied '{action}'", self.id, self.role);
            Err(MatchError::Forbidden { action })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_cannot_manage_locks() {
        let err = Actor::new("c-1", Role::Client)
            .require_operational("create locks")
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        assert!(Actor::new("op", Role::Operator).require_operational("create locks").is_ok());
    }
}
