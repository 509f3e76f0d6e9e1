use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Forbidden: role may not {action}")]
    Forbidden { action: &'static str },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capacity and identity violations surfaced synchronously to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    CapacityExceeded { slot_id: String, headroom: i64 },
    ProviderAlreadyLocked { provider_id: String },
    ProviderAlreadyAssigned { provider_id: String },
    DuplicateMember { provider_id: String },
    InsufficientMembers { required: u32, eligible: u32 },
    ProviderNotEligible { provider_id: String },
}

impl ConflictKind {
    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::CapacityExceeded { .. }        => "CAPACITY_EXCEEDED",
            ConflictKind::ProviderAlreadyLocked { .. }   => "PROVIDER_ALREADY_LOCKED",
            ConflictKind::ProviderAlreadyAssigned { .. } => "PROVIDER_ALREADY_ASSIGNED",
            ConflictKind::DuplicateMember { .. }         => "DUPLICATE_MEMBER",
            ConflictKind::InsufficientMembers { .. }     => "INSUFFICIENT_MEMBERS",
            ConflictKind::ProviderNotEligible { .. }     => "PROVIDER_NOT_ELIGIBLE",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::CapacityExceeded { slot_id, headroom } => {
                write!(f, "{} on slot {slot_id} (headroom {headroom})", self.code())
            }
            ConflictKind::ProviderAlreadyLocked { provider_id }
            | ConflictKind::ProviderAlreadyAssigned { provider_id }
            | ConflictKind::DuplicateMember { provider_id }
            | ConflictKind::ProviderNotEligible { provider_id } => {
                write!(f, "{} ({provider_id})", self.code())
            }
            ConflictKind::InsufficientMembers { required, eligible } => {
                write!(f, "{}: {eligible} eligible, {required} required", self.code())
            }
        }
    }
}

impl MatchError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        MatchError::NotFound { entity, id: id.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MatchError::Validation(msg.into())
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            MatchError::Database(_)      => "DATABASE",
            MatchError::Serialization(_) => "SERIALIZATION",
            MatchError::NotFound { .. }  => "NOT_FOUND",
            MatchError::Validation(_)    => "VALIDATION",
            MatchError::Conflict(kind)   => kind.code(),
            MatchError::Forbidden { .. } => "FORBIDDEN",
            MatchError::Other(_)         => "INTERNAL",
        }
    }

    pub fn conflict(&self) -> Option<&ConflictKind> {
        match self {
            MatchError::Conflict(kind) => Some(kind),
            _ => None,
        }
    }
}

pub type MatchResult<T> = Result<T, MatchError>;
