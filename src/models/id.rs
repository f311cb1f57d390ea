use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error(
    "Invalid id {value:?}: ids must be a single path segment (no '/', '\\\\', NUL, '.' or '..')"
)]
pub struct IdError {
    value: String,
}

/// Opaque identifier for stored entities.
///
/// For file-backed storage, ids must be safe path segments (no slashes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Id {
    /// Namespace for account ids derived from provider identifiers.
    const ACCOUNT_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b810_9dad_11d1_80b4_00c04fd430c8);
    /// Namespace for transaction ids. Distinct from the account namespace so
    /// an account and a transaction sharing an external id never collide.
    const TRANSACTION_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b811_9dad_11d1_80b4_00c04fd430c8);

    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from an arbitrary string.
    /// Note: The string must be a valid path segment (no slashes).
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Create an ID from an arbitrary string, validating that it is a safe path segment.
    pub fn from_string_checked(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if Self::is_path_safe(&value) {
            Ok(Self(value))
        } else {
            Err(IdError { value })
        }
    }

    /// Deterministic account id from (institution, provider account id).
    ///
    /// Two independent sync runs that observe the same real account converge
    /// on the same internal id even with no prior lookup hit. Inputs are
    /// trimmed and lowercased so cosmetic differences in provider payloads do
    /// not change the id.
    pub fn for_account(institution_name: &str, external_account_id: &str) -> Self {
        let key = format!(
            "{}:{}",
            institution_name.trim().to_lowercase(),
            external_account_id.trim().to_lowercase()
        );
        Self(Uuid::new_v5(&Self::ACCOUNT_NAMESPACE, key.as_bytes()).to_string())
    }

    /// Deterministic transaction id from (institution, owning account id,
    /// provider transaction id).
    pub fn for_transaction(
        institution_name: &str,
        account_id: &Id,
        external_transaction_id: &str,
    ) -> Self {
        let key = format!(
            "{}:{}:{}",
            institution_name.trim().to_lowercase(),
            account_id.as_str().trim().to_lowercase(),
            external_transaction_id.trim().to_lowercase()
        );
        Self(Uuid::new_v5(&Self::TRANSACTION_NAMESPACE, key.as_bytes()).to_string())
    }

    /// Deterministic transaction id from the provider transaction id alone.
    /// Used when institution/account context is missing.
    pub fn for_external_transaction(external_transaction_id: &str) -> Self {
        Self(
            Uuid::new_v5(
                &Self::TRANSACTION_NAMESPACE,
                external_transaction_id.trim().to_lowercase().as_bytes(),
            )
            .to_string(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the string is safe to use as a single path segment.
    pub fn is_path_safe(value: &str) -> bool {
        if value.is_empty() || value == "." || value == ".." {
            return false;
        }
        !value.chars().any(|c| c == '/' || c == '\\' || c == '\0')
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// An account id produced by the deriver.
///
/// `Stable` ids are hash-derived from business attributes and will be
/// re-derived identically by any future run. `Unstable` ids are random; the
/// entity carries a pending-backfill marker until stable attributes arrive,
/// at which point identity fields are backfilled in place. The id itself
/// never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedId {
    Stable(Id),
    Unstable(Id),
}

impl DerivedId {
    pub fn id(&self) -> &Id {
        match self {
            Self::Stable(id) | Self::Unstable(id) => id,
        }
    }

    pub fn into_id(self) -> Id {
        match self {
            Self::Stable(id) | Self::Unstable(id) => id,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable(_))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Derive an internal account id from whatever stable attributes are present.
///
/// Falls back to a random id when the institution or the provider id is
/// missing; callers must mark such records unstable-identity so the resolver
/// keeps using its exhaustive fallback for them.
pub fn derive_account_id(
    institution_name: Option<&str>,
    external_account_id: Option<&str>,
) -> DerivedId {
    match (non_blank(institution_name), non_blank(external_account_id)) {
        (Some(institution), Some(external)) => {
            DerivedId::Stable(Id::for_account(institution, external))
        }
        _ => DerivedId::Unstable(Id::new()),
    }
}

/// Derive an internal transaction id, preferring the fully-qualified key and
/// degrading to the external-id-only form when account context is missing.
pub fn derive_transaction_id(
    institution_name: Option<&str>,
    account_id: &Id,
    external_transaction_id: &str,
) -> Id {
    match non_blank(institution_name) {
        Some(institution) => Id::for_transaction(institution, account_id, external_transaction_id),
        None => Id::for_external_transaction(external_transaction_id),
    }
}
