use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

const MAX_TENANT_ID_LEN: usize = 128;

/// Tenant identifier. Only constructible through [`TenantId::parse`], so every scoped
/// operation that holds one has already rejected a missing or malformed id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let value = raw.as_ref().trim();
        if value.is_empty() {
            return Err(DomainError::MissingTenantId);
        }
        if value.len() > MAX_TENANT_ID_LEN
            || !value.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        {
            return Err(DomainError::InvariantViolation(format!(
                "tenant id must be 1..={MAX_TENANT_ID_LEN} chars of [A-Za-z0-9._-]"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::TenantId;
    use crate::errors::DomainError;

    #[test]
    fn blank_tenant_ids_are_rejected_as_missing() {
        assert_eq!(TenantId::parse(""), Err(DomainError::MissingTenantId));
        assert_eq!(TenantId::parse("   "), Err(DomainError::MissingTenantId));
    }

    #[test]
    fn tenant_ids_with_sql_or_path_characters_are_rejected() {
        assert!(TenantId::parse("tenant' OR '1'='1").is_err());
        assert!(TenantId::parse("../other-tenant").is_err());
    }

    #[test]
    fn deserialization_goes_through_validation() {
        let parsed: Result<TenantId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());

        let parsed: TenantId = serde_json::from_str("\"tenant_a\"").expect("valid tenant id");
        assert_eq!(parsed.as_str(), "tenant_a");
    }
}
