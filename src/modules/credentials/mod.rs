//! Account identities.

use serde::{Deserialize, Serialize};

use super::rotation::PooledResource;

fn default_eligible() -> bool {
    true
}

/// A distinct account. Auth material stays with the discussion client; the
/// engine only ever sees the identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(default = "default_eligible")]
    pub rotation_eligible: bool,
}

impl Credential {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rotation_eligible: true,
        }
    }

    pub fn ineligible(mut self) -> Self {
        self.rotation_eligible = false;
        self
    }
}

impl PooledResource for Credential {
    fn resource_id(&self) -> String {
        self.id.clone()
    }

    fn selectable(&self) -> bool {
        self.rotation_eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::rotation::{PoolConfig, PoolError, ResourcePool, RotationStrategy};

    #[test]
    fn ineligible_accounts_are_never_selected() {
        let pool = ResourcePool::new(
            "credential",
            vec![Credential::new("main").ineligible(), Credential::new("alt")],
            PoolConfig::default(),
        )
        .unwrap();
        for _ in 0..5 {
            assert_eq!(pool.select(RotationStrategy::RoundRobin).unwrap().resource_id, "alt");
        }
    }

    #[test]
    fn pool_without_eligible_accounts_is_rejected() {
        let err = ResourcePool::new(
            "credential",
            vec![Credential::new("main").ineligible()],
            PoolConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[test]
    fn eligibility_defaults_to_true() {
        let credential: Credential = serde_json::from_str(r#"{"id": "u1"}"#).unwrap();
        assert!(credential.rotation_eligible);
    }
}
