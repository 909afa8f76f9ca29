//! Family membership seam.

use std::collections::HashMap;

use async_trait::async_trait;
use carenest_core::{BackendError, FamilyId, MemberId, UserId};
use parking_lot::RwLock;
use serde::Deserialize;

/// Family membership and active-member bookkeeping.
#[async_trait]
pub trait FamilyService: Send + Sync {
    /// Users belonging to `family_id`.
    async fn get_family_members(&self, family_id: &FamilyId) -> Result<Vec<UserId>, BackendError>;

    /// Make `member_id` the profile `user_id` acts for.
    async fn switch_active_member(
        &self,
        user_id: &UserId,
        member_id: &MemberId,
    ) -> Result<(), BackendError>;
}

/// One family in an [`InMemoryFamilyService`] directory.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FamilyRecord {
    /// Users with accounts in this family.
    #[serde(default)]
    pub users: Vec<UserId>,
    /// Member profiles users may act for.
    #[serde(default)]
    pub members: Vec<MemberId>,
}

#[derive(Debug, Default, Deserialize)]
struct Directory {
    #[serde(default)]
    families: HashMap<FamilyId, FamilyRecord>,
}

/// Family directory held in memory.
///
/// ```json
/// { "families": { "f1": { "users": ["u1", "u2"], "members": ["m1", "m2"] } } }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryFamilyService {
    families: RwLock<HashMap<FamilyId, FamilyRecord>>,
    active: RwLock<HashMap<UserId, MemberId>>,
}

impl InMemoryFamilyService {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory parsed from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let directory: Directory = serde_json::from_str(json)?;
        Ok(Self {
            families: RwLock::new(directory.families),
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Add or replace a family.
    pub fn insert_family(&self, family_id: FamilyId, record: FamilyRecord) {
        let _ = self.families.write().insert(family_id, record);
    }

    /// Member profile a user currently acts for.
    pub fn active_member(&self, user_id: &UserId) -> Option<MemberId> {
        self.active.read().get(user_id).cloned()
    }

    /// Number of families.
    pub fn family_count(&self) -> usize {
        self.families.read().len()
    }
}

#[async_trait]
impl FamilyService for InMemoryFamilyService {
    async fn get_family_members(&self, family_id: &FamilyId) -> Result<Vec<UserId>, BackendError> {
        self.families
            .read()
            .get(family_id)
            .map(|f| f.users.clone())
            .ok_or_else(|| BackendError::Family(format!("unknown family {family_id}")))
    }

    async fn switch_active_member(
        &self,
        user_id: &UserId,
        member_id: &MemberId,
    ) -> Result<(), BackendError> {
        let allowed = self
            .families
            .read()
            .values()
            .any(|f| f.users.contains(user_id) && f.members.contains(member_id));
        if !allowed {
            return Err(BackendError::Rejected(format!(
                "member {member_id} is not in any family of {user_id}"
            )));
        }
        let _ = self
            .active
            .write()
            .insert(user_id.clone(), member_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const DIRECTORY: &str = r#"{
        "families": {
            "f1": { "users": ["u1", "u2"], "members": ["m1", "m2"] },
            "f2": { "users": ["u3"] }
        }
    }"#;

    #[tokio::test]
    async fn members_of_known_family() {
        let svc = InMemoryFamilyService::from_json(DIRECTORY).unwrap();
        assert_eq!(svc.family_count(), 2);
        let members = svc.get_family_members(&"f1".into()).await.unwrap();
        assert_eq!(members, vec![UserId::from("u1"), UserId::from("u2")]);
    }

    #[tokio::test]
    async fn unknown_family_is_an_error() {
        let svc = InMemoryFamilyService::from_json(DIRECTORY).unwrap();
        assert_matches!(
            svc.get_family_members(&"nope".into()).await,
            Err(BackendError::Family(_))
        );
    }

    #[tokio::test]
    async fn switch_to_family_member() {
        let svc = InMemoryFamilyService::from_json(DIRECTORY).unwrap();
        svc.switch_active_member(&"u2".into(), &"m1".into())
            .await
            .unwrap();
        assert_eq!(svc.active_member(&"u2".into()).as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn switch_outside_family_is_rejected() {
        let svc = InMemoryFamilyService::from_json(DIRECTORY).unwrap();
        assert_matches!(
            svc.switch_active_member(&"u3".into(), &"m1".into()).await,
            Err(BackendError::Rejected(_))
        );
        assert!(svc.active_member(&"u3".into()).is_none());
    }

    #[tokio::test]
    async fn insert_family_at_runtime() {
        let svc = InMemoryFamilyService::new();
        svc.insert_family(
            "f9".into(),
            FamilyRecord {
                users: vec!["u9".into()],
                members: vec![],
            },
        );
        assert_eq!(svc.get_family_members(&"f9".into()).await.unwrap().len(), 1);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(InMemoryFamilyService::from_json("{").is_err());
    }
}
