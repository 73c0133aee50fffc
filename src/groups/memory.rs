use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use super::{AuthGroup, AuthGroupPatch, GroupError, GroupRepository, NewAuthGroup};

#[derive(Debug, Default)]
struct Groups {
    next_id: i64,
    by_id: BTreeMap<i64, AuthGroup>,
}

/// In-process [`GroupRepository`]. Each write holds the lock for its whole
/// mutation, so readers see a membership change entirely or not at all.
#[derive(Debug, Default)]
pub struct MemoryGroupRepository {
    groups: RwLock<Groups>,
}

impl MemoryGroupRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut groups: Vec<AuthGroup>) -> Vec<AuthGroup> {
    groups.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
    groups
}

#[async_trait]
impl GroupRepository for MemoryGroupRepository {
    async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<AuthGroup>, GroupError> {
        let groups = self.groups.read().await;
        Ok(sorted(
            groups
                .by_id
                .values()
                .filter(|group| group.kb_id == kb_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get(&self, id: i64) -> Result<Option<AuthGroup>, GroupError> {
        Ok(self.groups.read().await.by_id.get(&id).cloned())
    }

    async fn insert(&self, group: NewAuthGroup) -> Result<AuthGroup, GroupError> {
        let mut groups = self.groups.write().await;
        groups.next_id += 1;
        let now = Utc::now();
        let created = AuthGroup {
            id: groups.next_id,
            name: group.name,
            kb_id: group.kb_id,
            parent_id: group.parent_id,
            position: group.position,
            auth_ids: group.auth_ids,
            user_ids: group.user_ids,
            created_at: now,
            updated_at: now,
        };
        groups.by_id.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: i64, patch: AuthGroupPatch) -> Result<bool, GroupError> {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.by_id.get_mut(&id) else {
            return Ok(false);
        };
        group.name = patch.name;
        group.parent_id = patch.parent_id;
        group.position = patch.position;
        group.auth_ids = patch.auth_ids;
        group.user_ids = patch.user_ids;
        group.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete(&self, id: i64) -> Result<bool, GroupError> {
        Ok(self.groups.write().await.by_id.remove(&id).is_some())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<AuthGroup>, GroupError> {
        let groups = self.groups.read().await;
        Ok(sorted(
            groups
                .by_id
                .values()
                .filter(|group| group.user_ids.contains(user_id))
                .cloned()
                .collect(),
        ))
    }

    async fn replace_user_groups(
        &self,
        user_id: &str,
        group_ids: &[i64],
    ) -> Result<(), GroupError> {
        let mut groups = self.groups.write().await;
        if let Some(missing) = group_ids
            .iter()
            .find(|id| !groups.by_id.contains_key(*id))
        {
            return Err(GroupError::NotFound(*missing));
        }

        let wanted: BTreeSet<i64> = group_ids.iter().copied().collect();
        let now = Utc::now();
        for group in groups.by_id.values_mut() {
            let changed = if wanted.contains(&group.id) {
                group.user_ids.insert(user_id.to_string())
            } else {
                group.user_ids.remove(user_id)
            };
            if changed {
                group.updated_at = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_group(name: &str, position: f64) -> NewAuthGroup {
        NewAuthGroup {
            name: name.to_string(),
            kb_id: "kb1".to_string(),
            position,
            ..NewAuthGroup::default()
        }
    }

    #[tokio::test]
    async fn list_orders_by_position() {
        let repo = MemoryGroupRepository::new();
        let a = repo.insert(new_group("a", 2.0)).await.unwrap();
        let b = repo.insert(new_group("b", 1.0)).await.unwrap();
        let c = repo.insert(new_group("c", 1.0)).await.unwrap();
        let ids: Vec<i64> = repo
            .list_by_kb("kb1")
            .await
            .unwrap()
            .iter()
            .map(|group| group.id)
            .collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_rows() {
        let repo = MemoryGroupRepository::new();
        assert!(!repo.update(1, AuthGroupPatch::default()).await.unwrap());
        assert!(!repo.delete(1).await.unwrap());
    }

    #[tokio::test]
    async fn readers_never_see_partial_membership() {
        let repo = Arc::new(MemoryGroupRepository::new());
        let g1 = repo.insert(new_group("g1", 0.0)).await.unwrap().id;
        let g2 = repo.insert(new_group("g2", 0.0)).await.unwrap().id;
        let g3 = repo.insert(new_group("g3", 0.0)).await.unwrap().id;
        let g4 = repo.insert(new_group("g4", 0.0)).await.unwrap().id;
        repo.replace_user_groups("u", &[g1, g2]).await.unwrap();

        let writer = {
            let repo = repo.clone();
            tokio::spawn(async move {
                for round in 0..200 {
                    let ids = if round % 2 == 0 { [g3, g4] } else { [g1, g2] };
                    repo.replace_user_groups("u", &ids).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..200 {
            let seen = repo.list_by_user("u").await.unwrap();
            assert_eq!(seen.len(), 2);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
