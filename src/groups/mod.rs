//! Hierarchical auth groups scoped to a knowledge base.
//!
//! Groups form an arena indexed by id; `parent_id` is a plain id reference and
//! may dangle (deleting a parent does not cascade) or even form a cycle when an
//! operator edits data by hand. Every traversal therefore carries a visited set
//! and a hard depth bound instead of trusting the chain to be acyclic.

mod memory;
mod postgres;

pub use memory::MemoryGroupRepository;
pub use postgres::PgGroupRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use tracing::instrument;

/// Longest parent chain rendered into a path.
pub const MAX_PATH_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthGroup {
    pub id: i64,
    pub name: String,
    pub kb_id: String,
    pub parent_id: Option<i64>,
    /// Sibling ordering.
    pub position: f64,
    pub auth_ids: BTreeSet<i64>,
    pub user_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewAuthGroup {
    pub name: String,
    pub kb_id: String,
    pub parent_id: Option<i64>,
    pub position: f64,
    pub auth_ids: BTreeSet<i64>,
    pub user_ids: BTreeSet<String>,
}

/// Replacement values for the mutable fields of a group.
#[derive(Debug, Clone, Default)]
pub struct AuthGroupPatch {
    pub name: String,
    pub parent_id: Option<i64>,
    pub position: f64,
    pub auth_ids: BTreeSet<i64>,
    pub user_ids: BTreeSet<String>,
}

/// A group together with its derived display path.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupWithPath {
    pub group: AuthGroup,
    pub path: String,
}

impl GroupWithPath {
    fn resolve(group: &AuthGroup, index: &HashMap<i64, &AuthGroup>) -> Self {
        let path = build_path(group, index);
        let path = if path.is_empty() {
            group.name.clone()
        } else {
            path
        };
        Self {
            group: group.clone(),
            path,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("group name must not be empty")]
    EmptyName,
    #[error("auth group {0} not found")]
    NotFound(i64),
    #[error("parent group {0} not found")]
    ParentNotFound(i64),
    #[error("a group cannot be its own parent")]
    SelfParent,
    #[error("parent group {0} belongs to another knowledge base")]
    ParentInOtherKb(i64),
    #[error("group query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence for groups and their membership.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// Groups of one knowledge base ordered by `position`, then id.
    async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<AuthGroup>, GroupError>;

    async fn get(&self, id: i64) -> Result<Option<AuthGroup>, GroupError>;

    async fn insert(&self, group: NewAuthGroup) -> Result<AuthGroup, GroupError>;

    /// Returns `false` when no group has this id.
    async fn update(&self, id: i64, patch: AuthGroupPatch) -> Result<bool, GroupError>;

    /// Returns `false` when no group has this id.
    async fn delete(&self, id: i64) -> Result<bool, GroupError>;

    /// Every group listing `user_id` as a member, across knowledge bases.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<AuthGroup>, GroupError>;

    /// Make `group_ids` the user's complete membership set in one transaction.
    ///
    /// Fails with [`GroupError::NotFound`] and changes nothing when any id is
    /// unknown.
    async fn replace_user_groups(&self, user_id: &str, group_ids: &[i64])
    -> Result<(), GroupError>;
}

/// Index groups by id for path derivation.
#[must_use]
pub fn index_by_id(groups: &[AuthGroup]) -> HashMap<i64, &AuthGroup> {
    groups.iter().map(|group| (group.id, group)).collect()
}

/// Derive the display path of `group` by walking its parent chain.
///
/// Names are gathered leaf to root and rendered root first as `/A/B/C`. A group
/// whose chain stops at itself (root, dangling parent, self-parent) yields its
/// bare name. Traversal stops at a revisited id or after [`MAX_PATH_DEPTH`]
/// groups and renders the partial chain gathered so far.
#[must_use]
pub fn build_path(group: &AuthGroup, groups_by_id: &HashMap<i64, &AuthGroup>) -> String {
    let mut names: Vec<&str> = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(group);

    while let Some(node) = current {
        if names.len() >= MAX_PATH_DEPTH || !visited.insert(node.id) {
            break;
        }
        names.push(&node.name);
        current = node
            .parent_id
            .and_then(|parent_id| groups_by_id.get(&parent_id).copied());
    }

    if names.len() <= 1 {
        return group.name.clone();
    }

    names.reverse();
    format!("/{}", names.join("/"))
}

/// Group tree operations on top of a [`GroupRepository`].
#[derive(Clone)]
pub struct AuthGroupHierarchy {
    repo: Arc<dyn GroupRepository>,
}

impl std::fmt::Debug for AuthGroupHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGroupHierarchy").finish_non_exhaustive()
    }
}

impl AuthGroupHierarchy {
    #[must_use]
    pub fn new(repo: Arc<dyn GroupRepository>) -> Self {
        Self { repo }
    }

    /// # Errors
    /// Returns an error if the repository fails.
    #[instrument(skip(self))]
    pub async fn list_auth_groups(&self, kb_id: &str) -> Result<Vec<GroupWithPath>, GroupError> {
        let groups = self.repo.list_by_kb(kb_id).await?;
        let index = index_by_id(&groups);
        Ok(groups
            .iter()
            .map(|group| GroupWithPath::resolve(group, &index))
            .collect())
    }

    /// # Errors
    /// Returns [`GroupError::NotFound`] if the group does not exist.
    #[instrument(skip(self))]
    pub async fn get_auth_group(&self, id: i64) -> Result<GroupWithPath, GroupError> {
        let group = self.repo.get(id).await?.ok_or(GroupError::NotFound(id))?;
        let groups = self.repo.list_by_kb(&group.kb_id).await?;
        let index = index_by_id(&groups);
        Ok(GroupWithPath::resolve(&group, &index))
    }

    /// Create a group and return its id.
    ///
    /// # Errors
    /// Returns an error for an empty name or a parent that does not exist in
    /// the same knowledge base.
    #[instrument(skip(self, group), fields(kb_id = %group.kb_id))]
    pub async fn create_auth_group(&self, group: NewAuthGroup) -> Result<i64, GroupError> {
        if group.name.trim().is_empty() {
            return Err(GroupError::EmptyName);
        }
        if let Some(parent_id) = group.parent_id {
            self.check_parent(parent_id, &group.kb_id).await?;
        }
        let created = self.repo.insert(group).await?;
        Ok(created.id)
    }

    /// # Errors
    /// Returns [`GroupError::NotFound`] for an unknown group, and a parent
    /// error when the named parent is missing, is the group itself or lives in
    /// another knowledge base.
    #[instrument(skip(self, patch))]
    pub async fn update_auth_group(
        &self,
        id: i64,
        patch: AuthGroupPatch,
    ) -> Result<(), GroupError> {
        if patch.name.trim().is_empty() {
            return Err(GroupError::EmptyName);
        }
        let existing = self.repo.get(id).await?.ok_or(GroupError::NotFound(id))?;
        if let Some(parent_id) = patch.parent_id {
            if parent_id == id {
                return Err(GroupError::SelfParent);
            }
            self.check_parent(parent_id, &existing.kb_id).await?;
        }
        if self.repo.update(id, patch).await? {
            Ok(())
        } else {
            Err(GroupError::NotFound(id))
        }
    }

    /// Delete a group. Children keep their `parent_id` and render as roots.
    ///
    /// # Errors
    /// Returns [`GroupError::NotFound`] if the group does not exist.
    #[instrument(skip(self))]
    pub async fn delete_auth_group(&self, id: i64) -> Result<(), GroupError> {
        if self.repo.delete(id).await? {
            Ok(())
        } else {
            Err(GroupError::NotFound(id))
        }
    }

    /// Groups the user belongs to. Paths are resolved against every group of
    /// the knowledge bases involved, so ancestors the user is not a member of
    /// still show up in the path.
    ///
    /// # Errors
    /// Returns an error if the repository fails.
    #[instrument(skip(self))]
    pub async fn get_user_groups(&self, user_id: &str) -> Result<Vec<GroupWithPath>, GroupError> {
        let memberships = self.repo.list_by_user(user_id).await?;

        let kb_ids: BTreeSet<&str> = memberships
            .iter()
            .map(|group| group.kb_id.as_str())
            .collect();
        let mut kb_groups = Vec::new();
        for kb_id in kb_ids {
            kb_groups.extend(self.repo.list_by_kb(kb_id).await?);
        }
        let index = index_by_id(&kb_groups);

        Ok(memberships
            .iter()
            .map(|group| GroupWithPath::resolve(group, &index))
            .collect())
    }

    /// Replace the user's membership set atomically.
    ///
    /// # Errors
    /// Returns [`GroupError::NotFound`] if any group id is unknown.
    #[instrument(skip(self))]
    pub async fn update_user_groups(
        &self,
        user_id: &str,
        group_ids: &[i64],
    ) -> Result<(), GroupError> {
        let unique: BTreeSet<i64> = group_ids.iter().copied().collect();
        let group_ids: Vec<i64> = unique.into_iter().collect();
        self.repo.replace_user_groups(user_id, &group_ids).await
    }

    async fn check_parent(&self, parent_id: i64, kb_id: &str) -> Result<(), GroupError> {
        let parent = self
            .repo
            .get(parent_id)
            .await?
            .ok_or(GroupError::ParentNotFound(parent_id))?;
        if parent.kb_id != kb_id {
            return Err(GroupError::ParentInOtherKb(parent_id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn group(id: i64, name: &str, parent_id: Option<i64>) -> AuthGroup {
        let now = Utc::now();
        AuthGroup {
            id,
            name: name.to_string(),
            kb_id: "kb1".to_string(),
            parent_id,
            position: 0.0,
            auth_ids: BTreeSet::new(),
            user_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn new_group(name: &str, kb_id: &str, parent_id: Option<i64>) -> NewAuthGroup {
        NewAuthGroup {
            name: name.to_string(),
            kb_id: kb_id.to_string(),
            parent_id,
            ..NewAuthGroup::default()
        }
    }

    fn patch(name: &str, parent_id: Option<i64>) -> AuthGroupPatch {
        AuthGroupPatch {
            name: name.to_string(),
            parent_id,
            ..AuthGroupPatch::default()
        }
    }

    fn hierarchy() -> AuthGroupHierarchy {
        AuthGroupHierarchy::new(Arc::new(MemoryGroupRepository::new()))
    }

    #[test]
    fn path_of_three_level_chain() {
        let groups = vec![
            group(1, "A", None),
            group(2, "B", Some(1)),
            group(3, "C", Some(2)),
        ];
        let index = index_by_id(&groups);
        assert_eq!(build_path(&groups[2], &index), "/A/B/C");
        assert_eq!(build_path(&groups[1], &index), "/A/B");
    }

    #[test]
    fn root_path_is_bare_name() {
        let groups = vec![group(1, "A", None)];
        let index = index_by_id(&groups);
        assert_eq!(build_path(&groups[0], &index), "A");
    }

    #[test]
    fn dangling_parent_renders_as_root() {
        let groups = vec![group(2, "Orphan", Some(99))];
        let index = index_by_id(&groups);
        assert_eq!(build_path(&groups[0], &index), "Orphan");
    }

    #[test]
    fn self_parent_terminates() {
        let groups = vec![group(1, "Loop", Some(1))];
        let index = index_by_id(&groups);
        assert_eq!(build_path(&groups[0], &index), "Loop");
    }

    #[test]
    fn two_cycle_terminates() {
        let groups = vec![group(1, "A", Some(2)), group(2, "B", Some(1))];
        let index = index_by_id(&groups);
        assert_eq!(build_path(&groups[0], &index), "/B/A");
        assert_eq!(build_path(&groups[1], &index), "/A/B");
    }

    #[test]
    fn long_chain_is_truncated_at_depth_bound() {
        let groups: Vec<AuthGroup> = (1..=15)
            .map(|id| {
                let parent = if id == 1 { None } else { Some(id - 1) };
                group(id, &format!("g{id}"), parent)
            })
            .collect();
        let index = index_by_id(&groups);
        let path = build_path(&groups[14], &index);
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        assert_eq!(segments.len(), MAX_PATH_DEPTH);
        assert_eq!(segments.first().copied(), Some("g6"));
        assert_eq!(segments.last().copied(), Some("g15"));
    }

    #[tokio::test]
    async fn list_includes_paths() {
        let hierarchy = hierarchy();
        let root = hierarchy
            .create_auth_group(new_group("Eng", "kb1", None))
            .await
            .unwrap();
        let child = hierarchy
            .create_auth_group(new_group("Backend", "kb1", Some(root)))
            .await
            .unwrap();
        hierarchy
            .create_auth_group(new_group("Other", "kb2", None))
            .await
            .unwrap();

        let groups = hierarchy.list_auth_groups("kb1").await.unwrap();
        assert_eq!(groups.len(), 2);
        let paths: HashMap<i64, String> = groups
            .into_iter()
            .map(|item| (item.group.id, item.path))
            .collect();
        assert_eq!(paths.get(&root).map(String::as_str), Some("Eng"));
        assert_eq!(paths.get(&child).map(String::as_str), Some("/Eng/Backend"));
    }

    #[tokio::test]
    async fn create_rejects_missing_or_foreign_parent() {
        let hierarchy = hierarchy();
        let err = hierarchy
            .create_auth_group(new_group("X", "kb1", Some(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::ParentNotFound(42)));

        let other = hierarchy
            .create_auth_group(new_group("Other", "kb2", None))
            .await
            .unwrap();
        let err = hierarchy
            .create_auth_group(new_group("X", "kb1", Some(other)))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::ParentInOtherKb(id) if id == other));

        let err = hierarchy
            .create_auth_group(new_group("  ", "kb1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::EmptyName));
    }

    #[tokio::test]
    async fn update_validates_group_and_parent() {
        let hierarchy = hierarchy();
        let id = hierarchy
            .create_auth_group(new_group("A", "kb1", None))
            .await
            .unwrap();

        let err = hierarchy
            .update_auth_group(999, patch("Z", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::NotFound(999)));

        let err = hierarchy
            .update_auth_group(id, patch("A", Some(777)))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::ParentNotFound(777)));

        let err = hierarchy
            .update_auth_group(id, patch("A", Some(id)))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::SelfParent));

        hierarchy
            .update_auth_group(id, patch("Renamed", None))
            .await
            .unwrap();
        let updated = hierarchy.get_auth_group(id).await.unwrap();
        assert_eq!(updated.group.name, "Renamed");
        assert_eq!(updated.path, "Renamed");
    }

    #[tokio::test]
    async fn delete_does_not_cascade() {
        let hierarchy = hierarchy();
        let parent = hierarchy
            .create_auth_group(new_group("Parent", "kb1", None))
            .await
            .unwrap();
        let child = hierarchy
            .create_auth_group(new_group("Child", "kb1", Some(parent)))
            .await
            .unwrap();

        hierarchy.delete_auth_group(parent).await.unwrap();
        let remaining = hierarchy.list_auth_groups("kb1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].group.id, child);
        assert_eq!(remaining[0].group.parent_id, Some(parent));
        assert_eq!(remaining[0].path, "Child");

        let err = hierarchy.delete_auth_group(parent).await.unwrap_err();
        assert!(matches!(err, GroupError::NotFound(_)));
    }

    #[tokio::test]
    async fn user_groups_replace_and_resolve_full_paths() {
        let hierarchy = hierarchy();
        let root = hierarchy
            .create_auth_group(new_group("Eng", "kb1", None))
            .await
            .unwrap();
        let g1 = hierarchy
            .create_auth_group(new_group("Backend", "kb1", Some(root)))
            .await
            .unwrap();
        let g2 = hierarchy
            .create_auth_group(new_group("Docs", "kb2", None))
            .await
            .unwrap();
        let g3 = hierarchy
            .create_auth_group(new_group("Ops", "kb1", None))
            .await
            .unwrap();

        hierarchy.update_user_groups("u1", &[g3]).await.unwrap();
        hierarchy.update_user_groups("u1", &[g1, g2, g1]).await.unwrap();

        let groups = hierarchy.get_user_groups("u1").await.unwrap();
        let mut ids: Vec<i64> = groups.iter().map(|item| item.group.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![g1, g2]);
        let backend = groups.iter().find(|item| item.group.id == g1).unwrap();
        assert_eq!(backend.path, "/Eng/Backend");
    }

    #[tokio::test]
    async fn update_user_groups_with_unknown_id_changes_nothing() {
        let hierarchy = hierarchy();
        let g1 = hierarchy
            .create_auth_group(new_group("A", "kb1", None))
            .await
            .unwrap();
        hierarchy.update_user_groups("u1", &[g1]).await.unwrap();

        let err = hierarchy
            .update_user_groups("u1", &[g1, 404])
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::NotFound(404)));

        let groups = hierarchy.get_user_groups("u1").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.id, g1);
    }
}
