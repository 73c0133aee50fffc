//! `auth_groups` table storage.

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::collections::BTreeSet;
use tracing::{Instrument, info_span};

use super::{AuthGroup, AuthGroupPatch, GroupError, GroupRepository, NewAuthGroup};

const GROUP_COLUMNS: &str =
    "id, name, kb_id, parent_id, position, auth_ids, user_ids, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgGroupRepository {
    pool: PgPool,
}

impl PgGroupRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn group_from_row(row: &PgRow) -> Result<AuthGroup, sqlx::Error> {
    let auth_ids: Vec<i64> = row.try_get("auth_ids")?;
    let user_ids: Vec<String> = row.try_get("user_ids")?;
    Ok(AuthGroup {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kb_id: row.try_get("kb_id")?,
        parent_id: row.try_get("parent_id")?,
        position: row.try_get("position")?,
        auth_ids: auth_ids.into_iter().collect(),
        user_ids: user_ids.into_iter().collect(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn to_vec<T: Clone>(set: &BTreeSet<T>) -> Vec<T> {
    set.iter().cloned().collect()
}

#[async_trait]
impl GroupRepository for PgGroupRepository {
    async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<AuthGroup>, GroupError> {
        let query = format!(
            "SELECT {GROUP_COLUMNS} FROM auth_groups WHERE kb_id = $1 ORDER BY position, id"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let rows = sqlx::query(&query)
            .bind(kb_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        rows.iter()
            .map(group_from_row)
            .collect::<Result<_, _>>()
            .map_err(GroupError::from)
    }

    async fn get(&self, id: i64) -> Result<Option<AuthGroup>, GroupError> {
        let query = format!("SELECT {GROUP_COLUMNS} FROM auth_groups WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.as_ref()
            .map(group_from_row)
            .transpose()
            .map_err(GroupError::from)
    }

    async fn insert(&self, group: NewAuthGroup) -> Result<AuthGroup, GroupError> {
        let query = format!(
            r"
            INSERT INTO auth_groups (name, kb_id, parent_id, position, auth_ids, user_ids)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {GROUP_COLUMNS}
            "
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = %query
        );
        let row = sqlx::query(&query)
            .bind(&group.name)
            .bind(&group.kb_id)
            .bind(group.parent_id)
            .bind(group.position)
            .bind(to_vec(&group.auth_ids))
            .bind(to_vec(&group.user_ids))
            .fetch_one(&self.pool)
            .instrument(span)
            .await?;
        Ok(group_from_row(&row)?)
    }

    async fn update(&self, id: i64, patch: AuthGroupPatch) -> Result<bool, GroupError> {
        let query = r"
            UPDATE auth_groups
            SET name = $2,
                parent_id = $3,
                position = $4,
                auth_ids = $5,
                user_ids = $6,
                updated_at = NOW()
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(&patch.name)
            .bind(patch.parent_id)
            .bind(patch.position)
            .bind(to_vec(&patch.auth_ids))
            .bind(to_vec(&patch.user_ids))
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: i64) -> Result<bool, GroupError> {
        let query = "DELETE FROM auth_groups WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<AuthGroup>, GroupError> {
        let query = format!(
            "SELECT {GROUP_COLUMNS} FROM auth_groups WHERE $1 = ANY(user_ids) ORDER BY position, id"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        rows.iter()
            .map(group_from_row)
            .collect::<Result<_, _>>()
            .map_err(GroupError::from)
    }

    async fn replace_user_groups(
        &self,
        user_id: &str,
        group_ids: &[i64],
    ) -> Result<(), GroupError> {
        let mut tx = self.pool.begin().await?;

        // Lock the target rows first so a concurrent delete cannot slip in
        // between the existence check and the append.
        let select = "SELECT id FROM auth_groups WHERE id = ANY($1) FOR UPDATE";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = select
        );
        let rows = sqlx::query(select)
            .bind(group_ids)
            .fetch_all(&mut *tx)
            .instrument(span)
            .await?;
        let found: BTreeSet<i64> = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;
        if let Some(missing) = group_ids.iter().find(|id| !found.contains(*id)) {
            return Err(GroupError::NotFound(*missing));
        }

        let remove = r"
            UPDATE auth_groups
            SET user_ids = array_remove(user_ids, $1), updated_at = NOW()
            WHERE $1 = ANY(user_ids) AND NOT (id = ANY($2))
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = remove
        );
        sqlx::query(remove)
            .bind(user_id)
            .bind(group_ids)
            .execute(&mut *tx)
            .instrument(span)
            .await?;

        let append = r"
            UPDATE auth_groups
            SET user_ids = array_append(user_ids, $1), updated_at = NOW()
            WHERE id = ANY($2) AND NOT ($1 = ANY(user_ids))
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = append
        );
        sqlx::query(append)
            .bind(user_id)
            .bind(group_ids)
            .execute(&mut *tx)
            .instrument(span)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
