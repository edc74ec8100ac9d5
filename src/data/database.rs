//! SQLite database operations
//!
//! All database access goes through this module.
//! Multi-statement effects run inside `BEGIN IMMEDIATE` so that a dedupe
//! receipt and the effect it guards become visible together or not at all.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Atomic effects
    // =========================================================================

    /// Apply a batch of mutations atomically.
    ///
    /// When `receipt` is given it is inserted first; if a receipt for the same
    /// (activity, recipient) already exists nothing is applied and `false` is
    /// returned. Otherwise every mutation is applied and `true` is returned.
    ///
    /// The transaction runs on its own task. Dropping the returned future
    /// (a client disconnect) neither cancels nor rolls back the batch, and the
    /// connection never returns to the pool with the write lock held.
    pub async fn commit(
        &self,
        receipt: Option<&ProcessedActivity>,
        mutations: &[Mutation],
    ) -> Result<bool, AppError> {
        let pool = self.pool.clone();
        let receipt = receipt.cloned();
        let mutations = mutations.to_vec();

        tokio::spawn(async move { commit_batch(&pool, receipt.as_ref(), &mutations).await })
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("commit task failed: {}", e)))?
    }

    /// Whether an inbound activity has already been applied for a recipient
    pub async fn is_processed(&self, activity_id: &str, recipient: &str) -> Result<bool, AppError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM processed_activities WHERE activity_id = ? AND recipient = ?",
        )
        .bind(activity_id)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn count_processed(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_activities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Local actors
    // =========================================================================

    /// Insert a local actor unless the handle is taken
    pub async fn insert_local_actor(&self, actor: &LocalActor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO local_actors (
                id, handle, display_name, bio, avatar_url,
                private_key_pem, public_key_pem, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.handle)
        .bind(&actor.display_name)
        .bind(&actor.bio)
        .bind(&actor.avatar_url)
        .bind(&actor.private_key_pem)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .bind(actor.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a local actor by handle, tombstoned or not
    pub async fn get_local_actor(&self, handle: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>("SELECT * FROM local_actors WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn update_local_actor_profile(
        &self,
        handle: &str,
        display_name: &str,
        bio: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE local_actors
            SET display_name = ?, bio = ?, avatar_url = ?, updated_at = ?
            WHERE handle = ? AND deleted_at IS NULL
            "#,
        )
        .bind(display_name)
        .bind(bio)
        .bind(avatar_url)
        .bind(Utc::now())
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete a local actor; pending deliveries it sent become orphans
    pub async fn tombstone_local_actor(&self, handle: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE local_actors SET deleted_at = ? WHERE handle = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_local_actors(&self) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM local_actors WHERE deleted_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // =========================================================================
    // Remote actors
    // =========================================================================

    /// Insert or refresh a cached remote actor
    pub async fn upsert_remote_actor(&self, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_actors (
                iri, handle, display_name, bio, avatar_url, inbox, outbox,
                followers, following, shared_inbox, public_key_id, public_key_pem,
                fetched_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(iri) DO UPDATE SET
                handle = excluded.handle,
                display_name = excluded.display_name,
                bio = excluded.bio,
                avatar_url = excluded.avatar_url,
                inbox = excluded.inbox,
                outbox = excluded.outbox,
                followers = excluded.followers,
                following = excluded.following,
                shared_inbox = excluded.shared_inbox,
                public_key_id = excluded.public_key_id,
                public_key_pem = excluded.public_key_pem,
                fetched_at = excluded.fetched_at,
                deleted_at = NULL
            "#,
        )
        .bind(&actor.iri)
        .bind(&actor.handle)
        .bind(&actor.display_name)
        .bind(&actor.bio)
        .bind(&actor.avatar_url)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.followers)
        .bind(&actor.following)
        .bind(&actor.shared_inbox)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(actor.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_remote_actor(&self, iri: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_remote_actor_by_key_id(
        &self,
        key_id: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>(
            "SELECT * FROM remote_actors WHERE public_key_id = ? AND deleted_at IS NULL",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn get_object(&self, iri: &str) -> Result<Option<StoredObject>, AppError> {
        let object = sqlx::query_as::<_, StoredObject>("SELECT * FROM objects WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(object)
    }

    pub async fn count_local_objects(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM objects WHERE is_local = 1 AND deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Reactions
    // =========================================================================

    pub async fn get_reaction(&self, activity_id: &str) -> Result<Option<Reaction>, AppError> {
        let reaction =
            sqlx::query_as::<_, Reaction>("SELECT * FROM reactions WHERE activity_id = ?")
                .bind(activity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(reaction)
    }

    pub async fn find_reaction(
        &self,
        kind: ReactionKind,
        actor: &str,
        object_iri: &str,
    ) -> Result<Option<Reaction>, AppError> {
        let reaction = sqlx::query_as::<_, Reaction>(
            "SELECT * FROM reactions WHERE kind = ? AND actor = ? AND object_iri = ?",
        )
        .bind(kind)
        .bind(actor)
        .bind(object_iri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reaction)
    }

    pub async fn count_reactions(
        &self,
        object_iri: &str,
        kind: ReactionKind,
    ) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM reactions WHERE object_iri = ? AND kind = ?")
                .bind(object_iri)
                .bind(kind)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // =========================================================================
    // Follow relationships
    // =========================================================================

    pub async fn get_follow(
        &self,
        follower: &str,
        followee: &str,
    ) -> Result<Option<FollowRelationship>, AppError> {
        let follow = sqlx::query_as::<_, FollowRelationship>(
            "SELECT * FROM follow_relationships WHERE follower = ? AND followee = ?",
        )
        .bind(follower)
        .bind(followee)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follow)
    }

    pub async fn get_follow_by_activity(
        &self,
        follow_activity_id: &str,
    ) -> Result<Option<FollowRelationship>, AppError> {
        let follow = sqlx::query_as::<_, FollowRelationship>(
            "SELECT * FROM follow_relationships WHERE follow_activity_id = ?",
        )
        .bind(follow_activity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follow)
    }

    /// Accepted followers of an actor, oldest relationship first
    pub async fn list_followers(
        &self,
        followee: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FollowRelationship>, AppError> {
        let follows = sqlx::query_as::<_, FollowRelationship>(
            r#"
            SELECT * FROM follow_relationships
            WHERE followee = ? AND status = 'accepted'
            ORDER BY created_at ASC, follower ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(followee)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    pub async fn count_followers(&self, followee: &str) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM follow_relationships WHERE followee = ? AND status = 'accepted'",
        )
        .bind(followee)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Actors an actor follows (accepted only), oldest relationship first
    pub async fn list_following(
        &self,
        follower: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FollowRelationship>, AppError> {
        let follows = sqlx::query_as::<_, FollowRelationship>(
            r#"
            SELECT * FROM follow_relationships
            WHERE follower = ? AND status = 'accepted'
            ORDER BY created_at ASC, followee ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(follower)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(follows)
    }

    pub async fn count_following(&self, follower: &str) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM follow_relationships WHERE follower = ? AND status = 'accepted'",
        )
        .bind(follower)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Every accepted follower IRI, for delivery fan-out
    pub async fn accepted_follower_iris(&self, followee: &str) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT follower FROM follow_relationships
            WHERE followee = ? AND status = 'accepted'
            ORDER BY created_at ASC, follower ASC
            "#,
        )
        .bind(followee)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(iri,)| iri).collect())
    }

    /// Remove a relationship outside of activity processing (moderation)
    pub async fn delete_follow(&self, follower: &str, followee: &str) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM follow_relationships WHERE follower = ? AND followee = ?")
                .bind(follower)
                .bind(followee)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Inbox / outbox collections
    // =========================================================================

    pub async fn list_inbox(
        &self,
        recipient: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InboxItem>, AppError> {
        let items = sqlx::query_as::<_, InboxItem>(
            r#"
            SELECT * FROM inbox_items
            WHERE recipient = ?
            ORDER BY published DESC, activity_id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(recipient)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn count_inbox(&self, recipient: &str) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM inbox_items WHERE recipient = ?")
                .bind(recipient)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn list_outbox(
        &self,
        actor_handle: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OutboxItem>, AppError> {
        let items = sqlx::query_as::<_, OutboxItem>(
            r#"
            SELECT * FROM outbox_items
            WHERE actor_handle = ?
            ORDER BY published DESC, activity_id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(actor_handle)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn count_outbox(&self, actor_handle: &str) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_items WHERE actor_handle = ?")
                .bind(actor_handle)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn get_outbox_item(&self, activity_id: &str) -> Result<Option<OutboxItem>, AppError> {
        let item =
            sqlx::query_as::<_, OutboxItem>("SELECT * FROM outbox_items WHERE activity_id = ?")
                .bind(activity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(item)
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    /// Queue a task; a second task for the same (activity, inbox) is ignored
    pub async fn insert_delivery_task(&self, task: &DeliveryTask) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        let inserted = insert_delivery_task(&mut conn, task).await?;
        Ok(inserted)
    }

    /// Pending tasks whose next attempt is due, oldest first
    pub async fn due_delivery_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryTask>, AppError> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            r#"
            SELECT * FROM delivery_tasks
            WHERE status = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// Earliest next attempt among pending tasks
    pub async fn next_delivery_due(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT next_attempt_at FROM delivery_tasks
            WHERE status = 'pending'
            ORDER BY next_attempt_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(at,)| at))
    }

    /// Record the outcome of one attempt
    pub async fn record_delivery_attempt(
        &self,
        id: &str,
        attempts: i64,
        status: DeliveryStatus,
        next_attempt_at: DateTime<Utc>,
        status_code: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET attempts = ?, status = ?, next_attempt_at = ?,
                last_status_code = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(status)
        .bind(next_attempt_at)
        .bind(status_code)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete pending tasks nobody wants delivered anymore.
    ///
    /// A task is orphaned when its sender is gone, or when it was addressed to
    /// a follower who no longer has an accepted relationship with the sender.
    /// `actor_iri_prefix` is the local actor IRI minus the handle.
    pub async fn prune_orphaned_delivery_tasks(
        &self,
        actor_iri_prefix: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_tasks
            WHERE status = 'pending' AND (
                NOT EXISTS (
                    SELECT 1 FROM local_actors a
                    WHERE a.handle = delivery_tasks.sender_handle AND a.deleted_at IS NULL
                )
                OR (
                    audience = 'followers' AND NOT EXISTS (
                        SELECT 1 FROM follow_relationships f
                        WHERE f.follower = delivery_tasks.recipient_actor
                          AND f.followee = ? || delivery_tasks.sender_handle
                          AND f.status = 'accepted'
                    )
                )
            )
            "#,
        )
        .bind(actor_iri_prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delivery_tasks_for_activity(
        &self,
        activity_id: &str,
    ) -> Result<Vec<DeliveryTask>, AppError> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            "SELECT * FROM delivery_tasks WHERE activity_id = ? ORDER BY recipient_inbox ASC",
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn delivery_stats(&self) -> Result<DeliveryStats, AppError> {
        let rows: Vec<(DeliveryStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM delivery_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = DeliveryStats::default();
        for (status, count) in rows {
            match status {
                DeliveryStatus::Pending => stats.pending = count,
                DeliveryStatus::Delivered => stats.delivered = count,
                DeliveryStatus::Abandoned => stats.abandoned = count,
            }
        }
        Ok(stats)
    }
}

async fn insert_delivery_task(
    conn: &mut SqliteConnection,
    task: &DeliveryTask,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO delivery_tasks (
            id, activity_id, sender_handle, recipient_actor, recipient_inbox, audience,
            payload, attempts, next_attempt_at, status, last_status_code, last_error,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.activity_id)
    .bind(&task.sender_handle)
    .bind(&task.recipient_actor)
    .bind(&task.recipient_inbox)
    .bind(task.audience)
    .bind(&task.payload)
    .bind(task.attempts)
    .bind(task.next_attempt_at)
    .bind(task.status)
    .bind(task.last_status_code)
    .bind(&task.last_error)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn commit_batch(
    pool: &Pool<Sqlite>,
    receipt: Option<&ProcessedActivity>,
    mutations: &[Mutation],
) -> Result<bool, AppError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let result: Result<bool, AppError> = async {
        if let Some(receipt) = receipt {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO processed_activities
                    (activity_id, recipient, activity_type, actor, processed_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&receipt.activity_id)
            .bind(&receipt.recipient)
            .bind(&receipt.activity_type)
            .bind(&receipt.actor)
            .bind(receipt.processed_at)
            .execute(&mut *conn)
            .await?;

            if inserted.rows_affected() == 0 {
                return Ok(false);
            }
        }

        for mutation in mutations {
            apply_mutation(&mut conn, mutation).await?;
        }

        Ok(true)
    }
    .await;

    match result {
        Ok(applied) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(applied)
        }
        Err(error) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(error)
        }
    }
}

async fn apply_mutation(conn: &mut SqliteConnection, mutation: &Mutation) -> Result<(), AppError> {
    match mutation {
        Mutation::RequestFollow {
            follower,
            followee,
            follow_activity_id,
            status,
        } => {
            let now = Utc::now();
            sqlx::query(
                r#"
                INSERT INTO follow_relationships
                    (id, follower, followee, status, follow_activity_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(follower, followee) DO UPDATE SET
                    status = excluded.status,
                    follow_activity_id = excluded.follow_activity_id,
                    updated_at = excluded.updated_at
                WHERE follow_relationships.status != 'accepted'
                "#,
            )
            .bind(EntityId::new().0)
            .bind(follower)
            .bind(followee)
            .bind(*status)
            .bind(follow_activity_id)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::TransitionFollow {
            follower,
            followee,
            from,
            to,
        } => {
            sqlx::query(
                r#"
                UPDATE follow_relationships SET status = ?, updated_at = ?
                WHERE follower = ? AND followee = ? AND status = ?
                "#,
            )
            .bind(*to)
            .bind(Utc::now())
            .bind(follower)
            .bind(followee)
            .bind(*from)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::RemoveFollow { follower, followee } => {
            sqlx::query("DELETE FROM follow_relationships WHERE follower = ? AND followee = ?")
                .bind(follower)
                .bind(followee)
                .execute(&mut *conn)
                .await?;
        }
        Mutation::RemoveFollowsOf { actor } => {
            sqlx::query("DELETE FROM follow_relationships WHERE follower = ? OR followee = ?")
                .bind(actor)
                .bind(actor)
                .execute(&mut *conn)
                .await?;
        }
        Mutation::InsertObject(object) => {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO objects (
                    iri, object_type, attributed_to, in_reply_to, document,
                    is_local, published, updated_at, deleted_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&object.iri)
            .bind(&object.object_type)
            .bind(&object.attributed_to)
            .bind(&object.in_reply_to)
            .bind(&object.document)
            .bind(object.is_local)
            .bind(object.published)
            .bind(object.updated_at)
            .bind(object.deleted_at)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::ReplaceObject {
            iri,
            attributed_to,
            document,
            updated_at,
        } => {
            sqlx::query(
                r#"
                UPDATE objects SET document = ?, updated_at = ?
                WHERE iri = ? AND attributed_to = ? AND deleted_at IS NULL
                "#,
            )
            .bind(document)
            .bind(updated_at)
            .bind(iri)
            .bind(attributed_to)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::TombstoneObject {
            iri,
            attributed_to,
            tombstone,
            deleted_at,
        } => {
            sqlx::query(
                r#"
                UPDATE objects SET document = ?, deleted_at = ?
                WHERE iri = ? AND attributed_to = ? AND deleted_at IS NULL
                "#,
            )
            .bind(tombstone)
            .bind(deleted_at)
            .bind(iri)
            .bind(attributed_to)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::InsertReaction(reaction) => {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO reactions (activity_id, kind, actor, object_iri, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&reaction.activity_id)
            .bind(reaction.kind)
            .bind(&reaction.actor)
            .bind(&reaction.object_iri)
            .bind(reaction.created_at)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::RemoveReaction { activity_id, actor } => {
            sqlx::query("DELETE FROM reactions WHERE activity_id = ? AND actor = ?")
                .bind(activity_id)
                .bind(actor)
                .execute(&mut *conn)
                .await?;
        }
        Mutation::TombstoneRemoteActor { iri } => {
            sqlx::query(
                "UPDATE remote_actors SET deleted_at = ? WHERE iri = ? AND deleted_at IS NULL",
            )
            .bind(Utc::now())
            .bind(iri)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::AppendInbox(item) => {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO inbox_items
                    (id, recipient, activity_id, activity_type, actor, document, published)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&item.recipient)
            .bind(&item.activity_id)
            .bind(&item.activity_type)
            .bind(&item.actor)
            .bind(&item.document)
            .bind(item.published)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::AppendOutbox(item) => {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO outbox_items
                    (activity_id, actor_handle, activity_type, object_iri, document, published)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.activity_id)
            .bind(&item.actor_handle)
            .bind(&item.activity_type)
            .bind(&item.object_iri)
            .bind(&item.document)
            .bind(item.published)
            .execute(&mut *conn)
            .await?;
        }
        Mutation::EnqueueDelivery(task) => {
            insert_delivery_task(conn, task).await?;
        }
    }

    Ok(())
}
