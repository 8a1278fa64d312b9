//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Compare-and-set status transitions guarded in SQL
//! - Atomic lease acquisition via conditional upsert
//! - Append-only event log with retention-based GC

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::definition::{DefinitionRef, DefinitionStatus, WorkflowDefinition};
use crate::events::{EventKind, EventRecord};

/// PostgreSQL implementation of [`WorkflowStore`]
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use strand_engine::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/strand").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_instance_status(s: &str) -> Result<InstanceStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown instance status: {s}")))
}

fn parse_node_status(s: &str) -> Result<NodeStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown node status: {s}")))
}

fn status_str(status: InstanceStatus) -> String {
    status.to_string()
}

fn row_to_instance(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    let failure: Option<serde_json::Value> = row.get("failure");

    Ok(WorkflowInstance {
        id: row.get("id"),
        definition: DefinitionRef::new(
            row.get::<String, _>("definition_name"),
            row.get::<i32, _>("definition_version") as u32,
        ),
        status: parse_instance_status(&status)?,
        status_reason: row.get("status_reason"),
        input_data: row.get("input_data"),
        context_data: row.get("context_data"),
        output_data: row.get("output_data"),
        failure: failure.and_then(|v| serde_json::from_value(v).ok()),
        current_node_id: row.get("current_node_id"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        max_concurrency: row.get::<i32, _>("max_concurrency") as usize,
        lease_owner: row.get("lease_owner"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        priority: row.get("priority"),
        external_id: row.get("external_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

fn row_to_node_instance(row: &PgRow) -> Result<NodeInstance, StoreError> {
    let status: String = row.get("status");
    let error: Option<serde_json::Value> = row.get("error");

    Ok(NodeInstance {
        id: row.get("id"),
        workflow_instance_id: row.get("instance_id"),
        node_id: row.get("node_id"),
        iteration: row.get("iteration"),
        status: parse_node_status(&status)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        input_snapshot: row.get("input_snapshot"),
        output: row.get("output"),
        error: error.and_then(|v| serde_json::from_value(v).ok()),
    })
}

fn row_to_lease(row: &PgRow) -> Lease {
    Lease {
        instance_id: row.get("instance_id"),
        owner_id: row.get("owner_id"),
        acquired_at: row.get("acquired_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        expires_at: row.get("expires_at"),
    }
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    #[instrument(skip(self, definition), fields(definition = %definition.reference()))]
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let document = serde_json::to_value(definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO strand_definitions (name, version, status, document, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (name, version)
            DO UPDATE SET status = $3, document = $4, updated_at = now()
            "#,
        )
        .bind(&definition.name)
        .bind(definition.version as i32)
        .bind(definition.status.to_string())
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("stored definition");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document FROM strand_definitions WHERE name = $1 AND version = $2
            "#,
        )
        .bind(&reference.name)
        .bind(reference.version as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let document: serde_json::Value = row.get("document");
                let definition = serde_json::from_value(document)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(definition))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn list_definitions(&self) -> Result<Vec<(DefinitionRef, DefinitionStatus)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, version, status FROM strand_definitions ORDER BY name, version
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                let status = serde_json::from_value(serde_json::Value::String(status.clone()))
                    .map_err(|_| {
                        StoreError::Serialization(format!("unknown definition status: {status}"))
                    })?;
                Ok((
                    DefinitionRef::new(
                        row.get::<String, _>("name"),
                        row.get::<i32, _>("version") as u32,
                    ),
                    status,
                ))
            })
            .collect()
    }

    #[instrument(skip(self, inputs, context))]
    async fn create_instance(
        &self,
        definition: &DefinitionRef,
        inputs: serde_json::Value,
        context: serde_json::Value,
        opts: CreateInstanceOptions,
    ) -> Result<WorkflowInstance, StoreError> {
        let id = Uuid::now_v7();

        let row = sqlx::query(
            r#"
            INSERT INTO strand_instances (
                id, definition_name, definition_version, status,
                input_data, context_data, max_retries, max_concurrency,
                priority, external_id
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&definition.name)
        .bind(definition.version as i32)
        .bind(&inputs)
        .bind(&context)
        .bind(opts.max_retries as i32)
        .bind(opts.max_concurrency as i32)
        .bind(opts.priority)
        .bind(&opts.external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create instance: {}", e);
            db_err(e)
        })?;

        debug!(%id, "created instance");
        row_to_instance(&row)
    }

    #[instrument(skip(self))]
    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM strand_instances WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| row_to_instance(&r)).transpose()
    }

    #[instrument(skip(self, patch))]
    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        patch: InstancePatch,
    ) -> Result<WorkflowInstance, StoreError> {
        // Statuses the target is legally reachable from
        let allowed_from: Vec<String> = [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Paused,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ]
        .iter()
        .filter(|from| from.can_transition_to(status))
        .map(|from| status_str(*from))
        .collect();

        let failure = patch
            .failure
            .map(|f| serde_json::to_value(f).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE strand_instances SET
                status = $2,
                status_reason = $3,
                context_data = COALESCE($4, context_data),
                output_data = COALESCE($5, output_data),
                failure = COALESCE($6, failure),
                current_node_id = COALESCE($7, current_node_id),
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, now()) ELSE started_at END,
                finished_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN now() ELSE finished_at END,
                updated_at = now()
            WHERE id = $1 AND status = ANY($8)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_str(status))
        .bind(&patch.reason)
        .bind(&patch.context_data)
        .bind(&patch.output_data)
        .bind(&failure)
        .bind(&patch.current_node_id)
        .bind(&allowed_from)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_instance(&row),
            None => {
                // Distinguish a missing row from an illegal transition
                let current = self
                    .load_instance(id)
                    .await?
                    .ok_or(StoreError::InstanceNotFound(id))?;
                Err(StoreError::InvalidTransition {
                    from: current.status,
                    to: status,
                })
            }
        }
    }

    #[instrument(skip(self, context))]
    async fn save_context(
        &self,
        id: Uuid,
        owner_id: &str,
        context: serde_json::Value,
        current_node_id: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE strand_instances SET
                context_data = $3,
                current_node_id = COALESCE($4, current_node_id),
                updated_at = now()
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(&context)
        .bind(&current_node_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            if self.load_instance(id).await?.is_none() {
                return Err(StoreError::InstanceNotFound(id));
            }
            return Err(StoreError::Conflict(format!(
                "instance {id} is not owned by {owner_id}"
            )));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_owner(&self, id: Uuid, owner_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM strand_instances WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self, filter, pagination))]
    async fn list_instances(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM strand_instances
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR external_id = $2)
              AND ($3::TEXT IS NULL OR definition_name = $3)
              AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at < $5)
            ORDER BY id DESC
            OFFSET $6 LIMIT $7
            "#,
        )
        .bind(filter.status.map(status_str))
        .bind(&filter.external_id)
        .bind(&filter.definition_name)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_instance).collect()
    }

    #[instrument(skip(self))]
    async fn list_stale_instances(
        &self,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(heartbeat_timeout)
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM strand_instances
            WHERE status = 'running' AND last_heartbeat_at < $1
            ORDER BY priority DESC, id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_instance).collect()
    }

    #[instrument(skip(self, node), fields(instance_id = %node.workflow_instance_id, node_id = %node.node_id))]
    async fn upsert_node_instance(&self, node: &NodeInstance) -> Result<(), StoreError> {
        let error = node
            .error
            .as_ref()
            .map(|e| serde_json::to_value(e).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO strand_node_instances (
                id, instance_id, node_id, iteration, status, attempt,
                started_at, finished_at, input_snapshot, output, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (instance_id, node_id, iteration)
            DO UPDATE SET
                status = $5,
                attempt = $6,
                started_at = $7,
                finished_at = $8,
                input_snapshot = $9,
                output = $10,
                error = $11
            "#,
        )
        .bind(node.id)
        .bind(node.workflow_instance_id)
        .bind(&node.node_id)
        .bind(&node.iteration)
        .bind(node.status.to_string())
        .bind(node.attempt as i32)
        .bind(node.started_at)
        .bind(node.finished_at)
        .bind(&node.input_snapshot)
        .bind(&node.output)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_node_instances(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<NodeInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM strand_node_instances WHERE instance_id = $1 ORDER BY id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_node_instance).collect()
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        instance_id: Uuid,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Database(e.to_string()))?;

        // The conditional upsert succeeds iff no lease exists, the existing
        // lease is expired, or the caller already owns it.
        let row = sqlx::query(
            r#"
            INSERT INTO strand_leases (instance_id, owner_id, acquired_at, last_heartbeat_at, expires_at)
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (instance_id)
            DO UPDATE SET
                owner_id = $2,
                acquired_at = $3,
                last_heartbeat_at = $3,
                expires_at = $4
            WHERE strand_leases.expires_at <= $3 OR strand_leases.owner_id = $2
            RETURNING *
            "#,
        )
        .bind(instance_id)
        .bind(owner_id)
        .bind(now)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE strand_instances SET lease_owner = $2, last_heartbeat_at = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%instance_id, %owner_id, "acquired lease");
        Ok(Some(row_to_lease(&row)))
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        instance_id: Uuid,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE strand_leases SET last_heartbeat_at = $3, expires_at = $4
            WHERE instance_id = $1 AND owner_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(owner_id)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE strand_instances SET last_heartbeat_at = $2 WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(true)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, instance_id: Uuid, owner_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM strand_leases WHERE instance_id = $1 AND owner_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            sqlx::query(
                r#"
                UPDATE strand_instances SET lease_owner = NULL, updated_at = now()
                WHERE id = $1 AND lease_owner = $2
                "#,
            )
            .bind(instance_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_lease(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM strand_leases WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| row_to_lease(&r)))
    }

    #[instrument(skip(self, event), fields(kind = %event.kind))]
    async fn append_event(&self, event: EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO strand_events (id, instance_id, node_id, kind, payload, ts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.instance_id)
        .bind(&event.node_id)
        .bind(event.kind.to_string())
        .bind(&event.payload)
        .bind(event.ts)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM strand_events WHERE instance_id = $1 ORDER BY id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let kind: EventKind =
                    serde_json::from_value(serde_json::Value::String(kind.clone())).map_err(
                        |_| StoreError::Serialization(format!("unknown event kind: {kind}")),
                    )?;
                Ok(EventRecord {
                    id: row.get("id"),
                    instance_id: row.get("instance_id"),
                    node_id: row.get("node_id"),
                    kind,
                    payload: row.get("payload"),
                    ts: row.get("ts"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM strand_events WHERE ts < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn compact_terminal_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let victims: Vec<Uuid> = sqlx::query(
            r#"
            SELECT DISTINCT i.id FROM strand_instances i
            JOIN strand_node_instances n ON n.instance_id = i.id
            WHERE i.status IN ('completed', 'failed', 'cancelled') AND i.finished_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .iter()
        .map(|row| row.get("id"))
        .collect();

        if !victims.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM strand_node_instances WHERE instance_id = ANY($1)
                "#,
            )
            .bind(&victims)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(victims.len() as u64)
    }

    #[instrument(skip(self))]
    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE status = 'running') AS running,
                count(*) FILTER (WHERE status = 'paused') AS paused,
                count(*) FILTER (WHERE status = 'failed' AND finished_at >= now() - INTERVAL '24 hours') AS failed_last_24h
            FROM strand_instances
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(StatusCounts {
            running: row.get::<i64, _>("running") as u64,
            paused: row.get::<i64, _>("paused") as u64,
            failed_last_24h: row.get::<i64, _>("failed_last_24h") as u64,
        })
    }
}
