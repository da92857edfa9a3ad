//! Postgres implementation of the persistence gateway.
//!
//! Plain `sqlx::query` with positional binds; every mutating operation runs
//! in a transaction. Status transitions take the command row `FOR UPDATE` so
//! concurrent callers are serialised and the later one observes the earlier
//! state.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::error;
use uuid::Uuid;

use sovd_schemas::{
    CommandRow, CommandStatus, ConnectionStatus, ResponseRow, UserRole, UserRow, VehicleRow,
};

use crate::store::{
    CommandFilter, CommandStore, EntityKind, NewAuditEvent, NewCommand, StoreError,
};

/// Postgres error code for unique-constraint violations.
const PG_UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == PG_UNIQUE_VIOLATION)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn command_from_row(row: &PgRow) -> Result<CommandRow, StoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = CommandStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Unavailable(format!("corrupt command status: {status_raw}")))?;

    Ok(CommandRow {
        command_id: row.try_get("command_id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        vehicle_id: row.try_get("vehicle_id").map_err(db_err)?,
        command_name: row.try_get("command_name").map_err(db_err)?,
        command_params: row.try_get("command_params").map_err(db_err)?,
        status,
        error_message: row.try_get("error_message").map_err(db_err)?,
        submitted_at: row.try_get("submitted_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}

fn response_from_row(row: &PgRow) -> Result<ResponseRow, StoreError> {
    Ok(ResponseRow {
        response_id: row.try_get("response_id").map_err(db_err)?,
        command_id: row.try_get("command_id").map_err(db_err)?,
        response_payload: row.try_get("response_payload").map_err(db_err)?,
        sequence_number: row.try_get("sequence_number").map_err(db_err)?,
        is_final: row.try_get("is_final").map_err(db_err)?,
        received_at: row.try_get("received_at").map_err(db_err)?,
    })
}

fn vehicle_from_row(row: &PgRow) -> Result<VehicleRow, StoreError> {
    let status_raw: String = row.try_get("connection_status").map_err(db_err)?;
    let connection_status = ConnectionStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::Unavailable(format!("corrupt connection status: {status_raw}"))
    })?;

    Ok(VehicleRow {
        vehicle_id: row.try_get("vehicle_id").map_err(db_err)?,
        vin: row.try_get("vin").map_err(db_err)?,
        make: row.try_get("make").map_err(db_err)?,
        model: row.try_get("model").map_err(db_err)?,
        year: row.try_get("year").map_err(db_err)?,
        connection_status,
        last_seen_at: row.try_get("last_seen_at").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
    })
}

fn user_from_row(row: &PgRow) -> Result<UserRow, StoreError> {
    let role_raw: String = row.try_get("role").map_err(db_err)?;
    let role = UserRole::parse(&role_raw)
        .ok_or_else(|| StoreError::Unavailable(format!("corrupt user role: {role_raw}")))?;

    Ok(UserRow {
        user_id: row.try_get("user_id").map_err(db_err)?,
        username: row.try_get("username").map_err(db_err)?,
        role,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

const COMMAND_COLUMNS: &str = "command_id, user_id, vehicle_id, command_name, command_params, \
                               status, error_message, submitted_at, completed_at";

// ---------------------------------------------------------------------------
// CommandStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl CommandStore for PgStore {
    async fn insert_command(&self, new: NewCommand) -> Result<CommandRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let vehicle_exists = sqlx::query("select 1 from vehicles where vehicle_id = $1")
            .bind(new.vehicle_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();
        if !vehicle_exists {
            return Err(StoreError::NotFound(EntityKind::Vehicle));
        }

        let command_id = Uuid::new_v4();
        let submitted_at = Utc::now();

        sqlx::query(
            r#"
            insert into commands (
              command_id, user_id, vehicle_id, command_name, command_params, status, submitted_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(command_id)
        .bind(new.user_id)
        .bind(new.vehicle_id)
        .bind(&new.command_name)
        .bind(&new.command_params)
        .bind(CommandStatus::Pending.as_str())
        .bind(submitted_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(CommandRow {
            command_id,
            user_id: new.user_id,
            vehicle_id: new.vehicle_id,
            command_name: new.command_name,
            command_params: new.command_params,
            status: CommandStatus::Pending,
            error_message: None,
            submitted_at,
            completed_at: None,
        })
    }

    async fn update_command_status(
        &self,
        command_id: Uuid,
        new_status: CommandStatus,
        error_message: Option<String>,
        completed_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<CommandRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current = sqlx::query(&format!(
            "select {COMMAND_COLUMNS} from commands where command_id = $1 for update"
        ))
        .bind(command_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound(EntityKind::Command))?;
        let current = command_from_row(&current)?;

        if !current.status.can_transition_to(new_status) {
            return Err(StoreError::IllegalTransition {
                from: current.status,
                to: new_status,
            });
        }

        // completed_at is set iff the target status is terminal;
        // error_message is set iff the target status is failed.
        let completed_at = if new_status.is_terminal() {
            Some(completed_at.unwrap_or_else(Utc::now))
        } else {
            None
        };
        let error_message = if new_status == CommandStatus::Failed {
            error_message
        } else {
            None
        };

        sqlx::query(
            r#"
            update commands
               set status = $2, error_message = $3, completed_at = $4
             where command_id = $1
            "#,
        )
        .bind(command_id)
        .bind(new_status.as_str())
        .bind(&error_message)
        .bind(completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(CommandRow {
            status: new_status,
            error_message,
            completed_at,
            ..current
        })
    }

    async fn insert_response(
        &self,
        command_id: Uuid,
        payload: Value,
        sequence_number: i32,
        is_final: bool,
    ) -> Result<ResponseRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let command_exists = sqlx::query("select 1 from commands where command_id = $1")
            .bind(command_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();
        if !command_exists {
            return Err(StoreError::NotFound(EntityKind::Command));
        }

        let response_id = Uuid::new_v4();
        let received_at = Utc::now();

        let inserted = sqlx::query(
            r#"
            insert into responses (
              response_id, command_id, response_payload, sequence_number, is_final, received_at
            ) values (
              $1, $2, $3, $4, $5, $6
            )
            "#,
        )
        .bind(response_id)
        .bind(command_id)
        .bind(&payload)
        .bind(sequence_number)
        .bind(is_final)
        .bind(received_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::SequenceConflict {
                    command_id,
                    sequence_number,
                });
            }
            Err(err) => return Err(db_err(err)),
        }

        tx.commit().await.map_err(db_err)?;

        Ok(ResponseRow {
            response_id,
            command_id,
            response_payload: payload,
            sequence_number,
            is_final,
            received_at,
        })
    }

    async fn get_command(&self, command_id: Uuid) -> Result<CommandRow, StoreError> {
        let row = sqlx::query(&format!(
            "select {COMMAND_COLUMNS} from commands where command_id = $1"
        ))
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound(EntityKind::Command))?;

        command_from_row(&row)
    }

    async fn list_responses(&self, command_id: Uuid) -> Result<Vec<ResponseRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            select response_id, command_id, response_payload, sequence_number, is_final, received_at
              from responses
             where command_id = $1
             order by sequence_number asc
            "#,
        )
        .bind(command_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(response_from_row).collect()
    }

    async fn list_commands(&self, filter: &CommandFilter) -> Result<Vec<CommandRow>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "select {COMMAND_COLUMNS} from commands where true"
        ));

        if let Some(user_id) = filter.user_id {
            qb.push(" and user_id = ").push_bind(user_id);
        }
        if let Some(vehicle_id) = filter.vehicle_id {
            qb.push(" and vehicle_id = ").push_bind(vehicle_id);
        }
        if let Some(status) = filter.status {
            qb.push(" and status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.submitted_after {
            qb.push(" and submitted_at >= ").push_bind(after);
        }
        if let Some(before) = filter.submitted_before {
            qb.push(" and submitted_at <= ").push_bind(before);
        }

        let (limit, offset) = filter.window();
        qb.push(" order by submitted_at desc, command_id desc");
        qb.push(" limit ").push_bind(limit);
        qb.push(" offset ").push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(command_from_row).collect()
    }

    async fn log_audit(&self, event: NewAuditEvent) {
        let result = sqlx::query(
            r#"
            insert into audit_events (
              audit_id, actor_user_id, entity_type, entity_id, action, details, created_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.actor_user_id)
        .bind(&event.entity_type)
        .bind(event.entity_id)
        .bind(&event.action)
        .bind(&event.details)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            // Fire-and-forget: audit failures must never surface to callers.
            error!(action = %event.action, %err, "audit insert failed");
        }
    }

    async fn get_vehicle(&self, vehicle_id: Uuid) -> Result<VehicleRow, StoreError> {
        let row = sqlx::query(
            r#"
            select vehicle_id, vin, make, model, year, connection_status, last_seen_at, metadata
              from vehicles
             where vehicle_id = $1
            "#,
        )
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound(EntityKind::Vehicle))?;

        vehicle_from_row(&row)
    }

    async fn upsert_vehicle(&self, vehicle: VehicleRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into vehicles (
              vehicle_id, vin, make, model, year, connection_status, last_seen_at, metadata
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8
            )
            on conflict (vehicle_id) do update set
              vin = excluded.vin,
              make = excluded.make,
              model = excluded.model,
              year = excluded.year,
              connection_status = excluded.connection_status,
              last_seen_at = excluded.last_seen_at,
              metadata = excluded.metadata
            "#,
        )
        .bind(vehicle.vehicle_id)
        .bind(&vehicle.vin)
        .bind(&vehicle.make)
        .bind(&vehicle.model)
        .bind(vehicle.year)
        .bind(vehicle.connection_status.as_str())
        .bind(vehicle.last_seen_at)
        .bind(&vehicle.metadata)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            select vehicle_id, vin, make, model, year, connection_status, last_seen_at, metadata
              from vehicles
             order by vin asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(vehicle_from_row).collect()
    }

    async fn get_user(&self, user_id: Uuid) -> Result<UserRow, StoreError> {
        let row = sqlx::query(
            "select user_id, username, role, created_at from users where user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound(EntityKind::User))?;

        user_from_row(&row)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<UserRow, StoreError> {
        let row = sqlx::query(
            "select user_id, username, role, created_at from users where username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::NotFound(EntityKind::User))?;

        user_from_row(&row)
    }

    async fn upsert_user(&self, user: UserRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into users (user_id, username, role, created_at)
            values ($1, $2, $3, $4)
            on conflict (user_id) do update set
              username = excluded.username,
              role = excluded.role
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
