//! Vehicle type persistence
//!
//! Writes take the caller's transaction so the outbox row for the same change
//! commits with them.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::VehicleType;

const COLUMNS: &str =
    "id, name, description, passenger_capacity, category, active, created_at, updated_at";

pub async fn insert(tx: &mut Transaction<'_, Postgres>, vt: &VehicleType) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO vehicle_types
            (id, name, description, passenger_capacity, category, active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(vt.id)
    .bind(&vt.name)
    .bind(&vt.description)
    .bind(vt.passenger_capacity)
    .bind(&vt.category)
    .bind(vt.active)
    .bind(vt.created_at)
    .bind(vt.updated_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Lock an active vehicle type for the rest of the transaction
pub async fn find_active_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<VehicleType>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM vehicle_types WHERE id = $1 AND active = TRUE FOR UPDATE");
    sqlx::query_as::<_, VehicleType>(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
}

pub async fn update(tx: &mut Transaction<'_, Postgres>, vt: &VehicleType) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE vehicle_types
        SET name = $2, description = $3, passenger_capacity = $4, category = $5,
            active = $6, updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(vt.id)
    .bind(&vt.name)
    .bind(&vt.description)
    .bind(vt.passenger_capacity)
    .bind(&vt.category)
    .bind(vt.active)
    .bind(vt.updated_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn find_active(pool: &PgPool, id: Uuid) -> Result<Option<VehicleType>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM vehicle_types WHERE id = $1 AND active = TRUE");
    sqlx::query_as::<_, VehicleType>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}
