use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::Vehicle;

const COLUMNS: &str = "id, plate, brand, model, year, color, vehicle_type_id, vehicle_type_name, \
     serial_number, active, created_at, updated_at";

pub async fn insert(tx: &mut Transaction<'_, Postgres>, vehicle: &Vehicle) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO vehicles
            (id, plate, brand, model, year, color, vehicle_type_id, vehicle_type_name,
             serial_number, active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(vehicle.id)
    .bind(&vehicle.plate)
    .bind(&vehicle.brand)
    .bind(&vehicle.model)
    .bind(vehicle.year)
    .bind(&vehicle.color)
    .bind(vehicle.vehicle_type_id)
    .bind(&vehicle.vehicle_type_name)
    .bind(&vehicle.serial_number)
    .bind(vehicle.active)
    .bind(vehicle.created_at)
    .bind(vehicle.updated_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn find(pool: &PgPool, id: Uuid) -> Result<Option<Vehicle>, sqlx::Error> {
    let sql = format!("SELECT {COLUMNS} FROM vehicles WHERE id = $1");
    sqlx::query_as::<_, Vehicle>(&sql).bind(id).fetch_optional(pool).await
}

/// Refresh the cached type name on every vehicle of that type
pub async fn rename_vehicle_type(
    tx: &mut Transaction<'_, Postgres>,
    vehicle_type_id: Uuid,
    name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE vehicles
        SET vehicle_type_name = $2, updated_at = NOW()
        WHERE vehicle_type_id = $1 AND vehicle_type_name IS DISTINCT FROM $2
        "#,
    )
    .bind(vehicle_type_id)
    .bind(name)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

pub async fn deactivate_by_vehicle_type(
    tx: &mut Transaction<'_, Postgres>,
    vehicle_type_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE vehicles SET active = FALSE, updated_at = NOW() WHERE vehicle_type_id = $1 AND active",
    )
    .bind(vehicle_type_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}
