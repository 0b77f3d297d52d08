//! Local projection of the vehicle types this service has heard about
//!
//! New vehicles are validated against it instead of calling the vehicle type
//! service synchronously.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CachedVehicleType {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

pub async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO vehicle_type_cache (id, name, active, updated_at)
        VALUES ($1, $2, TRUE, NOW())
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name, updated_at = NOW()
        "#,
    )
    .bind(id)
    .bind(name)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn deactivate(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO vehicle_type_cache (id, name, active, updated_at)
        VALUES ($1, '', FALSE, NOW())
        ON CONFLICT (id) DO UPDATE
        SET active = FALSE, updated_at = NOW()
        "#,
    )
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Active cache row, share-locked until `tx` ends
///
/// A concurrent [`deactivate`] waits for `tx`, and a `tx` that arrives after
/// a deactivation has committed sees no row.
pub async fn find_active_for_share(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<CachedVehicleType>, sqlx::Error> {
    sqlx::query_as::<_, CachedVehicleType>(
        "SELECT id, name, active FROM vehicle_type_cache WHERE id = $1 AND active FOR SHARE",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
}
