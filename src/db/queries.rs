use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};

#[cfg(test)]
use super::models::CachedProduct;

/// Current update marker, if one has been stored.
pub async fn get_marker<'e, E>(executor: E) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, String>("SELECT updated FROM update_marker WHERE id = 1")
        .fetch_optional(executor)
        .await
}

/// Replace the single marker row.
pub async fn set_marker<'e, E>(executor: E, updated: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO update_marker (id, updated) VALUES (1, $1)
         ON CONFLICT (id) DO UPDATE SET updated = excluded.updated",
    )
    .bind(updated)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_marker<'e, E>(executor: E) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM update_marker").execute(executor).await?;
    Ok(())
}

/// Bytes of `timestamp_key`, only while the stored marker equals `updated`.
///
/// Marker and product are read in one statement, so a reader never sees a
/// marker without its product or the reverse.
pub async fn get_fresh_product_bytes<'e, E>(
    executor: E,
    updated: &str,
    timestamp_key: &str,
) -> Result<Option<Vec<u8>>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, Vec<u8>>(
        "SELECT p.bytes
         FROM products p
         JOIN update_marker m ON m.id = 1
         WHERE m.updated = $1 AND p.timestamp_key = $2",
    )
    .bind(updated)
    .bind(timestamp_key)
    .fetch_optional(executor)
    .await
}

pub async fn product_exists<'e, E>(executor: E, timestamp_key: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM products WHERE timestamp_key = $1)",
    )
    .bind(timestamp_key)
    .fetch_one(executor)
    .await
}

/// Insert a product unless its key already exists. Returns rows inserted.
pub async fn insert_product<'e, E>(
    executor: E,
    timestamp_key: &str,
    bytes: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO products (timestamp_key, bytes, fetched_at) VALUES ($1, $2, $3)
         ON CONFLICT (timestamp_key) DO NOTHING",
    )
    .bind(timestamp_key)
    .bind(bytes)
    .bind(fetched_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Delete every cached product. Returns rows deleted.
pub async fn delete_all_products<'e, E>(executor: E) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM products").execute(executor).await?;
    Ok(result.rows_affected())
}

/// Cached product metadata, without payloads.
pub async fn list_product_keys<'e, E>(executor: E) -> Result<Vec<(String, i64)>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, (String, i64)>(
        "SELECT timestamp_key, length(bytes) FROM products ORDER BY timestamp_key",
    )
    .fetch_all(executor)
    .await
}

/// Full product rows. Only used by tests and diagnostics; payloads can be large.
#[cfg(test)]
pub async fn list_products<'e, E>(executor: E) -> Result<Vec<CachedProduct>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, CachedProduct>(
        "SELECT timestamp_key, bytes, fetched_at FROM products ORDER BY timestamp_key",
    )
    .fetch_all(executor)
    .await
}
