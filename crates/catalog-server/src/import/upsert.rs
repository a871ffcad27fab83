//! Idempotent batch upsert into the product catalog

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::parser::RowRecord;
use super::ImportResult;

/// Write side of the catalog used by imports.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert or update `rows` atomically and return how many of their keys
    /// existed beforehand.
    ///
    /// Keys in `rows` are unique and already normalized.
    async fn upsert_batch(&self, rows: &[RowRecord]) -> ImportResult<u64>;
}

/// Postgres catalog keyed by the `lower(sku)` unique index
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_batch(&self, rows: &[RowRecord]) -> ImportResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = rows.iter().map(|row| row.sku.clone()).collect();

        let mut tx = self.pool.begin().await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE lower(sku) = ANY($1)")
                .bind(&keys)
                .fetch_one(&mut *tx)
                .await?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO products (sku, name, description, active) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.sku)
                .push_bind(&row.name)
                .push_bind(&row.description)
                .push_bind(row.active);
        });
        builder.push(
            " ON CONFLICT (lower(sku)) DO UPDATE SET \
             name = EXCLUDED.name, \
             description = EXCLUDED.description, \
             updated_at = NOW()",
        );
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;

        Ok(existing.max(0) as u64)
    }
}

/// Created/updated split of one applied batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: u64,
    pub updated: u64,
    /// Rows dropped because a later row in the batch had the same key
    pub duplicates: usize,
}

/// Keep only the last occurrence of each key, preserving the order of the
/// surviving rows.
pub fn dedupe_last_wins(batch: Vec<RowRecord>) -> (Vec<RowRecord>, usize) {
    let original = batch.len();
    let mut seen = HashSet::with_capacity(original);
    let mut kept: Vec<RowRecord> = batch
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.sku.clone()))
        .collect();
    kept.reverse();
    let dropped = original - kept.len();
    (kept, dropped)
}

/// Deduplicates batches and applies them to a [`CatalogStore`].
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn CatalogStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(rows = batch.len()))]
    pub async fn apply(&self, batch: Vec<RowRecord>) -> ImportResult<UpsertOutcome> {
        let (rows, duplicates) = dedupe_last_wins(batch);
        if duplicates > 0 {
            debug!(duplicates, "Dropped duplicate keys within batch");
        }

        let existing = self.store.upsert_batch(&rows).await?;
        // Another writer may create a key between the count and the insert
        let existing = existing.min(rows.len() as u64);

        Ok(UpsertOutcome {
            created: rows.len() as u64 - existing,
            updated: existing,
            duplicates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sku: &str, name: &str) -> RowRecord {
        RowRecord {
            sku: sku.to_string(),
            name: name.to_string(),
            description: None,
            active: true,
        }
    }

    #[test]
    fn test_dedupe_keeps_last_occurrence() {
        let (rows, dropped) = dedupe_last_wins(vec![
            row("a", "first"),
            row("b", "only"),
            row("a", "second"),
            row("a", "third"),
        ]);

        assert_eq!(dropped, 2);
        assert_eq!(rows, vec![row("b", "only"), row("a", "third")]);
    }

    #[test]
    fn test_dedupe_without_duplicates_is_identity() {
        let batch = vec![row("a", "1"), row("b", "2")];
        let (rows, dropped) = dedupe_last_wins(batch.clone());
        assert_eq!(dropped, 0);
        assert_eq!(rows, batch);
    }

    struct FixedExisting(u64);

    #[async_trait]
    impl CatalogStore for FixedExisting {
        async fn upsert_batch(&self, _rows: &[RowRecord]) -> ImportResult<u64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_apply_splits_created_and_updated() {
        let engine = UpsertEngine::new(Arc::new(FixedExisting(1)));
        let outcome = engine
            .apply(vec![row("a", "1"), row("b", "2"), row("a", "3")])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UpsertOutcome {
                created: 1,
                updated: 1,
                duplicates: 1
            }
        );
    }

    #[tokio::test]
    async fn test_apply_clamps_racing_existing_count() {
        let engine = UpsertEngine::new(Arc::new(FixedExisting(10)));
        let outcome = engine.apply(vec![row("a", "1")]).await.unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.updated, 1);
    }
}
