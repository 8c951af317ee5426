/// LanceDB vector database wrapper.
///
/// Provides a thin typed interface over LanceDB: table creation and versioned
/// replacement, appends, filtered scans, in-place updates, deletes and filtered
/// nearest-neighbour search. Table schemas are owned by the caller; this module only
/// moves `RecordBatch`es in and out.
use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator};
use arrow_schema::Schema;
use lancedb::database::CreateTableMode;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;
use tracing::{info, warn};

use crate::error::CommonError;

/// Parameters for a nearest-neighbour query.
pub struct VectorSearch<'a> {
    pub table: &'a str,
    pub column: &'a str,
    pub query: &'a [f32],
    pub limit: usize,
    /// SQL predicate applied before ranking, e.g. `is_disabled = false`.
    pub filter: Option<String>,
}

/// New contents for one table in a [`VectorDb::replace_tables`] call.
pub struct TableReplacement<'a> {
    pub name: &'a str,
    pub schema: Arc<Schema>,
    pub batches: Vec<RecordBatch>,
}

pub struct VectorDb {
    db: lancedb::Connection,
}

impl VectorDb {
    /// Connect to a LanceDB database at the given filesystem path.
    pub async fn connect(path: &str) -> Result<Self, CommonError> {
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("connection failed: {e}")))?;
        Ok(Self { db })
    }

    pub async fn table_exists(&self, table_name: &str) -> Result<bool, CommonError> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("list tables failed: {e}")))?;
        Ok(names.iter().any(|n| n == table_name))
    }

    /// Overwrite the table with `batches`, creating it if it doesn't exist.
    ///
    /// An empty `batches` leaves an empty table with `schema`. The overwrite is a new
    /// table version, so readers never observe a missing table and the previous
    /// contents stay reachable through [`VectorDb::restore_version`].
    pub async fn create_or_replace_table(
        &self,
        table_name: &str,
        schema: Arc<Schema>,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CommonError> {
        if batches.is_empty() {
            self.db
                .create_empty_table(table_name, schema)
                .mode(CreateTableMode::Overwrite)
                .execute()
                .await
                .map_err(|e| CommonError::VectorDb(format!("create empty table failed: {e}")))?;
        } else {
            let batch_iter = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
            self.db
                .create_table(table_name, Box::new(batch_iter))
                .mode(CreateTableMode::Overwrite)
                .execute()
                .await
                .map_err(|e| CommonError::VectorDb(format!("create table failed: {e}")))?;
        }

        info!(table = table_name, "vector table written");
        Ok(())
    }

    /// Replace several tables as one unit.
    ///
    /// Tables are written in order. If any write fails, the tables already written
    /// are rolled back (restored to their prior version, or dropped if they did not
    /// exist before) and the original error is returned.
    pub async fn replace_tables(&self, tables: Vec<TableReplacement<'_>>) -> Result<(), CommonError> {
        let mut written: Vec<(&str, Option<u64>)> = Vec::with_capacity(tables.len());
        for table in tables {
            let previous = self.table_version(table.name).await?;
            if let Err(e) = self
                .create_or_replace_table(table.name, table.schema, table.batches)
                .await
            {
                warn!(table = table.name, error = %e, "table replacement failed, rolling back");
                self.roll_back(&written).await;
                return Err(e);
            }
            written.push((table.name, previous));
        }
        Ok(())
    }

    async fn roll_back(&self, written: &[(&str, Option<u64>)]) {
        for (name, previous) in written.iter().rev() {
            let outcome = match previous {
                Some(version) => self.restore_version(name, *version).await,
                None => self
                    .db
                    .drop_table(name)
                    .await
                    .map_err(|e| CommonError::VectorDb(format!("drop table failed: {e}"))),
            };
            match outcome {
                Ok(()) => info!(table = *name, version = ?previous, "table rolled back"),
                Err(e) => warn!(table = *name, error = %e, "table rollback failed"),
            }
        }
    }

    /// Current version of the table, or `None` if it doesn't exist.
    pub async fn table_version(&self, table_name: &str) -> Result<Option<u64>, CommonError> {
        if !self.table_exists(table_name).await? {
            return Ok(None);
        }
        let table = self.open(table_name).await?;
        let version = table
            .version()
            .await
            .map_err(|e| CommonError::VectorDb(format!("read table version failed: {e}")))?;
        Ok(Some(version))
    }

    /// Make `version` the latest version of the table again.
    pub async fn restore_version(&self, table_name: &str, version: u64) -> Result<(), CommonError> {
        let table = self.open(table_name).await?;
        table
            .checkout(version)
            .await
            .map_err(|e| CommonError::VectorDb(format!("checkout version {version} failed: {e}")))?;
        table
            .restore()
            .await
            .map_err(|e| CommonError::VectorDb(format!("restore version {version} failed: {e}")))?;
        Ok(())
    }

    /// Append rows to an existing table.
    pub async fn append(&self, table_name: &str, batch: RecordBatch) -> Result<(), CommonError> {
        let table = self.open(table_name).await?;
        let schema = batch.schema();
        let batch_iter = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(batch_iter))
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("append failed: {e}")))?;
        Ok(())
    }

    /// Return every row matching `filter` (all rows when `None`), in storage order.
    pub async fn scan(
        &self,
        table_name: &str,
        filter: Option<String>,
    ) -> Result<Vec<RecordBatch>, CommonError> {
        let table = self.open(table_name).await?;
        let mut query = table.query();
        if let Some(filter) = filter {
            query = query.only_if(filter);
        }
        let results = query
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("scan failed: {e}")))?;

        futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CommonError::VectorDb(format!("collecting scan results failed: {e}")))
    }

    /// Set `column` to the SQL expression `value` on every row matching `filter`.
    pub async fn update_column(
        &self,
        table_name: &str,
        filter: String,
        column: &str,
        value: &str,
    ) -> Result<(), CommonError> {
        let table = self.open(table_name).await?;
        table
            .update()
            .only_if(filter)
            .column(column, value)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("update failed: {e}")))?;
        Ok(())
    }

    /// Delete every row matching `filter`.
    pub async fn delete_rows(&self, table_name: &str, filter: &str) -> Result<(), CommonError> {
        let table = self.open(table_name).await?;
        table
            .delete(filter)
            .await
            .map_err(|e| CommonError::VectorDb(format!("delete failed: {e}")))?;
        Ok(())
    }

    /// Number of rows matching `filter` (all rows when `None`).
    pub async fn count_rows(&self, table_name: &str, filter: Option<String>) -> Result<usize, CommonError> {
        let table = self.open(table_name).await?;
        table
            .count_rows(filter)
            .await
            .map_err(|e| CommonError::VectorDb(format!("count failed: {e}")))
    }

    /// Cosine nearest-neighbour search.
    ///
    /// Results carry a `_distance` column (cosine distance, `1 - similarity`) and are
    /// ordered nearest first.
    pub async fn search(&self, search: VectorSearch<'_>) -> Result<Vec<RecordBatch>, CommonError> {
        let table = self.open(search.table).await?;

        let mut query = table
            .vector_search(search.query)
            .map_err(|e| CommonError::VectorDb(format!("vector search setup failed: {e}")))?
            .column(search.column)
            .distance_type(DistanceType::Cosine)
            .limit(search.limit);
        if let Some(filter) = search.filter {
            query = query.only_if(filter);
        }

        let results = query
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("vector search failed: {e}")))?;

        futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e| CommonError::VectorDb(format!("collecting search results failed: {e}")))
    }

    async fn open(&self, table_name: &str) -> Result<lancedb::Table, CommonError> {
        self.db
            .open_table(table_name)
            .execute()
            .await
            .map_err(|e| CommonError::VectorDb(format!("open table {table_name} failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Array, Int64Array};
    use arrow_schema::{DataType, Field};

    use super::*;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]))
    }

    fn rows(ids: &[i64]) -> Vec<RecordBatch> {
        let column = Arc::new(Int64Array::from(ids.to_vec()));
        vec![RecordBatch::try_new(schema(), vec![column]).unwrap()]
    }

    async fn ids(db: &VectorDb, table: &str) -> Vec<i64> {
        let mut ids = Vec::new();
        for batch in db.scan(table, None).await.unwrap() {
            let column = batch
                .column_by_name("id")
                .unwrap()
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            ids.extend((0..column.len()).map(|i| column.value(i)));
        }
        ids.sort_unstable();
        ids
    }

    async fn open_db(dir: &tempfile::TempDir) -> VectorDb {
        VectorDb::connect(dir.path().to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn overwrite_keeps_table_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        assert_eq!(db.table_version("items").await.unwrap(), None);

        db.create_or_replace_table("items", schema(), rows(&[1, 2])).await.unwrap();
        let first = db.table_version("items").await.unwrap().unwrap();
        db.create_or_replace_table("items", schema(), rows(&[3])).await.unwrap();
        let second = db.table_version("items").await.unwrap().unwrap();

        assert!(second > first);
        assert_eq!(ids(&db, "items").await, vec![3]);

        db.restore_version("items", first).await.unwrap();
        assert_eq!(ids(&db, "items").await, vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_replacement_rolls_back_earlier_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.create_or_replace_table("existing", schema(), rows(&[1, 2])).await.unwrap();

        let result = db
            .replace_tables(vec![
                TableReplacement {
                    name: "existing",
                    schema: schema(),
                    batches: rows(&[9]),
                },
                TableReplacement {
                    name: "fresh",
                    schema: schema(),
                    batches: rows(&[7]),
                },
                TableReplacement {
                    name: "bad name!",
                    schema: schema(),
                    batches: rows(&[8]),
                },
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(ids(&db, "existing").await, vec![1, 2]);
        assert!(!db.table_exists("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn replacement_writes_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.create_or_replace_table("a", schema(), rows(&[1])).await.unwrap();

        db.replace_tables(vec![
            TableReplacement {
                name: "a",
                schema: schema(),
                batches: Vec::new(),
            },
            TableReplacement {
                name: "b",
                schema: schema(),
                batches: rows(&[4, 5]),
            },
        ])
        .await
        .unwrap();

        assert!(ids(&db, "a").await.is_empty());
        assert_eq!(ids(&db, "b").await, vec![4, 5]);
    }

    #[tokio::test]
    async fn delete_and_count_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.create_or_replace_table("items", schema(), rows(&[1, 2, 3])).await.unwrap();

        db.delete_rows("items", "id = 2").await.unwrap();
        assert_eq!(db.count_rows("items", None).await.unwrap(), 2);
        assert_eq!(db.count_rows("items", Some("id = 2".to_string())).await.unwrap(), 0);
        assert_eq!(ids(&db, "items").await, vec![1, 3]);
    }
}
