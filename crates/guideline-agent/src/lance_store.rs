/// LanceDB-backed guideline store.
///
/// Global and conditional guidelines live in separate tables so that only
/// conditional rows carry a vector column:
/// - `global_guidelines`: id Int64, directive Utf8, is_disabled Boolean
/// - `conditional_guidelines`: id Int64, condition Utf8, directive Utf8, is_disabled Boolean,
///   condition_vector FixedSizeList<Float32, dim>
///
/// Similarity search uses cosine distance; similarity is reported as `1 - distance`.
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BooleanArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use tracing::{info, warn};

use agent_common::error::CommonError;
use agent_common::vectordb::{TableReplacement, VectorDb, VectorSearch};

use crate::error::AppError;
use crate::model::{Candidate, Guideline, GuidelineId};
use crate::store::GuidelineStore;

pub const GLOBAL_TABLE: &str = "global_guidelines";
pub const CONDITIONAL_TABLE: &str = "conditional_guidelines";
const VECTOR_COLUMN: &str = "condition_vector";
const ENABLED_FILTER: &str = "is_disabled = false";

pub struct LanceGuidelineStore {
    vectordb: Arc<VectorDb>,
    dimensions: usize,
}

impl LanceGuidelineStore {
    /// Wrap `vectordb`, creating empty guideline tables if they don't exist yet.
    pub async fn open(vectordb: Arc<VectorDb>, dimensions: usize) -> Result<Self, AppError> {
        let store = Self {
            vectordb,
            dimensions,
        };
        for (table, schema) in [
            (GLOBAL_TABLE, global_schema()),
            (CONDITIONAL_TABLE, conditional_schema(dimensions)),
        ] {
            if !store.vectordb.table_exists(table).await? {
                info!(table, "creating empty guideline table");
                store
                    .vectordb
                    .create_or_replace_table(table, schema, Vec::new())
                    .await?;
            }
        }
        Ok(store)
    }

    fn table_for(is_global: bool) -> &'static str {
        if is_global {
            GLOBAL_TABLE
        } else {
            CONDITIONAL_TABLE
        }
    }

    async fn contains(&self, table: &str, id: GuidelineId) -> Result<bool, AppError> {
        let count = self.vectordb.count_rows(table, Some(format!("id = {id}"))).await?;
        Ok(count > 0)
    }

    /// The table holding `id`, if any.
    async fn locate(&self, id: GuidelineId) -> Result<Option<&'static str>, AppError> {
        for table in [GLOBAL_TABLE, CONDITIONAL_TABLE] {
            if self.contains(table, id).await? {
                return Ok(Some(table));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl GuidelineStore for LanceGuidelineStore {
    async fn fetch_by_type(&self, is_global: bool, enabled_only: bool) -> Result<Vec<Guideline>, AppError> {
        let filter = enabled_only.then(|| ENABLED_FILTER.to_string());
        let batches = self.vectordb.scan(Self::table_for(is_global), filter).await?;
        batches
            .iter()
            .map(|batch| extract_guidelines(batch, is_global))
            .collect::<Result<Vec<_>, _>>()
            .map(|nested| nested.into_iter().flatten().collect())
    }

    async fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<Candidate>, AppError> {
        if query.len() != self.dimensions {
            return Err(AppError::Common(CommonError::VectorDb(format!(
                "query vector has {} dimensions, table expects {}",
                query.len(),
                self.dimensions
            ))));
        }

        let batches = self
            .vectordb
            .search(VectorSearch {
                table: CONDITIONAL_TABLE,
                column: VECTOR_COLUMN,
                query,
                limit: k,
                filter: Some(ENABLED_FILTER.to_string()),
            })
            .await?;

        let mut candidates = Vec::new();
        for batch in &batches {
            let guidelines = extract_guidelines(batch, false)?;
            let Some(distances) = float_column(batch, "_distance") else {
                warn!("search result batch missing _distance column");
                continue;
            };
            for (row, guideline) in guidelines.into_iter().enumerate() {
                candidates.push(Candidate {
                    guideline,
                    similarity: 1.0 - distances.value(row),
                });
            }
        }
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn insert(&self, guideline: Guideline) -> Result<(), AppError> {
        guideline.validate()?;
        if self.locate(guideline.id).await?.is_some() {
            return Err(AppError::InvalidGuideline {
                id: guideline.id,
                reason: "id already exists".to_string(),
            });
        }

        let table = Self::table_for(guideline.is_global);
        let batch = if guideline.is_global {
            build_global_batch(std::slice::from_ref(&guideline))?
        } else {
            build_conditional_batch(std::slice::from_ref(&guideline), self.dimensions)?
        };
        self.vectordb.append(table, batch).await?;
        info!(id = guideline.id, table, "guideline inserted");
        Ok(())
    }

    async fn replace_all(&self, guidelines: Vec<Guideline>) -> Result<(), AppError> {
        for g in &guidelines {
            g.validate()?;
        }
        let (globals, conditionals): (Vec<Guideline>, Vec<Guideline>) =
            guidelines.into_iter().partition(|g| g.is_global);

        let global_batches = if globals.is_empty() {
            Vec::new()
        } else {
            vec![build_global_batch(&globals)?]
        };
        let conditional_batches = if conditionals.is_empty() {
            Vec::new()
        } else {
            vec![build_conditional_batch(&conditionals, self.dimensions)?]
        };

        // Both tables change together or not at all.
        self.vectordb
            .replace_tables(vec![
                TableReplacement {
                    name: GLOBAL_TABLE,
                    schema: global_schema(),
                    batches: global_batches,
                },
                TableReplacement {
                    name: CONDITIONAL_TABLE,
                    schema: conditional_schema(self.dimensions),
                    batches: conditional_batches,
                },
            ])
            .await?;

        info!(
            global = globals.len(),
            conditional = conditionals.len(),
            "guideline tables replaced"
        );
        Ok(())
    }

    async fn set_disabled(&self, id: GuidelineId, disabled: bool) -> Result<(), AppError> {
        let table = self.locate(id).await?.ok_or(AppError::NotFound(id))?;
        let value = if disabled { "true" } else { "false" };
        self.vectordb
            .update_column(table, format!("id = {id}"), "is_disabled", value)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: GuidelineId) -> Result<(), AppError> {
        let table = self.locate(id).await?.ok_or(AppError::NotFound(id))?;
        self.vectordb.delete_rows(table, &format!("id = {id}")).await?;
        info!(id, table, "guideline deleted");
        Ok(())
    }
}

// --- Arrow conversion ---

fn global_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("directive", DataType::Utf8, false),
        Field::new("is_disabled", DataType::Boolean, false),
    ]))
}

fn vector_type(dimensions: usize) -> DataType {
    DataType::FixedSizeList(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dimensions as i32,
    )
}

fn conditional_schema(dimensions: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("condition", DataType::Utf8, false),
        Field::new("directive", DataType::Utf8, false),
        Field::new("is_disabled", DataType::Boolean, false),
        Field::new(VECTOR_COLUMN, vector_type(dimensions), false),
    ]))
}

fn arrow_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::Common(CommonError::VectorDb(format!("{context}: {e}")))
}

fn build_global_batch(guidelines: &[Guideline]) -> Result<RecordBatch, AppError> {
    let ids: ArrayRef = Arc::new(Int64Array::from_iter_values(guidelines.iter().map(|g| g.id)));
    let directives: ArrayRef = Arc::new(StringArray::from_iter_values(
        guidelines.iter().map(|g| g.directive.as_str()),
    ));
    let disabled: ArrayRef = Arc::new(BooleanArray::from(
        guidelines.iter().map(|g| g.is_disabled).collect::<Vec<_>>(),
    ));

    RecordBatch::try_new(global_schema(), vec![ids, directives, disabled])
        .map_err(|e| arrow_error("failed to build global batch", e))
}

fn build_conditional_batch(guidelines: &[Guideline], dimensions: usize) -> Result<RecordBatch, AppError> {
    let mut flat_values = Vec::with_capacity(guidelines.len() * dimensions);
    for g in guidelines {
        let vector = g.condition_vector.as_deref().unwrap_or_default();
        if vector.len() != dimensions {
            return Err(AppError::InvalidGuideline {
                id: g.id,
                reason: format!(
                    "condition vector has {} dimensions, expected {dimensions}",
                    vector.len()
                ),
            });
        }
        flat_values.extend_from_slice(vector);
    }

    let ids: ArrayRef = Arc::new(Int64Array::from_iter_values(guidelines.iter().map(|g| g.id)));
    let conditions: ArrayRef = Arc::new(StringArray::from_iter_values(
        guidelines
            .iter()
            .map(|g| g.condition.as_deref().unwrap_or_default()),
    ));
    let directives: ArrayRef = Arc::new(StringArray::from_iter_values(
        guidelines.iter().map(|g| g.directive.as_str()),
    ));
    let disabled: ArrayRef = Arc::new(BooleanArray::from(
        guidelines.iter().map(|g| g.is_disabled).collect::<Vec<_>>(),
    ));
    let vectors: ArrayRef = Arc::new(
        FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            dimensions as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| arrow_error("failed to build condition vector array", e))?,
    );

    RecordBatch::try_new(
        conditional_schema(dimensions),
        vec![ids, conditions, directives, disabled, vectors],
    )
    .map_err(|e| arrow_error("failed to build conditional batch", e))
}

fn extract_guidelines(batch: &RecordBatch, is_global: bool) -> Result<Vec<Guideline>, AppError> {
    let missing = |name: &str| arrow_error("guideline batch is malformed", format!("missing column {name}"));

    let ids = batch
        .column_by_name("id")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| missing("id"))?;
    let directives = string_column(batch, "directive").ok_or_else(|| missing("directive"))?;
    let disabled = batch
        .column_by_name("is_disabled")
        .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
        .ok_or_else(|| missing("is_disabled"))?;

    let (conditions, vectors) = if is_global {
        (None, None)
    } else {
        let conditions = string_column(batch, "condition").ok_or_else(|| missing("condition"))?;
        let vectors = batch
            .column_by_name(VECTOR_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());
        (Some(conditions), vectors)
    };

    let mut guidelines = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let condition_vector = vectors.and_then(|list| {
            let values = list.value(row);
            values
                .as_any()
                .downcast_ref::<Float32Array>()
                .map(|v| v.values().to_vec())
        });
        guidelines.push(Guideline {
            id: ids.value(row),
            condition: conditions.map(|c| c.value(row).to_string()),
            directive: directives.value(row).to_string(),
            is_global,
            is_disabled: disabled.value(row),
            condition_vector,
        });
    }
    Ok(guidelines)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<StringArray>()
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a Float32Array> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<Float32Array>()
}
