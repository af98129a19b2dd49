//! Prepared-statement lifecycle manager (`spec.md` §4.4).
//!
//! A size+time-bounded associative store with an eviction callback that
//! closes the backend's resources before the entry is dropped, per the
//! redesign note in `spec.md` §9 — built on `moka`'s sync cache with an
//! eviction listener rather than a framework cache class, the way the
//! teacher reaches for `moka` for its own token cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use flightsql_protocol::error::FlightSqlError;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::backend::SharedBackend;

/// Per-handle state. `Ready` may carry a previously uploaded parameter
/// batch; `Busy` marks a handle currently inside an `Execute`/
/// `ExecuteUpdate` call so a second concurrent call can be rejected
/// with [`FlightSqlError::HandleBusy`] instead of interleaving.
enum PreparedState {
    Ready { parameters: Option<RecordBatch> },
    Busy,
}

struct Entry {
    sql: String,
    dataset_schema: SchemaRef,
    parameter_schema: SchemaRef,
    state: AsyncMutex<PreparedState>,
}

/// A handle-indexed cache of prepared-statement entries. Entries expire
/// after `idle_expiry` of disuse or once `capacity` is exceeded (LRU);
/// eviction runs lazily on the next cache access, so no background
/// thread is needed.
#[derive(Clone)]
pub struct PreparedStatementCache {
    cache: Cache<u64, Arc<Entry>>,
    next_handle: Arc<AtomicU64>,
    backend: SharedBackend,
}

impl PreparedStatementCache {
    pub fn new(backend: SharedBackend, capacity: u64, idle_expiry: Duration) -> Self {
        let evicting_backend = backend.clone();
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(idle_expiry)
            .eviction_listener(move |handle, entry: Arc<Entry>, cause| {
                if !matches!(cause, RemovalCause::Explicit) {
                    debug!(handle, sql = %entry.sql, ?cause, "evicting prepared statement");
                }
                let backend = evicting_backend.clone();
                tokio::spawn(async move {
                    backend.close_prepared(&entry.sql).await;
                });
            })
            .build();
        Self {
            cache,
            next_handle: Arc::new(AtomicU64::new(1)),
            backend,
        }
    }

    /// `ActionCreatePreparedStatementRequest` handler: allocates a fresh
    /// handle in state `Ready { parameters: None }` (`spec.md` §4.4's
    /// `none -> READY` transition).
    pub async fn create(&self, sql: String) -> Result<PreparedStatementHandle, FlightSqlError> {
        let info = self.backend.prepare(&sql).await?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            sql: sql.clone(),
            dataset_schema: info.dataset_schema.clone(),
            parameter_schema: info.parameter_schema.clone(),
            state: AsyncMutex::new(PreparedState::Ready { parameters: None }),
        });
        self.cache.insert(handle, entry);
        Ok(PreparedStatementHandle {
            handle,
            sql,
            dataset_schema: info.dataset_schema,
            parameter_schema: info.parameter_schema,
        })
    }

    /// `DoPut` on a `CommandPreparedStatementQuery`/`Update`: binds a
    /// parameter batch, transitioning `READY -> BOUND -> READY`
    /// (`spec.md` §4.4). Rejects a batch whose schema disagrees with the
    /// statement's declared parameter schema.
    pub async fn bind_parameters(
        &self,
        handle: u64,
        batch: RecordBatch,
    ) -> Result<(), FlightSqlError> {
        let entry = self.get(handle)?;
        if batch.schema().as_ref() != entry.parameter_schema.as_ref() {
            return Err(FlightSqlError::SchemaMismatch);
        }
        let mut state = entry.state.lock().await;
        match &*state {
            PreparedState::Busy => return Err(FlightSqlError::HandleBusy),
            PreparedState::Ready { .. } => {
                *state = PreparedState::Ready {
                    parameters: Some(batch),
                };
            }
        }
        Ok(())
    }

    /// Runs `f` with exclusive access to the handle's bound parameters,
    /// enforcing the parameter-schema gate (`spec.md` §8) and the
    /// concurrent-handle exclusion rule: a second concurrent call on the
    /// same handle gets `HandleBusy` immediately rather than queuing.
    /// The bound parameter batch is consumed by this call (`spec.md`
    /// §4.4's `BOUND -> READY` transition): the handle comes back
    /// unbound regardless of whether `f` used the batch, so a later
    /// `Execute` without a fresh `Bind` sees `parameters: None`.
    pub async fn execute<F, Fut, T>(&self, handle: u64, f: F) -> Result<T, FlightSqlError>
    where
        F: FnOnce(String, Option<RecordBatch>) -> Fut,
        Fut: std::future::Future<Output = Result<T, FlightSqlError>>,
    {
        let entry = self.get(handle)?;
        let mut state = entry.state.lock().await;
        let parameters = match &*state {
            PreparedState::Busy => return Err(FlightSqlError::HandleBusy),
            PreparedState::Ready { parameters } => parameters.clone(),
        };
        if !entry.parameter_schema.fields().is_empty() && parameters.is_none() {
            return Err(FlightSqlError::SchemaMismatch);
        }
        *state = PreparedState::Busy;
        drop(state);

        let result = f(entry.sql.clone(), parameters).await;

        let mut state = entry.state.lock().await;
        *state = PreparedState::Ready { parameters: None };
        result
    }

    /// Idempotent `ActionClosePreparedStatementRequest` handler
    /// (`spec.md` §8): removing an absent handle is not an error.
    pub async fn close(&self, handle: u64) {
        if let Some(entry) = self.cache.remove(&handle) {
            self.backend.close_prepared(&entry.sql).await;
        }
    }

    pub fn schemas(&self, handle: u64) -> Result<(SchemaRef, SchemaRef), FlightSqlError> {
        let entry = self.get(handle)?;
        Ok((entry.dataset_schema.clone(), entry.parameter_schema.clone()))
    }

    pub fn sql(&self, handle: u64) -> Result<String, FlightSqlError> {
        Ok(self.get(handle)?.sql.clone())
    }

    fn get(&self, handle: u64) -> Result<Arc<Entry>, FlightSqlError> {
        self.cache.get(&handle).ok_or(FlightSqlError::HandleNotFound)
    }
}

/// What `create` hands back to the dispatcher to build
/// `ActionCreatePreparedStatementResult`.
pub struct PreparedStatementHandle {
    pub handle: u64,
    pub sql: String,
    pub dataset_schema: SchemaRef,
    pub parameter_schema: SchemaRef,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::datafusion::DataFusionBackend;
    use crate::backend::{BackendCapabilities, KeyReferenceRow, PreparedQueryInfo, PrimaryKeyRow, QueryResult, SqlBackend, TableInfo};
    use arrow_schema::{DataType, Field, Schema};
    use flightsql_protocol::catalog::{SqlInfoValue, TableRef};

    fn cache() -> PreparedStatementCache {
        PreparedStatementCache::new(Arc::new(DataFusionBackend::new()), 100, Duration::from_secs(600))
    }

    /// A backend whose every statement takes a single non-empty
    /// parameter, used to exercise the `BOUND -> READY` consume-once
    /// transition that `DataFusionBackend` (always an empty parameter
    /// schema) cannot.
    struct ParameterizedBackend;

    #[async_trait::async_trait]
    impl SqlBackend for ParameterizedBackend {
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }
        async fn execute_query(&self, _sql: &str, _parameters: Option<&RecordBatch>) -> Result<QueryResult, FlightSqlError> {
            Ok(QueryResult {
                schema: Arc::new(Schema::empty()),
                batches: vec![],
            })
        }
        async fn execute_update(&self, _sql: &str, _parameters: Option<&RecordBatch>) -> Result<i64, FlightSqlError> {
            Ok(0)
        }
        async fn prepare(&self, _sql: &str) -> Result<PreparedQueryInfo, FlightSqlError> {
            Ok(PreparedQueryInfo {
                dataset_schema: Arc::new(Schema::empty()),
                parameter_schema: Arc::new(Schema::new(vec![Field::new("p", DataType::Int32, false)])),
            })
        }
        async fn close_prepared(&self, _sql: &str) {}
        async fn list_catalogs(&self) -> Result<Vec<String>, FlightSqlError> {
            Ok(vec![])
        }
        async fn list_schemas(&self, _catalog: Option<&str>, _schema_filter_pattern: Option<&str>) -> Result<Vec<(Option<String>, String)>, FlightSqlError> {
            Ok(vec![])
        }
        async fn list_tables(&self, _catalog: Option<&str>, _schema_filter_pattern: Option<&str>, _table_name_filter_pattern: Option<&str>, _table_types: &[String]) -> Result<Vec<TableInfo>, FlightSqlError> {
            Ok(vec![])
        }
        async fn sql_info(&self, _codes: &[u32]) -> Result<Vec<(u32, SqlInfoValue)>, FlightSqlError> {
            Ok(vec![])
        }
        async fn primary_keys(&self, _table: &TableRef) -> Result<Vec<PrimaryKeyRow>, FlightSqlError> {
            Ok(vec![])
        }
        async fn imported_keys(&self, _table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError> {
            Ok(vec![])
        }
        async fn exported_keys(&self, _table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError> {
            Ok(vec![])
        }
        async fn cross_reference(&self, _pk_table: &TableRef, _fk_table: &TableRef) -> Result<Vec<KeyReferenceRow>, FlightSqlError> {
            Ok(vec![])
        }
    }

    fn parameterized_cache() -> PreparedStatementCache {
        PreparedStatementCache::new(Arc::new(ParameterizedBackend), 100, Duration::from_secs(600))
    }

    fn single_param_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("p", DataType::Int32, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(arrow_array::Int32Array::from(vec![1]))]).unwrap()
    }

    #[tokio::test]
    async fn execute_consumes_bound_parameters_so_a_later_execute_needs_a_fresh_bind() {
        let cache = parameterized_cache();
        let handle = cache.create("SELECT 1".to_string()).await.unwrap();
        cache.bind_parameters(handle.handle, single_param_batch()).await.unwrap();

        cache
            .execute(handle.handle, |_sql, params| async move {
                assert!(params.is_some(), "first execute should see the just-bound batch");
                Ok::<(), FlightSqlError>(())
            })
            .await
            .unwrap();

        let second = cache
            .execute(handle.handle, |_sql, _params| async { Ok::<(), FlightSqlError>(()) })
            .await;
        assert!(matches!(second, Err(FlightSqlError::SchemaMismatch)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_then_not_found() {
        let cache = cache();
        let handle = cache.create("SELECT * FROM intTable".to_string()).await.unwrap();
        cache.close(handle.handle).await;
        cache.close(handle.handle).await;
        assert!(matches!(
            cache.schemas(handle.handle),
            Err(FlightSqlError::HandleNotFound)
        ));
    }

    #[tokio::test]
    async fn unknown_handle_is_not_found() {
        let cache = cache();
        assert!(matches!(cache.schemas(9999), Err(FlightSqlError::HandleNotFound)));
    }

    #[tokio::test]
    async fn concurrent_execute_on_same_handle_yields_exactly_one_busy() {
        let cache = Arc::new(cache());
        let handle = cache.create("SELECT * FROM intTable".to_string()).await.unwrap();

        let cache_a = cache.clone();
        let cache_b = cache.clone();
        let h = handle.handle;
        let a = tokio::spawn(async move {
            cache_a
                .execute(h, |_sql, _params| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<(), FlightSqlError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = cache_b
            .execute(h, |_sql, _params| async { Ok::<(), FlightSqlError>(()) })
            .await;

        let a = a.await.unwrap();
        let busy_count = [a.is_err(), b.is_err()].iter().filter(|x| **x).count();
        assert_eq!(busy_count, 1);
    }
}
