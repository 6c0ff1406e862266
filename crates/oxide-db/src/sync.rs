//! Schema synchronization.
//!
//! Brings the live store in line with a [`ResolvedSchema`]. The persisted
//! schema map is compared first; only when it differs is the `sync` lock
//! taken and DDL applied, inside one schema-change transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{Backend, TransactionMode};
use crate::dialect::{table_has_rows, ColumnInfo, Dialect};
use crate::error::{DbError, Result};
use crate::executor::Executor;
use crate::identifier::{quote, temporary_name};
use crate::lock::{LockManager, LockOptions};
use crate::options::{ensure_table, get_raw, set_raw, OPTIONS_TABLE, SCHEMA_MAP_KEY};
use crate::params;
use crate::resolver::{
    CollectionMap, ResolvedCollection, ResolvedField, ResolvedSchema, SchemaMap, ID_COLUMN,
};
use crate::schema::DataType;

/// Name of the advisory lock serializing synchronizations.
pub const SYNC_LOCK: &str = "sync";

/// Options controlling destructive sync steps and lock waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Drop tables no collection declares.
    pub drop_tables: bool,
    /// Drop columns no field declares.
    pub drop_columns: bool,
    /// How long to wait for the sync lock.
    pub lock_timeout: Duration,
    /// Delay between lock attempts.
    pub lock_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncOptions {
    /// Creates non-destructive options.
    #[must_use]
    pub fn new() -> Self {
        let lock = LockOptions::default();
        Self {
            drop_tables: false,
            drop_columns: false,
            lock_timeout: lock.timeout,
            lock_interval: lock.interval,
        }
    }

    /// Enables dropping undeclared tables.
    #[must_use]
    pub fn with_drop_tables(mut self, drop: bool) -> Self {
        self.drop_tables = drop;
        self
    }

    /// Enables dropping undeclared columns.
    #[must_use]
    pub fn with_drop_columns(mut self, drop: bool) -> Self {
        self.drop_columns = drop;
        self
    }

    /// Sets the sync lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the delay between lock attempts.
    #[must_use]
    pub fn with_lock_interval(mut self, interval: Duration) -> Self {
        self.lock_interval = interval;
        self
    }

    /// Lock options for the sync lock.
    #[must_use]
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default()
            .with_timeout(self.lock_timeout)
            .with_interval(self.lock_interval)
    }
}

/// Result of a synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The store already matched; nothing was locked or changed.
    Unchanged,
    /// DDL was applied and the new schema map persisted.
    Synchronized,
}

/// Reads the persisted schema map. An undecodable map counts as absent.
pub async fn persisted_map(exec: &dyn Executor) -> Result<Option<SchemaMap>> {
    let Some(json) = get_raw(exec, SCHEMA_MAP_KEY).await? else {
        return Ok(None);
    };
    match SchemaMap::from_json(&json) {
        Ok(map) => Ok(Some(map)),
        Err(err) => {
            warn!(error = %err, "Ignoring undecodable persisted schema map");
            Ok(None)
        }
    }
}

/// Synchronizes the store behind `backend` with `schema`.
pub async fn synchronize(
    backend: &dyn Backend,
    locks: &LockManager,
    schema: &ResolvedSchema,
    options: &SyncOptions,
) -> Result<SyncOutcome> {
    let exec = backend.executor();
    ensure_table(exec).await?;

    if persisted_map(exec).await?.as_ref() == Some(schema.map()) {
        debug!("Schema map unchanged, skipping sync");
        return Ok(SyncOutcome::Unchanged);
    }

    if !locks.lock(exec, SYNC_LOCK, options.lock_options()).await? {
        return Err(DbError::sync(format!(
            "timed out after {:?} waiting for the {SYNC_LOCK} lock",
            options.lock_timeout
        )));
    }

    let outcome = apply_locked(backend, schema, options).await;
    if let Err(err) = locks.unlock(exec, SYNC_LOCK).await {
        warn!(error = %err, "Failed to release sync lock");
    }
    outcome
}

async fn apply_locked(
    backend: &dyn Backend,
    schema: &ResolvedSchema,
    options: &SyncOptions,
) -> Result<SyncOutcome> {
    let exec = backend.executor();
    // Another process may have finished syncing while we waited.
    let previous = persisted_map(exec).await?;
    if previous.as_ref() == Some(schema.map()) {
        debug!("Schema map synchronized concurrently");
        return Ok(SyncOutcome::Unchanged);
    }

    info!(
        dialect = %exec.dialect().kind(),
        collections = schema.collections().len(),
        "Synchronizing schema"
    );
    let tx = backend.begin(TransactionMode::SchemaChange).await?;
    let reconciler = Reconciler {
        exec: tx.executor(),
        dialect: tx.executor().dialect(),
        schema,
        previous: previous.as_ref(),
        options,
    };
    match reconciler.run().await {
        Ok(statements) => {
            tx.commit().await?;
            info!(statements, "Schema synchronized");
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            return Err(err);
        }
    }

    set_raw(exec, SCHEMA_MAP_KEY, &schema.map().to_json()?).await?;
    Ok(SyncOutcome::Synchronized)
}

/// Renames in the order they can be applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    /// Renames to apply right away.
    pub now: Vec<(String, String)>,
    /// Occupants of rename targets that must be dropped before `deferred`.
    pub displaced: Vec<String>,
    /// Renames out of a temporary name onto a displaced name.
    pub deferred: Vec<(String, String)>,
}

impl RenamePlan {
    /// Temporary names that stay in use until `deferred` runs.
    #[must_use]
    pub fn parked(&self) -> BTreeSet<&str> {
        self.deferred.iter().map(|(from, _)| from.as_str()).collect()
    }

    /// Number of renames in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.now.len() + self.deferred.len()
    }

    /// Returns true if nothing is renamed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Orders renames so none lands on an occupied name.
///
/// `occupied` holds the names that exist before any rename. A rename whose
/// target is occupied by another source goes through a temporary name. When
/// `displace` is set, a target occupied by a name that is not renamed away
/// is reported in [`RenamePlan::displaced`] and the rename is finished in
/// [`RenamePlan::deferred`] once the caller has dropped it; otherwise it is
/// an error.
pub fn plan_renames<F>(
    renames: &[(String, String)],
    occupied: &BTreeSet<String>,
    displace: bool,
    mut temp_name: F,
) -> Result<RenamePlan>
where
    F: FnMut() -> String,
{
    let renames: Vec<&(String, String)> = renames.iter().filter(|(from, to)| from != to).collect();
    let sources: BTreeSet<&str> = renames.iter().map(|(from, _)| from.as_str()).collect();

    let mut plan = RenamePlan::default();
    let mut direct = Vec::new();
    let mut unparks = Vec::new();
    for (from, to) in renames {
        if !occupied.contains(to) {
            direct.push((from.clone(), to.clone()));
        } else if sources.contains(to.as_str()) {
            let temp = temp_name();
            plan.now.push((from.clone(), temp.clone()));
            unparks.push((temp, to.clone()));
        } else if displace {
            let temp = temp_name();
            plan.now.push((from.clone(), temp.clone()));
            plan.displaced.push(to.clone());
            plan.deferred.push((temp, to.clone()));
        } else {
            return Err(DbError::sync(format!(
                "cannot rename {from:?} to {to:?}: {to:?} already exists"
            )));
        }
    }

    plan.now.extend(direct);
    plan.now.extend(unparks);
    Ok(plan)
}

struct Reconciler<'a> {
    exec: &'a dyn Executor,
    dialect: &'static dyn Dialect,
    schema: &'a ResolvedSchema,
    previous: Option<&'a SchemaMap>,
    options: &'a SyncOptions,
}

impl Reconciler<'_> {
    /// Applies every step. Returns the number of DDL statements issued
    /// directly.
    async fn run(&self) -> Result<usize> {
        let mut statements = 0;
        let mut live: BTreeSet<String> = self
            .dialect
            .list_tables(self.exec)
            .await?
            .into_iter()
            .collect();

        statements += self.drop_constraints(&live).await?;
        let renames = self.plan_table_renames(&live)?;
        statements += self.rename_tables(&renames.now, &mut live).await?;
        if self.options.drop_tables {
            statements += self.drop_undeclared_tables(&mut live, &renames).await?;
        }
        statements += self.rename_tables(&renames.deferred, &mut live).await?;
        statements += self.create_tables(&mut live).await?;
        for collection in self.schema.collections() {
            statements += self.reconcile_columns(collection).await?;
        }
        statements += self.create_indexes().await?;
        self.create_foreign_keys().await?;
        Ok(statements)
    }

    async fn ddl(&self, sql: &str) -> Result<usize> {
        debug!(sql = %sql, "Applying DDL");
        self.exec.execute(sql, &params! {}).await?;
        Ok(1)
    }

    fn previous_collection(&self, key: &str) -> Option<&CollectionMap> {
        self.previous.and_then(|map| map.get(key))
    }

    /// Tables the engine manages: declared now or previously mapped.
    fn managed_tables(&self) -> BTreeSet<&str> {
        let declared = self.schema.collections().iter().map(|c| c.table.as_str());
        let mapped = self
            .previous
            .into_iter()
            .flat_map(|map| map.iter().map(|(_, c)| c.table.as_str()));
        declared.chain(mapped).collect()
    }

    async fn drop_constraints(&self, live: &BTreeSet<String>) -> Result<usize> {
        let mut statements = 0;
        let managed = self.managed_tables();
        for table in live.iter().filter(|t| managed.contains(t.as_str())) {
            if table == OPTIONS_TABLE {
                continue;
            }
            for index in self.dialect.list_indexes(self.exec, table).await? {
                debug!(table = %table, index = %index.name, "Dropping index");
                statements += self.ddl(&self.dialect.drop_index_sql(&index.name)).await?;
            }
            self.dialect.drop_foreign_keys(self.exec, table).await?;
        }
        Ok(statements)
    }

    fn plan_table_renames(&self, live: &BTreeSet<String>) -> Result<RenamePlan> {
        let renames: Vec<(String, String)> = self
            .schema
            .collections()
            .iter()
            .filter_map(|collection| {
                let previous = self.previous_collection(&collection.key)?;
                (previous.table != collection.table && live.contains(&previous.table))
                    .then(|| (previous.table.clone(), collection.table.clone()))
            })
            .collect();
        plan_renames(&renames, live, self.options.drop_tables, temporary_name)
    }

    async fn rename_tables(&self, renames: &[(String, String)], live: &mut BTreeSet<String>) -> Result<usize> {
        for (from, to) in renames {
            info!(from = %from, to = %to, "Renaming table");
            self.ddl(&self.dialect.rename_table_sql(from, to)).await?;
            live.remove(from);
            live.insert(to.clone());
        }
        Ok(renames.len())
    }

    /// Drops live tables no collection declares, plus tables displaced by a
    /// pending rename. Parked tables are kept.
    async fn drop_undeclared_tables(&self, live: &mut BTreeSet<String>, renames: &RenamePlan) -> Result<usize> {
        let declared: BTreeSet<&str> = self
            .schema
            .collections()
            .iter()
            .map(|c| c.table.as_str())
            .collect();
        let parked = renames.parked();
        let doomed: Vec<String> = live
            .iter()
            .filter(|t| {
                (!declared.contains(t.as_str()) || renames.displaced.contains(*t))
                    && !parked.contains(t.as_str())
                    && t.as_str() != OPTIONS_TABLE
                    && !self.dialect.is_internal_table(t)
            })
            .cloned()
            .collect();

        for table in &doomed {
            info!(table = %table, "Dropping undeclared table");
            self.ddl(&self.dialect.drop_table_sql(table)).await?;
            live.remove(table);
        }
        Ok(doomed.len())
    }

    async fn create_tables(&self, live: &mut BTreeSet<String>) -> Result<usize> {
        let mut statements = 0;
        for collection in self.schema.collections() {
            if live.contains(&collection.table) {
                continue;
            }
            info!(table = %collection.table, "Creating table");
            statements += self
                .ddl(&self.dialect.create_table_sql(&collection.table))
                .await?;
            live.insert(collection.table.clone());
        }
        Ok(statements)
    }

    async fn live_columns(&self, table: &str) -> Result<BTreeMap<String, ColumnInfo>> {
        Ok(self
            .dialect
            .list_columns(self.exec, table)
            .await?
            .into_iter()
            .map(|column| (column.name.clone(), column))
            .collect())
    }

    async fn reconcile_columns(&self, collection: &ResolvedCollection) -> Result<usize> {
        let table = collection.table.as_str();
        let previous = self.previous_collection(&collection.key);
        let mut statements = 0;

        let columns = self.live_columns(table).await?;
        let renames: Vec<(String, String)> = collection
            .fields
            .iter()
            .filter_map(|field| {
                let old = &previous?.fields.get(&field.key)?.column;
                (old != &field.column && columns.contains_key(old))
                    .then(|| (old.clone(), field.column.clone()))
            })
            .collect();
        let occupied: BTreeSet<String> = columns.keys().cloned().collect();
        let plan = plan_renames(&renames, &occupied, self.options.drop_columns, temporary_name)?;
        statements += self.rename_columns(table, &plan.now).await?;

        if self.options.drop_columns {
            let parked = plan.parked();
            for column in self.live_columns(table).await?.keys() {
                let undeclared = collection.field_by_column(column).is_none()
                    || plan.displaced.contains(column);
                if column != ID_COLUMN && undeclared && !parked.contains(column.as_str()) {
                    info!(table = %table, column = %column, "Dropping undeclared column");
                    statements += self
                        .ddl(&self.dialect.drop_column_sql(table, column))
                        .await?;
                }
            }
        }
        statements += self.rename_columns(table, &plan.deferred).await?;

        let columns = self.live_columns(table).await?;
        for field in &collection.fields {
            let previous_type = previous
                .and_then(|c| c.fields.get(&field.key))
                .filter(|f| f.column == field.column)
                .map(|f| f.data_type);
            statements += match columns.get(&field.column) {
                Some(live) => self.reconcile_field(table, field, live, previous_type).await?,
                None => self.add_field(table, field).await?,
            };
        }
        Ok(statements)
    }

    async fn rename_columns(&self, table: &str, renames: &[(String, String)]) -> Result<usize> {
        for (from, to) in renames {
            info!(table = %table, from = %from, to = %to, "Renaming column");
            self.ddl(&self.dialect.rename_column_sql(table, from, to)).await?;
        }
        Ok(renames.len())
    }

    async fn reconcile_field(
        &self,
        table: &str,
        field: &ResolvedField,
        live: &ColumnInfo,
        previous_type: Option<DataType>,
    ) -> Result<usize> {
        let column = field.column.as_str();
        let current = self
            .dialect
            .data_type_of(&live.native_type)
            .or(previous_type)
            .unwrap_or(field.data_type);
        let tighten = live.nullable && !field.nullable;
        let loosen = !live.nullable && field.nullable;

        if current != field.data_type {
            if !DataType::converts_in_place(current, field.data_type) {
                info!(table = %table, column = %column, from = %current, to = %field.data_type, "Recreating column");
                let dropped = self.ddl(&self.dialect.drop_column_sql(table, column)).await?;
                return Ok(dropped + self.add_field(table, field).await?);
            }
            info!(table = %table, column = %column, from = %current, to = %field.data_type, "Changing column type");
            if loosen {
                self.dialect
                    .set_nullable(self.exec, table, column, true)
                    .await?;
            }
            self.dialect
                .change_column_type(self.exec, table, column, field.data_type)
                .await?;
        } else if loosen {
            info!(table = %table, column = %column, "Allowing NULL");
            self.dialect
                .set_nullable(self.exec, table, column, true)
                .await?;
        }

        if tighten {
            info!(table = %table, column = %column, "Requiring NOT NULL");
            let statements = self.backfill(table, field).await?;
            self.dialect
                .set_nullable(self.exec, table, column, false)
                .await?;
            return Ok(statements);
        }
        Ok(0)
    }

    async fn add_field(&self, table: &str, field: &ResolvedField) -> Result<usize> {
        let column = field.column.as_str();
        let backfill = field.backfill_value();
        info!(table = %table, column = %column, data_type = %field.data_type, "Adding column");

        if field.nullable || !table_has_rows(self.exec, table).await? {
            return self
                .ddl(&self.dialect.add_column_sql(
                    table,
                    column,
                    field.data_type,
                    field.nullable,
                    &backfill,
                ))
                .await;
        }

        let mut statements = self
            .ddl(&self.dialect.add_column_sql(table, column, field.data_type, true, &backfill))
            .await?;
        statements += self.backfill(table, field).await?;
        self.dialect
            .set_nullable(self.exec, table, column, false)
            .await?;
        Ok(statements)
    }

    async fn backfill(&self, table: &str, field: &ResolvedField) -> Result<usize> {
        let column = quote(&field.column);
        let sql = format!(
            "UPDATE {} SET {column} = {} WHERE {column} IS NULL",
            quote(table),
            self.dialect.literal(&field.backfill_value())
        );
        let filled = self.exec.execute(&sql, &params! {}).await?;
        if filled > 0 {
            debug!(table = %table, column = %field.column, rows = filled, "Backfilled NULL values");
        }
        Ok(1)
    }

    async fn create_indexes(&self) -> Result<usize> {
        let mut statements = 0;
        for index in self.schema.collections().iter().flat_map(|c| &c.indexes) {
            debug!(table = %index.table, index = %index.name, "Creating index");
            statements += self.ddl(&self.dialect.create_index_sql(index)).await?;
        }
        Ok(statements)
    }

    async fn create_foreign_keys(&self) -> Result<()> {
        for collection in self.schema.collections() {
            if collection.foreign_keys.is_empty() {
                continue;
            }
            debug!(table = %collection.table, count = collection.foreign_keys.len(), "Creating foreign keys");
            self.dialect
                .add_foreign_keys(self.exec, &collection.table, &collection.foreign_keys)
                .await?;
        }
        Ok(())
    }
}
