//! Shared fixtures for the warehouse integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::cell::Cell;
use std::rc::Rc;

use dwh_loader::database::{
    ConflictPolicy, Dialect, LoadError, LoadResult, QueryResult, TableName, Warehouse,
    WarehouseSession,
};
use dwh_loader::{
    BatchSchema, ColumnDef, ColumnType, DuckDbSession, DuckDbWarehouse, TabularBatch, Value,
    WarehouseLoader,
};

/// Transaction boundaries observed through a [`CountingWarehouse`]
#[derive(Debug, Default)]
pub struct Counters {
    pub sessions: Cell<usize>,
    pub begins: Cell<usize>,
    pub commits: Cell<usize>,
    pub rollbacks: Cell<usize>,
    /// Fail every BEGIN from this (1-based) attempt onwards
    pub refuse_begin_from: Cell<Option<usize>>,
}

fn bump(cell: &Cell<usize>) {
    cell.set(cell.get() + 1);
}

/// Warehouse wrapper counting sessions and transactions
pub struct CountingWarehouse<W> {
    inner: W,
    pub counters: Rc<Counters>,
}

impl<W> CountingWarehouse<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            counters: Rc::new(Counters::default()),
        }
    }
}

pub struct CountingSession<S> {
    inner: S,
    counters: Rc<Counters>,
}

#[async_trait(?Send)]
impl<W: Warehouse> Warehouse for CountingWarehouse<W> {
    type Session = CountingSession<W::Session>;

    async fn session(&self) -> LoadResult<Self::Session> {
        let inner = self.inner.session().await?;
        bump(&self.counters.sessions);
        Ok(CountingSession {
            inner,
            counters: Rc::clone(&self.counters),
        })
    }

    fn backend_type(&self) -> &'static str {
        self.inner.backend_type()
    }
}

#[async_trait(?Send)]
impl<S: WarehouseSession> WarehouseSession for CountingSession<S> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn begin(&mut self) -> LoadResult<()> {
        bump(&self.counters.begins);
        if let Some(from) = self.counters.refuse_begin_from.get()
            && self.counters.begins.get() >= from
        {
            return Err(LoadError::QueryFailed("BEGIN refused".to_string()));
        }
        self.inner.begin().await
    }

    async fn commit(&mut self) -> LoadResult<()> {
        self.inner.commit().await?;
        bump(&self.counters.commits);
        Ok(())
    }

    async fn rollback(&mut self) -> LoadResult<()> {
        bump(&self.counters.rollbacks);
        self.inner.rollback().await
    }

    async fn execute(&mut self, statement: &str, params: &[Value]) -> LoadResult<u64> {
        self.inner.execute(statement, params).await
    }

    async fn query(&mut self, statement: &str, params: &[Value]) -> LoadResult<QueryResult> {
        self.inner.query(statement, params).await
    }

    async fn insert_many(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Vec<Value>],
        on_conflict: ConflictPolicy,
    ) -> LoadResult<u64> {
        self.inner.insert_many(table, columns, rows, on_conflict).await
    }
}

/// Warehouse whose sessions can never be acquired
pub struct UnreachableWarehouse {
    pub attempts: Cell<usize>,
}

#[async_trait(?Send)]
impl Warehouse for UnreachableWarehouse {
    type Session = DuckDbSession;

    async fn session(&self) -> LoadResult<Self::Session> {
        bump(&self.attempts);
        Err(LoadError::QueryFailed("connection refused".to_string()))
    }

    fn backend_type(&self) -> &'static str {
        "unreachable"
    }
}

pub fn unreachable_loader() -> WarehouseLoader<UnreachableWarehouse> {
    WarehouseLoader::new(UnreachableWarehouse {
        attempts: Cell::new(0),
    })
}

pub type TestLoader = WarehouseLoader<CountingWarehouse<DuckDbWarehouse>>;

/// Loader over a fresh in-memory DuckDB warehouse
pub fn loader() -> TestLoader {
    WarehouseLoader::new(CountingWarehouse::new(DuckDbWarehouse::in_memory().unwrap()))
}

pub fn counters(loader: &TestLoader) -> &Counters {
    &loader.warehouse().counters
}

pub async fn execute(loader: &TestLoader, sql: &str) {
    let mut session = loader.warehouse().session().await.unwrap();
    session.execute(sql, &[]).await.unwrap();
}

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// `client_id`, `segment`, `sector` batch
pub fn client_schema() -> BatchSchema {
    BatchSchema::new(vec![
        ColumnDef::new("client_id", ColumnType::Integer).not_null(),
        ColumnDef::new("segment", ColumnType::Text),
        ColumnDef::new("sector", ColumnType::Text),
    ])
}

pub fn client_batch(rows: &[(i64, Option<&str>, Option<&str>)]) -> TabularBatch {
    let rows = rows
        .iter()
        .map(|(id, segment, sector)| {
            vec![Value::Int(*id), Value::from(*segment), Value::from(*sector)]
        })
        .collect();
    TabularBatch::new(client_schema(), rows).unwrap()
}

/// `txn_id`, `client_id`, `amount`, `created_at` batch of `n` rows, ids 1..=n
pub fn transaction_batch(n: i64) -> TabularBatch {
    let schema = BatchSchema::new(vec![
        ColumnDef::new("txn_id", ColumnType::Integer).not_null(),
        ColumnDef::new("client_id", ColumnType::Integer),
        ColumnDef::new("amount", ColumnType::Float),
        ColumnDef::new("created_at", ColumnType::Timestamp),
    ]);
    let rows = (1..=n)
        .map(|i| {
            vec![
                Value::Int(i),
                Value::Int(i % 3),
                Value::Float(i as f64 * 1250.5),
                Value::Timestamp(at(2024, 1, 1) + chrono::Duration::minutes(i)),
            ]
        })
        .collect();
    TabularBatch::new(schema, rows).unwrap()
}

pub const CREATE_TRANSACTIONS: &str = "CREATE TABLE fact_transactions (\
    txn_id BIGINT PRIMARY KEY, \
    client_id BIGINT, \
    amount DOUBLE, \
    created_at TIMESTAMP, \
    channel VARCHAR DEFAULT 'api')";
