//! Pool-backed database contract consumed by application code (§6). Synchronous calls block the
//! calling thread in the driver; async calls hand the query off to a worker pool and post the
//! completion back through the dispatcher, so handlers observe database results on the same
//! thread as packet handlers — there is no implicit scheduler beyond the dispatcher itself (§9).
//! Grounded on `rusqlite` (bundled), the same driver the teacher's workspace already depended on.
use crate::concurrency::ThreadPool;
use crate::dispatcher::Dispatcher;
use flux::error::{CoreError, CoreResult};
use flux::logging;
use rusqlite::Connection;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub address: String,
    pub pool_size: usize,
}

/// One row of a query result, decoupled from `rusqlite::Row` so it can be moved across threads
/// and into a dispatcher-posted closure.
#[derive(Debug, Clone)]
pub struct Row(pub Vec<Value>);

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<rusqlite::types::ValueRef<'_>> for Value {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        match v {
            rusqlite::types::ValueRef::Null => Value::Null,
            rusqlite::types::ValueRef::Integer(i) => Value::Integer(i),
            rusqlite::types::ValueRef::Real(r) => Value::Real(r),
            rusqlite::types::ValueRef::Text(t) => {
                Value::Text(String::from_utf8_lossy(t).into_owned())
            }
            rusqlite::types::ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

fn row_to_owned(row: &rusqlite::Row<'_>, column_count: usize) -> rusqlite::Result<Row> {
    let mut values = Vec::with_capacity(column_count);
    for idx in 0..column_count {
        values.push(Value::from(row.get_ref(idx)?));
    }
    Ok(Row(values))
}

/// A connection pool of `pool_size` synchronous `rusqlite` connections, plus a dedicated worker
/// pool that drains async requests so callers of `query_async`/`execute_async` never block.
pub struct Database {
    connections: crossbeam_queue::SegQueue<Connection>,
    workers: Arc<ThreadPool>,
    log: logging::Logger,
}

impl Database {
    pub fn open(config: &DatabaseConfig, db_worker_count: usize, log: logging::Logger) -> CoreResult<Arc<Database>> {
        let connections = crossbeam_queue::SegQueue::new();
        for _ in 0..config.pool_size.max(1) {
            let conn = Connection::open(&config.address)
                .map_err(|err| CoreError::DatabaseFailure(err.to_string()))?;
            connections.push(conn);
        }

        Ok(Arc::new(Database {
            connections,
            workers: ThreadPool::new(db_worker_count.max(1), log.clone()),
            log,
        }))
    }

    /// In-memory database, for tests and development.
    pub fn open_in_memory(pool_size: usize, db_worker_count: usize, log: logging::Logger) -> CoreResult<Arc<Database>> {
        let connections = crossbeam_queue::SegQueue::new();
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open_in_memory()
                .map_err(|err| CoreError::DatabaseFailure(err.to_string()))?;
            connections.push(conn);
        }
        Ok(Arc::new(Database {
            connections,
            workers: ThreadPool::new(db_worker_count.max(1), log.clone()),
            log,
        }))
    }

    fn checkout(&self) -> Connection {
        loop {
            if let Some(conn) = self.connections.pop() {
                return conn;
            }
            std::thread::yield_now();
        }
    }

    fn checkin(&self, conn: Connection) {
        self.connections.push(conn);
    }

    /// Blocking query on the calling thread (§6 synchronous `Query`).
    pub fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> CoreResult<Vec<Row>> {
        let conn = self.checkout();
        let result = (|| {
            let mut stmt = conn.prepare(sql)?;
            let column_count = stmt.column_count();
            let rows = stmt.query_map(params, |row| row_to_owned(row, column_count))?;
            rows.collect::<rusqlite::Result<Vec<Row>>>()
        })();
        self.checkin(conn);
        result.map_err(|err| CoreError::DatabaseFailure(err.to_string()))
    }

    /// Blocking statement execution on the calling thread (§6 synchronous `Execute`); returns the
    /// number of rows affected.
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> CoreResult<usize> {
        let conn = self.checkout();
        let result = conn.execute(sql, params);
        self.checkin(conn);
        result.map_err(|err| CoreError::DatabaseFailure(err.to_string()))
    }

    /// Runs `body` inside a transaction on the calling thread (§6 synchronous `BeginTransaction`).
    /// `body` receives the live transaction; a returned `Err` rolls back.
    pub fn with_transaction<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.checkout();
        let txn = conn
            .transaction()
            .map_err(|err| CoreError::DatabaseFailure(err.to_string()))?;
        let result = body(&txn);
        let commit_result = match &result {
            Ok(_) => txn.commit(),
            Err(_) => txn.rollback(),
        };
        self.checkin(conn);
        commit_result.map_err(|err| CoreError::DatabaseFailure(err.to_string()))?;
        result
    }

    /// Runs `sql` on a db worker thread and posts the result back through `dispatcher` as a
    /// lambda job, so `on_complete` executes on a dispatcher worker alongside packet handlers.
    pub fn query_async(
        self: &Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        sql: String,
        on_complete: impl FnOnce(CoreResult<Vec<Row>>) + Send + 'static,
    ) {
        let db = Arc::clone(self);
        let log = self.log.clone();
        self.workers.submit(move || {
            let result = db.query(&sql, &[]);
            if let Err(ref err) = result {
                logging::warn!(log, "async query failed"; "error" => %err);
            }
            dispatcher.post_lambda(move || on_complete(result));
        });
    }

    pub fn execute_async(
        self: &Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        sql: String,
        on_complete: impl FnOnce(CoreResult<usize>) + Send + 'static,
    ) {
        let db = Arc::clone(self);
        let log = self.log.clone();
        self.workers.submit(move || {
            let result = db.execute(&sql, &[]);
            if let Err(ref err) = result {
                logging::warn!(log, "async execute failed"; "error" => %err);
            }
            dispatcher.post_lambda(move || on_complete(result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;

    #[test]
    fn synchronous_query_round_trips_through_a_temp_table() {
        let db = Database::open_in_memory(1, 1, logging::discard()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER, name TEXT)", &[]).unwrap();
        db.execute("INSERT INTO t VALUES (1, 'alice')", &[]).unwrap();

        let rows = db.query("SELECT id, name FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0].0[1] {
            Value::Text(name) => assert_eq!(name, "alice"),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory(1, 1, logging::discard()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();

        let result: CoreResult<()> = db.with_transaction(|txn| {
            txn.execute("INSERT INTO t VALUES (1)", [])
                .map_err(|e| CoreError::DatabaseFailure(e.to_string()))?;
            Err(CoreError::DatabaseFailure("forced rollback".to_string()))
        });
        assert!(result.is_err());

        let rows = db.query("SELECT id FROM t", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn async_query_completion_is_posted_through_the_dispatcher() {
        let db = Database::open_in_memory(1, 1, logging::discard()).unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        db.execute("INSERT INTO t VALUES (42)", &[]).unwrap();

        let dispatcher = Dispatcher::new(DispatcherConfig::default(), logging::discard());
        let result_cell: Arc<std::sync::Mutex<Option<usize>>> = Arc::new(std::sync::Mutex::new(None));
        let result_cell2 = Arc::clone(&result_cell);

        db.query_async(Arc::clone(&dispatcher), "SELECT id FROM t".to_string(), move |rows| {
            *result_cell2.lock().unwrap() = Some(rows.unwrap().len());
        });

        // The query runs on a db worker thread; give it a moment to post its completion.
        std::thread::sleep(std::time::Duration::from_millis(50));
        while dispatcher.process_batch() > 0 {}

        assert_eq!(*result_cell.lock().unwrap(), Some(1));
    }
}
