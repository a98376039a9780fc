//! One worker per captured session file (spec §4.E): scans the event log,
//! paces against the shared virtual clock, and applies each event to a
//! live database handle, reconnecting transparently on transport faults.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::capture::event::{decode_event, encode_event, Event};
use crate::error::{Error, Result};
use crate::replay::clock::VirtualClock;
use crate::replay::db::{DatabaseHandle, DbConnection, DbPool, DbStatement};
use crate::stats::Stats;
use crate::Dsn;

/// A remembered prepared statement. The live handle is dropped (but the
/// entry kept) across a transport-fault reconnect, per spec §4.E /
/// invariant 7, and lazily re-prepared the next time it's executed.
struct PreparedHandle {
    sql: String,
    stmt: Option<Box<dyn DbStatement>>,
}

/// Knobs shared by every worker in a replay run (spec §7's "typed
/// construction parameters" — `idle_flush`/`force_start`/`synchronized`
/// are carried here because spec.md names them as `ReplayConfig` fields,
/// even though only the capture-facing assembler ever reads them).
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub dsn: Dsn,
    pub speed: f64,
    pub query_timeout: Duration,
    pub dry_run: bool,
    pub max_line_length: usize,
    pub idle_flush: Duration,
    pub force_start: bool,
    pub synchronized: bool,
}

impl ReplayConfig {
    pub fn new(dsn: Dsn) -> Self {
        Self {
            dsn,
            speed: 1.0,
            query_timeout: Duration::from_secs(30),
            dry_run: false,
            max_line_length: 1 << 20,
            idle_flush: Duration::from_secs(60),
            force_start: false,
            synchronized: false,
        }
    }
}

pub struct ReplayWorker<H: DatabaseHandle> {
    session_id: String,
    path: PathBuf,
    config: Arc<ReplayConfig>,
    clock: Arc<VirtualClock>,
    stats: Arc<dyn Stats>,
    handle: Arc<H>,
}

/// What applying one event against the target actually produced — the
/// tagged outcome from spec §9's "exception-like propagation" design note.
enum Outcome {
    Ok,
    TransportFault(Error),
    LogicalFailure(Error),
}

impl<H: DatabaseHandle + 'static> ReplayWorker<H> {
    pub fn new(
        session_id: String,
        path: PathBuf,
        config: Arc<ReplayConfig>,
        clock: Arc<VirtualClock>,
        stats: Arc<dyn Stats>,
        handle: Arc<H>,
    ) -> Self {
        Self {
            session_id,
            path,
            config,
            clock,
            stats,
            handle,
        }
    }

    #[instrument(skip(self), fields(session = %self.session_id))]
    pub async fn run(self) -> Result<()> {
        let file = std::fs::File::open(&self.path).map_err(Error::Transport)?;
        let reader = std::io::BufReader::new(file);

        let mut pool: Option<Box<dyn DbPool>> = None;
        let mut conn: Option<Box<dyn DbConnection>> = None;
        let mut statements: HashMap<u32, PreparedHandle> = HashMap::new();
        let mut schema: Option<String> = None;
        let mut connected = false;

        self.stats.add("conn.running", 1);

        for line in reader.lines() {
            let line = line.map_err(Error::Transport)?;
            if line.is_empty() {
                continue;
            }
            if line.len() > self.config.max_line_length {
                warn!(len = line.len(), "event line exceeds max_line_length, skipping");
                continue;
            }

            let (ts_ms, event) = match decode_event(&line) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "failed to decode event line, skipping");
                    continue;
                }
            };

            self.pace(ts_ms).await;

            if self.config.dry_run {
                println!("{}", encode_event(ts_ms, &event));
                continue;
            }

            let outcome = self
                .apply_event(&event, &mut pool, &mut conn, &mut statements, &mut schema, &mut connected)
                .await;

            match outcome {
                Outcome::Ok => {}
                Outcome::LogicalFailure(err) => {
                    debug!(error = %err, "event application failed, continuing");
                }
                Outcome::TransportFault(err) => {
                    warn!(error = %err, "transport fault, reconnecting");
                    if connected {
                        self.stats.add("connections", -1);
                        connected = false;
                    }
                    conn = None;
                    for entry in statements.values_mut() {
                        entry.stmt = None;
                    }
                    match self.reconnect(schema.as_deref(), &mut pool, &mut conn).await {
                        Ok(()) => {
                            connected = true;
                            self.stats.add("connections", 1);
                        }
                        Err(err) => {
                            warn!(error = %err, "reconnect failed, will retry on next event");
                        }
                    }
                }
            }
        }

        if let Some(mut c) = conn.take() {
            for entry in statements.values_mut() {
                if let Some(mut stmt) = entry.stmt.take() {
                    stmt.close().await;
                }
            }
            c.close().await;
            if connected {
                self.stats.add("connections", -1);
            }
        }
        if let Some(pool) = pool.take() {
            pool.close().await;
        }

        self.stats.add("conn.running", -1);
        self.stats.clear_lagging(&self.session_id);

        Ok(())
    }

    async fn pace(&self, ts_ms: i64) {
        let Some(scheduled) = self.clock.scheduled_at(ts_ms) else {
            return;
        };
        let now = std::time::Instant::now();
        if scheduled > now {
            self.stats.add("conn.running", -1);
            self.stats.add("conn.waiting", 1);
            tokio::time::sleep_until(scheduled.into()).await;
            self.stats.add("conn.waiting", -1);
            self.stats.add("conn.running", 1);
            self.stats.clear_lagging(&self.session_id);
        } else {
            self.stats.set_lagging(&self.session_id, now - scheduled);
        }
    }

    async fn reconnect(
        &self,
        schema: Option<&str>,
        pool: &mut Option<Box<dyn DbPool>>,
        conn: &mut Option<Box<dyn DbConnection>>,
    ) -> Result<()> {
        let dsn = self.config.dsn.with_schema(schema);
        let new_pool = self.handle.open(&dsn).await?;
        let new_conn = new_pool.conn().await?;
        *pool = Some(new_pool);
        *conn = Some(new_conn);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_event(
        &self,
        event: &Event,
        pool: &mut Option<Box<dyn DbPool>>,
        conn: &mut Option<Box<dyn DbConnection>>,
        statements: &mut HashMap<u32, PreparedHandle>,
        schema: &mut Option<String>,
        connected: &mut bool,
    ) -> Outcome {
        match event {
            Event::Handshake { schema: new_schema } => {
                if let Some(mut c) = conn.take() {
                    c.close().await;
                    if *connected {
                        self.stats.add("connections", -1);
                        *connected = false;
                    }
                }
                if let Some(old_pool) = pool.take() {
                    old_pool.close().await;
                }
                statements.clear();
                *schema = if new_schema.is_empty() {
                    None
                } else {
                    Some(new_schema.clone())
                };

                match self.reconnect(schema.as_deref(), pool, conn).await {
                    Ok(()) => {
                        *connected = true;
                        self.stats.add("connections", 1);
                        Outcome::Ok
                    }
                    Err(err) if err.is_transport_fault() => Outcome::TransportFault(err),
                    Err(err) => Outcome::LogicalFailure(err),
                }
            }
            Event::Query { sql } => {
                if let Err(err) = self.ensure_conn(pool, conn, schema.as_deref(), connected).await {
                    return Outcome::TransportFault(err);
                }
                let c = conn.as_mut().expect("ensure_conn populated connection");
                match tokio::time::timeout(self.config.query_timeout, c.exec(sql)).await {
                    Ok(Ok(())) => {
                        self.stats.add("queries", 1);
                        Outcome::Ok
                    }
                    Ok(Err(err)) => {
                        self.stats.add("err.queries", 1);
                        self.classify(err)
                    }
                    Err(_) => {
                        self.stats.add("err.queries", 1);
                        Outcome::TransportFault(Error::Timeout)
                    }
                }
            }
            Event::StmtPrepare {
                statement_id,
                sql,
                ..
            } => {
                if let Err(err) = self.ensure_conn(pool, conn, schema.as_deref(), connected).await {
                    return Outcome::TransportFault(err);
                }
                let c = conn.as_mut().expect("ensure_conn populated connection");
                match tokio::time::timeout(self.config.query_timeout, c.prepare(sql)).await {
                    Ok(Ok(stmt)) => {
                        self.stats.add("stmt.prepares", 1);
                        if let Some(mut old) = statements.insert(
                            *statement_id,
                            PreparedHandle {
                                sql: sql.clone(),
                                stmt: Some(stmt),
                            },
                        ) {
                            if let Some(mut old_stmt) = old.stmt.take() {
                                old_stmt.close().await;
                            }
                        }
                        Outcome::Ok
                    }
                    Ok(Err(err)) => {
                        self.stats.add("err.stmt.prepares", 1);
                        self.classify(err)
                    }
                    Err(_) => {
                        self.stats.add("err.stmt.prepares", 1);
                        Outcome::TransportFault(Error::Timeout)
                    }
                }
            }
            Event::StmtExecute {
                statement_id,
                params,
            } => {
                if let Err(err) = self.ensure_conn(pool, conn, schema.as_deref(), connected).await {
                    return Outcome::TransportFault(err);
                }

                let Some(entry) = statements.get_mut(statement_id) else {
                    self.stats.add("err.stmt.executes", 1);
                    return Outcome::LogicalFailure(Error::MissingStatement(*statement_id as u64));
                };

                if entry.stmt.is_none() {
                    let c = conn.as_mut().expect("ensure_conn populated connection");
                    match c.prepare(&entry.sql).await {
                        Ok(stmt) => entry.stmt = Some(stmt),
                        Err(err) => {
                            self.stats.add("err.stmt.executes", 1);
                            return self.classify(err);
                        }
                    }
                }

                let stmt = entry.stmt.as_mut().expect("just re-prepared if absent");
                match tokio::time::timeout(self.config.query_timeout, stmt.exec(params)).await {
                    Ok(Ok(())) => {
                        self.stats.add("stmt.executes", 1);
                        Outcome::Ok
                    }
                    Ok(Err(err)) => {
                        self.stats.add("err.stmt.executes", 1);
                        self.classify(err)
                    }
                    Err(_) => {
                        self.stats.add("err.stmt.executes", 1);
                        Outcome::TransportFault(Error::Timeout)
                    }
                }
            }
            Event::StmtClose { statement_id } => {
                if let Some(mut entry) = statements.remove(statement_id) {
                    if let Some(mut stmt) = entry.stmt.take() {
                        stmt.close().await;
                    }
                }
                Outcome::Ok
            }
            Event::Quit => {
                if let Some(mut c) = conn.take() {
                    for entry in statements.values_mut() {
                        if let Some(mut stmt) = entry.stmt.take() {
                            stmt.close().await;
                        }
                    }
                    c.close().await;
                    if *connected {
                        self.stats.add("connections", -1);
                        *connected = false;
                    }
                }
                Outcome::Ok
            }
        }
    }

    async fn ensure_conn(
        &self,
        pool: &mut Option<Box<dyn DbPool>>,
        conn: &mut Option<Box<dyn DbConnection>>,
        schema: Option<&str>,
        connected: &mut bool,
    ) -> Result<()> {
        if conn.is_some() {
            return Ok(());
        }
        self.reconnect(schema, pool, conn).await?;
        *connected = true;
        self.stats.add("connections", 1);
        Ok(())
    }

    fn classify(&self, err: Error) -> Outcome {
        if err.is_transport_fault() {
            Outcome::TransportFault(err)
        } else {
            Outcome::LogicalFailure(err)
        }
    }
}
