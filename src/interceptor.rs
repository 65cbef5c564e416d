//! The marking interceptor: decides, builds, renders and substitutes.

use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use sea_orm::Statement;

use crate::codec::{self, MarkingCodec, MarkingInfo, StandardCodec, StatementDescriptor};
use crate::config::MarkingConfig;
use crate::context::{self, MarkingContext};
use crate::error::{MarkingError, Result};
use crate::id::IdGenerator;

/// Single entry point invoked around every SQL execution.
///
/// Per call:
///
/// 1. disabled config, a kind that is not marked, or SQL that is already
///    marked: pass the original through;
/// 2. otherwise take the next execution sequence number, build the marking
///    and insert it;
/// 3. any error or panic in step 2 is logged and the original SQL is used.
///
/// The execution counter counts calls that reach step 2, whether or not
/// marking succeeds.
///
/// # Example
///
/// ```rust
/// use sea_orm_marking::{CommandKind, MarkingInterceptor, StatementDescriptor};
///
/// let interceptor = MarkingInterceptor::default();
/// let descriptor = StatementDescriptor::new("findByName", CommandKind::Select);
/// let sql = interceptor.intercept(&descriptor, "SELECT * FROM test_user WHERE name = ?", None);
/// assert!(sql.starts_with("/* MARKED stmt=findByName|"));
/// assert_eq!(interceptor.execution_count(), 1);
/// ```
#[derive(Debug)]
pub struct MarkingInterceptor {
    config: ArcSwap<MarkingConfig>,
    generator: Arc<IdGenerator>,
    codec: Arc<dyn MarkingCodec>,
    execution_counter: AtomicU64,
}

impl MarkingInterceptor {
    /// Create an interceptor using the shared id generator and the standard codec.
    pub fn new(config: MarkingConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            generator: IdGenerator::global(),
            codec: Arc::new(StandardCodec),
            execution_counter: AtomicU64::new(0),
        }
    }

    pub fn with_generator(mut self, generator: Arc<IdGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MarkingCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Return the SQL to execute: `sql` itself or its marked form.
    ///
    /// `context` overrides the current context of the calling thread or task.
    /// This never fails; marking problems only show up in the log.
    ///
    /// Only the SQL text is rewritten. Parameter bindings are never read or
    /// changed; [`intercept_statement`](Self::intercept_statement) carries a
    /// statement's values over unchanged.
    pub fn intercept<'a>(
        &self,
        descriptor: &StatementDescriptor,
        sql: &'a str,
        context: Option<&MarkingContext>,
    ) -> Cow<'a, str> {
        let config = self.config();

        if !config.enabled
            || !config.marks(descriptor.kind)
            || codec::is_marked(sql, &config)
        {
            return Cow::Borrowed(sql);
        }

        let seq = self.execution_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let ambient;
        let context = match context {
            Some(context) => Some(context),
            None => {
                ambient = context::current();
                ambient.as_deref()
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(MarkingInfo, String)> {
            let info = self.codec.build(descriptor, seq, &self.generator, context)?;
            let marked = self.codec.mark(sql, &info, &config)?;
            Ok((info, marked))
        }))
        .unwrap_or_else(|panic| Err(MarkingError::Codec(panic_message(panic.as_ref()))));

        match outcome {
            Ok((info, marked)) => {
                if config.debug_enabled {
                    log_marking(&config, sql, &marked, &info);
                }
                Cow::Owned(marked)
            }
            Err(e) => {
                tracing::warn!(
                    statement_id = %descriptor.id,
                    seq = seq,
                    error = %e,
                    "SQL marking failed, executing original statement"
                );
                Cow::Borrowed(sql)
            }
        }
    }

    /// Rebuild `stmt` with the SQL returned by [`intercept`](Self::intercept),
    /// keeping its values and backend.
    pub fn intercept_statement(
        &self,
        descriptor: &StatementDescriptor,
        stmt: Statement,
        context: Option<&MarkingContext>,
    ) -> Statement {
        let sql = match self.intercept(descriptor, &stmt.sql, context) {
            Cow::Borrowed(_) => return stmt,
            Cow::Owned(marked) => marked,
        };
        Statement {
            sql,
            values: stmt.values,
            db_backend: stmt.db_backend,
        }
    }

    /// Number of calls that reached the marking step.
    pub fn execution_count(&self) -> u64 {
        self.execution_counter.load(Ordering::Relaxed)
    }

    pub fn reset_execution_count(&self) {
        self.execution_counter.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the active configuration. Lock-free; a concurrent
    /// [`set_config`](Self::set_config) may not be visible yet.
    pub fn config(&self) -> Arc<MarkingConfig> {
        self.config.load_full()
    }

    /// Replace the active configuration. Invalid configurations are refused
    /// and the current one stays in place. Calls already in flight finish
    /// with the snapshot they started with.
    pub fn set_config(&self, config: MarkingConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "Refusing invalid SQL marking config");
            return Err(e);
        }
        tracing::info!(config = %config.summary(), "SQL marking config replaced");
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn generator(&self) -> &Arc<IdGenerator> {
        &self.generator
    }
}

impl Default for MarkingInterceptor {
    fn default() -> Self {
        Self::new(MarkingConfig::default())
    }
}

fn log_marking(config: &MarkingConfig, original: &str, marked: &str, info: &MarkingInfo) {
    tracing::debug!(
        statement_id = %info.statement_id(),
        tracking_id = %info.tracking_id(),
        trace_id = %info.trace_id(),
        seq = info.execution_seq(),
        thread_id = info.thread_id(),
        "SQL marked"
    );

    if config.verbose_logging {
        tracing::debug!(sql = %collapse_whitespace(original), "Original SQL");
        tracing::debug!(sql = %collapse_whitespace(marked), "Marked SQL");
    }
}

fn collapse_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic while marking".to_string()
    }
}
