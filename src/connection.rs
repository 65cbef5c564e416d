//! Marking database connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, ExecResult, QueryResult, Statement,
    StreamTrait,
};

use crate::codec::StatementDescriptor;
use crate::config::MarkingConfig;
use crate::context::MarkingContext;
use crate::interceptor::MarkingInterceptor;
use crate::parser::{self, CommandKind};

/// A marking wrapper around SeaORM's `DatabaseConnection`.
///
/// Implements `ConnectionTrait` and `StreamTrait`, so it is a drop-in
/// replacement for `DatabaseConnection`. Every statement passes through the
/// [`MarkingInterceptor`] before it reaches the database; bound values are
/// never touched.
///
/// # Context
///
/// A context bound with [`with_context`](Self::with_context) is used for
/// every statement run through that handle. Without one, the ambient
/// context applies: the task scope opened with
/// [`context::scope_async`](crate::context::scope_async), or the thread's
/// context in synchronous code.
///
/// Handles are cheap to clone and share one underlying connection.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use sea_orm_marking::{context, MarkedConnection, MarkingContext};
///
/// let db = Database::connect("postgres://localhost/mydb").await?;
/// let marked = MarkedConnection::from(db);
///
/// let request = MarkingContext::builder().user_id("u001").build();
/// let users = Users::find().all(&marked.with_context(request)).await?;
///
/// // or for everything the task runs
/// let request = MarkingContext::builder().user_id("u002").build();
/// context::scope_async(request, async {
///     Users::find().all(&marked).await
/// })
/// .await?;
/// ```
#[derive(Debug, Clone)]
pub struct MarkedConnection {
    inner: Arc<DatabaseConnection>,
    interceptor: Arc<MarkingInterceptor>,
    context: Option<Arc<MarkingContext>>,
    statement_id: Option<String>,
}

impl MarkedConnection {
    /// Create a new marked connection with the given configuration.
    pub fn new(connection: DatabaseConnection, config: MarkingConfig) -> Self {
        Self::with_interceptor(connection, Arc::new(MarkingInterceptor::new(config)))
    }

    /// Create a new marked connection with default configuration.
    pub fn wrap(connection: DatabaseConnection) -> Self {
        Self::new(connection, MarkingConfig::default())
    }

    /// Share an interceptor, and with it the execution counter and config,
    /// between several connections.
    pub fn with_interceptor(
        connection: DatabaseConnection,
        interceptor: Arc<MarkingInterceptor>,
    ) -> Self {
        Self {
            inner: Arc::new(connection),
            interceptor,
            context: None,
            statement_id: None,
        }
    }

    /// A handle that marks its statements with `context`.
    pub fn with_context(&self, context: Arc<MarkingContext>) -> Self {
        Self {
            context: Some(context),
            ..self.clone()
        }
    }

    /// A handle that reports `id` as the statement id instead of deriving
    /// one from the SQL.
    pub fn with_statement_id(&self, id: impl Into<String>) -> Self {
        Self {
            statement_id: Some(id.into()),
            ..self.clone()
        }
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn interceptor(&self) -> &Arc<MarkingInterceptor> {
        &self.interceptor
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`, or
    /// `None` while other handles to it are still alive.
    pub fn into_inner(self) -> Option<DatabaseConnection> {
        Arc::into_inner(self.inner)
    }

    fn descriptor(&self, sql: &str) -> StatementDescriptor {
        let id = match &self.statement_id {
            Some(id) => id.clone(),
            None => parser::derive_statement_id(sql),
        };
        StatementDescriptor::new(id, CommandKind::detect(sql))
    }

    fn mark(&self, stmt: Statement) -> Statement {
        let descriptor = self.descriptor(&stmt.sql);
        self.interceptor
            .intercept_statement(&descriptor, stmt, self.context.as_deref())
    }
}

impl From<DatabaseConnection> for MarkedConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::wrap(connection)
    }
}

impl AsRef<DatabaseConnection> for MarkedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for MarkedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let stmt = self.mark(stmt);
        self.inner.execute(stmt).await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let descriptor = self.descriptor(sql);
        let sql = self
            .interceptor
            .intercept(&descriptor, sql, self.context.as_deref());
        self.inner.execute_unprepared(&sql).await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let stmt = self.mark(stmt);
        self.inner.query_one(stmt).await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let stmt = self.mark(stmt);
        self.inner.query_all(stmt).await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl StreamTrait for MarkedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let stmt = self.mark(stmt);
        self.inner.stream(stmt)
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait MarkingExt {
    /// Wrap this connection with default SQL marking.
    fn with_marking(self) -> MarkedConnection;

    /// Wrap this connection with a custom marking configuration.
    fn with_marking_config(self, config: MarkingConfig) -> MarkedConnection;
}

impl MarkingExt for DatabaseConnection {
    fn with_marking(self) -> MarkedConnection {
        MarkedConnection::wrap(self)
    }

    fn with_marking_config(self, config: MarkingConfig) -> MarkedConnection {
        MarkedConnection::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use sea_orm::{MockDatabase, MockExecResult, Value};
    use std::collections::BTreeMap;

    fn mock(exec_results: usize) -> DatabaseConnection {
        MockDatabase::new(DbBackend::Postgres)
            .append_exec_results(
                (0..exec_results)
                    .map(|_| MockExecResult {
                        last_insert_id: 0,
                        rows_affected: 1,
                    })
                    .collect::<Vec<_>>(),
            )
            .append_query_results(vec![Vec::<BTreeMap<&str, Value>>::new()])
            .into_connection()
    }

    fn executed(marked: MarkedConnection) -> String {
        let db = marked.into_inner().expect("last handle");
        format!("{:?}", db.into_transaction_log())
    }

    #[tokio::test]
    async fn test_execute_is_marked() {
        let marked = mock(1).with_marking();
        marked
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "DELETE FROM test_user WHERE id = $1",
                [1i32.into()],
            ))
            .await
            .unwrap();

        assert_eq!(marked.interceptor().execution_count(), 1);
        let log = executed(marked);
        assert!(log.contains("/* MARKED stmt=delete_test_user|tracking="));
        assert!(log.contains(" END_MARKED */ DELETE FROM test_user WHERE id = $1"));
    }

    #[tokio::test]
    async fn test_query_uses_bound_context_and_statement_id() {
        let marked = mock(0).with_marking();
        let request = MarkingContext::builder()
            .user_id("u001")
            .request_id("req-9")
            .build();

        marked
            .with_context(request)
            .with_statement_id("UserMapper.findByName")
            .query_all(Statement::from_string(
                DbBackend::Postgres,
                "SELECT * FROM test_user WHERE name = 'x'",
            ))
            .await
            .unwrap();

        let log = executed(marked);
        assert!(log.contains("stmt=findByName|"));
        assert!(log.contains("|user=u001|"));
        assert!(log.contains("custom=requestId=req-9 END_MARKED */ SELECT"));
    }

    #[tokio::test]
    async fn test_execute_unprepared_uses_task_context() {
        let marked = mock(1).with_marking_config(MarkingConfig::production());
        let ambient = MarkingContext::builder().tracking_id("flow-7").build();

        context::scope_async(ambient, async {
            marked
                .execute_unprepared("UPDATE test_user SET age = 1")
                .await
                .unwrap();
        })
        .await;

        let log = executed(marked);
        assert!(log.contains("/* MARKED tracking=flow-7|exec=1|thread="));
    }

    #[tokio::test]
    async fn test_disabled_kind_is_untouched() {
        let config = MarkingConfig::default().with_mark_insert(false);
        let marked = mock(1).with_marking_config(config);
        marked
            .execute(Statement::from_string(
                DbBackend::Postgres,
                "INSERT INTO test_user (name) VALUES ('a')",
            ))
            .await
            .unwrap();

        assert_eq!(marked.interceptor().execution_count(), 0);
        assert!(!executed(marked).contains("MARKED"));
    }

    #[tokio::test]
    async fn test_shared_interceptor_counts_across_handles() {
        let interceptor = Arc::new(MarkingInterceptor::default());
        let first = MarkedConnection::with_interceptor(mock(1), Arc::clone(&interceptor));
        let second = MarkedConnection::with_interceptor(mock(1), Arc::clone(&interceptor));

        first.execute_unprepared("DELETE FROM a").await.unwrap();
        second.execute_unprepared("DELETE FROM b").await.unwrap();

        assert_eq!(interceptor.execution_count(), 2);
        assert!(executed(second).contains("exec=2"));
    }

    #[test]
    fn test_descriptor_derivation() {
        let marked = MarkedConnection::from(mock(0));
        let descriptor = marked.descriptor("/* hint */ SELECT id FROM orders");
        assert_eq!(descriptor.id, "select_orders");
        assert_eq!(descriptor.kind, CommandKind::Select);

        let named = marked.with_statement_id("OrderMapper.list");
        assert_eq!(named.descriptor("SELECT 1").id, "OrderMapper.list");
    }

    #[tokio::test]
    async fn test_handles_share_one_connection() {
        let marked = mock(2).with_marking();
        let request = marked.with_context(Arc::new(MarkingContext::with_user_id("u9")));
        request.execute_unprepared("DELETE FROM a").await.unwrap();

        assert!(marked.clone().into_inner().is_none());
        drop(request);
        marked.execute_unprepared("DELETE FROM b").await.unwrap();

        let log = executed(marked);
        assert!(log.contains("|user=u9|"));
        assert!(log.contains(" END_MARKED */ DELETE FROM a"));
        assert!(log.contains(" END_MARKED */ DELETE FROM b"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_interleaved_tasks_do_not_share_context() {
        let marked = mock(2).with_marking();

        let scoped = marked.clone();
        let alice = tokio::spawn(context::scope_async(
            Arc::new(MarkingContext::new()),
            async move {
                context::set_current_user_id("alice");
                tokio::task::yield_now().await;
                scoped.execute_unprepared("DELETE FROM a").await.unwrap();
            },
        ));

        let unscoped = marked.clone();
        let other = tokio::spawn(async move {
            context::set_current_user_id("mallory");
            tokio::task::yield_now().await;
            unscoped.execute_unprepared("DELETE FROM b").await.unwrap();
        });

        alice.await.unwrap();
        other.await.unwrap();

        let log = executed(marked);
        assert_eq!(log.matches("user=").count(), 1);
        assert!(log.contains("|user=alice|"));
        assert!(!log.contains("mallory"));
    }

    #[tokio::test]
    async fn test_context_values_stay_inside_comment() {
        let marked = mock(0).with_marking();
        let hostile = MarkingContext::with_user_id("x */ DROP TABLE test_user; /*");

        marked
            .with_context(Arc::new(hostile))
            .with_statement_id("UserMapper.findByName")
            .query_all(Statement::from_string(DbBackend::Postgres, "SELECT 1"))
            .await
            .unwrap();

        let log = executed(marked);
        assert!(log.contains("|user=x * / DROP TABLE test_user; / *|"));
        assert!(!log.contains("*/ DROP"));
        assert!(log.contains(" END_MARKED */ SELECT 1"));
    }
}
