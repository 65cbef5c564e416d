//! Basic example showing how to use sea-orm-marking.
//!
//! Runs against SeaORM's mock backend and prints the statements as the
//! database would have received them.
//!
//! Run with: RUST_LOG=debug cargo run --example basic

use std::sync::Arc;

use sea_orm::{ConnectionTrait, DbBackend, MockDatabase, MockExecResult, Statement};
use sea_orm_marking::context;
use sea_orm_marking::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_marking=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db = MockDatabase::new(DbBackend::Postgres)
        .append_exec_results(
            (0..3)
                .map(|_| MockExecResult {
                    last_insert_id: 1,
                    rows_affected: 1,
                })
                .collect::<Vec<_>>(),
        )
        .into_connection();

    // Debug + verbose logging so every marking shows up in the log
    let marked = db.with_marking_config(MarkingConfig::development());

    // Explicit context, bound to a handle: safe across .await points
    let request = MarkingContext::builder()
        .user_id("u001")
        .request_id("req-42")
        .business_tag("signup")
        .build();
    marked
        .with_context(Arc::clone(&request))
        .with_statement_id("UserMapper.insert")
        .execute(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "INSERT INTO test_user (name, age) VALUES ($1, $2)",
            ["alice".into(), 30i32.into()],
        ))
        .await?;

    // Ambient context for everything this task runs
    let job = MarkingContext::builder().module_tag("maintenance").build();
    context::scope_async(job, async {
        context::set_current_user_id("u002");
        marked
            .execute_unprepared("/* nightly job */ UPDATE test_user SET age = age + 1")
            .await?;

        // Already marked statements are left alone
        marked
            .execute_unprepared(
                "/* MARKED exec=0 END_MARKED */ DELETE FROM test_user WHERE age > 120",
            )
            .await
    })
    .await?;

    tracing::info!(
        executions = marked.interceptor().execution_count(),
        ids = %marked.interceptor().generator().statistics(),
        "Done"
    );

    if let Some(db) = marked.into_inner() {
        for transaction in db.into_transaction_log() {
            println!("{:?}", transaction);
        }
    }

    Ok(())
}
