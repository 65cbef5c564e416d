//! # sea-orm-marking
//!
//! Plan-neutral SQL comment marking for SeaORM database operations.
//!
//! Every statement sent through a [`MarkedConnection`] gets a block comment
//! with correlation metadata in front of it: statement id, tracking and
//! trace ids, execution sequence number, thread, user, timestamp and custom
//! tags. The statement body is left untouched, so plan caches and
//! fingerprint-based monitoring see the same statement as before, while
//! database logs and slow-query reports can be joined with application logs.
//!
//! ## Features
//!
//! - **Drop-in**: `MarkedConnection` implements `ConnectionTrait` and `StreamTrait`
//! - **Fail-open**: a marking failure is logged and the original SQL runs
//! - **Idempotent**: statements that are already marked are left alone
//! - **Flow context**: user ids and tags follow a request through its async
//!   task ([`context::scope_async`]) or thread, including into threads
//!   spawned with [`context::spawn`]
//! - **Contained**: caller-supplied values cannot close or nest the comment
//! - **Coordinator-free ids**: tracking and trace ids built from machine,
//!   process, time and counter
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sea_orm_marking::{context, MarkedConnection, MarkingContext};
//!
//! let db = Database::connect("postgres://localhost/mydb").await?;
//! let marked = MarkedConnection::from(db);
//!
//! let request = MarkingContext::builder().user_id("u001").build();
//! let users = context::scope_async(request, async {
//!     Users::find().all(&marked).await
//! })
//! .await?;
//! ```
//!
//! ## Marking Format
//!
//! ```text
//! /* MARKED stmt=findByName|tracking=0A1B-002-1700000000000-7|exec=7|thread=42
//!    |user=u001|ts=1700000000000 END_MARKED */ SELECT * FROM test_user WHERE name = ?
//! ```
//!
//! (one line in practice; wrapped here)
//!
//! | Field | Description |
//! |-------|-------------|
//! | `stmt` | Statement id, without namespace |
//! | `tracking` | Tracking id, from the flow context or generated |
//! | `trace` | Trace id, from the flow context or generated |
//! | `exec` | Per-interceptor execution sequence number |
//! | `thread` | Thread that created the flow context |
//! | `user` | User id from the flow context |
//! | `ts` | Unix milliseconds |
//! | `custom` | `key=value` tags, cut at `max_custom_info_length` |
//!
//! The simple form (`include_full_info = false`) renders `tracking`, `exec`
//! and `thread` only.

pub mod codec;
mod config;
mod connection;
pub mod context;
mod error;
mod id;
mod interceptor;
mod parser;

pub use codec::{MarkingCodec, MarkingInfo, StandardCodec, StatementDescriptor};
pub use config::MarkingConfig;
pub use connection::{MarkedConnection, MarkingExt};
pub use context::{ContextBuilder, MarkingContext};
pub use error::{MarkingError, Result};
pub use id::IdGenerator;
pub use interceptor::MarkingInterceptor;
pub use parser::{derive_statement_id, CommandKind};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{MarkedConnection, MarkingConfig, MarkingContext, MarkingExt};
}
