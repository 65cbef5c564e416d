//! Building, rendering and locating marking comments.
//!
//! A marking is a single block comment of the form
//! `{prefix}field=value{sep}field=value...{suffix}` placed in front of the
//! statement, or right after a leading block comment that was already
//! there. Nothing inside the statement body moves, so the fingerprint used
//! by plan caches and statement monitors stays the same.
//!
//! Rendered values never contain `*/` or `/*`: they are rewritten to
//! `* /` and `/ *`, so caller-supplied ids and tags cannot close the
//! marking early or open a nested comment.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::config::MarkingConfig;
use crate::context::{current_thread_id, MarkingContext};
use crate::error::{MarkingError, Result};
use crate::id::{unix_millis, IdGenerator};
use crate::parser::CommandKind;

/// Identity of the statement being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementDescriptor {
    pub id: String,
    pub kind: CommandKind,
}

impl StatementDescriptor {
    pub fn new(id: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Metadata rendered into one marking comment. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkingInfo {
    statement_id: String,
    command_kind: CommandKind,
    execution_seq: u64,
    tracking_id: String,
    trace_id: String,
    timestamp_millis: i64,
    thread_id: u64,
    user_id: Option<String>,
    custom_info: BTreeMap<String, String>,
}

impl MarkingInfo {
    pub fn new(
        descriptor: &StatementDescriptor,
        execution_seq: u64,
        tracking_id: impl Into<String>,
        trace_id: impl Into<String>,
        timestamp_millis: i64,
        thread_id: u64,
    ) -> Self {
        Self {
            statement_id: descriptor.id.clone(),
            command_kind: descriptor.kind,
            execution_seq,
            tracking_id: tracking_id.into(),
            trace_id: trace_id.into(),
            timestamp_millis,
            thread_id,
            user_id: None,
            custom_info: BTreeMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_custom_info(mut self, custom_info: BTreeMap<String, String>) -> Self {
        self.custom_info = custom_info;
        self
    }

    pub fn statement_id(&self) -> &str {
        &self.statement_id
    }

    /// Statement id without its namespace: everything after the last `.`.
    pub fn simple_statement_id(&self) -> &str {
        match self.statement_id.rfind('.') {
            Some(dot) if dot > 0 => &self.statement_id[dot + 1..],
            _ => &self.statement_id,
        }
    }

    pub fn command_kind(&self) -> CommandKind {
        self.command_kind
    }

    pub fn execution_seq(&self) -> u64 {
        self.execution_seq
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn custom_info(&self) -> &BTreeMap<String, String> {
        &self.custom_info
    }

    /// `key=value` pairs joined by `,`, sorted by key, with comment
    /// delimiters broken up.
    pub fn custom_info_string(&self) -> String {
        self.custom_info
            .iter()
            .map(|(key, value)| format!("{}={}", neutralize(key), neutralize(value)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Fields in order `stmt, tracking, trace, exec, thread, user, ts,
    /// custom`. Absent or disabled fields are left out entirely.
    pub fn full_info_string(&self, config: &MarkingConfig) -> String {
        let mut fields = Vec::with_capacity(8);

        if !self.statement_id.is_empty() {
            fields.push(format!("stmt={}", neutralize(self.simple_statement_id())));
        }
        if !self.tracking_id.is_empty() {
            fields.push(format!("tracking={}", neutralize(&self.tracking_id)));
        }
        if !self.trace_id.is_empty() {
            fields.push(format!("trace={}", neutralize(&self.trace_id)));
        }
        fields.push(format!("exec={}", self.execution_seq));
        if config.include_thread_info {
            fields.push(format!("thread={}", self.thread_id));
        }
        if let Some(user_id) = &self.user_id {
            fields.push(format!("user={}", neutralize(user_id)));
        }
        if config.include_timestamp {
            fields.push(format!("ts={}", self.timestamp_millis));
        }
        if config.include_custom_info && !self.custom_info.is_empty() {
            let custom: String = self
                .custom_info_string()
                .chars()
                .take(config.max_custom_info_length)
                .collect();
            fields.push(format!("custom={}", custom));
        }

        fields.join(&config.info_separator)
    }

    /// Fields `tracking, exec, thread` only.
    pub fn simple_info_string(&self, config: &MarkingConfig) -> String {
        let mut fields = Vec::with_capacity(3);

        if !self.tracking_id.is_empty() {
            fields.push(format!("tracking={}", neutralize(&self.tracking_id)));
        }
        fields.push(format!("exec={}", self.execution_seq));
        if config.include_thread_info {
            fields.push(format!("thread={}", self.thread_id));
        }

        fields.join(&config.info_separator)
    }
}

/// Break up block comment delimiters: `*/` becomes `* /`, `/*` becomes `/ *`.
fn neutralize(value: &str) -> Cow<'_, str> {
    if value.contains("*/") || value.contains("/*") {
        Cow::Owned(value.replace("*/", "* /").replace("/*", "/ *"))
    } else {
        Cow::Borrowed(value)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Assemble the marking for one execution.
///
/// A non-blank trace or tracking id on `context` replaces the generated
/// one; ids are only generated when the context does not supply them.
/// Thread and user come from the context when there is one, otherwise the
/// calling thread is recorded.
pub fn build(
    descriptor: &StatementDescriptor,
    execution_seq: u64,
    generator: &IdGenerator,
    context: Option<&MarkingContext>,
) -> MarkingInfo {
    let inherited_tracking = non_blank(context.and_then(|c| c.tracking_id()));
    let inherited_trace = non_blank(context.and_then(|c| c.trace_id()));

    let tracking_id = inherited_tracking.unwrap_or_else(|| generator.generate_tracking_id());
    let trace_id = inherited_trace.unwrap_or_else(|| generator.generate_trace_id());

    let info = MarkingInfo::new(
        descriptor,
        execution_seq,
        tracking_id,
        trace_id,
        unix_millis(),
        context.map_or_else(current_thread_id, |c| c.thread_id()),
    );

    match context {
        Some(context) => info
            .with_user_id(context.user_id())
            .with_custom_info(context.custom_info_snapshot()),
        None => info,
    }
}

/// `prefix + (full | simple info) + suffix`.
pub fn render(info: &MarkingInfo, config: &MarkingConfig) -> Result<String> {
    config.validate()?;

    let body = if config.include_full_info {
        info.full_info_string(config)
    } else {
        info.simple_info_string(config)
    };
    // A separator next to a value can still form a delimiter.
    let body = neutralize(&body);

    Ok(format!("{}{}{}", config.mark_prefix, body, config.mark_suffix))
}

/// Place `comment` in front of the trimmed statement, or directly after
/// its leading block comment when it starts with one.
pub fn insert(sql: &str, comment: &str) -> Result<String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(MarkingError::EmptyStatement);
    }

    if trimmed.starts_with("/*") {
        if let Some(end) = trimmed[2..].find("*/") {
            let (leading, rest) = trimmed.split_at(2 + end + 2);
            return Ok(format!("{} {}{}", leading, comment, rest));
        }
    }

    Ok(format!("{} {}", comment, trimmed))
}

/// Both delimiters occur somewhere in `sql`.
///
/// A user comment or literal containing the same delimiter text is treated
/// as marked as well.
pub fn is_marked(sql: &str, config: &MarkingConfig) -> bool {
    sql.contains(config.mark_prefix.as_str()) && sql.contains(config.mark_suffix.as_str())
}

/// Byte range of the first `prefix ... suffix` span, the suffix being
/// searched from the end of the prefix.
fn marking_span(sql: &str, config: &MarkingConfig) -> Option<(usize, usize, usize)> {
    if config.mark_prefix.is_empty() || config.mark_suffix.is_empty() {
        return None;
    }
    let start = sql.find(config.mark_prefix.as_str())?;
    let body_start = start + config.mark_prefix.len();
    let suffix_at = body_start + sql[body_start..].find(config.mark_suffix.as_str())?;
    Some((start, body_start, suffix_at))
}

/// Remove the first marking and the single space `insert` added before it.
/// Unmarked SQL is returned unchanged.
pub fn extract_original(marked_sql: &str, config: &MarkingConfig) -> String {
    let Some((start, _, suffix_at)) = marking_span(marked_sql, config) else {
        return marked_sql.to_string();
    };

    let mut before = &marked_sql[..start];
    if !before.trim().is_empty() {
        before = before.strip_suffix(' ').unwrap_or(before);
    }
    let after = &marked_sql[suffix_at + config.mark_suffix.len()..];

    format!("{}{}", before, after).trim().to_string()
}

/// Trimmed text between the delimiters of the first marking.
pub fn extract_info(marked_sql: &str, config: &MarkingConfig) -> Option<String> {
    marking_span(marked_sql, config)
        .map(|(_, body_start, suffix_at)| marked_sql[body_start..suffix_at].trim().to_string())
}

/// Split an extracted info string into `(field, value)` pairs, in order.
///
/// Values may contain `=`; only the first one separates the field name.
pub fn parse_fields(info: &str, separator: &str) -> Vec<(String, String)> {
    if separator.is_empty() {
        return Vec::new();
    }
    info.split(separator)
        .filter_map(|field| field.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// False only for SQL that looks marked but carries an empty marking.
pub fn validate_marked(sql: &str, config: &MarkingConfig) -> bool {
    if sql.trim().is_empty() {
        return false;
    }
    if !is_marked(sql, config) {
        return true;
    }
    extract_info(sql, config).is_some_and(|info| !info.is_empty())
}

/// The build and render steps used by the interceptor.
///
/// The default methods delegate to [`build`], [`render`] and [`insert`].
/// Errors returned here (and panics) make the interceptor fall back to the
/// original statement.
pub trait MarkingCodec: Send + Sync + std::fmt::Debug {
    fn build(
        &self,
        descriptor: &StatementDescriptor,
        execution_seq: u64,
        generator: &IdGenerator,
        context: Option<&MarkingContext>,
    ) -> Result<MarkingInfo> {
        Ok(build(descriptor, execution_seq, generator, context))
    }

    fn mark(&self, sql: &str, info: &MarkingInfo, config: &MarkingConfig) -> Result<String> {
        let comment = render(info, config)?;
        insert(sql, &comment)
    }
}

/// The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl MarkingCodec for StandardCodec {}
