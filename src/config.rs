//! Configuration for SQL marking behavior.

use crate::error::{MarkingError, Result};
use crate::parser::CommandKind;

/// Configuration options for SQL marking.
///
/// # Example
///
/// ```rust
/// use sea_orm_marking::MarkingConfig;
///
/// let config = MarkingConfig::default()
///     .with_mark_select(false)
///     .with_max_custom_info_length(64);
/// assert!(config.is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkingConfig {
    /// Master switch. Default: `true`
    pub enabled: bool,

    /// Mark SELECT statements. Default: `true`
    pub mark_select: bool,

    /// Mark INSERT statements. Default: `true`
    pub mark_insert: bool,

    /// Mark UPDATE statements. Default: `true`
    pub mark_update: bool,

    /// Mark DELETE statements. Default: `true`
    pub mark_delete: bool,

    /// Log one debug line per marked statement. Default: `false`
    pub debug_enabled: bool,

    /// With `debug_enabled`, also log the original and marked SQL.
    /// Default: `false`
    pub verbose_logging: bool,

    /// Opening delimiter of the marking comment. Default: `"/* MARKED "`
    pub mark_prefix: String,

    /// Closing delimiter of the marking comment. Default: `" END_MARKED */"`
    pub mark_suffix: String,

    /// Render every field instead of `tracking`, `exec` and `thread` only.
    /// Default: `true`
    pub include_full_info: bool,

    /// Render the `ts` field. Default: `true`
    pub include_timestamp: bool,

    /// Render the `thread` field. Default: `true`
    pub include_thread_info: bool,

    /// Render the `custom` field. Default: `true`
    pub include_custom_info: bool,

    /// Hard limit, in characters, for the rendered custom tags. Longer
    /// values are cut without any marker. Default: `200`
    pub max_custom_info_length: usize,

    /// Separator between rendered fields. Default: `"|"`
    pub info_separator: String,
}

impl Default for MarkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mark_select: true,
            mark_insert: true,
            mark_update: true,
            mark_delete: true,
            debug_enabled: false,
            verbose_logging: false,
            mark_prefix: "/* MARKED ".to_string(),
            mark_suffix: " END_MARKED */".to_string(),
            include_full_info: true,
            include_timestamp: true,
            include_thread_info: true,
            include_custom_info: true,
            max_custom_info_length: 200,
            info_separator: "|".to_string(),
        }
    }
}

impl MarkingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_mark_select(mut self, enabled: bool) -> Self {
        self.mark_select = enabled;
        self
    }

    pub fn with_mark_insert(mut self, enabled: bool) -> Self {
        self.mark_insert = enabled;
        self
    }

    pub fn with_mark_update(mut self, enabled: bool) -> Self {
        self.mark_update = enabled;
        self
    }

    pub fn with_mark_delete(mut self, enabled: bool) -> Self {
        self.mark_delete = enabled;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    /// Enable or disable logging of original and marked SQL.
    ///
    /// **Security Warning**: statements may contain literals with sensitive
    /// data. Only takes effect together with [`with_debug`](Self::with_debug).
    pub fn with_verbose_logging(mut self, enabled: bool) -> Self {
        self.verbose_logging = enabled;
        self
    }

    /// Set both comment delimiters.
    ///
    /// They should open and close a block comment, and must not occur in
    /// ordinary statements: presence of both is what marks a statement as
    /// already processed.
    pub fn with_delimiters(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.mark_prefix = prefix.into();
        self.mark_suffix = suffix.into();
        self
    }

    pub fn with_full_info(mut self, enabled: bool) -> Self {
        self.include_full_info = enabled;
        self
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.include_timestamp = enabled;
        self
    }

    pub fn with_thread_info(mut self, enabled: bool) -> Self {
        self.include_thread_info = enabled;
        self
    }

    pub fn with_custom_info(mut self, enabled: bool) -> Self {
        self.include_custom_info = enabled;
        self
    }

    pub fn with_max_custom_info_length(mut self, length: usize) -> Self {
        self.max_custom_info_length = length;
        self
    }

    pub fn with_info_separator(mut self, separator: impl Into<String>) -> Self {
        self.info_separator = separator.into();
        self
    }

    /// Full markings plus debug and verbose logging.
    ///
    /// **Warning**: logs every statement text.
    pub fn development() -> Self {
        Self {
            debug_enabled: true,
            verbose_logging: true,
            ..Self::default()
        }
    }

    /// Abbreviated markings and no per-statement logging.
    pub fn production() -> Self {
        Self {
            include_full_info: false,
            ..Self::default()
        }
    }

    /// Whether statements of `kind` are marked at all.
    pub fn marks(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Select => self.mark_select,
            CommandKind::Insert => self.mark_insert,
            CommandKind::Update => self.mark_update,
            CommandKind::Delete => self.mark_delete,
            CommandKind::Other => false,
        }
    }

    /// Check that delimiters and separator are non-empty and the custom
    /// info limit is positive.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("mark_prefix", &self.mark_prefix),
            ("mark_suffix", &self.mark_suffix),
            ("info_separator", &self.info_separator),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(MarkingError::InvalidConfig {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.max_custom_info_length == 0 {
            return Err(MarkingError::InvalidConfig {
                field: "max_custom_info_length",
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Apply one property using the camelCase key names of the properties
    /// file format. Unknown keys are ignored.
    pub fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        let flag = match key {
            "enabled" => &mut self.enabled,
            "markSelect" => &mut self.mark_select,
            "markInsert" => &mut self.mark_insert,
            "markUpdate" => &mut self.mark_update,
            "markDelete" => &mut self.mark_delete,
            "debugEnabled" => &mut self.debug_enabled,
            "verboseLogging" => &mut self.verbose_logging,
            "includeFullInfo" => &mut self.include_full_info,
            "includeTimestamp" => &mut self.include_timestamp,
            "includeThreadInfo" => &mut self.include_thread_info,
            "includeCustomInfo" => &mut self.include_custom_info,
            "markPrefix" => {
                self.mark_prefix = value.to_string();
                return Ok(());
            }
            "markSuffix" => {
                self.mark_suffix = value.to_string();
                return Ok(());
            }
            "infoSeparator" => {
                self.info_separator = value.to_string();
                return Ok(());
            }
            "maxCustomInfoLength" => {
                self.max_custom_info_length = parse_length(key, value)?;
                return Ok(());
            }
            _ => {
                tracing::debug!(key = %key, "Ignoring unknown SQL marking property");
                return Ok(());
            }
        };
        *flag = parse_bool(key, value)?;
        Ok(())
    }

    /// Apply a set of properties on top of the current values.
    pub fn load_properties<I, K, V>(&mut self, properties: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in properties {
            self.apply_property(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    /// Build a configuration from defaults plus `properties`.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        config.load_properties(properties)?;
        Ok(config)
    }

    /// Parse `key=value` lines. Blank lines and lines starting with `#` or
    /// `!` are skipped; keys are trimmed, values keep inner whitespace so
    /// delimiters such as `/* MARKED ` survive.
    pub fn from_properties_str(text: &str) -> Result<Self> {
        let properties = text
            .lines()
            .filter(|line| {
                let line = line.trim_start();
                !line.is_empty() && !line.starts_with('#') && !line.starts_with('!')
            })
            .map(|line| match line.split_once('=') {
                Some((key, value)) => Ok((key.trim(), value)),
                None => Err(MarkingError::InvalidProperty {
                    key: line.trim().to_string(),
                    value: String::new(),
                    reason: "expected key=value".to_string(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_properties(properties)
    }

    /// One-line description of the toggles.
    pub fn summary(&self) -> String {
        format!(
            concat!(
                "MarkingConfig[enabled={}, select={}, insert={}, update={}, ",
                "delete={}, debug={}, full_info={}]"
            ),
            self.enabled,
            self.mark_select,
            self.mark_insert,
            self.mark_update,
            self.mark_delete,
            self.debug_enabled,
            self.include_full_info
        )
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(MarkingError::InvalidProperty {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_length(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(length) if length > 0 => Ok(length),
        _ => Err(MarkingError::InvalidProperty {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a positive integer".to_string(),
        }),
    }
}
