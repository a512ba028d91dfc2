//! Include/exclude glob patterns selecting the active tables of a run.

use glob::{MatchOptions, Pattern};

/// Errors raised while validating run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid table pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid concurrency bound {0}: must be at least 1")]
    InvalidConcurrency(usize),

    #[error("invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to parse {format} configuration: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    #[error("unsupported configuration file extension: {0}")]
    UnknownFormat(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compiled include and exclude patterns.
///
/// Excludes always win. With no includes every table is active; otherwise
/// a table is active when an include matches its own name or the name of
/// one of its ancestors.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl PatternSet {
    /// Compile a pattern set. Fails on the first malformed pattern.
    pub fn new<I, E>(includes: I, excludes: E) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// A pattern set that activates everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        matches_any(&self.excludes, name)
    }

    pub fn is_included(&self, name: &str) -> bool {
        self.includes.is_empty() || matches_any(&self.includes, name)
    }

    /// Whether a table is active, given the names of its ancestors
    /// (nearest last, order irrelevant).
    ///
    /// Callers drop excluded ancestors themselves; this only looks at
    /// ancestors for inherited includes.
    pub fn is_active(&self, name: &str, ancestors: &[&str]) -> bool {
        if self.is_excluded(name) {
            return false;
        }
        self.is_included(name) || ancestors.iter().any(|a| matches_any(&self.includes, a))
    }

    /// Filter a flat list of table names, with no ancestry.
    pub fn filter<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        names
            .into_iter()
            .filter(|name| self.is_active(name, &[]))
            .collect()
    }

    pub fn includes(&self) -> impl Iterator<Item = &str> {
        self.includes.iter().map(Pattern::as_str)
    }

    pub fn excludes(&self) -> impl Iterator<Item = &str> {
        self.excludes.iter().map(Pattern::as_str)
    }
}

fn compile<I>(patterns: I) -> Result<Vec<Pattern>, ConfigurationError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            let p = p.as_ref();
            Pattern::new(p).map_err(|e| ConfigurationError::InvalidPattern {
                pattern: p.to_string(),
                reason: e.msg.to_string(),
            })
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], name: &str) -> bool {
    patterns
        .iter()
        .any(|p| p.matches_with(name, MATCH_OPTIONS))
}
