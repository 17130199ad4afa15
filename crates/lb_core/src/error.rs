use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Why a [`Context`](crate::Context) stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Cancelled {
    #[error("context was cancelled")]
    Cancelled,

    #[error("context cancelled: {0}")]
    Reason(String),

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context cancelled for unknown reason")]
    Unknown,
}

/// Errors produced by the result helpers in [`crate::result`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Wrapped(#[from] WrappedError),
}

// ── Aggregate ────────────────────────────────────────────────────────────────

/// Every failure of a batch, each tagged with the index of the input that
/// produced it.
#[derive(Debug)]
pub struct AggregateError {
    message: String,
    errors: Vec<(usize, BoxError)>,
}

impl AggregateError {
    pub fn new(message: impl Into<String>, errors: Vec<(usize, BoxError)>) -> Self {
        Self {
            message: message.into(),
            errors,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = (usize, &(dyn StdError + Send + Sync + 'static))> {
        self.errors.iter().map(|(idx, err)| (*idx, err.as_ref()))
    }

    pub fn into_errors(self) -> Vec<(usize, BoxError)> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} failed)", self.message, self.errors.len())?;
        for (idx, err) in &self.errors {
            write!(f, "; [{idx}] {err}")?;
        }
        Ok(())
    }
}

impl StdError for AggregateError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors
            .first()
            .map(|(_, err)| err.as_ref() as &(dyn StdError + 'static))
    }
}

// ── Wrapped ──────────────────────────────────────────────────────────────────

/// A message composed over one or more underlying causes.
#[derive(Debug)]
pub struct WrappedError {
    message: String,
    causes: Vec<BoxError>,
}

impl WrappedError {
    pub fn new(message: impl Into<String>, causes: Vec<BoxError>) -> Self {
        Self {
            message: message.into(),
            causes,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        self.causes.iter().map(|c| c.as_ref())
    }

    /// The deepest error reachable from any cause. Ties go to the earliest
    /// cause.
    pub fn root_cause(&self) -> Option<&(dyn StdError + 'static)> {
        let mut best: Option<(usize, &(dyn StdError + 'static))> = None;
        for cause in &self.causes {
            let mut depth = 0;
            let mut current: &(dyn StdError + 'static) = cause.as_ref();
            while let Some(next) = current.source() {
                current = next;
                depth += 1;
            }
            if best.map_or(true, |(d, _)| depth > d) {
                best = Some((depth, current));
            }
        }
        best.map(|(_, err)| err)
    }
}

impl fmt::Display for WrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for (i, cause) in self.causes.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{cause}")?;
        }
        Ok(())
    }
}

impl StdError for WrappedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.causes
            .first()
            .map(|c| c.as_ref() as &(dyn StdError + 'static))
    }
}

/// Render an error and its `source()` chain on one line.
pub fn display_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(next) = current {
        let msg = next.to_string();
        if !out.ends_with(&msg) {
            out.push_str(": ");
            out.push_str(&msg);
        }
        current = next.source();
    }
    out
}
