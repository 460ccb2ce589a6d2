use std::io;

use thiserror::Error;

/// Failures that abort the whole batch before any process spawns, or one run's materialization.
///
/// Launch failures and exhausted retries aren't errors in this sense; they're terminal task
/// states handled by the process pool.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Malformed or empty parameter grid input. Aborts the batch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A template file couldn't be read.
    #[error("couldn't read template {template}: {source}")]
    TemplateRead {
        template: String,
        #[source]
        source: io::Error,
    },

    /// A `{placeholder}` in a template had no substitution. Fatal for one run only.
    #[error("unresolved placeholder {{{placeholder}}} in template {template}")]
    UnresolvedPlaceholder {
        template: String,
        placeholder: String,
    },

    /// Directory or file creation failed for some reason other than already existing.
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: io::Error,
    },
}
