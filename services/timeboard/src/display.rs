//! Time display component
//!
//! Shows one endpoint's cache entry as loading, error, or the server time
//! and request counter. Rendering is a pure function of the entry; the only
//! side effect of the component is the fetch issued when it mounts.

use std::fmt;

use crate::api::TimePayload;
use crate::query::{QueryCache, QueryEntry, QueryObserver, QueryStatus};

/// What a display shows for a given entry state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeView {
    Loading {
        path: String,
    },
    Error {
        message: String,
    },
    Success {
        payload: TimePayload,
        /// A background refetch is running
        updating: bool,
    },
}

impl TimeView {
    pub fn from_entry(path: &str, entry: &QueryEntry<TimePayload>) -> Self {
        if entry.status == QueryStatus::Error {
            return TimeView::Error {
                message: entry
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            };
        }
        match &entry.data {
            Some(payload) => TimeView::Success {
                payload: payload.clone(),
                updating: entry.is_fetching(),
            },
            None => TimeView::Loading {
                path: path.to_string(),
            },
        }
    }
}

impl fmt::Display for TimeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeView::Loading { path } => write!(f, "Loading {}...", path),
            TimeView::Error { message } => write!(f, "An error has occurred: {}", message),
            TimeView::Success { payload, updating } => {
                writeln!(f, "---")?;
                writeln!(f, "API: {}", payload.api)?;
                writeln!(f, "Time from DB: {}", payload.current_time)?;
                writeln!(f, "Request Count: {}", payload.request_count)?;
                write!(f, "{}", if *updating { "Updating..." } else { "" })
            }
        }
    }
}

/// A mounted display bound to one API path
pub struct TimeDisplay {
    observer: QueryObserver<TimePayload>,
}

impl TimeDisplay {
    /// Subscribe to `path`; fetches unless the cache holds a fresh entry
    pub fn mount(cache: &QueryCache<TimePayload>, path: &str) -> Self {
        tracing::debug!("Mounting display for {}", path);
        Self {
            observer: cache.subscribe(path),
        }
    }

    pub fn path(&self) -> &str {
        self.observer.key().as_str()
    }

    pub fn view(&self) -> TimeView {
        TimeView::from_entry(self.path(), &self.observer.current())
    }

    pub fn render(&self) -> String {
        self.view().to_string()
    }

    /// Wait until the underlying entry changes
    pub async fn changed(&mut self) -> bool {
        self.observer.changed().await
    }

    /// Release the subscription; an in-flight fetch nobody else watches is cancelled
    pub fn unmount(self) {
        tracing::debug!("Unmounting display for {}", self.path());
    }
}
