//! Developer panel listing every query cache entry

use crate::query::{EntrySnapshot, QueryCache};

/// Collapsible inspection panel, closed unless configured otherwise
#[derive(Debug, Clone, Default)]
pub struct DevtoolsPanel {
    open: bool,
}

impl DevtoolsPanel {
    pub fn new(initially_open: bool) -> Self {
        Self {
            open: initially_open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Flip the panel, returning the new state
    pub fn toggle(&mut self) -> bool {
        self.open = !self.open;
        tracing::debug!("Devtools {}", if self.open { "opened" } else { "closed" });
        self.open
    }

    pub fn render<T: Clone + Send + Sync + 'static>(&self, cache: &QueryCache<T>) -> String {
        if !self.open {
            return "[devtools] closed".to_string();
        }
        render_rows(&cache.snapshot())
    }
}

fn render_rows(entries: &[EntrySnapshot]) -> String {
    let mut lines = vec![format!("[devtools] {} queries", entries.len())];
    lines.extend(entries.iter().map(|e| {
        let age = match e.data_age_ms {
            Some(ms) => format!("{}ms", ms),
            None => "-".to_string(),
        };
        let mut line = format!(
            "  {} status={} fetch={} observers={} fetches={} failures={} age={}{}",
            e.key,
            e.status,
            e.fetch_status,
            e.observers,
            e.fetch_count,
            e.failure_count,
            age,
            if e.stale { " stale" } else { "" }
        );
        if let Some(error) = &e.error {
            line.push_str(&format!(" error={:?}", error));
        }
        line
    }));
    lines.join("\n")
}
