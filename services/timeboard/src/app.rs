//! App root: owns the query cache and composes the displays into frames

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{TimePayload, TimeQueryFn};
use crate::config::Config;
use crate::devtools::DevtoolsPanel;
use crate::display::TimeDisplay;
use crate::io::HttpClient;
use crate::query::{QueryCache, QueryFn};

pub const HEADING: &str = "Hey Team! 👋";
pub const FOOTER: &str = "Every refetch bumps the request count! 🚀";

/// Lower bound for the refetch ticker; `tokio::time::interval` rejects zero
const MIN_REFETCH_INTERVAL: Duration = Duration::from_millis(1);

/// Interactive commands accepted while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCommand {
    ToggleDevtools,
    Refetch,
    Quit,
}

impl AppCommand {
    /// Parse one input line (`d`, `r` or `q`)
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "d" => Some(AppCommand::ToggleDevtools),
            "r" => Some(AppCommand::Refetch),
            "q" => Some(AppCommand::Quit),
            _ => None,
        }
    }
}

pub struct App {
    cache: QueryCache<TimePayload>,
    displays: Vec<TimeDisplay>,
    devtools: DevtoolsPanel,
    refetch_interval: Duration,
    frames: watch::Sender<String>,
}

impl App {
    /// Build the cache for this app's lifetime and mount one display per endpoint
    pub fn new(config: &Config, http: Arc<dyn HttpClient>) -> crate::Result<Self> {
        config.validate()?;
        let query_fn: Arc<dyn QueryFn<TimePayload>> =
            Arc::new(TimeQueryFn::new(&config.base_url, http)?);
        let cache = QueryCache::new(query_fn, config.query.to_options());
        Ok(Self::with_cache(
            cache,
            &config.endpoints,
            DevtoolsPanel::new(config.devtools.initially_open),
            config.query.refetch_interval(),
        ))
    }

    /// Mount displays over an existing cache, e.g. one pre-warmed with data
    pub fn with_cache(
        cache: QueryCache<TimePayload>,
        endpoints: &[String],
        devtools: DevtoolsPanel,
        refetch_interval: Duration,
    ) -> Self {
        let displays = endpoints
            .iter()
            .map(|path| TimeDisplay::mount(&cache, path))
            .collect();
        let (frames, _) = watch::channel(String::new());

        let app = Self {
            cache,
            displays,
            devtools,
            refetch_interval: refetch_interval.max(MIN_REFETCH_INTERVAL),
            frames,
        };
        app.frames.send_replace(app.render());
        tracing::info!("Mounted {} displays", app.displays.len());
        app
    }

    pub fn cache(&self) -> &QueryCache<TimePayload> {
        &self.cache
    }

    pub fn displays(&self) -> &[TimeDisplay] {
        &self.displays
    }

    pub fn devtools(&self) -> &DevtoolsPanel {
        &self.devtools
    }

    /// Latest published frame; used by the dashboard
    pub fn frames(&self) -> watch::Receiver<String> {
        self.frames.subscribe()
    }

    pub fn render(&self) -> String {
        let mut sections = vec![HEADING.to_string()];
        sections.extend(self.displays.iter().map(TimeDisplay::render));
        sections.push(self.devtools.render(&self.cache));
        sections.push(FOOTER.to_string());
        sections.join("\n")
    }

    /// Apply a command. Returns false when the app should stop.
    pub fn handle_command(&mut self, command: AppCommand) -> bool {
        tracing::debug!("Handling command {:?}", command);
        match command {
            AppCommand::ToggleDevtools => {
                self.devtools.toggle();
                true
            }
            AppCommand::Refetch => {
                for display in &self.displays {
                    self.cache.invalidate(display.path());
                }
                true
            }
            AppCommand::Quit => false,
        }
    }

    /// Render frames until cancelled or told to quit, then tear down
    pub async fn run<W: Write>(
        mut self,
        cancel: CancellationToken,
        commands: mpsc::Receiver<AppCommand>,
        mut out: W,
    ) -> crate::Result<()> {
        let mut commands = Some(commands);
        let mut revisions = self.cache.watch_revisions();
        let mut ticker = tokio::time::interval(self.refetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; mounting already fetched.
        ticker.tick().await;

        let mut last_frame = String::new();
        self.present(&mut out, &mut last_frame)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let started = self.cache.refetch_active();
                    tracing::debug!("Interval refetch started {} fetches", started);
                }
                command = next_command(&mut commands) => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            tracing::info!("Quit requested");
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("Command input closed");
                        commands = None;
                    }
                },
            }
            self.present(&mut out, &mut last_frame)?;
        }

        self.shutdown().await;
        Ok(())
    }

    fn present<W: Write>(&self, out: &mut W, last_frame: &mut String) -> crate::Result<()> {
        let frame = self.render();
        if frame == *last_frame {
            return Ok(());
        }
        writeln!(out, "{}\n", frame)?;
        out.flush()?;
        self.frames.send_replace(frame.clone());
        *last_frame = frame;
        Ok(())
    }

    /// Unmount every display, then stop the cache
    pub async fn shutdown(mut self) {
        for display in self.displays.drain(..) {
            display.unmount();
        }
        self.cache.shutdown().await;
        tracing::info!("App stopped");
    }
}

async fn next_command(commands: &mut Option<mpsc::Receiver<AppCommand>>) -> Option<AppCommand> {
    match commands {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
