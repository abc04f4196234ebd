//! BDD test world for the timeboard service

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cucumber::World;
use timeboard::api::{TimePayload, TimeQueryFn};
use timeboard::display::TimeDisplay;
use timeboard::io::{HttpClient, HttpResponse};
use timeboard::query::{QueryCache, QueryFn, QueryOptions, RetryPolicy};
use timeboard::TimeboardError;
use tokio::sync::Semaphore;

pub const BASE_URL: &str = "http://backend.test";

/// How the fake backend answers one path
#[derive(Clone)]
pub enum Behaviour {
    Answer(String),
    Fail(String),
    Never,
    /// Answers once a permit is added to the semaphore
    Held(String, Arc<Semaphore>),
}

/// HTTP client standing in for the backends
#[derive(Default)]
pub struct ScriptedBackend {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedBackend {
    pub fn set(&self, path: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(path.to_string(), behaviour);
    }

    pub fn behaviour(&self, path: &str) -> Option<Behaviour> {
        self.behaviours.lock().unwrap().get(path).cloned()
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl HttpClient for ScriptedBackend {
    async fn get(&self, url: &str) -> timeboard::Result<HttpResponse> {
        let path = url.strip_prefix(BASE_URL).unwrap_or(url).to_string();
        *self.calls.lock().unwrap().entry(path.clone()).or_default() += 1;

        let behaviour = self.behaviour(&path);
        match behaviour {
            Some(Behaviour::Answer(body)) => Ok(HttpResponse { status: 200, body }),
            Some(Behaviour::Fail(message)) => Err(TimeboardError::Network(message)),
            Some(Behaviour::Never) => std::future::pending().await,
            Some(Behaviour::Held(body, gate)) => {
                gate.acquire().await.unwrap().forget();
                Ok(HttpResponse { status: 200, body })
            }
            None => Ok(HttpResponse {
                status: 404,
                body: "Not Found".to_string(),
            }),
        }
    }
}

pub fn payload_json(api: &str, time: &str, count: u64) -> String {
    serde_json::to_string(&TimePayload {
        api: api.to_string(),
        current_time: time.to_string(),
        request_count: count,
    })
    .unwrap()
}

#[derive(Default, World)]
pub struct TimeboardWorld {
    pub backend: Arc<ScriptedBackend>,
    pub stale_time: Duration,
    pub cache: Option<QueryCache<TimePayload>>,
    pub displays: HashMap<String, Vec<TimeDisplay>>,
}

impl std::fmt::Debug for TimeboardWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeboardWorld")
            .field("stale_time", &self.stale_time)
            .field("mounted", &self.displays.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TimeboardWorld {
    /// The scenario's cache, created on first use
    pub fn cache(&mut self) -> QueryCache<TimePayload> {
        if self.cache.is_none() {
            let http: Arc<dyn HttpClient> = self.backend.clone();
            let query_fn: Arc<dyn QueryFn<TimePayload>> =
                Arc::new(TimeQueryFn::new(BASE_URL, http).unwrap());
            self.cache = Some(QueryCache::new(
                query_fn,
                QueryOptions {
                    stale_time: self.stale_time,
                    retry: RetryPolicy::never(),
                },
            ));
        }
        self.cache.clone().unwrap()
    }

    pub fn display(&mut self, path: &str) -> &mut TimeDisplay {
        self.displays
            .get_mut(path)
            .and_then(|displays| displays.first_mut())
            .unwrap_or_else(|| panic!("no display mounted for {}", path))
    }
}
