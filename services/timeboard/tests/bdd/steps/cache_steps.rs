//! BDD step definitions for the shared query cache feature

use std::time::Duration;

use cucumber::{given, then, when};
use timeboard::api::TimePayload;
use timeboard::query::{QueryKey, QueryStatus};

use crate::world::TimeboardWorld;

fn payload(api: String, time: String, count: u64) -> TimePayload {
    TimePayload {
        api,
        current_time: time,
        request_count: count,
    }
}

#[given(expr = "the stale time is {int} seconds")]
fn stale_time(world: &mut TimeboardWorld, seconds: u64) {
    assert!(world.cache.is_none(), "stale time must be set before the cache exists");
    world.stale_time = Duration::from_secs(seconds);
}

#[given(expr = "the cache entry for {string} is pre-warmed with api {string} time {string} count {int}")]
fn prewarm(world: &mut TimeboardWorld, path: String, api: String, time: String, count: u64) {
    world.cache().set_data(path, payload(api, time, count));
}

#[when(expr = "the cache entry for {string} is replaced with api {string} time {string} count {int}")]
fn replace_entry(world: &mut TimeboardWorld, path: String, api: String, time: String, count: u64) {
    world.cache().set_data(path, payload(api, time, count));
}

#[then(expr = "the cache entry for {string} has no data")]
fn entry_has_no_data(world: &mut TimeboardWorld, path: String) {
    let entry = world
        .cache()
        .get(&QueryKey::from(path.as_str()))
        .expect("entry should exist");
    assert!(entry.data.is_none());
    assert_eq!(entry.status, QueryStatus::Pending);
    assert!(!entry.is_fetching());
}

#[then(expr = "the cache entry for {string} has {int} observer(s)")]
fn entry_observers(world: &mut TimeboardWorld, path: String, expected: usize) {
    let observers = world.cache().observer_count(&QueryKey::from(path.as_str()));
    assert_eq!(observers, expected);
}
