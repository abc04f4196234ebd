//! BDD step definitions for the time display feature

use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when};
use timeboard::display::TimeDisplay;
use tokio::sync::Semaphore;

use crate::world::{payload_json, Behaviour, TimeboardWorld};

#[given(expr = "a backend at {string} answering api {string} time {string} count {int}")]
fn backend_answering(world: &mut TimeboardWorld, path: String, api: String, time: String, count: u64) {
    world
        .backend
        .set(&path, Behaviour::Answer(payload_json(&api, &time, count)));
}

#[given(expr = "a backend at {string} failing with {string}")]
fn backend_failing(world: &mut TimeboardWorld, path: String, message: String) {
    world.backend.set(&path, Behaviour::Fail(message));
}

#[given(expr = "a backend at {string} that never answers")]
fn backend_silent(world: &mut TimeboardWorld, path: String) {
    world.backend.set(&path, Behaviour::Never);
}

#[given(expr = "a backend at {string} that holds its answer api {string} time {string} count {int}")]
fn backend_held(world: &mut TimeboardWorld, path: String, api: String, time: String, count: u64) {
    let gate = Arc::new(Semaphore::new(0));
    world.backend.set(
        &path,
        Behaviour::Held(payload_json(&api, &time, count), gate),
    );
}

#[when(expr = "a display is mounted for {string}")]
fn mount_display(world: &mut TimeboardWorld, path: String) {
    let cache = world.cache();
    world
        .displays
        .entry(path.clone())
        .or_default()
        .push(TimeDisplay::mount(&cache, &path));
}

#[when(expr = "{int} displays are mounted for {string}")]
fn mount_displays(world: &mut TimeboardWorld, count: usize, path: String) {
    for _ in 0..count {
        mount_display(world, path.clone());
    }
}

#[when(expr = "the display for {string} has settled")]
async fn display_settled(world: &mut TimeboardWorld, path: String) {
    let display = world.display(&path);
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let text = display.render();
            if !text.starts_with("Loading") && !text.contains("Updating...") {
                return;
            }
            assert!(display.changed().await, "cache dropped");
        }
    })
    .await
    .expect("display never settled");
}

#[when(expr = "the display for {string} is unmounted")]
fn unmount_display(world: &mut TimeboardWorld, path: String) {
    let displays = world.displays.remove(&path).unwrap_or_default();
    for display in displays {
        display.unmount();
    }
}

#[when(expr = "the held answer for {string} is released")]
async fn release_held(world: &mut TimeboardWorld, path: String) {
    match world.backend.behaviour(&path) {
        Some(Behaviour::Held(_, gate)) => gate.add_permits(1),
        _ => panic!("no held answer for {}", path),
    }
    // Give a late completion every chance to land
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[then(expr = "the display for {string} shows {string}")]
async fn display_shows(world: &mut TimeboardWorld, path: String, expected: String) {
    let display = world.display(&path);
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if display.render().contains(&expected) {
                return;
            }
            assert!(display.changed().await, "cache dropped");
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "display for {} never showed {:?}; last render: {:?}",
        path,
        expected,
        world.display(&path).render()
    );
}

#[then(expr = "the display for {string} does not show {string}")]
fn display_does_not_show(world: &mut TimeboardWorld, path: String, unexpected: String) {
    let text = world.display(&path).render();
    assert!(!text.contains(&unexpected), "{text}");
}

#[then(expr = "rendering the display for {string} twice gives the same text")]
fn render_idempotent(world: &mut TimeboardWorld, path: String) {
    let display = world.display(&path);
    let first = display.render();
    let second = display.render();
    assert_eq!(first, second);
}

#[then(expr = "{string} was fetched {int} time(s)")]
fn fetched_times(world: &mut TimeboardWorld, path: String, expected: usize) {
    assert_eq!(world.backend.calls(&path), expected);
}
