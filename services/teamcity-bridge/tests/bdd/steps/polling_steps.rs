//! Step definitions for polling and notification delivery

use std::time::Duration;

use cucumber::{given, then, when};

use crate::world::BridgeWorld;

#[given(expr = "TeamCity is unavailable for {string}")]
async fn teamcity_unavailable(world: &mut BridgeWorld, build_type: String) {
    world.servers.outages.lock().unwrap().insert(build_type);
}

#[when(expr = "TeamCity recovers for {string}")]
async fn teamcity_recovers(world: &mut BridgeWorld, build_type: String) {
    world.servers.outages.lock().unwrap().remove(&build_type);
}

#[given(expr = "posting to channel {string} fails")]
async fn posting_fails(world: &mut BridgeWorld, channel: String) {
    world.servers.failing_channels.lock().unwrap().insert(channel);
}

#[given(expr = "TeamCity only accepts the token {string}")]
async fn teamcity_accepts_token(world: &mut BridgeWorld, token: String) {
    *world.servers.accepted_token.lock().unwrap() = Some(token);
}

#[when(expr = "build {int} of {string} becomes {word}")]
async fn build_becomes(world: &mut BridgeWorld, id: u64, build_type: String, status: String) {
    world.servers.set_build(&build_type, id, &status);
}

#[when("the poller sweeps")]
async fn poller_sweeps(world: &mut BridgeWorld) {
    sweep(world).await;
}

#[given("the poller has taken a baseline")]
async fn poller_baseline(world: &mut BridgeWorld) {
    sweep(world).await;
    let report = world.last_report.expect("sweep ran");
    assert_eq!(report.transitions, 0, "{:?}", report);
}

async fn sweep(world: &mut BridgeWorld) {
    let bridge = world.bridge().await;
    world.last_report = Some(bridge.poller().sweep().await);
}

#[then(expr = "the sweep reports {int} {word}")]
async fn sweep_reports(world: &mut BridgeWorld, expected: usize, field: String) {
    let report = world.last_report.expect("no sweep has run");
    let actual = match field.as_str() {
        "polled" => report.polled,
        "transitions" | "transition" => report.transitions,
        "unavailable" => report.unavailable,
        "unauthorized" => report.unauthorized,
        "not_found" => report.not_found,
        "dispatched" => report.dispatched,
        "delivered" => report.delivered,
        "reclaimed" => report.reclaimed,
        other => panic!("unknown sweep field {}", other),
    };
    assert_eq!(actual, expected, "{} in {:?}", field, report);
}

#[then("no messages were posted")]
async fn no_messages(world: &mut BridgeWorld) {
    assert!(world.servers.posts().is_empty(), "{:?}", world.servers.posts());
}

#[then(expr = "channel {string} received {int} messages")]
async fn channel_received(world: &mut BridgeWorld, channel: String, count: usize) {
    let posts: Vec<_> = world
        .servers
        .posts()
        .into_iter()
        .filter(|p| p.channel_id == channel)
        .collect();
    assert_eq!(posts.len(), count, "{:?}", posts);
}

#[then(expr = "the last message to channel {string} contains {string}")]
async fn last_message_contains(world: &mut BridgeWorld, channel: String, expected: String) {
    let posts = world.servers.posts();
    let last = posts
        .iter()
        .rev()
        .find(|p| p.channel_id == channel)
        .unwrap_or_else(|| panic!("no message to {}", channel));
    assert!(
        last.message.contains(&expected),
        "expected {:?} in {:?}",
        expected,
        last.message
    );
}

#[then(expr = "channel {string} receives a message within {int} seconds")]
async fn channel_receives_within(world: &mut BridgeWorld, channel: String, seconds: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    loop {
        if world.servers.posts().iter().any(|p| p.channel_id == channel) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no message to {} within {}s",
            channel,
            seconds
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
