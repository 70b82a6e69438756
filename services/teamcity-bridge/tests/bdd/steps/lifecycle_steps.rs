//! Step definitions for bridge construction, reload and shutdown

use std::time::Duration;

use cucumber::{given, then, when};

use teamcity_bridge::BridgeError;

use crate::world::BridgeWorld;

#[given("the TeamCity token is empty")]
async fn token_is_empty(world: &mut BridgeWorld) {
    world.config().teamcity.token.clear();
}

#[given(expr = "the TeamCity URL is {string}")]
async fn teamcity_url_is(world: &mut BridgeWorld, url: String) {
    world.config().teamcity.url = url;
}

#[when("the bridge is built")]
async fn bridge_is_built(world: &mut BridgeWorld) {
    world.build_error = world.try_build().await.err();
}

#[then("building fails with a configuration error")]
async fn building_fails(world: &mut BridgeWorld) {
    assert!(
        matches!(world.build_error, Some(BridgeError::Config(_))),
        "{:?}",
        world.build_error
    );
}

#[then("the error does not reveal the token")]
async fn error_hides_token(world: &mut BridgeWorld) {
    let token = world.config().teamcity.token.clone();
    let build_error = world.build_error.as_ref().map(ToString::to_string);
    let reload_error = match &world.reload_result {
        Some(Err(e)) => Some(e.to_string()),
        _ => None,
    };
    for message in build_error.into_iter().chain(reload_error) {
        assert!(!message.contains(&token), "{}", message);
    }
}

#[when(expr = "the TeamCity token is reloaded as {string}")]
async fn token_reloaded(world: &mut BridgeWorld, token: String) {
    let bridge = world.bridge().await;
    let mut settings = world.config().teamcity.clone();
    settings.token = token;
    world.reload_result = Some(bridge.reload(&settings));
}

#[when(expr = "the TeamCity URL is reloaded as {string}")]
async fn url_reloaded(world: &mut BridgeWorld, url: String) {
    let bridge = world.bridge().await;
    let mut settings = world.config().teamcity.clone();
    settings.url = url;
    world.reload_result = Some(bridge.reload(&settings));
}

#[then("the reload is accepted")]
async fn reload_accepted(world: &mut BridgeWorld) {
    assert!(
        matches!(world.reload_result, Some(Ok(true))),
        "{:?}",
        world.reload_result
    );
}

#[then("the reload is rejected")]
async fn reload_rejected(world: &mut BridgeWorld) {
    assert!(
        matches!(world.reload_result, Some(Err(BridgeError::Config(_)))),
        "{:?}",
        world.reload_result
    );
}

#[then(expr = "TeamCity last saw the token {string}")]
async fn last_token_seen(world: &mut BridgeWorld, token: String) {
    let seen = world.servers.tokens_seen.lock().unwrap().last().cloned();
    assert_eq!(seen.as_deref(), Some(token.as_str()));
}

#[then(expr = "the bridge still talks to {string}")]
async fn bridge_base_url(world: &mut BridgeWorld, url: String) {
    let bridge = world.bridge().await;
    assert_eq!(bridge.credentials().current().base_url(), url);
}

#[when("the bridge is started")]
async fn bridge_is_started(world: &mut BridgeWorld) {
    let bridge = world.bridge().await;
    world.running = Some(tokio::spawn(async move { bridge.start().await }));
}

#[when(expr = "the bridge completes a sweep within {int} seconds")]
async fn bridge_completes_sweep(world: &mut BridgeWorld, seconds: u64) {
    let bridge = world.bridge().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    while bridge.state().read().await.sweeps == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no sweep within {}s",
            seconds
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[when("the bridge is stopped")]
async fn bridge_is_stopped(world: &mut BridgeWorld) {
    let bridge = world.bridge().await;
    bridge.stop();
}

#[then(expr = "the bridge exits within {int} seconds")]
async fn bridge_exits(world: &mut BridgeWorld, seconds: u64) {
    let handle = world.running.take().expect("bridge was not started");
    let result = tokio::time::timeout(Duration::from_secs(seconds), handle)
        .await
        .expect("bridge did not stop in time")
        .expect("bridge task panicked");
    assert!(result.is_ok(), "{:?}", result);
}
