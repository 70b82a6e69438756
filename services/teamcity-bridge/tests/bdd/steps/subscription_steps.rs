//! Step definitions for subscription management

use cucumber::{given, then, when};

use teamcity_bridge::commands::{CommandRequest, ResponseType};

use crate::world::BridgeWorld;

#[given(expr = "TeamCity has build configuration {string} with a {word} build {int}")]
async fn build_configuration_with_build(
    world: &mut BridgeWorld,
    build_type: String,
    status: String,
    id: u64,
) {
    world.servers.set_build(&build_type, id, &status);
}

#[given(expr = "TeamCity has build configuration {string} with no builds")]
async fn build_configuration_without_builds(world: &mut BridgeWorld, build_type: String) {
    world
        .servers
        .build_types
        .lock()
        .unwrap()
        .entry(build_type)
        .or_default();
}

#[given(expr = "channel {string} is subscribed to {string}")]
async fn channel_is_subscribed(world: &mut BridgeWorld, channel: String, build_type: String) {
    send_command(world, channel, format!("subscribe {}", build_type)).await;
    let text = &world.last_response.as_ref().unwrap().text;
    assert!(text.contains("now subscribed"), "unexpected reply: {}", text);
}

#[when(expr = "channel {string} runs {string}")]
async fn run_command(world: &mut BridgeWorld, channel: String, text: String) {
    send_command(world, channel, text).await;
}

async fn send_command(world: &mut BridgeWorld, channel: String, text: String) {
    let bridge = world.bridge().await;
    let request = CommandRequest {
        channel_id: channel,
        user_id: "alice".to_string(),
        text,
    };
    world.last_response = Some(bridge.commands().handle(&request).await);
}

#[when("the bridge restarts")]
async fn bridge_restarts(world: &mut BridgeWorld) {
    if let Some(bridge) = world.bridge.take() {
        bridge.stop();
    }
    world.bridge().await;
}

#[then(expr = "the reply is {string}")]
async fn reply_is(world: &mut BridgeWorld, expected: String) {
    let response = world.last_response.as_ref().expect("no command was run");
    assert_eq!(response.text, expected);
}

#[then(expr = "the reply contains {string}")]
async fn reply_contains(world: &mut BridgeWorld, expected: String) {
    let response = world.last_response.as_ref().expect("no command was run");
    assert!(
        response.text.contains(&expected),
        "expected {:?} in reply {:?}",
        expected,
        response.text
    );
}

#[then("the reply is only visible to the caller")]
async fn reply_is_ephemeral(world: &mut BridgeWorld) {
    let response = world.last_response.as_ref().expect("no command was run");
    assert_eq!(response.response_type, ResponseType::Ephemeral);
}

#[then("the reply is posted in the channel")]
async fn reply_is_in_channel(world: &mut BridgeWorld) {
    let response = world.last_response.as_ref().expect("no command was run");
    assert_eq!(response.response_type, ResponseType::InChannel);
}

#[then(expr = "channel {string} has {int} subscriptions")]
async fn channel_has_subscriptions(world: &mut BridgeWorld, channel: String, count: usize) {
    let bridge = world.bridge().await;
    let subscriptions = bridge.subscriptions().list_by_channel(&channel).await;
    assert_eq!(subscriptions.len(), count, "{:?}", subscriptions);
}

#[then(expr = "channel {string} is still subscribed to {string}")]
async fn channel_still_subscribed(world: &mut BridgeWorld, channel: String, build_type: String) {
    let bridge = world.bridge().await;
    let subscriptions = bridge.subscriptions().list_by_channel(&channel).await;
    assert!(
        subscriptions
            .iter()
            .any(|s| s.build_type.as_str() == build_type),
        "{} not in {:?}",
        build_type,
        subscriptions
    );
}
