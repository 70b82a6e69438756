//! Step definitions for slash-command queries

use cucumber::{given, then};

use crate::world::{BridgeWorld, FakeAgent};

#[given(expr = "TeamCity has project {string} named {string}")]
async fn teamcity_has_project(world: &mut BridgeWorld, id: String, name: String) {
    world.servers.projects.lock().unwrap().push((id, name));
}

#[given(expr = "the default build count is {int}")]
async fn default_build_count(world: &mut BridgeWorld, count: usize) {
    world.config().teamcity.max_builds = count;
}

#[then(expr = "the reply lists builds {string} in that order")]
async fn reply_lists_builds(world: &mut BridgeWorld, expected: String) {
    let text = &world.last_response.as_ref().expect("no command was run").text;
    let mut last_position = 0;
    for number in expected.split(',').map(str::trim) {
        let position = text
            .find(&format!("[{}]", number))
            .unwrap_or_else(|| panic!("{} missing from {:?}", number, text));
        assert!(position >= last_position, "{} out of order in {:?}", number, text);
        last_position = position;
    }
}

#[then(expr = "the reply has {int} build rows")]
async fn reply_has_rows(world: &mut BridgeWorld, rows: usize) {
    let text = &world.last_response.as_ref().expect("no command was run").text;
    let count = text.lines().filter(|l| l.starts_with("| [")).count();
    assert_eq!(count, rows, "{:?}", text);
}

#[then(expr = "the reply does not mention {string}")]
async fn reply_does_not_mention(world: &mut BridgeWorld, unexpected: String) {
    let text = &world.last_response.as_ref().expect("no command was run").text;
    assert!(!text.contains(&unexpected), "{:?} found in {:?}", unexpected, text);
}

#[given(expr = "TeamCity has agent {string} that is {word}")]
async fn teamcity_has_agent(world: &mut BridgeWorld, name: String, condition: String) {
    world.servers.agents.lock().unwrap().push(FakeAgent {
        name,
        connected: condition != "disconnected",
        busy: condition == "busy",
    });
}

#[given(expr = "TeamCity has build {int} of {string} queued")]
async fn teamcity_has_queued_build(world: &mut BridgeWorld, id: u64, build_type: String) {
    world.servers.queue.lock().unwrap().push((id, build_type));
}

#[then(expr = "the build queue holds {int} build(s)")]
async fn build_queue_holds(world: &mut BridgeWorld, expected: usize) {
    assert_eq!(world.servers.queue.lock().unwrap().len(), expected);
}

#[then(expr = "TeamCity recorded cancelling build {int} with comment {string}")]
async fn cancel_recorded(world: &mut BridgeWorld, id: u64, comment: String) {
    let comments = world.servers.cancel_comments.lock().unwrap();
    assert!(
        comments.contains(&(id, comment.clone())),
        "no cancel of {} with {:?} in {:?}",
        id,
        comment,
        comments
    );
}
