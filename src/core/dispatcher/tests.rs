use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::*;
use crate::core::message::ToolResultStatus;
use crate::core::session::{BootstrapError, SessionPolicy};
use crate::utils::test_utils::{
    object_args, router_url, chat_url, tool_schema, CountingBootstrap, FakeConnector,
    ManualClock, RecordingExecutor, TEST_SESSION_KEY,
};

fn call(name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: format!("call-{name}"),
        name: name.to_string(),
        parameters: object_args(args),
    }
}

fn confirmation(message: &str) -> SafetyResponse {
    SafetyResponse {
        require_confirmation: true,
        message: Some(message.to_string()),
    }
}

fn browser_only(executor: &Arc<RecordingExecutor>) -> ToolDispatcher {
    ToolDispatcher::new(executor.clone(), DispatchPolicy::default(), true)
}

struct RemoteHarness {
    dispatcher: ToolDispatcher,
    executor: Arc<RecordingExecutor>,
    connector: Arc<FakeConnector>,
    bootstrap: Arc<CountingBootstrap>,
    clock: Arc<ManualClock>,
}

fn remote_harness() -> RemoteHarness {
    let executor = Arc::new(RecordingExecutor::default());
    let connector = Arc::new(FakeConnector::default());
    let bootstrap = Arc::new(CountingBootstrap::default());
    let clock = Arc::new(ManualClock::default());
    let sessions = Arc::new(SessionManager::new(
        bootstrap.clone(),
        clock.clone(),
        SessionPolicy::default(),
    ));
    let pool = Arc::new(McpClientPool::new(connector.clone(), Duration::from_secs(5)));
    let dispatcher = ToolDispatcher::new(executor.clone(), DispatchPolicy::default(), true)
        .with_remote(RemoteRouting {
            sessions,
            pool,
            session_key: TEST_SESSION_KEY.to_string(),
        });
    RemoteHarness {
        dispatcher,
        executor,
        connector,
        bootstrap,
        clock,
    }
}

fn completed(outcome: DispatchOutcome) -> ToolResult {
    match outcome {
        DispatchOutcome::Completed(result) => result,
        DispatchOutcome::NeedsConfirmation(pending) => {
            panic!("expected a completed dispatch, got pending {pending:?}")
        }
    }
}

#[tokio::test]
async fn click_runs_with_only_its_parameters() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);
    let click = call("click", json!({"selector": "#submit", "text": "stray"}));

    let result = completed(dispatcher.dispatch(&click, None).await);

    assert_eq!(result.status, ToolResultStatus::Success);
    assert_eq!(result.tool_call_id, "call-click");
    assert_eq!(result.result, json!({"success": true}));
    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, BrowserAction::Click);
    assert_eq!(calls[0].1.selector.as_deref(), Some("#submit"));
    assert_eq!(calls[0].1.text, None);
}

#[tokio::test]
async fn missing_parameters_fail_without_touching_the_page() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);

    let result = completed(dispatcher.dispatch(&call("navigate", json!({})), None).await);

    assert_eq!(result.failure_kind, Some(ToolFailureKind::ToolCallFailure));
    assert_eq!(result.result["error"], "navigate requires address or uri or url");
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn executor_failures_map_to_failure_kinds() {
    let executor = Arc::new(RecordingExecutor::default());
    executor.reply(BrowserAction::Click, Err("content script unreachable".to_string()));
    executor.reply(
        BrowserAction::Click,
        Ok(json!({"success": false, "error": "Element not found"})),
    );
    executor.reply(BrowserAction::Click, Ok(json!({"ok": true})));
    let mut dispatcher = browser_only(&executor);
    let click = call("click", json!({"selector": "#missing"}));

    let unreachable = completed(dispatcher.dispatch(&click, None).await);
    assert_eq!(unreachable.failure_kind, Some(ToolFailureKind::ToolCallFailure));
    assert_eq!(unreachable.result["error"], "content script unreachable");

    let reported = completed(dispatcher.dispatch(&click, None).await);
    assert_eq!(reported.status, ToolResultStatus::Error);
    assert_eq!(reported.failure_kind, Some(ToolFailureKind::ToolError));
    assert_eq!(reported.result["error"], "Element not found");

    let malformed = completed(dispatcher.dispatch(&click, None).await);
    assert_eq!(malformed.failure_kind, Some(ToolFailureKind::InvalidResult));
    let message = malformed.result["error"].as_str().unwrap();
    assert!(message.contains("success"), "unexpected message: {message}");
}

#[tokio::test]
async fn screenshot_requires_an_image_data_url() {
    let executor = Arc::new(RecordingExecutor::default());
    executor.reply(
        BrowserAction::Screenshot,
        Ok(json!({"success": true, "screenshot": "data:text/plain;base64,aGk="})),
    );
    let mut dispatcher = browser_only(&executor);

    let rejected = completed(dispatcher.dispatch(&call("screenshot", json!({})), None).await);
    assert_eq!(rejected.failure_kind, Some(ToolFailureKind::InvalidResult));

    let accepted = completed(dispatcher.dispatch(&call("screenshot", json!({})), None).await);
    assert!(accepted.is_success());
    assert!(accepted.result["screenshot"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn slow_browser_action_times_out() {
    let executor = Arc::new(RecordingExecutor::default());
    executor.set_delay(Duration::from_millis(500));
    let mut dispatcher = ToolDispatcher::new(
        executor.clone(),
        DispatchPolicy {
            browser_timeout: Duration::from_millis(20),
            mcp_timeout: Duration::from_secs(5),
        },
        true,
    );

    let result = completed(dispatcher.dispatch(&call("wait", json!({"seconds": 1})), None).await);

    assert_eq!(result.failure_kind, Some(ToolFailureKind::Timeout));
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn disabled_browser_tools_resolve_as_unknown() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = ToolDispatcher::new(executor.clone(), DispatchPolicy::default(), false);

    let result = completed(dispatcher.dispatch(&call("click", json!({"selector": "a"})), None).await);

    assert_eq!(result.failure_kind, Some(ToolFailureKind::UnknownTool));
    assert_eq!(result.result["tool"], "click");
    assert_eq!(executor.call_count(), 0);
    assert!(dispatcher.tool_declarations().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_tool_is_a_result_not_an_error() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);

    let result = completed(dispatcher.dispatch(&call("teleport", json!({})), None).await);

    assert_eq!(result.status, ToolResultStatus::Error);
    assert_eq!(result.failure_kind, Some(ToolFailureKind::UnknownTool));
    assert_eq!(result.result["error"], "Unknown tool: teleport");
}

#[tokio::test]
async fn confirmation_holds_the_action_until_allowed() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);
    let click = call("click", json!({"selector": "#buy"}));

    let pending = match dispatcher
        .dispatch(&click, Some(&confirmation("Buying is irreversible.")))
        .await
    {
        DispatchOutcome::NeedsConfirmation(pending) => pending,
        other => panic!("expected confirmation, got {other:?}"),
    };
    assert_eq!(pending.action, BrowserAction::Click);
    assert_eq!(pending.message.as_deref(), Some("Buying is irreversible."));
    assert_eq!(executor.call_count(), 0);

    let result = dispatcher
        .confirm(pending, ToolPermissionDecision::AllowOnce)
        .await;
    assert!(result.is_success());
    assert_eq!(executor.call_count(), 1);

    let again = dispatcher
        .dispatch(&click, Some(&confirmation("Again?")))
        .await;
    assert!(matches!(again, DispatchOutcome::NeedsConfirmation(_)));
}

#[tokio::test]
async fn no_confirmation_needed_when_safety_does_not_ask() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);
    let relaxed = SafetyResponse {
        require_confirmation: false,
        message: None,
    };

    let result = completed(
        dispatcher
            .dispatch(&call("go_back", json!({})), Some(&relaxed))
            .await,
    );
    assert!(result.is_success());
}

#[tokio::test]
async fn sticky_decisions_skip_later_prompts() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);
    let click = call("click", json!({"selector": "#next"}));
    let navigate = call("navigate", json!({"url": "https://bank.example"}));
    let safety = confirmation("Confirm?");

    let DispatchOutcome::NeedsConfirmation(pending) = dispatcher.dispatch(&click, Some(&safety)).await
    else {
        panic!("expected a prompt for click");
    };
    dispatcher
        .confirm(pending, ToolPermissionDecision::AllowSession)
        .await;
    let later = completed(dispatcher.dispatch(&click, Some(&safety)).await);
    assert!(later.is_success());

    let DispatchOutcome::NeedsConfirmation(pending) =
        dispatcher.dispatch(&navigate, Some(&safety)).await
    else {
        panic!("expected a prompt for navigate");
    };
    let blocked = dispatcher.confirm(pending, ToolPermissionDecision::Block).await;
    assert_eq!(blocked.status, ToolResultStatus::Blocked);

    let still_blocked = completed(dispatcher.dispatch(&navigate, None).await);
    assert_eq!(still_blocked.status, ToolResultStatus::Blocked);
    assert_eq!(
        executor
            .calls()
            .iter()
            .filter(|(action, _)| *action == BrowserAction::Navigate)
            .count(),
        0
    );
}

#[tokio::test]
async fn declining_produces_a_denied_result() {
    let executor = Arc::new(RecordingExecutor::default());
    let mut dispatcher = browser_only(&executor);

    let DispatchOutcome::NeedsConfirmation(pending) = dispatcher
        .dispatch(&call("type", json!({"selector": "#q", "text": "x"})), Some(&confirmation("ok?")))
        .await
    else {
        panic!("expected a prompt");
    };
    let result = dispatcher
        .confirm(pending, ToolPermissionDecision::DenyOnce)
        .await;

    assert_eq!(result.status, ToolResultStatus::Denied);
    assert_eq!(result.tool_call_id, "call-type");
    assert_eq!(executor.call_count(), 0);
    assert_eq!(dispatcher.permissions().decision_for("type"), None);
}

#[tokio::test]
async fn remote_tool_runs_on_the_advertising_endpoint() {
    let mut harness = remote_harness();
    harness.connector.set_tools(
        &router_url(1),
        vec![tool_schema(
            "GMAIL_SEND_EMAIL",
            json!({"type": "object", "properties": {"to": {"type": "string"}}, "required": ["to"]}),
        )],
    );
    harness.connector.push_call_result(
        "GMAIL_SEND_EMAIL",
        Ok(json!({"content": [{"type": "text", "text": "sent"}], "structuredContent": {"id": "m1"}})),
    );

    let result = completed(
        harness
            .dispatcher
            .dispatch(&call("GMAIL_SEND_EMAIL", json!({"to": "a@example.com"})), None)
            .await,
    );

    assert!(result.is_success());
    assert_eq!(result.result["structuredContent"]["id"], "m1");
    let calls = harness.connector.tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, router_url(1));
    assert_eq!(calls[0].2["to"], "a@example.com");
    assert_eq!(harness.bootstrap.calls(), 1);
    assert_eq!(harness.executor.call_count(), 0);
}

#[tokio::test]
async fn remote_failures_are_classified() {
    let mut harness = remote_harness();
    harness.connector.set_tools(
        &chat_url(1),
        vec![tool_schema(
            "NOTES_ADD",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        )],
    );
    harness.connector.push_call_result(
        "NOTES_ADD",
        Ok(json!({"content": [{"type": "text", "text": "quota exceeded"}], "isError": true})),
    );
    harness
        .connector
        .push_call_result("NOTES_ADD", Ok(json!({"content": "not a list"})));

    let bad_args = completed(harness.dispatcher.dispatch(&call("NOTES_ADD", json!({})), None).await);
    assert_eq!(bad_args.failure_kind, Some(ToolFailureKind::ToolCallFailure));
    assert!(harness.connector.tool_calls().is_empty());

    let note = call("NOTES_ADD", json!({"text": "hi"}));
    let reported = completed(harness.dispatcher.dispatch(&note, None).await);
    assert_eq!(reported.failure_kind, Some(ToolFailureKind::ToolError));
    assert_eq!(reported.result["content"][0]["text"], "quota exceeded");

    let malformed = completed(harness.dispatcher.dispatch(&note, None).await);
    assert_eq!(malformed.failure_kind, Some(ToolFailureKind::InvalidResult));

    let missing = completed(harness.dispatcher.dispatch(&call("NOPE", json!({})), None).await);
    assert_eq!(missing.failure_kind, Some(ToolFailureKind::UnknownTool));
}

#[tokio::test]
async fn slow_remote_tool_times_out() {
    let mut harness = remote_harness();
    harness.dispatcher.policy.mcp_timeout = Duration::from_millis(20);
    harness
        .connector
        .set_tools(&router_url(1), vec![tool_schema("SLOW", json!({"type": "object"}))]);
    harness.connector.set_call_delay(Duration::from_millis(500));

    let result = completed(harness.dispatcher.dispatch(&call("SLOW", json!({})), None).await);

    assert_eq!(result.failure_kind, Some(ToolFailureKind::Timeout));
}

#[tokio::test]
async fn session_failure_becomes_a_call_failure() {
    let mut harness = remote_harness();
    for _ in 0..2 {
        harness
            .bootstrap
            .push(Err(BootstrapError::Transport("connection reset".to_string())));
    }

    let result = completed(harness.dispatcher.dispatch(&call("SEARCH", json!({})), None).await);

    assert_eq!(result.failure_kind, Some(ToolFailureKind::ToolCallFailure));
    assert!(result.result["error"]
        .as_str()
        .unwrap()
        .contains("connection reset"));
    assert_eq!(harness.bootstrap.calls(), 2);
}

#[tokio::test]
async fn declarations_merge_browser_and_remote_tools() {
    let mut harness = remote_harness();
    harness.connector.set_tools(
        &router_url(1),
        vec![
            tool_schema(
                "SEARCH",
                json!({"$schema": "x", "type": "object", "additionalProperties": false}),
            ),
            tool_schema("click", json!({"type": "object"})),
        ],
    );
    harness.connector.set_tools(
        &chat_url(1),
        vec![
            tool_schema("SEARCH", json!({"type": "object", "properties": {"q": {"type": "string"}}})),
            tool_schema("NOTES", json!({})),
        ],
    );

    let declarations = harness.dispatcher.tool_declarations().await.unwrap();
    let names: Vec<&str> = declarations.iter().map(|decl| decl.name.as_str()).collect();

    assert_eq!(names.len(), BrowserAction::ALL.len() + 2);
    assert_eq!(names.iter().filter(|name| **name == "click").count(), 1);
    let search = declarations.iter().find(|decl| decl.name == "SEARCH").unwrap();
    assert_eq!(search.parameters, json!({"type": "object"}));
    assert_eq!(search.description, "SEARCH tool");
    let notes = declarations.iter().find(|decl| decl.name == "NOTES").unwrap();
    assert_eq!(notes.parameters, json!({"type": "object", "properties": {}}));
}

#[tokio::test]
async fn renewal_releases_clients_of_replaced_endpoints() {
    let mut harness = remote_harness();
    harness.bootstrap.set_expires_in(60);
    for generation in [1, 2] {
        harness.connector.set_tools(
            &router_url(generation),
            vec![tool_schema("SEARCH", json!({"type": "object"}))],
        );
    }
    let search = call("SEARCH", json!({}));

    assert!(completed(harness.dispatcher.dispatch(&search, None).await).is_success());
    harness.clock.advance(Duration::from_secs(61));
    assert!(completed(harness.dispatcher.dispatch(&search, None).await).is_success());

    let urls: Vec<String> = harness
        .connector
        .tool_calls()
        .into_iter()
        .map(|(url, _, _)| url)
        .collect();
    assert_eq!(urls, vec![router_url(1), router_url(2)]);
    assert_eq!(harness.bootstrap.calls(), 2);
    assert!(harness.connector.close_attempts() >= 1);
}

#[tokio::test]
async fn dropped_session_is_invalidated() {
    let mut harness = remote_harness();
    for generation in [1, 2] {
        harness.connector.set_tools(
            &router_url(generation),
            vec![tool_schema("SEARCH", json!({"type": "object"}))],
        );
    }
    harness
        .connector
        .push_call_result("SEARCH", Err(McpError::SessionGone(router_url(1))));
    let search = call("SEARCH", json!({}));

    let gone = completed(harness.dispatcher.dispatch(&search, None).await);
    assert_eq!(gone.failure_kind, Some(ToolFailureKind::ToolCallFailure));

    let retried = completed(harness.dispatcher.dispatch(&search, None).await);
    assert!(retried.is_success());
    assert_eq!(harness.bootstrap.calls(), 2);
    assert_eq!(harness.connector.tool_calls().last().unwrap().0, router_url(2));
}

#[tokio::test]
async fn discovery_replaces_a_session_the_server_dropped() {
    let mut harness = remote_harness();
    for generation in [1, 2] {
        harness.connector.set_tools(
            &router_url(generation),
            vec![tool_schema("SEARCH", json!({"type": "object"}))],
        );
    }
    harness.connector.drop_session(&router_url(1));

    let declarations = harness.dispatcher.tool_declarations().await.unwrap();

    assert!(declarations.iter().any(|decl| decl.name == "SEARCH"));
    assert_eq!(harness.bootstrap.calls(), 2);
    assert!(harness.connector.close_attempts() >= 1);

    let result = completed(harness.dispatcher.dispatch(&call("SEARCH", json!({})), None).await);
    assert!(result.is_success());
    assert_eq!(harness.connector.tool_calls()[0].0, router_url(2));
}

#[tokio::test]
async fn discovery_gives_up_after_one_replacement() {
    let mut harness = remote_harness();
    harness.connector.drop_session(&router_url(1));
    harness.connector.drop_session(&router_url(2));

    let declarations = harness.dispatcher.tool_declarations().await.unwrap();

    assert_eq!(declarations.len(), BrowserAction::ALL.len());
    assert_eq!(harness.bootstrap.calls(), 2);
}

#[tokio::test]
async fn dropped_session_during_lookup_is_invalidated() {
    let mut harness = remote_harness();
    for generation in [1, 2] {
        harness.connector.set_tools(
            &router_url(generation),
            vec![tool_schema("SEARCH", json!({"type": "object"}))],
        );
    }
    harness.connector.drop_session(&router_url(1));
    let search = call("SEARCH", json!({}));

    let gone = completed(harness.dispatcher.dispatch(&search, None).await);
    assert_eq!(gone.failure_kind, Some(ToolFailureKind::ToolCallFailure));
    assert!(harness.connector.tool_calls().is_empty());

    let retried = completed(harness.dispatcher.dispatch(&search, None).await);
    assert!(retried.is_success());
    assert_eq!(harness.bootstrap.calls(), 2);
    assert_eq!(harness.connector.tool_calls()[0].0, router_url(2));
}

#[tokio::test]
async fn renewal_keeps_clients_of_other_sessions() {
    let executor = Arc::new(RecordingExecutor::default());
    let connector = Arc::new(FakeConnector::default());
    let bootstrap = Arc::new(CountingBootstrap::default());
    bootstrap.set_expires_in(60);
    let clock = Arc::new(ManualClock::default());
    let sessions = Arc::new(SessionManager::new(
        bootstrap.clone(),
        clock.clone(),
        SessionPolicy::default(),
    ));
    let pool = Arc::new(McpClientPool::new(connector.clone(), Duration::from_secs(5)));
    for generation in [1, 2, 3] {
        connector.set_tools(
            &router_url(generation),
            vec![tool_schema("SEARCH", json!({"type": "object"}))],
        );
    }
    let dispatcher_for = |key: &str| {
        ToolDispatcher::new(executor.clone(), DispatchPolicy::default(), true).with_remote(
            RemoteRouting {
                sessions: Arc::clone(&sessions),
                pool: Arc::clone(&pool),
                session_key: key.to_string(),
            },
        )
    };
    let mut first = dispatcher_for("key-a");
    let mut second = dispatcher_for("key-b");
    let search = call("SEARCH", json!({}));

    assert!(completed(first.dispatch(&search, None).await).is_success());
    assert!(completed(second.dispatch(&search, None).await).is_success());
    let other = pool.get_client(&router_url(2)).await.unwrap();

    clock.advance(Duration::from_secs(61));
    assert!(completed(first.dispatch(&search, None).await).is_success());

    assert_eq!(bootstrap.calls(), 3);
    assert!(!other.is_closed());
    let mut urls = pool.urls().await;
    urls.sort();
    assert_eq!(urls, vec![router_url(2), router_url(3)]);
}
