mod common;

use common::{StubCollector, json_output, run_cli_case};

const JSON: (&str, &str) = ("UMB_OUTPUT_FORMAT", "json");

#[test]
fn help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_cli_case("help", dir.path(), &["--help"], &[]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    for command in ["record", "consent", "endpoint", "flush", "status", "activity", "daemon"] {
        assert!(
            result.stdout.contains(command),
            "missing {command}; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn fresh_install_is_undecided_and_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let consent = run_cli_case("consent_show", dir.path(), &["consent", "show"], &[JSON]);
    assert!(consent.status.success(), "log: {}", consent.log_path.display());
    let consent = json_output(&consent);
    assert_eq!(consent["state"], "undecided");
    assert_eq!(consent["decided"], false);

    let record = run_cli_case("record_undecided", dir.path(), &["record", "tool", "qr"], &[JSON]);
    assert_eq!(json_output(&record)["consent_granted"], false);

    let status = run_cli_case("status_after_undecided", dir.path(), &["--json", "status"], &[]);
    let status = json_output(&status);
    assert_eq!(status["raw"]["tool_use"], serde_json::json!({}));
}

#[test]
fn granted_recordings_persist_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    run_cli_case("grant", dir.path(), &["consent", "grant"], &[JSON]);
    for _ in 0..3 {
        let r = run_cli_case("record_qr", dir.path(), &["record", "tool", "qr"], &[JSON]);
        assert!(r.status.success(), "log: {}", r.log_path.display());
    }
    run_cli_case("daily_1", dir.path(), &["record", "daily-open"], &[JSON]);
    run_cli_case("daily_2", dir.path(), &["record", "daily-open"], &[JSON]);

    let status = json_output(&run_cli_case("status", dir.path(), &["status"], &[JSON]));
    assert_eq!(status["consent"], "granted");
    assert_eq!(status["dirty"], true);
    let tool_use = status["raw"]["tool_use"].as_object().unwrap();
    assert_eq!(tool_use.len(), 1);
    let (_, cells) = tool_use.iter().next().unwrap();
    assert_eq!(cells["qr"], 3);
    let app_opens = status["raw"]["app_opens"].as_object().unwrap();
    assert_eq!(app_opens.values().next().unwrap(), 1);
}

#[test]
fn endpoint_overrides_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let seed = [JSON, ("UMB_UPLOAD_ENDPOINT", "https://seed.example/v1")];

    let shown = json_output(&run_cli_case("endpoint_show", dir.path(), &["endpoint", "show"], &seed));
    assert_eq!(shown["endpoint"], "https://seed.example/v1");

    let set = run_cli_case(
        "endpoint_set",
        dir.path(),
        &["endpoint", "set", "https://runtime.example/v1"],
        &seed,
    );
    assert_eq!(json_output(&set)["endpoint"], "https://runtime.example/v1");

    let key = run_cli_case(
        "endpoint_key",
        dir.path(),
        &["endpoint", "set-key", "abcdefghijkl"],
        &seed,
    );
    assert_eq!(json_output(&key)["api_key"], "********ijkl");

    let cleared = json_output(&run_cli_case("endpoint_clear", dir.path(), &["endpoint", "clear"], &seed));
    assert_eq!(cleared["configured"], false);

    let reset = json_output(&run_cli_case("endpoint_reset", dir.path(), &["endpoint", "reset"], &seed));
    assert_eq!(reset["endpoint"], "https://seed.example/v1");
}

#[test]
fn invalid_endpoint_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_cli_case(
        "endpoint_ftp",
        dir.path(),
        &["endpoint", "set", "ftp://files.example"],
        &[JSON],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("UMB-1001"));
}

#[test]
fn missing_explicit_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let result = run_cli_case(
        "missing_config",
        dir.path(),
        &["--config", missing.to_str().unwrap(), "status"],
        &[JSON],
    );
    assert_eq!(result.status.code(), Some(1));
    assert!(result.stderr.contains("UMB-1002"));
}

#[test]
fn flush_without_endpoint_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    run_cli_case("grant", dir.path(), &["consent", "grant"], &[JSON]);
    run_cli_case("record", dir.path(), &["record", "open"], &[JSON]);
    let flush = json_output(&run_cli_case("flush_disabled", dir.path(), &["flush"], &[JSON]));
    assert_eq!(flush["decision"]["decision"], "skipped");
    assert_eq!(flush["decision"]["reason"]["reason"], "upload_disabled");
}

#[test]
fn flush_delivers_to_collector_and_advances_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let collector = StubCollector::start(&[]);
    let env = [
        JSON,
        ("UMB_UPLOAD_ENDPOINT", collector.url.as_str()),
        ("UMB_UPLOAD_API_KEY", "secret-key"),
    ];
    run_cli_case("grant", dir.path(), &["consent", "grant"], &env);
    run_cli_case("record_qr", dir.path(), &["record", "tool", "qr"], &env);
    run_cli_case("record_qr", dir.path(), &["record", "tool", "qr"], &env);

    let offline = json_output(&run_cli_case("flush_offline", dir.path(), &["flush", "--offline"], &env));
    assert_eq!(offline["decision"]["reason"]["reason"], "constraints_unmet");
    assert!(collector.requests().is_empty());

    let flush = run_cli_case("flush", dir.path(), &["flush"], &env);
    let flush = json_output(&flush);
    assert_eq!(flush["decision"]["decision"], "enqueued");
    assert_eq!(flush["delivery"]["outcome"], "delivered");

    let requests = collector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "secret-key");
    let body: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
    let tool_use = body["toolUseDelta"].as_object().unwrap();
    assert_eq!(tool_use.values().next().unwrap()["qr"], 2);

    let status = json_output(&run_cli_case("status", dir.path(), &["status"], &env));
    assert_eq!(status["pending"], serde_json::Value::Null);
    assert_eq!(status["unsent"]["tool_use"], serde_json::json!({}));
    assert_eq!(status["dirty"], false);
}

#[test]
fn activity_shows_logged_events() {
    let dir = tempfile::tempdir().unwrap();
    run_cli_case("grant", dir.path(), &["consent", "grant"], &[JSON]);
    let activity = run_cli_case(
        "activity",
        dir.path(),
        &["activity", "--limit", "50"],
        &[JSON],
    );
    assert!(activity.status.success(), "log: {}", activity.log_path.display());
    let entries = json_output(&activity)["entries"].as_array().unwrap().clone();
    assert!(
        entries.iter().any(|e| e["event_type"] == "consent_change"),
        "log: {}",
        activity.log_path.display()
    );
}
