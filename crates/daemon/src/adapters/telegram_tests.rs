// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::store::SessionStatus;
use crate::test_support::sample_session;

#[test]
fn topic_title_encodes_computer_agent_and_mode() {
    let mut record = sample_session("s-1", "laptop", "telegram");
    record.thinking_mode = "slow".to_owned();
    record.title = "check logs".to_owned();
    assert_eq!(topic_title(&record), "[laptop] claude/slow — check logs");

    record.thinking_mode.clear();
    record.title.clear();
    assert_eq!(topic_title(&record), "[laptop] claude");
}

#[test]
fn render_output_bounds_length_and_handles_empty() {
    assert_eq!(render_output(""), "(no output yet)");
    assert_eq!(render_output("hello"), "hello");

    let long = "x".repeat(10_000);
    let rendered = render_output(&long);
    assert!(rendered.len() <= 3910);
    assert!(rendered.starts_with('…'));
}

#[test]
fn roster_sorts_and_marks_liveness() {
    let roster = render_roster(
        "laptop",
        &[("zeta".to_owned(), false), ("alpha".to_owned(), true)],
    );
    let lines: Vec<&str> = roster.lines().collect();
    assert!(lines[0].contains("laptop"));
    assert_eq!(lines[1], "● alpha");
    assert_eq!(lines[2], "○ zeta");
}

#[test]
fn thread_lookup_matches_metadata() {
    let mut a = sample_session("s-a", "laptop", "telegram");
    a.adapter_meta = serde_json::json!({"telegram": {"topic_id": 42, "chat_id": -100}});
    let b = sample_session("s-b", "laptop", "telegram");

    let sessions = vec![a, b];
    assert_eq!(session_for_thread(&sessions, 42).map(|r| r.session_id.as_str()), Some("s-a"));
    assert!(session_for_thread(&sessions, 7).is_none());
}

#[test]
fn dm_lookup_skips_terminated_sessions() {
    let mut old = sample_session("s-old", "laptop", "telegram");
    old.adapter_meta = serde_json::json!({"telegram": {"dm_chat_id": 5, "dm_user_id": "1001"}});
    old.status = SessionStatus::Terminated;

    let mut live = sample_session("s-live", "laptop", "telegram");
    live.adapter_meta = serde_json::json!({"telegram": {"dm_chat_id": 5, "dm_user_id": "1001"}});
    live.status = SessionStatus::Running;

    let sessions = vec![old, live];
    assert_eq!(
        session_for_dm_user(&sessions, "1001").map(|r| r.session_id.as_str()),
        Some("s-live")
    );
    assert!(session_for_dm_user(&sessions, "2002").is_none());
}
