// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use super::*;
use crate::store::{Person, SessionStatus, SessionStore};

fn store_with_alice() -> anyhow::Result<SessionStore> {
    let store = SessionStore::open_in_memory("laptop")
        .map_err(|e| anyhow::anyhow!("store: {e}"))?;
    store.upsert_person(&Person {
        email: "alice@example.com".to_owned(),
        name: "Alice".to_owned(),
        adapter_user_ids: serde_json::json!({"telegram": "1001"}),
        home: "/home/alice".to_owned(),
        profile: "default".to_owned(),
    })?;
    Ok(store)
}

fn resolver() -> IdentityResolver {
    IdentityResolver::new(PathBuf::from("/srv/help-desk"))
}

#[test]
fn known_chat_user_routes_home() -> anyhow::Result<()> {
    let store = store_with_alice()?;
    let res = resolver()
        .resolve(&store, &Requester::Chat { adapter: "telegram", user_id: "1001" })?;

    assert_eq!(res.project_path_override, Some(PathBuf::from("/home/alice")));
    assert_eq!(res.profile.name, "default");
    assert_eq!(res.human_identity.as_deref(), Some("alice@example.com"));
    assert_eq!(res.role, SessionRole::Human);
    Ok(())
}

#[test]
fn unknown_chat_user_routes_to_help_desk_restricted() -> anyhow::Result<()> {
    let store = store_with_alice()?;
    let res = resolver()
        .resolve(&store, &Requester::Chat { adapter: "telegram", user_id: "31337" })?;

    assert_eq!(res.project_path_override, Some(PathBuf::from("/srv/help-desk")));
    assert_eq!(res.profile.name, "restricted");
    assert_eq!(res.profile.confine_to, Some(PathBuf::from("/srv/help-desk")));
    assert!(res.human_identity.is_none());
    Ok(())
}

#[test]
fn tool_caller_keeps_chosen_path() -> anyhow::Result<()> {
    let store = store_with_alice()?;
    let res =
        resolver().resolve(&store, &Requester::Tool { origin: CallOrigin::LocalTui })?;
    assert!(res.project_path_override.is_none());
    assert_eq!(res.profile.name, "default");
    assert_eq!(res.role, SessionRole::Human);

    let res =
        resolver().resolve(&store, &Requester::Tool { origin: CallOrigin::AgentOfSession })?;
    assert_eq!(res.role, SessionRole::AiOrigin);
    Ok(())
}

#[test]
fn relayed_request_inherits_initiator_identity() -> anyhow::Result<()> {
    let store = store_with_alice()?;
    let initiator = crate::store::SessionRecord {
        session_id: "s-parent".to_owned(),
        computer: "laptop".to_owned(),
        project_path: "/home/alice".to_owned(),
        agent: "claude".to_owned(),
        thinking_mode: String::new(),
        status: SessionStatus::Running,
        role: SessionRole::Human,
        initiator_session_id: None,
        human_identity: Some("alice@example.com".to_owned()),
        origin_adapter: "telegram".to_owned(),
        title: String::new(),
        adapter_meta: serde_json::json!({}),
        last_output_summary: None,
        created_at: 0,
        last_activity_at: 0,
        terminated_at: None,
    };

    let res = resolver().resolve(&store, &Requester::Relayed { initiator: &initiator })?;
    assert_eq!(res.human_identity.as_deref(), Some("alice@example.com"));
    assert_eq!(res.initiator_session_id.as_deref(), Some("s-parent"));
    assert_eq!(res.role, SessionRole::AiWorker);
    assert!(res.project_path_override.is_none());
    Ok(())
}

#[test]
fn unknown_profile_name_falls_back_to_restricted() {
    let profile = AgentProfile::by_name("mystery", std::path::Path::new("/srv/help-desk"));
    assert_eq!(profile.name, "restricted");
}

#[test]
fn restricted_profile_jails_the_command() {
    let profile = AgentProfile::restricted(std::path::Path::new("/srv/help-desk"));
    let cmd = profile.command_for("claude");
    assert_eq!(cmd[0], "claude");
    assert!(cmd.contains(&"--permission-mode".to_owned()));

    let cmd = AgentProfile::default_profile().command_for("gemini");
    assert_eq!(cmd, vec!["gemini".to_owned()]);
}
