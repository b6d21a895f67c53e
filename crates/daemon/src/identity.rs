// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identity resolution and home routing.
//!
//! A registered person binds adapter user ids to a home path and an
//! agent profile. Requests arriving through an external adapter have
//! their project path overridden: known users land in their home,
//! unknown users in the reserved help-desk path under the restricted
//! profile. Colocated tool callers choose their own path; relayed
//! requests inherit the initiator's identity.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::store::{SessionRecord, SessionRole, SessionStore};

/// Where a request entered the daemon. Carried on every tool call and
/// used for permission gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOrigin {
    LocalTui,
    ChatUser,
    AgentOfSession,
}

impl CallOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalTui => "local_tui",
            Self::ChatUser => "chat_user",
            Self::AgentOfSession => "agent_of_session",
        }
    }
}

/// A named bundle of CLI flags and directory confinement applied when a
/// session's child process starts.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub name: String,
    /// Extra flags appended to the agent command line.
    pub extra_args: Vec<String>,
    /// When set, the session's working directory is forced inside this path.
    pub confine_to: Option<PathBuf>,
}

impl AgentProfile {
    /// Full-authority profile.
    pub fn default_profile() -> Self {
        Self { name: "default".to_owned(), extra_args: Vec::new(), confine_to: None }
    }

    /// Jailed profile used for unknown external users.
    pub fn restricted(help_desk: &Path) -> Self {
        Self {
            name: "restricted".to_owned(),
            extra_args: vec!["--permission-mode".to_owned(), "plan".to_owned()],
            confine_to: Some(help_desk.to_owned()),
        }
    }

    /// Resolve a stored profile name. Unknown names fall back to
    /// restricted — the safe direction.
    pub fn by_name(name: &str, help_desk: &Path) -> Self {
        match name {
            "default" => Self::default_profile(),
            _ => Self::restricted(help_desk),
        }
    }

    /// Build the child command for an agent kind under this profile.
    pub fn command_for(&self, agent: &str) -> Vec<String> {
        let mut cmd = vec![agent.to_owned()];
        cmd.extend(self.extra_args.iter().cloned());
        cmd
    }
}

/// The requester, as seen by the lifecycle coordinator.
#[derive(Debug, Clone)]
pub enum Requester<'a> {
    /// External chat adapter with an adapter-scoped user id.
    Chat { adapter: &'a str, user_id: &'a str },
    /// Colocated tool socket; the caller chose the path.
    Tool { origin: CallOrigin },
    /// Relayed from another node on behalf of an initiating session.
    Relayed { initiator: &'a SessionRecord },
}

/// Outcome of identity resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Forced project path, when the requester does not get to choose.
    pub project_path_override: Option<PathBuf>,
    pub profile: AgentProfile,
    pub human_identity: Option<String>,
    pub role: SessionRole,
    pub initiator_session_id: Option<String>,
}

/// Resolver: person registry lookups plus the reserved help-desk path.
pub struct IdentityResolver {
    help_desk: PathBuf,
}

impl IdentityResolver {
    pub fn new(help_desk: PathBuf) -> Self {
        Self { help_desk }
    }

    pub fn help_desk(&self) -> &Path {
        &self.help_desk
    }

    pub fn resolve(
        &self,
        store: &SessionStore,
        requester: &Requester<'_>,
    ) -> Result<Resolution, Fault> {
        match requester {
            Requester::Chat { adapter, user_id } => {
                match store.person_by_adapter_id(adapter, user_id)? {
                    Some(person) => Ok(Resolution {
                        project_path_override: Some(PathBuf::from(&person.home)),
                        profile: AgentProfile::by_name(&person.profile, &self.help_desk),
                        human_identity: Some(person.email),
                        role: SessionRole::Human,
                        initiator_session_id: None,
                    }),
                    None => Ok(Resolution {
                        project_path_override: Some(self.help_desk.clone()),
                        profile: AgentProfile::restricted(&self.help_desk),
                        human_identity: None,
                        role: SessionRole::Human,
                        initiator_session_id: None,
                    }),
                }
            }
            Requester::Tool { origin } => Ok(Resolution {
                project_path_override: None,
                profile: AgentProfile::default_profile(),
                human_identity: None,
                role: match origin {
                    CallOrigin::LocalTui | CallOrigin::ChatUser => SessionRole::Human,
                    CallOrigin::AgentOfSession => SessionRole::AiOrigin,
                },
                initiator_session_id: None,
            }),
            Requester::Relayed { initiator } => Ok(Resolution {
                project_path_override: None,
                profile: AgentProfile::default_profile(),
                human_identity: initiator.human_identity.clone(),
                role: SessionRole::AiWorker,
                initiator_session_id: Some(initiator.session_id.clone()),
            }),
        }
    }
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
