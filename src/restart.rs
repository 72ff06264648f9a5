//! Auto-restart of offline roles.
//!
//! When readiness shows roles missing or expired, the `RestartCoordinator`
//! asks the machine-control daemon to stop and start each of them again,
//! using the configuration the role last ran with. Calls are debounced per
//! chatroom, and a failing role never stops the others from being tried:
//! failures end up in the report as skips, never as errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::{AgentStatus, Chatroom, ChatroomId};
use crate::error::{Error, Result};
use crate::liveness::LivenessTracker;
use crate::readiness::ReadinessSnapshot;
use crate::role::RoleKey;
use crate::util::with_timeout;
use crate::{alog, alog_debug, alog_warn};

/// How a role was last launched on its machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub machine_id: String,
    pub model: Option<String>,
    pub working_dir: Option<String>,
    pub harness: Option<String>,
}

impl MachineConfig {
    pub fn new(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            model: None,
            working_dir: None,
            harness: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    StartAgent,
    StopAgent,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::StartAgent => write!(f, "start-agent"),
            CommandType::StopAgent => write!(f, "stop-agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub chatroom_id: ChatroomId,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harness: Option<String>,
}

/// A command for the machine daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineCommand {
    pub machine_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: CommandPayload,
}

impl MachineCommand {
    pub fn new(
        command_type: CommandType,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        config: &MachineConfig,
    ) -> Self {
        Self {
            machine_id: config.machine_id.clone(),
            command_type,
            payload: CommandPayload {
                chatroom_id,
                role: role.as_str().to_string(),
                model: config.model.clone(),
                working_dir: config.working_dir.clone(),
                harness: config.harness.clone(),
            },
        }
    }
}

/// Identifier the daemon returns for an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub String);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Machine-control daemon client.
#[async_trait]
pub trait MachineControl: Send + Sync {
    async fn send(&self, command: MachineCommand) -> Result<CommandId>;
}

/// Why a role was not restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum SkipReason {
    /// The role never ran anywhere we know of.
    NoMachineConfig,
    /// Revive attempts used up; needs a manual reset.
    ReviveExhausted,
    StopFailed(String),
    StartFailed(String),
    /// The liveness record could not be moved to `restarting`.
    Liveness(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoMachineConfig => write!(f, "no machine configuration"),
            SkipReason::ReviveExhausted => write!(f, "restart attempts exhausted"),
            SkipReason::StopFailed(e) => write!(f, "stop failed: {}", e),
            SkipReason::StartFailed(e) => write!(f, "start failed: {}", e),
            SkipReason::Liveness(e) => write!(f, "liveness: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartedRole {
    pub role: RoleKey,
    pub machine_id: String,
    pub stop_command: CommandId,
    pub start_command: CommandId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRole {
    pub role: RoleKey,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    pub chatroom_id: ChatroomId,
    pub restarted: Vec<RestartedRole>,
    pub skipped: Vec<SkippedRole>,
}

/// Tunables for the restart coordinator.
#[derive(Debug, Clone)]
pub struct RestartSettings {
    pub cooldown: chrono::Duration,
    pub settle: Duration,
    pub command_timeout: Duration,
    pub max_attempts: u32,
}

pub struct RestartCoordinator {
    machine: Arc<dyn MachineControl>,
    liveness: LivenessTracker,
    settings: RestartSettings,
    last_run: Mutex<HashMap<ChatroomId, DateTime<Utc>>>,
}

impl RestartCoordinator {
    pub fn new(
        machine: Arc<dyn MachineControl>,
        liveness: LivenessTracker,
        settings: RestartSettings,
    ) -> Self {
        Self {
            machine,
            liveness,
            settings,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Stop and start every missing or expired role of `chatroom`.
    ///
    /// Returns `None` without contacting the daemon when the chatroom was
    /// handled less than the cooldown ago.
    pub async fn restart_offline(
        &self,
        chatroom: &Chatroom,
        readiness: &ReadinessSnapshot,
        configs: &HashMap<RoleKey, MachineConfig>,
        now: DateTime<Utc>,
    ) -> Option<RestartReport> {
        {
            let mut last_run = self.last_run.lock().await;
            if let Some(last) = last_run.get(&chatroom.id) {
                if now - *last < self.settings.cooldown {
                    alog_debug!(
                        "restart for {} debounced (last run {})",
                        chatroom.id.short(),
                        last
                    );
                    return None;
                }
            }
            // Entries past their cooldown no longer debounce anything.
            let cooldown = self.settings.cooldown;
            last_run.retain(|_, at| now - *at < cooldown);
            last_run.insert(chatroom.id, now);
        }

        let mut report = RestartReport {
            chatroom_id: chatroom.id,
            restarted: Vec::new(),
            skipped: Vec::new(),
        };

        let mut candidates = Vec::new();
        for role in readiness.offline_roles() {
            let Some(config) = configs.get(&role) else {
                report.skipped.push(SkippedRole {
                    role,
                    reason: SkipReason::NoMachineConfig,
                });
                continue;
            };
            match self.prepare(chatroom.id, &role, now).await {
                Ok(()) => candidates.push((role, config.clone())),
                Err(reason) => report.skipped.push(SkippedRole { role, reason }),
            }
        }

        if candidates.is_empty() {
            self.log_report(&report);
            return Some(report);
        }

        let stops = join_all(candidates.iter().map(|(role, config)| {
            self.send(MachineCommand::new(CommandType::StopAgent, chatroom.id, role, config))
        }))
        .await;

        let mut stopped = Vec::new();
        for ((role, config), result) in candidates.into_iter().zip(stops) {
            match result {
                Ok(stop_id) => stopped.push((role, config, stop_id)),
                Err(e) => report.skipped.push(SkippedRole {
                    role,
                    reason: SkipReason::StopFailed(e),
                }),
            }
        }

        if !stopped.is_empty() {
            tokio::time::sleep(self.settings.settle).await;
        }

        let starts = join_all(stopped.iter().map(|(role, config, _)| {
            self.send(MachineCommand::new(CommandType::StartAgent, chatroom.id, role, config))
        }))
        .await;

        for ((role, config, stop_command), result) in stopped.into_iter().zip(starts) {
            match result {
                Ok(start_command) => report.restarted.push(RestartedRole {
                    role,
                    machine_id: config.machine_id,
                    stop_command,
                    start_command,
                }),
                Err(e) => report.skipped.push(SkippedRole {
                    role,
                    reason: SkipReason::StartFailed(e),
                }),
            }
        }

        self.log_report(&report);
        Some(report)
    }

    /// Move the role's liveness record towards `restarting`.
    ///
    /// Roles with no participant record have nothing to move.
    async fn prepare(
        &self,
        chatroom_id: ChatroomId,
        role: &RoleKey,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SkipReason> {
        let participant = match self.liveness.participant(chatroom_id, role).await {
            Ok(p) => p,
            Err(Error::ParticipantNotFound { .. }) => return Ok(()),
            Err(e) => return Err(SkipReason::Liveness(e.to_string())),
        };

        let liveness_err = |e: Error| SkipReason::Liveness(e.to_string());
        match participant.status {
            AgentStatus::DeadFailedRevive => return Err(SkipReason::ReviveExhausted),
            AgentStatus::Offline => return Ok(()),
            AgentStatus::Ready | AgentStatus::Working => {
                self.liveness
                    .mark_dead(chatroom_id, role, now)
                    .await
                    .map_err(liveness_err)?;
            }
            AgentStatus::Dead | AgentStatus::Restarting => {}
        }

        let revived = self
            .liveness
            .attempt_revive(chatroom_id, role, now, self.settings.max_attempts)
            .await
            .map_err(liveness_err)?;
        if revived.status == AgentStatus::DeadFailedRevive {
            return Err(SkipReason::ReviveExhausted);
        }
        Ok(())
    }

    async fn send(&self, command: MachineCommand) -> std::result::Result<CommandId, String> {
        let label = format!(
            "{} {} on {}",
            command.command_type, command.payload.role, command.machine_id
        );
        match with_timeout(self.settings.command_timeout, self.machine.send(command)).await {
            Ok(id) => {
                alog_debug!("{} accepted as {}", label, id);
                Ok(id)
            }
            Err(e) => {
                alog_warn!("{} failed: {}", label, e);
                Err(e.to_string())
            }
        }
    }

    fn log_report(&self, report: &RestartReport) {
        alog!(
            "restart for {}: {} restarted, {} skipped",
            report.chatroom_id.short(),
            report.restarted.len(),
            report.skipped.len()
        );
        for skipped in &report.skipped {
            alog_debug!("  skipped {}: {}", skipped.role, skipped.reason);
        }
    }
}
