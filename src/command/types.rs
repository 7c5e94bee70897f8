//! Command envelope and command-state types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of work an agent is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    IsolateHost,
    UnisolateHost,
    RemoveFile,
    QuarantineFile,
    ListFiles,
    GetFileHash,
    RevertRegistryKey,
    SetRegistryValue,
    GetRegistryValue,
    ExportRegistryHive,
    KillProcess,
    GetProcessDetails,
    GetProcessTree,
    ScanProcessMemory,
    GetNetworkConnections,
    BlockIp,
    RebootNode,
    UpdateAgent,
    UninstallAgent,
    GetSystemInfo,
    CollectWindowsLogs,
    CollectFibratusLogs,
    ClearLocalLogs,
    EnableDebugLogging,
}

impl CommandKind {
    /// Every recognized command kind
    pub const ALL: [Self; 24] = [
        Self::IsolateHost,
        Self::UnisolateHost,
        Self::RemoveFile,
        Self::QuarantineFile,
        Self::ListFiles,
        Self::GetFileHash,
        Self::RevertRegistryKey,
        Self::SetRegistryValue,
        Self::GetRegistryValue,
        Self::ExportRegistryHive,
        Self::KillProcess,
        Self::GetProcessDetails,
        Self::GetProcessTree,
        Self::ScanProcessMemory,
        Self::GetNetworkConnections,
        Self::BlockIp,
        Self::RebootNode,
        Self::UpdateAgent,
        Self::UninstallAgent,
        Self::GetSystemInfo,
        Self::CollectWindowsLogs,
        Self::CollectFibratusLogs,
        Self::ClearLocalLogs,
        Self::EnableDebugLogging,
    ];

    /// Wire name of the command kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IsolateHost => "isolate-host",
            Self::UnisolateHost => "unisolate-host",
            Self::RemoveFile => "remove-file",
            Self::QuarantineFile => "quarantine-file",
            Self::ListFiles => "list-files",
            Self::GetFileHash => "get-file-hash",
            Self::RevertRegistryKey => "revert-registry-key",
            Self::SetRegistryValue => "set-registry-value",
            Self::GetRegistryValue => "get-registry-value",
            Self::ExportRegistryHive => "export-registry-hive",
            Self::KillProcess => "kill-process",
            Self::GetProcessDetails => "get-process-details",
            Self::GetProcessTree => "get-process-tree",
            Self::ScanProcessMemory => "scan-process-memory",
            Self::GetNetworkConnections => "get-network-connections",
            Self::BlockIp => "block-ip",
            Self::RebootNode => "reboot-node",
            Self::UpdateAgent => "update-agent",
            Self::UninstallAgent => "uninstall-agent",
            Self::GetSystemInfo => "get-system-info",
            Self::CollectWindowsLogs => "collect-windows-logs",
            Self::CollectFibratusLogs => "collect-fibratus-logs",
            Self::ClearLocalLogs => "clear-local-logs",
            Self::EnableDebugLogging => "enable-debug-logging",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Rejected(format!("unrecognized command type '{s}'")))
    }
}

/// Delivery priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    #[default]
    Normal,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
        }
    }
}

/// Recipient of a command: exactly one agent or exactly one group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Node(String),
    Group(String),
}

impl Target {
    /// Build a target from the two optional wire fields
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` unless exactly one non-empty field is given
    pub fn from_parts(node: Option<String>, group: Option<String>) -> Result<Self> {
        let node = node.filter(|n| !n.trim().is_empty());
        let group = group.filter(|g| !g.trim().is_empty());
        match (node, group) {
            (Some(node), None) => Ok(Self::Node(node)),
            (None, Some(group)) => Ok(Self::Group(group)),
            (Some(_), Some(_)) => Err(Error::Rejected(
                "target_node and target_group are mutually exclusive".to_string(),
            )),
            (None, None) => Err(Error::Rejected(
                "either target_node or target_group is required".to_string(),
            )),
        }
    }

    /// Agent identity, if this is a single-node target
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Node(node) => Some(node),
            Self::Group(_) => None,
        }
    }

    /// Group identity, if this is a group target
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Group(group) => Some(group),
            Self::Node(_) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(node) => write!(f, "node:{node}"),
            Self::Group(group) => write!(f, "group:{group}"),
        }
    }
}

/// Joins a group command's ID to a member identity in derived instance IDs
pub const MEMBER_SEPARATOR: char = ':';

/// Immutable description of one command instance
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    id: String,
    kind: CommandKind,
    priority: Priority,
    payload: serde_json::Value,
    target: Target,
}

impl CommandEnvelope {
    /// Create a validated envelope
    ///
    /// A `null` payload is normalized to an empty object.
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` if the ID is empty or the payload is not an object
    pub fn new(
        id: impl Into<String>,
        kind: CommandKind,
        priority: Priority,
        payload: serde_json::Value,
        target: Target,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Rejected("command ID is required".to_string()));
        }
        let payload = match payload {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            value @ serde_json::Value::Object(_) => value,
            _ => {
                return Err(Error::Rejected(
                    "command details must be a JSON object".to_string(),
                ));
            }
        };
        Ok(Self {
            id,
            kind,
            priority,
            payload,
            target,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    #[must_use]
    pub const fn target(&self) -> &Target {
        &self.target
    }

    /// Derive the per-member instance of a group command
    ///
    /// The derived ID is `"{parent}:{member}"`, unique as long as the parent is.
    #[must_use]
    pub fn for_member(&self, member: &str) -> Self {
        Self {
            id: format!("{}{MEMBER_SEPARATOR}{member}", self.id),
            kind: self.kind,
            priority: self.priority,
            payload: self.payload.clone(),
            target: Target::Node(member.to_string()),
        }
    }
}

/// Lifecycle status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl CommandStatus {
    /// Whether no further transition can occur
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported by an agent for a finished command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Mutable lifecycle record for a command
#[derive(Debug, Clone, Serialize)]
pub struct CommandState {
    pub id: String,
    pub kind: CommandKind,
    pub priority: Priority,
    /// `node:<id>` or `group:<id>`
    pub target: String,
    /// Agent identity for single-node commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic send time used by the ack reaper
    #[serde(skip)]
    pub(crate) sent_instant: Option<tokio::time::Instant>,
}

impl CommandState {
    /// Fresh `pending` state for an accepted envelope
    #[must_use]
    pub fn pending(envelope: &CommandEnvelope) -> Self {
        Self {
            id: envelope.id().to_string(),
            kind: envelope.kind(),
            priority: envelope.priority(),
            target: envelope.target().to_string(),
            identity: envelope.target().node().map(ToString::to_string),
            status: CommandStatus::Pending,
            result: None,
            created_at: Utc::now(),
            sent_at: None,
            completed_at: None,
            sent_instant: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_name() {
        for kind in CommandKind::ALL {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "format-disk".parse::<CommandKind>().unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
    }

    #[test]
    fn target_requires_exactly_one() {
        assert_eq!(
            Target::from_parts(Some("h1".into()), None).unwrap(),
            Target::Node("h1".into())
        );
        assert_eq!(
            Target::from_parts(None, Some("g1".into())).unwrap(),
            Target::Group("g1".into())
        );
        assert!(Target::from_parts(Some("h1".into()), Some("g1".into())).is_err());
        assert!(Target::from_parts(None, None).is_err());
        assert!(Target::from_parts(Some("  ".into()), None).is_err());
    }

    #[test]
    fn envelope_rejects_empty_id() {
        let result = CommandEnvelope::new(
            "",
            CommandKind::ListFiles,
            Priority::Normal,
            serde_json::Value::Null,
            Target::Node("h1".into()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn envelope_rejects_non_object_payload() {
        let result = CommandEnvelope::new(
            "cmd-1",
            CommandKind::ListFiles,
            Priority::Normal,
            serde_json::json!([1, 2]),
            Target::Node("h1".into()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn member_instance_has_derived_id() {
        let env = CommandEnvelope::new(
            "cmd-7",
            CommandKind::GetSystemInfo,
            Priority::Normal,
            serde_json::json!({"verbose": true}),
            Target::Group("servers".into()),
        )
        .unwrap();

        let member = env.for_member("h2");
        assert_eq!(member.id(), "cmd-7:h2");
        assert_eq!(member.target(), &Target::Node("h2".into()));
        assert_eq!(member.payload(), env.payload());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
        assert!(!CommandStatus::Acknowledged.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::TimedOut.is_terminal());
        assert!(CommandStatus::Canceled.is_terminal());
        assert_eq!(
            serde_json::to_value(CommandStatus::TimedOut).unwrap(),
            "timed-out"
        );
    }
}
