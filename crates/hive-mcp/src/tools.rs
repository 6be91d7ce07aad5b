//! The tool vocabulary exposed to the supervising agent.
//!
//! Each tool maps onto hub operations only; nothing here runs commands on
//! the host.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use hive_hub::agent::SpawnOptions;
use hive_hub::task::{CreateTaskRequest, TaskStatus};
use hive_hub::{Hub, HubError, TaskAction, TaskUpdate};

use crate::protocol::{INTERNAL_ERROR, INVALID_PARAMS, JsonRpcError, TOOL_ERROR, ToolDef};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ToolError {
    /// JSON-RPC error for a failed call to `tool`.
    pub fn into_rpc(self, tool: &str) -> JsonRpcError {
        match self {
            Self::UnknownTool(name) => {
                JsonRpcError::new(INVALID_PARAMS, format!("Unknown tool: {name}"))
            }
            Self::InvalidArguments(msg) => JsonRpcError::new(INVALID_PARAMS, msg)
                .with_data(json!({"kind": "validation", "tool": tool})),
            Self::Hub(e) => JsonRpcError::new(TOOL_ERROR, e.to_string())
                .with_data(json!({"kind": e.kind().as_str(), "tool": tool})),
            Self::Encode(e) => JsonRpcError::new(INTERNAL_ERROR, e.to_string()),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments(msg.into())
}

/// Tools advertised by `tools/list`.
pub fn definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "manage_agent",
            description: "Spawn, stop, destroy, list, or inspect drones",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["spawn", "stop", "destroy", "list", "get"]},
                    "agent_id": {"type": "string", "description": "Agent ID or name (stop, destroy, get)"},
                    "name": {"type": "string", "description": "Agent name (spawn)"},
                    "branch": {"type": "string", "description": "Branch to create or reuse (spawn)"},
                    "base_branch": {"type": "string", "description": "Branch to fork from (spawn)"},
                    "specialty": {"type": "string", "enum": ["front", "back", "infra", "fullstack"]},
                    "model": {"type": "string", "description": "Model passed to the agent (spawn)"},
                    "sandbox": {"type": "boolean", "description": "Run under the sandbox wrapper (spawn)"}
                },
                "required": ["action"]
            }),
        },
        ToolDef {
            name: "send_message",
            description: "Send a message to a running drone",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string", "description": "Agent ID or name"},
                    "message": {"type": "string", "description": "Message content"}
                },
                "required": ["agent_id", "message"]
            }),
        },
        ToolDef {
            name: "get_conversation",
            description: "Get the conversation history of a drone",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string", "description": "Agent ID or name"}
                },
                "required": ["agent_id"]
            }),
        },
        ToolDef {
            name: "manage_task",
            description: "Create, start, complete, fail, cancel, list, or inspect tasks",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["create", "start", "complete", "fail", "cancel", "list", "get"]},
                    "task_id": {"type": "string", "description": "Task ID (start, complete, fail, cancel, get)"},
                    "agent_id": {"type": "string", "description": "Assignee ID or name (create, start, list)"},
                    "title": {"type": "string", "description": "Task title (create)"},
                    "description": {"type": "string", "description": "Task description (create)"},
                    "result": {"type": "string", "description": "Outcome (complete)"},
                    "error": {"type": "string", "description": "Failure reason (fail, cancel)"},
                    "status": {"type": "string", "enum": ["pending", "in_progress", "completed", "failed", "cancelled"]}
                },
                "required": ["action"]
            }),
        },
        ToolDef {
            name: "respond_solicitation",
            description: "Answer, dismiss, list, or inspect questions raised by drones",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["respond", "dismiss", "list", "get"]},
                    "solicitation_id": {"type": "string", "description": "Solicitation ID"},
                    "response": {"type": "string", "description": "Answer (respond) or reason (dismiss)"}
                },
                "required": ["action"]
            }),
        },
        ToolDef {
            name: "manage_port",
            description: "List port leases or force-release a service port",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["list", "force_release"]},
                    "port": {"type": ["integer", "string"], "description": "Port number (force_release)"}
                },
                "required": ["action"]
            }),
        },
        ToolDef {
            name: "get_status",
            description: "Get overall hive status",
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// Run `name` with `args` against the hub.
pub async fn call(hub: &Hub, name: &str, args: Value) -> Result<Value, ToolError> {
    debug!(tool = name, "Tool call");
    match name {
        "manage_agent" => manage_agent(hub, parse(args)?).await,
        "send_message" => send_message(hub, parse(args)?).await,
        "get_conversation" => {
            let args: AgentRef = parse(args)?;
            let agent_id = required(args.agent_id.as_deref(), "agent_id")?;
            to_json(hub.conversation(agent_id).await?)
        }
        "manage_task" => manage_task(hub, parse(args)?).await,
        "respond_solicitation" => respond_solicitation(hub, parse(args)?).await,
        "manage_port" => manage_port(hub, parse(args)?).await,
        "get_status" => to_json(hub.status().await),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| invalid(format!("invalid arguments: {e}")))
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ToolError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| invalid(format!("{field} is required")))
}

fn to_json(value: impl Serialize) -> Result<Value, ToolError> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Debug, Deserialize)]
struct AgentRef {
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AgentAction {
    Spawn,
    Stop,
    Destroy,
    List,
    Get,
}

#[derive(Debug, Deserialize)]
struct ManageAgentArgs {
    action: AgentAction,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    base_branch: Option<String>,
    #[serde(default)]
    specialty: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    sandbox: Option<bool>,
}

async fn manage_agent(hub: &Hub, args: ManageAgentArgs) -> Result<Value, ToolError> {
    match args.action {
        AgentAction::Spawn => {
            let name = required(args.name.as_deref(), "name")?.to_string();
            let opts = SpawnOptions {
                name,
                branch: args.branch.filter(|b| !b.is_empty()),
                base_branch: args.base_branch.filter(|b| !b.is_empty()),
                specialty: args.specialty.filter(|s| !s.is_empty()),
                model: args.model.filter(|m| !m.is_empty()),
                sandbox: args.sandbox,
            };
            to_json(hub.spawn_agent(opts).await?)
        }
        AgentAction::Stop => {
            let id = required(args.agent_id.as_deref(), "agent_id")?;
            to_json(hub.stop_agent(id).await?)
        }
        AgentAction::Destroy => {
            let id = required(args.agent_id.as_deref(), "agent_id")?;
            let agent = hub.destroy_agent(id).await?;
            Ok(json!({"status": "destroyed", "agent": agent}))
        }
        AgentAction::List => to_json(hub.list_agents().await),
        AgentAction::Get => {
            let id = required(args.agent_id.as_deref(), "agent_id")?;
            to_json(hub.agent_status(id).await?)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default, alias = "content")]
    message: Option<String>,
}

async fn send_message(hub: &Hub, args: SendMessageArgs) -> Result<Value, ToolError> {
    let agent_id = required(args.agent_id.as_deref(), "agent_id")?;
    let message = required(args.message.as_deref(), "message")?;
    hub.message_agent(agent_id, message).await?;
    Ok(json!({"status": "sent"}))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskToolAction {
    Create,
    Start,
    Complete,
    Fail,
    Cancel,
    List,
    Get,
}

#[derive(Debug, Deserialize)]
struct ManageTaskArgs {
    action: TaskToolAction,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

async fn manage_task(hub: &Hub, args: ManageTaskArgs) -> Result<Value, ToolError> {
    let transition = match args.action {
        TaskToolAction::Create => {
            let title = required(args.title.as_deref(), "title")?.to_string();
            let task = hub
                .create_task(CreateTaskRequest {
                    title,
                    description: args.description.unwrap_or_default(),
                    agent_id: args.agent_id,
                    agent_name: None,
                })
                .await?;
            return to_json(task);
        }
        TaskToolAction::List => {
            let status = args
                .status
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::parse::<TaskStatus>)
                .transpose()
                .map_err(|e| invalid(e.to_string()))?;
            let agent_id = match args.agent_id.filter(|a| !a.is_empty()) {
                Some(wanted) => Some(
                    hub.agents()
                        .get(&wanted)
                        .await
                        .map_or(wanted, |agent| agent.id),
                ),
                None => None,
            };
            return to_json(hub.tasks().list(agent_id.as_deref(), status).await);
        }
        TaskToolAction::Get => {
            let id = required(args.task_id.as_deref(), "task_id")?;
            return to_json(hub.tasks().get(id).await.map_err(HubError::from)?);
        }
        TaskToolAction::Start => TaskAction::Start,
        TaskToolAction::Complete => TaskAction::Complete,
        TaskToolAction::Fail => TaskAction::Fail,
        TaskToolAction::Cancel => TaskAction::Cancel,
    };

    let id = required(args.task_id.as_deref(), "task_id")?;
    let update = TaskUpdate {
        agent_id: args.agent_id,
        result: args.result,
        error: args.error,
        ..TaskUpdate::new(transition)
    };
    to_json(hub.update_task(id, update).await?)
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SolicitationAction {
    Respond,
    Dismiss,
    List,
    Get,
}

#[derive(Debug, Deserialize)]
struct RespondSolicitationArgs {
    action: SolicitationAction,
    #[serde(default)]
    solicitation_id: Option<String>,
    #[serde(default, alias = "answer")]
    response: Option<String>,
}

async fn respond_solicitation(hub: &Hub, args: RespondSolicitationArgs) -> Result<Value, ToolError> {
    let sols = hub.solicitations();
    if matches!(args.action, SolicitationAction::List) {
        return to_json(sols.list_open().await);
    }

    let id = required(args.solicitation_id.as_deref(), "solicitation_id")?;
    let sol = match args.action {
        SolicitationAction::Respond => {
            let response = required(args.response.as_deref(), "response")?;
            sols.respond(id, response).await
        }
        SolicitationAction::Dismiss => sols.dismiss(id, args.response).await,
        SolicitationAction::Get | SolicitationAction::List => sols.get(id).await,
    };
    to_json(sol.map_err(HubError::from)?)
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PortAction {
    List,
    ForceRelease,
}

#[derive(Debug, Deserialize)]
struct ManagePortArgs {
    action: PortAction,
    #[serde(default)]
    port: Option<Value>,
}

async fn manage_port(hub: &Hub, args: ManagePortArgs) -> Result<Value, ToolError> {
    let ports = hub.ports();
    match args.action {
        PortAction::List => Ok(json!({
            "leases": ports.leases().await,
            "waiters": ports.waiters().await,
        })),
        PortAction::ForceRelease => {
            let port = port_arg(args.port.as_ref())?;
            let lease = ports.force_release(port).await.map_err(HubError::from)?;
            Ok(json!({"status": "released", "lease": lease}))
        }
    }
}

/// Accepts the port as a JSON number or a decimal string.
fn port_arg(value: Option<&Value>) -> Result<u16, ToolError> {
    let raw = match value {
        None | Some(Value::Null) => return Err(invalid("port is required")),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(other) => return Err(invalid(format!("invalid port: {other}"))),
    };
    raw.and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid("port must be between 1 and 65535"))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_has_an_object_schema() {
        let defs = definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            [
                "manage_agent",
                "send_message",
                "get_conversation",
                "manage_task",
                "respond_solicitation",
                "manage_port",
                "get_status"
            ]
        );
        for def in &defs {
            assert_eq!(def.input_schema["type"], "object", "{}", def.name);
        }
    }

    #[test]
    fn port_argument_forms() {
        assert_eq!(port_arg(Some(&json!(3300))).unwrap(), 3300);
        assert_eq!(port_arg(Some(&json!(" 3301 "))).unwrap(), 3301);
        for bad in [json!(0), json!(70_000), json!("abc"), json!(-1), json!(true)] {
            assert!(
                matches!(port_arg(Some(&bad)), Err(ToolError::InvalidArguments(_))),
                "{bad} accepted"
            );
        }
        assert!(port_arg(None).is_err());
    }

    #[test]
    fn unknown_action_is_an_argument_error() {
        let err = parse::<ManageAgentArgs>(json!({"action": "explode"})).unwrap_err();
        let rpc = err.into_rpc("manage_agent");
        assert_eq!(rpc.code, INVALID_PARAMS);
        assert_eq!(rpc.data.unwrap()["tool"], "manage_agent");
    }

    #[test]
    fn missing_arguments_object_means_empty() {
        let args: AgentRef = parse(Value::Null).unwrap();
        assert!(args.agent_id.is_none());
        assert!(required(args.agent_id.as_deref(), "agent_id").is_err());
    }
}
