//! Read-only resources and prompt templates.

use serde_json::Value;

use hive_hub::Hub;

use crate::protocol::{
    Content, JsonRpcError, PromptArgument, PromptDef, PromptMessage, ResourceContent, ResourceDef,
};

const JSON_MIME: &str = "application/json";

pub fn resource_definitions() -> Vec<ResourceDef> {
    vec![
        ResourceDef {
            uri: "hive://status",
            name: "Hive Status",
            description: "Agent, task, solicitation and port counts",
            mime_type: JSON_MIME,
        },
        ResourceDef {
            uri: "hive://agents",
            name: "Agents",
            description: "Every agent known to the hub",
            mime_type: JSON_MIME,
        },
        ResourceDef {
            uri: "hive://solicitations",
            name: "Solicitations",
            description: "Open solicitations, most urgent first",
            mime_type: JSON_MIME,
        },
    ]
}

pub async fn read_resource(hub: &Hub, uri: &str) -> Result<ResourceContent, JsonRpcError> {
    let value = match uri {
        "hive://status" => serde_json::to_value(hub.status().await),
        "hive://agents" => serde_json::to_value(hub.list_agents().await),
        "hive://solicitations" => serde_json::to_value(hub.solicitations().list_open().await),
        other => {
            return Err(JsonRpcError::invalid_params(format!("unknown resource: {other}")));
        }
    }
    .map_err(JsonRpcError::internal)?;

    Ok(ResourceContent {
        uri: uri.to_string(),
        mime_type: JSON_MIME.to_string(),
        text: pretty(&value),
    })
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub fn prompt_definitions() -> Vec<PromptDef> {
    vec![
        PromptDef {
            name: "task_plan",
            description: "Draft a step-by-step plan for a drone",
            arguments: vec![
                PromptArgument {
                    name: "objective",
                    description: "What the drone should accomplish",
                    required: true,
                },
                PromptArgument {
                    name: "specialty",
                    description: "Drone specialty (defaults to fullstack)",
                    required: false,
                },
            ],
        },
        PromptDef {
            name: "review_solicitation",
            description: "Review and answer a question raised by a drone",
            arguments: vec![PromptArgument {
                name: "solicitation_id",
                description: "The solicitation ID",
                required: true,
            }],
        },
    ]
}

pub async fn get_prompt(
    hub: &Hub,
    name: &str,
    args: &std::collections::HashMap<String, String>,
) -> Result<Vec<PromptMessage>, JsonRpcError> {
    let arg = |key: &str| args.get(key).map(String::as_str).filter(|v| !v.trim().is_empty());

    let text = match name {
        "task_plan" => {
            let objective = arg("objective")
                .ok_or_else(|| JsonRpcError::invalid_params("objective is required"))?;
            let specialty = arg("specialty").unwrap_or("fullstack");
            format!(
                "Create a task plan for a drone with specialty \"{specialty}\" to accomplish:\n\n\
                 {objective}\n\n\
                 For each step give the concrete actions, a definition of done, and the \
                 autonomy level (full, ask_if_unclear, validate_before_next, notify_when_done). \
                 Split work that crosses specialties into separate tasks."
            )
        }
        "review_solicitation" => {
            let id = arg("solicitation_id")
                .ok_or_else(|| JsonRpcError::invalid_params("solicitation_id is required"))?;
            let sol = hub
                .solicitations()
                .get(id)
                .await
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
            let mut text = format!(
                "Drone \"{}\" is asking for help.\n\nKind: {}\nUrgency: {}\nQuestion: {}\n",
                sol.agent_name,
                sol.kind.as_str(),
                sol.urgency.as_str(),
                sol.question
            );
            if let Some(context) = &sol.context {
                text.push_str(&format!("Context: {context}\n"));
            }
            if !sol.options.is_empty() {
                text.push_str(&format!("Options: {}\n", sol.options.join(" | ")));
            }
            text.push_str(
                "\nAnswer the question directly with a clear decision, taking the urgency \
                 into account, then send it with respond_solicitation.",
            );
            text
        }
        other => return Err(JsonRpcError::invalid_params(format!("unknown prompt: {other}"))),
    };

    Ok(vec![PromptMessage {
        role: "user".to_string(),
        content: Content::text(text),
    }])
}
