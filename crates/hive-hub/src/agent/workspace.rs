//! Files dropped into a fresh worktree before the agent starts.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::debug;

/// Directory inside the worktree for hive-owned files.
pub const HIVE_DIR: &str = ".hive";
pub const COMMANDS_FILE: &str = "hive-commands.sh";
pub const BRIEFING_FILE: &str = "CLAUDE.local.md";
pub const SANDBOX_POLICY_FILE: &str = "sandbox.json";
pub const LOG_FILE: &str = "agent.log";

/// Identity and context rendered into the agent briefing.
#[derive(Debug, Clone)]
pub struct Briefing<'a> {
    pub agent_id: &'a str,
    pub agent_name: &'a str,
    pub branch: &'a str,
    pub base_branch: &'a str,
    pub specialty: Option<&'a str>,
    pub hub_url: &'a str,
    pub repo: &'a Path,
}

/// Paths of the files written by [`prepare`].
#[derive(Debug, Clone)]
pub struct WorkspaceFiles {
    pub commands: PathBuf,
    pub briefing: PathBuf,
    pub sandbox_policy: Option<PathBuf>,
    pub log: PathBuf,
}

const COMMANDS_SCRIPT: &str = r##"#!/bin/sh
# Hive helpers. Source this file: . "$HIVE_COMMANDS_PATH"

_hive_json() {
    printf '%s' "$1" | tr '\n' ' ' | sed -e 's/\\/\\\\/g' -e 's/"/\\"/g'
}

_hive() {
    method="$1"; path="$2"; body="$3"
    if [ -n "$body" ]; then
        curl -sS -X "$method" -H 'Content-Type: application/json' -d "$body" "$HIVE_HUB_URL$path"
    else
        curl -sS -X "$method" "$HIVE_HUB_URL$path"
    fi
    echo
}

# hive_solicit <kind> <urgency> <question> [timeout_secs]
# Blocks until the Queen answers. kind: blocker|ambiguity|decision|validation|info
hive_solicit() {
    _hive POST /solicitations "{\"agent_id\":\"$HIVE_AGENT_ID\",\"agent_name\":\"$HIVE_AGENT_NAME\",\"kind\":\"$1\",\"urgency\":\"$2\",\"question\":\"$(_hive_json "$3")\",\"wait\":true,\"timeout_secs\":${4:-0}}"
}

hive_my_tasks() {
    _hive GET "/tasks?agent_id=$HIVE_AGENT_ID"
}

hive_task_start() {
    _hive PATCH "/tasks/$1" "{\"action\":\"start\",\"agent_id\":\"$HIVE_AGENT_ID\"}"
}

hive_task_complete() {
    _hive PATCH "/tasks/$1" "{\"action\":\"complete\",\"result\":\"$(_hive_json "$2")\"}"
}

hive_task_fail() {
    _hive PATCH "/tasks/$1" "{\"action\":\"fail\",\"error\":\"$(_hive_json "$2")\"}"
}

# hive_port_acquire <port> <service> [timeout_secs]
hive_port_acquire() {
    _hive POST /ports/acquire "{\"port\":$1,\"agent_id\":\"$HIVE_AGENT_ID\",\"agent_name\":\"$HIVE_AGENT_NAME\",\"service\":\"$2\",\"wait\":true,\"timeout_secs\":${3:-60}}"
}

hive_port_release() {
    _hive POST /ports/release "{\"port\":$1,\"agent_id\":\"$HIVE_AGENT_ID\"}"
}
"##;

const BRIEFING_TEMPLATE: &str = "# Hive drone {{NAME}}

You are **{{NAME}}** (id `{{ID}}`), a worker drone coordinated by the Queen through the hive hub.

- Specialty: {{SPECIALTY}}
- Branch: `{{BRANCH}}` (created from `{{BASE}}`)
- Repository: `{{REPO}}`
- Hub: {{HUB}}

## Rules

- Work only inside this worktree and commit to `{{BRANCH}}`. Never push to `{{BASE}}`.
- When blocked or unsure, ask the Queen instead of guessing.
- Claim a port before starting any dev server and release it when done.

## Helpers

Load them with `. \"$HIVE_COMMANDS_PATH\"`, then:

| Command | Purpose |
|---|---|
| `hive_my_tasks` | list tasks assigned to you |
| `hive_task_start <id>` | mark a task in progress |
| `hive_task_complete <id> <summary>` | report success |
| `hive_task_fail <id> <reason>` | report failure |
| `hive_solicit <kind> <urgency> <question>` | ask the Queen and wait for the answer |
| `hive_port_acquire <port> <service>` | claim a port, waiting if it is busy |
| `hive_port_release <port>` | give a port back |
";

/// Write the helper script, the briefing and, when sandboxed, the policy.
pub async fn prepare(
    worktree: &Path,
    briefing: &Briefing<'_>,
    sandbox: bool,
) -> std::io::Result<WorkspaceFiles> {
    let hive_dir = worktree.join(HIVE_DIR);
    tokio::fs::create_dir_all(&hive_dir).await?;
    // Keep hive bookkeeping out of the agent's commits.
    tokio::fs::write(hive_dir.join(".gitignore"), "*\n").await?;

    let commands = hive_dir.join(COMMANDS_FILE);
    tokio::fs::write(&commands, COMMANDS_SCRIPT).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&commands, std::fs::Permissions::from_mode(0o755)).await?;
    }

    let briefing_path = worktree.join(BRIEFING_FILE);
    tokio::fs::write(&briefing_path, render_briefing(briefing)).await?;

    let sandbox_policy = if sandbox {
        let path = hive_dir.join(SANDBOX_POLICY_FILE);
        let policy = sandbox_policy(worktree, briefing.repo);
        let body = serde_json::to_vec_pretty(&policy).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, body).await?;
        Some(path)
    } else {
        None
    };

    debug!(
        agent = briefing.agent_name,
        worktree = %worktree.display(),
        sandbox,
        "Prepared agent workspace"
    );

    Ok(WorkspaceFiles {
        commands,
        briefing: briefing_path,
        sandbox_policy,
        log: hive_dir.join(LOG_FILE),
    })
}

pub fn render_briefing(b: &Briefing<'_>) -> String {
    BRIEFING_TEMPLATE
        .replace("{{NAME}}", b.agent_name)
        .replace("{{ID}}", b.agent_id)
        .replace("{{SPECIALTY}}", b.specialty.unwrap_or("general"))
        .replace("{{BRANCH}}", b.branch)
        .replace("{{BASE}}", b.base_branch)
        .replace("{{REPO}}", &b.repo.display().to_string())
        .replace("{{HUB}}", b.hub_url)
}

/// Filesystem and network policy for the sandbox wrapper.
///
/// Writes are limited to the worktree, the shared git metadata it commits
/// into, and scratch space. Credentials stay unreadable.
pub fn sandbox_policy(worktree: &Path, repo: &Path) -> serde_json::Value {
    let home = dirs::home_dir().unwrap_or_default();
    json!({
        "filesystem": {
            "allowWrite": [
                worktree.display().to_string(),
                repo.join(".git").display().to_string(),
                home.join(".claude").display().to_string(),
                "/tmp",
            ],
            "denyRead": [
                home.join(".ssh").display().to_string(),
                home.join(".aws").display().to_string(),
                home.join(".gnupg").display().to_string(),
            ],
            "denyWrite": [],
        },
        "network": {
            "allowedDomains": [
                "localhost",
                "127.0.0.1",
                "api.anthropic.com",
                "github.com",
                "registry.npmjs.org",
                "crates.io",
                "index.crates.io",
                "static.crates.io",
                "pypi.org",
                "files.pythonhosted.org",
            ],
            "deniedDomains": [],
        },
    })
}
