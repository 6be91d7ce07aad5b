use std::path::Path;

use super::*;
use crate::events::EventKind;
use crate::port::{AcquireRequest, AcquireStatus};
use crate::solicitation::SolicitationStatus;
use crate::testing::{MockBehavior, MockLauncher, scratch_config};

// Each test owns a distinct control-port range so parallel runs never race
// for the same port.

fn hub_with(root: &Path, base_port: u16, launcher: MockLauncher) -> Hub {
    let config = scratch_config(root, base_port).unwrap();
    Hub::with_launcher(config, Arc::new(launcher)).unwrap()
}

fn branch_exists(repo: &Path, branch: &str) -> bool {
    let out = std::process::Command::new("git")
        .args(["branch", "--list", branch])
        .current_dir(repo)
        .output()
        .unwrap();
    !String::from_utf8_lossy(&out.stdout).trim().is_empty()
}

fn worktree_entries(root: &Path) -> usize {
    std::fs::read_dir(root.join("worktrees")).map_or(0, Iterator::count)
}

#[tokio::test]
async fn spawn_message_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_100, MockLauncher::new());
    let repo = dir.path().join("repo");

    let agent = hub
        .spawn_agent(SpawnOptions::named("drone-1").with_base_branch("main"))
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Ready);
    let root = std::fs::canonicalize(dir.path().join("worktrees")).unwrap();
    assert!(agent.worktree_path.starts_with(&root));
    assert!(agent.worktree_path.is_dir());
    assert!((41_100..41_120).contains(&agent.port));
    assert!(branch_exists(&repo, "hive/drone-1"));

    hub.message_agent("drone-1", "hello").await.unwrap();
    let messages = hub.conversation(&agent.id).await.unwrap();
    assert!(
        messages
            .iter()
            .any(|m| m.role == "user" && m.content == "hello")
    );

    hub.destroy_agent("drone-1").await.unwrap();
    assert!(!agent.worktree_path.exists());
    assert!(!branch_exists(&repo, "hive/drone-1"));
    assert!(hub.ports().leases_for_agent(&agent.id).await.is_empty());
    assert!(hub.list_agents().await.is_empty());
}

#[tokio::test]
async fn duplicate_name_is_rejected_until_destroyed() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_130, MockLauncher::new());

    hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();
    let err = hub
        .spawn_agent(SpawnOptions::named("drone-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(hub.list_agents().await.len(), 1);

    hub.destroy_agent("drone-1").await.unwrap();
    hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();
}

#[tokio::test]
async fn concurrent_spawns_get_distinct_ports() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Arc::new(hub_with(dir.path(), 41_160, MockLauncher::new()));

    let mut handles = Vec::new();
    for i in 0..4 {
        let hub = Arc::clone(&hub);
        handles.push(tokio::spawn(async move {
            hub.spawn_agent(SpawnOptions::named(format!("drone-{i}")))
                .await
                .map(|a| a.port)
        }));
    }
    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap().unwrap());
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 4);
}

#[tokio::test]
async fn missing_binary_fails_before_touching_git() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(
        dir.path(),
        41_190,
        MockLauncher::with_behavior(MockBehavior::MissingBinary),
    );

    let err = hub
        .spawn_agent(SpawnOptions::named("drone-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("not found"));
    assert_eq!(worktree_entries(dir.path()), 0);
    assert!(hub.list_agents().await.is_empty());
}

#[tokio::test]
async fn failed_launch_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::with_behavior(MockBehavior::FailLaunch);
    let hub = hub_with(dir.path(), 41_220, launcher.clone());

    let err = hub
        .spawn_agent(SpawnOptions::named("drone-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(launcher.launches().len(), 1);
    assert_eq!(worktree_entries(dir.path()), 0);
    assert!(!branch_exists(&dir.path().join("repo"), "hive/drone-1"));
    assert_eq!(hub.ports().leased_count().await, 0);
    assert!(hub.list_agents().await.is_empty());
}

#[tokio::test]
async fn agent_that_never_answers_times_out_and_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = scratch_config(dir.path(), 41_250).unwrap();
    config.spawner.spawn_timeout_secs = 1;
    let hub = Hub::with_launcher(
        config,
        Arc::new(MockLauncher::with_behavior(MockBehavior::NeverReady)),
    )
    .unwrap();

    let err = hub
        .spawn_agent(SpawnOptions::named("drone-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(worktree_entries(dir.path()), 0);
    assert_eq!(hub.ports().leased_count().await, 0);
}

#[tokio::test]
async fn spawn_plan_carries_identity_env() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = MockLauncher::new();
    let hub = hub_with(dir.path(), 41_280, launcher.clone());

    let agent = hub
        .spawn_agent(SpawnOptions {
            specialty: Some("frontend".into()),
            ..SpawnOptions::named("drone-env")
        })
        .await
        .unwrap();

    let plan = launcher.launches().pop().unwrap();
    let env = |key: &str| {
        plan.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(env("HIVE_AGENT_ID").as_deref(), Some(agent.id.as_str()));
    assert_eq!(env("HIVE_AGENT_NAME").as_deref(), Some("drone-env"));
    assert_eq!(env("HIVE_SPECIALTY").as_deref(), Some("frontend"));
    assert!(env("HIVE_HUB_URL").unwrap().starts_with("http://127.0.0.1:"));
    assert_eq!(plan.cwd, agent.worktree_path);
    assert!(plan.args.last().unwrap().contains(&format!("--port {}", agent.port)));
    assert!(agent.worktree_path.join("CLAUDE.local.md").is_file());
}

#[tokio::test]
async fn stop_is_idempotent_and_blocks_messages() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_310, MockLauncher::new());
    hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();

    let stopped = hub.stop_agent("drone-1").await.unwrap();
    assert_eq!(stopped.status, AgentStatus::Stopped);
    assert_eq!(
        hub.stop_agent("drone-1").await.unwrap().status,
        AgentStatus::Stopped
    );

    let err = hub.message_agent("drone-1", "hi").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(hub.status().await.agents_running, 0);
}

#[tokio::test]
async fn task_lifecycle_through_the_hub() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_340, MockLauncher::new());
    let agent = hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();

    let task = hub
        .create_task(CreateTaskRequest {
            title: "Add login page".into(),
            agent_id: Some("drone-1".into()),
            ..CreateTaskRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(task.agent_id.as_deref(), Some(agent.id.as_str()));
    assert_eq!(task.agent_name.as_deref(), Some("drone-1"));

    let err = hub
        .update_task(&task.id, TaskUpdate::new(TaskAction::Complete))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let started = hub
        .update_task(&task.id, TaskUpdate::new(TaskAction::Start))
        .await
        .unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);

    let done = hub
        .update_task(
            &task.id,
            TaskUpdate {
                result: Some("merged".into()),
                ..TaskUpdate::new(TaskAction::Complete)
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("merged"));

    let unknown = hub
        .create_task(CreateTaskRequest {
            title: "x".into(),
            agent_id: Some("ghost".into()),
            ..CreateTaskRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn destroy_closes_open_work() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_370, MockLauncher::new());
    let agent = hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();

    let task = hub
        .create_task(CreateTaskRequest {
            title: "Refactor".into(),
            agent_id: Some(agent.id.clone()),
            ..CreateTaskRequest::default()
        })
        .await
        .unwrap();
    let sol = hub
        .solicit(
            CreateSolicitationRequest {
                agent_id: "drone-1".into(),
                question: "Which DB?".into(),
                ..CreateSolicitationRequest::default()
            },
            false,
            None,
        )
        .await
        .unwrap();
    assert_eq!(sol.agent_id, agent.id);
    assert_eq!(sol.agent_name, "drone-1");

    hub.destroy_agent(&agent.id).await.unwrap();
    assert_eq!(
        hub.tasks().get(&task.id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(
        hub.solicitations().get(&sol.id).await.unwrap().status,
        SolicitationStatus::Dismissed
    );
}

#[tokio::test]
async fn waiting_solicitation_is_released_by_respond() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Arc::new(hub_with(dir.path(), 41_400, MockLauncher::new()));
    let mut events = hub.events().subscribe();

    let waiter = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.solicit(
                CreateSolicitationRequest {
                    agent_id: "queenless".into(),
                    agent_name: "drone-9".into(),
                    question: "Proceed?".into(),
                    ..CreateSolicitationRequest::default()
                },
                true,
                Some(Duration::from_secs(10)),
            )
            .await
        })
    };

    let created = loop {
        let event = events.recv().await.unwrap();
        if event.kind == EventKind::SolicitationCreated {
            break event;
        }
    };
    let id = created.payload["id"].as_str().unwrap().to_string();
    hub.solicitations().respond(&id, "yes").await.unwrap();

    let answered = waiter.await.unwrap().unwrap();
    assert_eq!(answered.status, SolicitationStatus::Answered);
    assert_eq!(answered.answer.as_deref(), Some("yes"));
}

#[tokio::test]
async fn status_counts() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_430, MockLauncher::new());
    hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();
    hub.create_task(CreateTaskRequest {
        title: "t".into(),
        ..CreateTaskRequest::default()
    })
    .await
    .unwrap();

    let status = hub.status().await;
    assert_eq!(
        status,
        StatusInfo {
            agents_total: 1,
            agents_running: 1,
            tasks_total: 1,
            tasks_in_progress: 0,
            solicitations_pending: 0,
            ports_leased: 1,
        }
    );
}

#[tokio::test]
async fn agent_cache_follows_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_460, MockLauncher::new());
    let cache = AgentCache::new(dir.path().join("agents.json"));

    hub.spawn_agent(SpawnOptions::named("drone-1")).await.unwrap();
    let cached = cache.load().unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].name, "drone-1");

    hub.destroy_agent("drone-1").await.unwrap();
    assert!(cache.load().unwrap().is_empty());
}

#[tokio::test]
async fn stop_saves_state_and_a_new_hub_recovers_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = scratch_config(dir.path(), 41_490).unwrap();
    let first = Hub::with_launcher(config.clone(), Arc::new(MockLauncher::new())).unwrap();

    let agent = first
        .spawn_agent(SpawnOptions::named("drone-1"))
        .await
        .unwrap();
    let task = first
        .create_task(CreateTaskRequest {
            title: "Survive restart".into(),
            ..CreateTaskRequest::default()
        })
        .await
        .unwrap();
    first.stop().await.unwrap();
    assert!(first.is_stopping());
    // A second stop is a no-op.
    first.stop().await.unwrap();

    // The fake agent is still listening, so it counts as alive.
    let second = Hub::with_launcher(config, Arc::new(MockLauncher::new())).unwrap();
    let report = second.reconcile().await.unwrap();
    assert_eq!(report.agents_recovered, 1);
    assert_eq!(report.agents_dropped, 0);
    assert_eq!(report.tasks_restored, 1);

    let recovered = second.get_agent("drone-1").await.unwrap();
    assert_eq!(recovered.id, agent.id);
    assert_eq!(
        second.ports().status(agent.port).await.lease.unwrap().agent_id,
        agent.id
    );
    assert_eq!(second.tasks().get(&task.id).await.unwrap().title, "Survive restart");
}

#[tokio::test]
async fn reconcile_drops_agents_that_do_not_answer() {
    let dir = tempfile::tempdir().unwrap();
    let config = scratch_config(dir.path(), 41_520).unwrap();
    let ghost = Agent {
        id: "deadbeef".into(),
        name: "ghost".into(),
        branch: "hive/ghost".into(),
        base_branch: "main".into(),
        worktree_path: dir.path().join("worktrees/ghost"),
        port: 41_539,
        pid: None,
        status: AgentStatus::Ready,
        specialty: None,
        model: None,
        sandbox: false,
        created_at: 0,
        error: None,
    };
    PersistentState::new(vec![ghost], vec![], vec![], vec![])
        .save(config.hub.state_path.as_deref().unwrap())
        .await
        .unwrap();

    let hub = Hub::with_launcher(config, Arc::new(MockLauncher::new())).unwrap();
    let report = hub.reconcile().await.unwrap();
    assert_eq!(report.agents_dropped, 1);
    assert!(hub.list_agents().await.is_empty());
    assert_eq!(hub.ports().leased_count().await, 0);
}

#[tokio::test]
async fn control_port_survives_force_release() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_with(dir.path(), 41_580, MockLauncher::new());
    let agent = hub
        .spawn_agent(SpawnOptions::named("drone-a"))
        .await
        .unwrap();

    let err = hub.ports().force_release(agent.port).await.unwrap_err();
    assert!(matches!(err, PortError::ControlPort { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(
        hub.ports().status(agent.port).await.lease.unwrap().agent_id,
        agent.id
    );

    let other = hub
        .ports()
        .acquire(AcquireRequest {
            port: agent.port,
            agent_id: "other".into(),
            agent_name: "other".into(),
            service: "web".into(),
            wait: false,
            timeout_secs: 0,
        })
        .await
        .unwrap();
    assert_eq!(other.status, AcquireStatus::Busy);
    assert_eq!(other.held_by.unwrap().agent_id, agent.id);

    hub.destroy_agent("drone-a").await.unwrap();
    assert!(hub.ports().status(agent.port).await.lease.is_none());
}

#[tokio::test]
async fn reconcile_removes_worktrees_of_dropped_agents() {
    let dir = tempfile::tempdir().unwrap();
    let config = scratch_config(dir.path(), 41_610).unwrap();
    let repo = dir.path().join("repo");
    let wt = WorktreeManager::new(&config.worktree)
        .create(&repo, "ghost", None, Some("main"))
        .await
        .unwrap();
    assert_eq!(worktree_entries(dir.path()), 1);

    let ghost = Agent {
        id: "deadbeef".into(),
        name: "ghost".into(),
        branch: wt.branch.clone(),
        base_branch: "main".into(),
        worktree_path: wt.path.clone(),
        port: 41_629,
        pid: None,
        status: AgentStatus::Ready,
        specialty: None,
        model: None,
        sandbox: false,
        created_at: 0,
        error: None,
    };
    PersistentState::new(vec![ghost], vec![], vec![], vec![])
        .save(config.hub.state_path.as_deref().unwrap())
        .await
        .unwrap();

    let hub = Hub::with_launcher(config, Arc::new(MockLauncher::new())).unwrap();
    let report = hub.reconcile().await.unwrap();
    assert_eq!(report.agents_dropped, 1);
    assert!(!wt.path.exists());
    assert_eq!(worktree_entries(dir.path()), 0);
    assert!(hub.agents().spawner().worktrees().list(&repo).await.unwrap().is_empty());
    assert!(!branch_exists(&repo, "hive/ghost"));
}

#[tokio::test]
async fn serve_stops_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let hub = Arc::new(hub_with(dir.path(), 41_550, MockLauncher::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(Arc::clone(&hub).serve(listener));

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let mut healthy = false;
    for _ in 0..50 {
        if client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
        {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(healthy);
    assert_eq!(hub.agents().spawner().hub_url().await, format!("http://{addr}"));

    hub.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[test]
fn hub_url_rewrites_unspecified_host() {
    assert_eq!(
        hub_url("0.0.0.0:8080".parse().unwrap()),
        "http://127.0.0.1:8080"
    );
    assert_eq!(
        hub_url("127.0.0.1:9000".parse().unwrap()),
        "http://127.0.0.1:9000"
    );
}
