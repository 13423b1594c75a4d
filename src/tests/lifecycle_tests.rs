use super::test_helpers::*;
use crate::agent::{AgentRunner, Planner};
use crate::executor::{ExecutorService, ProcessMap, TaskSignal};
use crate::models::{LogLevel, TaskStatus};
use crate::notifier::Notifier;
use crate::store::TaskStore;
use crate::toolconfig::{ToolRegistry, ToolServer};
use crate::{Nightshift, NightshiftError, SubmitOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};

fn runner_fixture(stub_body: &str) -> (TempDir, TempDir, crate::config::Config, TaskStore, AgentRunner) {
    let data_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let stub = write_stub_agent(data_dir.path(), "stub-agent.sh", stub_body);
    let config = stub_config(data_dir.path(), &stub);
    let store = TaskStore::open(&config.database_path()).unwrap();
    let runner = AgentRunner::new(
        config.clone(),
        store.clone(),
        ToolRegistry::default(),
        ProcessMap::new(),
    )
    .unwrap()
    .with_working_dir(work_dir.path());
    (data_dir, work_dir, config, store, runner)
}

#[tokio::test]
async fn happy_path_completes_with_artifacts() {
    let (_data, work_dir, config, store, runner) = runner_fixture(HAPPY_AGENT);
    seed_committed(&store, "write a haiku about dusk", 900);
    let task = store.acquire_for_execution().unwrap().unwrap();

    let outcome = runner.execute(&task).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.token_usage, Some(465));
    assert!(outcome.execution_time > 0.0);
    assert!(outcome
        .response_text
        .as_deref()
        .unwrap()
        .starts_with("Twilight falls softly"));

    let done = store.get(&task.task_id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.token_usage, Some(465));
    assert!(done.execution_time.is_some());
    assert!(done.process_id.is_none());
    assert!(done.completed_at.unwrap() >= done.started_at.unwrap());

    // Raw-output artifact with the required top-level keys.
    let artifact_path = config.output_artifact_path(&task.task_id);
    assert_eq!(done.result_path.as_deref(), Some(artifact_path.to_str().unwrap()));
    let artifact: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&artifact_path).unwrap()).unwrap();
    assert!(artifact.get("stdout").is_some());
    assert_eq!(artifact["return_code"], 0);
    assert_eq!(artifact["token_usage"], 465);

    // File-change artifact lists the created haiku.
    let files: Vec<serde_json::Value> = serde_json::from_str(
        &std::fs::read_to_string(config.files_artifact_path(&task.task_id)).unwrap(),
    )
    .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "haiku.md");
    assert_eq!(files[0]["kind"], "created");
    assert!(work_dir.path().join("haiku.md").exists());
}

#[tokio::test]
async fn timeout_kills_and_fails_with_partial_output() {
    let (_data, _work, config, store, runner) = runner_fixture(SLEEPY_AGENT);
    seed_committed(&store, "sleepy task", 1);
    let task = store.acquire_for_execution().unwrap().unwrap();

    let started = std::time::Instant::now();
    let outcome = runner.execute(&task).await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert!(!outcome.success);
    assert!(outcome.error_message.as_deref().unwrap().contains("timeout"));

    let failed = store.get(&task.task_id).unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error_message.unwrap().contains("timeout"));

    // Partial stdout preserved in the artifact.
    let artifact: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(config.output_artifact_path(&task.task_id)).unwrap(),
    )
    .unwrap();
    assert!(artifact["stdout"].as_str().unwrap().contains("starting"));
}

#[tokio::test]
async fn nonzero_exit_fails_with_stderr_tail() {
    let (_data, _work, _config, store, runner) = runner_fixture(FAILING_AGENT);
    seed_committed(&store, "doomed task", 900);
    let task = store.acquire_for_execution().unwrap().unwrap();

    let outcome = runner.execute(&task).await.unwrap();
    assert!(!outcome.success);
    let error = outcome.error_message.unwrap();
    assert!(error.contains("code 3"));
    assert!(error.contains("simulated agent crash"));
    assert_eq!(
        store.get(&task.task_id).unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn pause_resume_kill_sequence() {
    let data_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let stub = write_stub_agent(data_dir.path(), "stub-agent.sh", LONG_AGENT);
    let config = stub_config(data_dir.path(), &stub);
    let store = TaskStore::open(&config.database_path()).unwrap();
    let process_map = ProcessMap::new();
    let runner = AgentRunner::new(
        config.clone(),
        store.clone(),
        ToolRegistry::default(),
        process_map.clone(),
    )
    .unwrap()
    .with_working_dir(work_dir.path());

    seed_committed(&store, "long running task", 900);
    let task = store.acquire_for_execution().unwrap().unwrap();
    let task_id = task.task_id.clone();

    let handle = tokio::spawn(async move { runner.execute(&task).await });

    {
        let map = process_map.clone();
        let id = task_id.clone();
        wait_for("process registration", 5_000, move || map.contains(&id)).await;
    }

    process_map.signal(&task_id, TaskSignal::Pause).unwrap();
    {
        let store = store.clone();
        let id = task_id.clone();
        wait_for("paused status", 500, move || {
            store.get(&id).unwrap().unwrap().status == TaskStatus::Paused
        })
        .await;
    }
    assert!(store.get(&task_id).unwrap().unwrap().process_id.is_some());

    process_map.signal(&task_id, TaskSignal::Resume).unwrap();
    {
        let store = store.clone();
        let id = task_id.clone();
        wait_for("running status", 500, move || {
            store.get(&id).unwrap().unwrap().status == TaskStatus::Running
        })
        .await;
    }

    process_map.signal(&task_id, TaskSignal::Kill).unwrap();
    let outcome = timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!outcome.success);

    let cancelled = store.get(&task_id).unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.error_message.is_some());
    assert!(cancelled.process_id.is_none());
    assert!(!process_map.contains(&task_id));
}

#[tokio::test]
async fn executor_bounds_concurrency_and_drains_queue() {
    let data_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let stub = write_stub_agent(data_dir.path(), "stub-agent.sh", BRIEF_AGENT);
    let config = stub_config(data_dir.path(), &stub);
    let store = TaskStore::open(&config.database_path()).unwrap();

    for i in 0..5 {
        seed_committed(&store, &format!("queued {i}"), 900);
    }

    let executor = ExecutorService::new(
        config.clone(),
        store.clone(),
        ToolRegistry::default(),
        ProcessMap::new(),
        Notifier::new(config.clone()).with_terminal(false),
    )
    .with_runner_working_dir(work_dir.path());
    executor.start(3, Duration::from_millis(50)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let running = store.count_by_status(TaskStatus::Running).unwrap();
        assert!(running <= 3, "observed {running} running tasks");
        if store.count_by_status(TaskStatus::Completed).unwrap() == 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    executor.stop(Duration::from_secs(10)).await.unwrap();
    assert_eq!(store.count_by_status(TaskStatus::Completed).unwrap(), 5);
    assert_eq!(store.count_by_status(TaskStatus::Committed).unwrap(), 0);
    let status = executor.status().await;
    assert!(!status.running);
    assert!(status.active_tasks.is_empty());
}

#[tokio::test]
async fn second_executor_refused_by_lock() {
    let data_dir = TempDir::new().unwrap();
    let stub = write_stub_agent(data_dir.path(), "stub-agent.sh", BRIEF_AGENT);
    let config = stub_config(data_dir.path(), &stub);
    let store = TaskStore::open(&config.database_path()).unwrap();

    let make_executor = || {
        ExecutorService::new(
            config.clone(),
            store.clone(),
            ToolRegistry::default(),
            ProcessMap::new(),
            Notifier::new(config.clone()).with_terminal(false),
        )
    };
    let first = make_executor();
    first.start(1, Duration::from_millis(50)).await.unwrap();

    let second = make_executor();
    let result = second.start(1, Duration::from_millis(50)).await;
    assert!(matches!(result, Err(NightshiftError::Executor { .. })));

    first.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn pause_on_staged_task_is_not_running() {
    let data_dir = TempDir::new().unwrap();
    let config = stub_config(data_dir.path(), std::path::Path::new("/bin/false"));
    let nightshift = Nightshift::new(config).unwrap();

    let task_id = nightshift
        .submit("not yet running", SubmitOptions::default())
        .unwrap();
    let result = nightshift.pause(&task_id);
    assert!(matches!(result, Err(NightshiftError::NotRunning(_))));
    assert_eq!(
        nightshift.get(&task_id).unwrap().task.status,
        TaskStatus::Staged
    );
}

#[tokio::test]
async fn cancel_works_on_staged_and_committed() {
    let data_dir = TempDir::new().unwrap();
    let config = stub_config(data_dir.path(), std::path::Path::new("/bin/false"));
    let nightshift = Nightshift::new(config).unwrap();

    let staged = nightshift
        .submit("cancelled before planning", SubmitOptions::default())
        .unwrap();
    nightshift.cancel(&staged).unwrap();
    assert_eq!(
        nightshift.get(&staged).unwrap().task.status,
        TaskStatus::Cancelled
    );

    // Approved but not yet claimed by a worker.
    let committed = nightshift
        .submit("cancelled after approval", SubmitOptions::default())
        .unwrap();
    nightshift.approve(&committed).unwrap();
    assert_eq!(
        nightshift.get(&committed).unwrap().task.status,
        TaskStatus::Committed
    );
    nightshift.cancel(&committed).unwrap();
    let details = nightshift.get(&committed).unwrap();
    assert_eq!(details.task.status, TaskStatus::Cancelled);
    assert!(details.task.error_message.is_some());
    assert!(details.task.completed_at.is_some());
    assert!(details.task.started_at.is_none());
}

#[tokio::test]
async fn dangerous_directory_blocks_approval() {
    let data_dir = TempDir::new().unwrap();
    let config = stub_config(data_dir.path(), std::path::Path::new("/bin/false"));
    let nightshift = Nightshift::new(config).unwrap();

    let task_id = nightshift
        .submit("escape attempt", SubmitOptions::default())
        .unwrap();
    let mut task = nightshift.get(&task_id).unwrap().task;
    task.allowed_directories = vec!["/System/Library/Frameworks".to_string()];
    nightshift.store().update_plan(&task_id, &task).unwrap();

    let result = nightshift.approve(&task_id);
    assert!(matches!(result, Err(NightshiftError::DangerousPath(_))));

    let details = nightshift.get(&task_id).unwrap();
    assert_eq!(details.task.status, TaskStatus::Staged);
    assert!(details
        .logs
        .iter()
        .any(|entry| entry.level == LogLevel::Error));
}

#[tokio::test]
async fn plan_revision_replaces_tools() {
    let data_dir = TempDir::new().unwrap();

    let initial_plan = r#"{"structured_output":{"enhanced_prompt":"analyze quantum-computing trends","allowed_tools":["WebSearch","Write"],"allowed_directories":[],"needs_git":false,"system_prompt":"","estimated_tokens":1000,"estimated_time":60}}"#;
    let revised_plan = r#"{"structured_output":{"enhanced_prompt":"analyze quantum-computing trends via arxiv","allowed_tools":["ext__arxiv__search","Write"],"allowed_directories":[],"needs_git":false,"system_prompt":"","estimated_tokens":1200,"estimated_time":90}}"#;
    let first_stub = write_stub_agent(
        data_dir.path(),
        "planner-one.sh",
        &format!("printf '%s' '{initial_plan}'"),
    );
    let second_stub = write_stub_agent(
        data_dir.path(),
        "planner-two.sh",
        &format!("printf '%s' '{revised_plan}'"),
    );

    let registry = ToolRegistry::from_servers(BTreeMap::from([(
        "arxiv".to_string(),
        ToolServer {
            command: "arxiv-server".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
    )]));

    let config = stub_config(data_dir.path(), &first_stub);
    let store = TaskStore::open(&config.database_path()).unwrap();
    let mut task = crate::models::Task::new("analyze quantum-computing trends");
    store.create(&task).unwrap();

    let planner = Planner::new(config.agent.clone(), registry.clone());
    let plan = planner.plan(&task.description).await.unwrap();
    assert_eq!(plan.allowed_tools, vec!["WebSearch", "Write"]);
    task.apply_plan(&plan);
    store.update_plan(&task.task_id, &task).unwrap();

    let mut revised_config = config.clone();
    revised_config.agent.binary_path = Some(second_stub.display().to_string());
    let revising_planner = Planner::new(revised_config.agent, registry);
    let revised = revising_planner
        .revise(&task, "use ArXiv, not web search")
        .await
        .unwrap();
    task.apply_plan(&revised);
    store.update_plan(&task.task_id, &task).unwrap();

    let stored = store.get(&task.task_id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Staged);
    assert_eq!(
        stored.allowed_tools,
        vec!["ext__arxiv__search".to_string(), "Write".to_string()]
    );
    assert!(!stored.allowed_tools.contains(&"WebSearch".to_string()));
}

#[tokio::test]
async fn completed_run_persists_notification_summary() {
    let data_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let stub = write_stub_agent(data_dir.path(), "stub-agent.sh", HAPPY_AGENT);
    let config = stub_config(data_dir.path(), &stub);
    let store = TaskStore::open(&config.database_path()).unwrap();

    seed_committed(&store, "write a haiku about dusk", 900);

    let executor = Arc::new(
        ExecutorService::new(
            config.clone(),
            store.clone(),
            ToolRegistry::default(),
            ProcessMap::new(),
            Notifier::new(config.clone()).with_terminal(false),
        )
        .with_runner_working_dir(work_dir.path()),
    );
    executor.start(1, Duration::from_millis(50)).await.unwrap();

    {
        let store = store.clone();
        wait_for("task completion", 20_000, move || {
            store.count_by_status(TaskStatus::Completed).unwrap() == 1
        })
        .await;
    }
    let task = store.list(Some(TaskStatus::Completed)).unwrap().remove(0);

    let summary_path = config.notification_path(&task.task_id);
    {
        let path = summary_path.clone();
        wait_for("summary artifact", 5_000, move || {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<crate::models::Summary>(&raw).ok())
                .is_some()
        })
        .await;
    }
    let summary: crate::models::Summary =
        serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(summary.task_id, task.task_id);
    assert_eq!(summary.status, TaskStatus::Completed);
    assert_eq!(summary.file_changes.created, vec!["haiku.md".to_string()]);
    assert!(summary
        .response_text
        .as_deref()
        .unwrap()
        .contains("Twilight"));

    executor.stop(Duration::from_secs(5)).await.unwrap();
}
