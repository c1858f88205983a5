//! End-to-end workflow tests: real `sh` builds, real file staging, real ledger

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use engine::{BuildEngine, EngineConfig, LedgerReader, OutputStream};
use shared_types::{ProjectSpec, RunStatus, RunSummary};
use tokio::sync::mpsc;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    output: PathBuf,
    logs: PathBuf,
    config: EngineConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let root = dir.path().join("src");
        let output = dir.path().join("www");
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&root).unwrap();

        let mut config = EngineConfig::new(&root, &output);
        config.logs_dir = logs.clone();
        config.database_path = dir.path().join("data/builds.db");

        Self {
            _dir: dir,
            root,
            output,
            logs,
            config,
        }
    }

    fn add_project(&mut self, name: &str, group: Option<&str>, build_cmd: &str) {
        std::fs::create_dir_all(self.root.join("apps").join(name)).unwrap();
        self.config.projects.push(ProjectSpec {
            name: name.to_string(),
            path: format!("/apps/{name}"),
            group: group.map(ToString::to_string),
            node_modules_dir: None,
            build_cmd: build_cmd.to_string(),
            dist_dir: None,
            publish: true,
            node_version: None,
        });
    }

    async fn engine(&self) -> BuildEngine {
        BuildEngine::open(self.config.clone()).await
    }
}

const BUILD_OK: &str = r#"sh -c "mkdir -p dist && echo '<html>A</html>' > dist/index.html && echo done""#;
const BUILD_FAIL: &str = r#"sh -c "echo 'syntax error' >&2; exit 1""#;

/// Poll the ledger until the newest run has left the `running` state.
async fn wait_for_finished_run(reader: &LedgerReader) -> RunSummary {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let newest = reader.list_recent(1).await.unwrap().into_iter().next();
        if let Some(run) = newest.filter(|r| r.status != RunStatus::Running) {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn error_logs(logs: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(logs.join("errors")) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn test_one_success_one_failure() {
    let mut fx = Fixture::new();
    fx.add_project("A", Some("emergency"), BUILD_OK);
    fx.add_project("B", Some("triage"), BUILD_FAIL);
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(!result.success);
    assert!(result.error.is_none());
    assert_eq!(result.build_results.len(), 2);
    assert_eq!(result.build_results[0].project, "A");
    assert_eq!(result.build_results[0].exit_code, 0);
    assert_eq!(result.build_results[1].exit_code, 1);
    assert!(result.full_log.contains("--- Project: A ---"));
    assert!(result.full_log.contains("[STDERR]: syntax error"));

    let staged = fx.output.join("emergency/A/index.html");
    assert_eq!(
        std::fs::read_to_string(staged).unwrap().trim(),
        "<html>A</html>"
    );
    assert!(!fx.output.join("triage/B").exists());

    let reader = engine.ledger().expect("ledger available");
    let run_id = result.run_id.expect("run tracked");
    let run = reader.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.total_projects, 2);
    assert_eq!(run.successful_projects, 1);
    assert_eq!(run.failed_projects, 1);

    let records = reader.list_project_records(run_id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].success);
    assert!(records[0].error_message.is_none());
    assert_eq!(records[1].exit_code, 1);
    assert!(records[1]
        .error_message
        .as_deref()
        .unwrap()
        .contains("syntax error"));

    let error_log = run.error_log_file_path.expect("error log recorded");
    let text = std::fs::read_to_string(&error_log).unwrap();
    assert!(text.contains("Build failed for B with exit code 1"));
    assert_eq!(error_logs(&fx.logs).len(), 1);

    let summary = run.log_file_path.expect("summary recorded");
    let run_dir = Path::new(&summary).parent().unwrap();
    assert!(run_dir.join("A.log").is_file());
    let b_log = std::fs::read_to_string(run_dir.join("B.log")).unwrap();
    assert!(b_log.contains("[ERR] syntax error"));
}

#[tokio::test]
async fn test_clean_run_removes_error_log() {
    let mut fx = Fixture::new();
    fx.add_project("A", None, BUILD_OK);
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(result.success, "{:?}", result.logs);
    assert!(fx.output.join("A/index.html").is_file());
    assert!(error_logs(&fx.logs).is_empty());

    let run = engine
        .ledger()
        .unwrap()
        .get_run(result.run_id.unwrap())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.success);
    assert!(run.error_log_file_path.is_none());
    assert_eq!(run.successful_projects, 1);
}

#[tokio::test]
async fn test_rerun_creates_new_record_and_keeps_old_one() {
    let mut fx = Fixture::new();
    fx.add_project("A", None, BUILD_OK);
    let engine = fx.engine().await;

    let first = engine.run_workflow().await;
    let reader = engine.ledger().unwrap();
    let before = reader.get_run(first.run_id.unwrap()).await.unwrap();

    let second = engine.run_workflow().await;
    assert_ne!(first.run_id, second.run_id);

    let after = reader.get_run(first.run_id.unwrap()).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(reader.list_recent(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_dist_does_not_stop_other_projects() {
    let mut fx = Fixture::new();
    fx.add_project("nodist", Some("g"), r#"sh -c "echo nothing to emit""#);
    fx.add_project("A", Some("g"), BUILD_OK);
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(result.success);
    assert!(fx.output.join("g/A/index.html").is_file());
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("Dist directory not found")));
}

#[tokio::test]
async fn test_failed_build_still_salvages_previous_artifacts() {
    let mut fx = Fixture::new();
    fx.add_project("B", None, BUILD_FAIL);
    let dist = fx.root.join("apps/B/dist");
    std::fs::create_dir_all(&dist).unwrap();
    std::fs::write(dist.join("index.html"), "previous build").unwrap();
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(!result.success);
    assert_eq!(
        std::fs::read_to_string(fx.output.join("B/index.html")).unwrap(),
        "previous build"
    );
}

#[tokio::test]
async fn test_unlaunchable_and_unparsable_commands_are_isolated() {
    let mut fx = Fixture::new();
    fx.add_project("ghost", None, "no-such-build-tool run build");
    fx.add_project("quote", None, "npm run \"build");
    fx.add_project("A", None, BUILD_OK);
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(!result.success);
    assert_eq!(result.build_results[0].exit_code, -1);
    assert_eq!(result.build_results[1].exit_code, -1);
    assert_eq!(result.build_results[2].exit_code, 0);
    assert!(fx.output.join("A/index.html").is_file());

    let run = engine
        .ledger()
        .unwrap()
        .get_run(result.run_id.unwrap())
        .await
        .unwrap();
    assert_eq!(run.failed_projects, 2);
    assert_eq!(run.successful_projects + run.failed_projects, run.total_projects);
}

#[tokio::test]
async fn test_fatal_error_is_finalized_with_full_counts() {
    let mut fx = Fixture::new();
    fx.add_project("A", None, BUILD_OK);
    fx.add_project("B", None, BUILD_OK);
    // A regular file where the output directory should go.
    let blocker = fx.root.join("blocker");
    std::fs::write(&blocker, "not a dir").unwrap();
    fx.config.output_dir = blocker.join("www");
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(!result.success);
    let error = result.error.expect("fatal error reported");
    assert!(error.contains("output directory"), "{error}");
    assert!(result.full_log.contains("FATAL ERROR"));

    let reader = engine.ledger().unwrap();
    let run = reader.get_run(result.run_id.unwrap()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.successful_projects + run.failed_projects, run.total_projects);
    assert_eq!(
        reader
            .list_project_records(run.id)
            .await
            .unwrap()
            .len() as i64,
        run.total_projects
    );
    assert!(run.error_log_file_path.is_some());
}

#[tokio::test]
async fn test_non_publish_projects_are_ignored() {
    let mut fx = Fixture::new();
    fx.add_project("A", None, BUILD_OK);
    fx.add_project("skip", None, BUILD_FAIL);
    fx.config.projects[1].publish = false;
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(result.success);
    assert_eq!(result.build_results.len(), 1);
    let run = engine
        .ledger()
        .unwrap()
        .get_run(result.run_id.unwrap())
        .await
        .unwrap();
    assert_eq!(run.total_projects, 1);
}

#[tokio::test]
async fn test_bounded_and_unbounded_fan_out_build_everything() {
    for limit in [0, 1, 3] {
        let mut fx = Fixture::new();
        fx.config.max_parallel_builds = limit;
        for i in 0..5 {
            fx.add_project(&format!("p{i}"), Some("batch"), BUILD_OK);
        }
        let engine = fx.engine().await;

        let result = engine.run_workflow().await;

        assert!(result.success, "limit {limit}: {:?}", result.logs);
        for i in 0..5 {
            assert!(fx.output.join(format!("batch/p{i}/index.html")).is_file());
        }
    }
}

#[tokio::test]
async fn test_shared_node_modules_linked_before_build() {
    let mut fx = Fixture::new();
    std::fs::create_dir_all(fx.root.join("shared/node_modules/vite")).unwrap();
    fx.add_project(
        "A",
        None,
        r#"sh -c "test -d node_modules/vite && mkdir -p dist && echo ok > dist/index.html""#,
    );
    fx.config.projects[0].node_modules_dir = Some("shared/node_modules".to_string());
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(result.success, "{:?}", result.build_results);
    assert!(result.logs.iter().any(|l| l.contains("Symlink created")));
}

#[tokio::test]
async fn test_node_version_prepends_path() {
    let mut fx = Fixture::new();
    let node_root = fx.root.join("nvm");
    let bin = node_root.join("v18.19.0/bin");
    std::fs::create_dir_all(&bin).unwrap();
    fx.config.node_root = Some(node_root);
    fx.add_project("A", None, r#"sh -c "echo $PATH""#);
    fx.config.projects[0].node_version = Some("18.19.0".to_string());
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    let stdout = &result.build_results[0].stdout;
    assert!(
        stdout.starts_with(&bin.display().to_string()),
        "PATH was {stdout}"
    );
}

#[tokio::test]
async fn test_line_sink_sees_build_output() {
    let mut fx = Fixture::new();
    fx.add_project("A", None, BUILD_OK);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = fx.engine().await.with_line_sink(tx);

    let result = engine.run_workflow().await;
    drop(engine);

    assert!(result.success);
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    assert!(lines
        .iter()
        .any(|l| l.source == "A" && l.stream == OutputStream::Stdout && l.line == "done"));
}

#[tokio::test]
async fn test_runs_untracked_when_ledger_unavailable() {
    let mut fx = Fixture::new();
    fx.add_project("A", None, BUILD_OK);
    let engine = BuildEngine::with_ledger(fx.config.clone(), None);

    let result = engine.run_workflow().await;

    assert!(result.success);
    assert!(result.run_id.is_none());
    assert!(engine.ledger().is_none());
    assert!(fx.output.join("A/index.html").is_file());
}

#[tokio::test]
async fn test_run_completes_after_caller_stops_waiting() {
    let mut fx = Fixture::new();
    fx.add_project(
        "A",
        Some("g"),
        r#"sh -c "sleep 1 && mkdir -p dist && echo ok > dist/index.html""#,
    );
    let engine = fx.engine().await;
    let reader = engine.ledger().unwrap();

    let waited = tokio::time::timeout(Duration::from_millis(300), engine.run_workflow()).await;
    assert!(waited.is_err(), "build should still be running");
    // The abandoned run still holds the run lock.
    assert!(engine.try_run_workflow().await.is_none());

    let run = wait_for_finished_run(&reader).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_projects, 1);
    assert_eq!(run.successful_projects, 1);
    assert_eq!(reader.list_project_records(run.id).await.unwrap().len(), 1);
    assert!(fx.output.join("g/A/index.html").is_file());
    assert!(error_logs(&fx.logs).is_empty());

    let next = engine.run_workflow().await;
    assert!(next.success);
    assert_ne!(next.run_id, Some(run.id));
}

#[tokio::test]
async fn test_ledger_failure_mid_run_keeps_build_outcome() {
    let mut fx = Fixture::new();
    let data_dir = fx
        .config
        .database_path
        .parent()
        .unwrap()
        .to_path_buf();
    // The build removes the database directory, so every later ledger write fails.
    fx.add_project(
        "A",
        None,
        &format!(
            r#"sh -c "rm -rf '{}' && mkdir -p dist && echo ok > dist/index.html""#,
            data_dir.display()
        ),
    );
    let engine = fx.engine().await;

    let result = engine.run_workflow().await;

    assert!(result.success, "{:?}", result.logs);
    assert!(result.error.is_none());
    assert!(result.run_id.is_some());
    assert_eq!(result.build_results[0].exit_code, 0);
    assert!(fx.output.join("A/index.html").is_file());
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("Failed to log project record for A")));
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("Failed to update build record")));

    // A lost project record counts as an error and keeps the error log.
    let errors = error_logs(&fx.logs);
    assert_eq!(errors.len(), 1);
    let text = std::fs::read_to_string(&errors[0]).unwrap();
    assert!(text.contains("Failed to log project record for A"));
}
