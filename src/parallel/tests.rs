use super::*;
use crate::executor::TerminationReason;
use crate::provider::{AgentProvider, ExecuteOptions, ExecutionResult, ProviderError};
use crate::scope::FileChange;
use crate::testing::{MockQualityChecker, MockVcs, ScriptedProvider, TestFixture};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Fake runner
// ============================================================================

#[derive(Clone, Default)]
struct Behaviour {
    files: Vec<PathBuf>,
    delay_ms: u64,
    /// Fail this many runs before succeeding.
    failures: usize,
    panic: bool,
}

#[derive(Default)]
struct FakeRunner {
    behaviour: HashMap<PathBuf, Behaviour>,
    calls: Mutex<Vec<PathBuf>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRunner {
    fn with(mut self, task: &str, behaviour: Behaviour) -> Self {
        self.behaviour.insert(PathBuf::from(task), behaviour);
        self
    }

    fn calls_for(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_path() == Path::new(task))
            .count()
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run_task(&self, task_path: &Path, on_iteration: IterationCallback) -> ExecutorResult {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|p| p.as_path() == task_path).count();
            calls.push(task_path.to_path_buf());
            previous
        };
        let behaviour = self
            .behaviour
            .get(task_path)
            .cloned()
            .unwrap_or_default();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(behaviour.delay_ms)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if behaviour.panic {
            panic!("runner exploded");
        }

        let mut state = RunState::new();
        state.iteration = 1;
        state.add_files(behaviour.files.clone());
        on_iteration(&state);

        let mut result = ExecutorResult::crashed(task_path, "failed");
        result.iterations = 1;
        result.files_modified = behaviour.files;
        if previous >= behaviour.failures {
            result.success = true;
            result.status = RunStatus::Completed;
            result.error = None;
            result.exit_code = 0;
            result.termination = Some(TerminationReason::Completed);
        }
        result
    }
}

fn project(tasks: &[(&str, &[&str])]) -> TestFixture {
    let fixture = TestFixture::minimal_project();
    for (name, allowed) in tasks {
        let content = TestFixture::task_content(name, allowed, &[]);
        fixture.write_file(name, &content).unwrap();
    }
    fixture
}

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

fn files(names: &[&str]) -> Vec<PathBuf> {
    paths(names)
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_disjoint_tasks_share_one_wave() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"]), ("tasks/b.md", &["src/b/**"])]);
    let runner = Arc::new(FakeRunner::default());
    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert!(result.dependencies.is_empty());
    assert_eq!(result.waves, vec![paths(&["tasks/a.md", "tasks/b.md"])]);
    assert_eq!(result.total, 2);
    assert_eq!(result.succeeded, 2);
    assert!(result.all_succeeded());
    assert_eq!(result.total_iterations, 2);
}

#[tokio::test]
async fn test_overlapping_tasks_run_in_separate_waves() {
    let fixture = project(&[
        ("tasks/a.md", &["src/shared/**"]),
        ("tasks/b.md", &["src/shared/**"]),
    ]);
    let runner = Arc::new(FakeRunner::default().with(
        "tasks/a.md",
        Behaviour {
            delay_ms: 50,
            ..Behaviour::default()
        },
    ));
    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(result.dependencies.len(), 1);
    assert_eq!(result.dependencies[0].task, PathBuf::from("tasks/b.md"));
    assert_eq!(result.waves, vec![paths(&["tasks/a.md"]), paths(&["tasks/b.md"])]);
    assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrency_bounds_in_flight_tasks() {
    let tasks: Vec<(String, String)> = (0..5)
        .map(|i| (format!("tasks/t{i}.md"), format!("src/m{i}/**")))
        .collect();
    let fixture = TestFixture::minimal_project();
    let mut runner = FakeRunner::default();
    for (name, allowed) in &tasks {
        fixture
            .write_file(name, &TestFixture::task_content(name, &[allowed.as_str()], &[]))
            .unwrap();
        runner = runner.with(
            name,
            Behaviour {
                delay_ms: 40,
                ..Behaviour::default()
            },
        );
    }
    let runner = Arc::new(runner);
    let task_paths: Vec<PathBuf> = tasks.iter().map(|(n, _)| PathBuf::from(n)).collect();

    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .with_concurrency(2)
        .run(&task_paths)
        .await
        .unwrap();

    assert_eq!(result.waves.len(), 1);
    assert_eq!(result.succeeded, 5);
    assert!(runner.max_in_flight.load(Ordering::SeqCst) <= 2);
}

// ============================================================================
// Aggregation and failure handling
// ============================================================================

#[tokio::test]
async fn test_files_modified_are_deduplicated() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"]), ("tasks/b.md", &["src/b/**"])]);
    let runner = Arc::new(
        FakeRunner::default()
            .with(
                "tasks/a.md",
                Behaviour {
                    files: files(&["src/a/x.rs", "README.md"]),
                    ..Behaviour::default()
                },
            )
            .with(
                "tasks/b.md",
                Behaviour {
                    files: files(&["README.md", "src/b/y.rs"]),
                    delay_ms: 50,
                    ..Behaviour::default()
                },
            ),
    );
    let result = ParallelCoordinator::new(fixture.path(), runner)
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(
        result.files_modified,
        files(&["src/a/x.rs", "README.md", "src/b/y.rs"])
    );
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].file, PathBuf::from("README.md"));
    assert_eq!(result.conflicts[0].owner, PathBuf::from("tasks/a.md"));
}

#[tokio::test]
async fn test_conflicting_failed_task_is_retried_once() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"]), ("tasks/b.md", &["src/b/**"])]);
    let runner = Arc::new(
        FakeRunner::default()
            .with(
                "tasks/a.md",
                Behaviour {
                    files: files(&["Cargo.toml"]),
                    ..Behaviour::default()
                },
            )
            .with(
                "tasks/b.md",
                Behaviour {
                    files: files(&["Cargo.toml"]),
                    delay_ms: 50,
                    failures: 1,
                    ..Behaviour::default()
                },
            ),
    );
    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(runner.calls_for("tasks/a.md"), 1);
    assert_eq!(runner.calls_for("tasks/b.md"), 2);
    assert!(result.results[1].success);
    assert_eq!(result.succeeded, 2);
}

#[tokio::test]
async fn test_retry_happens_at_most_once() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"]), ("tasks/b.md", &["src/b/**"])]);
    let runner = Arc::new(
        FakeRunner::default()
            .with(
                "tasks/a.md",
                Behaviour {
                    files: files(&["Cargo.toml"]),
                    ..Behaviour::default()
                },
            )
            .with(
                "tasks/b.md",
                Behaviour {
                    files: files(&["Cargo.toml"]),
                    delay_ms: 50,
                    failures: 5,
                    ..Behaviour::default()
                },
            ),
    );
    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(runner.calls_for("tasks/b.md"), 2);
    assert!(!result.results[1].success);
    assert_eq!(result.failed, 1);
}

#[tokio::test]
async fn test_failure_without_conflict_is_not_retried() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"])]);
    let runner = Arc::new(FakeRunner::default().with(
        "tasks/a.md",
        Behaviour {
            failures: 1,
            ..Behaviour::default()
        },
    ));
    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .run(&paths(&["tasks/a.md"]))
        .await
        .unwrap();

    assert_eq!(runner.calls_for("tasks/a.md"), 1);
    assert_eq!(result.failed, 1);
}

#[tokio::test]
async fn test_panicking_task_becomes_failed_result() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"]), ("tasks/b.md", &["src/b/**"])]);
    let runner = Arc::new(FakeRunner::default().with(
        "tasks/a.md",
        Behaviour {
            panic: true,
            ..Behaviour::default()
        },
    ));
    let result = ParallelCoordinator::new(fixture.path(), runner)
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.succeeded, 1);
    assert!(result.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Task execution failed"));
}

#[tokio::test]
async fn test_unparseable_task_is_reported_not_run() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"])]);
    fixture.write_file("tasks/bad.md", "# Nothing here\n").unwrap();
    let runner = Arc::new(FakeRunner::default());
    let result = ParallelCoordinator::new(fixture.path(), runner.clone())
        .run(&paths(&["tasks/bad.md", "tasks/a.md"]))
        .await
        .unwrap();

    assert_eq!(runner.calls_for("tasks/bad.md"), 0);
    assert_eq!(result.total, 2);
    assert_eq!(result.failed, 1);
    assert!(!result.results[0].success);
    assert_eq!(result.results[0].exit_code, 6);
    assert_eq!(result.waves, vec![paths(&["tasks/a.md"])]);
}

#[tokio::test]
async fn test_run_lock_is_exclusive() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"])]);
    let held = RunLock::acquire(fixture.path()).unwrap();

    let err = ParallelCoordinator::new(fixture.path(), Arc::new(FakeRunner::default()))
        .run(&paths(&["tasks/a.md"]))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("run.lock"));

    drop(held);
    assert!(ParallelCoordinator::new(fixture.path(), Arc::new(FakeRunner::default()))
        .run(&paths(&["tasks/a.md"]))
        .await
        .is_ok());
}

// ============================================================================
// With the real executor
// ============================================================================

#[tokio::test]
async fn test_executor_runner_completes_tasks() {
    let fixture = project(&[("tasks/a.md", &["src/a/**"]), ("tasks/b.md", &["src/b/**"])]);
    let provider = Arc::new(ScriptedProvider::new().with_fallback(ExecutionResult::from_output(
        "<promise>COMPLETE</promise>".to_string(),
        Vec::new(),
    )));
    let deps = ExecutorDependencies::real(fixture.path())
        .with_vcs(Arc::new(MockVcs::new()))
        .with_provider(provider.clone())
        .with_quality(Arc::new(MockQualityChecker::new()));
    let runner = Arc::new(ExecutorRunner::new(fixture.path(), toml::Table::new(), deps));

    let result = ParallelCoordinator::new(fixture.path(), runner)
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(result.succeeded, 2);
    assert_eq!(provider.call_count(), 2);
    assert!(fixture.path().join("tasks/completed/a.md").exists());
    assert!(fixture.path().join("tasks/completed/b.md").exists());
}

/// Answers each task from its own queue, picked by a phrase in the task goal.
#[derive(Default)]
struct RoutedProvider {
    routes: Vec<(&'static str, Mutex<VecDeque<(u64, ExecutionResult)>>)>,
    calls: Mutex<Vec<&'static str>>,
}

impl RoutedProvider {
    fn route(mut self, phrase: &'static str, replies: Vec<(u64, ExecutionResult)>) -> Self {
        self.routes.push((phrase, Mutex::new(replies.into())));
        self
    }

    fn calls_for(&self, phrase: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| **p == phrase).count()
    }
}

#[async_trait]
impl AgentProvider for RoutedProvider {
    fn name(&self) -> &str {
        "routed"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, prompt: &str, _options: &ExecuteOptions) -> ExecutionResult {
        let Some((phrase, queue)) = self.routes.iter().find(|(p, _)| prompt.contains(p)) else {
            return ExecutionResult::from_output("No route.".to_string(), Vec::new());
        };
        self.calls.lock().unwrap().push(phrase);
        let next = queue.lock().unwrap().pop_front();
        let Some((delay_ms, result)) = next else {
            return ExecutionResult::from_output("Idle.".to_string(), Vec::new());
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        result
    }
}

#[tokio::test]
async fn test_conflict_retry_reruns_task_moved_to_failed_dir() {
    let fixture = TestFixture::minimal_project();
    fixture
        .write_file(
            "tasks/a.md",
            &TestFixture::task_content("Build the alpha module", &["src/a/**"], &[]),
        )
        .unwrap();
    fixture
        .write_file(
            "tasks/b.md",
            &TestFixture::task_content("Build the beta module", &["src/b/**"], &[]),
        )
        .unwrap();

    let shared = || vec![FileChange::modified("src/shared.rs")];
    let done = || "<promise>COMPLETE</promise>".to_string();
    let provider = Arc::new(
        RoutedProvider::default()
            .route(
                "alpha module",
                vec![(0, ExecutionResult::from_output(done(), shared()))],
            )
            .route(
                "beta module",
                vec![
                    (100, ExecutionResult::from_output("Halfway.".to_string(), shared())),
                    (
                        0,
                        ExecutionResult::failed(&ProviderError::Unavailable {
                            message: "agent binary vanished".to_string(),
                        }),
                    ),
                    (0, ExecutionResult::from_output(done(), Vec::new())),
                ],
            ),
    );
    let deps = ExecutorDependencies::real(fixture.path())
        .with_vcs(Arc::new(MockVcs::new()))
        .with_provider(provider.clone())
        .with_quality(Arc::new(MockQualityChecker::new()));
    let raw: toml::Table = toml::from_str(
        "[execution]\nsession_continuation = false\n\n[permissions]\nscope_enforcement = \"permissive\"\n",
    )
    .unwrap();
    let runner = Arc::new(ExecutorRunner::new(fixture.path(), raw, deps));

    let result = ParallelCoordinator::new(fixture.path(), runner)
        .run(&paths(&["tasks/a.md", "tasks/b.md"]))
        .await
        .unwrap();

    assert_eq!(result.waves.len(), 1);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].task, PathBuf::from("tasks/b.md"));
    assert_eq!(provider.calls_for("beta module"), 3);
    assert!(result.results[1].success, "{:?}", result.results[1].error);
    assert_eq!(result.succeeded, 2);
    assert!(fixture.path().join("tasks/completed/b.md").exists());
    assert!(!fixture.path().join("tasks/failed/b.md").exists());
}
