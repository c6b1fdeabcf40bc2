//! Shared fakes and pool construction for integration tests.
//!
//! Every substrate is replaced by an in-memory fake so tests can count
//! launches and inject failures deterministically.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use preview_pool::activity::ActivityTracker;
use preview_pool::cache::CachePurge;
use preview_pool::config::PoolConfig;
use preview_pool::liveness::{HealthProbe, LivenessChecker, ProcessProbe};
use preview_pool::models::cloud_task::{
    CloudTask, ReclaimScope, RuntimeStatus, StopOutcome, TaskSpec, TaskTag, WORKSPACE_TAG,
};
use preview_pool::models::workspace::{InvalidationRequest, InvalidationStatus};
use preview_pool::orchestrator::launcher::{LaunchSettings, ResourceLauncher};
use preview_pool::orchestrator::lifecycle::Lifecycle;
use preview_pool::orchestrator::pool::PoolManager;
use preview_pool::orchestrator::reclaimer::OrphanReclaimer;
use preview_pool::orchestrator::workspace_locks::WorkspaceLocks;
use preview_pool::persistence::activity_repo::SqliteActivityStore;
use preview_pool::persistence::db::{self, Database};
use preview_pool::persistence::session_repo::SessionRepo;
use preview_pool::substrate::cloud::CloudControl;
use preview_pool::substrate::ports::PortAllocator;
use preview_pool::substrate::process::{LaunchRequest, ProcessLauncher};
use preview_pool::{AppError, Result};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Processes ─────────────────────────────────────────────

/// Pids the fake launcher considers running.
#[derive(Default)]
pub struct ProcessTable {
    alive: Mutex<HashSet<u32>>,
}

impl ProcessTable {
    pub fn kill(&self, pid: u32) {
        lock(&self.alive).remove(&pid);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        lock(&self.alive).contains(&pid)
    }
}

/// Launcher that hands out fake pids.
pub struct FakeProcessLauncher {
    pub table: Arc<ProcessTable>,
    pub launches: AtomicUsize,
    pub terminated: Mutex<Vec<u32>>,
    pub fail_launch: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub launch_delay: Mutex<Duration>,
    next_pid: AtomicU32,
}

impl FakeProcessLauncher {
    pub fn new(table: Arc<ProcessTable>) -> Self {
        Self {
            table,
            launches: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            launch_delay: Mutex::new(Duration::ZERO),
            next_pid: AtomicU32::new(10_000),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.terminated).clone()
    }
}

impl ProcessLauncher for FakeProcessLauncher {
    fn launch(&self, _request: LaunchRequest) -> BoxFut<'_, Result<u32>> {
        Box::pin(async move {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let delay = *lock(&self.launch_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(AppError::StartFailed("spawn refused".into()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            lock(&self.table.alive).insert(pid);
            Ok(pid)
        })
    }

    fn terminate(&self, pid: u32) -> BoxFut<'_, Result<StopOutcome>> {
        Box::pin(async move {
            if self.fail_terminate.load(Ordering::SeqCst) {
                return Err(AppError::StopFailed(format!("pid {pid} refused to die")));
            }
            lock(&self.terminated).push(pid);
            if lock(&self.table.alive).remove(&pid) {
                Ok(StopOutcome::Stopped)
            } else {
                Ok(StopOutcome::AlreadyAbsent)
            }
        })
    }
}

/// Process probe backed by the fake process table.
pub struct FakeProcessProbe {
    pub table: Arc<ProcessTable>,
}

impl ProcessProbe for FakeProcessProbe {
    fn is_alive(&self, pid: u32) -> BoxFut<'_, bool> {
        Box::pin(async move { self.table.is_alive(pid) })
    }
}

/// Health probe with a global switch.
pub struct FakeHealthProbe {
    pub ok: AtomicBool,
}

impl HealthProbe for FakeHealthProbe {
    fn probe(&self, _port: u16) -> BoxFut<'_, bool> {
        Box::pin(async move { self.ok.load(Ordering::SeqCst) })
    }
}

// ── Cloud ─────────────────────────────────────────────────

/// Runs once, inside the next `stop_task` call, before the stop takes effect.
pub type StopHook = Box<dyn FnOnce() -> BoxFut<'static, ()> + Send>;

/// In-memory task-execution control plane.
#[derive(Default)]
pub struct FakeCloud {
    tasks: Mutex<HashMap<String, CloudTask>>,
    pub stopped: Mutex<Vec<String>>,
    pub fail_start: AtomicBool,
    pub fail_list: AtomicBool,
    pub fail_stop_for: Mutex<HashSet<String>>,
    pub before_stop: Mutex<Option<StopHook>>,
    next: AtomicU32,
}

impl FakeCloud {
    /// Register a running task, tagged for `workspace` when given.
    pub fn add_task(&self, task_ref: &str, workspace: Option<&str>) {
        let tags = workspace
            .map(|ws| {
                vec![TaskTag {
                    key: WORKSPACE_TAG.to_owned(),
                    value: ws.to_owned(),
                }]
            })
            .unwrap_or_default();
        lock(&self.tasks).insert(
            task_ref.to_owned(),
            CloudTask {
                task_ref: task_ref.to_owned(),
                tags,
                runtime_status: RuntimeStatus::Running,
            },
        );
    }

    pub fn is_running(&self, task_ref: &str) -> bool {
        lock(&self.tasks)
            .get(task_ref)
            .is_some_and(|t| t.runtime_status == RuntimeStatus::Running)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|t| t.runtime_status == RuntimeStatus::Running)
            .count()
    }

    pub fn stopped(&self) -> Vec<String> {
        lock(&self.stopped).clone()
    }
}

impl CloudControl for FakeCloud {
    fn start_task(&self, spec: TaskSpec) -> BoxFut<'_, Result<String>> {
        Box::pin(async move {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(AppError::StartFailed("no capacity in cluster".into()));
            }
            let task_ref = format!("task-{}", self.next.fetch_add(1, Ordering::SeqCst));
            lock(&self.tasks).insert(
                task_ref.clone(),
                CloudTask {
                    task_ref: task_ref.clone(),
                    tags: spec.tags,
                    runtime_status: RuntimeStatus::Running,
                },
            );
            Ok(task_ref)
        })
    }

    fn stop_task(&self, task_ref: &str, _reason: &str) -> BoxFut<'_, Result<StopOutcome>> {
        let task_ref = task_ref.to_owned();
        Box::pin(async move {
            let hook = lock(&self.before_stop).take();
            if let Some(hook) = hook {
                hook().await;
            }
            if lock(&self.fail_stop_for).contains(&task_ref) {
                return Err(AppError::StopFailed(format!("stop {task_ref} rejected")));
            }
            let mut tasks = lock(&self.tasks);
            match tasks.get_mut(&task_ref) {
                Some(task) if task.runtime_status == RuntimeStatus::Running => {
                    task.runtime_status = RuntimeStatus::Stopped;
                    lock(&self.stopped).push(task_ref);
                    Ok(StopOutcome::Stopped)
                }
                _ => Ok(StopOutcome::AlreadyAbsent),
            }
        })
    }

    fn list_running_tasks(&self, scope: ReclaimScope) -> BoxFut<'_, Result<Vec<String>>> {
        Box::pin(async move {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(AppError::Substrate("list throttled".into()));
            }
            let mut refs: Vec<String> = lock(&self.tasks)
                .values()
                .filter(|t| t.runtime_status == RuntimeStatus::Running)
                .filter(|t| match &scope {
                    ReclaimScope::All => true,
                    ReclaimScope::Workspace(ws) => t.workspace_id() == Some(ws.as_str()),
                })
                .map(|t| t.task_ref.clone())
                .collect();
            refs.sort();
            Ok(refs)
        })
    }

    fn describe_tasks(&self, task_refs: Vec<String>) -> BoxFut<'_, Result<Vec<CloudTask>>> {
        Box::pin(async move {
            let tasks = lock(&self.tasks);
            Ok(task_refs
                .iter()
                .filter_map(|r| tasks.get(r).cloned())
                .collect())
        })
    }
}

// ── Cache ─────────────────────────────────────────────────

/// Records every invalidation request.
#[derive(Default)]
pub struct FakeCachePurge {
    pub requests: Mutex<Vec<InvalidationRequest>>,
    pub fail: AtomicBool,
}

impl FakeCachePurge {
    pub fn requests(&self) -> Vec<InvalidationRequest> {
        lock(&self.requests).clone()
    }
}

impl CachePurge for FakeCachePurge {
    fn create_invalidation(&self, request: InvalidationRequest) -> BoxFut<'_, Result<String>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Cache("throttled".into()));
            }
            let mut requests = lock(&self.requests);
            requests.push(request);
            Ok(format!("inv-{}", requests.len()))
        })
    }

    fn get_invalidation_status(&self, id: &str) -> BoxFut<'_, Result<Option<InvalidationStatus>>> {
        let id = id.to_owned();
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Cache("throttled".into()));
            }
            let known = id
                .strip_prefix("inv-")
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| lock(&self.requests).get(n.wrapping_sub(1)).cloned());
            Ok(known.map(|req| InvalidationStatus {
                id,
                status: "Completed".into(),
                create_time: None,
                paths_count: u32::try_from(req.paths.len()).ok(),
            }))
        })
    }

    fn list_recent_invalidations(
        &self,
        max_items: u32,
    ) -> BoxFut<'_, Result<Vec<InvalidationStatus>>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Cache("throttled".into()));
            }
            let requests = lock(&self.requests);
            Ok((1..=requests.len())
                .rev()
                .take(usize::try_from(max_items).unwrap_or(usize::MAX))
                .map(|n| InvalidationStatus {
                    id: format!("inv-{n}"),
                    status: "Completed".into(),
                    create_time: None,
                    paths_count: None,
                })
                .collect())
        })
    }
}

// ── Pool ──────────────────────────────────────────────────

/// A pool wired to fakes, with handles on every fake.
pub struct Harness {
    pub db: Arc<Database>,
    pub repo: SessionRepo,
    pub tracker: ActivityTracker,
    pub table: Arc<ProcessTable>,
    pub processes: Arc<FakeProcessLauncher>,
    pub health: Arc<FakeHealthProbe>,
    pub cloud: Arc<FakeCloud>,
    pub ports: Arc<PortAllocator>,
    pub locks: Arc<WorkspaceLocks>,
    pub lifecycle: Lifecycle,
    pub pool: Arc<PoolManager>,
    pub reclaimer: Arc<OrphanReclaimer>,
}

/// Pool settings small enough for tests.
pub fn pool_config(capacity: u32) -> PoolConfig {
    PoolConfig {
        capacity,
        idle_threshold_seconds: 300,
        idle_after_seconds: 60,
        sweep_interval_seconds: 60,
        reclaim_interval_seconds: 300,
        max_candidates_per_pass: 50,
        start_timeout_seconds: 5,
        stop_timeout_seconds: 1,
    }
}

/// Build a pool over an in-memory registry and fresh fakes.
pub async fn harness(config: PoolConfig) -> Harness {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let repo = SessionRepo::new(Arc::clone(&db));
    let tracker = ActivityTracker::new(
        Arc::new(SqliteActivityStore::new(Arc::clone(&db))),
        config.idle_threshold_seconds,
    );

    let table = Arc::new(ProcessTable::default());
    let processes = Arc::new(FakeProcessLauncher::new(Arc::clone(&table)));
    let health = Arc::new(FakeHealthProbe {
        ok: AtomicBool::new(true),
    });
    let cloud = Arc::new(FakeCloud::default());
    let ports = Arc::new(PortAllocator::new(46000, 46999));

    let liveness = LivenessChecker::new(
        Arc::new(FakeProcessProbe {
            table: Arc::clone(&table),
        }),
        health.clone(),
    );
    let cloud_dyn: Arc<dyn CloudControl> = cloud.clone();
    let launcher = Arc::new(ResourceLauncher::new(
        processes.clone(),
        Some(Arc::clone(&cloud_dyn)),
        Arc::clone(&ports),
        liveness.clone(),
        LaunchSettings {
            workspaces_root: PathBuf::from("/srv/workspaces"),
            ready_timeout: Duration::from_secs(2),
            ready_poll_interval: Duration::from_millis(10),
            stop_timeout: config.stop_timeout(),
        },
    ));

    let lifecycle = Lifecycle::new(repo.clone(), tracker.clone(), launcher);
    let locks = Arc::new(WorkspaceLocks::new());
    let pool = Arc::new(PoolManager::new(
        lifecycle.clone(),
        liveness,
        Arc::clone(&locks),
        config.clone(),
    ));
    let reclaimer = Arc::new(OrphanReclaimer::new(
        Some(cloud_dyn),
        repo.clone(),
        Arc::clone(&locks),
        usize::try_from(config.max_candidates_per_pass).expect("cap fits usize"),
        config.stop_timeout(),
    ));

    Harness {
        db,
        repo,
        tracker,
        table,
        processes,
        health,
        cloud,
        ports,
        locks,
        lifecycle,
        pool,
        reclaimer,
    }
}
