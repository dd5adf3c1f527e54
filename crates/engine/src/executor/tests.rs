use std::sync::atomic::AtomicU32;

use cogwheel_core::MemoryStore;

use super::*;

fn settings(max_workers: usize, max_retries: u32) -> ExecutorSettings {
    ExecutorSettings {
        max_workers,
        max_retries,
        task_timeout_ms: 1_000,
        backoff_base_ms: 5,
        backoff_max_ms: 20,
        cancel_grace_ms: 20,
    }
}

async fn pool_with(
    runner: impl TaskRunner + 'static,
    settings: ExecutorSettings,
) -> (WorkerPool, Arc<MemoryStore>, mpsc::Receiver<WorkerReport>) {
    let store = Arc::new(MemoryStore::new());
    let (tx, rx) = mpsc::channel(64);
    let pool = WorkerPool::new(&settings, Arc::new(runner), store.clone(), tx);
    (pool, store, rx)
}

async fn job(store: &MemoryStore, payload: &'static [u8], timeout_ms: u64) -> Job {
    Job {
        task_id: TaskId::new(),
        payload_ref: store.put(Bytes::from_static(payload)).await.unwrap(),
        inputs: Vec::new(),
        timeout: Duration::from_millis(timeout_ms),
        first_attempt: 0,
        run: 7,
    }
}

/// Reports until the job's terminal one.
async fn finish(rx: &mut mpsc::Receiver<WorkerReport>) -> Vec<WorkerReport> {
    let mut seen = Vec::new();
    while let Some(report) = rx.recv().await {
        let terminal = report.is_terminal();
        seen.push(report);
        if terminal {
            break;
        }
    }
    seen
}

/// Fails the first `failures` attempts, then echoes.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl TaskRunner for Flaky {
    async fn run(&self, ctx: RunContext) -> Result<Bytes, RunError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(RunError::Failed(format!("attempt {} failed", ctx.attempt)));
        }
        Ok(ctx.payload)
    }
}

/// Waits for cancellation and reports it.
struct Cooperative;

#[async_trait]
impl TaskRunner for Cooperative {
    async fn run(&self, ctx: RunContext) -> Result<Bytes, RunError> {
        ctx.cancel.canceled().await;
        Err(RunError::Canceled)
    }
}

/// Never yields to the cancel flag.
struct Stubborn;

#[async_trait]
impl TaskRunner for Stubborn {
    async fn run(&self, _ctx: RunContext) -> Result<Bytes, RunError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Bytes::new())
    }
}

/// Concatenates its inputs.
struct Concat;

#[async_trait]
impl TaskRunner for Concat {
    async fn run(&self, ctx: RunContext) -> Result<Bytes, RunError> {
        let mut out = ctx.payload.to_vec();
        for input in &ctx.inputs {
            out.extend_from_slice(input);
        }
        Ok(Bytes::from(out))
    }
}

#[tokio::test]
async fn success_stores_result() {
    let (pool, store, mut rx) = pool_with(EchoRunner, settings(2, 0)).await;
    let job = job(&store, b"hello", 500).await;
    let task = job.task_id;
    pool.spawn(job);

    let reports = finish(&mut rx).await;
    assert_eq!(reports[0], WorkerReport::Started { task, run: 7 });
    assert!(reports.iter().all(|r| r.run() == 7));
    match reports.last().unwrap() {
        WorkerReport::Completed { result, .. } => {
            assert_eq!(store.get(result).await.unwrap(), Bytes::from_static(b"hello"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn inputs_are_resolved_in_order() {
    let (pool, store, mut rx) = pool_with(Concat, settings(1, 0)).await;
    let mut job = job(&store, b"a", 500).await;
    job.inputs = vec![
        store.put(Bytes::from_static(b"b")).await.unwrap(),
        store.put(Bytes::from_static(b"c")).await.unwrap(),
    ];
    pool.spawn(job);

    match finish(&mut rx).await.pop().unwrap() {
        WorkerReport::Completed { result, .. } => {
            assert_eq!(store.get(&result).await.unwrap(), Bytes::from_static(b"abc"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn failures_are_retried_until_success() {
    let runner = Flaky {
        failures: 2,
        calls: AtomicU32::new(0),
    };
    let (pool, store, mut rx) = pool_with(runner, settings(1, 3)).await;
    pool.spawn(job(&store, b"x", 500).await);

    let reports = finish(&mut rx).await;
    let retries: Vec<u32> = reports
        .iter()
        .filter_map(|r| match r {
            WorkerReport::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert!(matches!(reports.last(), Some(WorkerReport::Completed { .. })));
}

#[tokio::test]
async fn exhausted_retries_fail() {
    let runner = Flaky {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    };
    let (pool, store, mut rx) = pool_with(runner, settings(1, 1)).await;
    pool.spawn(job(&store, b"x", 500).await);

    let reports = finish(&mut rx).await;
    match reports.last().unwrap() {
        WorkerReport::Failed { error, .. } => assert_eq!(error, "attempt 1 failed"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn timeout_signals_runner_and_fails() {
    let (pool, store, mut rx) = pool_with(Cooperative, settings(1, 0)).await;
    pool.spawn(job(&store, b"x", 20).await);

    match finish(&mut rx).await.pop().unwrap() {
        WorkerReport::Failed { error, .. } => assert!(error.contains("timed out"), "{error}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn runner_ignoring_cancel_is_aborted_after_grace() {
    let (pool, store, mut rx) = pool_with(Stubborn, settings(1, 0)).await;
    pool.spawn(job(&store, b"x", 20).await);

    let outcome = tokio::time::timeout(Duration::from_secs(2), finish(&mut rx))
        .await
        .expect("aborted runner must not hold the job");
    assert!(matches!(outcome.last(), Some(WorkerReport::Failed { .. })));
    assert_eq!(pool.busy(), 0);
}

#[tokio::test]
async fn cancel_stops_a_running_job() {
    let (pool, store, mut rx) = pool_with(Cooperative, settings(1, 3)).await;
    let handle = pool.spawn(job(&store, b"x", 5_000).await);
    assert!(matches!(rx.recv().await, Some(WorkerReport::Started { .. })));

    handle.cancel();
    assert!(matches!(finish(&mut rx).await.pop(), Some(WorkerReport::Canceled { .. })));
}

#[tokio::test]
async fn missing_payload_is_a_resolution_failure() {
    let (pool, _store, mut rx) = pool_with(EchoRunner, settings(1, 0)).await;
    pool.spawn(Job {
        task_id: TaskId::new(),
        payload_ref: PayloadId::from("absent"),
        inputs: Vec::new(),
        timeout: Duration::from_millis(100),
        first_attempt: 0,
        run: 1,
    });

    match finish(&mut rx).await.pop().unwrap() {
        WorkerReport::Failed { error, .. } => assert!(error.contains("payload"), "{error}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn pool_bounds_concurrency() {
    let (pool, store, mut rx) = pool_with(Cooperative, settings(2, 0)).await;
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(pool.spawn(job(&store, b"x", 5_000).await));
    }

    let mut started = 0;
    while started < 2 {
        if let Some(WorkerReport::Started { .. }) = rx.recv().await {
            started += 1;
        }
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(pool.busy(), 2);

    for h in &handles {
        h.cancel();
    }
}

#[tokio::test]
async fn backoff_doubles_and_caps() {
    let (pool, _store, _rx) = pool_with(EchoRunner, settings(1, 5)).await;
    assert_eq!(pool.backoff(0), Duration::from_millis(5));
    assert_eq!(pool.backoff(1), Duration::from_millis(10));
    assert_eq!(pool.backoff(2), Duration::from_millis(20));
    assert_eq!(pool.backoff(10), Duration::from_millis(20));
}

#[tokio::test]
async fn cancel_flag_wakes_waiters() {
    let flag = CancelFlag::new();
    let waiter = {
        let flag = flag.clone();
        tokio::spawn(async move { flag.canceled().await })
    };
    flag.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(flag.is_canceled());
    // Already raised: returns immediately.
    flag.canceled().await;
}
