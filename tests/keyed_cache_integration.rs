use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use taskchain::{
    Chain, KeyedTaskCache, Lookup, Outcome, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerEvent, SchedulerEventHandler, Task, TaskContext,
};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(10);

type Deliveries = Arc<Mutex<Vec<(String, String)>>>;

fn gated_task(label: &str, value: &str) -> (Task<String>, oneshot::Sender<()>) {
    let (release, gate) = oneshot::channel::<()>();
    let value = value.to_string();
    let task = Task::new(label, move |ctx: TaskContext<String>| {
        let runtime = ctx.runtime().clone();
        runtime.spawn(async move {
            let _ = gate.await;
            ctx.finish(value);
        });
    });
    (task, release)
}

/// fetch (held open until released) -> transform (uppercases its input)
fn row_chain(name: &str) -> (Chain<String>, Vec<Task<String>>, oneshot::Sender<()>) {
    let (fetch, release) = gated_task(&format!("{name}/fetch"), name);
    let transform = Task::from_fn(format!("{name}/transform"), |inputs: Vec<String>| {
        inputs[0].to_uppercase()
    });
    let tasks = vec![fetch.clone(), transform.clone()];
    let chain = Chain::new(fetch).then(transform).unwrap();
    (chain, tasks, release)
}

fn recorder(deliveries: &Deliveries, key: &str) -> impl FnOnce(String) + Send + 'static {
    let deliveries = deliveries.clone();
    let key = key.to_string();
    move |value| deliveries.lock().unwrap().push((key, value))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerequest_supersedes_pending_chain() {
    let scheduler = Scheduler::new(SchedulerConfig::with_max_concurrent_tasks(4)).unwrap();
    let cache: KeyedTaskCache<String, String> = KeyedTaskCache::new(scheduler.clone());
    let deliveries = Deliveries::default();

    let (chain_x, tasks_x, release_x) = row_chain("chain-x");
    let (chain_y, tasks_y, release_y) = row_chain("chain-y");

    let first = cache
        .request("row5".to_string(), || Ok(chain_x), recorder(&deliveries, "row5"))
        .unwrap();
    let second = cache
        .request("row5".to_string(), || Ok(chain_y), recorder(&deliveries, "row5"))
        .unwrap();

    let (Lookup::Scheduled { generation: g1, .. }, Lookup::Scheduled { generation: g2, .. }) =
        (first, second)
    else {
        panic!("both requests should schedule work");
    };
    assert!(g2 > g1);

    // chain X is cancelled by the time the second request returns
    assert!(tasks_x.iter().all(Task::is_cancelled));
    assert!(tasks_y.iter().all(|task| !task.is_cancelled()));

    // Let X's fetch "succeed" after being superseded; its value must be discarded
    release_x.send(()).unwrap();
    let outcomes = tokio::time::timeout(WAIT, join_all(tasks_x.iter().map(Task::wait)))
        .await
        .unwrap();
    assert_eq!(outcomes, vec![Outcome::Cancelled, Outcome::Cancelled]);

    release_y.send(()).unwrap();
    tokio::time::timeout(WAIT, scheduler.wait_idle()).await.unwrap();

    assert_eq!(
        *deliveries.lock().unwrap(),
        vec![("row5".to_string(), "CHAIN-Y".to_string())]
    );
    assert_eq!(cache.cached(&"row5".to_string()), Some("CHAIN-Y".to_string()));
}

/// Requests the key again from inside the first `Cancelled` event, which
/// fires while the request that caused it has not submitted its chain yet
struct RerequestOnCancel {
    cache: Arc<OnceLock<KeyedTaskCache<&'static str, String>>>,
    next: Mutex<Option<(Chain<String>, Deliveries)>>,
}

impl SchedulerEventHandler for RerequestOnCancel {
    fn handle_event(&self, event: &SchedulerEvent) -> anyhow::Result<()> {
        if !matches!(event, SchedulerEvent::Cancelled { .. }) {
            return Ok(());
        }
        let Some((chain, deliveries)) = self.next.lock().unwrap().take() else {
            return Ok(());
        };
        if let Some(cache) = self.cache.get() {
            cache.request("row5", || Ok(chain), recorder(&deliveries, "row5"))?;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerequest_during_supersede_cancels_unsubmitted_chain() {
    let deliveries = Deliveries::default();
    let slot = Arc::new(OnceLock::new());
    let (chain_z, _, release_z) = row_chain("chain-z");
    let scheduler = Scheduler::with_event_handlers(
        SchedulerConfig::with_max_concurrent_tasks(4),
        vec![Box::new(RerequestOnCancel {
            cache: slot.clone(),
            next: Mutex::new(Some((chain_z, deliveries.clone()))),
        })],
    )
    .unwrap();
    let cache: KeyedTaskCache<&'static str, String> = KeyedTaskCache::new(scheduler.clone());
    assert!(slot.set(cache.clone()).is_ok());

    let (chain_x, _, release_x) = row_chain("chain-x");
    cache
        .request("row5", || Ok(chain_x), recorder(&deliveries, "row5"))
        .unwrap();

    // Superseding X fires the handler, which supersedes Y before Y is submitted
    let body_runs = Arc::new(AtomicUsize::new(0));
    let runs = body_runs.clone();
    let fetch_y = Task::from_fn("chain-y/fetch", move |_| {
        runs.fetch_add(1, Ordering::SeqCst);
        "chain-y".to_string()
    });
    let runs = body_runs.clone();
    let transform_y = Task::from_fn("chain-y/transform", move |inputs: Vec<String>| {
        runs.fetch_add(1, Ordering::SeqCst);
        inputs.concat()
    });
    let tasks_y = vec![fetch_y.clone(), transform_y.clone()];
    cache
        .request(
            "row5",
            || Chain::new(fetch_y).then(transform_y),
            recorder(&deliveries, "row5"),
        )
        .unwrap();

    assert!(tasks_y.iter().all(Task::is_cancelled));
    let outcomes = tokio::time::timeout(WAIT, join_all(tasks_y.iter().map(Task::wait)))
        .await
        .unwrap();
    assert_eq!(outcomes, vec![Outcome::Cancelled, Outcome::Cancelled]);

    release_x.send(()).unwrap();
    release_z.send(()).unwrap();
    tokio::time::timeout(WAIT, scheduler.wait_idle()).await.unwrap();

    assert_eq!(body_runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        *deliveries.lock().unwrap(),
        vec![("row5".to_string(), "CHAIN-Z".to_string())]
    );
    assert_eq!(cache.cached(&"row5"), Some("CHAIN-Z".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cached_request_schedules_nothing() {
    let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
    let cache: KeyedTaskCache<u32, String> = KeyedTaskCache::new(scheduler.clone());
    let deliveries = Deliveries::default();
    let builds = Arc::new(AtomicUsize::new(0));

    let counter = builds.clone();
    cache
        .request(
            7,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Chain::new(Task::from_fn("fetch", |_| "seven".to_string()))
                    .then(Task::from_fn("transform", |inputs: Vec<String>| inputs.concat()))
            },
            recorder(&deliveries, "7"),
        )
        .unwrap();
    tokio::time::timeout(WAIT, scheduler.wait_idle()).await.unwrap();
    let submitted = scheduler.stats().submitted;
    assert_eq!(submitted, 2);

    for _ in 0..5 {
        let counter = builds.clone();
        let lookup = cache
            .request(
                7,
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Chain::from_tasks(vec![Task::from_fn("fetch", |_| String::new())])
                },
                recorder(&deliveries, "7"),
            )
            .unwrap();
        assert_eq!(lookup, Lookup::Cached("seven".to_string()));
    }

    assert_eq!(scheduler.stats().submitted, submitted);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    // Hits are returned directly, not through the callback
    assert_eq!(deliveries.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scrolled_away_row_never_delivers() {
    let scheduler = Scheduler::new(SchedulerConfig::with_max_concurrent_tasks(2)).unwrap();
    let cache: KeyedTaskCache<u32, String> = KeyedTaskCache::new(scheduler.clone());
    let deliveries = Deliveries::default();

    let mut releases = Vec::new();
    for row in 0..4u32 {
        let (chain, _, release) = row_chain(&format!("row-{row}"));
        cache
            .request(row, || Ok(chain), recorder(&deliveries, &row.to_string()))
            .unwrap();
        releases.push(release);
    }

    // Rows 2 and 3 scroll off-screen before their data arrives
    assert!(cache.cancel(&2));
    assert!(cache.cancel(&3));
    for release in releases {
        let _ = release.send(());
    }
    tokio::time::timeout(WAIT, scheduler.wait_idle()).await.unwrap();

    let mut delivered: Vec<String> = deliveries
        .lock()
        .unwrap()
        .iter()
        .map(|(key, _)| key.clone())
        .collect();
    delivered.sort();
    assert_eq!(delivered, vec!["0".to_string(), "1".to_string()]);
    assert_eq!(cache.cached(&2), None);
    assert!(!cache.is_pending(&2));
    assert_eq!(cache.len(), 2);

    // Scrolling back schedules fresh work for the cancelled rows only
    let lookup = cache
        .request(
            2,
            || Ok(Chain::new(Task::from_fn("row-2/retry", |_| "again".to_string()))),
            recorder(&deliveries, "2"),
        )
        .unwrap();
    assert!(matches!(lookup, Lookup::Scheduled { .. }));
    assert!(matches!(
        cache.request(0, || panic!("row 0 is cached"), |_| {}),
        Ok(Lookup::Cached(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_builder_leaves_entry_untouched() {
    let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
    let cache: KeyedTaskCache<u32, String> = KeyedTaskCache::new(scheduler.clone());

    let result = cache.request(1, || Chain::from_tasks(Vec::new()), |_| {});

    assert_eq!(result, Err(SchedulerError::EmptyChain));
    assert!(cache.is_empty());
    assert_eq!(scheduler.stats().submitted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_rerequests_deliver_only_the_last() {
    let scheduler = Scheduler::new(SchedulerConfig::with_max_concurrent_tasks(3)).unwrap();
    let cache: KeyedTaskCache<&'static str, String> = KeyedTaskCache::new(scheduler.clone());
    let deliveries = Deliveries::default();

    let mut releases = Vec::new();
    for attempt in 0..6 {
        let (chain, _, release) = row_chain(&format!("attempt-{attempt}"));
        cache
            .request("row", || Ok(chain), recorder(&deliveries, "row"))
            .unwrap();
        releases.push(release);
    }
    // Release newest first so stale chains finish after the winner
    for release in releases.into_iter().rev() {
        let _ = release.send(());
    }
    tokio::time::timeout(WAIT, scheduler.wait_idle()).await.unwrap();

    assert_eq!(
        *deliveries.lock().unwrap(),
        vec![("row".to_string(), "ATTEMPT-5".to_string())]
    );
    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 12);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.cancelled, 10);
}
