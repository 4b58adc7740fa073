//! Master and workers talking over loopback.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use byteorder::{ByteOrder, LittleEndian};
use ganglion::{
    config::NetworkConfig,
    dispatch::net::{
        error::Error,
        master::NetworkDispatcher,
        model::{BoxError, Model, ModelLoader, ModelResolver, TaskCodec},
        tracker::WorkerState,
        wire::ModelUpload,
        worker::WorkerServer,
    },
    Dispatcher, EventSink, Outcome, Session, SessionId, Task, Trajectory,
};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::timeout};

const MODEL_ID: &str = "sleep";
const STALL: Duration = Duration::from_secs(2);
const PATIENCE: Duration = Duration::from_secs(20);
/// The model refuses to run this id.
const BROKEN_ID: u64 = 666;

/// Sleeps for a while, then hands its id back. Even ids reach the goal.
#[derive(Debug, Clone, Copy)]
struct Sleep {
    id: u64,
    millis: u64,
}

impl Task for Sleep {
    type Output = u64;

    fn run(self) -> Outcome<u64> {
        thread::sleep(Duration::from_millis(self.millis));
        Outcome::new(self.id, self.id % 2 == 0)
    }
}

struct SleepCodec;

impl TaskCodec<Sleep> for SleepCodec {
    fn encode_task(&self, task: &Sleep) -> Result<Vec<u8>, BoxError> {
        let mut buf = vec![0u8; 16];
        LittleEndian::write_u64(&mut buf[..8], task.id);
        LittleEndian::write_u64(&mut buf[8..], task.millis);
        Ok(buf)
    }

    fn decode_output(&self, payload: &[u8]) -> Result<u64, BoxError> {
        if payload.len() != 8 {
            Err("output is not a u64")?
        }
        Ok(LittleEndian::read_u64(payload))
    }
}

/// Decides from the call number and the task id whether a call stalls.
type StallRule = dyn Fn(usize, u64) -> bool + Send + Sync;

/// The worker side of [`Sleep`]. One instance serves every connection of a
/// worker, so the call counter spans reconnects.
struct SleepModel {
    calls: AtomicUsize,
    stall: Box<StallRule>,
}

impl Model for SleepModel {
    fn run(&self, task: &[u8]) -> Result<Outcome<Vec<u8>>, BoxError> {
        if task.len() != 16 {
            Err("task is not two u64s")?
        }
        let id = LittleEndian::read_u64(&task[..8]);
        if id == BROKEN_ID {
            Err(format!("task {id} is broken"))?
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let pause = if (self.stall)(call, id) {
            STALL
        } else {
            Duration::from_millis(LittleEndian::read_u64(&task[8..]))
        };
        thread::sleep(pause);
        Ok(Outcome::new(id.to_le_bytes().to_vec(), id % 2 == 0))
    }
}

struct SleepResolver {
    model: Arc<SleepModel>,
}

impl ModelResolver for SleepResolver {
    fn resolve(&self, model_id: &str, _bytecode: &[u8]) -> Result<Arc<dyn Model>, BoxError> {
        if model_id != MODEL_ID {
            Err(format!("no model named {model_id}"))?
        }
        let model: Arc<dyn Model> = self.model.clone();
        Ok(model)
    }
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<(SocketAddr, WorkerState)>>,
    progress: AtomicUsize,
}

impl Recorder {
    fn states_of(&self, worker: SocketAddr) -> Vec<WorkerState> {
        self.states
            .lock()
            .iter()
            .filter(|(addr, _)| *addr == worker)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl EventSink for Recorder {
    fn on_progress(&self, _session: SessionId, _remaining: usize) {
        self.progress.fetch_add(1, Ordering::SeqCst);
    }

    fn on_worker_state(&self, worker: SocketAddr, state: WorkerState) {
        self.states.lock().push((worker, state));
    }
}

struct TestWorker {
    addr: SocketAddr,
    loader: Arc<ModelLoader>,
    serve: JoinHandle<()>,
}

async fn spawn_worker<F>(stall: F) -> TestWorker
where
    F: Fn(usize, u64) -> bool + Send + Sync + 'static,
{
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let model = Arc::new(SleepModel {
        calls: AtomicUsize::new(0),
        stall: Box::new(stall),
    });
    let server = WorkerServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(SleepResolver { model }),
    )
    .await
    .unwrap();
    TestWorker {
        addr: server.local_addr().unwrap(),
        loader: server.loader(),
        serve: tokio::spawn(server.serve()),
    }
}

fn never(_call: usize, _id: u64) -> bool {
    false
}

fn dispatcher(events: Arc<Recorder>) -> NetworkDispatcher<Sleep> {
    let config = NetworkConfig::builder()
        .probe_timeout(Duration::from_millis(500))
        .build();
    NetworkDispatcher::with_events(
        config,
        ModelUpload::new(MODEL_ID, b"sleep v1".to_vec()),
        Arc::new(SleepCodec),
        events,
    )
    .unwrap()
}

/// Opens a session that records the id of every result it receives.
fn recording_session(
    dispatcher: &NetworkDispatcher<Sleep>,
    expected: usize,
) -> (Session<Sleep>, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let session = {
        let seen = seen.clone();
        dispatcher.new_session(expected, move |t: Trajectory<u64>| seen.lock().push(t.value))
    };
    (session, seen)
}

async fn complete(dispatcher: &NetworkDispatcher<Sleep>, session: &Session<Sleep>) {
    timeout(PATIENCE, dispatcher.await_completion(session))
        .await
        .expect("session did not complete");
}

fn sorted(seen: &Mutex<Vec<u64>>) -> Vec<u64> {
    let mut ids = seen.lock().clone();
    ids.sort_unstable();
    ids
}

#[tokio::test(flavor = "multi_thread")]
async fn single_worker_runs_a_session() {
    let worker = spawn_worker(never).await;
    let events = Arc::new(Recorder::default());
    let dispatcher = dispatcher(events.clone());
    dispatcher.add_worker(worker.addr).await.unwrap();

    let (session, seen) = recording_session(&dispatcher, 10);
    for id in 0..10 {
        dispatcher.submit(&session, Sleep { id, millis: 5 });
    }
    complete(&dispatcher, &session).await;

    assert_eq!(sorted(&seen), (0..10).collect::<Vec<_>>());
    assert_eq!(session.expected(), 0);
    assert_eq!(session.reached(), 5);
    // progress is reported right after each fold, possibly after the waiter woke
    timeout(PATIENCE, async {
        while events.progress.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("progress events missing");

    let workers = dispatcher.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].addr, worker.addr);
    assert_eq!(workers[0].state, WorkerState::Active);
    assert!(workers[0].expected_tasks > 1);

    assert_eq!(worker.loader.len().await, 1);
    dispatcher.close().await;
    assert!(worker.loader.is_empty().await);
    assert!(dispatcher.workers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_round_is_retried_after_a_successful_recheck() {
    let stalled = AtomicBool::new(false);
    let worker =
        spawn_worker(move |_, id| id == 10 && !stalled.swap(true, Ordering::SeqCst)).await;
    let events = Arc::new(Recorder::default());
    let dispatcher = dispatcher(events.clone());
    dispatcher.add_worker(worker.addr).await.unwrap();

    // one round of one task, then one round of two: the window doubles twice
    let (warm_up, _) = recording_session(&dispatcher, 3);
    for id in 0..3 {
        dispatcher.submit(&warm_up, Sleep { id, millis: 1 });
    }
    complete(&dispatcher, &warm_up).await;
    assert_eq!(dispatcher.workers()[0].expected_tasks, 4);

    let (session, seen) = recording_session(&dispatcher, 1);
    dispatcher.submit(&session, Sleep { id: 10, millis: 1 });
    complete(&dispatcher, &session).await;

    assert_eq!(*seen.lock(), vec![10]);
    assert_eq!(
        events.states_of(worker.addr),
        vec![WorkerState::Active, WorkerState::Probing, WorkerState::Active]
    );
    // halved to two by the re-check, doubled back by the retried round
    let snapshot = dispatcher.workers().remove(0);
    assert_eq!(snapshot.state, WorkerState::Active);
    assert_eq!(snapshot.expected_tasks, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_task_is_dropped_without_a_recheck() {
    let worker = spawn_worker(never).await;
    let events = Arc::new(Recorder::default());
    let dispatcher = dispatcher(events.clone());
    dispatcher.add_worker(worker.addr).await.unwrap();

    let (session, seen) = recording_session(&dispatcher, 6);
    for id in [0, 1, BROKEN_ID, 2, 3, 4] {
        dispatcher.submit(&session, Sleep { id, millis: 5 });
    }
    complete(&dispatcher, &session).await;

    assert_eq!(sorted(&seen), vec![0, 1, 2, 3, 4]);
    assert_eq!(session.expected(), 0);
    assert_eq!(events.states_of(worker.addr), vec![WorkerState::Active]);
    assert_eq!(dispatcher.workers()[0].state, WorkerState::Active);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_recheck_removes_the_worker() {
    let flaky = spawn_worker(|call, _| call > 0).await;
    let steady = spawn_worker(never).await;
    let events = Arc::new(Recorder::default());
    let dispatcher = dispatcher(events.clone());
    dispatcher.add_worker(flaky.addr).await.unwrap();
    dispatcher.add_worker(steady.addr).await.unwrap();

    // the established connection keeps working, but nothing new is accepted
    flaky.serve.abort();
    let _ = flaky.serve.await;

    let (first, seen) = recording_session(&dispatcher, 40);
    for id in 0..40 {
        dispatcher.submit(&first, Sleep { id, millis: 20 });
    }
    complete(&dispatcher, &first).await;
    assert_eq!(sorted(&seen), (0..40).collect::<Vec<_>>());

    timeout(PATIENCE, async {
        while events.states_of(flaky.addr).last() != Some(&WorkerState::Removed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker was never removed");

    let (second, seen) = recording_session(&dispatcher, 10);
    for id in 100..110 {
        dispatcher.submit(&second, Sleep { id, millis: 5 });
    }
    complete(&dispatcher, &second).await;
    assert_eq!(sorted(&seen), (100..110).collect::<Vec<_>>());

    assert_eq!(
        events.states_of(flaky.addr),
        vec![WorkerState::Active, WorkerState::Probing, WorkerState::Removed]
    );
    let flaky_state = dispatcher
        .workers()
        .into_iter()
        .find(|worker| worker.addr == flaky.addr)
        .map(|worker| worker.state);
    assert_eq!(flaky_state, Some(WorkerState::Removed));
}

#[tokio::test(flavor = "multi_thread")]
async fn late_session_is_not_starved() {
    let worker = spawn_worker(never).await;
    let dispatcher = dispatcher(Arc::new(Recorder::default()));
    dispatcher.add_worker(worker.addr).await.unwrap();

    let (big, _) = recording_session(&dispatcher, 200);
    for id in 0..200 {
        dispatcher.submit(&big, Sleep { id, millis: 5 });
    }
    let (small, seen) = recording_session(&dispatcher, 1);
    dispatcher.submit(&small, Sleep { id: 1000, millis: 5 });

    complete(&dispatcher, &small).await;
    assert_eq!(*seen.lock(), vec![1000]);
    assert!(big.expected() > 0);

    complete(&dispatcher, &big).await;
    assert_eq!(big.expected(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_that_cannot_install_the_model_is_rejected() {
    let worker = spawn_worker(never).await;
    let dispatcher: NetworkDispatcher<Sleep> = NetworkDispatcher::new(
        NetworkConfig::default(),
        ModelUpload::new("unknown", vec![]),
        Arc::new(SleepCodec),
    )
    .unwrap();

    match dispatcher.add_worker(worker.addr).await {
        Err(Error::InitRejected(reason)) => assert!(reason.contains("no model named unknown")),
        other => panic!("expected the worker to reject the upload, got {:?}", other),
    }
    assert!(dispatcher.workers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_worker_is_an_error() {
    let worker = spawn_worker(never).await;
    let addr = worker.addr;
    worker.serve.abort();
    let _ = worker.serve.await;

    let dispatcher = dispatcher(Arc::new(Recorder::default()));
    assert!(matches!(
        dispatcher.add_worker(addr).await,
        Err(Error::Io(_)) | Err(Error::TimedOut(_))
    ));
}
