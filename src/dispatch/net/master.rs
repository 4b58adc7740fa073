use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{runtime::Handle, time::timeout};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use super::{
    channel::{Channel, ChannelId},
    error::Error,
    model::TaskCodec,
    tracker::{WorkerSnapshot, WorkerState, WorkerTracker},
    wire::{
        ComputationResult, InitStatus, Message, MessageType, ModelUpload, NetworkTask,
        TrajectoryRecord,
    },
};
use crate::{
    config::NetworkConfig,
    dispatch::{
        events::{EventSink, NoopSink},
        session::Session,
        task::{Task, Trajectory},
        Dispatcher,
    },
};

/// Runs sessions on remote workers.
///
/// Every worker receives batches sized by its [`WorkerTracker`]. A failed
/// round puts its batch back at the front of the session and re-checks the
/// worker on a fresh connection; a worker that fails the re-check is removed
/// for good. A task that fails on its own, because it cannot be encoded or
/// because the model returned an error for it, is dropped and never sent
/// again.
///
/// Must be created inside a tokio runtime. `submit` may then be called from
/// any thread.
pub struct NetworkDispatcher<T: Task> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Task> {
    config: NetworkConfig,
    upload: ModelUpload,
    codec: Arc<dyn TaskCodec<T>>,
    registry: Mutex<Registry<T>>,
    in_flight: AtomicUsize,
    next_session: AtomicU64,
    events: Arc<dyn EventSink>,
    runtime: Handle,
}

/// Workers and the session rotation. Locked before any session.
struct Registry<T: Task> {
    trackers: HashMap<ChannelId, WorkerTracker>,
    idle: VecDeque<Channel>,
    sessions: VecDeque<Session<T>>,
}

/// One batch on its way to one worker.
struct Round<T: Task> {
    channel: Channel,
    addr: SocketAddr,
    session: Session<T>,
    batch: Vec<T>,
}

impl<T: Task> NetworkDispatcher<T> {
    pub fn new(
        config: NetworkConfig,
        upload: ModelUpload,
        codec: Arc<dyn TaskCodec<T>>,
    ) -> Result<Self, Error> {
        Self::with_events(config, upload, codec, Arc::new(NoopSink))
    }

    pub fn with_events(
        config: NetworkConfig,
        upload: ModelUpload,
        codec: Arc<dyn TaskCodec<T>>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, Error> {
        let runtime = Handle::try_current()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                upload,
                codec,
                registry: Mutex::new(Registry {
                    trackers: HashMap::new(),
                    idle: VecDeque::new(),
                    sessions: VecDeque::new(),
                }),
                in_flight: AtomicUsize::new(0),
                next_session: AtomicU64::new(0),
                events,
                runtime,
            }),
        })
    }

    /// Connects to a worker and installs the model on it. The worker only
    /// joins the pool once it acknowledged the upload.
    pub async fn add_worker(&self, addr: SocketAddr) -> Result<(), Error> {
        let shared = &self.shared;
        let channel = connect_and_init(&shared.config, &shared.upload, addr).await?;
        let tracker = WorkerTracker::new(addr, channel.id(), shared.config.tracker.clone());
        {
            let mut registry = shared.registry.lock();
            registry.trackers.insert(channel.id(), tracker);
            registry.idle.push_back(channel);
        }
        info!(%addr, model = %shared.upload.model_id, "worker registered");
        shared.events.on_worker_state(addr, WorkerState::Active);
        shared.schedule();
        Ok(())
    }

    /// Every worker ever registered, ordered by address.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> = self
            .shared
            .registry
            .lock()
            .trackers
            .values()
            .map(WorkerTracker::snapshot)
            .collect();
        workers.sort_by_key(|worker| worker.addr);
        workers
    }

    /// Number of rounds currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Asks every idle worker to unload the model and hangs up on it.
    /// Workers with a round in flight are left alone, so this is meant to be
    /// called once all sessions are complete.
    pub async fn close(&self) {
        let idle: Vec<Channel> = {
            let mut registry = self.shared.registry.lock();
            let idle: Vec<Channel> = registry.idle.drain(..).collect();
            for channel in &idle {
                registry.trackers.remove(&channel.id());
            }
            idle
        };
        let model_id = &self.shared.upload.model_id;
        for mut channel in idle {
            let addr = channel.remote_addr();
            channel.set_read_timeout(Some(self.shared.config.probe_timeout));
            let closed = async {
                channel
                    .send(&Message::CloseConnection(model_id.clone()))
                    .await?;
                match channel.receive().await? {
                    Message::Closed => Ok(()),
                    other => Err(Error::UnexpectedMessage(other.msg_type())),
                }
            }
            .await;
            match closed {
                Ok(()) => debug!(%addr, "worker closed"),
                Err(e) => warn!(%addr, error = %e, "worker did not acknowledge close"),
            }
            let _ = channel.close().await;
        }
    }
}

impl<T: Task> Dispatcher<T> for NetworkDispatcher<T> {
    fn new_session<F>(&self, expected: usize, consumer: F) -> Session<T>
    where
        F: FnMut(Trajectory<T::Output>) + Send + 'static,
    {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(id, expected, consumer)
    }

    fn submit(&self, session: &Session<T>, task: T) {
        session.push(task);
        self.shared.registry.lock().enroll(session);
        self.shared.schedule();
    }
}

impl<T: Task> Registry<T> {
    /// Puts a session with queued work back into the rotation unless it is
    /// already there.
    fn enroll(&mut self, session: &Session<T>) {
        if !self.sessions.iter().any(|s| s.same_as(session)) {
            self.sessions.push_back(session.clone());
        }
    }

    /// Pairs the next idle worker with the next session that has queued
    /// tasks. Sessions found empty leave the rotation.
    fn next_round(&mut self) -> Option<Round<T>> {
        while !self.sessions.is_empty() {
            let mut channel = self.idle.pop_front()?;
            let Some(tracker) = self.trackers.get(&channel.id()) else {
                // the worker was closed while this channel sat idle
                continue;
            };
            let addr = tracker.addr();
            let window = tracker.expected_tasks();
            let count = if tracker.can_complete_task(window) {
                window
            } else {
                (window / 2).max(1)
            };
            channel.set_read_timeout(tracker.timeout());

            while let Some(session) = self.sessions.pop_front() {
                let batch = session.take(count);
                if batch.is_empty() {
                    continue;
                }
                if session.has_pending() {
                    self.sessions.push_back(session.clone());
                }
                return Some(Round {
                    channel,
                    addr,
                    session,
                    batch,
                });
            }
            self.idle.push_front(channel);
            return None;
        }
        None
    }

    fn live_workers(&self) -> usize {
        self.trackers
            .values()
            .filter(|tracker| tracker.state() != WorkerState::Removed)
            .count()
    }
}

impl<T: Task> Shared<T> {
    /// Starts a round for every idle worker that can be given work.
    fn schedule(self: &Arc<Self>) {
        loop {
            let round = self.registry.lock().next_round();
            let Some(round) = round else {
                break;
            };
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let span = debug_span!(
                "round",
                worker = %round.addr,
                session = round.session.id(),
                tasks = round.batch.len()
            );
            let shared = self.clone();
            self.runtime.spawn(shared.run_round(round).instrument(span));
        }
    }

    async fn run_round(self: Arc<Self>, round: Round<T>) {
        let Round {
            mut channel,
            addr,
            session,
            batch,
        } = round;
        let sent = batch.len();

        // tasks are encoded up front, none of them may be borrowed across an
        // await
        let request = self.encode(&batch);
        let started = Instant::now();
        let reply = match request {
            Ok(request) => exchange(&mut channel, request, sent).await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        match reply {
            Ok(result) => {
                {
                    let mut registry = self.registry.lock();
                    if let Some(tracker) = registry.trackers.get_mut(&channel.id()) {
                        tracker.update(sent, elapsed);
                        trace!(
                            ?elapsed,
                            window = tracker.expected_tasks(),
                            rtt = ?tracker.estimated_rtt(),
                            "round finished"
                        );
                    }
                    registry.idle.push_back(channel);
                }
                drop(batch);
                for record in result.trajectories {
                    let remaining = match self.decode(record) {
                        Ok(trajectory) => session.fold(trajectory),
                        Err(e) => {
                            error!(error = %e, "result could not be decoded, dropping its task");
                            session.discard()
                        }
                    };
                    self.events.on_progress(session.id(), remaining);
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.schedule();
            }
            Err(Error::TaskFailed { index, reason }) => {
                self.drop_failed_task(channel, session, batch, index, &reason)
            }
            Err(e) => self.recover(channel, addr, session, batch, e).await,
        }
    }

    /// The worker is fine but one task of the batch is not. That task is
    /// dropped, the rest goes back to the front of the session and the
    /// channel returns to the idle list.
    fn drop_failed_task(
        self: &Arc<Self>,
        channel: Channel,
        session: Session<T>,
        mut batch: Vec<T>,
        index: usize,
        reason: &str,
    ) {
        error!(task = index, reason, "task failed, dropping it");
        if index < batch.len() {
            drop(batch.remove(index));
            let remaining = session.discard();
            self.events.on_progress(session.id(), remaining);
        }
        {
            let mut registry = self.registry.lock();
            session.requeue(batch);
            registry.enroll(&session);
            registry.idle.push_back(channel);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.schedule();
    }

    /// Requeues the batch of a failed round, then re-checks the worker on a
    /// new connection.
    async fn recover(
        self: Arc<Self>,
        channel: Channel,
        addr: SocketAddr,
        session: Session<T>,
        batch: Vec<T>,
        cause: Error,
    ) {
        warn!(error = %cause, "round failed, re-checking worker");
        let old_id = channel.id();
        drop(channel);
        {
            let mut registry = self.registry.lock();
            if let Some(tracker) = registry.trackers.get_mut(&old_id) {
                tracker.mark_probing();
            }
            session.requeue(batch);
            registry.enroll(&session);
        }
        self.events.on_worker_state(addr, WorkerState::Probing);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.schedule();

        match probe(&self.config, &self.upload, addr).await {
            Ok(channel) => {
                let migrated = {
                    let mut registry = self.registry.lock();
                    match registry.trackers.remove(&old_id) {
                        Some(mut tracker) => {
                            tracker.force_expired_time_limit();
                            let migrated = tracker.migrate(channel.id());
                            let id = if migrated { channel.id() } else { old_id };
                            registry.trackers.insert(id, tracker);
                            if migrated {
                                registry.idle.push_back(channel);
                            }
                            migrated
                        }
                        None => false,
                    }
                };
                if migrated {
                    info!("worker answered the re-check, back in rotation");
                    self.events.on_worker_state(addr, WorkerState::Active);
                }
            }
            Err(e) => {
                let live = {
                    let mut registry = self.registry.lock();
                    if let Some(tracker) = registry.trackers.get_mut(&old_id) {
                        tracker.mark_removed();
                    }
                    registry.live_workers()
                };
                warn!(error = %e, "worker failed the re-check, removing it");
                self.events.on_worker_state(addr, WorkerState::Removed);
                if live == 0 {
                    error!("every worker has been removed, queued tasks will not run until one is added");
                }
            }
        }
        self.schedule();
    }

    fn encode(&self, batch: &[T]) -> Result<Message, Error> {
        let tasks = batch
            .iter()
            .enumerate()
            .map(|(index, task)| {
                self.codec
                    .encode_task(task)
                    .map_err(|e| Error::TaskFailed {
                        index,
                        reason: format!("could not encode task: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Message::Task(NetworkTask {
            model_id: self.upload.model_id.clone(),
            tasks,
        }))
    }

    fn decode(&self, record: TrajectoryRecord) -> Result<Trajectory<T::Output>, Error> {
        let value = self
            .codec
            .decode_output(&record.payload)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Trajectory {
            value,
            elapsed: record.elapsed(),
            reached_goal: record.reached_goal,
        })
    }
}

/// Sends one batch and waits for its result under the channel's deadline.
async fn exchange(
    channel: &mut Channel,
    request: Message,
    sent: usize,
) -> Result<ComputationResult, Error> {
    channel.send(&request).await?;
    match channel.receive().await? {
        Message::Result(result) if result.trajectories.len() == sent => Ok(result),
        Message::Result(result) => Err(Error::BatchSizeMismatch {
            sent,
            received: result.trajectories.len(),
        }),
        Message::TaskFailed(failure) if (failure.index as usize) < sent => {
            Err(Error::TaskFailed {
                index: failure.index as usize,
                reason: failure.reason,
            })
        }
        Message::TaskFailed(_) => Err(Error::UnexpectedMessage(MessageType::TaskFailed)),
        other => Err(Error::UnexpectedMessage(other.msg_type())),
    }
}

async fn connect_and_init(
    config: &NetworkConfig,
    upload: &ModelUpload,
    addr: SocketAddr,
) -> Result<Channel, Error> {
    let mut channel = timeout(config.connect_timeout, Channel::connect(addr))
        .await
        .map_err(|_| Error::TimedOut(config.connect_timeout))??;
    channel.set_read_timeout(Some(config.init_timeout));
    channel.send(&Message::Init(upload.clone())).await?;
    match channel.receive().await? {
        Message::InitAck(InitStatus::Installed) => {}
        Message::InitAck(InitStatus::Failed(reason)) => Err(Error::InitRejected(reason))?,
        other => Err(Error::UnexpectedMessage(other.msg_type()))?,
    }
    channel.set_read_timeout(None);
    Ok(channel)
}

/// A fresh connection that installed the model and answered a ping in time.
async fn probe(
    config: &NetworkConfig,
    upload: &ModelUpload,
    addr: SocketAddr,
) -> Result<Channel, Error> {
    let mut channel = connect_and_init(config, upload, addr).await?;
    channel.set_read_timeout(Some(config.probe_timeout));
    channel.send(&Message::Ping).await?;
    match channel.receive().await? {
        Message::Pong => Ok(channel),
        other => Err(Error::UnexpectedMessage(other.msg_type())),
    }
}
