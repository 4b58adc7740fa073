use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use futures::future::join_all;
use tokio::{net::TcpListener, task};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    channel::Channel,
    error::Error,
    model::{ModelLoader, ModelResolver},
    wire::{ComputationResult, InitStatus, Message, NetworkTask, TaskFailure, TrajectoryRecord},
};

/// Serves masters on one listening socket. Every accepted connection runs
/// its own command loop; all of them share one model loader.
pub struct WorkerServer {
    listener: TcpListener,
    loader: Arc<ModelLoader>,
}

impl WorkerServer {
    pub async fn bind(addr: SocketAddr, resolver: Arc<dyn ModelResolver>) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            loader: Arc::new(ModelLoader::new(resolver)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub fn loader(&self) -> Arc<ModelLoader> {
        self.loader.clone()
    }

    /// Accepts connections and spawns a task to handle each of them.
    /// This runs until the task driving it is dropped, so it should be
    /// spawned in a dedicated task.
    pub async fn serve(self) {
        info!(addr = ?self.listener.local_addr().ok(), "worker listening");
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let channel = match Channel::from_stream(stream) {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(%remote, error = %e, "failed to set up connection");
                    continue;
                }
            };
            let loader = self.loader.clone();
            tokio::spawn(
                async move {
                    debug!("master connected");
                    match handle_connection(channel, loader).await {
                        Ok(()) => debug!("connection closed"),
                        Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            debug!("master hung up")
                        }
                        Err(e) => warn!(error = %e, "connection terminated"),
                    }
                }
                .instrument(debug_span!("connection", %remote)),
            );
        }
    }
}

async fn handle_connection(mut channel: Channel, loader: Arc<ModelLoader>) -> Result<(), Error> {
    loop {
        match channel.receive().await? {
            Message::Ping => channel.send(&Message::Pong).await?,
            Message::Init(upload) => match loader.install(&upload).await {
                Ok(()) => {
                    channel
                        .send(&Message::InitAck(InitStatus::Installed))
                        .await?
                }
                Err(e) => {
                    channel
                        .send(&Message::InitAck(InitStatus::Failed(e.to_string())))
                        .await?;
                    return Err(e);
                }
            },
            Message::Task(batch) => {
                let reply = match run_batch(&loader, batch).await? {
                    Ok(result) => Message::Result(result),
                    Err(failure) => {
                        warn!(task = failure.index, reason = %failure.reason, "task failed");
                        Message::TaskFailed(failure)
                    }
                };
                channel.send(&reply).await?;
            }
            Message::CloseConnection(model_id) => {
                loader.uninstall(&model_id).await;
                channel.send(&Message::Closed).await?;
                return Ok(());
            }
            other => Err(Error::UnexpectedMessage(other.msg_type()))?,
        }
    }
}

/// Runs every task of a batch concurrently on the blocking pool. Records come
/// back in task order. A task that fails is reported instead of the records;
/// only a missing model is an error of the connection.
async fn run_batch(
    loader: &ModelLoader,
    batch: NetworkTask,
) -> Result<Result<ComputationResult, TaskFailure>, Error> {
    let model = loader.get(&batch.model_id).await?;
    let size = batch.tasks.len();
    let started = Instant::now();

    let handles = batch.tasks.into_iter().map(|payload| {
        let model = model.clone();
        task::spawn_blocking(move || {
            let started = Instant::now();
            model
                .run(&payload)
                .map(|outcome| {
                    TrajectoryRecord::new(outcome.value, started.elapsed(), outcome.reached_goal)
                })
                .map_err(|e| e.to_string())
        })
    });

    let mut trajectories = Vec::with_capacity(size);
    for (index, joined) in join_all(handles).await.into_iter().enumerate() {
        match joined.map_err(|e| e.to_string()).and_then(|record| record) {
            Ok(record) => trajectories.push(record),
            Err(reason) => {
                return Ok(Err(TaskFailure {
                    index: index as u32,
                    reason,
                }))
            }
        }
    }
    trace!(tasks = size, elapsed = ?started.elapsed(), "batch finished");
    Ok(Ok(ComputationResult { trajectories }))
}
