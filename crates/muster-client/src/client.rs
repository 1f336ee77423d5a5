//! Group membership
//!
//! [`GroupClient`] is one member of a consumer group. A single coordination
//! task owns all membership state and drives the join / sync / heartbeat
//! cycle against the broker coordinating the group:
//!
//! ```text
//!  finding-coordinator ──► joining ──► syncing ──► steady ──► (heartbeats)
//!        ▲    ▲               │            │          │
//!        │    └── paused ◄────┴────────────┴──────────┤  protocol error
//!        └────────────────────────────────────────────┘  stale coordinator
//! ```
//!
//! Every successful sync distributes a [`GenerationAssignment`] to the
//! topic workers over single-slot overwrite-latest channels; workers
//! reconcile their partition readers against it on their own time. Topic
//! subscriptions and worker deregistrations arrive over a command mailbox
//! and trigger a rejoin so the group can re-cover the changed topic set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muster_protocol::{
    Broker, HeartbeatRequest, JoinGroupRequest, KafkaClient, KafkaCode, LeaveGroupRequest,
    SyncGroupRequest, PROTOCOL_TYPE,
};

use crate::config::GroupConfig;
use crate::consumer::{spawn_worker, TopicConsumer, WorkerHandle, WorkerSpec};
use crate::error::{ClientError, Result};

/// Backoff after a failed coordination attempt, so a broken broker is not
/// hammered in a tight loop.
const FAILURE_PAUSE: Duration = Duration::from_secs(1);

/// Capacity of the asynchronous error channel; errors beyond it are
/// dropped rather than blocking coordination.
const ERROR_CHANNEL_CAPACITY: usize = 10;

/// A Kafka client participating in a consumer group.
///
/// Construct one with [`connect`](GroupClient::connect), subscribe topics
/// with [`subscribe`](GroupClient::subscribe), and watch
/// [`errors`](GroupClient::errors) for asynchronous coordination failures.
/// Call [`close`](GroupClient::close) after every topic consumer has
/// finished its async-close.
pub struct GroupClient {
    group: String,
    cmd_tx: mpsc::Sender<Command>,
    errors: Option<mpsc::Receiver<ClientError>>,
    close: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GroupClient {
    /// Join `group` on top of an existing Kafka client.
    ///
    /// Returns once the first JoinGroup response arrives: a successful
    /// response means basic communication with the group coordinator works
    /// and the client is live (even if a later sync fails), any earlier
    /// failure is returned here. After that, failures are reported on the
    /// [`errors`](GroupClient::errors) channel.
    pub async fn connect(
        group: impl Into<String>,
        config: GroupConfig,
        kafka: Arc<dyn KafkaClient>,
    ) -> Result<GroupClient> {
        let group = group.into();
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let close = CancellationToken::new();
        let (early_tx, early_rx) = oneshot::channel();

        let coordination = Coordination {
            group: group.clone(),
            config,
            kafka,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            errors_tx,
            close: close.clone(),
            member_id: String::new(),
            workers: HashMap::new(),
            next_worker_id: 0,
        };
        let task = tokio::spawn(coordination.run(early_tx));

        match early_rx.await {
            Ok(Ok(())) => Ok(GroupClient {
                group,
                cmd_tx,
                errors: Some(errors_rx),
                close,
                task: Some(task),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// The consumer-group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Subscribe to `topic`, returning its consumer. At most one consumer
    /// per topic per client: the 0.9 group protocol cannot express
    /// consuming a topic twice from the same member, so a second subscribe
    /// fails with [`ClientError::AlreadySubscribed`].
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<TopicConsumer> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: topic.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Take the asynchronous error channel. Worth monitoring: coordination
    /// retries internally, and this channel is where it says why. The
    /// channel closes when the client closes. May be called once; later
    /// calls return a channel that is already closed.
    pub fn errors(&mut self) -> mpsc::Receiver<ClientError> {
        self.errors.take().unwrap_or_else(|| {
            let (tx, rx) = mpsc::channel(1);
            drop(tx);
            rx
        })
    }

    /// Close the client: leave the group, close every remaining topic
    /// worker (committing their acknowledged offsets), then close the
    /// error channel. Does not touch the underlying Kafka client.
    pub async fn close(mut self) {
        self.close.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for GroupClient {
    fn drop(&mut self) {
        // A dropped-without-close client still tears down in the
        // background.
        self.close.cancel();
    }
}

/// Requests handled by the coordination task.
pub(crate) enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<TopicConsumer>>,
    },
    Deregister {
        topic: String,
        worker_id: u64,
    },
}

/// Everything a topic worker needs to know about the current generation,
/// published on every successful sync.
pub(crate) struct GenerationAssignment {
    pub(crate) generation_id: i32,
    pub(crate) member_id: String,
    pub(crate) coordinator: Arc<dyn Broker>,
    /// topic -> partitions owned by this member.
    pub(crate) assignments: HashMap<String, Vec<i32>>,
}

/// The coordination task: single owner of membership state.
struct Coordination {
    group: String,
    config: GroupConfig,
    kafka: Arc<dyn KafkaClient>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    errors_tx: mpsc::Sender<ClientError>,
    close: CancellationToken,

    /// Broker-assigned member id, empty until the first join and reused on
    /// every rejoin from then on.
    member_id: String,
    workers: HashMap<String, WorkerHandle>,
    next_worker_id: u64,
}

impl Coordination {
    async fn run(mut self, early: oneshot::Sender<Result<()>>) {
        let mut early = Some(early);
        let mut pause = false;

        loop {
            // Rejoin the group each time it re-forms.
            'join: loop {
                if std::mem::take(&mut pause) && !self.backoff_pause().await {
                    return self.shutdown().await;
                }
                if self.close.is_cancelled() {
                    return self.shutdown().await;
                }

                let coordinator = match self.kafka.coordinator(&self.group).await {
                    Ok(coordinator) => coordinator,
                    Err(e) => {
                        let error = ClientError::Coordinator {
                            group: self.group.clone(),
                            context: "contacting group coordinator",
                            source: e,
                        };
                        if let Some(early) = early.take() {
                            let _ = early.send(Err(error));
                            return self.shutdown().await;
                        }
                        self.deliver(error);
                        pause = true;
                        break 'join;
                    }
                };

                let mut join_req = JoinGroupRequest {
                    group_id: self.group.clone(),
                    session_timeout_ms: self.config.session_timeout.as_millis() as i32,
                    rebalance_timeout_ms: self.config.rebalance_timeout.as_millis() as i32,
                    member_id: self.member_id.clone(),
                    protocol_type: PROTOCOL_TYPE.to_string(),
                    protocols: Vec::new(),
                };
                let mut topics: Vec<String> = self.workers.keys().cloned().collect();
                topics.sort_unstable();
                self.config.partitioner.prepare_join(&mut join_req, &topics);

                let join_resp = match coordinator.join_group(join_req).await {
                    Err(e) => {
                        debug!(group = %self.group, error = %e, "JoinGroup failed; refreshing coordinator");
                        pause = true;
                        break 'join;
                    }
                    Ok(resp) if resp.error == KafkaCode::NotCoordinator => break 'join,
                    Ok(resp) if !resp.error.is_none() => {
                        let error = ClientError::Protocol {
                            group: self.group.clone(),
                            context: "joining group",
                            code: resp.error,
                        };
                        if let Some(early) = early.take() {
                            let _ = early.send(Err(error));
                            return self.shutdown().await;
                        }
                        self.deliver(error);
                        pause = true;
                        continue 'join;
                    }
                    Ok(resp) => resp,
                };

                // A join response proves basic communication works;
                // release the constructor.
                if let Some(early) = early.take() {
                    let _ = early.send(Ok(()));
                }

                self.member_id = join_resp.member_id.clone();
                let generation_id = join_resp.generation_id;

                let mut sync_req = SyncGroupRequest {
                    group_id: self.group.clone(),
                    generation_id,
                    member_id: self.member_id.clone(),
                    assignments: Vec::new(),
                };

                // As leader, compute the whole group's assignment and embed
                // it in the sync exchange. Our own share comes back in the
                // sync response below, decoded exactly like a follower's.
                if join_resp.is_leader() {
                    debug!(
                        group = %self.group,
                        generation = generation_id,
                        members = join_resp.members.len(),
                        "Elected leader; partitioning"
                    );
                    if let Err(error) = self
                        .config
                        .partitioner
                        .partition(&mut sync_req, &join_resp, self.kafka.as_ref())
                        .await
                    {
                        // The generation cannot form without assignments.
                        self.deliver(error);
                        pause = true;
                        continue 'join;
                    }
                }

                let sync_resp = match coordinator.sync_group(sync_req).await {
                    Err(e) => {
                        debug!(group = %self.group, error = %e, "SyncGroup failed; refreshing coordinator");
                        pause = true;
                        break 'join;
                    }
                    Ok(resp) if resp.error == KafkaCode::NotCoordinator => break 'join,
                    Ok(resp) if !resp.error.is_none() => {
                        self.deliver(ClientError::Protocol {
                            group: self.group.clone(),
                            context: "synchronizing group",
                            code: resp.error,
                        });
                        pause = true;
                        continue 'join;
                    }
                    Ok(resp) => resp,
                };

                let assignments = match self.config.partitioner.parse_sync(&sync_resp) {
                    Ok(assignments) => assignments,
                    Err(error) => {
                        self.deliver(error);
                        pause = true;
                        continue 'join;
                    }
                };

                info!(
                    group = %self.group,
                    generation = generation_id,
                    member = %self.member_id,
                    assignments = ?assignments,
                    "Joined group"
                );

                // Hand the new generation to every topic worker. The watch
                // slot keeps only the newest value, which is the only one
                // that matters.
                let assignment = Arc::new(GenerationAssignment {
                    generation_id,
                    member_id: self.member_id.clone(),
                    coordinator: Arc::clone(&coordinator),
                    assignments,
                });
                for worker in self.workers.values() {
                    let _ = worker.assign_tx.send(Some(Arc::clone(&assignment)));
                }

                // Steady state: heartbeat until the group changes under us.
                loop {
                    tokio::select! {
                        _ = self.close.cancelled() => {
                            self.leave_group(&coordinator).await;
                            return self.shutdown().await;
                        }

                        _ = sleep(self.config.heartbeat_interval) => {
                            let req = HeartbeatRequest {
                                group_id: self.group.clone(),
                                generation_id,
                                member_id: self.member_id.clone(),
                            };
                            // The next heartbeat is only armed once this
                            // one is answered; a slow broker slows us down
                            // instead of piling up requests.
                            match coordinator.heartbeat(req).await {
                                Err(e) => {
                                    debug!(group = %self.group, error = %e, "Heartbeat failed; refreshing coordinator");
                                    pause = true;
                                    break 'join;
                                }
                                Ok(resp) if resp.error == KafkaCode::NotCoordinator => {
                                    debug!(group = %self.group, "Coordinator moved; refreshing");
                                    break 'join;
                                }
                                Ok(resp) if !resp.error.is_none() => {
                                    self.deliver(ClientError::Protocol {
                                        group: self.group.clone(),
                                        context: "heartbeating",
                                        code: resp.error,
                                    });
                                    pause = true;
                                    continue 'join;
                                }
                                Ok(_) => {}
                            }
                        }

                        Some(cmd) = self.cmd_rx.recv() => match cmd {
                            Command::Subscribe { topic, reply } => {
                                self.add_worker(topic, reply).await;
                                // Rejoin so the group covers the new topic.
                                continue 'join;
                            }
                            Command::Deregister { topic, worker_id } => {
                                self.remove_worker(&topic, worker_id).await;
                                continue 'join;
                            }
                        },
                    }
                }
            }

            // The cached coordinator is suspect; force a fresh lookup
            // before the next join attempt.
            if let Err(e) = self.kafka.refresh_coordinator(&self.group).await {
                let error = ClientError::Coordinator {
                    group: self.group.clone(),
                    context: "refreshing group coordinator",
                    source: e,
                };
                if let Some(early) = early.take() {
                    let _ = early.send(Err(error));
                    return self.shutdown().await;
                }
                self.deliver(error);
                pause = true;
            }
        }
    }

    /// Wait out the failure pause, still accepting subscribe and
    /// deregister traffic. Returns `false` when the client closed.
    async fn backoff_pause(&mut self) -> bool {
        let deadline = sleep(FAILURE_PAUSE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                _ = self.close.cancelled() => return false,
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    Command::Subscribe { topic, reply } => self.add_worker(topic, reply).await,
                    Command::Deregister { topic, worker_id } => {
                        self.remove_worker(&topic, worker_id).await;
                    }
                },
            }
        }
    }

    async fn add_worker(&mut self, topic: String, reply: oneshot::Sender<Result<TopicConsumer>>) {
        if self.workers.contains_key(&topic) {
            let _ = reply.send(Err(ClientError::AlreadySubscribed(topic)));
            return;
        }
        let source = match self.kafka.topic_source(&topic).await {
            Ok(source) => source,
            Err(e) => {
                let _ = reply.send(Err(ClientError::Coordinator {
                    group: self.group.clone(),
                    context: "opening topic source",
                    source: e,
                }));
                return;
            }
        };

        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let (consumer, handle) = spawn_worker(WorkerSpec {
            id,
            group: self.group.clone(),
            topic: topic.clone(),
            config: self.config.clone(),
            source,
            cmd_tx: self.cmd_tx.clone(),
        });
        info!(group = %self.group, topic = %topic, "Subscribed topic");
        self.workers.insert(topic, handle);
        let _ = reply.send(Ok(consumer));
    }

    async fn remove_worker(&mut self, topic: &str, worker_id: u64) {
        match self.workers.get(topic) {
            Some(handle) if handle.id == worker_id => {}
            // A stale deregistration for a worker already replaced.
            _ => return,
        }
        if let Some(handle) = self.workers.remove(topic) {
            let _ = handle.task.await;
            info!(group = %self.group, topic = %topic, "Unsubscribed topic");
        }
    }

    async fn leave_group(&mut self, coordinator: &Arc<dyn Broker>) {
        let req = LeaveGroupRequest {
            group_id: self.group.clone(),
            member_id: self.member_id.clone(),
        };
        // Best effort: the broker will expire the member by session
        // timeout if this fails.
        match coordinator.leave_group(req).await {
            Err(e) => self.deliver(ClientError::Coordinator {
                group: self.group.clone(),
                context: "leaving group",
                source: e,
            }),
            Ok(resp) if !resp.error.is_none() => self.deliver(ClientError::Protocol {
                group: self.group.clone(),
                context: "leaving group",
                code: resp.error,
            }),
            Ok(_) => debug!(group = %self.group, "Left group"),
        }
    }

    /// Close every topic worker and wait for them to finish their own
    /// shutdown (which commits their offsets). The error channel closes
    /// when `self` drops at the end.
    async fn shutdown(mut self) {
        info!(group = %self.group, "Closing consumer-group client");
        for handle in self.workers.values() {
            handle.close.cancel();
        }
        let mut tasks: Vec<JoinHandle<()>> = self
            .workers
            .drain()
            .map(|(_, handle)| handle.task)
            .collect();

        // Service the command channel while waiting, so no worker blocks
        // on its deregistration send.
        let cmd_rx = &mut self.cmd_rx;
        tokio::select! {
            _ = async {
                for task in &mut tasks {
                    let _ = task.await;
                }
            } => {}
            _ = async {
                loop {
                    match cmd_rx.recv().await {
                        Some(Command::Subscribe { reply, .. }) => {
                            let _ = reply.send(Err(ClientError::Closed));
                        }
                        Some(Command::Deregister { .. }) => {}
                        None => std::future::pending::<()>().await,
                    }
                }
            } => {}
        }
    }

    /// Deliver an error to whoever is watching the error channel; drop it
    /// when nobody keeps up.
    fn deliver(&self, error: ClientError) {
        warn!(group = %self.group, %error, "Coordination error");
        let _ = self.errors_tx.try_send(error);
    }
}
