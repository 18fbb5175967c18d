//! The frontend server
//!
//! Composes the communicator, the queues, the throttler, and the well-known
//! flow registry around a single `handle_bundle` operation: authenticate the
//! parcel, ingest its messages, and — admission permitting — answer with a
//! batch of leased tasks.

use crate::config::FrontendConfig;
use crate::crypto::{ExchangePublic, Keypair};
use crate::events::{Event, EventBus};
use crate::frontend::communicator::{CommsError, ServerCommunicator};
use crate::frontend::flows::{FlowRegistry, WellKnownFlow};
use crate::frontend::message::{AgentId, Message, MessageKind, Parcel, SessionId, StatusCode, Task, INITIAL_TASK_TTL};
use crate::frontend::pool::WorkerPool;
use crate::frontend::throttle::{now_secs, BundleThrottler};
use crate::metrics;
use crate::queue::{QueueError, TaskQueue};
use crate::store::{AgentStore, StoreError};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use x25519_dalek::StaticSecret;

#[derive(Error, Debug)]
pub enum HandleError {
    #[error(transparent)]
    Comms(#[from] CommsError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hard admission gate consulted after the sliding-window throttler. Used to
/// shed outbound load when downstream systems are unhealthy; ingest is never
/// gated by it.
pub type ThrottleCallback = Box<dyn Fn() -> bool + Send + Sync>;

pub struct FrontendServer {
    config: FrontendConfig,
    communicator: ServerCommunicator,
    store: Arc<AgentStore>,
    queue: TaskQueue,
    registry: FlowRegistry,
    throttler: Mutex<BundleThrottler>,
    throttle_callback: ThrottleCallback,
    events: EventBus,
    pool: Arc<WorkerPool>,
}

impl FrontendServer {
    /// Build a server over `db`. Returns the event receiver alongside, the
    /// same way the network layer hands out its event channel.
    pub fn new(
        config: FrontendConfig,
        identity: Keypair,
        exchange: StaticSecret,
        db: &sled::Db,
        available_flows: Vec<Arc<dyn WellKnownFlow>>,
        pool: Arc<WorkerPool>,
    ) -> Result<(Self, UnboundedReceiver<Event>), HandleError> {
        let store = Arc::new(AgentStore::new(db)?);
        let queue = TaskQueue::new(db)?;
        let registry = FlowRegistry::new(available_flows, &config.well_known_flows);
        let throttler = Mutex::new(BundleThrottler::new(
            config.throttle_ratio,
            config.throttle_average_interval,
        ));
        let (events, event_rx) = EventBus::channel();

        let common_name = AgentId::from(format!(
            "frontend/{}",
            hex::encode(&identity.public[..8])
        ));
        let communicator =
            ServerCommunicator::new(common_name, identity, exchange, Arc::clone(&store));

        Ok((
            Self {
                config,
                communicator,
                store,
                queue,
                registry,
                throttler,
                throttle_callback: Box::new(|| true),
                events,
                pool,
            },
            event_rx,
        ))
    }

    pub fn communicator(&self) -> &ServerCommunicator {
        &self.communicator
    }

    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The key agents seal parcels against.
    pub fn exchange_public(&self) -> ExchangePublic {
        self.communicator.exchange_public()
    }

    /// Replace the hard admission gate.
    pub fn set_throttle_callback(&mut self, callback: ThrottleCallback) {
        self.throttle_callback = callback;
    }

    /// Reconfigure the sliding-window throttler at runtime.
    pub fn set_throttle_ratio(&self, ratio: Option<f64>) {
        let mut throttler = self.throttler.lock().unwrap_or_else(|e| e.into_inner());
        throttler.set_ratio(ratio);
    }

    /// Process one bundle: authenticate, ingest, and answer with tasks.
    ///
    /// Returns the sealed response parcel, the authenticated source, and the
    /// number of messages received from it.
    pub fn handle_bundle(
        &self,
        request: &Parcel,
    ) -> Result<(Parcel, AgentId, usize), HandleError> {
        metrics::HANDLE_BUNDLES.inc();
        let timer = metrics::HANDLE_SECONDS.start_timer();
        let result = self.handle_bundle_inner(request);
        timer.observe_duration();
        result
    }

    fn handle_bundle_inner(
        &self,
        request: &Parcel,
    ) -> Result<(Parcel, AgentId, usize), HandleError> {
        let (messages, source, timestamp) = self.communicator.open_parcel(request)?;

        let ingest_started = Instant::now();
        let inbound_count = messages.len();
        if !messages.is_empty() {
            // Ingest runs inline: its writes are committed before any
            // egress decision, and a later failure never unwinds them.
            self.receive_messages(&source, messages)?;
        }

        let required = self
            .config
            .max_queue_size
            .saturating_sub(request.queue_size as usize);

        let mut tasks = Vec::new();
        let throttled = {
            let mut throttler = self.throttler.lock().unwrap_or_else(|e| e.into_inner());
            throttler.update_and_check(now_secs())
        };
        if throttled {
            metrics::HANDLE_THROTTLED.inc();
        } else if (self.throttle_callback)() {
            // Hand out tasks only while the exchange is still inside the
            // latency budget; a slower ingest means the agent has likely
            // already retransmitted.
            if ingest_started.elapsed() < self.config.max_retransmission_time {
                tasks = self.drain_tasks_for_agent(&source, required)?;
            }
        } else {
            metrics::HANDLE_THROTTLED.inc();
        }

        let jobs: Vec<Message> = tasks.iter().map(|t| t.message.clone()).collect();
        match self
            .communicator
            .seal_parcel(jobs, &source, timestamp, request.api_version)
        {
            Ok(response) => Ok((response, source, inbound_count)),
            Err(CommsError::UnknownSource(dest)) => {
                // The drained tasks are not lost: put them back so the next
                // exchange can pick them up.
                self.queue.schedule(&tasks)?;
                Err(CommsError::UnknownSource(dest).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ingest inbound messages for `agent` inside one queue scope.
    pub fn receive_messages(
        &self,
        agent: &AgentId,
        messages: Vec<Message>,
    ) -> Result<(), HandleError> {
        let started = Instant::now();
        let total = messages.len();

        let mut groups: Vec<(SessionId, Vec<Message>)> = Vec::new();
        for msg in messages {
            match groups.iter_mut().find(|(s, _)| *s == msg.session_id) {
                Some((_, list)) => list.push(msg),
                None => groups.push((msg.session_id.clone(), vec![msg])),
            }
        }

        let mut scope = self.queue.scope();
        for (session_id, msgs) in groups {
            let unprocessed = self.registry.dispatch(msgs);
            if unprocessed.is_empty() {
                continue;
            }

            for msg in &unprocessed {
                scope.queue_response(&session_id, msg.clone());
            }

            for msg in &unprocessed {
                if msg.request_id == 0 {
                    // Well-known flow traffic without a status still has to
                    // wake a listener; the messages are interchangeable, so
                    // one notification covers the group.
                    scope.queue_notification(&msg.session_id, msg.priority, None);
                    break;
                } else if msg.kind == MessageKind::Status {
                    // The agent finished this request; its task leaves the
                    // outbound queue.
                    scope.dequeue_client_request(agent, msg.task_id);
                    scope.queue_notification(&msg.session_id, msg.priority, Some(msg.request_id));

                    if msg.status_code() == Some(StatusCode::ClientKilled) {
                        self.events.publish(Event::ClientCrash {
                            agent: agent.clone(),
                            message: msg.clone(),
                        });
                    }
                } else {
                    scope.queue_notification(&msg.session_id, msg.priority, None);
                }
            }
        }
        scope.commit()?;

        debug!("received {} messages in {:?}", total, started.elapsed());
        Ok(())
    }

    /// Lease up to `max_count` tasks for `agent`, filtering retransmissions.
    pub fn drain_tasks_for_agent(
        &self,
        agent: &AgentId,
        max_count: usize,
    ) -> Result<Vec<Task>, HandleError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let leased = self
            .queue
            .query_and_own(agent, max_count, self.config.message_expiry_time)?;

        let mut check_before_sending = Vec::new();
        let mut result = Vec::new();
        for task in leased {
            if task.message.task_ttl < INITIAL_TASK_TTL - 1 {
                // Leased before: the agent may already have answered.
                check_before_sending.push(task);
            } else {
                result.push(task);
            }
        }

        if !check_before_sending.is_empty() {
            let mut scope = self.queue.scope();
            let status_found = scope.multi_check_status(&check_before_sending)?;
            for task in check_before_sending {
                if status_found.contains(&task.message.task_id) {
                    // A result is already pending ingestion; resending would
                    // only duplicate work.
                    scope.dequeue_client_request(agent, task.message.task_id);
                } else {
                    result.push(task);
                }
            }
            scope.commit()?;
        }

        metrics::MESSAGES_SENT.inc_by(result.len() as u64);
        if !result.is_empty() {
            debug!(
                "drained {} tasks for {} in {:?}",
                result.len(),
                agent,
                started.elapsed()
            );
        }
        Ok(result)
    }
}
