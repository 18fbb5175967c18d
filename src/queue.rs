//! Task leases, session queues, and scoped queue transactions
//!
//! Four sled trees back the queue layer: `tasks` (per-agent outbound work
//! under lease), `responses` (per-session inbound replies), `status`
//! (completion markers consulted before retransmission), and `notifications`
//! (one coalesced wake-up per session). Lease state is authoritative the
//! moment it is taken; everything else goes through a scope that commits
//! atomically or not at all.

use crate::frontend::message::{
    now_micros, AgentId, Message, MessageKind, Priority, SessionId, Task,
};
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::Transactional;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("queue serialization: {0}")]
    Codec(#[from] bincode::Error),
}

/// Wake-up for workers listening on a session. One per session; a newer
/// notification overwrites the pending one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub session_id: SessionId,
    pub priority: Priority,
    /// Request id of the most recent STATUS, if any.
    pub last_status: Option<u64>,
    pub timestamp: u64,
}

pub struct TaskQueue {
    tasks: sled::Tree,
    responses: sled::Tree,
    status: sled::Tree,
    notifications: sled::Tree,
}

impl TaskQueue {
    pub fn new(db: &sled::Db) -> Result<Self, QueueError> {
        Ok(Self {
            tasks: db.open_tree("tasks")?,
            responses: db.open_tree("responses")?,
            status: db.open_tree("status")?,
            notifications: db.open_tree("notifications")?,
        })
    }

    fn task_key(agent: &AgentId, task_id: u64) -> Vec<u8> {
        format!("{}/{:020}", agent, task_id).into_bytes()
    }

    fn response_key(session: &SessionId, request_id: u64, response_id: u64) -> Vec<u8> {
        format!("{}/{:020}/{:020}", session, request_id, response_id).into_bytes()
    }

    fn status_key(session: &SessionId, request_id: u64) -> Vec<u8> {
        format!("{}/{:020}", session, request_id).into_bytes()
    }

    /// Lease up to `limit` pending tasks from `agent`'s queue.
    ///
    /// Tasks under a live lease are skipped. Each leased task has its ttl
    /// decremented; a task that runs out of ttl is dropped from the queue
    /// instead of being returned.
    pub fn query_and_own(
        &self,
        agent: &AgentId,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Task>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = now_micros();
        let lease_micros = lease.as_micros() as u64;
        let prefix = format!("{}/", agent);
        let mut owned = Vec::new();

        for item in self.tasks.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item?;
            let mut task: Task = bincode::deserialize(&raw)?;
            if task.lease_until > now {
                continue;
            }

            task.message.task_ttl = task.message.task_ttl.saturating_sub(1);
            if task.message.task_ttl == 0 {
                warn!(
                    "task {} for {} exhausted its retry budget, dropping",
                    task.message.task_id, agent
                );
                self.tasks.remove(key)?;
                continue;
            }

            task.lease_until = now + lease_micros;
            self.tasks.insert(key, bincode::serialize(&task)?)?;
            owned.push(task);
            if owned.len() >= limit {
                break;
            }
        }

        Ok(owned)
    }

    /// (Re)enqueue tasks, clearing any lease so they are immediately
    /// available for the next drain.
    pub fn schedule(&self, tasks: &[Task]) -> Result<(), QueueError> {
        for task in tasks {
            let mut entry = task.clone();
            entry.lease_until = 0;
            self.tasks.insert(
                Self::task_key(&entry.agent, entry.message.task_id),
                bincode::serialize(&entry)?,
            )?;
        }
        Ok(())
    }

    pub fn contains_task(&self, agent: &AgentId, task_id: u64) -> Result<bool, QueueError> {
        Ok(self.tasks.contains_key(Self::task_key(agent, task_id))?)
    }

    pub fn pending_task_count(&self, agent: &AgentId) -> Result<usize, QueueError> {
        let prefix = format!("{}/", agent);
        let mut count = 0;
        for item in self.tasks.scan_prefix(prefix.as_bytes()) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Committed responses for a session, in (request, response) order.
    pub fn responses_for(&self, session: &SessionId) -> Result<Vec<Message>, QueueError> {
        let prefix = format!("{}/", session);
        let mut messages = Vec::new();
        for item in self.responses.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            messages.push(bincode::deserialize(&raw)?);
        }
        Ok(messages)
    }

    /// The pending notification for a session, if any.
    pub fn notification_for(&self, session: &SessionId) -> Result<Option<Notification>, QueueError> {
        match self.notifications.get(session.as_str().as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Open a write scope. Buffered writes become visible atomically on
    /// commit; dropping the scope discards them.
    pub fn scope(&self) -> QueueScope<'_> {
        QueueScope {
            queue: self,
            pending: Vec::new(),
        }
    }
}

enum QueueOp {
    Response {
        session: SessionId,
        message: Message,
    },
    Notify(Notification),
    Dequeue {
        agent: AgentId,
        task_id: u64,
    },
}

pub struct QueueScope<'a> {
    queue: &'a TaskQueue,
    pending: Vec<QueueOp>,
}

impl QueueScope<'_> {
    pub fn queue_response(&mut self, session: &SessionId, message: Message) {
        self.pending.push(QueueOp::Response {
            session: session.clone(),
            message,
        });
    }

    pub fn queue_notification(
        &mut self,
        session: &SessionId,
        priority: Priority,
        last_status: Option<u64>,
    ) {
        self.pending.push(QueueOp::Notify(Notification {
            session_id: session.clone(),
            priority,
            last_status,
            timestamp: now_micros(),
        }));
    }

    pub fn dequeue_client_request(&mut self, agent: &AgentId, task_id: u64) {
        self.pending.push(QueueOp::Dequeue {
            agent: agent.clone(),
            task_id,
        });
    }

    /// Committed status markers for the given tasks, as a set of task ids.
    pub fn multi_check_status(&self, tasks: &[Task]) -> Result<HashSet<u64>, QueueError> {
        let mut found = HashSet::new();
        for task in tasks {
            let key = TaskQueue::status_key(&task.message.session_id, task.message.request_id);
            if self.queue.status.contains_key(key)? {
                found.insert(task.message.task_id);
            }
        }
        Ok(found)
    }

    /// Apply every buffered write in one multi-tree transaction. Responses
    /// land before the notifications that reference them.
    pub fn commit(self) -> Result<(), QueueError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut response_puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut status_puts: Vec<Vec<u8>> = Vec::new();
        let mut notify_puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut task_removes: Vec<Vec<u8>> = Vec::new();

        for op in &self.pending {
            match op {
                QueueOp::Response { session, message } => {
                    let key =
                        TaskQueue::response_key(session, message.request_id, message.response_id);
                    response_puts.push((key, bincode::serialize(message)?));
                    if message.kind == MessageKind::Status {
                        status_puts.push(TaskQueue::status_key(session, message.request_id));
                    }
                }
                QueueOp::Notify(notification) => {
                    notify_puts.push((
                        notification.session_id.as_str().as_bytes().to_vec(),
                        bincode::serialize(notification)?,
                    ));
                }
                QueueOp::Dequeue { agent, task_id } => {
                    task_removes.push(TaskQueue::task_key(agent, *task_id));
                }
            }
        }

        let result: Result<(), TransactionError<()>> = (
            &self.queue.tasks,
            &self.queue.responses,
            &self.queue.status,
            &self.queue.notifications,
        )
            .transaction(|(tasks, responses, status, notifications)| {
                for (key, value) in &response_puts {
                    responses.insert(key.as_slice(), value.clone())?;
                }
                for key in &status_puts {
                    status.insert(key.as_slice(), &[1u8][..])?;
                }
                for (key, value) in &notify_puts {
                    notifications.insert(key.as_slice(), value.clone())?;
                }
                for key in &task_removes {
                    tasks.remove(key.as_slice())?;
                }
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Storage(e)) => Err(QueueError::Sled(e)),
            Err(TransactionError::Abort(())) => unreachable!("scope commit never aborts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::message::{StatusCode, INITIAL_TASK_TTL};

    fn open_queue() -> (tempfile::TempDir, TaskQueue) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, TaskQueue::new(&db).unwrap())
    }

    fn make_task(agent: &str, task_id: u64) -> Task {
        let mut message = Message::data(SessionId::from("sessions/S1"), 5, 0, Vec::new());
        message.task_id = task_id;
        Task::fresh(AgentId::from(agent), message)
    }

    #[test]
    fn test_lease_decrements_ttl() {
        let (_dir, queue) = open_queue();
        let agent = AgentId::from("A1");
        queue.schedule(&[make_task("A1", 1)]).unwrap();

        let leased = queue
            .query_and_own(&agent, 10, Duration::from_secs(120))
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].message.task_ttl, INITIAL_TASK_TTL - 1);

        // The lease is live, so a second drain sees nothing.
        let again = queue
            .query_and_own(&agent, 10, Duration::from_secs(120))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_expired_lease_returns_task() {
        let (_dir, queue) = open_queue();
        let agent = AgentId::from("A1");
        queue.schedule(&[make_task("A1", 1)]).unwrap();

        let first = queue
            .query_and_own(&agent, 10, Duration::from_secs(0))
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = queue
            .query_and_own(&agent, 10, Duration::from_secs(120))
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message.task_ttl, INITIAL_TASK_TTL - 2);
    }

    #[test]
    fn test_ttl_exhaustion_drops_task() {
        let (_dir, queue) = open_queue();
        let agent = AgentId::from("A1");
        queue.schedule(&[make_task("A1", 1)]).unwrap();

        for _ in 0..INITIAL_TASK_TTL {
            queue
                .query_and_own(&agent, 10, Duration::from_secs(0))
                .unwrap();
        }
        assert!(!queue.contains_task(&agent, 1).unwrap());
    }

    #[test]
    fn test_scope_commit_is_atomic() {
        let (_dir, queue) = open_queue();
        let session = SessionId::from("sessions/S1");

        let mut scope = queue.scope();
        scope.queue_response(&session, Message::data(session.clone(), 5, 7, b"out".to_vec()));
        scope.queue_notification(&session, Priority::Medium, None);

        // Nothing is visible before commit.
        assert!(queue.responses_for(&session).unwrap().is_empty());
        assert!(queue.notification_for(&session).unwrap().is_none());

        scope.commit().unwrap();
        assert_eq!(queue.responses_for(&session).unwrap().len(), 1);
        assert!(queue.notification_for(&session).unwrap().is_some());
    }

    #[test]
    fn test_scope_drop_discards_writes() {
        let (_dir, queue) = open_queue();
        let session = SessionId::from("sessions/S1");

        {
            let mut scope = queue.scope();
            scope.queue_response(&session, Message::data(session.clone(), 5, 7, Vec::new()));
        }
        assert!(queue.responses_for(&session).unwrap().is_empty());
    }

    #[test]
    fn test_status_marker_feeds_multi_check() {
        let (_dir, queue) = open_queue();
        let session = SessionId::from("sessions/S1");
        let agent = AgentId::from("A1");

        let mut task = make_task("A1", 42);
        task.message.request_id = 5;
        queue.schedule(&[task.clone()]).unwrap();

        let mut scope = queue.scope();
        scope.queue_response(
            &session,
            Message::status(session.clone(), 5, 42, StatusCode::Ok),
        );
        scope.commit().unwrap();

        let scope = queue.scope();
        let found = scope.multi_check_status(&[task]).unwrap();
        assert!(found.contains(&42));

        let other = make_task("A1", 43);
        let found = scope.multi_check_status(&[other]).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_notifications_coalesce_per_session() {
        let (_dir, queue) = open_queue();
        let session = SessionId::from("sessions/S1");

        let mut scope = queue.scope();
        scope.queue_notification(&session, Priority::Medium, None);
        scope.queue_notification(&session, Priority::High, Some(5));
        scope.commit().unwrap();

        let notification = queue.notification_for(&session).unwrap().unwrap();
        assert_eq!(notification.last_status, Some(5));
        assert_eq!(notification.priority, Priority::High);
    }
}
