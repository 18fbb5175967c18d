pub mod config;
pub mod crypto;
pub mod events;
pub mod frontend;
pub mod metrics;
pub mod queue;
pub mod store;

pub use config::FrontendConfig;
pub use crypto::Keypair;
pub use events::{Event, EventBus};
pub use frontend::{
    AgentId, BundleThrottler, CommsError, FlowRegistry, FrontendServer, HandleError, Message,
    MessageKind, Parcel, Priority, ServerCommunicator, SessionId, SignedMessageList, StatusCode,
    Task, WellKnownFlow, WorkerPool, INITIAL_TASK_TTL,
};
pub use queue::{Notification, QueueError, QueueScope, TaskQueue};
pub use store::{AgentCertificate, AgentRecord, AgentStore, StoreError};
