//! Frontend bundle pipeline

pub mod cache;
pub mod communicator;
pub mod flows;
pub mod message;
pub mod pool;
pub mod server;
pub mod throttle;

// Re-exports
pub use cache::{AgentPublicKey, ClientCache, PublicKeyCache};
pub use communicator::{
    open_client_parcel, seal_client_parcel, CommsError, ServerCommunicator, REPLAY_WINDOW_MICROS,
};
pub use flows::{FlowRegistry, WellKnownFlow};
pub use message::{
    AgentId, Message, MessageKind, Parcel, Priority, SessionId, SignedMessageList, StatusCode,
    Task, INITIAL_TASK_TTL, MAX_PARCEL_SIZE,
};
pub use pool::WorkerPool;
pub use server::{FrontendServer, HandleError};
pub use throttle::BundleThrottler;
