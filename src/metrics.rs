//! Process-wide frontend metrics
//!
//! Registration is single-shot and global; server instances share these
//! series. Scrape via `prometheus::gather()` from the embedding process.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    /// Bundles entering `handle_bundle`.
    pub static ref HANDLE_BUNDLES: IntCounter = register_int_counter!(
        "drover_handle_bundles_total",
        "Bundles handled by the frontend"
    )
    .unwrap();

    /// Bundles answered without tasks due to throttling.
    pub static ref HANDLE_THROTTLED: IntCounter = register_int_counter!(
        "drover_handle_throttled_total",
        "Bundles throttled before task dispatch"
    )
    .unwrap();

    /// Wall-clock latency of one full bundle exchange.
    pub static ref HANDLE_SECONDS: Histogram = register_histogram!(
        "drover_handle_seconds",
        "Bundle handling latency in seconds"
    )
    .unwrap();

    /// Parcels that passed signature and replay checks.
    pub static ref AUTHENTICATED_PARCELS: IntCounter = register_int_counter!(
        "drover_authenticated_parcels_total",
        "Parcels accepted by the authentication path"
    )
    .unwrap();

    /// Parcels rejected at cipher signature verification.
    pub static ref UNAUTHENTICATED_PARCELS: IntCounter = register_int_counter!(
        "drover_unauthenticated_parcels_total",
        "Parcels with an invalid cipher signature"
    )
    .unwrap();

    /// First contacts from agents with no enrolled certificate.
    pub static ref UNIQUE_AGENTS: IntCounter = register_int_counter!(
        "drover_unique_agents_total",
        "Contacts from agents without a stored certificate"
    )
    .unwrap();

    pub static ref AGENT_PINGS_BY_LABEL: IntCounterVec = register_int_counter_vec!(
        "drover_agent_pings_by_label_total",
        "Accepted agent pings per record label",
        &["label"]
    )
    .unwrap();

    pub static ref WELL_KNOWN_FLOW_REQUESTS: IntCounter = register_int_counter!(
        "drover_well_known_flow_requests_total",
        "Messages consumed by in-process well-known flows"
    )
    .unwrap();

    pub static ref WELL_KNOWN_FLOW_REQUESTS_BY_FLOW: IntCounterVec = register_int_counter_vec!(
        "drover_well_known_flow_requests_by_flow_total",
        "Messages consumed per well-known flow",
        &["flow"]
    )
    .unwrap();

    /// Tasks included in outbound batches.
    pub static ref MESSAGES_SENT: IntCounter = register_int_counter!(
        "drover_messages_sent_total",
        "Tasks drained and sent to agents"
    )
    .unwrap();

    pub static ref CLIENT_CACHE_SIZE: IntGauge = register_int_gauge!(
        "drover_client_cache_size",
        "Entries in the agent record cache"
    )
    .unwrap();

    /// Configured throttle ratio; -1 when throttling is disabled.
    pub static ref THROTTLE_RATIO: Gauge = register_gauge!(
        "drover_throttle_ratio",
        "Configured bundle admission ratio"
    )
    .unwrap();
}
