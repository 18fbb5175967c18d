//! Well-known flow dispatch
//!
//! Messages whose session names a handler registered on this node are
//! consumed in-process; everything else flows on to the durable session
//! queues. Handlers are invoked once per name with the batch they own.

use crate::frontend::message::Message;
use crate::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub trait WellKnownFlow: Send + Sync {
    fn name(&self) -> &str;

    /// Handle a batch addressed to this flow. Must be idempotent and cheap;
    /// anything heavier belongs on the worker pool.
    fn process_messages(&self, messages: Vec<Message>);
}

pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn WellKnownFlow>>,
}

impl FlowRegistry {
    /// Keep only the flows named in `active`.
    pub fn new(available: Vec<Arc<dyn WellKnownFlow>>, active: &[String]) -> Self {
        let mut flows = HashMap::new();
        for flow in available {
            let name = flow.name().to_string();
            if active.iter().any(|a| a == &name) {
                flows.insert(name, flow);
            } else {
                debug!("well-known flow {} not active on this node", name);
            }
        }
        Self { flows }
    }

    pub fn empty() -> Self {
        Self {
            flows: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Consume well-known messages, return the rest for queueing.
    ///
    /// Responses (`response_id != 0`) always pass through. New requests to
    /// regular flows get a random non-zero response id — a zero id would
    /// land on the session's pending-state slot when queued.
    pub fn dispatch(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut by_flow: HashMap<String, Vec<Message>> = HashMap::new();
        let mut unprocessed = Vec::new();

        for mut msg in messages {
            if msg.response_id != 0 {
                unprocessed.push(msg);
                continue;
            }

            let flow_name = msg.session_id.flow_name().to_string();
            if self.flows.contains_key(&flow_name) {
                metrics::WELL_KNOWN_FLOW_REQUESTS.inc();
                metrics::WELL_KNOWN_FLOW_REQUESTS_BY_FLOW
                    .with_label_values(&[flow_name.as_str()])
                    .inc();
                by_flow.entry(flow_name).or_default().push(msg);
            } else {
                msg.response_id = random_response_id();
                unprocessed.push(msg);
            }
        }

        for (name, batch) in by_flow {
            if let Some(flow) = self.flows.get(&name) {
                flow.process_messages(batch);
            }
        }

        unprocessed
    }
}

fn random_response_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
