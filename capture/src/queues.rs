//! Queue-to-agent registry
//!
//! The submit interceptor receives the queue pointer but not the agent that
//! owns it; queue-create records the pair so the snapshot writer can resolve
//! the dispatching agent's identity.

use std::collections::HashMap;
use std::sync::Mutex;

use isolate_hsa::packet::Queue;
use isolate_hsa::Agent;

#[derive(Default)]
pub struct QueueRegistry {
    inner: Mutex<HashMap<usize, Agent>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, queue: *const Queue, agent: Agent) {
        self.inner.lock().unwrap().insert(queue as usize, agent);
    }

    pub fn agent_for(&self, queue: *const Queue) -> Option<Agent> {
        self.inner.lock().unwrap().get(&(queue as usize)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_resolves() {
        let registry = QueueRegistry::new();
        let queue = 0x1000 as *const Queue;
        assert!(registry.agent_for(queue).is_none());

        registry.register(queue, Agent { handle: 42 });
        assert_eq!(registry.agent_for(queue), Some(Agent { handle: 42 }));
        assert!(registry.agent_for(0x2000 as *const Queue).is_none());
    }
}
