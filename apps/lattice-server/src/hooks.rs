//! Per-recipient broadcast hooks.
//!
//! A producer may attach hook invocations to an event. During fan-out the
//! shared event is left untouched; when a hook decides a recipient needs a
//! different payload, that recipient gets a deep copy, mutated and
//! re-encoded just for them. Recipients no hook touches keep the cheap
//! precomputed frame.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::hub::conn::WebConn;
use crate::model::WebSocketEvent;

pub trait BroadcastHook: Send + Sync {
    /// Cheap predicate; `process` and the deep copy are skipped when false.
    fn should_process(
        &self,
        conn: &WebConn,
        ev: &WebSocketEvent,
        args: &Map<String, Value>,
    ) -> bool;

    /// Mutate this recipient's copy of the event.
    fn process(&self, conn: &WebConn, ev: &mut WebSocketEvent, args: &Map<String, Value>);
}

/// Registry of named hooks, consulted by the write pump before encoding.
#[derive(Default)]
pub struct HookRunner {
    hooks: HashMap<String, Arc<dyn BroadcastHook>>,
}

impl HookRunner {
    pub fn new() -> Self {
        HookRunner::default()
    }

    pub fn register(&mut self, hook_id: &str, hook: Arc<dyn BroadcastHook>) {
        self.hooks.insert(hook_id.to_string(), hook);
    }

    /// Apply the event's hooks for one recipient. Borrowed when no hook
    /// fires, owned deep copy when at least one does.
    pub fn apply<'a>(&self, conn: &WebConn, ev: &'a WebSocketEvent) -> Cow<'a, WebSocketEvent> {
        if ev.hooks().is_empty() {
            return Cow::Borrowed(ev);
        }

        let mut copy: Option<WebSocketEvent> = None;
        for invocation in ev.hooks() {
            let Some(hook) = self.hooks.get(&invocation.hook_id) else {
                tracing::warn!(hook_id = %invocation.hook_id, "unknown broadcast hook");
                continue;
            };
            if !hook.should_process(conn, copy.as_ref().unwrap_or(ev), &invocation.args) {
                continue;
            }
            let target = copy.get_or_insert_with(|| ev.deep_copy());
            hook.process(conn, target, &invocation.args);
        }

        match copy {
            Some(c) => Cow::Owned(c),
            None => Cow::Borrowed(ev),
        }
    }
}
