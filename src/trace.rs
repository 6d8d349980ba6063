// ─────────────────────────────────────────────────────────────────────────────
// trace.rs — Structured await/resume trace events
//
// Every long-lived task in the engine emits line-delimited JSON events at its
// suspension points so an offline converter can reconstruct the cooperative
// schedule. Events go through `log` under the `pos_engine::trace` target;
// enable that target at debug level to collect them.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub const TRACE_TARGET: &str = "pos_engine::trace";

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique task id for trace correlation.
pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Serialize)]
struct TraceLine<'a> {
    timestamp: i64,
    func_name: &'a str,
    event: &'a str,
    my_event: &'a str,
    current_task: u64,
    clazz: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    symbol: Option<&'a str>,
    depends: &'a [u64],
}

/// Per-task trace handle, bound to a component name and symbol at spawn.
#[derive(Clone)]
pub struct TaskTrace {
    clazz: &'static str,
    symbol: String,
    task_id: u64,
}

impl TaskTrace {
    pub fn new(clazz: &'static str, symbol: impl Into<String>) -> Self {
        Self {
            clazz,
            symbol: symbol.into(),
            task_id: next_task_id(),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    fn emit(&self, func: &str, my_event: &str, depends: &[u64]) {
        if !log::log_enabled!(target: TRACE_TARGET, log::Level::Debug) {
            return;
        }
        let line = TraceLine {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            func_name: func,
            event: func,
            my_event,
            current_task: self.task_id,
            clazz: self.clazz,
            symbol: if self.symbol.is_empty() {
                None
            } else {
                Some(&self.symbol)
            },
            depends,
        };
        match serde_json::to_string(&line) {
            Ok(json) => log::debug!(target: TRACE_TARGET, "{json}"),
            Err(e) => log::debug!(target: TRACE_TARGET, "trace serialization failed: {e}"),
        }
    }

    /// The task is about to suspend in `func`, waiting on `depends`.
    pub fn awaiting(&self, func: &str, depends: &[u64]) {
        self.emit(func, "await", depends);
    }

    /// The task resumed from the suspension recorded by `awaiting`.
    pub fn resumed(&self, func: &str) {
        self.emit(func, "resume", &[]);
    }

    /// The task is parked waiting for an external condition (e.g. a trading
    /// session to open).
    pub fn wait(&self, func: &str, depends: &[u64]) {
        self.emit(func, "wait", depends);
    }

    /// The task's main body finished.
    pub fn complete(&self, func: &str) {
        self.emit(func, "complete", &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskTrace::new("X", "SIM.a");
        let b = TaskTrace::new("X", "SIM.a");
        assert_ne!(a.task_id(), b.task_id());
    }

    #[test]
    fn test_trace_line_shape() {
        let line = TraceLine {
            timestamp: 1,
            func_name: "recv",
            event: "recv",
            my_event: "await",
            current_task: 7,
            clazz: "TargetPosTask",
            symbol: Some("SHFE.cu2405"),
            depends: &[3, 4],
        };
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains("\"my_event\":\"await\""));
        assert!(json.contains("\"depends\":[3,4]"));
    }
}
