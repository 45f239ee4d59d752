//! Bounded execution history

use crate::errors::ErrorKind;
use crate::tools::types::{ToolResult, ToolStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// One completed `execute` call. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub tool: String,
    pub args: Value,
    pub result: ToolResult,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        tool: &str,
        args: Value,
        result: ToolResult,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.to_string(),
            args,
            success: result.success(),
            error: result.error().map(String::from),
            result,
            started_at,
            ended_at,
        }
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    records: VecDeque<ExecutionRecord>,
    totals: ToolStats,
    per_tool: HashMap<String, ToolStats>,
}

/// Ring buffer of records plus lifetime statistics
#[derive(Debug)]
pub struct ExecutionHistory {
    capacity: usize,
    state: Mutex<HistoryState>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(HistoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, record: ExecutionRecord, retry_attempts: u32) {
        let duration_ms = record.result.duration_ms();
        let mut state = self.state();

        // unknown names count toward totals only, so made-up tool names
        // cannot grow the per-tool table
        let resolved = record.result.error_kind() != Some(ErrorKind::NotFound.as_str());
        if resolved {
            let per_tool = state.per_tool.entry(record.tool.clone()).or_default();
            if record.success {
                per_tool.record_success(duration_ms);
            } else {
                per_tool.record_failure(duration_ms);
            }
            per_tool.record_retries(retry_attempts);
        }

        if record.success {
            state.totals.record_success(duration_ms);
        } else {
            state.totals.record_failure(duration_ms);
        }
        state.totals.record_retries(retry_attempts);

        while state.records.len() >= self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(record);
    }

    /// Most recent `limit` records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        let state = self.state();
        let skip = state.records.len().saturating_sub(limit);
        state.records.iter().skip(skip).cloned().collect()
    }

    pub fn for_tool(&self, tool: &str) -> Vec<ExecutionRecord> {
        self.state()
            .records
            .iter()
            .filter(|r| r.tool == tool)
            .cloned()
            .collect()
    }

    /// Drop stored records; statistics are lifetime counters and stay
    pub fn clear(&self) {
        self.state().records.clear();
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ToolStats {
        self.state().totals.clone()
    }

    pub fn stats_for(&self, tool: &str) -> Option<ToolStats> {
        self.state().per_tool.get(tool).cloned()
    }
}
