use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use policy_engine::decision::{Action, Decision};
use policy_engine::engine::CheckOutcome;
use rasp_core::types::CheckType;

pub mod dependency;
pub mod emitter;
pub mod json;
pub mod redact;
pub mod timeline;

pub use dependency::{count_by_tag, DependencyRecord};
pub use emitter::{ChannelEmitter, EmitterStats, EventSink, JsonlSink, MemoryEmitter, TelemetryRecord};

/// One check as seen by a replay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEvent {
    pub sequence: u64,
    pub check_type: CheckType,
    pub params: Value,
    pub decision: Decision,
    /// `cache`, `policy`, `coalesced` or `fail_open`.
    pub source: String,
    pub elapsed_us: u64,
}

impl ReportEvent {
    pub fn from_outcome(sequence: u64, check_type: CheckType, params: Value, outcome: &CheckOutcome) -> Self {
        Self {
            sequence,
            check_type,
            params,
            decision: (*outcome.decision).clone(),
            source: outcome.source.as_str().to_string(),
            elapsed_us: outcome.elapsed.as_micros() as u64,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        self.source == "cache"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    pub total_checks: u32,
    pub allowed: u32,
    pub logged: u32,
    pub blocked: u32,
    /// Checks that failed and were allowed by default.
    pub failed: u32,
    pub cache_hits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub app_id: String,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub events: Vec<ReportEvent>,
    pub stats: ReportStats,
}

impl SessionReport {
    pub fn new(
        app_id: impl Into<String>,
        started_at: OffsetDateTime,
        ended_at: Option<OffsetDateTime>,
        events: Vec<ReportEvent>,
    ) -> Self {
        let stats = ReportStats::from_events(&events);
        Self {
            session_id: Uuid::new_v4(),
            app_id: app_id.into(),
            started_at,
            ended_at,
            events,
            stats,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        let end = self.ended_at?;
        Some(end - self.started_at)
    }

    pub fn human_summary(&self) -> String {
        let duration = self
            .duration()
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string());
        let stats = &self.stats;
        let verdict_line = if stats.blocked == 0 {
            "No operation was blocked.".to_string()
        } else {
            format!("{} operations would have been blocked.", stats.blocked)
        };
        let failure_line = if stats.failed == 0 {
            "Every check completed.".to_string()
        } else {
            format!("{} checks failed and were allowed by default.", stats.failed)
        };

        format!(
            "Replayed {total} checks for {app} in {duration}.\n{verdict_line}\n{logged} logged, {allowed} allowed, {hits} served from cache.\n{failure_line}",
            total = stats.total_checks,
            app = self.app_id,
            logged = stats.logged,
            allowed = stats.allowed,
            hits = stats.cache_hits,
        )
    }
}

impl ReportStats {
    pub fn from_events(events: &[ReportEvent]) -> Self {
        let mut stats = ReportStats::default();

        for event in events {
            stats.total_checks = stats.total_checks.saturating_add(1);
            if event.decision.is_fail_open() {
                stats.failed = stats.failed.saturating_add(1);
            }
            if event.is_cache_hit() {
                stats.cache_hits = stats.cache_hits.saturating_add(1);
            }
            match event.decision.action {
                Action::Allow => stats.allowed = stats.allowed.saturating_add(1),
                Action::Log => stats.logged = stats.logged.saturating_add(1),
                Action::Block => stats.blocked = stats.blocked.saturating_add(1),
            }
        }

        stats
    }
}

fn format_duration(duration: Duration) -> String {
    let total_millis = (duration.as_seconds_f64().max(0.0) * 1000.0) as i64;
    let total_seconds = total_millis / 1000;
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;

    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if total_seconds > 0 {
        format!("{seconds}s")
    } else {
        format!("{total_millis}ms")
    }
}
