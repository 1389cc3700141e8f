// ABOUTME: Lifecycle status and outbound events fanned out to subscribers
// ABOUTME: Events serialize with a "type" tag: "status" or "update"

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metrics::MetricReading;

/// Per-subprocess lifecycle state.
///
/// ```text
/// Idle ─start→ Starting ─spawn ok→ Running ─stop→ Stopping ─terminated→ Stopped
///                  │                  │ └─self-exit→ Stopped
///                  └──────failure─────┴→ Error ─start→ Starting
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl Status {
    /// Whether `start` may leave this state.
    pub fn can_start(self) -> bool {
        matches!(self, Status::Idle | Status::Stopped | Status::Error)
    }

    /// Whether moving from `self` to `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Idle | Stopped | Error, Starting)
                | (Starting, Running)
                | (Starting | Running, Error)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Idle => "idle",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// A lifecycle transition
    Status {
        subprocess_id: String,
        status: Status,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        pid: Option<u32>,
        timestamp: DateTime<Utc>,
    },
    /// New metric values arrived
    Update {
        subprocess_id: String,
        metrics: BTreeMap<String, MetricReading>,
        status: Status,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn subprocess_id(&self) -> &str {
        match self {
            Event::Status { subprocess_id, .. } | Event::Update { subprocess_id, .. } => {
                subprocess_id
            }
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Event::Status { status, .. } | Event::Update { status, .. } => *status,
        }
    }
}
