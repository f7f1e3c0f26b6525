//! Per-request activity history
//!
//! Each transfer request opens an activity and appends timestamped events
//! and command records to it. Records live in an arena keyed by a generated
//! id; they are removed explicitly with `prune`, never implicitly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

/// Generated activity identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActivityId(Uuid);

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Timestamped activity message
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One external command run on behalf of an activity
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub output: Vec<String>,
}

/// History of one request
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub id: ActivityId,
    pub user: String,
    pub label: String,
    pub events: Vec<ActivityEvent>,
    pub commands: Vec<CommandRecord>,
    pub ended: Option<DateTime<Utc>>,
}

impl ActivityRecord {
    fn push(&mut self, message: String) {
        self.events.push(ActivityEvent {
            at: Utc::now(),
            message,
        });
    }

    fn command_mut(&mut self, command: &str) -> Option<&mut CommandRecord> {
        self.commands.iter_mut().rev().find(|c| c.command == command)
    }

    /// Plain text rendering for operators.
    pub fn render(&self) -> String {
        let mut out = String::from("Activities:\n");
        for event in &self.events {
            let _ = writeln!(out, "{} {}", pretty(&event.at), event.message);
        }

        out.push_str("\nCommand Output:\n");
        for cmd in &self.commands {
            let _ = write!(out, "Command `{}` started at {} and ", cmd.command, pretty(&cmd.started));
            match cmd.ended {
                Some(ended) => {
                    let _ = writeln!(out, "ended at {}.", pretty(&ended));
                }
                None => out.push_str("no end was recorded.\n"),
            }
            if cmd.output.is_empty() {
                out.push_str("No output was recorded.\n");
            } else {
                out.push_str("Command output:\n===\n");
                for line in &cmd.output {
                    out.push_str(line);
                    if !line.ends_with('\n') {
                        out.push('\n');
                    }
                }
                out.push_str("===\n");
            }
            out.push('\n');
        }
        out
    }
}

fn pretty(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string()
}

/// Arena of activity records
#[derive(Default)]
pub struct ActivityLog {
    records: Mutex<HashMap<ActivityId, ActivityRecord>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ActivityId, ActivityRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_record(&self, id: ActivityId, f: impl FnOnce(&mut ActivityRecord)) {
        match self.records().get_mut(&id) {
            Some(record) => f(record),
            None => warn!(activity = %id, "Logging against an unknown activity"),
        }
    }

    pub fn start(&self, user: &str, label: &str) -> ActivityId {
        let id = ActivityId(Uuid::new_v4());
        let mut record = ActivityRecord {
            id,
            user: user.to_string(),
            label: label.to_string(),
            events: Vec::new(),
            commands: Vec::new(),
            ended: None,
        };
        record.push(format!("Activity {} started for user {}.", label, user));
        self.records().insert(id, record);
        id
    }

    pub fn event(&self, id: ActivityId, message: impl Into<String>) {
        let message = message.into();
        self.with_record(id, |r| r.push(message));
    }

    pub fn command_start(&self, id: ActivityId, command: &str) {
        self.with_record(id, |r| {
            r.commands.push(CommandRecord {
                command: command.to_string(),
                started: Utc::now(),
                ended: None,
                output: Vec::new(),
            })
        });
    }

    pub fn command_end(&self, id: ActivityId, command: &str) {
        self.with_record(id, |r| {
            if let Some(cmd) = r.command_mut(command) {
                cmd.ended = Some(Utc::now());
            }
        });
    }

    pub fn command_output(&self, id: ActivityId, command: &str, output: impl Into<String>) {
        let output = output.into();
        self.with_record(id, |r| {
            if let Some(cmd) = r.command_mut(command) {
                cmd.output.push(output);
            }
        });
    }

    /// Mark the activity finished. Ending twice keeps the first end time.
    pub fn end(&self, id: ActivityId) {
        self.with_record(id, |r| {
            if r.ended.is_none() {
                let message = format!("Activity {} ended for user {}.", r.label, r.user);
                r.push(message);
                r.ended = Some(Utc::now());
            }
        });
    }

    pub fn get(&self, id: ActivityId) -> Option<ActivityRecord> {
        self.records().get(&id).cloned()
    }

    pub fn render(&self, id: ActivityId) -> Option<String> {
        self.records().get(&id).map(ActivityRecord::render)
    }

    pub fn for_user(&self, user: &str) -> Vec<ActivityId> {
        let records = self.records();
        let mut ids: Vec<(DateTime<Utc>, ActivityId)> = records
            .values()
            .filter(|r| r.user == user)
            .map(|r| (r.events.first().map(|e| e.at).unwrap_or_else(Utc::now), r.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn active(&self) -> usize {
        self.records().values().filter(|r| r.ended.is_none()).count()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop ended activities older than `older_than`. Returns how many went.
    pub fn prune(&self, older_than: ChronoDuration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, r| !matches!(r.ended, Some(ended) if ended < cutoff));
        before - records.len()
    }
}
