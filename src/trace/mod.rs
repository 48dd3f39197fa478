//! Append-only, date-rotated trace log.
//!
//! Every entry lands in `<root>/<project>/<service>/<YYYY-MM-DD>.jsonl` (UTC
//! date). Writing is best-effort: a failed append is reported through
//! `tracing` and otherwise ignored, so tracing never breaks the primary path.
//! Reading stitches all files of a project back together by correlation id.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

use crate::bus::message::{topics, BusMessage};
use crate::core::fs::{append_line, project_dir};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Perception,
    Memory,
    Action,
    Workflow,
}

impl Service {
    pub const ALL: [Service; 4] = [
        Service::Perception,
        Service::Memory,
        Service::Action,
        Service::Workflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Perception => "perception",
            Service::Memory => "memory",
            Service::Action => "action",
            Service::Workflow => "workflow",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

/// Deterministic `(service, action)` classification of a topic string.
pub fn classify_topic(topic: &str) -> (Service, &'static str) {
    if topic.starts_with(topics::RAW_EVENTS) {
        (Service::Perception, "event_received")
    } else if topic.starts_with(topics::PROCESSED_EVENTS) {
        (Service::Perception, "event_processed")
    } else if topic == topics::INTENT {
        (Service::Action, "intent_received")
    } else if topic == topics::WORKFLOW_TRIGGER {
        (Service::Action, "workflow_triggered")
    } else if topic.starts_with(topics::WORKFLOW_STATUS) {
        (Service::Workflow, "state_changed")
    } else if topic == topics::DSS_QUERY {
        (Service::Memory, "query_received")
    } else if topic == topics::DSS_RESPONSE {
        (Service::Memory, "query_completed")
    } else if topic == topics::DSS_UPDATE {
        (Service::Memory, "update_received")
    } else {
        (Service::Action, "message_published")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub service: Service,
    pub topic: String,
    pub action: String,
    pub project_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A trace entry before it is stamped.
#[derive(Debug, Clone)]
pub struct NewTraceEntry {
    pub correlation_id: String,
    pub service: Service,
    pub topic: String,
    pub action: String,
    pub project_name: String,
    pub data: Map<String, Value>,
}

impl NewTraceEntry {
    /// The entry `publish` writes for a message on `topic`.
    pub fn for_message(topic: &str, message: &BusMessage) -> Self {
        let (service, action) = classify_topic(topic);
        Self {
            correlation_id: message.correlation_id().to_string(),
            service,
            topic: topic.to_string(),
            action: action.to_string(),
            project_name: message.project_name().to_string(),
            data: message.payload.trace_data(),
        }
    }

    pub fn stamp(self, timestamp: DateTime<Utc>) -> TraceEntry {
        TraceEntry {
            timestamp,
            correlation_id: self.correlation_id,
            service: self.service,
            topic: self.topic,
            action: self.action,
            project_name: self.project_name,
            data: self.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub correlation_id: String,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub services: Vec<Service>,
    pub entry_count: usize,
    pub first_action: String,
    pub first_topic: String,
}

pub struct TraceLogger {
    root: PathBuf,
}

impl TraceLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn service_dir(&self, project: &str, service: Service) -> PathBuf {
        project_dir(&self.root, project).join(service.as_str())
    }

    pub fn file_for(&self, project: &str, service: Service, date: NaiveDate) -> PathBuf {
        self.service_dir(project, service)
            .join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Stamps and appends `entry`, swallowing any failure.
    pub async fn log(&self, entry: NewTraceEntry) {
        let correlation_id = entry.correlation_id.clone();
        if let Err(e) = self.append(entry).await {
            warn!(correlation_id = %correlation_id, error = %e, "trace append failed");
        }
    }

    /// Fallible form of [`TraceLogger::log`].
    pub async fn append(&self, entry: NewTraceEntry) -> Result<TraceEntry> {
        let entry = entry.stamp(Utc::now());
        let path = self.file_for(&entry.project_name, entry.service, entry.timestamp.date_naive());
        let line = serde_json::to_string(&entry)?;
        append_line(&path, &line).await?;
        Ok(entry)
    }

    /// Entries written by `service` for exactly `project`.
    async fn read_service(&self, project: &str, service: Service) -> Result<Vec<TraceEntry>> {
        let dir = self.service_dir(project, service);
        let mut files = Vec::new();
        let mut listing = match fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        files.sort();

        let mut entries = Vec::new();
        for file in files {
            let content = fs::read_to_string(&file).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<TraceEntry>(line) {
                    Ok(entry) if entry.project_name == project => entries.push(entry),
                    Ok(_) => {}
                    Err(e) => debug!(file = %file.display(), error = %e, "skipping malformed trace line"),
                }
            }
        }
        Ok(entries)
    }

    async fn read_project(&self, project: &str) -> Vec<TraceEntry> {
        let mut all = Vec::new();
        for service in Service::ALL {
            match self.read_service(project, service).await {
                Ok(mut entries) => all.append(&mut entries),
                Err(e) => warn!(project, service = service.as_str(), error = %e, "trace read failed"),
            }
        }
        all
    }

    /// Every entry of `correlation_id` across all services, oldest first.
    pub async fn get_trace(&self, project: &str, correlation_id: &str) -> Vec<TraceEntry> {
        let mut entries: Vec<TraceEntry> = self
            .read_project(project)
            .await
            .into_iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// One summary per correlation id, most recently active first.
    pub async fn get_recent_traces(&self, project: &str, limit: usize) -> Vec<TraceSummary> {
        let mut groups: HashMap<String, Vec<TraceEntry>> = HashMap::new();
        for entry in self.read_project(project).await {
            groups.entry(entry.correlation_id.clone()).or_default().push(entry);
        }

        let mut summaries: Vec<TraceSummary> = groups
            .into_iter()
            .filter_map(|(correlation_id, mut entries)| {
                entries.sort_by_key(|e| e.timestamp);
                let first = entries.first()?;
                let last = entries.last()?;
                let services: BTreeSet<Service> = entries.iter().map(|e| e.service).collect();
                Some(TraceSummary {
                    correlation_id,
                    first_timestamp: first.timestamp,
                    last_timestamp: last.timestamp,
                    services: services.into_iter().collect(),
                    entry_count: entries.len(),
                    first_action: first.action.clone(),
                    first_topic: first.topic.clone(),
                })
            })
            .collect();

        summaries.sort_by(|a, b| {
            b.last_timestamp
                .cmp(&a.last_timestamp)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });
        summaries.truncate(limit);
        summaries
    }

    /// The newest `limit` entries written by one service.
    pub async fn get_recent_entries(
        &self,
        project: &str,
        service: Service,
        limit: usize,
    ) -> Vec<TraceEntry> {
        let mut entries = match self.read_service(project, service).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(project, service = service.as_str(), error = %e, "trace read failed");
                return Vec::new();
            }
        };
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        entries
    }
}
