//! Shared wiring for in-memory broker tests.

#![allow(dead_code)]

use relay_rs::broker::ConfirmListener;
use relay_rs::broker::memory::InMemoryBroker;
use relay_rs::confirm::ConfirmationTracker;
use relay_rs::dedup::Deduplicator;
use relay_rs::dispatch::Dispatcher;
use relay_rs::error::{Error, Result};
use relay_rs::model::Status;
use relay_rs::notify::Notifier;
use relay_rs::reply::{ReplyCorrelator, ReplyListener};
use relay_rs::topology::Topology;
use relay_rs::worker::Worker;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded `notify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub job_id: String,
    pub status: Status,
    pub details: String,
    pub target: Option<String>,
}

/// Notifier that remembers every call and can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.notices.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, job_id: &str, status: Status, details: &str, target: Option<&str>) -> Result<()> {
        self.notices.lock().unwrap().push(Notice {
            job_id: job_id.to_string(),
            status,
            details: details.to_string(),
            target: target.map(str::to_string),
        });
        if self.fail {
            return Err(Error::NotificationFailure("smtp down".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub topology: Topology,
    pub tracker: Arc<ConfirmationTracker>,
    pub broker: Arc<InMemoryBroker>,
    pub correlator: Arc<ReplyCorrelator>,
    pub dedup: Arc<Deduplicator>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default())
    }

    pub fn with_notifier(notifier: RecordingNotifier) -> Self {
        let topology = Topology::default();
        let tracker = Arc::new(ConfirmationTracker::new());
        let listener: Arc<dyn ConfirmListener> = tracker.clone();
        let broker = Arc::new(InMemoryBroker::new(topology.clone(), listener));
        Self {
            topology,
            tracker,
            broker,
            correlator: Arc::new(ReplyCorrelator::new()),
            dedup: Arc::new(Deduplicator::default()),
            notifier: Arc::new(notifier),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher<InMemoryBroker> {
        Dispatcher::new(self.broker.clone(), self.topology.clone(), self.tracker.clone())
    }

    pub fn worker(&self) -> Worker<InMemoryBroker, RecordingNotifier> {
        Worker::new(self.broker.clone(), self.dedup.clone(), self.notifier.clone())
    }

    pub fn reply_listener(&self) -> ReplyListener<InMemoryBroker> {
        ReplyListener::new(self.broker.clone(), self.correlator.clone())
    }
}

/// Bound for waits that should complete almost immediately.
pub const SHORT: Duration = Duration::from_secs(2);
