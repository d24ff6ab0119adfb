//! Outbound operator notifications
//!
//! Worker processes never talk to a mail server. They drop an instruction
//! file into the instruction directory, named `<timestamp>-<tag>.<kind>`, first
//! line subject and second line body, and a separate relay drains it.
//! Instructions are published through [`WorkQueue`] so the relay never reads a
//! half-written file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{info, warn};

use crate::queue::WorkQueue;
use crate::Result;

/// Subject used when an instruction has none.
pub const DEFAULT_SUBJECT: &str = "GraphOptima Notification";

/// Body used when an instruction has none.
pub const DEFAULT_BODY: &str = "No message provided";

/// Delivery channel of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Operator e-mail
    Email,
}

impl NotificationKind {
    /// File suffix of instructions of this kind.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Email => "email_instruction",
        }
    }
}

/// One operator-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Subject line
    pub subject: String,
    /// Message body
    pub body: String,
    /// Delivery channel
    pub kind: NotificationKind,
}

impl Notification {
    /// Parse an instruction payload, falling back to the default subject and
    /// body when either line is missing.
    #[must_use]
    pub fn parse(payload: &str, kind: NotificationKind) -> Self {
        let mut lines = payload.lines();
        match (lines.next(), lines.next()) {
            (Some(subject), Some(body)) => Self {
                subject: subject.to_string(),
                body: body.to_string(),
                kind,
            },
            _ => Self {
                subject: DEFAULT_SUBJECT.to_string(),
                body: DEFAULT_BODY.to_string(),
                kind,
            },
        }
    }
}

/// Sink for operator notifications.
pub trait Notifier {
    /// Queue a notification for later delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be queued.
    fn enqueue(&self, subject: &str, body: &str, kind: NotificationKind) -> Result<()>;
}

/// File-drop notifier writing into an instruction directory.
#[derive(Debug, Clone)]
pub struct FileRelay {
    dir: PathBuf,
}

impl FileRelay {
    /// Relay over `dir`. The directory is created on first enqueue.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Instruction directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deliver every pending instruction of `kind` to `sink`, oldest first,
    /// deleting each once delivered. Returns the number delivered.
    ///
    /// An instruction the sink rejects is left in place for the next drain.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be listed.
    pub fn drain<F>(&self, kind: NotificationKind, mut sink: F) -> Result<usize>
    where
        F: FnMut(&Notification) -> Result<()>,
    {
        if !self.dir.exists() {
            return Ok(0);
        }
        let queue = WorkQueue::new(&self.dir, kind.suffix());
        let mut delivered = 0;
        for id in queue.scan()? {
            let Some(claim) = queue.claim(&id)? else {
                continue;
            };
            let payload = String::from_utf8_lossy(&claim.read()?).into_owned();
            let notification = Notification::parse(&payload, kind);
            if let Err(e) = sink(&notification) {
                warn!(id = %id, error = %e, "notification delivery failed, keeping instruction");
                continue;
            }
            claim.retire()?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

impl Notifier for FileRelay {
    fn enqueue(&self, subject: &str, body: &str, kind: NotificationKind) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let now = Utc::now();
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", now.format("%Y%m%dT%H%M%S%.6f"), &tag[..8]);
        let payload = format!("{}\n{}\n", one_line(subject), one_line(body));
        WorkQueue::new(&self.dir, kind.suffix()).publish(&id, payload.as_bytes())?;
        info!(subject, kind = kind.suffix(), "operator notification queued");
        Ok(())
    }
}

fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// In-memory notifier that records every message.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages recorded so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn enqueue(&self, subject: &str, body: &str, kind: NotificationKind) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Notification {
                subject: subject.to_string(),
                body: body.to_string(),
                kind,
            });
        }
        Ok(())
    }
}

impl<N: Notifier + ?Sized> Notifier for &N {
    fn enqueue(&self, subject: &str, body: &str, kind: NotificationKind) -> Result<()> {
        (**self).enqueue(subject, body, kind)
    }
}
