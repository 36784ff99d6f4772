//! Recording fakes for the pipeline's collaborators.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::alert::Alerter;
use crate::download::Fetcher;
use crate::error::{AlertError, DeliveryError, FetchError};
use crate::notifier::{ChatNotifier, MediaKind, OutgoingMedia};

#[derive(Default)]
pub struct RecordingAlerter {
    pub messages: RefCell<Vec<String>>,
}

impl RecordingAlerter {
    pub fn count(&self) -> usize {
        self.messages.borrow().len()
    }
}

impl Alerter for RecordingAlerter {
    fn alert(&self, message: &str) -> Result<(), AlertError> {
        self.messages.borrow_mut().push(message.to_string());
        Ok(())
    }
}

/// A webhook that is down: every alert fails, attempts are counted.
#[derive(Default)]
pub struct FailingAlerter {
    attempts: Cell<usize>,
}

impl FailingAlerter {
    pub fn attempts(&self) -> usize {
        self.attempts.get()
    }
}

impl Alerter for FailingAlerter {
    fn alert(&self, _message: &str) -> Result<(), AlertError> {
        self.attempts.set(self.attempts.get() + 1);
        Err(AlertError::Status(503))
    }
}

/// Serves fixed bytes for every URL, or fails every request.
pub struct FakeFetcher {
    body: Option<Vec<u8>>,
    calls: Cell<usize>,
}

impl FakeFetcher {
    pub fn serving(body: Vec<u8>) -> Self {
        Self { body: Some(body), calls: Cell::new(0) }
    }

    pub fn failing() -> Self {
        Self { body: None, calls: Cell::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, _url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.calls.set(self.calls.get() + 1);
        let Some(body) = &self.body else {
            return Err(FetchError::Status(503));
        };
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(dest, body)?;
        Ok(body.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Single {
        kind: MediaKind,
        file_name: String,
        caption: Option<String>,
    },
    Group {
        file_names: Vec<String>,
        captions: Vec<Option<String>>,
    },
}

/// How the fake answers a media group send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    Deliver,
    /// Answer with fewer ids than items submitted.
    DropLast,
    Fail,
}

pub struct FakeNotifier {
    pub sent: RefCell<Vec<Sent>>,
    pub group_mode: GroupMode,
    /// File names whose single send fails with an api error.
    pub failing: HashSet<String>,
    /// File names the platform rejects as too large.
    pub too_large: HashSet<String>,
    next_id: Cell<i64>,
}

impl Default for FakeNotifier {
    fn default() -> Self {
        Self {
            sent: RefCell::new(Vec::new()),
            group_mode: GroupMode::Deliver,
            failing: HashSet::new(),
            too_large: HashSet::new(),
            next_id: Cell::new(100),
        }
    }
}

impl FakeNotifier {
    pub fn with_group_mode(group_mode: GroupMode) -> Self {
        Self { group_mode, ..Default::default() }
    }

    fn id(&self) -> i64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    pub fn singles(&self) -> usize {
        self.sent.borrow().iter().filter(|s| matches!(s, Sent::Single { .. })).count()
    }

    pub fn groups(&self) -> usize {
        self.sent.borrow().iter().filter(|s| matches!(s, Sent::Group { .. })).count()
    }

    pub fn texts(&self) -> usize {
        self.sent.borrow().iter().filter(|s| matches!(s, Sent::Text(_))).count()
    }
}

impl ChatNotifier for FakeNotifier {
    fn send_text(&self, _chat_id: &str, text: &str) -> Result<i64, DeliveryError> {
        self.sent.borrow_mut().push(Sent::Text(text.to_string()));
        Ok(self.id())
    }

    fn send_single_media(&self, _chat_id: &str, media: OutgoingMedia) -> Result<i64, DeliveryError> {
        let file_name = media.file_name;
        if self.too_large.contains(&file_name) {
            return Err(DeliveryError::FileTooLarge("Request Entity Too Large".to_string()));
        }
        if self.failing.contains(&file_name) {
            return Err(DeliveryError::Api("Bad Request: wrong file".to_string()));
        }
        self.sent.borrow_mut().push(Sent::Single {
            kind: media.kind,
            file_name,
            caption: media.caption,
        });
        Ok(self.id())
    }

    fn send_media_group(
        &self,
        _chat_id: &str,
        media: Vec<OutgoingMedia>,
    ) -> Result<Vec<i64>, DeliveryError> {
        if self.group_mode == GroupMode::Fail {
            return Err(DeliveryError::Api("Bad Request: group failed".to_string()));
        }
        let mut ids: Vec<i64> = media.iter().map(|_| self.id()).collect();
        self.sent.borrow_mut().push(Sent::Group {
            file_names: media.iter().map(|m| m.file_name.clone()).collect(),
            captions: media.into_iter().map(|m| m.caption).collect(),
        });
        if self.group_mode == GroupMode::DropLast {
            ids.pop();
        }
        Ok(ids)
    }
}
