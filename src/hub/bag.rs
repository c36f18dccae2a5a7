// Letter lifecycle tracking: pending -> finished | failed, plus history

use crate::hub::clock::now_secs;
use crate::hub::letter::Letter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub const BAG_FINISHED: &str = "Bag-Finished";
pub const BAG_PENDING: &str = "Bag-Pending";
pub const BAG_FAILED: &str = "Bag-Failed";
pub const BAG_HISTORY: &str = "Bag-History";

pub const BAG_NAMES: [&str; 4] = [BAG_FINISHED, BAG_PENDING, BAG_FAILED, BAG_HISTORY];

/// What a bag holds under one uid.
///
/// A second insert under an existing uid turns the slot into a list.
/// Serialized untagged, so a dump shows an object or an array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Slot {
    Single(Letter),
    Many(Vec<Letter>),
}

impl Slot {
    pub fn into_letters(self) -> Vec<Letter> {
        match self {
            Slot::Single(letter) => vec![letter],
            Slot::Many(letters) => letters,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Slot::Single(_) => 1,
            Slot::Many(letters) => letters.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Named, lock-guarded collection of letters keyed by uid
pub struct Bag {
    name: &'static str,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Bag {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store a copy of `letter`; a repeated uid becomes a multi-value slot
    pub async fn insert_letter(&self, letter: &Letter) {
        let mut slots = self.slots.lock().await;
        insert_into(self.name, &mut slots, letter.clone());
    }

    /// Atomically remove and return whatever sits under `uid`.
    ///
    /// `None` means someone else already resolved it, or it was never here.
    pub async fn fetch_letter(&self, uid: &str) -> Option<Slot> {
        let mut slots = self.slots.lock().await;
        slots.remove(uid)
    }

    /// Remove one entry under `uid` equal to `letter`, leaving any other
    /// colliding entries in place
    pub async fn take_entry(&self, uid: &str, letter: &Letter) -> Option<Letter> {
        let mut slots = self.slots.lock().await;
        match slots.remove(uid)? {
            Slot::Single(held) if held == *letter => Some(held),
            Slot::Single(held) => {
                slots.insert(uid.to_string(), Slot::Single(held));
                None
            }
            Slot::Many(mut letters) => {
                let taken = letters
                    .iter()
                    .position(|l| l == letter)
                    .map(|idx| letters.remove(idx));
                match letters.len() {
                    0 => {}
                    1 => {
                        slots.insert(uid.to_string(), Slot::Single(letters.remove(0)));
                    }
                    _ => {
                        slots.insert(uid.to_string(), Slot::Many(letters));
                    }
                }
                taken
            }
        }
    }

    pub async fn contains(&self, uid: &str) -> bool {
        let slots = self.slots.lock().await;
        slots.contains_key(uid)
    }

    pub async fn get(&self, uid: &str) -> Option<Slot> {
        let slots = self.slots.lock().await;
        slots.get(uid).cloned()
    }

    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// JSON object of uid -> letter (or list of letters)
    pub async fn dumps(&self) -> Result<String, serde_json::Error> {
        let slots = self.slots.lock().await;
        serde_json::to_string(&*slots)
    }
}

fn insert_into(bag: &str, slots: &mut HashMap<String, Slot>, letter: Letter) {
    match slots.remove(&letter.uid) {
        None => {
            slots.insert(letter.uid.clone(), Slot::Single(letter));
        }
        Some(existing) => {
            // Collision path: keep every copy, but make duplicates visible.
            tracing::warn!("{} already holds uid {}, keeping both", bag, letter.uid);
            let uid = letter.uid.clone();
            let mut letters = existing.into_letters();
            letters.push(letter);
            slots.insert(uid, Slot::Many(letters));
        }
    }
}

/// The four bags of one mail context
pub struct MailBags {
    pub finished: Bag,
    pub pending: Bag,
    pub failed: Bag,
    pub history: Bag,
}

impl MailBags {
    pub fn new() -> Self {
        Self {
            finished: Bag::new(BAG_FINISHED),
            pending: Bag::new(BAG_PENDING),
            failed: Bag::new(BAG_FAILED),
            history: Bag::new(BAG_HISTORY),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&Bag> {
        match name {
            BAG_FINISHED => Some(&self.finished),
            BAG_PENDING => Some(&self.pending),
            BAG_FAILED => Some(&self.failed),
            BAG_HISTORY => Some(&self.history),
            _ => None,
        }
    }
}

impl Default for MailBags {
    fn default() -> Self {
        Self::new()
    }
}

/// How a pending letter was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Finished,
    Failed,
    /// Already resolved elsewhere (completion or expiry won the race)
    Absent,
}

/// Letter factory and lifecycle owner for one participant
pub struct MailMan {
    session_name: String,
    next_index: AtomicU64,
    bags: Arc<MailBags>,
    timers: TaskTracker,
    cancel: CancellationToken,
}

impl MailMan {
    pub fn new(session_name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_name: session_name.into(),
            next_index: AtomicU64::new(0),
            bags: Arc::new(MailBags::new()),
            timers: TaskTracker::new(),
            cancel,
        }
    }

    /// Mail context with a random session name
    pub fn with_random_name(prefix: &str, cancel: CancellationToken) -> Self {
        Self::new(format!("{}?{}", prefix, Uuid::new_v4()), cancel)
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn bags(&self) -> &MailBags {
        &self.bags
    }

    /// Build a letter with a fresh uid and record it in history
    pub async fn mk_letter(
        &self,
        src: &str,
        dst: &str,
        content: &str,
        timestamp: Option<f64>,
    ) -> Letter {
        let now = now_secs();
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let mut letter = Letter {
            uid: format!("{}-{}", self.session_name, index),
            src: src.to_string(),
            dst: dst.to_string(),
            content: content.to_string(),
            timestamp: timestamp.unwrap_or(now),
            stations: Vec::new(),
            fail_reason: None,
        };
        letter.push_station("origin", now);
        self.bags.history.insert_letter(&letter).await;
        letter
    }

    /// Stamp the letter as passing through `station`
    pub fn pass_letter(&self, letter: &mut Letter, station: &str) {
        letter.push_station(station, now_secs());
    }

    /// Park the letter in `pending` and arm its expiry timer.
    ///
    /// If nothing resolves the uid within `timeout`, the letter moves to
    /// `failed` with an expiry reason.
    pub async fn await_response(&self, letter: &Letter, timeout: Duration) {
        self.bags.pending.insert_letter(letter).await;

        let bags = self.bags.clone();
        let cancel = self.cancel.clone();
        let armed = letter.clone();
        self.timers.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancel.cancelled() => return,
            }
            // Only the entry this timer armed expires; colliding entries keep
            // their own deadlines.
            if let Some(mut letter) = bags.pending.take_entry(&armed.uid, &armed).await {
                tracing::warn!("Letter {} expired without a response", letter.uid);
                letter.fail_reason = Some(format!("Expired after {} ms", timeout.as_millis()));
                bags.failed.insert_letter(&letter).await;
            }
        });
    }

    /// Move the pending letter under `uid` to `finished`
    pub async fn finish(&self, uid: &str) -> Resolution {
        match self.bags.pending.fetch_letter(uid).await {
            Some(slot) => {
                for letter in slot.into_letters() {
                    self.bags.finished.insert_letter(&letter).await;
                }
                Resolution::Finished
            }
            None => Resolution::Absent,
        }
    }

    /// Move the pending letter under `uid` to `failed`, recording why
    pub async fn fail(&self, uid: &str, reason: &str) -> Resolution {
        match self.bags.pending.fetch_letter(uid).await {
            Some(slot) => {
                for mut letter in slot.into_letters() {
                    letter.fail_reason = Some(reason.to_string());
                    self.bags.failed.insert_letter(&letter).await;
                }
                Resolution::Failed
            }
            None => Resolution::Absent,
        }
    }

    /// Resolve a correlated response: an explicit fail reason means failure
    pub async fn resolve(&self, response: &Letter) -> Resolution {
        match &response.fail_reason {
            Some(reason) => self.fail(&response.uid, reason).await,
            None => self.finish(&response.uid).await,
        }
    }

    /// Cancel outstanding expiry timers and wait for them to stop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.timers.close();
        self.timers.wait().await;
    }
}
