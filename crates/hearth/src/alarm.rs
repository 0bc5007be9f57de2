//! # Wake-Up Alarms
//!
//! At most one pending alarm per instance. Scheduling replaces any pending
//! alarm; firing delivers a single `AlarmFired` envelope through the
//! instance mailbox, so alarm work is serialized with requests like
//! everything else.
//!
//! The pending fire-at is persisted in the JSON store under a reserved key.
//! A hibernated instance re-arms from that record on wake; a fire-at already
//! in the past fires as soon as the instance is ready. The timer may fire
//! late but never early, and a stale fire (superseded by a reschedule) is
//! skipped. Actors must write idempotent `on_alarm` callbacks: a fire that
//! finds no due work is a safe no-op.

use crate::error::HearthError;
use crate::logger::Logger;
use crate::message::Envelope;
use crate::storage::JsonStore;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const ALARM_KEY: &str = "__hearth_alarm";

struct Pending {
    fire_at: u64,
    timer: JoinHandle<()>,
}

/// Per-instance alarm scheduler. Owned by the instance runtime; the timer
/// task it spawns feeds the same mailbox the runtime drains.
pub struct AlarmScheduler {
    mailbox: mpsc::Sender<Envelope>,
    store: JsonStore,
    log: Logger,
    pending: Option<Pending>,
}

impl AlarmScheduler {
    pub fn new(mailbox: mpsc::Sender<Envelope>, store: JsonStore, log: Logger) -> Self {
        Self {
            mailbox,
            store,
            log,
            pending: None,
        }
    }

    /// Schedules a fire at an absolute time in unix milliseconds, replacing
    /// any pending alarm. The fire-at is persisted before the timer is
    /// armed so a crash between the two re-arms on wake.
    pub async fn schedule_at(&mut self, fire_at: u64) -> Result<(), HearthError> {
        self.store
            .set(ALARM_KEY, &Value::from(fire_at))
            .await
            .map_err(|err| {
                self.log.warn_cause("failed to persist alarm", &err);
                HearthError::AlarmSchedule(err.to_string())
            })?;
        self.arm(fire_at);
        Ok(())
    }

    pub async fn schedule_in(&mut self, delay: Duration) -> Result<(), HearthError> {
        let fire_at = crate::now_ms() + delay.as_millis() as u64;
        self.schedule_at(fire_at).await
    }

    /// Schedules only when nothing is pending. Used by actors that want a
    /// periodic heartbeat without pushing back an alarm armed earlier.
    pub async fn ensure_scheduled(&mut self, delay: Duration) -> Result<(), HearthError> {
        if self.pending.is_some() {
            return Ok(());
        }
        self.schedule_in(delay).await
    }

    /// Cancels the pending alarm, if any, and clears the persisted record.
    pub async fn cancel(&mut self) -> Result<(), HearthError> {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
        self.store.delete(ALARM_KEY).await
    }

    pub fn pending_at(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.fire_at)
    }

    /// Re-arms from the persisted record after a wake. A fire-at already in
    /// the past is armed with zero delay.
    pub async fn re_arm(&mut self) -> Result<bool, HearthError> {
        match self.store.get(ALARM_KEY).await? {
            Some(value) => match value.as_u64() {
                Some(fire_at) => {
                    self.arm(fire_at);
                    Ok(true)
                }
                None => {
                    self.log.warn("persisted alarm record is malformed, discarding");
                    self.store.delete(ALARM_KEY).await?;
                    Ok(false)
                }
            },
            None => Ok(false),
        }
    }

    /// Called by the runtime when an `AlarmFired` envelope arrives. Returns
    /// whether the fire is current; a fire for a superseded schedule is
    /// stale and must be skipped. A current fire clears the pending slot and
    /// the persisted record before the actor callback runs, so the callback
    /// can re-arm freely.
    pub async fn acknowledge(&mut self, scheduled_for: u64) -> Result<bool, HearthError> {
        match &self.pending {
            Some(pending) if pending.fire_at != scheduled_for => return Ok(false),
            _ => {}
        }
        self.pending = None;
        self.store.delete(ALARM_KEY).await?;
        Ok(true)
    }

    fn arm(&mut self, fire_at: u64) {
        if let Some(previous) = self.pending.take() {
            previous.timer.abort();
        }
        let mailbox = self.mailbox.clone();
        let delay = Duration::from_millis(fire_at.saturating_sub(crate::now_ms()));
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Mailbox gone means the instance hibernated; the persisted
            // record re-arms on wake.
            let _ = mailbox
                .send(Envelope::AlarmFired {
                    scheduled_for: fire_at,
                })
                .await;
        });
        self.pending = Some(Pending { fire_at, timer });
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
    }
}
