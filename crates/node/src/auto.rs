//! Decides *whether* the daily automatic cycle should fire: the wall clock
//! must land inside the scheduled minute, at most once per day. Pausing is
//! volatile; a restart reverts to the configured enabled flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::debug;

use crate::config::AutomationConfig;

pub struct AutoIrrigationService {
    enabled: bool,
    hour: u8,
    minute: u8,
    paused: AtomicBool,
    last_fired: Mutex<Option<DateTime<Local>>>,
}

impl AutoIrrigationService {
    pub fn new(automation: &AutomationConfig) -> Self {
        Self {
            enabled: automation.auto_enabled,
            hour: automation.scheduled_hour,
            minute: automation.scheduled_minute,
            paused: AtomicBool::new(false),
            last_fired: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Suspend automatic cycles. In-process only; restarting the node
    /// resumes per the configured flag.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// One evaluation of the schedule, driven by the periodic tick.
    pub fn should_fire(&self, now: DateTime<Local>) -> bool {
        if !self.enabled || self.is_paused() {
            return false;
        }
        if now.hour() != self.hour as u32 || now.minute() != self.minute as u32 {
            return false;
        }

        // At most one trigger per scheduled window; the latch clears with
        // the calendar day.
        let last = self.last_fired.lock().expect("auto latch lock");
        match *last {
            Some(fired) if same_day(fired, now) => {
                debug!("auto cycle already fired today");
                false
            }
            _ => true,
        }
    }

    pub fn mark_fired(&self, now: DateTime<Local>) {
        *self.last_fired.lock().expect("auto latch lock") = Some(now);
    }
}

fn same_day(a: DateTime<Local>, b: DateTime<Local>) -> bool {
    a.year() == b.year() && a.ordinal() == b.ordinal()
}

// ===========================================================================
// Tests
// ===========================================================================
