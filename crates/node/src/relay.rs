//! Relay-actuated valve control. The `gpio` feature gates the real rppal
//! driver; without it, a mock implementation tracks state in memory and can
//! inject write failures for fault testing.
//!
//! Valves are normally closed: the relay output HIGH de-energizes the coil
//! (valve closed), LOW energizes it (valve open). A valve is forced closed
//! on drop as a last line of defence.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ValveError;

/// State changes retry on transient write errors before giving up.
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveState {
    Open,
    Closed,
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO valve (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayValve {
    pin: rppal::gpio::OutputPin,
    pin_number: u8,
    state: ValveState,
}

#[cfg(feature = "gpio")]
impl RelayValve {
    pub fn new(pin_number: u8) -> anyhow::Result<Self> {
        use anyhow::Context;

        let gpio = rppal::gpio::Gpio::new().context("failed to initialise GPIO")?;
        let mut pin = gpio
            .get(pin_number)
            .with_context(|| format!("failed to claim GPIO pin {pin_number}"))?
            .into_output();

        // Fail-safe: valve closed at startup.
        pin.set_high();

        debug!(pin = pin_number, "relay valve initialised (closed)");
        Ok(Self {
            pin,
            pin_number,
            state: ValveState::Closed,
        })
    }

    fn apply(&mut self, target: ValveState) -> Result<(), std::io::Error> {
        match target {
            ValveState::Open => self.pin.set_low(),
            ValveState::Closed => self.pin.set_high(),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock valve (development & tests — no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayValve {
    pin_number: u8,
    state: ValveState,
    /// Number of upcoming writes that will fail. Fault-path testing.
    fail_budget: u32,
}

#[cfg(not(feature = "gpio"))]
impl RelayValve {
    pub fn new(pin_number: u8) -> anyhow::Result<Self> {
        debug!(pin = pin_number, "mock relay valve initialised (closed)");
        Ok(Self {
            pin_number,
            state: ValveState::Closed,
            fail_budget: 0,
        })
    }

    /// Make the next `n` hardware writes fail.
    pub fn inject_failures(&mut self, n: u32) {
        self.fail_budget = n;
    }

    fn apply(&mut self, _target: ValveState) -> Result<(), std::io::Error> {
        if self.fail_budget > 0 {
            self.fail_budget -= 1;
            return Err(std::io::Error::other("injected relay write failure"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared behaviour
// ---------------------------------------------------------------------------

impl RelayValve {
    pub fn state(&self) -> ValveState {
        self.state
    }

    pub fn pin(&self) -> u8 {
        self.pin_number
    }

    /// Drive the valve to `target` with bounded retries. Idempotent: a
    /// request for the current state is a no-op.
    pub async fn set_state(&mut self, target: ValveState) -> Result<(), ValveError> {
        if self.state == target {
            debug!(pin = self.pin_number, %target, "valve already in target state");
            return Ok(());
        }

        for attempt in 1..=MAX_RETRIES {
            match self.apply(target) {
                Ok(()) => {
                    self.state = target;
                    debug!(pin = self.pin_number, %target, "valve state applied");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        pin = self.pin_number,
                        %target,
                        attempt,
                        "valve write failed: {e}"
                    );
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(ValveError::Hardware {
            pin: self.pin_number,
            target,
            attempts: MAX_RETRIES,
        })
    }
}

impl Drop for RelayValve {
    fn drop(&mut self) {
        // Best-effort close; must never panic or raise.
        if self.state != ValveState::Closed && self.apply(ValveState::Closed).is_ok() {
            self.state = ValveState::Closed;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
