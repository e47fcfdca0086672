//! Sliding-window rate limiting for inbound queries.
//!
//! Limits are written `"<events>/<interval>"`, e.g. `"50/1s"` or
//! `"1000/10m"`. Interval units: `ms`, `s`, `m`, `h`, `d`; a bare number is
//! milliseconds. `"unlimited"` admits everything.

use crate::error::{constants, IcpError, Result};
use crate::service::collaborators::RateLimiter;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Parsed rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSpec {
    Unlimited,
    Limited { events: u32, interval: Duration },
}

impl FromStr for RateSpec {
    type Err = IcpError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(RateSpec::Unlimited);
        }
        let invalid = || IcpError::InvalidRateLimit(s.to_string());

        let (events, interval) = s.split_once('/').ok_or_else(invalid)?;
        let events: u32 = events.trim().parse().map_err(|_| invalid())?;
        let interval = parse_interval(interval.trim()).ok_or_else(invalid)?;
        if events == 0 || interval.is_zero() {
            return Err(invalid());
        }
        Ok(RateSpec::Limited { events, interval })
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSpec::Unlimited => f.write_str("unlimited"),
            RateSpec::Limited { events, interval } => {
                write!(f, "{events}/{}ms", interval.as_millis())
            }
        }
    }
}

fn parse_interval(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;
    let millis = match unit.trim() {
        "" | "ms" => value,
        "s" => value.checked_mul(1_000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        "d" => value.checked_mul(86_400_000)?,
        _ => return None,
    };
    Some(Duration::from_millis(millis))
}

#[derive(Debug)]
struct Window {
    spec: RateSpec,
    /// Times of admitted events inside the current window, oldest first.
    events: VecDeque<Instant>,
}

impl Window {
    fn admit(&mut self, now: Instant) -> bool {
        let RateSpec::Limited { events, interval } = self.spec else {
            return true;
        };
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) >= interval {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= events as usize {
            return false;
        }
        self.events.push_back(now);
        true
    }
}

/// Admits at most N events in any sliding interval.
#[derive(Debug)]
pub struct WindowRateLimiter {
    window: Mutex<Window>,
}

impl WindowRateLimiter {
    pub fn new(spec: RateSpec) -> Self {
        Self {
            window: Mutex::new(Window {
                spec,
                events: VecDeque::new(),
            }),
        }
    }

    pub fn from_spec(spec: &str) -> Result<Self> {
        Ok(Self::new(spec.parse()?))
    }

    pub fn unlimited() -> Self {
        Self::new(RateSpec::Unlimited)
    }

    pub fn spec(&self) -> Result<RateSpec> {
        self.window
            .lock()
            .map(|w| w.spec)
            .map_err(|_| IcpError::LockPoisoned(constants::ERR_RATE_LIMITER_LOCK))
    }

    /// Admission check against an explicit clock.
    pub fn allow_at(&self, now: Instant) -> bool {
        match self.window.lock() {
            Ok(mut window) => window.admit(now),
            Err(_) => {
                warn!("{}", constants::ERR_RATE_LIMITER_LOCK);
                false
            }
        }
    }
}

impl RateLimiter for WindowRateLimiter {
    fn allow_now(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Switching to a different limit forgets the recorded events.
    fn reconfigure(&self, spec: &str) -> Result<()> {
        let spec: RateSpec = spec.parse()?;
        let mut window = self
            .window
            .lock()
            .map_err(|_| IcpError::LockPoisoned(constants::ERR_RATE_LIMITER_LOCK))?;
        if window.spec != spec {
            window.spec = spec;
            window.events.clear();
        }
        Ok(())
    }
}
