use crate::error::{PlcError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Throttles `advance()` so simulated time runs `acceleration` times faster
/// than wall time. Meant for demos a human is watching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    pub acceleration: f64,
}

impl Pacing {
    /// Slowest supported pacing: one simulated second per thousand wall
    /// seconds.
    pub const MIN_ACCELERATION: f64 = 1e-3;

    pub fn new(acceleration: f64) -> Result<Self> {
        if !acceleration.is_finite() || acceleration < Self::MIN_ACCELERATION {
            return Err(PlcError::InvalidConfig {
                reason: format!(
                    "acceleration must be a number of at least {}, got {acceleration}",
                    Self::MIN_ACCELERATION
                ),
            });
        }
        Ok(Self { acceleration })
    }

    /// Wall time that `sim` of simulated time should take, if representable.
    fn wall_time(&self, sim: Duration) -> Option<Duration> {
        Duration::try_from_secs_f64(sim.as_secs_f64() / self.acceleration).ok()
    }

    pub fn real_time() -> Self {
        Self { acceleration: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvent {
    pub tick: u64,
    pub elapsed: Duration,
}

struct PacingState {
    pacing: Pacing,
    origin: Instant,
    origin_tick: u64,
}

/// Logical time source. The tick count only changes through [`advance`],
/// moves by exactly one per call and never decreases.
///
/// [`advance`]: SimulationClock::advance
pub struct SimulationClock {
    tick: AtomicU64,
    tick_duration: Duration,
    running: AtomicBool,
    pacing: Mutex<Option<PacingState>>,
    subscribers: Mutex<Vec<Sender<TickEvent>>>,
}

impl SimulationClock {
    pub fn new(tick_duration: Duration) -> Result<Self> {
        if tick_duration.is_zero() {
            return Err(PlcError::InvalidConfig {
                reason: "tick duration must be non-zero".to_string(),
            });
        }
        Ok(Self {
            tick: AtomicU64::new(0),
            tick_duration,
            running: AtomicBool::new(true),
            pacing: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn with_pacing(tick_duration: Duration, pacing: Pacing) -> Result<Self> {
        let clock = Self::new(tick_duration)?;
        *clock.pacing.lock().unwrap_or_else(|e| e.into_inner()) = Some(PacingState {
            pacing,
            origin: Instant::now(),
            origin_tick: 0,
        });
        Ok(clock)
    }

    pub fn now(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Simulated time at the current tick.
    pub fn elapsed(&self) -> Duration {
        self.time_at(self.now())
    }

    pub fn time_at(&self, tick: u64) -> Duration {
        let nanos = self.tick_duration.as_nanos().saturating_mul(u128::from(tick));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn pacing(&self) -> Option<Pacing> {
        self.pacing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.pacing)
    }

    pub fn advance(&self) -> Result<u64> {
        if !self.is_running() {
            return Err(PlcError::ClockStopped { tick: self.now() });
        }
        self.pace();
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        self.broadcast(TickEvent {
            tick,
            elapsed: self.time_at(tick),
        });
        Ok(tick)
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            log::debug!("Simulation clock stopped at tick {}", self.now());
        }
    }

    /// Re-arms a stopped clock. The tick count carries on from where it
    /// stopped; pacing restarts from the current wall time.
    pub fn restart(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            if let Some(state) = self
                .pacing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_mut()
            {
                state.origin = Instant::now();
                state.origin_tick = self.now();
            }
            log::debug!("Simulation clock restarted at tick {}", self.now());
        }
    }

    pub fn subscribe(&self) -> Receiver<TickEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn broadcast(&self, event: TickEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn pace(&self) {
        let target = {
            let guard = self.pacing.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = guard.as_ref() else {
                return;
            };
            let ticks_since_origin = (self.now() + 1).saturating_sub(state.origin_tick);
            let sim = self.time_at(ticks_since_origin);
            match state
                .pacing
                .wall_time(sim)
                .and_then(|wall| state.origin.checked_add(wall))
            {
                Some(target) => target,
                None => {
                    log::warn!(
                        "Pacing target for tick {} is out of range, not throttling",
                        self.now() + 1
                    );
                    return;
                }
            }
        };
        let now = Instant::now();
        if target > now {
            std::thread::sleep(target - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_increments_by_exactly_one() {
        let clock = SimulationClock::new(Duration::from_millis(50)).unwrap();
        assert_eq!(clock.now(), 0);
        for expected in 1..=5 {
            assert_eq!(clock.advance().unwrap(), expected);
            assert_eq!(clock.now(), expected);
        }
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn advance_after_stop_fails() {
        let clock = SimulationClock::new(Duration::from_millis(10)).unwrap();
        clock.advance().unwrap();
        clock.stop();
        assert_eq!(clock.advance(), Err(PlcError::ClockStopped { tick: 1 }));
        assert_eq!(clock.now(), 1);
        clock.restart();
        assert_eq!(clock.advance().unwrap(), 2);
    }

    #[test]
    fn zero_tick_duration_is_rejected() {
        assert!(SimulationClock::new(Duration::ZERO).is_err());
        assert!(Pacing::new(0.0).is_err());
        assert!(Pacing::new(f64::NAN).is_err());
        assert!(Pacing::new(-1.0).is_err());
    }

    #[test]
    fn vanishing_acceleration_is_rejected() {
        assert!(matches!(
            Pacing::new(1e-300),
            Err(PlcError::InvalidConfig { .. })
        ));
        assert!(Pacing::new(Pacing::MIN_ACCELERATION).is_ok());
    }

    #[test]
    fn unrepresentable_wall_time_is_not_a_panic() {
        let pacing = Pacing::new(Pacing::MIN_ACCELERATION).unwrap();
        assert_eq!(pacing.wall_time(Duration::MAX), None);
        let wall = pacing.wall_time(Duration::from_millis(1)).unwrap();
        assert!(wall > Duration::from_millis(999) && wall < Duration::from_millis(1001));
    }

    #[test]
    fn subscribers_receive_every_tick() {
        let clock = SimulationClock::new(Duration::from_millis(20)).unwrap();
        let rx = clock.subscribe();
        clock.advance().unwrap();
        clock.advance().unwrap();
        let events: Vec<TickEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tick, 2);
        assert_eq!(events[1].elapsed, Duration::from_millis(40));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let clock = SimulationClock::new(Duration::from_millis(20)).unwrap();
        drop(clock.subscribe());
        clock.advance().unwrap();
        assert!(clock.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn pacing_throttles_advance() {
        let clock =
            SimulationClock::with_pacing(Duration::from_millis(10), Pacing::new(2.0).unwrap())
                .unwrap();
        let start = Instant::now();
        for _ in 0..4 {
            clock.advance().unwrap();
        }
        // 40ms of simulated time at 2x acceleration.
        assert!(start.elapsed() >= Duration::from_millis(18));
    }
}
