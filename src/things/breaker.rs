//! Per-process circuit breaker guarding the hot-path RPC calls to the
//! things service.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum number of observed requests before the breaker may trip.
const MIN_REQUESTS: u32 = 3;

/// The breaker trips once `failures / requests` reaches this ratio.
const MAX_FAILURE_RATIO: f64 = 0.6;

/// How long a tripped breaker fails fast before probing again.
const OPEN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum State {
    Closed { requests: u32, failures: u32 },
    Open { until: Instant },
    /// One probe request is allowed through; its outcome decides the next
    /// state.
    HalfOpen { probing: bool },
}

/// Request-counting circuit breaker.
///
/// Callers bracket each RPC with [`Breaker::admit`] and one of
/// [`Breaker::record_success`] / [`Breaker::record_failure`]. Only transport
/// failures should be recorded as failures; a clean denial from the service
/// is a successful round trip.
#[derive(Debug)]
pub struct Breaker {
    state: Mutex<State>,
    open_interval: Duration,
}

impl Default for Breaker {
    fn default() -> Self {
        Breaker::new(OPEN_INTERVAL)
    }
}

impl Breaker {
    pub fn new(open_interval: Duration) -> Breaker {
        Breaker {
            state: Mutex::new(State::Closed {
                requests: 0,
                failures: 0,
            }),
            open_interval,
        }
    }

    /// Returns `false` when the breaker is open and the call must fail fast.
    pub fn admit(&self) -> bool {
        let mut state = self.state.lock().expect("breaker mutex poisoned");

        match &mut *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if Instant::now() < *until {
                    return false;
                }

                *state = State::HalfOpen { probing: true };
                true
            }
            State::HalfOpen { probing } => {
                if *probing {
                    return false;
                }

                *probing = true;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");

        match &mut *state {
            State::Closed { requests, .. } => *requests += 1,
            State::HalfOpen { .. } => {
                *state = State::Closed {
                    requests: 0,
                    failures: 0,
                };
            }
            // A response from before the trip; the open timer stands.
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");

        match &mut *state {
            State::Closed { requests, failures } => {
                *requests += 1;
                *failures += 1;

                let ratio = f64::from(*failures) / f64::from(*requests);
                if *requests >= MIN_REQUESTS && ratio >= MAX_FAILURE_RATIO {
                    tracing::warn!(
                        requests = *requests,
                        failures = *failures,
                        "things service breaker tripped"
                    );

                    *state = State::Open {
                        until: Instant::now() + self.open_interval,
                    };
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open {
                    until: Instant::now() + self.open_interval,
                };
            }
            State::Open { .. } => {}
        }
    }
}
