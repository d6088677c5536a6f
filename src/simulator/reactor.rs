// src/simulator/reactor.rs - Virtual time reactor
use std::cell::RefCell;

use async_trait::async_trait;

use super::event_queue::{SimClock, SimEventQueue};
use crate::scheduler::Reactor;

/// Smallest step the clock takes on every pause.
pub const PAUSE_TICK: f64 = 1e-6;

/// Reactor whose clock only moves when the motion task pauses.
///
/// Pausing jumps the clock forward event by event, firing each scheduled
/// event at its own timestamp and yielding after it so that waiters see the
/// effect before time moves on. Every pause moves the clock forward by at
/// least [`PAUSE_TICK`], so a caller polling with a wake time that rounds to
/// the current time still makes progress.
#[derive(Debug, Default)]
pub struct SimReactor {
    clock: RefCell<SimClock>,
    events: RefCell<SimEventQueue>,
}

impl SimReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` when the clock reaches `waketime`.
    pub fn schedule(&self, waketime: f64, label: &'static str, action: impl FnOnce() + 'static) {
        self.events.borrow_mut().push(waketime, label, action);
    }

    pub fn pending_events(&self) -> usize {
        self.events.borrow().len()
    }

    fn fire_next_due(&self, waketime: f64) -> bool {
        let event = self.events.borrow_mut().pop_due(waketime);
        match event {
            Some(event) => {
                self.clock.borrow_mut().advance_to(event.timestamp);
                tracing::trace!("sim event '{}' at {:.6}", event.label, event.timestamp);
                event.fire();
                true
            }
            None => false,
        }
    }
}

#[async_trait(?Send)]
impl Reactor for SimReactor {
    fn monotonic(&self) -> f64 {
        self.clock.borrow().as_secs_f64()
    }

    async fn pause(&self, waketime: f64) -> f64 {
        let waketime = waketime.max(self.monotonic() + PAUSE_TICK);
        while self.fire_next_due(waketime) {
            tokio::task::yield_now().await;
        }
        self.clock.borrow_mut().advance_to(waketime);
        tokio::task::yield_now().await;
        self.monotonic()
    }
}
