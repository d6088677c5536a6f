// src/scheduler/completion.rs - One-shot completion signalled by trigger sources
use tokio::sync::watch;

use super::reactor::Reactor;

/// Snapshot published by a trigger source. A source moves from `Pending` to
/// one of the final states exactly once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerState {
    Pending,
    /// Finished normally; `trigger_time` is the print time a sensor fired at.
    Complete { trigger_time: Option<f64> },
    Failed,
}

impl TriggerState {
    pub fn is_pending(&self) -> bool {
        matches!(self, TriggerState::Pending)
    }
}

/// Writing side of a completion, held by the I/O side of a trigger source.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: watch::Sender<TriggerState>,
}

impl CompletionHandle {
    /// Publish the final state. Returns false if a final state was already published.
    pub fn complete(&self, state: TriggerState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_pending() && !state.is_pending() {
                *current = state;
                true
            } else {
                false
            }
        })
    }

    pub fn state(&self) -> TriggerState {
        *self.tx.borrow()
    }
}

/// Create a linked handle / completion pair.
pub fn completion() -> (CompletionHandle, Completion) {
    let (tx, rx) = watch::channel(TriggerState::Pending);
    (CompletionHandle { tx }, Completion { sources: vec![rx] })
}

/// Reading side of one or more trigger sources.
///
/// A completion over several sources is done once every source finished, or
/// as soon as any source failed.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    sources: Vec<watch::Receiver<TriggerState>>,
}

impl Completion {
    pub fn all(completions: impl IntoIterator<Item = Completion>) -> Self {
        Self {
            sources: completions.into_iter().flat_map(|c| c.sources).collect(),
        }
    }

    pub fn test(&self) -> bool {
        let mut all_done = true;
        for rx in &self.sources {
            match *rx.borrow() {
                TriggerState::Failed => return true,
                TriggerState::Pending => all_done = false,
                TriggerState::Complete { .. } => {}
            }
        }
        all_done
    }

    pub fn failed(&self) -> bool {
        self.sources
            .iter()
            .any(|rx| matches!(*rx.borrow(), TriggerState::Failed))
    }

    pub fn states(&self) -> Vec<TriggerState> {
        self.sources.iter().map(|rx| *rx.borrow()).collect()
    }

    /// Earliest trigger time reported by any source.
    pub fn trigger_time(&self) -> Option<f64> {
        self.states()
            .into_iter()
            .filter_map(|s| match s {
                TriggerState::Complete { trigger_time } => trigger_time,
                _ => None,
            })
            .reduce(f64::min)
    }

    /// Wait until the completion is done or `waketime` passes. Returns `test()`.
    pub async fn wait(&mut self, reactor: &dyn Reactor, waketime: f64) -> bool {
        loop {
            if self.test() {
                return true;
            }
            let woke_on_change = {
                let pending: Vec<_> = self
                    .sources
                    .iter_mut()
                    .filter(|rx| rx.borrow().is_pending())
                    .map(|rx| Box::pin(rx.changed()))
                    .collect();
                tokio::select! {
                    biased;
                    (res, _, _) = futures::future::select_all(pending) => Some(res.is_ok()),
                    _ = reactor.pause(waketime) => None,
                }
            };
            match woke_on_change {
                Some(true) => continue,
                Some(false) => {
                    // A source went away without reporting
                    if !self.test() {
                        reactor.pause(waketime).await;
                    }
                    return self.test();
                }
                None => return self.test(),
            }
        }
    }
}
