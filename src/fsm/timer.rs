//! One-shot, restartable timers feeding the state machine.
//!
//! Each `start` spawns a sleeper task that, once the delay elapses, locks
//! the FSM and dispatches its event. Interrupting the sleep is not enough
//! for correctness: the sleeper may already be queued on the FSM mutex when
//! `cancel` runs. Every timer therefore carries a generation counter that
//! `cancel` and `reset` bump; the sleeper re-checks it *under the FSM lock*
//! and suppresses itself when it lost the race. Since transitions cancel
//! timers while holding that same lock, a handler can never fire after
//! `cancel` returned.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use tokio::{sync::Mutex, task::JoinHandle};

use super::{event::FsmEvent, Fsm};

pub(super) struct FsmTimer {
    name: &'static str,
    generation: Arc<AtomicU64>,
    sleeper: Option<JoinHandle<()>>,
}

impl FsmTimer {
    pub(super) fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: Arc::new(AtomicU64::new(0)),
            sleeper: None,
        }
    }

    /// Arm the timer; an already armed timer is restarted.
    pub(super) fn start(&mut self, delay: Duration, fsm: Weak<Mutex<Fsm>>, event: FsmEvent) {
        self.cancel();

        let name = self.name;
        let generation = self.generation.clone();
        let armed = generation.load(Ordering::SeqCst);

        self.sleeper = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(fsm) = fsm.upgrade() else {
                return;
            };
            let mut fsm = fsm.lock().await;
            if generation.load(Ordering::SeqCst) != armed {
                // canceled between wake-up and lock acquisition
                return;
            }
            tracing::trace!(timer = name, "timer expired");
            fsm.process_event(event).await;
        }));
    }

    /// Guarantee that no handler of this timer runs after the call returns;
    /// must be invoked with the FSM lock held.
    pub(super) fn cancel(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(sleeper) = self.sleeper.take() {
            sleeper.abort();
        }
    }
}

impl Drop for FsmTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
