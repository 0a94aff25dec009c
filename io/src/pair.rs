use crate::{Pipe, Splice, StreamChannel};
use std::sync::{Arc, Mutex};
use tracing::debug;
use wanproxy_event::{Action, Callback, Event, EventCallback, Lock, Scheduler};

#[derive(Clone, Copy, Debug)]
enum Leg {
    LeftToRight,
    RightToLeft,
}

#[derive(Default)]
struct State {
    callback: Option<EventCallback>,
    complete: Option<Action>,
    left_to_right: Option<Action>,
    right_to_left: Option<Action>,
    remaining: usize,
    finished: bool,
}

impl State {
    fn leg(&mut self, leg: Leg) -> &mut Option<Action> {
        match leg {
            Leg::LeftToRight => &mut self.left_to_right,
            Leg::RightToLeft => &mut self.right_to_left,
        }
    }

    fn finish(&mut self, event: Event) {
        self.finished = true;
        let legs = [self.left_to_right.take(), self.right_to_left.take()];
        drop(legs);
        if let Some(callback) = self.callback.take() {
            self.complete = Some(callback.schedule(event));
        }
    }
}

struct Inner {
    scheduler: Arc<dyn Scheduler>,
    lock: Lock,
    state: Mutex<State>,
}

impl Inner {
    fn callback(self: &Arc<Self>, leg: Leg) -> EventCallback {
        let inner = Arc::downgrade(self);
        Callback::new(self.scheduler.clone(), self.lock.clone(), move |event: Event| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().unwrap();
            if state.finished {
                return;
            }
            match event {
                Event::Done(_) | Event::Eos(_) => {
                    debug!(?leg, "splice leg finished");
                    drop(state.leg(leg).take());
                    state.remaining -= 1;
                    if state.remaining == 0 {
                        state.finish(Event::done());
                    }
                }
                Event::Error(err) => {
                    debug!(?leg, ?err, "splice leg failed");
                    state.finish(Event::Error(err));
                }
                Event::Invalid => panic!("invalid event from splice"),
            }
        })
    }
}

/// Two [Splice]s pumping in opposite directions between a pair of channels, as for both
/// halves of a proxied connection.
///
/// The pair completes with [Event::Done] exactly once, after both directions reached end
/// of stream (in either order). An error in either direction stops the other one and
/// completes the pair with that error.
pub struct SplicePair {
    left: Arc<dyn StreamChannel>,
    right: Arc<dyn StreamChannel>,
    left_to_right: Option<Arc<dyn Pipe>>,
    right_to_left: Option<Arc<dyn Pipe>>,
}

impl SplicePair {
    pub fn new(
        left: Arc<dyn StreamChannel>,
        right: Arc<dyn StreamChannel>,
        left_to_right: Option<Arc<dyn Pipe>>,
        right_to_left: Option<Arc<dyn Pipe>>,
    ) -> Self {
        Self {
            left,
            right,
            left_to_right,
            right_to_left,
        }
    }

    /// Start both directions. `callback` fires exactly once, with [Event::Done] or
    /// [Event::Error].
    pub fn start(self, callback: EventCallback) -> Action {
        let inner = Arc::new(Inner {
            scheduler: callback.scheduler().clone(),
            lock: Lock::new("splice-pair"),
            state: Mutex::new(State {
                callback: Some(callback),
                remaining: 2,
                ..Default::default()
            }),
        });
        let left_to_right = Splice::new(self.left.clone(), self.left_to_right, self.right.clone())
            .start(inner.callback(Leg::LeftToRight));
        let right_to_left = Splice::new(self.right, self.right_to_left, self.left)
            .start(inner.callback(Leg::RightToLeft));
        {
            let mut state = inner.state.lock().unwrap();
            if !state.finished {
                state.left_to_right = Some(left_to_right);
                state.right_to_left = Some(right_to_left);
            }
        }
        Action::new(move || {
            let mut state = inner.state.lock().unwrap();
            state.finished = true;
            state.callback = None;
            let released = [
                state.left_to_right.take(),
                state.right_to_left.take(),
                state.complete.take(),
            ];
            drop(state);
            drop(released);
        })
    }
}
