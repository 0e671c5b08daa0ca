use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use crate::engine::Event;

/// The deadline families a lobby can have pending. At most one timer per
/// family is armed at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFamily {
    /// Per-turn submission deadline during round1/round2.
    Turn,
    /// Impostor-guess deadline.
    Guess,
    /// Short delay between round2 completing and the voting kickoff event.
    VotingDelay,
}

/// A single pending deadline: the absolute timestamp, the generation that
/// distinguishes it from earlier timers of the same family, and the handle
/// to abort the sleeping task.
pub struct TimerSlot {
    deadline: DateTime<Utc>,
    generation: u64,
    abort: AbortHandle,
}

/// Per-lobby timer state. Arming a family always cancels whatever was
/// pending for that family first, so a fast phase transition can never
/// leave a duplicate firing behind; a firing whose generation no longer
/// matches is dropped by the engine.
#[derive(Default)]
pub struct Timers {
    turn: Option<TimerSlot>,
    guess: Option<TimerSlot>,
    voting_delay: Option<TimerSlot>,
    next_generation: u64,
}

impl Timers {
    /// Arm `family` to fire at `deadline`, replacing any pending timer of
    /// the same family.
    pub fn arm(
        &mut self,
        family: TimerFamily,
        deadline: DateTime<Utc>,
        lobby_id: String,
        events: UnboundedSender<Event>,
    ) {
        self.cancel(family);
        self.next_generation += 1;
        let generation = self.next_generation;
        let delay = (deadline - Utc::now()).to_std().unwrap_or_default();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::TimerFired {
                lobby_id,
                family,
                generation,
            });
        });
        *self.slot_mut(family) = Some(TimerSlot {
            deadline,
            generation,
            abort: task.abort_handle(),
        });
    }

    pub fn cancel(&mut self, family: TimerFamily) {
        if let Some(slot) = self.slot_mut(family).take() {
            slot.abort.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        self.cancel(TimerFamily::Turn);
        self.cancel(TimerFamily::Guess);
        self.cancel(TimerFamily::VotingDelay);
    }

    /// True if `generation` is the currently armed timer of `family`.
    /// Stale firings (superseded or cancelled timers) do not match.
    pub fn matches(&self, family: TimerFamily, generation: u64) -> bool {
        self.slot(family)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    /// Drop the slot for a timer that has just fired, without aborting.
    pub fn clear(&mut self, family: TimerFamily) {
        *self.slot_mut(family) = None;
    }

    pub fn deadline(&self, family: TimerFamily) -> Option<DateTime<Utc>> {
        self.slot(family).map(|slot| slot.deadline)
    }

    fn slot(&self, family: TimerFamily) -> Option<&TimerSlot> {
        match family {
            TimerFamily::Turn => self.turn.as_ref(),
            TimerFamily::Guess => self.guess.as_ref(),
            TimerFamily::VotingDelay => self.voting_delay.as_ref(),
        }
    }

    fn slot_mut(&mut self, family: TimerFamily) -> &mut Option<TimerSlot> {
        match family {
            TimerFamily::Turn => &mut self.turn,
            TimerFamily::Guess => &mut self.guess,
            TimerFamily::VotingDelay => &mut self.voting_delay,
        }
    }
}
