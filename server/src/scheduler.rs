//! Pattern scheduler: which display lights up, in which color, and when
//!
//! Selection is a pure function of the display list, the session's cursor
//! and active device, and a random source. Timing is expressed as spawned
//! tasks that post tick events back into the hub; they never touch state.

use crate::hub::HubEvent;
use rand::seq::SliceRandom;
use rand::Rng;
use shared::Pattern;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// The outcome of one pattern evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Every display gets the same color
    All { color: String },
    /// One display is lit, all others go off
    One { device_id: String, color: String },
}

/// Whether the pattern is driven by a fixed-period timer
pub fn is_timer_driven(pattern: Pattern) -> bool {
    !matches!(pattern, Pattern::Hit)
}

/// Picks the next activation for `pattern`
///
/// `displays` must be in a stable order for the sequential cursor to make
/// sense. Returns `None` when there is nothing to light.
pub fn select<R: Rng>(
    pattern: Pattern,
    displays: &[String],
    active: Option<&str>,
    cursor: &mut Option<usize>,
    colors: &[String],
    rng: &mut R,
) -> Option<Activation> {
    if displays.is_empty() {
        return None;
    }
    let color = colors.choose(rng)?.clone();

    let device_id = match pattern {
        Pattern::Simultaneous => return Some(Activation::All { color }),
        Pattern::Random => displays.choose(rng)?.clone(),
        Pattern::Sequential => {
            let last = displays.len() - 1;
            let next = match *cursor {
                Some(previous) => (previous.min(last) + 1) % displays.len(),
                None => 0,
            };
            *cursor = Some(next);
            displays[next].clone()
        }
        Pattern::Hit => {
            let candidates: Vec<&String> = displays
                .iter()
                .filter(|id| Some(id.as_str()) != active)
                .collect();
            if candidates.is_empty() {
                displays.choose(rng)?.clone()
            } else {
                (*candidates.choose(rng)?).clone()
            }
        }
    };

    Some(Activation::One { device_id, color })
}

/// Spawns a repeating tick every `period`, first firing one period from now
pub fn spawn_ticker(
    events: &mpsc::UnboundedSender<HubEvent>,
    generation: u64,
    period: Duration,
) -> AbortHandle {
    let events = events.clone();
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if events.send(HubEvent::Tick { generation }).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

/// Spawns a single tick after `delay`
pub fn spawn_cooldown(
    events: &mpsc::UnboundedSender<HubEvent>,
    generation: u64,
    delay: Duration,
) -> AbortHandle {
    let events = events.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(HubEvent::Tick { generation });
    })
    .abort_handle()
}
