//! Game session state machine
//!
//! One session exists for the lifetime of the process. It cycles between
//! idle, running and paused on controller commands and owns the single
//! outstanding scheduled activation.

use log::{debug, info};
use shared::{GameSettings, GameStateKind, Pattern};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
}

impl From<SessionState> for GameStateKind {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Idle => GameStateKind::Idle,
            SessionState::Running => GameStateKind::Running,
            SessionState::Paused => GameStateKind::Paused,
        }
    }
}

/// Handle to the one pending pattern tick
#[derive(Debug)]
pub struct ScheduledActivation {
    generation: u64,
    repeating: bool,
    handle: AbortHandle,
}

impl ScheduledActivation {
    fn cancel(self) {
        self.handle.abort();
    }
}

/// Effect of an accepted transition, for the hub to act on
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started(Pattern),
    Paused,
    Stopped,
}

#[derive(Debug)]
pub struct GameSession {
    state: SessionState,
    settings: Option<GameSettings>,
    active_device: Option<String>,
    /// Position of the last sequential activation in the display list
    sequential_cursor: Option<usize>,
    timer: Option<ScheduledActivation>,
    generation: u64,
}

impl Default for GameSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GameSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            settings: None,
            active_device: None,
            sequential_cursor: None,
            timer: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> Option<&GameSettings> {
        self.settings.as_ref()
    }

    pub fn pattern(&self) -> Option<Pattern> {
        self.settings.as_ref().map(|s| s.pattern)
    }

    pub fn is_running_hit(&self) -> bool {
        self.state == SessionState::Running && self.pattern() == Some(Pattern::Hit)
    }

    pub fn active_device(&self) -> Option<&str> {
        self.active_device.as_deref()
    }

    pub fn set_active_device(&mut self, device_id: Option<String>) {
        self.active_device = device_id;
    }

    pub fn sequential_cursor_mut(&mut self) -> &mut Option<usize> {
        &mut self.sequential_cursor
    }

    /// Applies a `gameState` command; `None` means the transition is illegal
    ///
    /// Starting requires settings, either carried by the command or kept from
    /// an earlier start. Settings are assumed validated by the caller.
    pub fn apply(
        &mut self,
        requested: GameStateKind,
        settings: Option<GameSettings>,
    ) -> Option<Transition> {
        match requested {
            GameStateKind::Running => {
                let settings = settings.or_else(|| self.settings.clone())?;
                if self.state == SessionState::Running && settings.pattern != Pattern::Hit {
                    return None;
                }
                let pattern = settings.pattern;
                self.disarm();
                self.state = SessionState::Running;
                self.settings = Some(settings);
                self.active_device = None;
                self.sequential_cursor = None;
                info!("Game running with {:?} pattern", pattern);
                Some(Transition::Started(pattern))
            }
            GameStateKind::Paused => {
                if self.state != SessionState::Running {
                    return None;
                }
                self.disarm();
                self.state = SessionState::Paused;
                self.active_device = None;
                info!("Game paused");
                Some(Transition::Paused)
            }
            GameStateKind::Idle => {
                if self.state == SessionState::Idle {
                    return None;
                }
                self.disarm();
                self.state = SessionState::Idle;
                self.settings = None;
                self.active_device = None;
                self.sequential_cursor = None;
                info!("Game stopped");
                Some(Transition::Stopped)
            }
        }
    }

    /// Cancels any outstanding activation and installs the one built by `spawn`
    ///
    /// `spawn` receives the generation its tick events must carry.
    pub fn arm<F>(&mut self, repeating: bool, spawn: F)
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        self.disarm();
        let generation = self.generation;
        let handle = spawn(generation);
        debug!("Armed activation timer generation {}", generation);
        self.timer = Some(ScheduledActivation {
            generation,
            repeating,
            handle,
        });
    }

    /// Cancels the outstanding activation, if any
    ///
    /// Bumping the generation invalidates ticks already queued by the
    /// cancelled timer.
    pub fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!("Cancelled activation timer generation {}", timer.generation);
            timer.cancel();
        }
        self.generation += 1;
    }

    /// Accepts a tick if it belongs to the current timer
    ///
    /// One-shot timers are consumed by their tick.
    pub fn accept_tick(&mut self, generation: u64) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                if !timer.repeating {
                    self.timer = None;
                }
                true
            }
            _ => false,
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}
