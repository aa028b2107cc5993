//! The hub: single owner of every piece of mutable server state
//!
//! Network tasks and timers never mutate state themselves. They post
//! [`HubEvent`]s into one channel and the hub applies them one at a time,
//! which keeps the registry, pending set and session consistent without
//! locks. Hit relaying lives here too since it touches all three.

use crate::arbiter::RoleArbiter;
use crate::broadcast::{Outbox, PeerSender};
use crate::config::{ServerConfig, MAX_NAME_LENGTH, MIN_NAME_LENGTH};
use crate::error::HubError;
use crate::registry::{ConnectionId, Registry};
use crate::scheduler::{self, Activation};
use crate::session::{GameSession, SessionState, Transition};
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    now_millis, parse_client_message, ClientMessage, Command, DeviceAssignment, Envelope,
    GameStateKind, HitReport, Pattern, Payload, Role,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Everything that can change server state
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        conn: ConnectionId,
        peer: SocketAddr,
        sender: PeerSender,
    },
    Message {
        conn: ConnectionId,
        text: String,
    },
    Closed {
        conn: ConnectionId,
    },
    Error {
        conn: ConnectionId,
        error: String,
    },
    /// Deferred role-selection check for one connection
    RoleTimeout {
        conn: ConnectionId,
    },
    /// Periodic safety-net sweep over pending connections
    Sweep,
    /// Pattern scheduler timer fired
    Tick {
        generation: u64,
    },
    Shutdown,
}

pub struct Hub {
    registry: Registry,
    arbiter: RoleArbiter,
    outbox: Outbox,
    session: GameSession,
    events: mpsc::UnboundedSender<HubEvent>,
    rng: StdRng,
}

impl Hub {
    pub fn new(config: &ServerConfig, events: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self::with_rng(config, events, StdRng::from_entropy())
    }

    pub fn with_rng(
        config: &ServerConfig,
        events: mpsc::UnboundedSender<HubEvent>,
        rng: StdRng,
    ) -> Self {
        Self {
            registry: Registry::new(),
            arbiter: RoleArbiter::new(config.role_timeout),
            outbox: Outbox::new(),
            session: GameSession::new(),
            events,
            rng,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    pub fn pending_count(&self) -> usize {
        self.arbiter.pending_count()
    }

    /// Applies one event; returns false once the hub has shut down
    pub fn handle(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Connected { conn, peer, sender } => {
                info!("New client attempting to connect {} from {}", conn, peer);
                self.outbox.attach(conn, sender);
                self.arbiter.accept(conn, &self.events);
            }
            HubEvent::Message { conn, text } => {
                if let Err(e) = self.on_message(conn, &text) {
                    match e {
                        HubError::MalformedMessage(_) => {
                            warn!("Dropping message from {}: {}", conn, e)
                        }
                        _ => debug!("Dropping message from {}: {}", conn, e),
                    }
                }
            }
            HubEvent::Closed { conn } => self.on_closed(conn),
            HubEvent::Error { conn, error } => {
                warn!("{}", HubError::Transport(conn, error));
                self.registry.mark_closed(conn);
                self.outbox.close(conn);
                self.on_closed(conn);
            }
            HubEvent::RoleTimeout { conn } => {
                if self.arbiter.expire(conn) {
                    info!("{}, closing", HubError::RoleSelectionTimeout(conn));
                    self.outbox.close(conn);
                }
            }
            HubEvent::Sweep => {
                for conn in self.arbiter.sweep(Instant::now()) {
                    info!("Cleaning up stale pending connection {}", conn);
                    self.outbox.close(conn);
                }
            }
            HubEvent::Tick { generation } => {
                if self.session.accept_tick(generation) {
                    self.activate_next();
                } else {
                    debug!("Ignoring stale tick generation {}", generation);
                }
            }
            HubEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn on_message(&mut self, conn: ConnectionId, text: &str) -> Result<(), HubError> {
        if !self.outbox.is_open(conn) {
            return Ok(());
        }
        match parse_client_message(text)? {
            ClientMessage::Join { role, username } => self.on_join(conn, role, username),
            ClientMessage::Command(command) => self.on_command(conn, command),
            ClientMessage::Hit(report) => self.on_hit(conn, report),
        }
    }

    fn on_join(
        &mut self,
        conn: ConnectionId,
        role: Role,
        username: Option<String>,
    ) -> Result<(), HubError> {
        self.arbiter.resolve(conn);
        let username = username.unwrap_or_else(|| self.generate_username(role));

        let device = match self
            .registry
            .register(conn, role, username, &mut self.rng)
        {
            Ok(device) => device,
            Err(e) => {
                warn!("Rejecting {} as {}: {}", conn, role, e);
                let reply = Envelope::system(Payload::Error(e.to_string()));
                self.outbox.send(conn, &reply);
                self.outbox.close(conn);
                return Err(e);
            }
        };

        self.outbox.send(
            conn,
            &Envelope::system(Payload::DeviceUpdate(DeviceAssignment {
                id: device.id.clone(),
            })),
        );
        let notice = format!("{} has joined as {}", device.username, role);
        self.outbox
            .broadcast_all(&self.registry, &Envelope::system(Payload::System(notice)));
        self.outbox.refresh_controller(&self.registry);

        if self.session.state() != SessionState::Idle {
            let current = self.game_state_envelope();
            self.outbox.send(conn, &current);
        }

        if role == Role::Display
            && self.session.is_running_hit()
            && self.session.active_device().is_none()
            && !self.session.has_timer()
        {
            self.activate_next();
        }
        Ok(())
    }

    fn on_command(&mut self, conn: ConnectionId, command: Command) -> Result<(), HubError> {
        let Some(device) = self.registry.get(conn) else {
            return Err(HubError::UnregisteredSender(conn));
        };
        let own_id = device.id.clone();
        let is_controller = self.registry.is_controller(conn);

        match command {
            Command::Color { target_id, color } => {
                if !is_controller {
                    debug!("Ignoring color command from non-master {}", conn);
                    return Ok(());
                }
                let envelope = Envelope::system(Payload::Command(Command::color(None, color)));
                match target_id {
                    Some(target) => {
                        self.outbox.send_to(&self.registry, &target, &envelope);
                    }
                    None => self.outbox.broadcast_all(&self.registry, &envelope),
                }
            }
            Command::GameState {
                game_state,
                settings,
            } => {
                if !is_controller {
                    debug!("Ignoring gameState command from non-master {}", conn);
                    return Ok(());
                }
                if let Some(settings) = &settings {
                    settings.validate()?;
                }
                match self.session.apply(game_state, settings) {
                    Some(transition) => self.on_transition(transition),
                    None => debug!(
                        "Dropping illegal transition {:?} -> {:?}",
                        self.session.state(),
                        game_state
                    ),
                }
            }
            Command::Rename { device_id, name } => {
                let name = name.trim().to_string();
                let length = name.chars().count();
                if !(MIN_NAME_LENGTH..=MAX_NAME_LENGTH).contains(&length) {
                    debug!("Ignoring rename to {:?} from {}", name, conn);
                    return Ok(());
                }
                let target = match device_id {
                    None => Some(conn),
                    Some(id) if id == own_id => Some(conn),
                    Some(id) if is_controller => self.registry.find_by_id(&id).map(|(c, _)| c),
                    Some(_) => None,
                };
                let renamed = match target {
                    Some(target) => self.registry.rename(target, name),
                    None => false,
                };
                if renamed {
                    self.outbox.refresh_controller(&self.registry);
                } else {
                    debug!("Ignoring rename from {}", conn);
                }
            }
            Command::Hit(report) => return self.on_hit(conn, report),
        }
        Ok(())
    }

    fn on_transition(&mut self, transition: Transition) {
        let announcement = self.game_state_envelope();
        self.outbox.broadcast_all(&self.registry, &announcement);

        match transition {
            Transition::Started(pattern) => self.start_pattern(pattern),
            Transition::Paused | Transition::Stopped => {
                let off = Envelope::system(Payload::Command(Command::off()));
                self.outbox.broadcast_displays(&self.registry, &off);
            }
        }
    }

    fn start_pattern(&mut self, pattern: Pattern) {
        // Every pattern lights its first target right away
        self.activate_next();
        if !scheduler::is_timer_driven(pattern) {
            return;
        }
        let Some(period) = self.session.settings().map(|s| s.interval()) else {
            return;
        };
        let events = self.events.clone();
        self.session.arm(true, |generation| {
            scheduler::spawn_ticker(&events, generation, period)
        });
    }

    /// Evaluates the pattern once and sends the resulting color commands
    fn activate_next(&mut self) {
        let Some(settings) = self.session.settings().cloned() else {
            return;
        };
        let displays: Vec<String> = self
            .registry
            .list_displays()
            .into_iter()
            .map(|(_, device)| device.id.clone())
            .collect();
        let active = self.session.active_device().map(str::to_string);

        let activation = scheduler::select(
            settings.pattern,
            &displays,
            active.as_deref(),
            self.session.sequential_cursor_mut(),
            &settings.colors,
            &mut self.rng,
        );

        match activation {
            None => debug!("No display devices to activate"),
            Some(Activation::All { color }) => {
                let envelope =
                    Envelope::system(Payload::Command(Command::color(None, Some(color))));
                self.outbox.broadcast_displays(&self.registry, &envelope);
                self.session.set_active_device(None);
            }
            Some(Activation::One { device_id, color }) => {
                let off = Envelope::system(Payload::Command(Command::off()));
                for id in displays.iter().filter(|id| **id != device_id) {
                    self.outbox.send_to(&self.registry, id, &off);
                }
                let lit = Envelope::system(Payload::Command(Command::color(None, Some(color))));
                self.outbox.send_to(&self.registry, &device_id, &lit);
                debug!("Activated device {}", device_id);
                self.session.set_active_device(Some(device_id));
            }
        }
    }

    /// Relays a display's hit to the controller and schedules the next target
    fn on_hit(&mut self, conn: ConnectionId, report: HitReport) -> Result<(), HubError> {
        let Some(device) = self.registry.get(conn) else {
            return Err(HubError::UnregisteredSender(conn));
        };
        if device.role != Role::Display || !self.session.is_running_hit() {
            debug!("Ignoring hit from {}", conn);
            return Ok(());
        }
        if report.device_id.as_deref().is_some_and(|id| id != device.id) {
            debug!(
                "Hit from {} claims device {:?}, using {}",
                conn, report.device_id, device.id
            );
        }
        let device_id = device.id.clone();
        let username = device.username.clone();

        self.outbox
            .send(conn, &Envelope::system(Payload::Command(Command::off())));

        let relayed = HitReport {
            device_id: Some(device_id.clone()),
            hit_speed: report.hit_speed,
            timestamp: Some(report.timestamp.unwrap_or_else(now_millis)),
        };
        self.outbox.notify_controller(
            &self.registry,
            &Envelope::from_device(Payload::Hit(Command::Hit(relayed)), &username),
        );
        info!("Hit from device {}", device_id);

        let Some(cooldown) = self.session.settings().map(|s| s.interval()) else {
            return Ok(());
        };
        let events = self.events.clone();
        self.session.arm(false, |generation| {
            scheduler::spawn_cooldown(&events, generation, cooldown)
        });
        Ok(())
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        if self.arbiter.resolve(conn).is_some() {
            info!("Unregistered client {} disconnected", conn);
        }
        self.outbox.detach(conn);

        let Some(device) = self.registry.unregister(conn) else {
            return;
        };
        info!("Client {} ({}) disconnected", conn, device.username);

        let was_active = self.session.active_device() == Some(device.id.as_str());
        if was_active {
            self.session.set_active_device(None);
            if self.session.is_running_hit() && !self.session.has_timer() {
                self.activate_next();
            }
        }

        let notice = format!("{} ({}) has disconnected", device.username, device.role);
        self.outbox
            .broadcast_all(&self.registry, &Envelope::system(Payload::System(notice)));
        self.outbox.refresh_controller(&self.registry);
    }

    fn shutdown(&mut self) {
        info!("Closing all existing connections...");
        self.session.disarm();
        self.arbiter.drain();
        self.outbox.close_all();
        self.registry.clear();
        info!("All connections closed.");
    }

    fn game_state_envelope(&self) -> Envelope {
        Envelope::system(Payload::Command(Command::GameState {
            game_state: GameStateKind::from(self.session.state()),
            settings: self.session.settings().cloned(),
        }))
    }

    fn generate_username(&mut self, role: Role) -> String {
        let suffix: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        format!("{}-{}", role, suffix)
    }
}
