//! Timer coordinator
//!
//! Owns the run state, the task registry and the tick scheduler. Everything
//! is mutated from a single tokio task draining an [`Event`] mailbox, so
//! commands and ticks run to completion one at a time. Connected channels
//! only ever see the state through [`ServerMessage`] broadcasts.

use crate::registry::TaskRegistry;
use crate::scheduler::{TickScheduler, DEFAULT_TICK_INTERVAL};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticktrack_ipc::{ClientMessage, RunState, ServerMessage, TaskRef, TaskUpdate};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type ChannelId = u64;

/// Outbound half of a connected channel
pub type ChannelSink = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub tick_interval: Duration,
    /// Whether `stopTimer` zeroes the active task's time
    pub stop_resets_duration: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            stop_resets_duration: true,
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Connect { channel: ChannelId, sink: ChannelSink },
    Disconnect { channel: ChannelId },
    Inbound { channel: ChannelId, message: ClientMessage },
    Tick { epoch: u64 },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied,
    Ignored,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Timer coordinator is not running")]
    Closed,
}

pub struct Coordinator {
    registry: TaskRegistry,
    run_state: RunState,
    /// Active task pointer, kept as an id and resolved on use
    active_task: Option<String>,
    scheduler: TickScheduler,
    tick_epoch: u64,
    channels: HashMap<ChannelId, ChannelSink>,
    events: mpsc::UnboundedSender<Event>,
    stop_resets_duration: bool,
}

impl Coordinator {
    /// `events` must feed the mailbox this coordinator is driven from;
    /// scheduler ticks are posted there.
    pub fn new(settings: CoordinatorSettings, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            registry: TaskRegistry::new(),
            run_state: RunState::Stopped,
            active_task: None,
            scheduler: TickScheduler::new(settings.tick_interval),
            tick_epoch: 0,
            channels: HashMap::new(),
            events,
            stop_resets_duration: settings.stop_resets_duration,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        info!(interval = ?self.scheduler.interval(), "Timer coordinator started");
        while let Some(event) = events.recv().await {
            match event {
                Event::Connect { channel, sink } => self.connect(channel, sink),
                Event::Disconnect { channel } => self.disconnect(channel),
                Event::Inbound { channel, message } => {
                    self.handle_message(channel, message);
                }
                Event::Tick { epoch } => self.on_tick(epoch),
                Event::Shutdown => break,
            }
        }
        self.shutdown();
    }

    pub fn connect(&mut self, channel: ChannelId, sink: ChannelSink) {
        debug!(channel, "Channel connected");
        if self.active_index().is_some() {
            let _ = sink.send(ServerMessage::TaskUpdate(self.snapshot()));
        }
        self.channels.insert(channel, sink);
    }

    pub fn disconnect(&mut self, channel: ChannelId) {
        if self.channels.remove(&channel).is_some() {
            debug!(channel, "Channel disconnected");
        }
    }

    /// Apply one inbound command and broadcast the result to every channel.
    pub fn handle_message(&mut self, channel: ChannelId, message: ClientMessage) -> Dispatch {
        let dispatch = match message {
            ClientMessage::StartTimer => self.start_timer(),
            ClientMessage::PauseTimer => self.pause_timer(),
            ClientMessage::StopTimer => self.stop_timer(),
            ClientMessage::UpdateTasks(tasks) => self.update_tasks(&tasks),
            ClientMessage::SetActiveTask(task) => self.set_active_task(&task.id),
        };

        match dispatch {
            Dispatch::Applied => self.broadcast(),
            Dispatch::Ignored => debug!(channel, "Ignored command with no valid target"),
        }
        dispatch
    }

    pub fn on_tick(&mut self, epoch: u64) {
        if epoch != self.tick_epoch || self.run_state != RunState::Running {
            debug!(epoch, current = self.tick_epoch, "Dropping stale tick");
            return;
        }
        if let Some(index) = self.active_index() {
            self.registry.tick(index);
        }
        self.broadcast();
    }

    /// Current state as presented to clients.
    ///
    /// With no task selected the timer always reads as paused at zero, even
    /// if the run state is still `running` from an earlier selection.
    pub fn snapshot(&self) -> TaskUpdate {
        let total_worked = self.registry.total_accumulated_seconds();
        match self.active_index().and_then(|index| self.registry.get(index)) {
            Some(task) => TaskUpdate {
                id: Some(task.id.clone()),
                timer: task.accumulated_seconds,
                run_state: self.run_state,
                total_worked,
            },
            None => TaskUpdate {
                id: None,
                timer: 0,
                run_state: RunState::Paused,
                total_worked,
            },
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Stop ticking and drop every channel.
    pub fn shutdown(&mut self) {
        info!(
            run_state = %self.run_state(),
            channels = self.channel_count(),
            "Timer coordinator shutting down"
        );
        self.scheduler.stop();
        self.channels.clear();
    }

    fn start_timer(&mut self) -> Dispatch {
        if self.active_index().is_none() {
            return Dispatch::Ignored;
        }
        if self.run_state != RunState::Running {
            info!(from = %self.run_state, "Timer running");
            self.run_state = RunState::Running;
        }
        if !self.scheduler.is_running() {
            self.tick_epoch += 1;
            let epoch = self.tick_epoch;
            let events = self.events.clone();
            self.scheduler.start(move || {
                let _ = events.send(Event::Tick { epoch });
            });
        }
        Dispatch::Applied
    }

    fn pause_timer(&mut self) -> Dispatch {
        if self.run_state != RunState::Paused {
            info!(from = %self.run_state, "Timer paused");
        }
        self.run_state = RunState::Paused;
        self.scheduler.stop();
        Dispatch::Applied
    }

    fn stop_timer(&mut self) -> Dispatch {
        if self.run_state != RunState::Stopped {
            info!(from = %self.run_state, "Timer stopped");
        }
        self.run_state = RunState::Stopped;
        self.scheduler.stop();
        if self.stop_resets_duration {
            if let Some(index) = self.active_index() {
                self.registry.reset_duration(index);
            }
        }
        Dispatch::Applied
    }

    fn update_tasks(&mut self, tasks: &[TaskRef]) -> Dispatch {
        self.registry.reconcile(tasks.iter().map(|task| task.id.as_str()));
        if self.registry.is_empty() {
            debug!("Task registry cleared");
        } else {
            debug!(tasks = self.registry.len(), "Task registry reconciled");
        }

        if let Some(id) = &self.active_task {
            if self.registry.find_index_by_id(id).is_none() {
                info!(task = %id, "Active task removed, clearing selection");
                self.active_task = None;
            }
        }
        Dispatch::Applied
    }

    fn set_active_task(&mut self, id: &str) -> Dispatch {
        if self.registry.find_index_by_id(id).is_none() {
            return Dispatch::Ignored;
        }
        info!(task = %id, "Active task selected");
        self.active_task = Some(id.to_string());
        Dispatch::Applied
    }

    fn active_index(&self) -> Option<usize> {
        self.active_task
            .as_deref()
            .and_then(|id| self.registry.find_index_by_id(id))
    }

    fn broadcast(&mut self) {
        let update = ServerMessage::TaskUpdate(self.snapshot());
        self.channels.retain(|channel, sink| {
            let delivered = sink.send(update.clone()).is_ok();
            if !delivered {
                debug!(channel, "Dropping closed channel");
            }
            delivered
        });
    }
}

/// A connected channel as seen by its client-side owner
pub struct ClientChannel {
    pub id: ChannelId,
    pub updates: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Cloneable entry point to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<Event>,
    next_channel: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    pub fn connect(&self) -> Result<ClientChannel, CoordinatorError> {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (sink, updates) = mpsc::unbounded_channel();
        self.post(Event::Connect { channel: id, sink })?;
        Ok(ClientChannel { id, updates })
    }

    pub fn send(&self, channel: ChannelId, message: ClientMessage) -> Result<(), CoordinatorError> {
        self.post(Event::Inbound { channel, message })
    }

    pub fn disconnect(&self, channel: ChannelId) -> Result<(), CoordinatorError> {
        self.post(Event::Disconnect { channel })
    }

    pub fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.post(Event::Shutdown)
    }

    fn post(&self, event: Event) -> Result<(), CoordinatorError> {
        self.events.send(event).map_err(|_| CoordinatorError::Closed)
    }
}

/// Start a coordinator on its own task.
pub fn spawn(settings: CoordinatorSettings) -> (CoordinatorHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(settings, events_tx.clone());
    let task = tokio::spawn(coordinator.run(events_rx));
    let handle = CoordinatorHandle {
        events: events_tx,
        next_channel: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}
