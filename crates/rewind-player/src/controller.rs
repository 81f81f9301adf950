//! Playback Controller
//!
//! `Player` orchestrates everything below it into a seekable, speed-
//! controlled playback session:
//!
//! ```text
//! Player (handle) ──commands──→ engine task
//!                                  │ tick (~17ms)
//!                                  ▼
//!                  BufferedSource(CachingSource(MergedSource([LogSource..])))
//! ```
//!
//! ## State Machine
//!
//! ```text
//! Uninitialized → Initializing → Paused ⇄ Playing
//!                                  │  ▲      │
//!                                  ▼  │      ▼
//!                                 Seeking ←──┘        Error (terminal)
//! ```
//!
//! - `play()` is valid from `Paused`; `pause()` from `Playing`. Invalid
//!   transitions are ignored with a debug log rather than failing; a UI
//!   hammering the spacebar is not an error.
//! - `seek(t)` is valid from any state except `Initializing` and `Error`.
//!   It drops the current read-ahead iterator (which cancels the producer
//!   and flushes every buffered message), delivers a backfill batch for
//!   the subscribed topics, and resumes at the new position.
//! - `set_speed(f)` takes effect immediately: the current tick interval is
//!   folded at the old speed first, so no simulated time is lost or
//!   double-counted.
//! - Fatal failures (a source that cannot produce an iterator) transition
//!   to `Error`, which only `shutdown()` leaves.
//!
//! ## The Tick
//!
//! Each tick advances simulated time by `elapsed_wall * speed`, drains
//! every already-buffered item up to the new position, and delivers them
//! as one batch to the registered callbacks, synchronously on the tick
//! task. The tick never blocks on I/O: it only calls the buffered
//! iterator's non-blocking `try_next`, and read-ahead happens in the
//! producer task. If the buffer runs dry the tick delivers what it has;
//! the next tick catches up.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use rewind_core::{MessageEvent, Problem, ProblemLog, Subscription, Time, TimeRange};

use crate::buffered::{BufferedIterator, BufferedSource};
use crate::caching::{CachingSource, CachingSourceConfig};
use crate::config::PlayerConfig;
use crate::decode::DecoderRegistry;
use crate::error::{Error, Result};
use crate::merge::MergedSource;
use crate::source::{
    Initialization, IterableSource, IteratorItem, LogSource, ReadArgs, ResourceDescriptor,
};

/// Observable playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Uninitialized,
    Initializing,
    Paused,
    Playing,
    Seeking,
    Error,
}

/// Callback receiving one batch of messages per tick.
pub type MessageBatchCallback = Arc<dyn Fn(&[MessageEvent]) + Send + Sync>;

type Listeners = Arc<RwLock<Vec<MessageBatchCallback>>>;

enum Command {
    Play(oneshot::Sender<()>),
    Pause(oneshot::Sender<()>),
    Seek(Time, oneshot::Sender<Result<()>>),
    SetSpeed(f64, oneshot::Sender<()>),
    Subscribe(Vec<Subscription>, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a playback session.
///
/// All methods communicate with the engine task and return once the engine
/// has applied the command.
pub struct Player {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<PlayerState>,
    time_rx: watch::Receiver<Time>,
    problems: ProblemLog,
    init: Initialization,
    listeners: Listeners,
}

impl Player {
    /// Open and validate every source, then start the engine task paused
    /// at the beginning of the merged range.
    pub async fn initialize(
        descriptors: Vec<ResourceDescriptor>,
        config: PlayerConfig,
        registry: DecoderRegistry,
    ) -> Result<Player> {
        let (state_tx, state_rx) = watch::channel(PlayerState::Initializing);
        let problems = ProblemLog::new();

        // One read-ahead producer per underlying source, so slow sources
        // fetch in parallel instead of serializing behind each other
        let sources: Vec<Arc<dyn IterableSource>> = descriptors
            .into_iter()
            .map(|descriptor| {
                let log = Arc::new(
                    LogSource::new(descriptor, problems.clone())
                        .with_cache_config(config.block_cache.clone()),
                ) as Arc<dyn IterableSource>;
                Arc::new(BufferedSource::new(log, config.read_ahead())) as Arc<dyn IterableSource>
            })
            .collect();

        let merged = Arc::new(MergedSource::new(
            sources,
            config.init_failure_policy,
            problems.clone(),
        ));
        let init = match merged.initialize().await {
            Ok(init) => init,
            Err(err) => {
                let _ = state_tx.send(PlayerState::Error);
                return Err(err);
            }
        };

        // Channels with an encoding nobody can decode are dropped up front,
        // one warning per channel
        let mut supported_topics = HashSet::new();
        let mut warned = HashSet::new();
        for channel in &init.channels {
            if registry.supports(&channel.message_encoding) {
                supported_topics.insert(channel.topic.clone());
            } else if warned.insert((channel.topic.clone(), channel.message_encoding.clone())) {
                problems.push(
                    Problem::warn(format!(
                        "dropping topic {}: unknown message encoding {:?}",
                        channel.topic, channel.message_encoding
                    ))
                    .with_tip("register a decoder for this encoding before initializing"),
                );
            }
        }

        let caching = Arc::new(CachingSource::new(
            merged as Arc<dyn IterableSource>,
            CachingSourceConfig {
                max_bytes: config.message_cache_bytes,
                block_span: config.cache_block_span(),
            },
        ));
        let buffered = BufferedSource::new(
            caching.clone() as Arc<dyn IterableSource>,
            config.read_ahead(),
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (time_tx, time_rx) = watch::channel(init.time_range.start);
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));

        let engine = Engine {
            buffered,
            caching,
            range: init.time_range,
            supported_topics,
            iterator: None,
            lookahead: None,
            current: init.time_range.start,
            speed: config.speed,
            subscriptions: Vec::new(),
            state_tx,
            time_tx,
            problems: problems.clone(),
            listeners: listeners.clone(),
            last_tick: Instant::now(),
            tick_interval: config.tick_interval(),
            warm_task: None,
        };
        tokio::spawn(engine.run(cmd_rx));

        Ok(Player {
            cmd_tx,
            state_rx,
            time_rx,
            problems,
            init,
            listeners,
        })
    }

    /// Start advancing simulated time. Valid from `Paused`.
    pub async fn play(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Play(tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Stop advancing simulated time. Valid from `Playing`.
    pub async fn pause(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Pause(tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Jump to `time` (clamped into the playback range), flushing all
    /// buffered messages and delivering a backfill batch for the
    /// subscribed topics.
    pub async fn seek(&self, time: Time) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Seek(time, tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Rescale simulated-time advance relative to wall clock, effective
    /// immediately. Non-positive factors are ignored.
    pub async fn set_speed(&self, factor: f64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetSpeed(factor, tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Replace the subscription set. The message iterator restarts at the
    /// current position with the new topic filter.
    pub async fn subscribe(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Subscribe(subscriptions, tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Register a callback receiving one batch of messages per tick,
    /// invoked synchronously on the tick task.
    pub fn on_messages(&self, callback: MessageBatchCallback) {
        self.listeners
            .write()
            .expect("listener list poisoned")
            .push(callback);
    }

    /// Stop the engine task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Watch channel of the playback state.
    pub fn state(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    /// Watch channel of the current playback position.
    pub fn current_time(&self) -> watch::Receiver<Time> {
        self.time_rx.clone()
    }

    /// Time range of the merged sources.
    pub fn time_range(&self) -> TimeRange {
        self.init.time_range
    }

    /// Merged initialization result: channels, schemas, statistics.
    pub fn initialization(&self) -> &Initialization {
        &self.init
    }

    /// Snapshot of all problems reported so far.
    pub fn problems(&self) -> Vec<Problem> {
        self.problems.snapshot()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| Error::ShuttingDown)
    }
}

enum Flow {
    Continue,
    Shutdown,
}

struct Engine {
    buffered: BufferedSource,
    caching: Arc<CachingSource>,
    range: TimeRange,
    supported_topics: HashSet<String>,

    iterator: Option<BufferedIterator>,
    lookahead: Option<IteratorItem>,
    current: Time,
    speed: f64,
    subscriptions: Vec<Subscription>,

    state_tx: watch::Sender<PlayerState>,
    time_tx: watch::Sender<Time>,
    problems: ProblemLog,
    listeners: Listeners,

    last_tick: Instant,
    tick_interval: Duration,
    warm_task: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        self.set_state(PlayerState::Paused);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => {
                        if matches!(self.handle(command).await, Flow::Shutdown) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => self.tick(),
            }
        }

        if let Some(warm) = self.warm_task.take() {
            warm.abort();
        }
        debug!("Playback engine stopped");
    }

    fn state(&self) -> PlayerState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: PlayerState) {
        let _ = self.state_tx.send(state);
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Play(ack) => {
                match self.state() {
                    PlayerState::Paused => {
                        self.last_tick = Instant::now();
                        self.set_state(PlayerState::Playing);
                    }
                    state => debug!(?state, "Ignoring play()"),
                }
                let _ = ack.send(());
            }
            Command::Pause(ack) => {
                match self.state() {
                    PlayerState::Playing => {
                        // Fold the partial interval so pause/resume does not
                        // drop simulated time
                        self.tick();
                        self.set_state(PlayerState::Paused);
                    }
                    state => debug!(?state, "Ignoring pause()"),
                }
                let _ = ack.send(());
            }
            Command::SetSpeed(factor, ack) => {
                if factor > 0.0 && factor.is_finite() {
                    // Fold the interval so far at the old speed first
                    if self.state() == PlayerState::Playing {
                        self.tick();
                    }
                    self.speed = factor;
                } else {
                    warn!(factor, "Ignoring non-positive speed factor");
                }
                let _ = ack.send(());
            }
            Command::Seek(time, ack) => {
                let result = self.seek(time).await;
                let _ = ack.send(result);
            }
            Command::Subscribe(subscriptions, ack) => {
                let result = self.resubscribe(subscriptions).await;
                let _ = ack.send(result);
            }
            Command::Shutdown(ack) => {
                self.iterator = None;
                let _ = ack.send(());
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    /// One playback tick: advance simulated time, deliver one batch.
    fn tick(&mut self) {
        if self.state() != PlayerState::Playing {
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick);
        self.last_tick = now;

        let advance = (elapsed.as_secs_f64() * self.speed * 1_000_000_000.0) as u64;
        let sim_end = self.current.saturating_add(advance).min(self.range.end);

        let batch = self.drain_until(sim_end);
        self.current = sim_end;
        let _ = self.time_tx.send(self.current);
        self.deliver(&batch);

        let exhausted = self
            .iterator
            .as_ref()
            .map(|it| it.is_finished())
            .unwrap_or(true);
        if self.current >= self.range.end && exhausted && self.lookahead.is_none() {
            debug!("Reached end of range, pausing");
            self.set_state(PlayerState::Paused);
        }
    }

    /// Drain every already-buffered item at or before `sim_end`.
    ///
    /// Never blocks: only consumes what the read-ahead producer has
    /// already buffered.
    fn drain_until(&mut self, sim_end: Time) -> Vec<MessageEvent> {
        let mut batch = Vec::new();
        loop {
            let item = match self.lookahead.take() {
                Some(item) => item,
                None => {
                    let Some(iterator) = self.iterator.as_mut() else { break };
                    match iterator.try_next() {
                        Some(Ok(item)) => item,
                        Some(Err(err)) => {
                            self.problems.push(
                                Problem::error("playback read failed").with_error(&err),
                            );
                            continue;
                        }
                        None => break,
                    }
                }
            };

            if let Some(t) = item.time() {
                if t > sim_end {
                    self.lookahead = Some(item);
                    break;
                }
            }
            match item {
                IteratorItem::Message(event) => batch.push(event),
                IteratorItem::Problem(problem) => self.problems.push(problem),
                IteratorItem::Stamp(_) => {}
            }
        }
        batch
    }

    fn deliver(&self, batch: &[MessageEvent]) {
        if batch.is_empty() {
            return;
        }
        let callbacks = self
            .listeners
            .read()
            .expect("listener list poisoned")
            .clone();
        for callback in callbacks {
            callback(batch);
        }
    }

    /// Topics that are both subscribed and decodable.
    fn subscribed_topics(&self) -> HashSet<String> {
        self.subscriptions
            .iter()
            .filter(|s| self.supported_topics.contains(&s.topic))
            .map(|s| s.topic.clone())
            .collect()
    }

    async fn seek(&mut self, time: Time) -> Result<()> {
        match self.state() {
            PlayerState::Uninitialized | PlayerState::Initializing => {
                return Err(Error::NotInitialized)
            }
            PlayerState::Error => return Err(Error::Halted),
            _ => {}
        }
        let resume_playing = self.state() == PlayerState::Playing;
        self.set_state(PlayerState::Seeking);

        // Cancel in-flight reads and flush every buffered message
        self.iterator = None;
        self.lookahead = None;

        let target = self.range.clamp(time);
        debug!(target, "Seeking");
        self.current = target;
        let _ = self.time_tx.send(self.current);

        let topics = self.subscribed_topics();
        if !topics.is_empty() {
            match self.buffered.get_backfill(target, &topics).await {
                Ok(backfill) => self.deliver(&backfill),
                Err(err) => self
                    .problems
                    .push(Problem::warn("backfill after seek failed").with_error(&err)),
            }
        }

        self.restart_iterator().await?;
        self.last_tick = Instant::now();
        self.set_state(if resume_playing {
            PlayerState::Playing
        } else {
            PlayerState::Paused
        });
        Ok(())
    }

    async fn resubscribe(&mut self, subscriptions: Vec<Subscription>) -> Result<()> {
        if self.state() == PlayerState::Error {
            return Err(Error::Halted);
        }
        for subscription in &subscriptions {
            if !self.supported_topics.contains(&subscription.topic) {
                debug!(topic = %subscription.topic, "Subscription to unknown or undecodable topic");
            }
        }
        self.subscriptions = subscriptions;

        // Restart the iterator at the current position with the new filter
        self.iterator = None;
        self.lookahead = None;
        self.restart_iterator().await?;

        let topics = self.subscribed_topics();
        if !topics.is_empty() {
            if let Ok(backfill) = self.buffered.get_backfill(self.current, &topics).await {
                self.deliver(&backfill);
            }
        }

        self.start_preload();
        Ok(())
    }

    /// Create a fresh read-ahead iterator just past the current position,
    /// or mark the player failed if the source stack cannot produce one.
    ///
    /// The iterator starts one nanosecond after the cursor: messages at
    /// the cursor itself were already delivered by the backfill batch.
    async fn restart_iterator(&mut self) -> Result<()> {
        let topics = self.subscribed_topics();
        if topics.is_empty() {
            self.iterator = None;
            return Ok(());
        }
        let start = self.current.saturating_add(1);
        let args = ReadArgs::filtered(TimeRange::new(start, self.range.end), topics);
        match self.buffered.buffered_iterator(args).await {
            Ok(iterator) => {
                self.iterator = Some(iterator);
                Ok(())
            }
            Err(err) => {
                self.problems.push(
                    Problem::error("cannot read from sources; playback halted").with_error(&err),
                );
                self.set_state(PlayerState::Error);
                Err(err)
            }
        }
    }

    /// Warm the decoded-message cache over the whole range for preload
    /// subscriptions.
    fn start_preload(&mut self) {
        if let Some(previous) = self.warm_task.take() {
            previous.abort();
        }

        let preload: HashSet<String> = self
            .subscriptions
            .iter()
            .filter(|s| s.preload && self.supported_topics.contains(&s.topic))
            .map(|s| s.topic.clone())
            .collect();
        if preload.is_empty() {
            return;
        }

        let caching = self.caching.clone();
        let range = self.range;
        self.warm_task = Some(tokio::spawn(async move {
            debug!(topics = preload.len(), "Preloading full range");
            let args = ReadArgs::filtered(range, preload);
            match caching.message_iterator(args).await {
                Ok(mut iter) => while iter.next().await.is_some() {},
                Err(err) => debug!(error = %err, "Preload failed"),
            }
        }));
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Shutdown(tx));
    }
}
