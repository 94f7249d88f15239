use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventType};
use crate::prelude::*;
use crate::world::World;

use super::{Budget, CommandExecutor, CommandQueue, QueueEntry, QueueMessage};

/// Gathers every `@startup` attribute as a queue entry, dbref order.
/// Run once at boot.
pub fn run_startups(world: &World) -> Vec<QueueEntry> {
    let db = world.db.read().expect("db lock poisoned");

    let mut refs: Vec<Dbref> = db.objects.keys().copied().collect();
    refs.sort_unstable();

    refs.into_iter()
        .filter_map(|dbref| {
            let obj = db.get(dbref)?;
            let startup = obj.attr(A_STARTUP)?;
            Some(QueueEntry::new(dbref, dbref, startup.text()))
        })
        .collect()
}

type ArchiveHook = Box<dyn Fn(&World) -> Result<std::path::PathBuf, crate::prelude::Error> + Send>;

/// How often the runner prunes stale rate-limiter buckets and closed
/// bus subscribers.
const CLEANUP_PERIOD: Duration = Duration::from_secs(60);

/// Owns the command queue and is the only task permitted to mutate
/// game state.
pub struct QueueRunner {
    world: World,
    rx: tokio::sync::mpsc::UnboundedReceiver<QueueMessage>,
    queue: CommandQueue,
    executor: Box<dyn CommandExecutor>,
    depth: Arc<AtomicUsize>,
    archive_hook: Option<ArchiveHook>,
    exit: CancellationToken,
}

impl QueueRunner {
    pub fn new(
        world: World,
        rx: tokio::sync::mpsc::UnboundedReceiver<QueueMessage>,
        executor: Box<dyn CommandExecutor>,
        exit: CancellationToken,
    ) -> Self {
        let depth = world.queue_depth_counter();
        Self {
            world,
            rx,
            queue: CommandQueue::new(),
            executor,
            depth,
            archive_hook: None,
            exit,
        }
    }

    /// Installs the closure invoked by the auto-archive job and the
    /// admin panel's archive trigger.
    pub fn with_archive_hook(mut self, hook: ArchiveHook) -> Self {
        self.archive_hook = Some(hook);
        self
    }

    pub async fn run(mut self) {
        for entry in run_startups(&self.world) {
            self.queue.push(entry, Instant::now());
        }

        let archive_minutes = self.world.config.archive_interval;
        let archive_period = Duration::from_secs(archive_minutes.max(1) * 60);
        let mut archive_timer =
            tokio::time::interval_at(Instant::now() + archive_period, archive_period);

        let mut cleanup_timer =
            tokio::time::interval_at(Instant::now() + CLEANUP_PERIOD, CLEANUP_PERIOD);

        loop {
            self.drain().await;
            self.depth.store(self.queue.depth(), Ordering::SeqCst);

            let next_deadline = self.queue.next_deadline();

            tokio::select! {
                _ = self.exit.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        if self.handle(msg).await {
                            break;
                        }
                    }
                    None => break,
                },

                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    self.queue.promote(Instant::now());
                }

                _ = archive_timer.tick(), if archive_minutes > 0 => {
                    self.run_archive();
                }

                _ = cleanup_timer.tick() => {
                    let stale = self.world.conns.cleanup_rate();
                    self.world.bus.cleanup();
                    if stale > 0 {
                        debug!(stale, "pruned rate-limiter buckets");
                    }
                }
            }
        }

        info!("queue runner stopped");
    }

    /// Runs everything currently due, one command at a time.
    async fn drain(&mut self) {
        self.queue.promote(Instant::now());
        while let Some(entry) = self.queue.pop() {
            self.run_entry(entry).await;
            self.queue.promote(Instant::now());
        }
    }

    /// Returns true when the runner should stop.
    async fn handle(&mut self, msg: QueueMessage) -> bool {
        match msg {
            QueueMessage::Enqueue(entry) => {
                self.queue.push(entry, Instant::now());
            }
            QueueMessage::Notify { obj, label, count } => {
                self.queue.notify(obj, &label, count);
            }
            QueueMessage::Halt(executor) => {
                let dropped = self.queue.halt(executor);
                info!(executor, dropped, "halted queue entries");
            }
            QueueMessage::Broadcast(text) => {
                self.world.conns.broadcast(&text);
            }
            QueueMessage::Archive => {
                self.run_archive();
            }
            QueueMessage::Shutdown { grace_secs } => {
                self.run_shutdown(grace_secs).await;
                return true;
            }
        }
        false
    }

    async fn run_entry(&mut self, entry: QueueEntry) {
        // queue-control commands are handled by the runner itself;
        // everything else goes through the executor seam
        if let Some(rest) = entry.command.strip_prefix("@notify ") {
            self.run_notify(&entry, rest);
            return;
        }
        if entry.command == "@halt" || entry.command.starts_with("@halt ") {
            self.queue.halt(entry.executor);
            return;
        }

        let max_retries = self.world.config.max_retries;
        let mut attempt = 0;

        loop {
            let mut budget = Budget::new(
                self.world.config.function_invocation_limit,
                self.world.config.output_limit,
            );

            match self.executor.execute(&self.world, &entry, &mut budget) {
                Ok(()) => return,
                Err(QueueError::Transient(reason)) if attempt < max_retries => {
                    attempt += 1;
                    warn!(executor = entry.executor, attempt, %reason, "retrying entry");
                    sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(QueueError::Transient(reason)) => {
                    error!(executor = entry.executor, %reason, "abandoning entry after retries");
                    return;
                }
                Err(err) => {
                    // permission, quota and not-found surface to the
                    // player as dbref-prefixed soft errors
                    let text = err.user_visible();
                    for desc in self.world.conns.by_player(entry.executor) {
                        desc.send_text(text.clone());
                    }
                    return;
                }
            }
        }
    }

    /// `@notify <obj>/<label>` releases one parked entry; a trailing
    /// `=<count>` releases more, `=all` the whole label.
    fn run_notify(&mut self, entry: &QueueEntry, rest: &str) {
        let (target, count) = match rest.split_once('=') {
            Some((target, "all")) => (target, 0),
            Some((target, n)) => (target, n.trim().parse().unwrap_or(1)),
            None => (rest, 1),
        };

        let (obj_name, label) = match target.split_once('/') {
            Some((obj, label)) => (obj.trim(), label.trim()),
            None => (target.trim(), "semaphore"),
        };

        let obj = {
            let db = self.world.db.read().expect("db lock poisoned");
            db.resolve_name(obj_name)
        };

        if obj == NOTHING {
            for desc in self.world.conns.by_player(entry.executor) {
                desc.send_text("#-1 NOT FOUND");
            }
            return;
        }

        self.queue.notify(obj, label, count);
    }

    fn run_archive(&mut self) {
        let Some(hook) = &self.archive_hook else {
            warn!("archive requested but no archive hook is configured");
            return;
        };

        match hook(&self.world) {
            Ok(path) => info!(path = %path.display(), "archive written"),
            Err(e) => error!(error = %e, "archive failed"),
        }
    }

    /// Countdown broadcasts, a final archive, then the exit token.
    /// Listeners and descriptors drain behind the token.
    async fn run_shutdown(&mut self, grace_secs: u64) {
        info!(grace_secs, "shutdown initiated");

        let mut remaining = grace_secs;
        while remaining > 0 {
            if remaining % 10 == 0 || remaining <= 5 {
                self.world
                    .conns
                    .broadcast(&format!("GAME: Server shutdown in {remaining} seconds."));
            }
            sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }

        self.world.conns.broadcast("GAME: Server shutting down NOW.");

        if self.archive_hook.is_some() {
            self.run_archive();
        }

        self.exit.cancel();
    }
}

/// The built-in executor: enough of the command language for the
/// kernel to be exercised end-to-end. The full evaluator plugs in
/// through [`CommandExecutor`].
pub struct KernelExecutor;

impl CommandExecutor for KernelExecutor {
    fn execute(
        &mut self,
        world: &World,
        entry: &QueueEntry,
        budget: &mut Budget,
    ) -> Result<(), QueueError> {
        budget.charge(1)?;

        let command = entry.command.trim();
        let (verb, rest) = match command.split_once(' ') {
            Some((v, r)) => (v, r.trim()),
            None => (command, ""),
        };

        match verb {
            "say" | "\"" => self.say(world, entry, budget, rest),
            "pose" | ":" => self.pose(world, entry, budget, rest),
            "@emit" => self.emit(world, entry, budget, rest),
            "WHO" | "who" => self.who(world, entry),
            _ => Err(QueueError::Command("HUH? (Type \"help\" for help.)".into())),
        }
    }
}

impl KernelExecutor {
    fn location_of(&self, world: &World, dbref: Dbref) -> Dbref {
        world
            .db
            .read()
            .expect("db lock poisoned")
            .get(dbref)
            .map(|o| o.location)
            .unwrap_or(NOTHING)
    }

    fn name_of(&self, world: &World, dbref: Dbref) -> String {
        world
            .db
            .read()
            .expect("db lock poisoned")
            .get(dbref)
            .map(|o| o.name.clone())
            .unwrap_or_else(|| format!("#{dbref}"))
    }

    fn say(
        &self,
        world: &World,
        entry: &QueueEntry,
        budget: &mut Budget,
        text: &str,
    ) -> Result<(), QueueError> {
        let room = self.location_of(world, entry.executor);
        let name = self.name_of(world, entry.executor);

        budget.charge_output(text.len())?;
        for desc in world.conns.by_player(entry.executor) {
            desc.send_text(format!("You say, \"{text}\""));
        }

        let event = Event::text(EventType::Say, format!("{name} says, \"{text}\""))
            .with_source(entry.executor);

        let db = world.db.read().expect("db lock poisoned");
        world
            .bus
            .emit_to_room_except(&db, room, entry.executor, event);

        Ok(())
    }

    fn pose(
        &self,
        world: &World,
        entry: &QueueEntry,
        budget: &mut Budget,
        text: &str,
    ) -> Result<(), QueueError> {
        let room = self.location_of(world, entry.executor);
        let name = self.name_of(world, entry.executor);

        budget.charge_output(text.len())?;

        let event =
            Event::text(EventType::Pose, format!("{name} {text}")).with_source(entry.executor);

        let db = world.db.read().expect("db lock poisoned");
        world.bus.emit_to_room(&db, room, event);

        Ok(())
    }

    fn emit(
        &self,
        world: &World,
        entry: &QueueEntry,
        budget: &mut Budget,
        text: &str,
    ) -> Result<(), QueueError> {
        let room = self.location_of(world, entry.executor);

        budget.charge_output(text.len())?;

        let event = Event::text(EventType::Emit, text).with_source(entry.executor);

        let db = world.db.read().expect("db lock poisoned");
        world.bus.emit_to_room(&db, room, event);

        Ok(())
    }

    fn who(&self, world: &World, entry: &QueueEntry) -> Result<(), QueueError> {
        let entries = {
            let db = world.db.read().expect("db lock poisoned");
            world.conns.who_entries(&db)
        };

        for desc in world.conns.by_player(entry.executor) {
            desc.send_text(format!("{:<16} {:>8} {:>6}", "Player Name", "On For", "Idle"));
            for who in &entries {
                desc.send_text(format!(
                    "{:<16} {:>8} {:>6}",
                    who.name, who.conn_secs, who.idle_secs
                ));
            }
            desc.send_text(format!("{} players connected.", entries.len()));
        }

        Ok(())
    }
}
