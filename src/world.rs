//! The shared runtime handle. Every driver gets a clone; the command
//! queue runner is the only task that takes write locks on the
//! database, which is what makes read-modify-write command bodies safe
//! without finer-grained locking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;

use tinymush_redb::MushStore;

use crate::conn::ConnectionManager;
use crate::events::Bus;
use crate::prelude::*;
use crate::queue::{QueueEntry, QueueMessage};

#[derive(Clone)]
pub struct World {
    /// Mutated only by the queue runner; everyone else takes read
    /// snapshots.
    pub db: Arc<RwLock<Database>>,
    pub store: MushStore,
    pub bus: Arc<Bus>,
    pub conns: Arc<ConnectionManager>,
    pub config: Arc<Config>,

    queue: mpsc::UnboundedSender<QueueMessage>,
    queue_depth: Arc<AtomicUsize>,
    started_at: Instant,
}

impl World {
    pub fn new(
        db: Database,
        store: MushStore,
        config: Config,
    ) -> (Self, mpsc::UnboundedReceiver<QueueMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let world = Self {
            db: Arc::new(RwLock::new(db)),
            store,
            bus: Arc::new(Bus::new()),
            conns: Arc::new(ConnectionManager::new()),
            config: Arc::new(config),
            queue: tx,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        };

        (world, rx)
    }

    pub fn send(&self, message: QueueMessage) {
        let _ = self.queue.send(message);
    }

    pub fn enqueue_entry(&self, entry: QueueEntry) {
        self.send(QueueMessage::Enqueue(entry));
    }

    pub(crate) fn queue_depth_counter(&self) -> Arc<AtomicUsize> {
        self.queue_depth.clone()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Login-time credential check against `A_PASS`, answered from a
    /// read snapshot. Returns the player's dbref on success.
    pub fn verify_password(&self, name: &str, password: &str) -> Option<Dbref> {
        let db = self.db.read().expect("db lock poisoned");

        let player = db.resolve_name(name);
        let obj = db.get(player)?;

        if !obj.is_player() || obj.is_going() {
            return None;
        }

        let hash = obj.attr(A_PASS).map(|a| a.text().to_owned())?;
        auth::check_password(password, &hash).then_some(player)
    }
}

impl ServerController for World {
    fn status(&self) -> ServerStatus {
        let object_count = self.db.read().expect("db lock poisoned").object_count();

        ServerStatus {
            mud_name: self.config.mud_name.clone(),
            uptime_secs: self.uptime_secs(),
            object_count,
            connected_players: self.conns.connected_players().len(),
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
        }
    }

    fn who(&self) -> Vec<WhoEntry> {
        let db = self.db.read().expect("db lock poisoned");
        self.conns.who_entries(&db)
    }

    fn broadcast(&self, text: &str) {
        self.send(QueueMessage::Broadcast(text.to_owned()));
    }

    fn enqueue(&self, executor: Dbref, command: &str) {
        self.enqueue_entry(QueueEntry::new(executor, executor, command));
    }

    fn trigger_archive(&self) {
        self.send(QueueMessage::Archive);
    }

    fn shutdown(&self, grace_secs: u64) {
        self.send(QueueMessage::Shutdown { grace_secs });
    }
}
