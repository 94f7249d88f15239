//! The event bus decouples state-changing logic from per-transport
//! rendering. Emitters run on the queue runner; subscribers are
//! descriptor wrappers, scrollback recorders or log taps.
//!
//! Guarantees: per-subscriber delivery order equals emit order,
//! at-most-once per emit, and no delivery once `closed()` reports true.
//! Subscribers must not call bus-mutating operations from inside
//! `receive`; deliveries happen outside the registry locks so a
//! buffering subscriber can safely re-enter later.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Text,
    Say,
    Pose,
    Page,
    Channel,
    Room,
    Move,
    Connect,
    Disconnect,
    Prompt,
    ObjUpdate,
    Who,
    Whisper,
    Emit,
}

impl EventType {
    /// The fixed event-to-GMCP package mapping. Events without a
    /// package are text-only on the telnet side.
    pub fn gmcp_package(self) -> Option<&'static str> {
        match self {
            EventType::Say | EventType::Pose | EventType::Emit => Some("Comm.Room.Text"),
            EventType::Channel => Some("Comm.Channel.Text"),
            EventType::Page | EventType::Whisper => Some("Comm.Private.Text"),
            EventType::Room | EventType::Move => Some("Room.Info"),
            EventType::Connect => Some("Char.Login"),
            EventType::Disconnect => Some("Char.Logout"),
            EventType::Who => Some("Char.Group"),
            _ => None,
        }
    }
}

/// A structured occurrence to be rendered. `player` is the recipient,
/// `source` the actor, `room` the scope.
#[derive(Debug, Clone)]
pub struct Event {
    pub typ: EventType,
    pub player: Dbref,
    pub source: Dbref,
    pub room: Dbref,
    pub channel: String,
    pub text: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(typ: EventType) -> Self {
        Self {
            typ,
            player: NOTHING,
            source: NOTHING,
            room: NOTHING,
            channel: String::new(),
            text: String::new(),
            data: serde_json::Map::new(),
        }
    }

    pub fn text(typ: EventType, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::new(typ)
        }
    }

    pub fn with_source(mut self, source: Dbref) -> Self {
        self.source = source;
        self
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_owned(), value);
        self
    }

    /// The WebSocket wire frame.
    pub fn to_ws_json(&self) -> serde_json::Value {
        let mut frame = serde_json::Map::new();
        frame.insert("type".into(), serde_json::json!(self.typ));
        if !self.text.is_empty() {
            frame.insert("text".into(), serde_json::json!(self.text));
        }
        if !self.data.is_empty() {
            frame.insert("data".into(), serde_json::Value::Object(self.data.clone()));
        }
        if !self.channel.is_empty() {
            frame.insert("channel".into(), serde_json::json!(self.channel));
        }
        serde_json::Value::Object(frame)
    }
}

/// Anything that can receive events. `closed` subscribers are skipped
/// on emit and pruned by [`Bus::cleanup`].
pub trait Subscriber: Send + Sync {
    fn receive(&self, event: Event);
    fn closed(&self) -> bool;
}

/// Registry of per-player and global subscribers.
#[derive(Default)]
pub struct Bus {
    players: RwLock<HashMap<Dbref, Vec<Arc<dyn Subscriber>>>>,
    globals: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_player(&self, player: Dbref, sub: Arc<dyn Subscriber>) {
        self.players
            .write()
            .expect("bus lock poisoned")
            .entry(player)
            .or_default()
            .push(sub);
    }

    pub fn subscribe_global(&self, sub: Arc<dyn Subscriber>) {
        self.globals.write().expect("bus lock poisoned").push(sub);
    }

    /// Fan-out to the subscribers of `event.player` plus all globals.
    pub fn emit(&self, event: Event) {
        let mut targets: Vec<Arc<dyn Subscriber>> = Vec::new();

        {
            let players = self.players.read().expect("bus lock poisoned");
            if let Some(subs) = players.get(&event.player) {
                targets.extend(subs.iter().cloned());
            }
        }
        {
            let globals = self.globals.read().expect("bus lock poisoned");
            targets.extend(globals.iter().cloned());
        }

        // deliver outside the locks; closed() is re-checked right
        // before each delivery so a subscriber closing mid-emit is
        // simply skipped
        for sub in targets {
            if !sub.closed() {
                sub.receive(event.clone());
            }
        }
    }

    pub fn emit_to_player(&self, player: Dbref, mut event: Event) {
        event.player = player;
        self.emit(event);
    }

    /// Delivers a per-recipient copy to everything in the room's
    /// contents chain. The chain walk carries the usual visited-set
    /// guard.
    pub fn emit_to_room(&self, db: &Database, room: Dbref, event: Event) {
        self.emit_to_room_except(db, room, NOTHING, event);
    }

    pub fn emit_to_room_except(&self, db: &Database, room: Dbref, except: Dbref, event: Event) {
        let head = match db.get(room) {
            Some(r) => r.contents,
            None => return,
        };

        let recipients: Vec<Dbref> = db.chain_iter(head).filter(|&r| r != except).collect();

        for recipient in recipients {
            let mut copy = event.clone();
            copy.player = recipient;
            copy.room = room;
            self.emit(copy);
        }
    }

    /// Prunes every closed subscriber from both registries.
    pub fn cleanup(&self) {
        {
            let mut players = self.players.write().expect("bus lock poisoned");
            for subs in players.values_mut() {
                subs.retain(|s| !s.closed());
            }
            players.retain(|_, subs| !subs.is_empty());
        }
        {
            let mut globals = self.globals.write().expect("bus lock poisoned");
            globals.retain(|s| !s.closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let players = self.players.read().expect("bus lock poisoned");
        let globals = self.globals.read().expect("bus lock poisoned");
        players.values().map(Vec::len).sum::<usize>() + globals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<Event>>,
        closed: AtomicBool,
    }

    impl Subscriber for Recorder {
        fn receive(&self, event: Event) {
            self.received.lock().unwrap().push(event);
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn room_with_two_players() -> Database {
        let mut db = Database::new();

        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        room.contents = 1;

        let mut p1 = Object::new(1, ObjectType::Player, "One");
        p1.location = 0;
        p1.next = 2;

        let mut p2 = Object::new(2, ObjectType::Player, "Two");
        p2.location = 0;

        db.put(room);
        db.put(p1);
        db.put(p2);
        db
    }

    #[test]
    fn room_broadcast_reaches_every_occupant() {
        let db = room_with_two_players();
        let bus = Bus::new();

        let s1 = Arc::new(Recorder::default());
        let s2 = Arc::new(Recorder::default());
        bus.subscribe_player(1, s1.clone());
        bus.subscribe_player(2, s2.clone());

        let event = Event::text(EventType::Say, "hi").with_source(1);
        bus.emit_to_room(&db, 0, event);

        let got1 = s1.received.lock().unwrap();
        let got2 = s2.received.lock().unwrap();
        assert_eq!(got1.len(), 1);
        assert_eq!(got2.len(), 1);

        // each copy is rewritten for its recipient
        assert_eq!(got1[0].player, 1);
        assert_eq!(got2[0].player, 2);
        assert_eq!(got1[0].room, 0);
        assert_eq!(got2[0].room, 0);
        assert_eq!(got1[0].source, 1);
    }

    #[test]
    fn broadcast_exclusion() {
        let db = room_with_two_players();
        let bus = Bus::new();

        let s1 = Arc::new(Recorder::default());
        let s2 = Arc::new(Recorder::default());
        bus.subscribe_player(1, s1.clone());
        bus.subscribe_player(2, s2.clone());

        bus.emit_to_room_except(&db, 0, 1, Event::text(EventType::Say, "psst").with_source(1));

        assert!(s1.received.lock().unwrap().is_empty());
        assert_eq!(s2.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_subscribers_are_skipped_and_pruned() {
        let bus = Bus::new();

        let open = Arc::new(Recorder::default());
        let closed = Arc::new(Recorder::default());
        closed.closed.store(true, Ordering::SeqCst);

        bus.subscribe_player(1, open.clone());
        bus.subscribe_player(1, closed.clone());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit_to_player(1, Event::text(EventType::Text, "hello"));

        assert_eq!(open.received.lock().unwrap().len(), 1);
        assert!(closed.received.lock().unwrap().is_empty());

        bus.cleanup();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn delivery_order_matches_emit_order() {
        let bus = Bus::new();
        let sub = Arc::new(Recorder::default());
        bus.subscribe_player(1, sub.clone());

        for i in 0..10 {
            bus.emit_to_player(1, Event::text(EventType::Text, format!("msg {i}")));
        }

        let got = sub.received.lock().unwrap();
        let texts: Vec<&str> = got.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(
            texts,
            (0..10).map(|i| format!("msg {i}")).collect::<Vec<_>>()
        );
    }

    #[test]
    fn globals_see_every_emit() {
        let bus = Bus::new();
        let tap = Arc::new(Recorder::default());
        bus.subscribe_global(tap.clone());

        bus.emit_to_player(5, Event::text(EventType::Say, "a"));
        bus.emit_to_player(9, Event::text(EventType::Say, "b"));

        assert_eq!(tap.received.lock().unwrap().len(), 2);
    }

    #[test]
    fn gmcp_mapping_is_fixed() {
        assert_eq!(EventType::Say.gmcp_package(), Some("Comm.Room.Text"));
        assert_eq!(EventType::Channel.gmcp_package(), Some("Comm.Channel.Text"));
        assert_eq!(EventType::Page.gmcp_package(), Some("Comm.Private.Text"));
        assert_eq!(EventType::Move.gmcp_package(), Some("Room.Info"));
        assert_eq!(EventType::Who.gmcp_package(), Some("Char.Group"));
        assert_eq!(EventType::Text.gmcp_package(), None);
    }

    #[test]
    fn ws_frame_shape() {
        let frame = Event::text(EventType::Say, "hi").to_ws_json();
        assert_eq!(frame["type"], "say");
        assert_eq!(frame["text"], "hi");
        assert!(frame.get("data").is_none());
    }
}
