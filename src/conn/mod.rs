//! Descriptors and the connection manager. A descriptor is one live
//! session on a specific transport, bound to a player dbref after
//! login; the manager owns the thread-safe set of all of them,
//! including the player -> descriptors mapping (multi-login permitted).

use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{Event, Subscriber};
use crate::prelude::*;
use crate::telnet::Capabilities;

pub mod rate;

use self::rate::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transport {
    Telnet,
    Tls,
    WebSocket,
}

impl Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Transport::Telnet => "telnet",
            Transport::Tls => "tls",
            Transport::WebSocket => "websocket",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Login,
    Connected,
    Disconnecting,
}

/// A frame queued for a descriptor's write task. Transport framing
/// happens in the writer, not at the emit site.
#[derive(Debug, Clone)]
pub enum OutFrame {
    /// One text line; the telnet writer appends CRLF.
    Text(String),
    /// GMCP package + payload, sent only when negotiated.
    Gmcp(String, serde_json::Value),
    /// MSDP variable/value pairs.
    Msdp(Vec<(String, String)>),
    /// A complete WebSocket JSON frame.
    Json(serde_json::Value),
    /// Pre-encoded bytes (negotiation offers and other IAC traffic).
    Raw(Vec<u8>),
}

/// Outbound frames buffered per descriptor before the write task
/// applies backpressure.
pub const OUTBOUND_DEPTH: usize = 256;

pub struct Descriptor {
    pub id: u64,
    pub transport: Transport,
    pub addr: String,
    pub conn_time: Instant,

    state: Mutex<ConnState>,
    player: AtomicI64,
    last_cmd: Mutex<Instant>,
    retries: AtomicU32,
    capabilities: Mutex<Capabilities>,
    mcp_auth: Mutex<Option<String>>,
    closed: AtomicBool,
    outbound: mpsc::Sender<OutFrame>,
}

impl Descriptor {
    pub fn new(
        id: u64,
        transport: Transport,
        addr: impl Into<String>,
        retries: u32,
    ) -> (Arc<Self>, mpsc::Receiver<OutFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);

        let desc = Arc::new(Self {
            id,
            transport,
            addr: addr.into(),
            conn_time: Instant::now(),
            state: Mutex::new(ConnState::Login),
            player: AtomicI64::new(NOTHING),
            last_cmd: Mutex::new(Instant::now()),
            retries: AtomicU32::new(retries),
            capabilities: Mutex::new(Capabilities::default()),
            mcp_auth: Mutex::new(None),
            closed: AtomicBool::new(false),
            outbound: tx,
        });

        (desc, rx)
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("descriptor lock poisoned")
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("descriptor lock poisoned") = state;
    }

    pub fn player(&self) -> Dbref {
        self.player.load(Ordering::SeqCst)
    }

    pub fn set_player(&self, player: Dbref) {
        self.player.store(player, Ordering::SeqCst);
    }

    /// Marks command activity, resetting the idle clock.
    pub fn touch(&self) {
        *self.last_cmd.lock().expect("descriptor lock poisoned") = Instant::now();
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_cmd
            .lock()
            .expect("descriptor lock poisoned")
            .elapsed()
            .as_secs()
    }

    pub fn conn_secs(&self) -> u64 {
        self.conn_time.elapsed().as_secs()
    }

    /// Burns one login attempt; returns the attempts left. Only the
    /// descriptor's read task calls this, so the load/store pair is
    /// race-free.
    pub fn fail_login(&self) -> u32 {
        let left = self.retries.load(Ordering::SeqCst).saturating_sub(1);
        self.retries.store(left, Ordering::SeqCst);
        left
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock().expect("descriptor lock poisoned")
    }

    pub fn set_capabilities(&self, caps: Capabilities) {
        *self.capabilities.lock().expect("descriptor lock poisoned") = caps;
    }

    /// Records the MCP handshake key; MCP output stays disabled until a
    /// client authenticates in-band.
    pub fn set_mcp_auth(&self, key: impl Into<String>) {
        *self.mcp_auth.lock().expect("descriptor lock poisoned") = Some(key.into());
        let mut caps = self.capabilities.lock().expect("descriptor lock poisoned");
        caps.mcp = true;
    }

    pub fn mcp_auth(&self) -> Option<String> {
        self.mcp_auth.lock().expect("descriptor lock poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnState::Disconnecting);
    }

    /// Queues a frame for the write task. A full or gone outbound
    /// queue closes the descriptor rather than blocking the caller.
    pub fn send(&self, frame: OutFrame) {
        if self.is_closed() {
            return;
        }
        if self.outbound.try_send(frame).is_err() {
            debug!(id = self.id, "outbound queue stalled, closing descriptor");
            self.close();
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send(OutFrame::Text(text.into()));
    }
}

/// Renders bus events into outbound frames for one descriptor.
pub struct DescriptorSubscriber {
    desc: Arc<Descriptor>,
}

impl DescriptorSubscriber {
    pub fn new(desc: Arc<Descriptor>) -> Self {
        Self { desc }
    }
}

impl Subscriber for DescriptorSubscriber {
    fn receive(&self, event: Event) {
        match self.desc.transport {
            Transport::WebSocket => {
                self.desc.send(OutFrame::Json(event.to_ws_json()));
            }
            Transport::Telnet | Transport::Tls => {
                if !event.text.is_empty() {
                    self.desc.send(OutFrame::Text(event.text.clone()));
                }

                let caps = self.desc.capabilities();
                if let Some(package) = event.typ.gmcp_package() {
                    if caps.gmcp {
                        let payload = if event.data.is_empty() {
                            serde_json::json!({ "text": event.text })
                        } else {
                            serde_json::Value::Object(event.data.clone())
                        };
                        self.desc.send(OutFrame::Gmcp(package.to_owned(), payload));
                    } else if caps.msdp {
                        let pairs = event
                            .data
                            .iter()
                            .map(|(k, v)| (k.to_uppercase(), stringify(v)))
                            .collect();
                        self.desc.send(OutFrame::Msdp(pairs));
                    } else if caps.mcp {
                        if let Some(auth) = self.desc.mcp_auth() {
                            let pairs: Vec<(String, String)> = event
                                .data
                                .iter()
                                .map(|(k, v)| (k.clone(), stringify(v)))
                                .collect();
                            self.desc.send(OutFrame::Text(crate::telnet::mcp_line(
                                package, &auth, &pairs,
                            )));
                        }
                    }
                }
            }
        }
    }

    fn closed(&self) -> bool {
        self.desc.is_closed()
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Thread-safe set of live descriptors, plus their command rate
/// buckets.
#[derive(Default)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    descriptors: Mutex<Vec<Arc<Descriptor>>>,
    rate: RateLimiter,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add(&self, desc: Arc<Descriptor>) {
        self.descriptors
            .lock()
            .expect("manager lock poisoned")
            .push(desc);
    }

    pub fn remove(&self, id: u64) {
        self.descriptors
            .lock()
            .expect("manager lock poisoned")
            .retain(|d| d.id != id);
        self.rate.forget(id);
    }

    /// Charges one command against the descriptor's rate bucket.
    pub fn allow_command(&self, id: u64) -> bool {
        self.rate.allow(id)
    }

    /// Periodic rate-limiter cleanup; driven from the queue runner's
    /// timer set.
    pub fn cleanup_rate(&self) -> usize {
        self.rate.cleanup()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Descriptor>> {
        self.descriptors
            .lock()
            .expect("manager lock poisoned")
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Binds a descriptor to a player and flips it to Connected.
    pub fn login(&self, desc: &Descriptor, player: Dbref) {
        desc.set_player(player);
        desc.set_state(ConnState::Connected);
        desc.touch();
    }

    pub fn all(&self) -> Vec<Arc<Descriptor>> {
        self.descriptors
            .lock()
            .expect("manager lock poisoned")
            .clone()
    }

    pub fn by_player(&self, player: Dbref) -> Vec<Arc<Descriptor>> {
        self.descriptors
            .lock()
            .expect("manager lock poisoned")
            .iter()
            .filter(|d| d.player() == player)
            .cloned()
            .collect()
    }

    /// Distinct connected players.
    pub fn connected_players(&self) -> HashSet<Dbref> {
        self.descriptors
            .lock()
            .expect("manager lock poisoned")
            .iter()
            .filter(|d| d.state() == ConnState::Connected)
            .map(|d| d.player())
            .filter(|&p| p != NOTHING)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.descriptors.lock().expect("manager lock poisoned").len()
    }

    /// Sends a text line to every connected descriptor.
    pub fn broadcast(&self, text: &str) {
        for desc in self.all() {
            if desc.state() == ConnState::Connected {
                desc.send_text(text);
            }
        }
    }

    /// Descriptors that have been idle past their state's timeout.
    /// `idle_timeout == 0` means connected descriptors never idle out.
    pub fn idle_descriptors(&self, login_timeout: u64, idle_timeout: u64) -> Vec<Arc<Descriptor>> {
        self.all()
            .into_iter()
            .filter(|d| match d.state() {
                ConnState::Login => login_timeout > 0 && d.idle_secs() > login_timeout,
                ConnState::Connected => idle_timeout > 0 && d.idle_secs() > idle_timeout,
                ConnState::Disconnecting => false,
            })
            .collect()
    }

    pub fn who_entries(&self, db: &Database) -> Vec<WhoEntry> {
        self.all()
            .iter()
            .filter(|d| d.state() == ConnState::Connected)
            .map(|d| {
                let player = d.player();
                WhoEntry {
                    player,
                    name: db
                        .get(player)
                        .map(|o| o.name.clone())
                        .unwrap_or_default(),
                    addr: d.addr.clone(),
                    conn_secs: d.conn_secs(),
                    idle_secs: d.idle_secs(),
                    transport: d.transport.to_string(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    fn telnet_desc(manager: &ConnectionManager) -> (Arc<Descriptor>, mpsc::Receiver<OutFrame>) {
        let (desc, rx) = Descriptor::new(manager.next_id(), Transport::Telnet, "127.0.0.1", 3);
        manager.add(desc.clone());
        (desc, rx)
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let manager = ConnectionManager::new();
        let a = manager.next_id();
        let b = manager.next_id();
        assert!(b > a);
    }

    #[test]
    fn login_binds_player_and_permits_multi_login() {
        let manager = ConnectionManager::new();
        let (d1, _rx1) = telnet_desc(&manager);
        let (d2, _rx2) = telnet_desc(&manager);

        manager.login(&d1, 7);
        manager.login(&d2, 7);

        assert_eq!(manager.by_player(7).len(), 2);
        assert_eq!(manager.connected_players().len(), 1);
    }

    #[test]
    fn remove_drops_descriptor() {
        let manager = ConnectionManager::new();
        let (d1, _rx) = telnet_desc(&manager);
        assert_eq!(manager.count(), 1);

        manager.remove(d1.id);
        assert_eq!(manager.count(), 0);
        assert!(manager.get(d1.id).is_none());
    }

    #[test]
    fn fail_login_counts_down() {
        let manager = ConnectionManager::new();
        let (desc, _rx) = telnet_desc(&manager);

        assert_eq!(desc.fail_login(), 2);
        assert_eq!(desc.fail_login(), 1);
        assert_eq!(desc.fail_login(), 0);
    }

    #[test]
    fn telnet_subscriber_prefers_text() {
        let manager = ConnectionManager::new();
        let (desc, mut rx) = telnet_desc(&manager);
        let sub = DescriptorSubscriber::new(desc.clone());

        sub.receive(Event::text(EventType::Say, "hello"));

        match rx.try_recv().unwrap() {
            OutFrame::Text(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected frame {other:?}"),
        }
        // no GMCP without negotiation
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn gmcp_frame_follows_text_when_negotiated() {
        let manager = ConnectionManager::new();
        let (desc, mut rx) = telnet_desc(&manager);
        desc.set_capabilities(Capabilities {
            gmcp: true,
            ..Default::default()
        });

        let sub = DescriptorSubscriber::new(desc.clone());
        sub.receive(Event::text(EventType::Say, "hello"));

        assert!(matches!(rx.try_recv().unwrap(), OutFrame::Text(_)));
        match rx.try_recv().unwrap() {
            OutFrame::Gmcp(package, payload) => {
                assert_eq!(package, "Comm.Room.Text");
                assert_eq!(payload["text"], "hello");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn websocket_subscriber_sends_json() {
        let manager = ConnectionManager::new();
        let (desc, mut rx) = Descriptor::new(manager.next_id(), Transport::WebSocket, "ws", 3);
        manager.add(desc.clone());

        let sub = DescriptorSubscriber::new(desc.clone());
        sub.receive(Event::text(EventType::Say, "hello"));

        match rx.try_recv().unwrap() {
            OutFrame::Json(frame) => {
                assert_eq!(frame["type"], "say");
                assert_eq!(frame["text"], "hello");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn closed_descriptor_drops_sends() {
        let manager = ConnectionManager::new();
        let (desc, mut rx) = telnet_desc(&manager);

        desc.close();
        desc.send_text("after close");

        assert!(rx.try_recv().is_err());
        assert!(DescriptorSubscriber::new(desc.clone()).closed());
    }

    #[test]
    fn idle_sweep_respects_state() {
        let manager = ConnectionManager::new();
        let (login_desc, _rx1) = telnet_desc(&manager);
        let (conn_desc, _rx2) = telnet_desc(&manager);
        manager.login(&conn_desc, 3);

        // nothing has been idle for a full second yet
        assert!(manager.idle_descriptors(1, 1).is_empty());

        // idle_timeout == 0 never drops connected descriptors
        assert!(manager.idle_descriptors(0, 0).is_empty());
        let _ = login_desc;
    }
}
