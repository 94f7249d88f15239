//! The telnet driver: cleartext and TLS listeners, per-connection read
//! and write tasks, single-shot option negotiation, and the login state
//! machine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::conn::{ConnState, Descriptor, DescriptorSubscriber, OutFrame, Transport};
use crate::events::{Event, EventType};
use crate::prelude::*;
use crate::queue::QueueEntry;
use crate::telnet::{Capabilities, TelnetEvent, TelnetParser, NEGOTIATION_OFFER};
use crate::world::World;

/// How long the server waits for negotiation replies before moving on.
const NEGOTIATION_WINDOW: Duration = Duration::from_secs(2);

/// Per-frame write deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Login descriptors always time out, even when connected descriptors
/// are configured to idle forever.
const LOGIN_TIMEOUT_SECS: u64 = 300;

const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: Option<String>,
    pub tls_address: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub idle_timeout: u64,
    pub max_retries: u32,
    pub mud_name: String,
}

impl Config {
    pub fn from_core(config: &crate::prelude::Config) -> Self {
        Self {
            listen_address: config
                .cleartext
                .then(|| format!("0.0.0.0:{}", config.port)),
            tls_address: config.tls.then(|| format!("0.0.0.0:{}", config.tls_port)),
            tls_cert: config.tls_cert.clone(),
            tls_key: config.tls_key.clone(),
            idle_timeout: config.idle_timeout,
            max_retries: config.max_retries,
            mud_name: config.mud_name.clone(),
        }
    }
}

pub struct Driver;

impl<C: CancelToken> tinymush_core::Driver<World, C> for Driver {
    type Config = Config;

    async fn run(config: Self::Config, world: World, cancel: C) -> Result<(), ServeError> {
        let mut tasks = Vec::new();

        if let Some(addr) = &config.listen_address {
            let listener = TcpListener::bind(addr).await.map_err(ServeError::BindError)?;
            info!(addr, "telnet listening");

            tasks.push(tokio::spawn(accept_plain(
                listener,
                config.clone(),
                world.clone(),
            )));
        }

        if let Some(addr) = &config.tls_address {
            let acceptor = build_acceptor(&config)?;
            let listener = TcpListener::bind(addr).await.map_err(ServeError::BindError)?;
            info!(addr, "tls telnet listening");

            tasks.push(tokio::spawn(accept_tls(
                listener,
                acceptor,
                config.clone(),
                world.clone(),
            )));
        }

        tasks.push(tokio::spawn(idle_sweep(config.clone(), world.clone())));

        cancel.cancelled().await;

        for task in tasks {
            task.abort();
        }

        // give descriptors a short drain window before they are
        // dropped with the listener tasks
        world
            .conns
            .broadcast("GAME: Server closing connections.");
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(())
    }
}

fn build_acceptor(config: &Config) -> Result<TlsAcceptor, ServeError> {
    use tokio_rustls::rustls;

    let cert_path = config
        .tls_cert
        .as_ref()
        .ok_or_else(|| ServeError::TlsConfig("tls enabled but tls_cert is unset".into()))?;
    let key_path = config
        .tls_key
        .as_ref()
        .ok_or_else(|| ServeError::TlsConfig("tls enabled but tls_key is unset".into()))?;

    let mut cert_reader = std::io::BufReader::new(
        std::fs::File::open(cert_path).map_err(|e| ServeError::TlsConfig(e.to_string()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ServeError::TlsConfig(e.to_string()))?;

    let mut key_reader = std::io::BufReader::new(
        std::fs::File::open(key_path).map_err(|e| ServeError::TlsConfig(e.to_string()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ServeError::TlsConfig(e.to_string()))?
        .ok_or_else(|| ServeError::TlsConfig("no private key found".into()))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServeError::TlsConfig(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

async fn accept_plain(listener: TcpListener, config: Config, world: World) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let config = config.clone();
                let world = world.clone();
                tokio::spawn(async move {
                    session(stream, Transport::Telnet, addr.to_string(), config, world).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "telnet accept failed");
            }
        }
    }
}

async fn accept_tls(listener: TcpListener, acceptor: TlsAcceptor, config: Config, world: World) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let acceptor = acceptor.clone();
                let config = config.clone();
                let world = world.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            session(tls_stream, Transport::Tls, addr.to_string(), config, world)
                                .await;
                        }
                        Err(e) => debug!(error = %e, "tls handshake failed"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "tls accept failed");
            }
        }
    }
}

/// Periodically drops descriptors that sat idle past their state's
/// timeout.
async fn idle_sweep(config: Config, world: World) {
    // login descriptors follow the configured idle timeout, but time
    // out eventually even when connected descriptors never do
    let login_timeout = if config.idle_timeout > 0 {
        config.idle_timeout
    } else {
        LOGIN_TIMEOUT_SECS
    };

    let mut ticker = tokio::time::interval(IDLE_SWEEP_PERIOD);
    loop {
        ticker.tick().await;

        for desc in world
            .conns
            .idle_descriptors(login_timeout, config.idle_timeout)
        {
            info!(id = desc.id, player = desc.player(), "dropping idle descriptor");
            desc.send_text("GAME: Idle timeout. Goodbye.");
            desc.close();
        }
    }
}

/// One connection, from accept to cleanup.
#[instrument(skip_all, fields(addr = %addr, transport = ?transport))]
async fn session<S>(stream: S, transport: Transport, addr: String, config: Config, world: World)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    let (desc, out_rx) = Descriptor::new(
        world.conns.next_id(),
        transport,
        addr,
        config.max_retries,
    );
    world.conns.add(desc.clone());

    let writer = tokio::spawn(write_task(out_rx, write_half, desc.clone()));

    desc.send(OutFrame::Raw(NEGOTIATION_OFFER.to_vec()));

    let mut parser = TelnetParser::new();
    let mut reader = read_half;

    // single-shot negotiation: collect replies for the window, then
    // never renegotiate; lines that arrive early are processed after
    let mut caps = Capabilities::default();
    let mut early_lines = Vec::new();

    let deadline = tokio::time::Instant::now() + NEGOTIATION_WINDOW;
    let mut buf = [0u8; 1024];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                cleanup(&world, &desc).await;
                writer.abort();
                return;
            }
            Ok(Ok(n)) => {
                for event in parser.feed(&buf[..n]) {
                    match event {
                        TelnetEvent::Line(line) => early_lines.push(line),
                        other => caps.apply(&other),
                    }
                }
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    desc.set_capabilities(caps);
    debug!(?caps, "negotiation settled");

    desc.send_text(format!(
        "Welcome to {}! Use \"connect <name> <password>\" to log in.",
        config.mud_name
    ));

    for line in early_lines {
        if !handle_line(&world, &desc, &line) {
            cleanup(&world, &desc).await;
            writer.abort();
            return;
        }
    }

    loop {
        if desc.is_closed() {
            break;
        }

        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for event in parser.feed(&buf[..n]) {
            if let TelnetEvent::Line(line) = event {
                if !handle_line(&world, &desc, &line) {
                    cleanup(&world, &desc).await;
                    writer.abort();
                    return;
                }
            }
        }
    }

    cleanup(&world, &desc).await;
    writer.abort();
}

/// Applies one input line to the login state machine. Returns false
/// when the descriptor should be dropped.
pub fn handle_line(world: &World, desc: &Arc<Descriptor>, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    // MCP rides in-band on any state; the handshake enables MCP output
    if let Some(rest) = line.strip_prefix("#$#") {
        handle_mcp(desc, rest);
        return true;
    }

    match desc.state() {
        ConnState::Login => handle_login_line(world, desc, line),
        ConnState::Connected => {
            desc.touch();

            if line.eq_ignore_ascii_case("QUIT") {
                desc.send_text("*** Disconnected ***");
                return false;
            }

            // throttled commands never reach the queue
            if !world.conns.allow_command(desc.id) {
                desc.send_text("#-1 LIMIT EXCEEDED");
                return true;
            }

            world.enqueue_entry(QueueEntry::new(desc.player(), desc.player(), line));
            true
        }
        ConnState::Disconnecting => false,
    }
}

/// `#$#mcp authentication-key: <key> version: ...` enables MCP output
/// for this descriptor; other MCP packages are ignored by the kernel.
fn handle_mcp(desc: &Arc<Descriptor>, line: &str) {
    let Some(rest) = line.strip_prefix("mcp ") else {
        return;
    };

    let mut tokens = rest.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "authentication-key:" {
            if let Some(key) = tokens.next() {
                debug!(id = desc.id, "mcp authenticated");
                desc.set_mcp_auth(key);
            }
            return;
        }
    }
}

fn handle_login_line(world: &World, desc: &Arc<Descriptor>, line: &str) -> bool {
    if line.eq_ignore_ascii_case("QUIT") {
        return false;
    }

    let Some(rest) = line
        .strip_prefix("connect ")
        .or_else(|| line.strip_prefix("CONNECT "))
    else {
        desc.send_text("Use \"connect <name> <password>\" to log in.");
        return true;
    };

    let (name, password) = match rest.trim().rsplit_once(' ') {
        Some((name, password)) => (name.trim(), password),
        None => (rest.trim(), ""),
    };

    match world.verify_password(name, password) {
        Some(player) => {
            world.conns.login(desc, player);

            let sub = Arc::new(DescriptorSubscriber::new(desc.clone()));
            world.bus.subscribe_player(player, sub);

            let name = {
                let db = world.db.read().expect("db lock poisoned");
                db.get(player).map(|o| o.name.clone()).unwrap_or_default()
            };

            info!(id = desc.id, player, "login");
            desc.send_text(format!("Welcome back, {name}."));

            let announce = Event::text(EventType::Connect, format!("{name} has connected."))
                .with_source(player);
            let db = world.db.read().expect("db lock poisoned");
            let room = db.get(player).map(|o| o.location).unwrap_or(NOTHING);
            world.bus.emit_to_room_except(&db, room, player, announce);

            true
        }
        None => {
            desc.send_text("Either that player does not exist, or has a different password.");

            let left = desc.fail_login();
            if left == 0 {
                info!(id = desc.id, "login retries exhausted");
                return false;
            }
            true
        }
    }
}

/// Drains outbound frames to the socket with a per-frame deadline.
/// Repeated failures close the descriptor.
async fn write_task<W>(mut rx: mpsc::Receiver<OutFrame>, mut writer: W, desc: Arc<Descriptor>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let bytes = encode_frame(&frame);

        match timeout(WRITE_DEADLINE, writer.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(id = desc.id, error = %e, "write failed");
                desc.close();
                return;
            }
            Err(_) => {
                debug!(id = desc.id, "write deadline exceeded");
                desc.close();
                return;
            }
        }
    }
}

fn encode_frame(frame: &OutFrame) -> Vec<u8> {
    match frame {
        OutFrame::Text(text) => {
            let mut bytes = text.as_bytes().to_vec();
            bytes.extend_from_slice(b"\r\n");
            bytes
        }
        OutFrame::Gmcp(package, payload) => crate::telnet::gmcp_frame(package, payload),
        OutFrame::Msdp(pairs) => crate::telnet::msdp_frame(pairs),
        OutFrame::Json(value) => {
            let mut bytes = value.to_string().into_bytes();
            bytes.extend_from_slice(b"\r\n");
            bytes
        }
        OutFrame::Raw(bytes) => bytes.clone(),
    }
}

async fn cleanup(world: &World, desc: &Arc<Descriptor>) {
    let player = desc.player();
    desc.close();
    world.conns.remove(desc.id);
    world.bus.cleanup();

    if player != NOTHING {
        let name = {
            let db = world.db.read().expect("db lock poisoned");
            db.get(player).map(|o| o.name.clone()).unwrap_or_default()
        };

        let announce = Event::text(EventType::Disconnect, format!("{name} has disconnected."))
            .with_source(player);
        let db = world.db.read().expect("db lock poisoned");
        let room = db.get(player).map(|o| o.location).unwrap_or(NOTHING);
        world.bus.emit_to_room_except(&db, room, player, announce);
    }

    debug!(id = desc.id, "descriptor cleaned up");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinymush_core::Config as CoreConfig;
    use tinymush_redb::MushStore;

    fn login_world() -> World {
        let mut db = Database::new();

        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        room.contents = 1;
        let mut player = Object::new(1, ObjectType::Player, "Wizard");
        player.location = 0;
        player.set_attr(Attr::new(A_PASS, auth::crypt("potrzebie", "XX")));

        db.put(room);
        db.put(player);

        let store = MushStore::memory().unwrap();
        let (world, _rx) = World::new(db, store, CoreConfig::default());
        world
    }

    fn new_desc(world: &World) -> (Arc<Descriptor>, mpsc::Receiver<OutFrame>) {
        let (desc, rx) = Descriptor::new(world.conns.next_id(), Transport::Telnet, "test", 3);
        world.conns.add(desc.clone());
        (desc, rx)
    }

    #[test]
    fn successful_login_binds_player() {
        let world = login_world();
        let (desc, _rx) = new_desc(&world);

        assert!(handle_line(&world, &desc, "connect Wizard potrzebie"));
        assert_eq!(desc.state(), ConnState::Connected);
        assert_eq!(desc.player(), 1);
    }

    #[test]
    fn failed_logins_exhaust_retries() {
        let world = login_world();
        let (desc, _rx) = new_desc(&world);

        assert!(handle_line(&world, &desc, "connect Wizard wrong"));
        assert!(handle_line(&world, &desc, "connect Wizard wrong"));
        // third failure exhausts the three retries
        assert!(!handle_line(&world, &desc, "connect Wizard wrong"));
        assert_eq!(desc.state(), ConnState::Login);
    }

    #[test]
    fn connected_lines_go_to_the_queue() {
        let mut db = Database::new();
        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        room.contents = 1;
        let mut player = Object::new(1, ObjectType::Player, "Wizard");
        player.location = 0;
        player.set_attr(Attr::new(A_PASS, auth::crypt("pw", "ab")));
        db.put(room);
        db.put(player);

        let store = MushStore::memory().unwrap();
        let (world, mut queue_rx) = World::new(db, store, CoreConfig::default());

        let (desc, _rx) = new_desc(&world);
        assert!(handle_line(&world, &desc, "connect Wizard pw"));
        assert!(handle_line(&world, &desc, "say hello"));

        match queue_rx.try_recv().unwrap() {
            crate::queue::QueueMessage::Enqueue(entry) => {
                assert_eq!(entry.executor, 1);
                assert_eq!(entry.command, "say hello");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn quit_drops_the_descriptor() {
        let world = login_world();
        let (desc, _rx) = new_desc(&world);

        assert!(handle_line(&world, &desc, "connect Wizard potrzebie"));
        assert!(!handle_line(&world, &desc, "QUIT"));
    }

    #[test]
    fn flooding_is_throttled_before_the_queue() {
        use crate::conn::rate::BUCKET_CAPACITY;

        let mut db = Database::new();
        let mut room = Object::new(0, ObjectType::Room, "Limbo");
        room.contents = 1;
        let mut player = Object::new(1, ObjectType::Player, "Wizard");
        player.location = 0;
        player.set_attr(Attr::new(A_PASS, auth::crypt("pw", "ab")));
        db.put(room);
        db.put(player);

        let store = MushStore::memory().unwrap();
        let (world, mut queue_rx) = World::new(db, store, CoreConfig::default());

        let (desc, _rx) = new_desc(&world);
        assert!(handle_line(&world, &desc, "connect Wizard pw"));

        // flood well past the burst allowance; the connection stays up
        for _ in 0..BUCKET_CAPACITY as usize + 10 {
            assert!(handle_line(&world, &desc, "say spam"));
        }

        let mut enqueued = 0;
        while queue_rx.try_recv().is_ok() {
            enqueued += 1;
        }
        assert_eq!(enqueued, BUCKET_CAPACITY as usize);
    }

    #[test]
    fn frame_encoding_appends_crlf() {
        assert_eq!(encode_frame(&OutFrame::Text("hi".into())), b"hi\r\n");
    }

    #[test]
    fn mcp_handshake_enables_mcp_output() {
        let world = login_world();
        let (desc, _rx) = new_desc(&world);

        assert!(handle_line(
            &world,
            &desc,
            "#$#mcp authentication-key: 3F2A version: 2.1 to: 2.1"
        ));

        assert!(desc.capabilities().mcp);
        assert_eq!(desc.mcp_auth().as_deref(), Some("3F2A"));
    }

    #[tokio::test]
    async fn full_session_negotiates_and_logs_in() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let world = login_world();
        let config = Config {
            listen_address: None,
            tls_address: None,
            tls_cert: None,
            tls_key: None,
            idle_timeout: 0,
            max_retries: 3,
            mud_name: "TestMUSH".into(),
        };

        let (server_end, mut client) = tokio::io::duplex(4096);

        let session_world = world.clone();
        let task = tokio::spawn(session(
            server_end,
            Transport::Telnet,
            "test".to_owned(),
            config,
            session_world,
        ));

        // reply DO GMCP during the negotiation window, then log in
        client
            .write_all(&[crate::telnet::IAC, crate::telnet::DO, crate::telnet::TELOPT_GMCP])
            .await
            .unwrap();
        client
            .write_all(b"connect Wizard potrzebie\r\n")
            .await
            .unwrap();

        // read until the login greeting shows up
        let mut received = Vec::new();
        let mut buf = [0u8; 512];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let read =
                tokio::time::timeout_at(deadline, client.read(&mut buf)).await;
            match read {
                Ok(Ok(n)) if n > 0 => received.extend_from_slice(&buf[..n]),
                _ => break,
            }

            let text = String::from_utf8_lossy(&received);
            if text.contains("Welcome back, Wizard.") {
                break;
            }
        }

        let text = String::from_utf8_lossy(&received);
        assert!(received.starts_with(NEGOTIATION_OFFER));
        assert!(text.contains("Welcome back, Wizard."));

        let descs = world.conns.by_player(1);
        assert_eq!(descs.len(), 1);
        assert!(descs[0].capabilities().gmcp);

        task.abort();
    }
}
