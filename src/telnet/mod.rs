//! Telnet option negotiation and out-of-band framing. The parser is
//! incremental: IAC sequences that straddle a read boundary are
//! reassembled across calls and never leak bytes into the text stream.

use bytes::{BufMut, BytesMut};
use serde::Serialize;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;
pub const GA: u8 = 249;

pub const TELOPT_MSDP: u8 = 69;
pub const TELOPT_MSSP: u8 = 70;
pub const TELOPT_GMCP: u8 = 201;

pub const MSDP_VAR: u8 = 1;
pub const MSDP_VAL: u8 = 2;

/// Out-of-band capabilities negotiated on a descriptor. Consulted every
/// time a structured event is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub gmcp: bool,
    pub msdp: bool,
    pub mssp: bool,
    pub mcp: bool,
}

impl Capabilities {
    /// Applies a client reply to the server's WILL offers. `DO` enables
    /// the capability; `DONT` (and `WONT`) disables it.
    pub fn apply(&mut self, event: &TelnetEvent) {
        match event {
            TelnetEvent::Do(opt) => self.set(*opt, true),
            TelnetEvent::Dont(opt) | TelnetEvent::Wont(opt) => self.set(*opt, false),
            _ => {}
        }
    }

    fn set(&mut self, opt: u8, on: bool) {
        match opt {
            TELOPT_GMCP => self.gmcp = on,
            TELOPT_MSDP => self.msdp = on,
            TELOPT_MSSP => self.mssp = on,
            _ => {}
        }
    }
}

/// The server's single-shot negotiation offer, sent right after accept.
pub const NEGOTIATION_OFFER: &[u8] = &[
    IAC,
    WILL,
    TELOPT_GMCP,
    IAC,
    WILL,
    TELOPT_MSDP,
    IAC,
    WILL,
    TELOPT_MSSP,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// A complete text line, CR/LF stripped.
    Line(String),
    Will(u8),
    Wont(u8),
    Do(u8),
    Dont(u8),
    Subnegotiation(u8, Vec<u8>),
}

enum State {
    Data,
    Iac,
    Command(u8),
    Sub(u8),
    SubData(u8),
    SubIac(u8),
}

/// Incremental telnet stream parser. Feed raw reads in any chunking;
/// complete lines and IAC events come out in order. Partial lines and
/// subnegotiations accumulate in `BytesMut` buffers between calls.
pub struct TelnetParser {
    state: State,
    line: BytesMut,
    sub: BytesMut,
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetParser {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            line: BytesMut::new(),
            sub: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<TelnetEvent> {
        let mut events = Vec::new();

        for &b in bytes {
            match self.state {
                State::Data => match b {
                    IAC => self.state = State::Iac,
                    b'\n' => {
                        let raw = self.line.split().freeze();
                        let mut text = String::from_utf8_lossy(&raw).into_owned();
                        if text.ends_with('\r') {
                            text.pop();
                        }
                        events.push(TelnetEvent::Line(text));
                    }
                    other => self.line.put_u8(other),
                },
                State::Iac => match b {
                    // escaped 0xFF data byte
                    IAC => {
                        self.line.put_u8(IAC);
                        self.state = State::Data;
                    }
                    WILL | WONT | DO | DONT => self.state = State::Command(b),
                    SB => self.state = State::Sub(0),
                    // NOP, GA and friends carry no operand
                    _ => self.state = State::Data,
                },
                State::Command(cmd) => {
                    events.push(match cmd {
                        WILL => TelnetEvent::Will(b),
                        WONT => TelnetEvent::Wont(b),
                        DO => TelnetEvent::Do(b),
                        _ => TelnetEvent::Dont(b),
                    });
                    self.state = State::Data;
                }
                State::Sub(_) => {
                    self.sub.clear();
                    self.state = State::SubData(b);
                }
                State::SubData(opt) => match b {
                    IAC => self.state = State::SubIac(opt),
                    other => self.sub.put_u8(other),
                },
                State::SubIac(opt) => match b {
                    SE => {
                        events.push(TelnetEvent::Subnegotiation(opt, self.sub.split().to_vec()));
                        self.state = State::Data;
                    }
                    IAC => {
                        self.sub.put_u8(IAC);
                        self.state = State::SubData(opt);
                    }
                    _ => {
                        // malformed subnegotiation: drop it
                        self.sub.clear();
                        self.state = State::Data;
                    }
                },
            }
        }

        events
    }
}

/// `IAC SB 201 <package> SP <json> IAC SE`
pub fn gmcp_frame(package: &str, payload: &serde_json::Value) -> Vec<u8> {
    let mut out = vec![IAC, SB, TELOPT_GMCP];
    out.extend_from_slice(package.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload.to_string().as_bytes());
    out.push(IAC);
    out.push(SE);
    out
}

/// `IAC SB 69 (VAR <name> VAL <value>)* IAC SE`
pub fn msdp_frame(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = vec![IAC, SB, TELOPT_MSDP];
    for (name, value) in pairs {
        out.push(MSDP_VAR);
        out.extend_from_slice(name.as_bytes());
        out.push(MSDP_VAL);
        out.extend_from_slice(value.as_bytes());
    }
    out.push(IAC);
    out.push(SE);
    out
}

/// In-band MCP line: `#$#<package> <auth-key> key: value ...`
pub fn mcp_line(package: &str, auth: &str, pairs: &[(String, String)]) -> String {
    let mut out = format!("#$#{package} {auth}");
    for (key, value) in pairs {
        out.push_str(&format!(" {key}: {value}"));
    }
    out
}
