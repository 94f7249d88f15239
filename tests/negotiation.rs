//! Telnet negotiation against the literal wire bytes.

use tinymush::telnet::{
    Capabilities, TelnetEvent, TelnetParser, NEGOTIATION_OFFER, TELOPT_GMCP, TELOPT_MSDP,
};

#[test]
fn offer_and_reply_settle_capabilities() {
    // server offer: IAC WILL GMCP, IAC WILL MSDP, IAC WILL MSSP
    assert_eq!(
        NEGOTIATION_OFFER,
        &[0xff, 0xfb, 0xc9, 0xff, 0xfb, 0x45, 0xff, 0xfb, 0x46]
    );

    // client reply: IAC DO GMCP, IAC WONT MSDP (silence on MSSP)
    let reply = [0xff, 0xfd, 0xc9, 0xff, 0xfc, 0x45];

    let mut parser = TelnetParser::new();
    let mut caps = Capabilities::default();
    for event in parser.feed(&reply) {
        caps.apply(&event);
    }

    assert!(caps.gmcp);
    assert!(!caps.msdp);
    assert!(!caps.mssp);
}

#[test]
fn replies_split_across_reads_still_settle() {
    let reply = [0xff, 0xfd, TELOPT_GMCP, 0xff, 0xfc, TELOPT_MSDP];

    // feed the reply one byte at a time, as a slow client would
    let mut parser = TelnetParser::new();
    let mut caps = Capabilities::default();
    for &byte in &reply {
        for event in parser.feed(&[byte]) {
            caps.apply(&event);
        }
    }

    assert!(caps.gmcp);
    assert!(!caps.msdp);
}

#[test]
fn text_around_negotiation_stays_clean() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"conn");
    bytes.extend_from_slice(&[0xff, 0xfd, TELOPT_GMCP]);
    bytes.extend_from_slice(b"ect guest guest\r\n");

    let mut parser = TelnetParser::new();
    let events = parser.feed(&bytes);

    assert_eq!(
        events,
        vec![
            TelnetEvent::Do(TELOPT_GMCP),
            TelnetEvent::Line("connect guest guest".into()),
        ]
    );
}
