//! Echo daemon: mirrors every byte on the service port, speaks the message
//! protocol on the admin port. Runs in all three process modes.

use conduit::channel::{Channel, ChannelCore, Handler};
use conduit::error::ErrorKind;
use conduit::instance::{self, Instance, Service};
use conduit::listener::{Accepted, AcceptHandler, ListenerKind};
use conduit::packet::msg::{MsgPacket, MsgParser};
use conduit::packet::{RawPacket, RawParser};
use conduit::reactor::Turn;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Service channel: every packet goes straight back to the peer.
struct EchoChannel;

impl Handler for EchoChannel {
    type Parser = RawParser;

    fn on_packet(&mut self, ch: &mut ChannelCore, _turn: &mut Turn, packet: RawPacket) {
        if ch.write(&packet).is_err() {
            ch.expire();
        }
    }
}

/// Admin channel: `EXIT` stops the daemon, anything else is rejected.
struct AdminChannel;

impl Handler for AdminChannel {
    type Parser = MsgParser;

    fn on_packet(&mut self, ch: &mut ChannelCore, turn: &mut Turn, packet: MsgPacket) {
        if packet.code == "EXIT" {
            instance::request_stop(0);
        } else {
            self.on_error(ch, turn, ErrorKind::InvalidPacket);
        }
    }
}

fn spawn_echo(turn: &mut Turn, accepted: Accepted, ping: Option<Duration>) -> bool {
    let raw = accepted.fd.raw();
    let channel = Channel::new(
        accepted.fd,
        turn.poller.clone(),
        accepted.tls,
        Some(accepted.peer),
        ping,
        turn.log.clone(),
        EchoChannel,
    );
    turn.spawn(raw, Box::new(channel));
    true
}

fn spawn_admin(turn: &mut Turn, accepted: Accepted) -> bool {
    let raw = accepted.fd.raw();
    let channel = Channel::new(
        accepted.fd,
        turn.poller.clone(),
        accepted.tls,
        Some(accepted.peer),
        None,
        turn.log.clone(),
        AdminChannel,
    );
    turn.spawn(raw, Box::new(channel));
    true
}

struct EchoAccept {
    ping: Option<Duration>,
}

impl AcceptHandler for EchoAccept {
    fn on_accept(&mut self, turn: &mut Turn, accepted: Accepted) -> bool {
        spawn_echo(turn, accepted, self.ping)
    }
}

struct AdminAccept;

impl AcceptHandler for AdminAccept {
    fn on_accept(&mut self, turn: &mut Turn, accepted: Accepted) -> bool {
        spawn_admin(turn, accepted)
    }
}

/// Child-side dispatch: one channel flavor per listener kind.
struct ChildAccept {
    ping: Option<Duration>,
}

impl AcceptHandler for ChildAccept {
    fn on_accept(&mut self, turn: &mut Turn, accepted: Accepted) -> bool {
        match accepted.kind {
            ListenerKind::Service => spawn_echo(turn, accepted, self.ping),
            ListenerKind::Admin => spawn_admin(turn, accepted),
            _ => false,
        }
    }
}

struct EchoService;

impl Service for EchoService {
    fn on_init_listener_single(&mut self, inst: &mut Instance) -> bool {
        let ping = inst.ping_duration();

        if inst
            .open_listener(
                "svc",
                ListenerKind::Service,
                Rc::new(RefCell::new(EchoAccept { ping })),
                None,
            )
            .is_err()
        {
            return false;
        }

        inst.open_listener(
            "admin",
            ListenerKind::Admin,
            Rc::new(RefCell::new(AdminAccept)),
            None,
        )
        .is_ok()
    }

    fn on_init_listener_parent(&mut self, inst: &mut Instance) -> bool {
        inst.open_listener_parent("svc", ListenerKind::Service).is_ok()
            && inst.open_listener_parent("admin", ListenerKind::Admin).is_ok()
    }

    fn on_init_listener_child(&mut self, inst: &mut Instance) -> bool {
        let ping = inst.ping_duration();

        inst.open_listener_child(Rc::new(RefCell::new(ChildAccept { ping })), Vec::new())
            .is_ok()
    }
}

fn main() {
    let mut service = EchoService;
    let code = instance::run("echo", &mut service, std::env::args().collect());
    std::process::exit(code);
}
