//! HTTP mirror daemon: answers every request with a 200 whose body is the
//! request body, over plain HTTP and HTTPS, plus the usual admin port.

use ballast::logging;
use conduit::channel::{Channel, ChannelCore, Handler};
use conduit::error::ErrorKind;
use conduit::instance::{self, Instance, Service};
use conduit::listener::{Accepted, AcceptHandler, ListenerKind};
use conduit::packet::http::{HttpRequestPacket, HttpRequestParser, HttpResponsePacket};
use conduit::packet::msg::{MsgPacket, MsgParser};
use conduit::reactor::Turn;
use conduit::tls::{self, ServerConfig};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Service channel: the response body mirrors the request body.
struct MirrorChannel;

impl Handler for MirrorChannel {
    type Parser = HttpRequestParser;

    fn on_packet(&mut self, ch: &mut ChannelCore, _turn: &mut Turn, request: HttpRequestPacket) {
        let mut response = HttpResponsePacket::new(200);
        response.set_header("Content-Type", "application/octet-stream");
        response.body = request.body;

        if ch.write(&response).is_err() {
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

fn spawn_mirror(turn: &mut Turn, accepted: Accepted, ping: Option<Duration>) -> bool {
    let raw = accepted.fd.raw();
    let channel = Channel::new(
        accepted.fd,
        turn.poller.clone(),
        accepted.tls,
        Some(accepted.peer),
        ping,
        turn.log.clone(),
        MirrorChannel,
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

struct MirrorAccept {
    ping: Option<Duration>,
}

impl AcceptHandler for MirrorAccept {
    fn on_accept(&mut self, turn: &mut Turn, accepted: Accepted) -> bool {
        spawn_mirror(turn, accepted, self.ping)
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
            ListenerKind::ServiceHttp | ListenerKind::ServiceHttps => {
                spawn_mirror(turn, accepted, self.ping)
            }
            ListenerKind::Admin => spawn_admin(turn, accepted),
            _ => false,
        }
    }
}

#[derive(Default)]
struct HttpService {
    tls: Option<Arc<ServerConfig>>,
}

impl HttpService {
    /// The `[https]` section carries cert and key paths; without it the
    /// daemon serves plain HTTP only.
    fn load_tls(&mut self, inst: &Instance) -> bool {
        if !inst.config.has_section("https") {
            self.tls = None;
            return true;
        }

        let cert = inst.config.get("https", "cert").map(str::to_string);
        let key = inst.config.get("https", "key").map(str::to_string);

        match (cert, key) {
            (Some(cert), Some(key)) => match tls::load_server_config(&cert, &key) {
                Ok(config) => {
                    self.tls = Some(config);
                    true
                }
                Err(err) => {
                    logging::error!(inst.err_log, "failed to load tls settings";
                                    "cert" => cert, "key" => key, "err" => %err);
                    false
                }
            },
            _ => {
                logging::error!(inst.err_log, "https section needs cert and key");
                false
            }
        }
    }
}

impl Service for HttpService {
    fn on_config(&mut self, inst: &mut Instance, _is_default: bool, _is_reload: bool) -> bool {
        self.load_tls(inst)
    }

    fn on_init_listener_single(&mut self, inst: &mut Instance) -> bool {
        let ping = inst.ping_duration();

        if inst
            .open_listener(
                "http",
                ListenerKind::ServiceHttp,
                Rc::new(RefCell::new(MirrorAccept { ping })),
                None,
            )
            .is_err()
        {
            return false;
        }

        if let Some(tls) = self.tls.clone() {
            if inst
                .open_listener(
                    "https",
                    ListenerKind::ServiceHttps,
                    Rc::new(RefCell::new(MirrorAccept { ping })),
                    Some(tls),
                )
                .is_err()
            {
                return false;
            }
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
        if inst
            .open_listener_parent("http", ListenerKind::ServiceHttp)
            .is_err()
        {
            return false;
        }

        if self.tls.is_some()
            && inst
                .open_listener_parent("https", ListenerKind::ServiceHttps)
                .is_err()
        {
            return false;
        }

        inst.open_listener_parent("admin", ListenerKind::Admin).is_ok()
    }

    fn on_init_listener_child(&mut self, inst: &mut Instance) -> bool {
        let ping = inst.ping_duration();

        let mut tls = Vec::new();
        if let Some(config) = self.tls.clone() {
            tls.push((ListenerKind::ServiceHttps, config));
        }

        inst.open_listener_child(Rc::new(RefCell::new(ChildAccept { ping })), tls)
            .is_ok()
    }
}

fn main() {
    let mut service = HttpService::default();
    let code = instance::run("http", &mut service, std::env::args().collect());
    std::process::exit(code);
}
