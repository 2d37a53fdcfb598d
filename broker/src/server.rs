//! Single-threaded serve loop
//!
//! One poller watches the listener and every client connection. Requests
//! are handled to completion before the next one is read, so device access
//! is serialised by construction: two clients interleave whole
//! request/reply pairs, never bytes on the bus.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;

use polling::{Event, Events, Poller};

use phstat_core::clock::SystemClock;
use phstat_core::config::Config;
use phstat_core::error::{ResultExt, SystemError, TypedResult};
use phstat_core::facade::{LocalSystems, PhysicalSystems};
use phstat_core::net::{recv_frame, send_frame, Envelope, DEFAULT_BROKER_PORT};

use crate::broker::{Broker, Flow};

const LISTENER_KEY: usize = 0;

pub fn run_broker(config_path: &Path, port: Option<u16>) -> TypedResult<()> {
    let config = Config::load(config_path)?;
    let mut systems = LocalSystems::new(config, Arc::new(SystemClock));
    info!("connecting to the pH meter and the pump controller");
    systems.initialize()?;

    let port = port.unwrap_or(DEFAULT_BROKER_PORT);
    let listener = TcpListener::bind(("0.0.0.0", port)).typ(SystemError::Bus)?;
    info!("listening on port {port}");
    serve(listener, systems)
}

pub fn serve(listener: TcpListener, systems: impl PhysicalSystems) -> TypedResult<()> {
    listener.set_nonblocking(true).typ(SystemError::Bus)?;
    let poller = Poller::new().typ(SystemError::Bus)?;
    unsafe {
        poller
            .add(&listener, Event::readable(LISTENER_KEY))
            .typ(SystemError::Bus)?;
    }

    let mut broker = Broker::new(systems);
    let mut clients: HashMap<usize, TcpStream> = HashMap::new();
    let mut next_key = LISTENER_KEY + 1;
    let mut events = Events::new();

    loop {
        events.clear();
        poller.wait(&mut events, None).typ(SystemError::Bus)?;

        for event in events.iter() {
            if event.key == LISTENER_KEY {
                accept_clients(&listener, &poller, &mut clients, &mut next_key)?;
                poller
                    .modify(&listener, Event::readable(LISTENER_KEY))
                    .typ(SystemError::Bus)?;
                continue;
            }

            let Some(stream) = clients.get_mut(&event.key) else {
                continue;
            };
            match serve_one(&mut broker, stream) {
                Ok(Flow::Stop) => {
                    info!("stop requested, shutting down");
                    return Ok(());
                }
                Ok(Flow::Continue) => {
                    poller
                        .modify(stream, Event::readable(event.key))
                        .typ(SystemError::Bus)?;
                }
                Err(e) => {
                    // Client went away mid-frame; forget the connection.
                    debug!("dropping client {}: {e}", event.key);
                    let stream = clients.remove(&event.key).unwrap();
                    poller.delete(&stream).ok();
                }
            }
        }
    }
}

fn accept_clients(
    listener: &TcpListener,
    poller: &Poller,
    clients: &mut HashMap<usize, TcpStream>,
    next_key: &mut usize,
) -> TypedResult<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false).typ(SystemError::Bus)?;
                let key = *next_key;
                *next_key += 1;
                info!("client {key} connected from {peer}");
                unsafe {
                    poller
                        .add(&stream, Event::readable(key))
                        .typ(SystemError::Bus)?;
                }
                clients.insert(key, stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e).typ(SystemError::Bus),
        }
    }
}

/// Reads one request off the wire, handles it and replies.
fn serve_one(broker: &mut Broker<impl PhysicalSystems>, stream: &mut TcpStream) -> TypedResult<Flow> {
    let envelope: Envelope = recv_frame(stream)?;
    info!("received ({}): {}", envelope.client_id, envelope.request.verb());
    let (reply, flow) = broker.handle(&envelope.request);
    send_frame(stream, &reply)?;
    info!("---> replied ({}): {}", envelope.client_id, reply.render());
    Ok(flow)
}
