//! Scope multiplexing.
//!
//! One physical socket can carry several logical channels, one per scope
//! (a CONNECT tunnel or WebSocket requesting `math+log` gets two). The mux
//! owns the real transport and fans packets out to per-scope endpoints by
//! their scope label; each endpoint is itself a [`FrameTransport`] usable
//! for a channel.

use std::collections::HashMap;
use std::io;

use parley_wire::Packet;
use tokio::sync::mpsc;

use crate::{FrameTransport, CHANNEL_SIZE};

/// A per-scope endpoint of a multiplexed transport.
pub struct MuxTransport {
    scope: String,
    incoming: mpsc::Receiver<Packet>,
    outgoing: mpsc::Sender<Packet>,
}

impl MuxTransport {
    /// The scope this endpoint serves.
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl FrameTransport for MuxTransport {
    async fn send(&mut self, packet: Packet) -> io::Result<()> {
        self.outgoing
            .send(packet)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mux pump gone"))
    }

    async fn recv(&mut self) -> io::Result<Option<Packet>> {
        Ok(self.incoming.recv().await)
    }
}

/// Split a transport into per-scope endpoints.
///
/// Spawns the pump task that owns `transport`. Incoming packets route by
/// their scope label; packets for unknown scopes are dropped with a log
/// line. The pump ends (closing every endpoint) when the transport reaches
/// end-of-stream or errors, or when every endpoint is gone.
pub fn scope_mux<T: FrameTransport>(transport: T, scopes: &[String]) -> Vec<MuxTransport> {
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_SIZE);

    let mut endpoints = Vec::with_capacity(scopes.len());
    let mut routes = HashMap::with_capacity(scopes.len());
    for scope in scopes {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_SIZE);
        routes.insert(scope.clone(), in_tx);
        endpoints.push(MuxTransport {
            scope: scope.clone(),
            incoming: in_rx,
            outgoing: out_tx.clone(),
        });
    }

    tokio::spawn(pump(transport, routes, out_rx));
    endpoints
}

async fn pump<T: FrameTransport>(
    mut transport: T,
    routes: HashMap<String, mpsc::Sender<Packet>>,
    mut out_rx: mpsc::Receiver<Packet>,
) {
    loop {
        tokio::select! {
            incoming = transport.recv() => match incoming {
                Ok(Some(packet)) => match routes.get(&packet.scope) {
                    Some(route) => {
                        if route.send(packet).await.is_err() {
                            // Endpoint gone; its scope is dead but others live on.
                        }
                    }
                    None => {
                        warn!(scope = %packet.scope, "dropping packet for unknown scope");
                    }
                },
                Ok(None) => {
                    debug!("mux transport reached end-of-stream");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "mux transport read failed");
                    break;
                }
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(packet) => {
                    if let Err(e) = transport.send(packet).await {
                        warn!(error = %e, "mux transport write failed");
                        break;
                    }
                }
                // Every endpoint dropped its sender.
                None => break,
            },
        }
    }
    // Dropping `routes` closes all endpoint receivers.
}
