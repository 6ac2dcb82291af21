//! Network layer

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dsim_common::{
    constants::{DSIM_CONNECT_ATTEMPTS, DSIM_CONNECT_BACKOFF_MS, DSIM_LISTEN_ADDR},
    wire::{self, Handshake},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{TcpListener, TcpStream},
    runtime::Runtime,
    sync::mpsc::{self, UnboundedReceiver},
};

use crate::{
    channel::Channel,
    error::{Result, SimError},
    process::ProcessShared,
};

/// Binds a process listener on the local host; port 0 lets the OS choose.
pub fn create_listener(port: u16) -> Result<std::net::TcpListener> {
    use socket2::{Domain, Socket, Type};
    let bind_addr = SocketAddr::from((DSIM_LISTEN_ADDR, port));
    let sock = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&bind_addr.into())
        .map_err(|e| SimError::network(format!("failed to bind {bind_addr}"), e))?;
    sock.listen(128)?;
    Ok(sock.into())
}

/// Async side of the simulation: the tokio runtime running every listener,
/// reader and writer task.
#[derive(Debug)]
pub struct Transport {
    runtime: Runtime,
}

impl Transport {
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("dsim-io")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Accepts inbound connections for `process` until it signals a stop.
    pub fn start_listening(&self, listener: std::net::TcpListener, process: Arc<ProcessShared>) {
        let tracked = Arc::clone(&process);
        let handle = self.runtime.spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("p{}: listener setup failed: {e}", process.id());
                    return;
                }
            };
            debug!("p{}: listening on port {}", process.id(), process.receive_port());
            loop {
                tokio::select! {
                    () = process.listener_stop().notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let reader = tokio::spawn(read_connection(stream, peer, Arc::clone(&process)));
                            process.track_reader(reader);
                        }
                        Err(e) => warn!("p{}: accept failed: {e}", process.id()),
                    },
                }
            }
            debug!("p{}: listener stopped", process.id());
        });
        tracked.track_listener(handle);
    }

    /// Attaches a writer task to `channel`, connected to its destination
    /// listener. Messages handed over before the connection completes are
    /// buffered.
    pub fn start_sending(&self, channel: Arc<Channel>) {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        let dest = SocketAddr::from((DSIM_LISTEN_ADDR, channel.dest_port()));
        self.runtime.spawn(async move {
            if let Err(e) = write_connection(&channel, dest, rx).await {
                warn!(
                    "channel {} ({}->{}): writer failed: {e}",
                    channel.id(),
                    channel.source(),
                    channel.dest()
                );
                channel.close();
            }
        });
    }

    /// Stops the runtime, giving in-flight tasks `timeout` to finish.
    pub fn shutdown(self, timeout: Duration) {
        self.runtime.shutdown_timeout(timeout);
        info!("Transport stopped");
    }
}

async fn connect(dest: SocketAddr) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(dest).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 < DSIM_CONNECT_ATTEMPTS => {
                attempt += 1;
                debug!("connect to {dest} failed ({e}), retry {attempt}");
                tokio::time::sleep(Duration::from_millis(DSIM_CONNECT_BACKOFF_MS)).await;
            }
            Err(e) => return Err(SimError::network(format!("cannot reach {dest}"), e)),
        }
    }
}

async fn write_connection(
    channel: &Channel,
    dest: SocketAddr,
    mut rx: UnboundedReceiver<dsim_common::Message>,
) -> Result<()> {
    let stream = connect(dest).await?;
    stream.set_nodelay(true)?;
    channel.set_source_port(stream.local_addr()?.port());

    let mut writer = BufWriter::new(stream);
    let mut hello = wire::encode_handshake(&Handshake {
        channel: channel.id(),
        source: channel.source(),
    })?;
    hello.push(b'\n');
    writer.write_all(&hello).await?;
    writer.flush().await?;

    // Ends when the channel is closed and every queued message is flushed
    while let Some(message) = rx.recv().await {
        let mut frame = wire::encode(&message)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        if rx.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    writer.into_inner().shutdown().await?;
    Ok(())
}

async fn read_connection(stream: TcpStream, peer: SocketAddr, process: Arc<ProcessShared>) {
    let mut lines = BufReader::new(stream).lines();

    let channel = match lines.next_line().await {
        Ok(Some(line)) => match wire::decode_handshake(line.as_bytes()) {
            Ok(hello) => process
                .incoming_channel(hello.channel)
                .filter(|c| c.source() == hello.source)
                .cloned(),
            Err(e) => {
                warn!("p{}: bad handshake from {peer}: {e}", process.id());
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("p{}: read from {peer} failed: {e}", process.id());
            None
        }
    };
    let Some(channel) = channel else {
        warn!("p{}: dropping unknown connection from {peer}", process.id());
        return;
    };
    channel.set_source_port(peer.port());
    debug!(
        "p{}: channel {} from p{} connected",
        process.id(),
        channel.id(),
        channel.source()
    );

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match wire::decode(line.as_bytes()) {
                Ok(mut message) => {
                    message.arrived_on = Some(channel.id());
                    process.queue().enqueue(message);
                }
                Err(e) => warn!("p{}: undecodable frame on channel {}: {e}", process.id(), channel.id()),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("p{}: channel {} read failed: {e}", process.id(), channel.id());
                break;
            }
        }
    }
    debug!("p{}: channel {} closed", process.id(), channel.id());
}

#[cfg(test)]
mod tests {
    use dsim_common::{Message, MessageType};

    use super::*;
    use crate::topology::ProcessSpec;

    #[test]
    fn test_create_listener_assigns_port() {
        let listener = create_listener(0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_messages_reach_destination_queue() {
        let spec = ProcessSpec {
            id: 1,
            name: "p1".to_owned(),
            initiator: false,
            receive_port: 0,
        };
        let channel = Arc::new(Channel::new(7, 0, 1));
        let process = Arc::new(ProcessShared::new(&spec, vec![Arc::clone(&channel)], Vec::new()));

        let listener = create_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        process.set_receive_port(port);
        channel.set_dest_port(port);

        let transport = Transport::new(2).unwrap();
        transport.start_listening(listener, Arc::clone(&process));
        transport.start_sending(Arc::clone(&channel));

        for round in 0..3 {
            channel
                .transmit(Message::new(MessageType::Forwarded).with_round(round))
                .unwrap();
        }
        let mut rounds = Vec::new();
        for _ in 0..3 {
            let head = process.queue().take_next(&mut crate::queue::Fifo);
            assert_eq!(head.arrived_on, Some(7));
            rounds.push(head.round().unwrap());
            process.queue().remove_first();
        }
        assert_eq!(rounds, vec![0, 1, 2]);
        assert_ne!(channel.source_port(), 0);

        channel.close();
        process.stop();
        transport.shutdown(Duration::from_secs(1));
    }
}
