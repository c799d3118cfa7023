//! TCP front-end for the protocol engine.
//!
//! The engine itself is sans-io; this module supplies the byte
//! transport. Each accepted socket becomes one initial/reply stream
//! pair: socket reads are fed to the engine as DATA messages, engine
//! DATA on the reply stream is written back out, and WINDOW grants on
//! the initial stream pace how much the reader may pull off the
//! socket. Application-side messages travel over a channel pair to
//! whatever consumes the bridged links.

use std::{collections::HashMap, io, sync::Arc};

use bytes::Bytes;
use futures::FutureExt;
use log::warn;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::EngineConfig,
    credit::SharedCreditor,
    engine::AmqpEngine,
    route::Router,
    transport::{Abort, BudgetId, Data, End, Message, RouteId, StreamId, TraceId, Window},
};

const CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

/// Commands routed from the engine to one connection task.
#[derive(Debug)]
enum ConnCommand {
    /// Bytes to write to the socket.
    Write(Bytes),
    /// Budget granted for further socket reads.
    Credit(u32),
    /// Orderly shutdown of the write half.
    FinishWrites,
    /// Stop reading from the socket.
    StopReads,
}

/// The application's half of the bridge.
///
/// `rx` yields messages the engine sends toward the application
/// (stream BEGINs for attached links, WINDOW budget grants, aborts);
/// `tx` accepts the application's replies and deliveries.
pub struct ApplicationHandle {
    pub rx: mpsc::Receiver<Message>,
    pub tx: mpsc::Sender<Message>,
}

/// TCP server bridging AMQP clients onto the internal transport.
pub struct AmqpServer {
    engine: AmqpEngine,
    route_id: RouteId,
    /// Bytes of reply budget granted up front per connection; the
    /// socket has no WINDOW peer, so the server stands in for one.
    reply_window: u32,
    app_tx: mpsc::Sender<Message>,
    app_rx: mpsc::Receiver<Message>,
}

impl AmqpServer {
    /// Build a server and the application handle it bridges to.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        router: Arc<dyn Router>,
        route_id: RouteId,
    ) -> (Self, ApplicationHandle) {
        let reply_window = config.slot_capacity as u32;
        let engine = AmqpEngine::new(config, router, Arc::new(SharedCreditor::new()));
        let (engine_app_tx, app_side_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (app_side_tx, engine_app_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                engine,
                route_id,
                reply_window,
                app_tx: engine_app_tx,
                app_rx: engine_app_rx,
            },
            ApplicationHandle {
                rx: app_side_rx,
                tx: app_side_tx,
            },
        )
    }

    /// Accept and serve connections until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that stopped the accept loop.
    pub async fn run(
        mut self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        let tracker = TaskTracker::new();
        let (event_tx, mut event_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let mut writers: HashMap<StreamId, mpsc::Sender<ConnCommand>> = HashMap::new();
        let mut next_stream: u64 = 1;
        let mut next_trace: u64 = 1;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let initial_id = StreamId(next_stream);
                    next_stream += 2;
                    let trace_id = TraceId(next_trace);
                    next_trace += 1;
                    tracing::info!(%initial_id, %peer, "accepted connection");

                    let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
                    writers.insert(initial_id, command_tx.clone());
                    writers.insert(initial_id.counterpart(), command_tx);
                    spawn_connection_task(
                        &tracker,
                        socket,
                        self.route_id,
                        initial_id,
                        event_tx.clone(),
                        command_rx,
                        shutdown.clone(),
                    );

                    self.engine.on_message(Message::Begin(crate::transport::Begin {
                        route_id: self.route_id,
                        stream_id: initial_id,
                        trace_id,
                        authorization: 0,
                        affinity: 0,
                        extension: None,
                    }));
                    self.grant_reply_window(initial_id.counterpart(), self.reply_window);
                    self.route_transmit(&mut writers).await;
                }

                Some(message) = event_rx.recv() => {
                    self.engine.on_message(message);
                    self.route_transmit(&mut writers).await;
                }

                Some(message) = self.app_rx.recv() => {
                    self.engine.on_message(message);
                    self.route_transmit(&mut writers).await;
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    /// Route everything the engine produced this turn: network-stream
    /// messages to their connection task, the rest to the application.
    async fn route_transmit(&mut self, writers: &mut HashMap<StreamId, mpsc::Sender<ConnCommand>>) {
        loop {
            let Some(message) = self.engine.poll_transmit() else {
                break;
            };
            let stream_id = message.stream_id();
            let Some(writer) = writers.get(&stream_id) else {
                if self.app_tx.send(message).await.is_err() {
                    warn!("application handle dropped; discarding engine output");
                }
                continue;
            };

            let mut replenish = 0;
            let command = match &message {
                Message::Data(data) => {
                    replenish = data.reserved;
                    Some(ConnCommand::Write(data.payload.clone()))
                }
                Message::Window(window) => Some(ConnCommand::Credit(window.credit)),
                Message::End(_) => Some(ConnCommand::FinishWrites),
                Message::Abort(_) | Message::Reset(_) => Some(ConnCommand::StopReads),
                Message::Begin(_) | Message::Signal(_) => None,
            };
            let closes = matches!(&message, Message::End(_) | Message::Abort(_));

            if let Some(command) = command
                && writer.send(command).await.is_err()
            {
                tracing::debug!(%stream_id, "connection task gone");
            }
            if closes {
                writers.remove(&stream_id);
                writers.remove(&stream_id.counterpart());
            } else if replenish > 0 {
                // The socket applies its own backpressure through the
                // writer channel; hand the spent budget straight back.
                self.grant_reply_window(stream_id, replenish);
            }
        }
    }

    fn grant_reply_window(&mut self, reply_id: StreamId, credit: u32) {
        self.engine.on_message(Message::Window(Window {
            route_id: self.route_id,
            stream_id: reply_id,
            trace_id: TraceId(0),
            authorization: 0,
            budget_id: BudgetId::default(),
            credit,
            padding: 0,
            minimum: 0,
        }));
    }
}

/// Spawn a task owning one socket, logging and discarding any panics.
fn spawn_connection_task(
    tracker: &TaskTracker,
    socket: TcpStream,
    route_id: RouteId,
    initial_id: StreamId,
    events: mpsc::Sender<Message>,
    commands: mpsc::Receiver<ConnCommand>,
    shutdown: CancellationToken,
) {
    tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(drive_connection(
            socket, route_id, initial_id, events, commands, shutdown,
        ))
        .catch_unwind();
        if fut.await.is_err() {
            tracing::error!(%initial_id, "connection task panicked");
        }
    });
}

async fn drive_connection(
    socket: TcpStream,
    route_id: RouteId,
    initial_id: StreamId,
    events: mpsc::Sender<Message>,
    mut commands: mpsc::Receiver<ConnCommand>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = socket.into_split();
    let mut read_budget: usize = 0;
    let mut reading = true;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut trace: u64 = 0;

    loop {
        let may_read = reading && read_budget > 0;
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                let _ = events
                    .send(Message::Abort(Abort {
                        route_id,
                        stream_id: initial_id,
                        trace_id: TraceId(trace),
                        authorization: 0,
                    }))
                    .await;
                break;
            }

            command = commands.recv() => match command {
                None => break,
                Some(ConnCommand::Write(payload)) => {
                    if let Err(error) = writer.write_all(&payload).await {
                        tracing::debug!(%initial_id, %error, "socket write failed");
                        let _ = events
                            .send(Message::Abort(Abort {
                                route_id,
                                stream_id: initial_id,
                                trace_id: TraceId(trace),
                                authorization: 0,
                            }))
                            .await;
                        break;
                    }
                }
                Some(ConnCommand::Credit(credit)) => read_budget += credit as usize,
                Some(ConnCommand::FinishWrites) => {
                    let _ = writer.shutdown().await;
                }
                Some(ConnCommand::StopReads) => reading = false,
            },

            read = reader.read(&mut buf[..read_budget.min(READ_CHUNK)]), if may_read => {
                trace += 1;
                match read {
                    Ok(0) => {
                        reading = false;
                        let _ = events
                            .send(Message::End(End {
                                route_id,
                                stream_id: initial_id,
                                trace_id: TraceId(trace),
                                authorization: 0,
                            }))
                            .await;
                    }
                    Ok(n) => {
                        read_budget -= n;
                        let message = Message::Data(Data {
                            route_id,
                            stream_id: initial_id,
                            trace_id: TraceId(trace),
                            authorization: 0,
                            budget_id: crate::transport::BudgetId::default(),
                            reserved: n as u32,
                            fin: false,
                            payload: Bytes::copy_from_slice(&buf[..n]),
                            extension: None,
                        });
                        if events.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::debug!(%initial_id, %error, "socket read failed");
                        let _ = events
                            .send(Message::Abort(Abort {
                                route_id,
                                stream_id: initial_id,
                                trace_id: TraceId(trace),
                                authorization: 0,
                            }))
                            .await;
                        break;
                    }
                }
            }
        }
    }
}
