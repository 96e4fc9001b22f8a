//! The chat client.
//!
//! Three tasks cooperate without sharing any locks:
//!
//! ```text
//!   input --TerminalCodec--> talker --Outbound--> session --Link--> server
//!                                                    |
//!                                                 UiEvent
//!                                                    v
//!                                                 render --> output
//! ```
//!
//! The session task is the only owner of the [`Connection`], so a reconnect can swap the socket
//! without anyone seeing a half-updated descriptor. The render task is the only writer of the
//! output. The session publishes whether it is online, and the talker refuses to queue chat while
//! it is not, so lines typed during an outage are never delivered late.
//!
//! Shutdown is cooperative: on quit or end of input the talker fires the cancellation token, which
//! also interrupts a reconnect backoff in progress. The session then flushes what is already
//! queued, says goodbye if it can, and closes. The foreground joins the session and the renderer
//! before returning.

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::codec::Received;
use crate::config::ClientConfig;
use crate::connection::{Connection, ReconnectPolicy, SessionState};
use crate::error::{ClientError, TransportError, Violation};
use crate::packet::{Kind, Packet, PacketBuilder};
use crate::terminal::{self, Command, TerminalCodec, UiEvent, HELP};

const OUTBOX_DEPTH: usize = 32;
const UI_DEPTH: usize = 128;
const OFFLINE: &str = "offline, message not sent";

/// Requests from the talker to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Say(String),
    Whisper { to: String, text: String },
}

/// Owns the connection and drives both directions of it.
pub struct Session {
    connection: Connection,
    builder: PacketBuilder,
    outbox: mpsc::Receiver<Outbound>,
    ui: mpsc::Sender<UiEvent>,
    online: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        connection: Connection,
        builder: PacketBuilder,
        outbox: mpsc::Receiver<Outbound>,
        ui: mpsc::Sender<UiEvent>,
        cancel: CancellationToken,
    ) -> Session {
        let (online, _) = watch::channel(connection.is_online());
        Session {
            connection,
            builder,
            outbox,
            ui,
            online,
            cancel,
        }
    }

    /// Follows whether the session is online.
    pub fn online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Announces the user, then serves until quit, cancellation or a fatal transport error.
    /// Whatever the exit path, the token is cancelled on the way out so the talker stops too.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let _stop_talker = self.cancel.clone().drop_guard();
        info!("client: joining as {}", self.builder.usrname());

        if let Ok(join) = self.builder.signal(Kind::Join) {
            self.transmit(join).await?;
        }

        loop {
            tokio::select! {
                biased;

                outbound = self.outbox.recv() => match outbound {
                    None => break,
                    Some(Outbound::Say(text)) => {
                        let sealed = self.builder.message(&text);
                        self.outbound(sealed).await?;
                    }
                    Some(Outbound::Whisper { to, text }) => {
                        let sealed = self.builder.whisper(&to, &text);
                        self.outbound(sealed).await?;
                    }
                },
                _ = self.cancel.cancelled() => break,
                received = self.connection.recv() => {
                    if !self.inbound(received).await? {
                        return Ok(());
                    }
                }
            }
        }

        self.quit().await;
        Ok(())
    }

    async fn outbound(&mut self, sealed: Result<Packet, Violation>) -> Result<(), ClientError> {
        match sealed {
            Ok(packet) => self.transmit(packet).await,
            Err(violation) => {
                self.show(UiEvent::Notice(format!("not sent: {}", violation)))
                    .await;
                Ok(())
            }
        }
    }

    /// Sends and records a packet. A recoverable failure starts a reconnect and drops the packet.
    async fn transmit(&mut self, packet: Packet) -> Result<(), ClientError> {
        match self.connection.send(&packet).await {
            Ok(()) => {
                self.show(UiEvent::Sent(packet)).await;
                Ok(())
            }
            Err(TransportError::Recoverable(err)) => {
                warn!("client: send failed: {}", err);
                self.show(UiEvent::Notice("message not sent".to_string()))
                    .await;
                self.recover().await;
                Ok(())
            }
            Err(fatal) => {
                error!("client: send failed: {}", fatal);
                Err(fatal.into())
            }
        }
    }

    /// Handles one inbound step. `Ok(false)` means the session has stopped.
    async fn inbound(&mut self, received: Received) -> Result<bool, ClientError> {
        match received {
            Received::Packet(packet) => {
                match packet.kind {
                    Kind::Ack | Kind::Pong => debug!("client: {}", packet),
                    _ => {}
                }
                self.show(UiEvent::Received(packet)).await;
                Ok(true)
            }
            Received::Invalid(err) => {
                warn!("client: {}", err);
                Ok(true)
            }
            Received::Desync(discarded) => {
                warn!("client: desynced, discarded {} bytes", discarded);
                Ok(true)
            }
            Received::Disconnected => {
                info!("client: server hung up");
                Ok(self.recover().await)
            }
            Received::Transport(TransportError::Recoverable(err)) => {
                warn!("client: recv failed: {}", err);
                Ok(self.recover().await)
            }
            Received::Transport(fatal) => {
                error!("client: recv failed: {}", fatal);
                Err(fatal.into())
            }
        }
    }

    /// Flips the indicator down, reconnects, flips it back up. False once stopped.
    async fn recover(&mut self) -> bool {
        self.online.send_replace(false);
        if self.cancel.is_cancelled() {
            return false;
        }
        info!("client: lost {}, reconnecting", self.connection.target());
        self.show(UiEvent::Online(false)).await;
        match self.connection.reconnect(&self.cancel).await {
            SessionState::Connected => {
                self.online.send_replace(true);
                self.show(UiEvent::Online(true)).await;
                true
            }
            SessionState::Reconnecting | SessionState::Stopped => false,
        }
    }

    /// Says goodbye when still online, then closes the socket.
    async fn quit(&mut self) {
        if self.connection.is_online() {
            match self.builder.signal(Kind::Exit) {
                Ok(exit) => {
                    if let Err(err) = self.connection.send(&exit).await {
                        debug!("client: couldn't send exit: {}", err);
                    }
                }
                Err(violation) => debug!("client: couldn't seal exit: {}", violation),
            }
        }
        self.connection.close().await;
        self.online.send_replace(false);
    }

    async fn show(&self, event: UiEvent) {
        // The renderer only goes away during shutdown.
        let _ = self.ui.send(event).await;
    }
}

/// Reads commands until quit, end of input, or cancellation. Quitting fires `cancel`. Chat typed
/// while the session is offline is refused on the spot.
async fn talk<I>(
    input: I,
    outbox: mpsc::Sender<Outbound>,
    ui: mpsc::Sender<UiEvent>,
    online: watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> Result<(), ClientError>
where
    I: AsyncRead + Unpin,
{
    let mut commands = FramedRead::new(input, TerminalCodec::new());
    loop {
        let next = tokio::select! {
            next = commands.next() => next,
            _ = cancel.cancelled() => return Ok(()),
        };
        let outbound = match next {
            None | Some(Ok(Command::Quit)) => {
                cancel.cancel();
                return Ok(());
            }
            Some(Ok(Command::Say(text))) => Outbound::Say(text),
            Some(Ok(Command::Whisper { to, text })) => Outbound::Whisper { to, text },
            Some(Ok(Command::Help)) => {
                let _ = ui.send(UiEvent::Notice(HELP.to_string())).await;
                continue;
            }
            Some(Ok(Command::Invalid(reason))) => {
                let _ = ui.send(UiEvent::Notice(reason)).await;
                continue;
            }
            Some(Err(err)) => {
                cancel.cancel();
                return Err(ClientError::Terminal(err));
            }
        };
        if !*online.borrow() {
            let _ = ui.send(UiEvent::Notice(OFFLINE.to_string())).await;
            continue;
        }
        tokio::select! {
            sent = outbox.send(outbound) => if sent.is_err() {
                return Ok(());
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// Joins the server at `config.target` and chats over `input`/`output` until the user quits.
pub async fn run<I, O>(config: ClientConfig, input: I, output: O) -> Result<(), ClientError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + Send + 'static,
{
    run_with(config, ReconnectPolicy::default(), input, output).await
}

pub async fn run_with<I, O>(
    config: ClientConfig,
    policy: ReconnectPolicy,
    input: I,
    output: O,
) -> Result<(), ClientError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let connection = Connection::open(config.target, config.max_resyncs, policy)
        .await
        .map_err(|source| ClientError::Connect {
            target: config.target,
            source,
        })?;
    info!("client: {} joined {}", config.username, config.target);

    let cancel = CancellationToken::new();
    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
    let (ui_tx, ui_rx) = mpsc::channel(UI_DEPTH);

    let renderer = tokio::spawn(terminal::render(ui_rx, config.username.clone(), output));
    let session = Session::new(
        connection,
        PacketBuilder::new(&config.username),
        outbox_rx,
        ui_tx.clone(),
        cancel.clone(),
    );
    let online = session.online();
    let listener = tokio::spawn(session.run());

    let talked = talk(input, outbox_tx, ui_tx, online, &cancel).await;
    cancel.cancel();

    let session_result = listener.await?;
    if let Err(err) = renderer.await? {
        warn!("client: output failed: {}", err);
    }
    talked?;
    session_result
}
