use crate::game::ClientGameState;
use crate::input::Bot;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{read_frame, write_frame, ClientMessage, ClientRequest, Hello, WireError};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// One TCP session with the cluster leader.
///
/// Frames are read by a background task so that waiting for the next
/// message can be raced against the bot timer without tearing a frame.
pub struct Connection {
    addr: String,
    writer: OwnedWriteHalf,
    incoming: mpsc::UnboundedReceiver<ClientMessage>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub async fn connect(addr: &str) -> Result<Self, WireError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Hello::Client).await?;

        let (tx, incoming) = mpsc::unbounded_channel();
        let label = addr.to_string();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame::<_, ClientMessage>(&mut reader).await {
                    Ok(Some(message)) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("{} closed the connection", label);
                        break;
                    }
                    Err(e) if e.is_recoverable() => warn!("Skipping frame from {}: {}", label, e),
                    Err(e) => {
                        warn!("Read from {} failed: {}", label, e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr: addr.to_string(),
            writer,
            incoming,
            reader,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Next message from the server, or `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.incoming.recv().await
    }

    pub async fn send(&mut self, request: &ClientRequest) -> Result<(), WireError> {
        write_frame(&mut self.writer, request).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client addresses of every cluster node, tried in order.
    pub servers: Vec<String>,
    pub bot: bool,
    pub actions_per_second: f64,
    pub reconnect_delay: Duration,
    /// Log an ASCII view of the arena on every n-th clock sync. Zero disables it.
    pub render_every: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:8001".to_string()],
            bot: false,
            actions_per_second: 2.0,
            reconnect_delay: Duration::from_millis(500),
            render_every: 1,
        }
    }
}

/// Headless game client that follows whichever node is leading.
pub struct Client {
    config: ClientConfig,
    game_state: ClientGameState,
    bot: Option<Bot<StdRng>>,
    clock_syncs: u32,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let bot = config.bot.then(|| Bot::new(StdRng::from_entropy()));
        Self {
            config,
            game_state: ClientGameState::new(),
            bot,
            clock_syncs: 0,
        }
    }

    pub fn game_state(&self) -> &ClientGameState {
        &self.game_state
    }

    /// Tries every configured server once, returning the first that accepts.
    /// Only the leader listens for clients, so this finds it after a failover.
    pub async fn connect_any(&self) -> Option<Connection> {
        for addr in &self.config.servers {
            match Connection::connect(addr).await {
                Ok(connection) => {
                    info!("Connected to {}", addr);
                    return Some(connection);
                }
                Err(e) => debug!("{} unavailable: {}", addr, e),
            }
        }
        None
    }

    /// Plays until the process is stopped, reconnecting whenever the
    /// leader goes away.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.config.servers.is_empty() {
            return Err("no servers configured".into());
        }

        loop {
            match self.connect_any().await {
                Some(mut connection) => {
                    if let Err(e) = self.play(&mut connection).await {
                        error!("Session with {} failed: {}", connection.addr(), e);
                    }
                    info!("Lost {}, looking for the new leader", connection.addr());
                    self.game_state.reset();
                }
                None => warn!("No server reachable, retrying"),
            }
            sleep(self.config.reconnect_delay).await;
        }
    }

    /// Runs one session. Returns `Ok` when the server closes the link.
    pub async fn play(&mut self, connection: &mut Connection) -> Result<(), WireError> {
        let period = Duration::from_secs_f64(1.0 / self.config.actions_per_second.max(0.01));
        let mut actions = interval(period);
        actions.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = connection.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => return Ok(()),
                },
                _ = actions.tick(), if self.bot.is_some() => {
                    if let Some(request) = self.next_action() {
                        debug!("Bot sends {:?}", request);
                        connection.send(&request).await?;
                    }
                }
            }
        }
    }

    fn next_action(&mut self) -> Option<ClientRequest> {
        let player = self.game_state.local_player_id()?;
        let state = self.game_state.state()?;
        self.bot.as_mut()?.next_request(state, player)
    }

    fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Init {
                snapshot,
                local_player,
            } => {
                match local_player {
                    Some(player) => info!("Playing as {} from tick {}", player, snapshot.tick),
                    None => info!("Spectating from tick {}", snapshot.tick),
                }
                self.game_state.apply_init(snapshot, local_player);
            }
            ClientMessage::Update { tick, data } => {
                let rejected = self.game_state.apply_update(tick, &data);
                if rejected > 0 {
                    warn!("Tick {}: {} events did not apply locally", tick, rejected);
                }
            }
            ClientMessage::Clock {
                server_tick,
                timestamp,
            } => {
                self.game_state.apply_clock(server_tick, timestamp);
                self.clock_syncs += 1;
                self.render();
            }
        }
    }

    fn render(&self) {
        let every = self.config.render_every;
        if every == 0 || self.clock_syncs % every != 0 {
            return;
        }
        if let Some(state) = self.game_state.state() {
            debug!(
                "Tick {} (offset {:?} ms)\n{}",
                self.game_state.tick(),
                self.game_state.clock_offset_ms(),
                state.render()
            );
        }
    }
}
