//! The Swarm keeps the connections of a torrent: it pulls candidate
//! addresses, spawns peers, and forwards torrent-wide events to them.
mod backoff;

pub use backoff::Backoff;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{stream::BoxStream, Stream, StreamExt};
use hashbrown::{HashMap, HashSet};
use tokio::{
    net::TcpStream,
    select, spawn,
    sync::{mpsc, oneshot},
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::{Error, ErrorKind},
    peer::{Direction, Peer, PeerCtx, PeerId, PeerMsg},
    torrent::TorrentCtx,
    wire::{BlockInfo, Handshake, HandshakeCodec},
};

/// Candidate addresses of peers, usually from a tracker or DHT. The stream
/// may never end.
pub struct PeerSource(BoxStream<'static, SocketAddr>);

impl PeerSource {
    pub fn new(stream: impl Stream<Item = SocketAddr> + Send + 'static) -> Self {
        Self(stream.boxed())
    }

    pub fn from_addrs(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        let addrs: Vec<SocketAddr> = addrs.into_iter().collect();
        Self::new(futures::stream::iter(addrs))
    }

    pub fn empty() -> Self {
        Self::new(futures::stream::empty())
    }
}

impl std::fmt::Debug for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerSource")
    }
}

#[derive(Debug)]
pub enum SwarmMsg {
    /// The check finished, start connecting to peers.
    Start { seed_only: bool },
    /// A peer finished the handshake, the recipient gets false if there is
    /// already a connection with this peer id.
    PeerConnected {
        ctx: Arc<PeerCtx>,
        recipient: oneshot::Sender<bool>,
    },
    /// A registered peer closed, `error` is None when it was asked to quit.
    PeerClosed {
        id: PeerId,
        addr: SocketAddr,
        direction: Direction,
        error: Option<Error>,
    },
    /// The connection or the handshake failed, the peer never registered.
    ConnectFailed {
        addr: SocketAddr,
        direction: Direction,
        error: Error,
    },
    PeerBitfield(PeerId, Bitfield),
    PeerHave(PeerId, usize),
    /// We verified a piece, announce it.
    HavePiece(usize),
    /// Endgame, other peers delivered this block.
    CancelBlock {
        block_info: BlockInfo,
        peers: Vec<PeerId>,
    },
    /// The peer sent a corrupted piece, `strikes` is its total.
    Strike { peer_id: PeerId, strikes: u32 },
    /// A remote peer connected to us and sent a handshake for this torrent.
    Inbound {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    Pause,
    Resume,
    SeedOnly,
    Stats(oneshot::Sender<SwarmStats>),
    Quit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub connected: usize,
    pub connecting: usize,
    pub banned: usize,
    pub backoff: usize,
}

pub struct Swarm {
    ctx: Arc<TorrentCtx>,
    rx: mpsc::UnboundedReceiver<SwarmMsg>,
    candidates: PeerSource,
    /// The candidate stream ended.
    exhausted: bool,
    peers: HashMap<PeerId, Arc<PeerCtx>>,
    /// Pieces of each connected peer.
    peer_pieces: HashMap<PeerId, Bitfield>,
    connecting: HashSet<SocketAddr>,
    backoff: HashMap<SocketAddr, Backoff>,
    banned: HashSet<SocketAddr>,
    /// Started and not paused.
    active: bool,
    paused: bool,
    seed_only: bool,
}

impl Swarm {
    pub fn new(
        ctx: Arc<TorrentCtx>,
        rx: mpsc::UnboundedReceiver<SwarmMsg>,
        candidates: PeerSource,
    ) -> Self {
        Self {
            ctx,
            rx,
            candidates,
            exhausted: false,
            peers: HashMap::new(),
            peer_pieces: HashMap::new(),
            connecting: HashSet::new(),
            backoff: HashMap::new(),
            banned: HashSet::new(),
            active: false,
            paused: false,
            seed_only: false,
        }
    }

    fn wants_more(&self) -> bool {
        self.active
            && self.peers.len() + self.connecting.len()
                < self.ctx.config.max_peers
    }

    #[tracing::instrument(name = "swarm", skip_all, fields(info_hash = ?self.ctx.info_hash))]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("swarm started event loop");

        let period = self
            .ctx
            .config
            .reconnect_base()
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut reconnect_interval = interval(period);
        reconnect_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pull = self.wants_more() && !self.exhausted;

            select! {
                biased;
                Some(msg) = self.rx.recv() => {
                    if self.handle_msg(msg) {
                        break;
                    }
                }
                addr = self.candidates.0.next(), if pull => {
                    match addr {
                        Some(addr) => self.candidate(addr),
                        None => {
                            debug!("no more candidates");
                            self.exhausted = true;
                        }
                    }
                }
                _ = reconnect_interval.tick() => {
                    self.reconnect();
                }
            }
        }

        Ok(())
    }

    /// Returns true when the swarm must quit.
    fn handle_msg(&mut self, msg: SwarmMsg) -> bool {
        match msg {
            SwarmMsg::Start { seed_only } => {
                info!("starting, seed only: {seed_only}");
                self.seed_only = seed_only;
                self.active = !self.paused;
            }
            SwarmMsg::PeerConnected { ctx, recipient } => {
                self.connecting.remove(&ctx.remote_addr);

                if self.peers.contains_key(&ctx.id) {
                    debug!("{} duplicate peer {:?}", ctx.remote_addr, ctx.id);
                    let _ = recipient.send(false);
                    return false;
                }

                info!("{} connected {:?}", ctx.remote_addr, ctx.direction);
                self.backoff.remove(&ctx.remote_addr);

                if self.paused {
                    let _ = ctx.tx.send(PeerMsg::Pause);
                }
                if self.seed_only {
                    let _ = ctx.tx.send(PeerMsg::SeedOnly);
                }
                self.peers.insert(ctx.id.clone(), ctx);
                let _ = recipient.send(true);
            }
            SwarmMsg::PeerClosed { id, addr, direction, error } => {
                if self.peers.get(&id).is_some_and(|p| p.remote_addr == addr) {
                    self.peers.remove(&id);
                    self.peer_pieces.remove(&id);
                }
                if let Some(error) = error {
                    self.failed(addr, direction, &error);
                }
            }
            SwarmMsg::ConnectFailed { addr, direction, error } => {
                debug!("{addr} could not connect: {error}");
                self.connecting.remove(&addr);
                self.failed(addr, direction, &error);
            }
            SwarmMsg::PeerBitfield(id, bitfield) => {
                self.peer_pieces.insert(id, bitfield);
            }
            SwarmMsg::PeerHave(id, piece) => {
                let pieces = self.ctx.descriptor.pieces();
                self.peer_pieces
                    .entry(id)
                    .or_insert_with(|| Bitfield::from_piece(pieces))
                    .safe_set(piece);
            }
            SwarmMsg::HavePiece(piece) => {
                for (id, peer) in &self.peers {
                    let has = self
                        .peer_pieces
                        .get(id)
                        .is_some_and(|b| b.safe_get(piece));
                    if !has {
                        let _ = peer.tx.send(PeerMsg::HavePiece(piece));
                    }
                }
            }
            SwarmMsg::CancelBlock { block_info, peers } => {
                for id in peers {
                    if let Some(peer) = self.peers.get(&id) {
                        let _ = peer.tx.send(PeerMsg::CancelBlock(block_info.clone()));
                    }
                }
            }
            SwarmMsg::Strike { peer_id, strikes } => {
                if strikes < self.ctx.config.strike_threshold {
                    debug!("{peer_id:?} has {strikes} strikes");
                    return false;
                }
                if let Some(peer) = self.peers.get(&peer_id) {
                    warn!("{} struck out, banning", peer.remote_addr);
                    self.banned.insert(peer.remote_addr);
                    let _ = peer.tx.send(PeerMsg::Strikeout);
                }
            }
            SwarmMsg::Inbound { socket, handshake } => {
                self.inbound(socket, handshake);
            }
            SwarmMsg::Pause => {
                self.paused = true;
                self.active = false;
                self.broadcast(|| PeerMsg::Pause);
            }
            SwarmMsg::Resume => {
                self.paused = false;
                self.active = true;
                self.broadcast(|| PeerMsg::Resume);
            }
            SwarmMsg::SeedOnly => {
                self.seed_only = true;
                self.broadcast(|| PeerMsg::SeedOnly);
            }
            SwarmMsg::Stats(recipient) => {
                let _ = recipient.send(SwarmStats {
                    connected: self.peers.len(),
                    connecting: self.connecting.len(),
                    banned: self.banned.len(),
                    backoff: self.backoff.len(),
                });
            }
            SwarmMsg::Quit => {
                debug!("swarm quit");
                self.active = false;
                self.broadcast(|| PeerMsg::Quit);
                return true;
            }
        }
        false
    }

    fn broadcast(&self, msg: impl Fn() -> PeerMsg) {
        for peer in self.peers.values() {
            let _ = peer.tx.send(msg());
        }
    }

    /// Ban or retry an address after its connection failed.
    fn failed(&mut self, addr: SocketAddr, direction: Direction, error: &Error) {
        match error.kind() {
            ErrorKind::Protocol => {
                if matches!(error, Error::PeerDuplicate(_)) {
                    return;
                }
                info!("{addr} banned: {error}");
                self.banned.insert(addr);
                self.backoff.remove(&addr);
            }
            ErrorKind::Network | ErrorKind::NetworkTimeout
                if direction == Direction::Outbound =>
            {
                let config = &self.ctx.config;
                let backoff = self
                    .backoff
                    .entry(addr)
                    .or_insert_with(|| Backoff::new(Instant::now()));

                if backoff.failed(
                    Instant::now(),
                    config.reconnect_base(),
                    config.reconnect_max(),
                    config.reconnect_attempts,
                ) {
                    debug!("{addr} retry {} scheduled", backoff.attempts);
                } else {
                    info!("{addr} giving up after {} attempts", backoff.attempts);
                    self.backoff.remove(&addr);
                }
            }
            _ => {}
        }
    }

    fn is_known(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(addr)
            || self.connecting.contains(addr)
            || self.backoff.contains_key(addr)
            || self.peers.values().any(|p| p.remote_addr == *addr)
    }

    fn candidate(&mut self, addr: SocketAddr) {
        if self.is_known(&addr) {
            debug!("{addr} skipping candidate");
            return;
        }
        self.connect(addr);
    }

    /// Retry addresses whose backoff elapsed.
    fn reconnect(&mut self) {
        let now = Instant::now();
        let due: Vec<SocketAddr> = self
            .backoff
            .iter()
            .filter(|(addr, b)| b.is_due(now) && !self.connecting.contains(*addr))
            .map(|(addr, _)| *addr)
            .collect();

        for addr in due {
            if !self.wants_more() {
                break;
            }
            debug!("{addr} reconnecting");
            self.connect(addr);
        }
    }

    fn connect(&mut self, addr: SocketAddr) {
        self.connecting.insert(addr);
        let ctx = self.ctx.clone();

        spawn(async move {
            match Peer::connect(addr, ctx.clone()).await {
                Ok(peer) => peer.run().await,
                Err(error) => {
                    let _ = ctx.swarm_tx.send(SwarmMsg::ConnectFailed {
                        addr,
                        direction: Direction::Outbound,
                        error,
                    });
                }
            }
        });
    }

    fn inbound(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    ) {
        let Ok(addr) = socket.get_ref().peer_addr() else { return };

        if self.banned.contains(&addr) {
            debug!("{addr} is banned, dropping inbound");
            return;
        }
        if self.peers.len() >= self.ctx.config.max_peers {
            debug!("{addr} too many peers, dropping inbound");
            return;
        }

        let ctx = self.ctx.clone();
        spawn(async move {
            match Peer::accept(socket, handshake, ctx.clone()).await {
                Ok(peer) => peer.run().await,
                Err(error) => {
                    let _ = ctx.swarm_tx.send(SwarmMsg::ConnectFailed {
                        addr,
                        direction: Direction::Inbound,
                        error,
                    });
                }
            }
        });
    }
}
