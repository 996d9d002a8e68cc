//! A remote peer in the network that downloads and uploads data
mod handshake;
mod request_manager;
pub mod session;
mod types;

// re-exports
pub use request_manager::RequestManager;
pub use types::*;

use std::{
    collections::VecDeque,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::{interval, interval_at, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    piece::{Availability, PieceMsg},
    swarm::SwarmMsg,
    torrent::TorrentCtx,
    wire::{BlockInfo, Message, MessageCodec},
};

use session::{ConnectionState, Session};

/// How often a peer tries to fill its request pipeline.
const REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// A connection with a remote peer, after the handshake.
pub struct Peer {
    pub ctx: Arc<PeerCtx>,
    torrent_ctx: Arc<TorrentCtx>,
    session: Session,
    sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    stream: SplitStream<Framed<TcpStream, MessageCodec>>,
    rx: mpsc::UnboundedReceiver<PeerMsg>,
    /// Pieces of the remote peer.
    pieces: Bitfield,
    /// Requests we sent and are waiting for.
    outgoing: RequestManager<BlockInfo>,
    /// Requests the peer sent us, in order.
    incoming: VecDeque<BlockInfo>,
}

impl Peer {
    pub(crate) fn new(
        socket: Framed<TcpStream, MessageCodec>,
        direction: Direction,
        id: PeerId,
        torrent_ctx: Arc<TorrentCtx>,
    ) -> Result<Self, Error> {
        let local_addr = socket.get_ref().local_addr()?;
        let remote_addr = socket.get_ref().peer_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(PeerCtx::new(
            direction,
            id,
            torrent_ctx.info_hash.clone(),
            remote_addr,
            local_addr,
            tx,
        ));

        let (sink, stream) = socket.split();
        let mut session = Session::new(torrent_ctx.config.pipeline_depth);
        session.connection = session.connection.advance(ConnectionState::Connected);
        session.connected_time = Some(Instant::now());

        Ok(Self {
            pieces: Bitfield::from_piece(torrent_ctx.descriptor.pieces()),
            ctx,
            torrent_ctx,
            session,
            sink,
            stream,
            rx,
            outgoing: RequestManager::new(),
            incoming: VecDeque::new(),
        })
    }

    /// Run the peer until the connection closes, then release everything it
    /// held and tell the Swarm why it closed.
    #[tracing::instrument(name = "peer", skip_all, fields(remote = %self.ctx.remote_addr))]
    pub async fn run(mut self) {
        let (registered, result) = match self.register().await {
            Ok(true) => (true, self.event_loop().await),
            Ok(false) => (false, Err(Error::PeerDuplicate(self.ctx.id.clone()))),
            Err(e) => (false, Err(e)),
        };

        self.session.connection =
            self.session.connection.advance(ConnectionState::Closing);

        let remote = self.ctx.remote_addr;
        match &result {
            Ok(()) => debug!("{remote} closed"),
            Err(e) => info!("{remote} closed: {e}"),
        }

        let _ = self.close(registered, result.err()).await;
    }

    async fn register(&mut self) -> Result<bool, Error> {
        let (otx, orx) = oneshot::channel();
        self.torrent_ctx.swarm_tx.send(SwarmMsg::PeerConnected {
            ctx: self.ctx.clone(),
            recipient: otx,
        })?;
        Ok(orx.await?)
    }

    async fn close(
        &mut self,
        registered: bool,
        error: Option<Error>,
    ) -> Result<(), Error> {
        let swarm_tx = &self.torrent_ctx.swarm_tx;

        if !registered {
            swarm_tx.send(SwarmMsg::ConnectFailed {
                addr: self.ctx.remote_addr,
                direction: self.ctx.direction,
                error: error.unwrap_or(Error::PeerClosedSocket),
            })?;
            return Ok(());
        }

        let blocks = self.outgoing.drain();
        let piece_tx = &self.torrent_ctx.piece_tx;
        if !blocks.is_empty() {
            piece_tx
                .send(PieceMsg::ReturnBlocks {
                    peer_id: self.ctx.id.clone(),
                    blocks,
                })
                .await?;
        }
        piece_tx.send(PieceMsg::PeerGone(self.ctx.id.clone())).await?;
        if self.pieces.any() {
            piece_tx
                .send(PieceMsg::Availability(Availability::Gone(
                    self.pieces.clone(),
                )))
                .await?;
        }

        swarm_tx.send(SwarmMsg::PeerClosed {
            id: self.ctx.id.clone(),
            addr: self.ctx.remote_addr,
            direction: self.ctx.direction,
            error,
        })?;

        Ok(())
    }

    async fn event_loop(&mut self) -> Result<(), Error> {
        let remote = self.ctx.remote_addr;
        let keep_alive = self.torrent_ctx.config.keep_alive();
        let request_timeout = self.torrent_ctx.config.request_timeout();

        // the bitfield is sent even if we have nothing
        let (otx, orx) = oneshot::channel();
        self.torrent_ctx.piece_tx.send(PieceMsg::ReadBitfield(otx)).await?;
        let bitfield = orx.await?;
        debug!("{remote} sending bitfield");
        self.sink.send(Message::Bitfield(bitfield)).await?;

        let mut request_interval = interval(REQUEST_INTERVAL);
        request_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // checked often enough to notice the deadlines in time.
        let period = (keep_alive.min(request_timeout) / 4)
            .max(Duration::from_millis(10));
        let mut timeout_interval = interval_at(Instant::now() + period, period);
        timeout_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let can_serve = !self.incoming.is_empty()
                && !self.session.paused
                && !self.ctx.am_choking();

            select! {
                biased;
                Some(msg) = self.rx.recv() => {
                    if self.handle_peer_msg(msg).await? {
                        return Ok(());
                    }
                }
                msg = self.stream.next() => {
                    match msg {
                        Some(Ok(msg)) => self.handle_message(msg).await?,
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    }
                }
                _ = timeout_interval.tick() => {
                    self.check_keep_alive(keep_alive).await?;
                    self.check_request_timeout().await?;
                }
                _ = request_interval.tick() => {
                    self.request_blocks().await?;
                }
                _ = std::future::ready(()), if can_serve => {
                    self.serve_request().await?;
                }
            }
        }
    }

    /// Returns true if the peer must quit.
    async fn handle_peer_msg(&mut self, msg: PeerMsg) -> Result<bool, Error> {
        let remote = self.ctx.remote_addr;

        match msg {
            PeerMsg::HavePiece(piece) => {
                // only to peers that don't have it
                if !self.pieces.safe_get(piece) {
                    debug!("{remote} sending have {piece}");
                    self.sink.send(Message::Have(piece)).await?;
                }
                self.update_interest().await?;
            }
            PeerMsg::CancelBlock(block_info) => {
                if self.outgoing.remove_request(&block_info) {
                    debug!("{remote} cancel {block_info:?}");
                    self.sink.send(Message::Cancel(block_info)).await?;
                }
            }
            PeerMsg::Pause => {
                debug!("{remote} pause");
                self.session.paused = true;

                let blocks = self.outgoing.drain();
                for block_info in &blocks {
                    self.sink.send(Message::Cancel(block_info.clone())).await?;
                }
                self.return_blocks(blocks).await?;

                if self.ctx.am_interested() {
                    self.ctx.am_interested.store(false, Ordering::Relaxed);
                    self.sink.send(Message::NotInterested).await?;
                }
                if !self.ctx.am_choking() {
                    self.ctx.am_choking.store(true, Ordering::Relaxed);
                    self.sink.send(Message::Choke).await?;
                }
                self.incoming.clear();
            }
            PeerMsg::Resume => {
                debug!("{remote} resume");
                self.session.paused = false;

                self.update_interest().await?;
                if self.ctx.peer_interested() {
                    self.unchoke().await?;
                }
                self.request_blocks().await?;
            }
            PeerMsg::SeedOnly => {
                debug!("{remote} seed only");
                self.session.seed_only = true;
                self.update_interest().await?;
            }
            PeerMsg::Strikeout => {
                warn!("{remote} struck out");
                return Err(Error::PeerStrikeout);
            }
            PeerMsg::Quit => {
                debug!("{remote} quit");
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn handle_message(&mut self, msg: Message) -> Result<(), Error> {
        let remote = self.ctx.remote_addr;
        self.session.last_inbound = Instant::now();
        self.session.last_keep_alive = None;

        let first = !self.session.received_first_msg
            && !matches!(msg, Message::KeepAlive);
        if first {
            self.session.received_first_msg = true;
        }

        match msg {
            Message::KeepAlive => {
                debug!("{remote} keep alive");
            }
            Message::Bitfield(bitfield) => {
                if !first {
                    return Err(Error::BitfieldUnexpected);
                }
                let pieces = self.torrent_ctx.descriptor.pieces();
                let bitfield = bitfield.from_wire(pieces)?;
                debug!("{remote} bitfield with {} pieces", bitfield.count_ones());

                self.pieces = bitfield.clone();
                self.torrent_ctx
                    .piece_tx
                    .send(PieceMsg::Availability(Availability::Bitfield(
                        bitfield.clone(),
                    )))
                    .await?;
                self.torrent_ctx
                    .swarm_tx
                    .send(SwarmMsg::PeerBitfield(self.ctx.id.clone(), bitfield))?;

                self.update_interest().await?;
            }
            Message::Have(piece) => {
                if piece >= self.torrent_ctx.descriptor.pieces() {
                    return Err(Error::PieceOutOfBounds(piece));
                }
                if self.pieces.safe_get(piece) {
                    return Ok(());
                }
                debug!("{remote} has {piece}");
                self.pieces.safe_set(piece);

                self.torrent_ctx
                    .piece_tx
                    .send(PieceMsg::Availability(Availability::Have(piece)))
                    .await?;
                self.torrent_ctx
                    .swarm_tx
                    .send(SwarmMsg::PeerHave(self.ctx.id.clone(), piece))?;

                self.update_interest().await?;
            }
            Message::Choke => {
                debug!("{remote} choked us");
                self.ctx.peer_choking.store(true, Ordering::Relaxed);

                // the peer discards our requests when choking.
                let blocks = self.outgoing.drain();
                self.return_blocks(blocks).await?;
            }
            Message::Unchoke => {
                debug!("{remote} unchoked us");
                self.ctx.peer_choking.store(false, Ordering::Relaxed);
                self.request_blocks().await?;
            }
            Message::Interested => {
                debug!("{remote} is interested");
                self.ctx.peer_interested.store(true, Ordering::Relaxed);
                if !self.session.paused {
                    self.unchoke().await?;
                }
            }
            Message::NotInterested => {
                debug!("{remote} is not interested");
                self.ctx.peer_interested.store(false, Ordering::Relaxed);
            }
            Message::Request(block_info) => {
                if !self.torrent_ctx.descriptor.is_valid_block(&block_info) {
                    return Err(Error::RequestInvalid(block_info));
                }
                if self.ctx.am_choking() || self.session.paused {
                    debug!("{remote} request while choked {block_info:?}");
                    return Ok(());
                }
                if self.incoming.len() >= self.torrent_ctx.config.max_incoming_requests {
                    warn!("{remote} too many requests, ignoring {block_info:?}");
                    return Ok(());
                }
                if !self.incoming.contains(&block_info) {
                    self.incoming.push_back(block_info);
                }
            }
            Message::Piece(block) => {
                let block_info = BlockInfo::from(&block);

                if !self.outgoing.remove_request(&block_info) {
                    // late answer of a cancelled request, the PieceManager
                    // decides if it is still useful.
                    debug!("{remote} unrequested block {block_info:?}");
                }

                self.session.downloaded += block.block.len() as u64;
                self.torrent_ctx
                    .piece_tx
                    .send(PieceMsg::WriteBlock {
                        peer_id: self.ctx.id.clone(),
                        block,
                    })
                    .await?;

                self.request_blocks().await?;
            }
            Message::Cancel(block_info) => {
                debug!("{remote} cancelled {block_info:?}");
                self.incoming.retain(|b| *b != block_info);
            }
        }

        Ok(())
    }

    async fn unchoke(&mut self) -> Result<(), Error> {
        if self.ctx.am_choking() {
            debug!("{} unchoking", self.ctx.remote_addr);
            self.ctx.am_choking.store(false, Ordering::Relaxed);
            self.sink.send(Message::Unchoke).await?;
        }
        Ok(())
    }

    /// We are interested if the peer has a piece we don't and we still
    /// download.
    async fn update_interest(&mut self) -> Result<(), Error> {
        let interested = if self.session.seed_only || self.session.paused {
            false
        } else {
            let (otx, orx) = oneshot::channel();
            self.torrent_ctx
                .piece_tx
                .send(PieceMsg::IsInteresting {
                    pieces: self.pieces.clone(),
                    recipient: otx,
                })
                .await?;
            orx.await?
        };

        if interested != self.ctx.am_interested() {
            self.ctx.am_interested.store(interested, Ordering::Relaxed);
            let msg = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            debug!("{} sending {msg:?}", self.ctx.remote_addr);
            self.sink.send(msg).await?;
        }

        Ok(())
    }

    fn can_request(&self) -> bool {
        !self.session.paused
            && !self.session.seed_only
            && self.ctx.am_interested()
            && !self.ctx.peer_choking()
            && self.outgoing.len() < self.session.target_request_queue_len
    }

    /// Fill the request pipeline with blocks from the PieceManager.
    async fn request_blocks(&mut self) -> Result<(), Error> {
        if !self.can_request() {
            return Ok(());
        }

        let qnt = self.session.target_request_queue_len - self.outgoing.len();
        let (otx, orx) = oneshot::channel();
        self.torrent_ctx
            .piece_tx
            .send(PieceMsg::RequestBlocks {
                peer_id: self.ctx.id.clone(),
                pieces: self.pieces.clone(),
                qnt,
                recipient: otx,
            })
            .await?;
        let blocks = orx.await?;

        let deadline = Instant::now() + self.torrent_ctx.config.request_timeout();
        for block_info in blocks {
            if self.outgoing.add_request(block_info.clone(), deadline) {
                self.sink.feed(Message::Request(block_info)).await?;
            }
        }
        self.sink.flush().await?;

        Ok(())
    }

    /// Cancel requests that were not answered in time and give them back.
    async fn check_request_timeout(&mut self) -> Result<(), Error> {
        let timed_out = self.outgoing.get_timeout_blocks(Instant::now());
        if timed_out.is_empty() {
            return Ok(());
        }

        debug!(
            "{} {} requests timed out",
            self.ctx.remote_addr,
            timed_out.len()
        );
        self.session.timed_out_request_count += timed_out.len();

        for block_info in &timed_out {
            self.outgoing.remove_request(block_info);
            self.sink.feed(Message::Cancel(block_info.clone())).await?;
        }
        self.sink.flush().await?;

        self.return_blocks(timed_out).await
    }

    /// A quiet peer gets a keep-alive after `keep_alive`, and is dropped
    /// after twice as long.
    async fn check_keep_alive(&mut self, keep_alive: Duration) -> Result<(), Error> {
        let idle = self.session.last_inbound.elapsed();

        if idle >= keep_alive * 2 {
            return Err(Error::MessageTimeout);
        }

        let due = match self.session.last_keep_alive {
            Some(sent) => sent.elapsed() >= keep_alive,
            None => idle >= keep_alive,
        };
        if due {
            debug!("{} sending keep alive", self.ctx.remote_addr);
            self.sink.send(Message::KeepAlive).await?;
            self.session.last_keep_alive = Some(Instant::now());
        }

        Ok(())
    }

    async fn return_blocks(&mut self, blocks: Vec<BlockInfo>) -> Result<(), Error> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.torrent_ctx
            .piece_tx
            .send(PieceMsg::ReturnBlocks {
                peer_id: self.ctx.id.clone(),
                blocks,
            })
            .await?;
        Ok(())
    }

    /// Upload the oldest block the peer asked for.
    async fn serve_request(&mut self) -> Result<(), Error> {
        let Some(block_info) = self.incoming.pop_front() else {
            return Ok(());
        };

        let (otx, orx) = oneshot::channel();
        self.torrent_ctx
            .piece_tx
            .send(PieceMsg::ReadBlock { block_info: block_info.clone(), recipient: otx })
            .await?;

        match orx.await? {
            Some(block) => {
                self.session.uploaded += block.block.len() as u64;
                self.sink.send(Message::Piece(block)).await?;
            }
            None => {
                debug!(
                    "{} requested a block we don't have {block_info:?}",
                    self.ctx.remote_addr
                );
            }
        }

        Ok(())
    }
}
