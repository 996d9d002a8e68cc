//! Torrent that is spawned by the Supervisor
//!
//! A torrent owns one PieceManager and one Swarm, it drives the status of the
//! session and reports it to the Supervisor using [`SupervisorMsg`].

mod types;

// re-exports
pub use types::*;

use std::{sync::Arc, time::Duration};

use tokio::{
    select, spawn,
    sync::{mpsc, oneshot},
    time::interval,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    counter::Counter,
    descriptor::TorrentDescriptor,
    error::Error,
    peer::PeerId,
    piece::{PieceManager, PieceMsg, PieceStats},
    storage::Storage,
    supervisor::SupervisorMsg,
    swarm::{PeerSource, Swarm, SwarmMsg, SwarmStats},
};

/// Capacity of the channel from peers to the PieceManager.
const PIECE_CHANNEL_LEN: usize = 512;

pub struct Torrent {
    pub ctx: Arc<TorrentCtx>,
    pub status: TorrentStatus,
    rx: mpsc::UnboundedReceiver<TorrentMsg>,
    supervisor_tx: mpsc::Sender<SupervisorMsg>,
    counter: Counter,
    /// Taken when the tasks are spawned.
    parts: Option<Parts>,
    /// The last snapshot, answered when the PieceManager or the Swarm are
    /// gone.
    state: TorrentState,
    error: Option<String>,
}

struct Parts {
    storage: Arc<dyn Storage>,
    candidates: PeerSource,
    piece_rx: mpsc::Receiver<PieceMsg>,
    swarm_rx: mpsc::UnboundedReceiver<SwarmMsg>,
}

impl Torrent {
    /// Create a session for `descriptor`, fails if the descriptor is not
    /// valid.
    pub fn new(
        descriptor: TorrentDescriptor,
        storage: Arc<dyn Storage>,
        candidates: PeerSource,
        config: Arc<Config>,
        local_peer_id: PeerId,
        supervisor_tx: mpsc::Sender<SupervisorMsg>,
    ) -> Result<Self, Error> {
        descriptor.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (piece_tx, piece_rx) = mpsc::channel(PIECE_CHANNEL_LEN);
        let (swarm_tx, swarm_rx) = mpsc::unbounded_channel();

        let state = TorrentState {
            name: descriptor.name.clone(),
            info_hash: descriptor.info_hash.clone(),
            size: descriptor.total_length,
            pieces: descriptor.pieces(),
            ..Default::default()
        };

        let ctx = Arc::new(TorrentCtx {
            info_hash: descriptor.info_hash.clone(),
            descriptor,
            config,
            local_peer_id,
            tx,
            piece_tx,
            swarm_tx,
        });

        Ok(Self {
            ctx,
            status: TorrentStatus::default(),
            rx,
            supervisor_tx,
            counter: Counter::new(),
            parts: Some(Parts { storage, candidates, piece_rx, swarm_rx }),
            state,
            error: None,
        })
    }

    /// Spawn the PieceManager and the Swarm, check the local data and run
    /// the event loop until the torrent quits.
    #[tracing::instrument(name = "torrent", skip_all, fields(info_hash = ?self.ctx.info_hash))]
    pub async fn run(&mut self) -> Result<(), Error> {
        let Some(parts) = self.parts.take() else {
            return Ok(());
        };
        info!("starting torrent {}", self.ctx.descriptor.name);

        let mut piece_manager =
            PieceManager::new(self.ctx.clone(), parts.storage, parts.piece_rx);
        spawn(async move {
            if let Err(e) = piece_manager.run().await {
                debug!("piece manager stopped: {e}");
            }
        });

        let mut swarm =
            Swarm::new(self.ctx.clone(), parts.swarm_rx, parts.candidates);
        spawn(async move {
            if let Err(e) = swarm.run().await {
                debug!("swarm stopped: {e}");
            }
        });

        self.ctx.piece_tx.send(PieceMsg::Check).await?;

        let mut tick_interval = interval(Duration::from_secs(1));

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    if self.handle_msg(msg).await? {
                        break;
                    }
                }
                _ = tick_interval.tick() => {
                    self.counter.update_rates();
                    let state = self.state().await;
                    let _ = self
                        .supervisor_tx
                        .send(SupervisorMsg::TorrentState(state))
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Returns true when the torrent must quit.
    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<bool, Error> {
        match msg {
            TorrentMsg::CheckFinished { complete } => {
                let event = if complete {
                    Lifecycle::CheckedComplete
                } else {
                    Lifecycle::CheckedIncomplete
                };
                if let Err(e) = self.transition(event) {
                    warn!("{e}");
                    return Ok(false);
                }
                let _ = self.ctx.swarm_tx.send(SwarmMsg::Start { seed_only: complete });
            }
            TorrentMsg::PieceVerified(piece) => {
                let _ = self.ctx.swarm_tx.send(SwarmMsg::HavePiece(piece));
            }
            TorrentMsg::HashMismatch { piece, peers } => {
                warn!("piece {piece} failed the hash check, sent by {peers:?}");
                // not fatal, subscribers only get an event
                self.supervisor_tx
                    .send(SupervisorMsg::TorrentError(
                        self.ctx.info_hash.clone(),
                        Error::PieceInvalid(piece),
                    ))
                    .await?;
            }
            TorrentMsg::DownloadComplete => {
                info!("download complete");
                if let Err(e) = self.transition(Lifecycle::LastPieceVerified) {
                    warn!("{e}");
                }
            }
            TorrentMsg::StorageFailure(e) => {
                self.fail(e).await?;
            }
            TorrentMsg::Downloaded(bytes) => {
                self.counter.record_download(bytes);
            }
            TorrentMsg::Uploaded(bytes) => {
                self.counter.record_upload(bytes);
            }
            TorrentMsg::Pause(recipient) => {
                let r = self.transition(Lifecycle::Pause);
                let _ = recipient.send(r);
            }
            TorrentMsg::Resume(recipient) => {
                let r = self.transition(Lifecycle::Resume);
                let _ = recipient.send(r);
            }
            TorrentMsg::Stop(recipient) => {
                let r = self.transition(Lifecycle::Stop);
                let _ = recipient.send(r);
            }
            TorrentMsg::GetState(recipient) => {
                let state = self.state().await;
                let _ = recipient.send(state);
            }
            TorrentMsg::Quit => {
                info!("quit");
                self.shutdown().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move to the next status and apply the side effects of the change.
    fn transition(&mut self, event: Lifecycle) -> Result<TorrentStatus, Error> {
        let prev = self.status;
        let next = prev.on(event)?;
        self.status = next;

        if prev == next {
            return Ok(next);
        }
        info!("{prev} -> {next}");

        let swarm_tx = &self.ctx.swarm_tx;
        let paused = |s: TorrentStatus| matches!(s, TorrentStatus::Paused(_));
        let seeding = |s: TorrentStatus| {
            matches!(
                s,
                TorrentStatus::Seeding | TorrentStatus::Paused(ResumeTo::Seeding)
            )
        };

        match next {
            TorrentStatus::Completed => {
                // stop uploading, the PieceManager stays for the stats.
                let _ = swarm_tx.send(SwarmMsg::Quit);
            }
            TorrentStatus::Error => {}
            _ => {
                if !paused(prev) && paused(next) {
                    let _ = swarm_tx.send(SwarmMsg::Pause);
                }
                if paused(prev) && !paused(next) {
                    let _ = swarm_tx.send(SwarmMsg::Resume);
                }
                if !seeding(prev) && seeding(next) {
                    let _ = swarm_tx.send(SwarmMsg::SeedOnly);
                }
            }
        }

        Ok(next)
    }

    /// Storage failures are fatal, stop everything and tell the Supervisor.
    async fn fail(&mut self, error: Error) -> Result<(), Error> {
        if self.transition(Lifecycle::Fail).is_err() {
            debug!("already terminal, ignoring {error}");
            return Ok(());
        }
        warn!("torrent failed: {error}");

        self.shutdown().await;
        self.error = Some(error.to_string());
        self.state.status = self.status;
        self.state.error = self.error.clone();

        self.supervisor_tx
            .send(SupervisorMsg::TorrentError(self.ctx.info_hash.clone(), error))
            .await?;

        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.ctx.swarm_tx.send(SwarmMsg::Quit);
        let _ = self.ctx.piece_tx.send(PieceMsg::Quit).await;
    }

    async fn piece_stats(&mut self) -> Option<PieceStats> {
        let (otx, orx) = oneshot::channel();
        self.ctx.piece_tx.send(PieceMsg::Stats(otx)).await.ok()?;
        orx.await.ok()
    }

    async fn swarm_stats(&mut self) -> Option<SwarmStats> {
        let (otx, orx) = oneshot::channel();
        self.ctx.swarm_tx.send(SwarmMsg::Stats(otx)).ok()?;
        orx.await.ok()
    }

    /// Snapshot of the torrent, with live values when the PieceManager and
    /// the Swarm are running.
    pub async fn state(&mut self) -> TorrentState {
        let state = &mut self.state;
        state.status = self.status;
        state.error = self.error.clone();
        state.uploaded = self.counter.total_uploaded();
        state.download_rate = self.counter.download_rate();
        state.upload_rate = self.counter.upload_rate();

        if self.status == TorrentStatus::Error {
            state.outstanding_requests = 0;
            state.connected_peers = 0;
            state.connecting_peers = 0;
            return state.clone();
        }

        if let Some(stats) = self.piece_stats().await {
            let state = &mut self.state;
            state.downloaded = stats.verified_bytes;
            state.verified_pieces = stats.verified;
            state.bitfield = stats.bitfield;
            state.in_progress = stats.in_progress;
            state.outstanding_requests = stats.outstanding_requests;
            state.endgame = stats.endgame;
        }

        match self.swarm_stats().await {
            Some(stats) => {
                self.state.connected_peers = stats.connected;
                self.state.connecting_peers = stats.connecting;
                self.state.banned_peers = stats.banned;
            }
            None => {
                self.state.connected_peers = 0;
                self.state.connecting_peers = 0;
            }
        }

        self.state.clone()
    }
}
