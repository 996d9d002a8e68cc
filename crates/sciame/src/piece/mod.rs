//! The PieceManager is the only owner of piece status, peers ask it for
//! blocks to request and hand it the blocks they receive.
mod picker;

pub use picker::*;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    bitfield::Bitfield,
    error::Error,
    peer::PeerId,
    storage::Storage,
    swarm::SwarmMsg,
    torrent::{TorrentCtx, TorrentMsg},
    wire::{Block, BlockInfo},
};

/// Changes in the pieces that connected peers have.
#[derive(Debug)]
pub enum Availability {
    /// A peer connected and sent its bitfield.
    Bitfield(Bitfield),
    /// A peer announced one new piece.
    Have(usize),
    /// A peer with this bitfield disconnected.
    Gone(Bitfield),
}

#[derive(Debug)]
pub enum PieceMsg {
    /// Validate the data that is already in storage.
    Check,
    /// Blocks the peer should request, taken from the pieces it has.
    RequestBlocks {
        peer_id: PeerId,
        pieces: Bitfield,
        qnt: usize,
        recipient: oneshot::Sender<Vec<BlockInfo>>,
    },
    /// A block received from a peer.
    WriteBlock { peer_id: PeerId, block: Block },
    /// The peer won't answer these requests, because of a choke, pause or
    /// timeout.
    ReturnBlocks { peer_id: PeerId, blocks: Vec<BlockInfo> },
    /// The peer disconnected.
    PeerGone(PeerId),
    Availability(Availability),
    /// Read a block of a verified piece to upload it.
    ReadBlock {
        block_info: BlockInfo,
        recipient: oneshot::Sender<Option<Block>>,
    },
    IsInteresting {
        pieces: Bitfield,
        recipient: oneshot::Sender<bool>,
    },
    /// Bitfield of the verified pieces.
    ReadBitfield(oneshot::Sender<Bitfield>),
    Stats(oneshot::Sender<PieceStats>),
    Quit,
}

pub struct PieceManager {
    ctx: Arc<TorrentCtx>,
    storage: Arc<dyn Storage>,
    picker: Picker,
    rx: mpsc::Receiver<PieceMsg>,
}

impl PieceManager {
    pub fn new(
        ctx: Arc<TorrentCtx>,
        storage: Arc<dyn Storage>,
        rx: mpsc::Receiver<PieceMsg>,
    ) -> Self {
        let picker = Picker::new(
            &ctx.descriptor,
            ctx.config.endgame_threshold,
            ctx.config.strike_threshold,
        );
        Self { ctx, storage, picker, rx }
    }

    #[tracing::instrument(name = "piece_manager", skip_all, fields(info_hash = ?self.ctx.info_hash))]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("piece manager started event loop");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                PieceMsg::Check => {
                    self.check().await?;
                }
                PieceMsg::RequestBlocks { peer_id, pieces, qnt, recipient } => {
                    let blocks = self.picker.pick_blocks(&peer_id, &pieces, qnt);
                    let _ = recipient.send(blocks);
                }
                PieceMsg::WriteBlock { peer_id, block } => {
                    self.block_received(peer_id, block).await?;
                }
                PieceMsg::ReturnBlocks { peer_id, blocks } => {
                    debug!("{peer_id:?} returned {} blocks", blocks.len());
                    self.picker.return_blocks(&peer_id, &blocks);
                }
                PieceMsg::PeerGone(peer_id) => {
                    self.picker.peer_gone(&peer_id);
                }
                PieceMsg::Availability(a) => match a {
                    Availability::Bitfield(b) => self.picker.add_bitfield(&b),
                    Availability::Have(piece) => self.picker.add_have(piece),
                    Availability::Gone(b) => self.picker.remove_bitfield(&b),
                },
                PieceMsg::ReadBlock { block_info, recipient } => {
                    let block = self.read_block(block_info).await?;
                    let _ = recipient.send(block);
                }
                PieceMsg::IsInteresting { pieces, recipient } => {
                    let _ = recipient.send(self.picker.is_interesting(&pieces));
                }
                PieceMsg::ReadBitfield(recipient) => {
                    let _ = recipient.send(self.picker.bitfield());
                }
                PieceMsg::Stats(recipient) => {
                    let _ = recipient.send(self.picker.stats());
                }
                PieceMsg::Quit => {
                    debug!("piece manager quit");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Hash every piece that is already in storage.
    async fn check(&mut self) -> Result<(), Error> {
        let descriptor = &self.ctx.descriptor;

        'pieces: for index in 0..descriptor.pieces() {
            let mut data = Vec::with_capacity(descriptor.piece_size(index) as usize);

            for info in descriptor.block_infos(index) {
                match self.storage.read_block(index, info.begin, info.len).await {
                    Ok(block) => data.extend_from_slice(&block),
                    Err(Error::BlockUnavailable { .. }) => continue 'pieces,
                    Err(e) => {
                        warn!("storage failed while checking: {e}");
                        self.ctx.tx.send(TorrentMsg::StorageFailure(e))?;
                        return Ok(());
                    }
                }
            }

            if !self.picker.check_piece(index, &data) {
                debug!("piece {index} in storage is not valid");
            }
        }

        let stats = self.picker.stats();
        info!(
            "check finished, {} of {} pieces verified",
            stats.verified,
            self.picker.pieces()
        );

        self.ctx.tx.send(TorrentMsg::CheckFinished {
            complete: self.picker.is_complete(),
        })?;

        Ok(())
    }

    async fn block_received(
        &mut self,
        peer_id: PeerId,
        block: Block,
    ) -> Result<(), Error> {
        let len = block.block.len() as u64;
        let info = BlockInfo::from(&block);

        match self.picker.block_received(&peer_id, block) {
            BlockOutcome::Ignored => {
                debug!("{peer_id:?} ignored block {info:?}");
            }
            BlockOutcome::Stored { cancel } => {
                self.ctx.tx.send(TorrentMsg::Downloaded(len))?;
                self.cancel(info, cancel);
            }
            BlockOutcome::Verified { index, blocks, cancel } => {
                self.ctx.tx.send(TorrentMsg::Downloaded(len))?;
                self.cancel(info, cancel);

                for block in blocks {
                    if let Err(e) = self
                        .storage
                        .write_block(block.index, block.begin, block.block)
                        .await
                    {
                        warn!("could not write piece {index}: {e}");
                        self.ctx.tx.send(TorrentMsg::StorageFailure(e))?;
                        return Ok(());
                    }
                }

                debug!("piece {index} verified");
                self.ctx.tx.send(TorrentMsg::PieceVerified(index))?;

                if self.picker.is_complete() {
                    info!("all pieces verified");
                    self.ctx.tx.send(TorrentMsg::DownloadComplete)?;
                }
            }
            BlockOutcome::Corrupted { index, peers } => {
                self.ctx.tx.send(TorrentMsg::Downloaded(len))?;
                warn!("piece {index} has an invalid hash, sent by {peers:?}");

                // the swarm is gone once the torrent completed
                for peer_id in &peers {
                    let strikes = self.picker.strikes(peer_id);
                    let _ = self.ctx.swarm_tx.send(SwarmMsg::Strike {
                        peer_id: peer_id.clone(),
                        strikes,
                    });
                }
                self.ctx
                    .tx
                    .send(TorrentMsg::HashMismatch { piece: index, peers })?;
            }
        }

        Ok(())
    }

    /// Endgame requests of the same block made to other peers.
    fn cancel(&self, block_info: BlockInfo, peers: Vec<PeerId>) {
        if !peers.is_empty() {
            let _ = self.ctx.swarm_tx.send(SwarmMsg::CancelBlock { block_info, peers });
        }
    }

    async fn read_block(
        &mut self,
        block_info: BlockInfo,
    ) -> Result<Option<Block>, Error> {
        let index = block_info.index as usize;
        if self.picker.status(index) != Some(PieceStatus::Verified) {
            return Ok(None);
        }

        match self
            .storage
            .read_block(index, block_info.begin, block_info.len)
            .await
        {
            Ok(block) => {
                self.ctx.tx.send(TorrentMsg::Uploaded(block.len() as u64))?;
                Ok(Some(Block { index, begin: block_info.begin, block }))
            }
            Err(Error::BlockUnavailable { .. }) => Ok(None),
            Err(e) => {
                warn!("could not read block {block_info:?}: {e}");
                self.ctx.tx.send(TorrentMsg::StorageFailure(e))?;
                Ok(None)
            }
        }
    }
}
