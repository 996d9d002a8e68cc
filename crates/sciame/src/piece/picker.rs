//! Bookkeeping of pieces and blocks, without any IO.
use hashbrown::{HashMap, HashSet};
use sha1_smol::Sha1;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    descriptor::TorrentDescriptor,
    peer::PeerId,
    wire::{Block, BlockInfo, BLOCK_LEN},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PieceStatus {
    #[default]
    Missing,
    InProgress,
    Verified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum BlockState {
    Missing,
    /// Outstanding on these peers, more than one only in endgame.
    Requested(Vec<PeerId>),
    Received,
}

#[derive(Debug)]
struct Piece {
    hash: [u8; 20],
    status: PieceStatus,
    infos: Vec<BlockInfo>,
    blocks: Vec<BlockState>,
    data: Vec<Option<Vec<u8>>>,
    contributors: HashSet<PeerId>,
}

impl Piece {
    fn reset(&mut self) {
        self.status = PieceStatus::Missing;
        self.blocks.iter_mut().for_each(|b| *b = BlockState::Missing);
        self.data.iter_mut().for_each(|d| *d = None);
        self.contributors.clear();
    }

    fn is_requestable(
        &self,
        slot: usize,
        peer: Option<&PeerId>,
        endgame: bool,
    ) -> bool {
        match &self.blocks[slot] {
            BlockState::Missing => true,
            BlockState::Requested(peers) if endgame => {
                peer.map(|p| !peers.contains(p)).unwrap_or(true)
            }
            _ => false,
        }
    }

    fn has_requestable(&self, peer: Option<&PeerId>, endgame: bool) -> bool {
        self.status != PieceStatus::Verified
            && (0..self.blocks.len())
                .any(|slot| self.is_requestable(slot, peer, endgame))
    }

    /// Slot of a block of this piece, if the block has a valid offset and
    /// length.
    fn slot(&self, begin: u32, len: usize) -> Option<usize> {
        if begin % BLOCK_LEN != 0 {
            return None;
        }
        let slot = (begin / BLOCK_LEN) as usize;
        let info = self.infos.get(slot)?;
        (info.len as usize == len).then_some(slot)
    }

    fn is_idle(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockState::Missing)
    }
}

/// What happened to a block given to [`Picker::block_received`].
#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    /// Not part of an in-progress piece, invalid, or a duplicate.
    Ignored,
    /// Stored, the piece still has missing blocks. `cancel` has the other
    /// peers that were asked for the same block in endgame.
    Stored { cancel: Vec<PeerId> },
    /// The last block of the piece arrived and the hash matches.
    Verified { index: usize, blocks: Vec<Block>, cancel: Vec<PeerId> },
    /// The last block of the piece arrived but the hash doesn't match, the
    /// piece is missing again and `peers` got a strike.
    Corrupted { index: usize, peers: Vec<PeerId> },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PieceStats {
    pub verified: usize,
    pub in_progress: Vec<usize>,
    pub missing: usize,
    pub verified_bytes: u64,
    pub outstanding_requests: usize,
    pub endgame: bool,
    /// Verified pieces.
    pub bitfield: Bitfield,
}

/// Owns the status of every piece and block of a torrent.
#[derive(Debug)]
pub struct Picker {
    pieces: Vec<Piece>,
    /// How many connected peers have each piece.
    availability: Vec<u32>,
    strikes: HashMap<PeerId, u32>,
    strike_threshold: u32,
    endgame_threshold: usize,
    verified_bytes: u64,
    verified_count: usize,
}

impl Picker {
    pub fn new(
        descriptor: &TorrentDescriptor,
        endgame_threshold: usize,
        strike_threshold: u32,
    ) -> Self {
        let pieces = (0..descriptor.pieces())
            .map(|index| {
                let infos = descriptor.block_infos(index);
                Piece {
                    hash: descriptor.piece_hashes[index],
                    status: PieceStatus::Missing,
                    blocks: vec![BlockState::Missing; infos.len()],
                    data: vec![None; infos.len()],
                    infos,
                    contributors: HashSet::new(),
                }
            })
            .collect();

        Self {
            pieces,
            availability: vec![0; descriptor.pieces()],
            strikes: HashMap::new(),
            strike_threshold,
            endgame_threshold,
            verified_bytes: 0,
            verified_count: 0,
        }
    }

    pub fn pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn status(&self, index: usize) -> Option<PieceStatus> {
        self.pieces.get(index).map(|p| p.status)
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count == self.pieces.len()
    }

    pub fn in_endgame(&self) -> bool {
        let remaining = self.pieces.len() - self.verified_count;
        remaining > 0 && remaining < self.endgame_threshold
    }

    /// Bitfield of the verified pieces.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::from_piece(self.pieces.len());
        for (i, piece) in self.pieces.iter().enumerate() {
            if piece.status == PieceStatus::Verified {
                bitfield.safe_set(i);
            }
        }
        bitfield
    }

    /// True if the peer has a piece that is not verified.
    pub fn is_interesting(&self, bitfield: &Bitfield) -> bool {
        self.pieces.iter().enumerate().any(|(i, p)| {
            p.status != PieceStatus::Verified && bitfield.safe_get(i)
        })
    }

    /// The rarest piece the peer has that still has a block to request,
    /// ties are broken by the lowest index.
    pub fn select_next_piece(&self, bitfield: &Bitfield) -> Option<usize> {
        self.select_for(bitfield, None)
    }

    fn select_for(
        &self,
        bitfield: &Bitfield,
        peer: Option<&PeerId>,
    ) -> Option<usize> {
        let endgame = self.in_endgame();

        self.pieces
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                bitfield.safe_get(*i) && p.has_requestable(peer, endgame)
            })
            .min_by_key(|(i, _)| (self.availability[*i], *i))
            .map(|(i, _)| i)
    }

    /// Up to `qnt` blocks for `peer` to request, marked as requested by it.
    pub fn pick_blocks(
        &mut self,
        peer: &PeerId,
        bitfield: &Bitfield,
        qnt: usize,
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::new();
        if self.is_struck_out(peer) {
            return picked;
        }
        let endgame = self.in_endgame();

        while picked.len() < qnt {
            let Some(index) = self.select_for(bitfield, Some(peer)) else {
                break;
            };
            let piece = &mut self.pieces[index];

            // missing blocks first, then the ones other peers have in
            // endgame.
            let mut slots: Vec<usize> = (0..piece.blocks.len())
                .filter(|s| piece.blocks[*s] == BlockState::Missing)
                .collect();
            if endgame {
                slots.extend((0..piece.blocks.len()).filter(|s| {
                    matches!(piece.blocks[*s], BlockState::Requested(_))
                        && piece.is_requestable(*s, Some(peer), true)
                }));
            }

            for slot in slots.into_iter().take(qnt - picked.len()) {
                match &mut piece.blocks[slot] {
                    BlockState::Requested(peers) => peers.push(peer.clone()),
                    b => *b = BlockState::Requested(vec![peer.clone()]),
                }
                picked.push(piece.infos[slot].clone());
            }
            piece.status = PieceStatus::InProgress;
        }

        picked
    }

    pub fn block_received(&mut self, peer: &PeerId, block: Block) -> BlockOutcome {
        let Some(piece) = self.pieces.get_mut(block.index) else {
            return BlockOutcome::Ignored;
        };
        if piece.status != PieceStatus::InProgress {
            return BlockOutcome::Ignored;
        }
        let Some(slot) = piece.slot(block.begin, block.block.len()) else {
            return BlockOutcome::Ignored;
        };

        let cancel = match std::mem::replace(
            &mut piece.blocks[slot],
            BlockState::Received,
        ) {
            BlockState::Received => return BlockOutcome::Ignored,
            BlockState::Missing => Vec::new(),
            BlockState::Requested(peers) => {
                peers.into_iter().filter(|p| p != peer).collect()
            }
        };
        piece.data[slot] = Some(block.block);
        piece.contributors.insert(peer.clone());

        if piece.data.iter().any(|d| d.is_none()) {
            return BlockOutcome::Stored { cancel };
        }

        let index = block.index;
        let mut hasher = Sha1::new();
        for data in piece.data.iter().flatten() {
            hasher.update(data);
        }

        if hasher.digest().bytes() == piece.hash {
            let blocks: Vec<Block> = piece
                .infos
                .iter()
                .zip(piece.data.iter_mut())
                .filter_map(|(info, data)| {
                    Some(Block {
                        index,
                        begin: info.begin,
                        block: data.take()?,
                    })
                })
                .collect();

            piece.status = PieceStatus::Verified;
            piece.contributors.clear();
            self.verified_bytes += blocks.iter().map(|b| b.block.len() as u64).sum::<u64>();
            self.verified_count += 1;

            BlockOutcome::Verified { index, blocks, cancel }
        } else {
            let mut peers: Vec<PeerId> = piece.contributors.drain().collect();
            peers.sort_by_key(|p| <[u8; 20]>::from(p.clone()));
            piece.reset();

            for p in &peers {
                *self.strikes.entry(p.clone()).or_default() += 1;
            }

            BlockOutcome::Corrupted { index, peers }
        }
    }

    /// Release requests of `peer` that it will not answer. The pieces keep
    /// their status.
    pub fn return_blocks(&mut self, peer: &PeerId, blocks: &[BlockInfo]) {
        for info in blocks {
            let Some(piece) = self.pieces.get_mut(info.index as usize) else {
                continue;
            };
            let Some(slot) = piece.slot(info.begin, info.len as usize) else {
                continue;
            };
            if let BlockState::Requested(peers) = &mut piece.blocks[slot] {
                peers.retain(|p| p != peer);
                if peers.is_empty() {
                    piece.blocks[slot] = BlockState::Missing;
                }
            }
        }
    }

    /// Release every request of a peer that disconnected. A piece goes back
    /// to missing only if this peer was working on it and nothing of it is
    /// left.
    pub fn peer_gone(&mut self, peer: &PeerId) {
        for piece in &mut self.pieces {
            if piece.status != PieceStatus::InProgress {
                continue;
            }
            let mut touched = piece.contributors.contains(peer);
            for b in piece.blocks.iter_mut() {
                if let BlockState::Requested(peers) = b {
                    let before = peers.len();
                    peers.retain(|p| p != peer);
                    touched |= peers.len() != before;
                    if peers.is_empty() {
                        *b = BlockState::Missing;
                    }
                }
            }
            if touched && piece.is_idle() {
                piece.reset();
            }
        }
    }

    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_ones() {
            if let Some(a) = self.availability.get_mut(i) {
                *a += 1;
            }
        }
    }

    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_ones() {
            if let Some(a) = self.availability.get_mut(i) {
                *a = a.saturating_sub(1);
            }
        }
    }

    pub fn add_have(&mut self, index: usize) {
        if let Some(a) = self.availability.get_mut(index) {
            *a += 1;
        }
    }

    pub fn availability(&self, index: usize) -> u32 {
        self.availability.get(index).copied().unwrap_or(0)
    }

    pub fn strikes(&self, peer: &PeerId) -> u32 {
        self.strikes.get(peer).copied().unwrap_or(0)
    }

    pub fn is_struck_out(&self, peer: &PeerId) -> bool {
        self.strikes(peer) >= self.strike_threshold
    }

    /// Verify data that was already in storage. Returns true if the piece
    /// is verified.
    pub fn check_piece(&mut self, index: usize, data: &[u8]) -> bool {
        let Some(piece) = self.pieces.get_mut(index) else { return false };
        if piece.status == PieceStatus::Verified {
            return true;
        }
        if piece.status != PieceStatus::Missing {
            return false;
        }
        if Sha1::from(data).digest().bytes() != piece.hash {
            return false;
        }

        piece.status = PieceStatus::Verified;
        self.verified_bytes += data.len() as u64;
        self.verified_count += 1;
        true
    }

    pub fn outstanding_requests(&self) -> usize {
        self.pieces
            .iter()
            .flat_map(|p| p.blocks.iter())
            .map(|b| match b {
                BlockState::Requested(peers) => peers.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn stats(&self) -> PieceStats {
        let in_progress: Vec<usize> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.status == PieceStatus::InProgress)
            .map(|(i, _)| i)
            .collect();

        PieceStats {
            verified: self.verified_count,
            missing: self.pieces.len() - self.verified_count - in_progress.len(),
            in_progress,
            verified_bytes: self.verified_bytes,
            outstanding_requests: self.outstanding_requests(),
            endgame: self.in_endgame(),
            bitfield: self.bitfield(),
        }
    }
}
