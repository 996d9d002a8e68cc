use std::{
    fmt::Display,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};
use tokio::sync::mpsc;

use crate::{torrent::InfoHash, wire::BlockInfo};

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Client prefix followed by random characters, in the Azureus style.
    pub fn gen() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-SC0100-");

        let mut rng = rand::thread_rng();
        for b in id[8..].iter_mut() {
            *b = rng.sample(Alphanumeric);
        }

        PeerId(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        <[u8; 20]>::try_from(value)
            .map(PeerId)
            .map_err(|_| "a peer id has 20 bytes")
    }
}

/// Commands sent to a [`super::Peer`] by the Swarm.
#[derive(Debug)]
pub enum PeerMsg {
    /// We verified this piece, announce it if the peer lacks it.
    HavePiece(usize),
    /// Another peer delivered this block first.
    CancelBlock(BlockInfo),
    /// Stop requesting and serving, give back every outstanding request.
    Pause,
    Resume,
    /// We have every piece, only upload from now on.
    SeedOnly,
    /// Too many corrupted pieces, close the connection.
    Strikeout,
    Quit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer reached our listener.
    Inbound,
}

/// Data about a connected peer that other tasks may read.
#[derive(Debug)]
pub struct PeerCtx {
    pub direction: Direction,
    pub id: PeerId,
    pub info_hash: InfoHash,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub tx: mpsc::UnboundedSender<PeerMsg>,

    /// We don't serve the requests of the peer.
    pub am_choking: AtomicBool,
    /// The peer has a piece we still need.
    pub am_interested: AtomicBool,
    /// The peer doesn't serve our requests.
    pub peer_choking: AtomicBool,
    pub peer_interested: AtomicBool,
}

impl PeerCtx {
    /// Both sides start choked and not interested.
    pub fn new(
        direction: Direction,
        id: PeerId,
        info_hash: InfoHash,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        tx: mpsc::UnboundedSender<PeerMsg>,
    ) -> Self {
        Self {
            direction,
            id,
            info_hash,
            remote_addr,
            local_addr,
            tx,
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
        }
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Relaxed)
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Relaxed)
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_peer_id() {
        let a = PeerId::gen();
        let b = PeerId::gen();
        assert_ne!(a, b);

        let bytes: [u8; 20] = a.into();
        assert_eq!(&bytes[..8], b"-SC0100-");
        assert!(bytes[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn peer_id_from_vec() {
        assert!(PeerId::try_from(vec![0u8; 20]).is_ok());
        assert!(PeerId::try_from(vec![0u8; 19]).is_err());
    }
}
