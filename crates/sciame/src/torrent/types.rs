use std::{fmt::Display, ops::Deref, sync::Arc};

use rand::Rng;
use speedy::{Readable, Writable};
use tokio::sync::{mpsc, oneshot};

use crate::{
    bitfield::Bitfield,
    config::Config,
    descriptor::TorrentDescriptor,
    error::Error,
    peer::PeerId,
    piece::PieceMsg,
    swarm::SwarmMsg,
};

/// Messages used to control the torrent or to report events to it.
#[derive(Debug)]
pub enum TorrentMsg {
    /// The PieceManager finished checking the local data, `complete` is true
    /// when every piece was already verified.
    CheckFinished { complete: bool },

    /// A piece was downloaded and its hash matches, we need to send Have's
    /// to peers that don't have it.
    PieceVerified(usize),

    /// A piece was downloaded but its hash didn't match, the peers are the
    /// ones that sent blocks of it.
    HashMismatch { piece: usize, peers: Vec<PeerId> },

    /// All pieces are verified.
    DownloadComplete,

    /// Reading or writing torrent data failed.
    StorageFailure(Error),

    /// Bytes of blocks received from peers.
    Downloaded(u64),

    /// Bytes of blocks sent to peers.
    Uploaded(u64),

    Pause(oneshot::Sender<Result<TorrentStatus, Error>>),
    Resume(oneshot::Sender<Result<TorrentStatus, Error>>),

    /// Stop uploading, the torrent becomes [`TorrentStatus::Completed`].
    Stop(oneshot::Sender<Result<TorrentStatus, Error>>),

    GetState(oneshot::Sender<TorrentState>),

    /// When torrent is being gracefully shutdown
    Quit,
}

/// Context of a [`crate::torrent::Torrent`] that is shared with the tasks
/// it spawns.
#[derive(Debug)]
pub struct TorrentCtx {
    pub info_hash: InfoHash,
    pub descriptor: TorrentDescriptor,
    pub config: Arc<Config>,
    pub local_peer_id: PeerId,
    pub tx: mpsc::UnboundedSender<TorrentMsg>,
    pub piece_tx: mpsc::Sender<PieceMsg>,
    pub swarm_tx: mpsc::UnboundedSender<SwarmMsg>,
}

/// The state a paused torrent goes back to when resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResumeTo {
    Checking,
    Downloading,
    Seeding,
}

impl From<ResumeTo> for TorrentStatus {
    fn from(value: ResumeTo) -> Self {
        match value {
            ResumeTo::Checking => TorrentStatus::Checking,
            ResumeTo::Downloading => TorrentStatus::Downloading,
            ResumeTo::Seeding => TorrentStatus::Seeding,
        }
    }
}

/// Status of the current Torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TorrentStatus {
    /// Local data is being validated against the piece hashes.
    #[default]
    Checking,
    Downloading,
    /// All pieces are verified, the torrent keeps uploading.
    Seeding,
    /// Uploading was stopped, this is final.
    Completed,
    Paused(ResumeTo),
    /// Storage or descriptor failure, this is final.
    Error,
}

/// Events that move a torrent from one [`TorrentStatus`] to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// The check found pieces that need to be downloaded.
    CheckedIncomplete,
    /// The check found every piece verified.
    CheckedComplete,
    /// The last missing piece was verified.
    LastPieceVerified,
    Pause,
    Resume,
    Stop,
    Fail,
}

impl TorrentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TorrentStatus::Completed | TorrentStatus::Error)
    }

    /// The status after `event`, or an error if a torrent in this status
    /// can't handle it.
    pub fn on(self, event: Lifecycle) -> Result<TorrentStatus, Error> {
        use Lifecycle as L;
        use TorrentStatus as S;

        let next = match (self, event) {
            (S::Completed | S::Error, _) => None,
            (_, L::Fail) => Some(S::Error),
            (_, L::Stop) => Some(S::Completed),

            (S::Checking, L::CheckedIncomplete) => Some(S::Downloading),
            (S::Checking, L::CheckedComplete) => Some(S::Seeding),
            (S::Paused(ResumeTo::Checking), L::CheckedIncomplete) => {
                Some(S::Paused(ResumeTo::Downloading))
            }
            (S::Paused(ResumeTo::Checking), L::CheckedComplete) => {
                Some(S::Paused(ResumeTo::Seeding))
            }

            // a block that was in the socket when the torrent was paused
            // might complete the download.
            (S::Downloading, L::LastPieceVerified) => Some(S::Seeding),
            (S::Paused(ResumeTo::Downloading), L::LastPieceVerified) => {
                Some(S::Paused(ResumeTo::Seeding))
            }

            (S::Checking, L::Pause) => Some(S::Paused(ResumeTo::Checking)),
            (S::Downloading, L::Pause) => {
                Some(S::Paused(ResumeTo::Downloading))
            }
            (S::Seeding, L::Pause) => Some(S::Paused(ResumeTo::Seeding)),
            (S::Paused(prior), L::Pause) => Some(S::Paused(prior)),
            (S::Paused(prior), L::Resume) => Some(prior.into()),

            (
                S::Checking | S::Downloading | S::Seeding | S::Paused(_),
                L::CheckedIncomplete
                | L::CheckedComplete
                | L::LastPieceVerified
                | L::Resume,
            ) => None,
        };

        next.ok_or(Error::InvalidTransition { from: self, event })
    }
}

impl Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TorrentStatus::Checking => "Checking",
            TorrentStatus::Downloading => "Downloading",
            TorrentStatus::Seeding => "Seeding",
            TorrentStatus::Completed => "Completed",
            TorrentStatus::Paused(_) => "Paused",
            TorrentStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// State of a [`crate::torrent::Torrent`], used by the
/// [`crate::supervisor::Supervisor`] and its callers.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TorrentState {
    pub name: String,
    pub info_hash: InfoHash,
    pub status: TorrentStatus,
    /// Size of the torrent in bytes.
    pub size: u64,
    /// Bytes of verified pieces.
    pub downloaded: u64,
    /// Bytes sent to other peers.
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub pieces: usize,
    pub verified_pieces: usize,
    /// Verified pieces.
    pub bitfield: Bitfield,
    pub in_progress: Vec<usize>,
    pub outstanding_requests: usize,
    pub endgame: bool,
    pub connected_peers: usize,
    pub connecting_peers: usize,
    pub banned_peers: usize,
    /// Set when the status is [`TorrentStatus::Error`].
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn random() -> Self {
        InfoHash(rand::thread_rng().gen())
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<&str> for InfoHash {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let buff = hex::decode(value).map_err(|e| e.to_string())?;
        let buff: [u8; 20] = buff
            .try_into()
            .map_err(|_| "The infohash must have exactly 20 bytes")?;
        Ok(InfoHash(buff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_lifecycle() {
        let s = TorrentStatus::default();
        assert_eq!(s, TorrentStatus::Checking);

        let s = s.on(Lifecycle::CheckedIncomplete).unwrap();
        assert_eq!(s, TorrentStatus::Downloading);

        let s = s.on(Lifecycle::LastPieceVerified).unwrap();
        assert_eq!(s, TorrentStatus::Seeding);

        let s = s.on(Lifecycle::Stop).unwrap();
        assert_eq!(s, TorrentStatus::Completed);
        assert!(s.is_terminal());
    }

    #[test]
    fn check_finds_everything() {
        let s = TorrentStatus::Checking.on(Lifecycle::CheckedComplete);
        assert_eq!(s.unwrap(), TorrentStatus::Seeding);
    }

    #[test]
    fn pause_remembers_prior_state() {
        for prior in [
            TorrentStatus::Checking,
            TorrentStatus::Downloading,
            TorrentStatus::Seeding,
        ] {
            let paused = prior.on(Lifecycle::Pause).unwrap();
            assert!(matches!(paused, TorrentStatus::Paused(_)));
            assert_eq!(paused.on(Lifecycle::Pause).unwrap(), paused);
            assert_eq!(paused.on(Lifecycle::Resume).unwrap(), prior);
        }
    }

    #[test]
    fn events_while_paused_update_prior_state() {
        let paused = TorrentStatus::Checking.on(Lifecycle::Pause).unwrap();
        let paused = paused.on(Lifecycle::CheckedIncomplete).unwrap();
        assert_eq!(paused, TorrentStatus::Paused(ResumeTo::Downloading));

        let paused = paused.on(Lifecycle::LastPieceVerified).unwrap();
        assert_eq!(paused, TorrentStatus::Paused(ResumeTo::Seeding));
        assert_eq!(
            paused.on(Lifecycle::Resume).unwrap(),
            TorrentStatus::Seeding
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        let events = [
            Lifecycle::CheckedIncomplete,
            Lifecycle::CheckedComplete,
            Lifecycle::LastPieceVerified,
            Lifecycle::Pause,
            Lifecycle::Resume,
            Lifecycle::Stop,
            Lifecycle::Fail,
        ];
        for s in [TorrentStatus::Completed, TorrentStatus::Error] {
            for e in events {
                assert!(matches!(
                    s.on(e),
                    Err(Error::InvalidTransition { .. })
                ));
            }
        }
    }

    #[test]
    fn failure_from_any_active_state() {
        for s in [
            TorrentStatus::Checking,
            TorrentStatus::Downloading,
            TorrentStatus::Seeding,
            TorrentStatus::Paused(ResumeTo::Downloading),
        ] {
            assert_eq!(s.on(Lifecycle::Fail).unwrap(), TorrentStatus::Error);
        }
    }

    #[test]
    fn resume_without_pause() {
        assert!(TorrentStatus::Downloading.on(Lifecycle::Resume).is_err());
        assert!(TorrentStatus::Seeding
            .on(Lifecycle::LastPieceVerified)
            .is_err());
    }

    #[test]
    fn info_hash_hex() {
        let hash = InfoHash([0xab; 20]);
        let s = hash.to_string();
        assert_eq!(s.len(), 40);
        assert_eq!(InfoHash::try_from(s.as_str()).unwrap(), hash);
        assert!(InfoHash::try_from("abcd").is_err());
    }
}
