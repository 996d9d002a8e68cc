use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    peer::PeerId,
    piece::PieceMsg,
    supervisor::SupervisorMsg,
    swarm::SwarmMsg,
    torrent::{Lifecycle, TorrentMsg, TorrentStatus},
    wire::BlockInfo,
};

impl From<mpsc::error::SendError<PieceMsg>> for Error {
    fn from(_value: mpsc::error::SendError<PieceMsg>) -> Self {
        Self::SendErrorPiece
    }
}

impl From<mpsc::error::SendError<SwarmMsg>> for Error {
    fn from(_value: mpsc::error::SendError<SwarmMsg>) -> Self {
        Self::SendErrorSwarm
    }
}

impl From<mpsc::error::SendError<TorrentMsg>> for Error {
    fn from(_value: mpsc::error::SendError<TorrentMsg>) -> Self {
        Self::SendErrorTorrent
    }
}

impl From<mpsc::error::SendError<SupervisorMsg>> for Error {
    fn from(value: mpsc::error::SendError<SupervisorMsg>) -> Self {
        Self::SendErrorSupervisor(value.to_string())
    }
}

/// How far an [`Error`] travels before someone handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A peer broke the wire protocol, only its connection is closed.
    Protocol,
    /// A piece did not match its hash, the piece is downloaded again.
    HashMismatch,
    /// Reading or writing torrent data failed, the session stops.
    Storage,
    /// The torrent descriptor is unusable, the session is never created.
    Descriptor,
    /// A peer did not answer in time, only its connection is closed.
    NetworkTimeout,
    /// Socket errors, only the affected connection is closed.
    Network,
    /// A command was sent to a torrent that can't accept it.
    Command,
    /// Channels closed or configuration failures.
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer sent a handshake for a different info_hash")]
    InfoHashMismatch,

    #[error("The peer didn't send a handshake as the first message")]
    NoHandshake,

    #[error("The peer sent a malformed message: {0}")]
    MessageMalformed(String),

    #[error("The peer sent a message of {0} bytes, which is too large")]
    MessageTooLarge(usize),

    #[error("The peer sent a bitfield after other messages")]
    BitfieldUnexpected,

    #[error("The bitfield sent by the peer does not match the torrent pieces")]
    BitfieldInvalid,

    #[error("The peer announced the piece {0} which is out of bounds")]
    PieceOutOfBounds(usize),

    #[error("The peer requested an invalid block: {0:?}")]
    RequestInvalid(BlockInfo),

    #[error("There is already a connection with the peer {0}")]
    PeerDuplicate(PeerId),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer sent too many corrupted pieces")]
    PeerStrikeout,

    #[error("The piece {0} downloaded does not have a valid hash")]
    PieceInvalid(usize),

    #[error("Storage failed: {0}")]
    Storage(String),

    #[error("The block at piece {index} offset {begin} is not in storage")]
    BlockUnavailable { index: usize, begin: u32 },

    #[error("The torrent descriptor is not valid: {0}")]
    DescriptorInvalid(String),

    #[error("The peer took to long to connect")]
    ConnectTimeout,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The message took to long to arrive")]
    MessageTimeout,

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Could not find torrent for the given info_hash")]
    TorrentDoesNotExist,

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    NoDuplicateTorrent,

    #[error("The maximum of {0} torrents was reached")]
    TooManyTorrents(usize),

    #[error("A torrent in the state {from:?} can't handle {event:?}")]
    InvalidTransition { from: TorrentStatus, event: Lifecycle },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not write the configuration file")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Could not send message to the PieceManager")]
    SendErrorPiece,

    #[error("Could not send message to the Swarm")]
    SendErrorSwarm,

    #[error("Could not send message to the Torrent")]
    SendErrorTorrent,

    #[error("Could not send message to the Supervisor: {0}")]
    SendErrorSupervisor(String),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            HandshakeInvalid
            | InfoHashMismatch
            | NoHandshake
            | MessageMalformed(_)
            | MessageTooLarge(_)
            | BitfieldUnexpected
            | BitfieldInvalid
            | PieceOutOfBounds(_)
            | RequestInvalid(_)
            | PeerDuplicate(_)
            | PeerStrikeout => ErrorKind::Protocol,
            PieceInvalid(_) => ErrorKind::HashMismatch,
            Storage(_) | BlockUnavailable { .. } => ErrorKind::Storage,
            DescriptorInvalid(_) => ErrorKind::Descriptor,
            ConnectTimeout | HandshakeTimeout | MessageTimeout => {
                ErrorKind::NetworkTimeout
            }
            IO(_) | PeerClosedSocket => ErrorKind::Network,
            TorrentDoesNotExist
            | NoDuplicateTorrent
            | TooManyTorrents(_)
            | InvalidTransition { .. } => ErrorKind::Command,
            ConfigError(_)
            | ConfigDeserializeError(_)
            | ConfigSerializeError(_)
            | HomeInvalid
            | FolderOpenError(_)
            | SpeedyError(_)
            | SendErrorPiece
            | SendErrorSwarm
            | SendErrorTorrent
            | SendErrorSupervisor(_)
            | ReceiveErrorOneshot(_) => ErrorKind::Internal,
        }
    }

    /// Fatal errors move a torrent into the error state.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage | ErrorKind::Descriptor)
    }
}
