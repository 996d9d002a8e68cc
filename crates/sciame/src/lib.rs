//! A swarm download engine for the BitTorrent wire protocol.
//!
//! The [`supervisor::Supervisor`] owns one [`torrent::Torrent`] session per
//! descriptor. Each session owns a [`piece::PieceManager`], which decides
//! which blocks to request and verifies pieces, and a [`swarm::Swarm`],
//! which keeps a set of [`peer::Peer`] connections alive. Every one of them
//! is a tokio task that talks to the others with messages.
pub mod bitfield;
pub mod config;
pub mod counter;
pub mod descriptor;
pub mod error;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod supervisor;
pub mod swarm;
pub mod torrent;
pub mod wire;
