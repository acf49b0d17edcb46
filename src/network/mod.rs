//! Peer-to-peer gossip
//!
//! Nodes talk over long-lived links carrying a stream of JSON messages. Each
//! side announces its tip, and the other side fetches what it is missing by
//! walking backward from announced headers. Transactions are relayed as they
//! are accepted into the mempool.

pub mod message;
pub mod peer_link;
pub mod peerage;
pub mod server;

pub use message::{merge_peers, PeerChainTip, PeerInfo, PeerMessage, NODE_VERSION};
pub use peer_link::{MessageSink, PeerLink, LINK_TIMEOUT_MS};
pub use peerage::Peerage;
pub use server::{connect_peer, link_in_process, Server};
