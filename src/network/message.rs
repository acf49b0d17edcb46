use crate::core::block::{Block, BlockHeader};
use crate::core::hash::ChainHash;
use crate::core::Transaction;
use serde::{Deserialize, Serialize};

/// Node software version advertised in tips and peer records
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

const MAX_HOST_LEN: usize = 255;
const MAX_VERSION_LEN: usize = 64;
const MAX_NODE_ID_LEN: usize = 64;

/// Messages exchanged over a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Tip(PeerChainTip),
    ReqHeader { block_height: u32 },
    Header(BlockHeader),
    ReqBlock { block_hash: ChainHash },
    Block(Block),
    Tx(Transaction),
}

impl PeerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Tip(_) => "tip",
            PeerMessage::ReqHeader { .. } => "req_header",
            PeerMessage::Header(_) => "header",
            PeerMessage::ReqBlock { .. } => "req_block",
            PeerMessage::Block(_) => "block",
            PeerMessage::Tx(_) => "tx",
        }
    }
}

/// What a node announces about itself: its network, its best header and
/// some peers it has heard about. The first peer entry describes the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChainTip {
    pub network_name: String,
    pub version: String,
    pub header: Option<BlockHeader>,
    pub peers: Vec<PeerInfo>,
}

/// A gossiped record about a reachable node. Timestamps are milliseconds;
/// zero means never.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
    pub learned: i64,
    pub last_checked: i64,
    pub last_passed: i64,
    pub version: String,
    pub node_id: String,
}

impl PeerInfo {
    pub fn new(host: &str, port: u16, learned: i64) -> PeerInfo {
        PeerInfo {
            host: host.to_string(),
            port,
            learned,
            ..Default::default()
        }
    }

    /// Key in the rumor list
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects records that could not describe a real peer, including
    /// ones with timestamps too far in the future.
    pub fn is_sane(&self, now: i64, max_clock_skew_ms: i64) -> bool {
        if self.host.is_empty() || self.host.len() > MAX_HOST_LEN {
            return false;
        }
        if self.port == 0 {
            return false;
        }
        if self.version.len() > MAX_VERSION_LEN || self.node_id.len() > MAX_NODE_ID_LEN {
            return false;
        }
        let latest = now + max_clock_skew_ms;
        self.learned <= latest && self.last_checked <= latest && self.last_passed <= latest
    }
}

/// Combines two records for the same host and port. The newer learned
/// record is the base and every timestamp takes the later value.
pub fn merge_peers(a: &PeerInfo, b: &PeerInfo) -> PeerInfo {
    let mut merged = if a.learned > b.learned {
        a.clone()
    } else {
        b.clone()
    };
    merged.learned = a.learned.max(b.learned);
    merged.last_checked = a.last_checked.max(b.last_checked);
    merged.last_passed = a.last_passed.max(b.last_passed);
    merged
}
