// A PeerLink is one side of a conversation with another node. It doesn't
// matter who dialed whom: both ends send their tip on connect, on every new
// block and on every maintenance pass, and each side decides on its own what
// it wants from what the other one is announcing.
//
// Missing blocks are found by walking backward. When a peer shows me a header
// whose parent I don't have, I ask for the header one below it, and keep going
// until I hit something I know. Then bodies come forward one height at a time
// using the heights the peer told me about on the way down.

use crate::core::block::{Block, BlockHeader};
use crate::core::hash::ChainHash;
use crate::core::ingestor::IngestOutcome;
use crate::core::validation::check_block_header_basics;
use crate::error::{BlockchainError, Result};
use crate::network::message::{PeerChainTip, PeerInfo, PeerMessage};
use crate::network::peerage::{Peerage, TIP_PEER_COUNT};
use crate::utils::current_timestamp;
use data_encoding::HEXLOWER;
use log::{debug, info};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// A link that has been silent this long is considered dead
pub const LINK_TIMEOUT_MS: i64 = 300_000;

const HEIGHT_MAP_MAX: usize = 1000;

/// Where a link's outbound messages go
pub trait MessageSink: Send {
    fn send_message(&mut self, msg: &PeerMessage) -> Result<()>;

    fn close(&mut self) {}
}

impl MessageSink for TcpStream {
    fn send_message(&mut self, msg: &PeerMessage) -> Result<()> {
        serde_json::to_writer(&mut *self, msg)?;
        self.flush()
            .map_err(|e| BlockchainError::Network(format!("Failed to flush stream: {e}")))
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl MessageSink for Sender<PeerMessage> {
    fn send_message(&mut self, msg: &PeerMessage) -> Result<()> {
        self.send(msg.clone())
            .map_err(|e| BlockchainError::Network(format!("Link channel closed: {e}")))
    }
}

/// Heights this peer has announced, oldest entries dropped first
#[derive(Default)]
struct HeightMap {
    hashes: HashMap<u32, ChainHash>,
    order: VecDeque<u32>,
}

impl HeightMap {
    fn insert(&mut self, height: u32, hash: ChainHash) {
        if self.hashes.insert(height, hash).is_none() {
            self.order.push_back(height);
        }
        while self.order.len() > HEIGHT_MAP_MAX {
            if let Some(old) = self.order.pop_front() {
                self.hashes.remove(&old);
            }
        }
    }

    fn get(&self, height: u32) -> Option<ChainHash> {
        self.hashes.get(&height).copied()
    }
}

pub struct PeerLink {
    link_id: String,
    outbound: bool,
    sink: Mutex<Box<dyn MessageSink>>,
    closed: AtomicBool,
    last_received: AtomicI64,
    got_first_tip: AtomicBool,
    remote: Mutex<Option<PeerInfo>>,
    heights: Mutex<HeightMap>,
}

impl PeerLink {
    /// A link the remote side opened. Who they are is learned from their tip.
    pub fn inbound(sink: Box<dyn MessageSink>) -> PeerLink {
        Self::with_sink(sink, false, None)
    }

    /// A link we opened to `remote`
    pub fn outbound(sink: Box<dyn MessageSink>, remote: PeerInfo) -> PeerLink {
        Self::with_sink(sink, true, Some(remote))
    }

    fn with_sink(sink: Box<dyn MessageSink>, outbound: bool, remote: Option<PeerInfo>) -> PeerLink {
        let bytes: [u8; 6] = rand::thread_rng().gen();
        PeerLink {
            link_id: HEXLOWER.encode(&bytes),
            outbound,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            last_received: AtomicI64::new(current_timestamp().unwrap_or_default()),
            got_first_tip: AtomicBool::new(false),
            remote: Mutex::new(remote),
            heights: Mutex::new(HeightMap::default()),
        }
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn remote_info(&self) -> Option<PeerInfo> {
        match self.remote.lock() {
            Ok(remote) => remote.clone(),
            Err(_) => None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Open and heard from within [`LINK_TIMEOUT_MS`]
    pub fn is_alive(&self, now: i64) -> bool {
        self.is_open() && now - self.last_received.load(Ordering::SeqCst) <= LINK_TIMEOUT_MS
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sink) = self.sink.lock() {
            sink.close();
        }
        debug!("Closed link {}", self.link_id);
    }

    /// Sends `msg` to the remote side. A failed write closes the link.
    pub fn write_message(&self, msg: &PeerMessage) {
        if !self.is_open() {
            return;
        }
        let result = match self.sink.lock() {
            Ok(mut sink) => sink.send_message(msg),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!("Write of {} to link {} failed: {e}", msg.kind(), self.link_id);
            self.close();
        }
    }

    /// Hash this peer announced for `height`, if it did
    pub fn announced_hash(&self, height: u32) -> Option<ChainHash> {
        match self.heights.lock() {
            Ok(heights) => heights.get(height),
            Err(_) => None,
        }
    }

    pub fn handle_message(&self, peerage: &Peerage, msg: PeerMessage) {
        if let Ok(now) = current_timestamp() {
            self.last_received.store(now, Ordering::SeqCst);
        }
        let kind = msg.kind();
        if let Err(e) = self.process_message(peerage, msg) {
            if e.is_validation() {
                info!("Validation error in {kind} from {}: {e}", self.link_id);
            } else {
                info!("Closing link {} after {kind}: {e}", self.link_id);
                self.close();
            }
        }
    }

    fn process_message(&self, peerage: &Peerage, msg: PeerMessage) -> Result<()> {
        let ingestor = peerage.ingestor();
        match msg {
            PeerMessage::Tx(tx) => match peerage.mempool().add_transaction(&tx) {
                Ok(true) => peerage.broadcast_transaction(&tx, Some(&self.link_id)),
                Ok(false) => {}
                // Peers relay plenty of stale or conflicting transactions
                Err(e) if e.is_validation() => {
                    debug!("Ignoring tx {} from {}: {e}", tx.get_tx_hash(), self.link_id)
                }
                Err(e) => return Err(e),
            },
            PeerMessage::Tip(tip) => self.handle_tip(peerage, tip)?,
            PeerMessage::ReqBlock { block_hash } => {
                if let Some(block) = ingestor.get_block(&block_hash)? {
                    self.write_message(&PeerMessage::Block(block));
                }
            }
            PeerMessage::Block(block) => self.handle_block(peerage, block)?,
            PeerMessage::ReqHeader { block_height } => {
                if let Some(header) = ingestor.get_header_at_height(block_height)? {
                    self.write_message(&PeerMessage::Header(header));
                }
            }
            PeerMessage::Header(header) => {
                check_block_header_basics(peerage.params(), &header, false)?;
                self.consider_header(peerage, &header)?;
            }
        }
        Ok(())
    }

    fn handle_tip(&self, peerage: &Peerage, tip: PeerChainTip) -> Result<()> {
        let params = peerage.params();
        if tip.network_name != params.network_name {
            info!(
                "Peer on link {} is on network {}, closing",
                self.link_id, tip.network_name
            );
            self.close();
            return Ok(());
        }

        let now = current_timestamp()?;
        if self.outbound && !self.got_first_tip.swap(true, Ordering::SeqCst) {
            if let Some(mut info) = self.remote_info() {
                info.last_passed = now;
                peerage.learn_peer(info)?;
            }
        }

        if let Some(header) = &tip.header {
            check_block_header_basics(params, header, false)?;
            self.consider_header(peerage, header)?;
        }

        if let Some(first) = tip.peers.first() {
            let mut remote = self.remote.lock()?;
            if remote.is_none() {
                *remote = Some(first.clone());
            }
        }
        // the sender lists itself first, then its sample
        for info in tip.peers.into_iter().take(TIP_PEER_COUNT + 1) {
            if info.is_sane(now, params.max_clock_skew_ms) {
                peerage.learn_peer(info)?;
            }
        }
        Ok(())
    }

    fn handle_block(&self, peerage: &Peerage, block: Block) -> Result<()> {
        let hash = block.get_hash();
        let height = block.get_height();
        match peerage.ingestor().ingest_block(&block) {
            Ok(IngestOutcome::Accepted { tip_advanced }) => {
                debug!("Got block {hash} at height {height} from {}", self.link_id);
                if tip_advanced {
                    peerage.tip_advanced()?;
                }
                if let Some(next) = self.announced_hash(height + 1) {
                    self.request_block(peerage, &next)?;
                }
            }
            Ok(IngestOutcome::Duplicate) => {}
            Err(BlockchainError::Orphan(_)) => {
                if height > 0 {
                    self.write_message(&PeerMessage::ReqHeader {
                        block_height: height - 1,
                    });
                }
            }
            Err(e) if e.is_validation() => {
                info!(
                    "Block {hash} from {} didn't validate, closing link: {e}",
                    self.link_id
                );
                self.close();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Decides whether we want the block behind `header` and asks for it, or
    /// for its parent's header when the parent is unknown too.
    pub fn consider_header(&self, peerage: &Peerage, header: &BlockHeader) -> Result<()> {
        let hash = header.get_hash();
        let height = header.block_height;
        self.heights.lock()?.insert(height, hash);

        let ingestor = peerage.ingestor();
        if ingestor.has_block(&hash)? {
            return Ok(());
        }
        if height == 0 || ingestor.has_block(&header.prev_block_hash)? {
            if ingestor.reserve_block(&hash)? {
                self.write_message(&PeerMessage::ReqBlock { block_hash: hash });
            }
        } else {
            self.write_message(&PeerMessage::ReqHeader {
                block_height: height - 1,
            });
        }
        Ok(())
    }

    fn request_block(&self, peerage: &Peerage, hash: &ChainHash) -> Result<()> {
        let ingestor = peerage.ingestor();
        if !ingestor.has_block(hash)? && ingestor.reserve_block(hash)? {
            self.write_message(&PeerMessage::ReqBlock { block_hash: *hash });
        }
        Ok(())
    }
}
