use crate::config::NodeConfig;
use crate::core::ingestor::{BlockIngestor, ChainStateSource};
use crate::core::params::NetworkParams;
use crate::core::Transaction;
use crate::error::Result;
use crate::network::message::{merge_peers, PeerChainTip, PeerInfo, PeerMessage, NODE_VERSION};
use crate::network::peer_link::PeerLink;
use crate::network::server::connect_peer;
use crate::storage::chain_store::PEERLIST_KEY;
use crate::storage::memory_pool::MemPool;
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Rumors not refreshed for this long are forgotten
pub const PEER_EXPIRE_MS: i64 = 3 * 86_400_000;
/// Minimum time between connection attempts to the same rumor
pub const RECONNECT_MS: i64 = 300_000;
const SAVE_PEERS_MS: i64 = 60_000;
/// Rumors sampled into each tip we send
pub const TIP_PEER_COUNT: usize = 10;
/// Once this many rumors are held, the least recently learned one makes room
pub const MAX_RUMORS: usize = 2000;

/// Everything we know about other nodes: open links plus gossip about
/// nodes we might connect to.
pub struct Peerage {
    ingestor: Arc<BlockIngestor>,
    mempool: Arc<MemPool>,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    rumors: Mutex<HashMap<String, PeerInfo>>,
    node_id: String,
    advertise_host: Option<String>,
    listen_port: u16,
    peer_count: usize,
    seeds: Vec<(String, u16)>,
    last_save: Mutex<i64>,
}

impl Peerage {
    /// Loads the saved rumor list from the `peerlist` key
    pub fn new(
        ingestor: Arc<BlockIngestor>,
        mempool: Arc<MemPool>,
        config: &NodeConfig,
    ) -> Result<Peerage> {
        let params = ingestor.params();
        let now = current_timestamp()?;

        let mut seeds: Vec<(String, u16)> = config
            .seed_peers
            .iter()
            .filter_map(|s| parse_seed(s, params.default_port))
            .collect();
        seeds.extend(
            params
                .seed_nodes
                .iter()
                .filter_map(|s| parse_seed(s, params.default_port)),
        );

        let mut rumors = HashMap::new();
        if let Some(bytes) = ingestor.store().get_special(PEERLIST_KEY)? {
            let saved: Vec<PeerInfo> = deserialize(&bytes)?;
            info!("Loaded {} saved peers", saved.len());
            for peer in saved {
                if peer.is_sane(now, params.max_clock_skew_ms) {
                    rumors.insert(peer.address(), peer);
                }
            }
        }

        let id_bytes: [u8; 8] = rand::thread_rng().gen();
        Ok(Peerage {
            ingestor,
            mempool,
            links: Mutex::new(HashMap::new()),
            rumors: Mutex::new(rumors),
            node_id: HEXLOWER.encode(&id_bytes),
            advertise_host: config.advertise_host.clone(),
            listen_port: config.listen_port,
            peer_count: config.peer_count,
            seeds,
            last_save: Mutex::new(now),
        })
    }

    pub fn ingestor(&self) -> &BlockIngestor {
        &self.ingestor
    }

    pub fn mempool(&self) -> &MemPool {
        &self.mempool
    }

    pub fn params(&self) -> &NetworkParams {
        self.ingestor.params()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Adds a link and greets it with our tip
    pub fn register(&self, link: Arc<PeerLink>) -> Result<()> {
        let tip = self.get_tip()?;
        self.links
            .lock()?
            .insert(link.link_id().to_string(), link.clone());
        link.write_message(&PeerMessage::Tip(tip));
        Ok(())
    }

    pub fn get_links(&self) -> Vec<Arc<PeerLink>> {
        match self.links.lock() {
            Ok(links) => links.values().cloned().collect(),
            Err(_) => {
                log::error!("Failed to acquire links lock");
                vec![]
            }
        }
    }

    pub fn link_count(&self) -> usize {
        self.get_links().len()
    }

    pub fn get_rumors(&self) -> Vec<PeerInfo> {
        match self.rumors.lock() {
            Ok(rumors) => rumors.values().cloned().collect(),
            Err(_) => {
                log::error!("Failed to acquire peer rumor lock");
                vec![]
            }
        }
    }

    fn self_info(&self, now: i64) -> Option<PeerInfo> {
        self.advertise_host.as_ref().map(|host| PeerInfo {
            host: host.clone(),
            port: self.listen_port,
            learned: now,
            last_checked: 0,
            last_passed: 0,
            version: NODE_VERSION.to_string(),
            node_id: self.node_id.clone(),
        })
    }

    /// Our announcement: best header, ourselves if we advertise a host, then
    /// a shuffled sample of rumors.
    pub fn get_tip(&self) -> Result<PeerChainTip> {
        let now = current_timestamp()?;
        let mut peers: Vec<PeerInfo> = self.self_info(now).into_iter().collect();

        let mut rumors = self.get_rumors();
        rumors.shuffle(&mut rand::thread_rng());
        peers.extend(rumors.into_iter().take(TIP_PEER_COUNT));

        Ok(PeerChainTip {
            network_name: self.params().network_name.clone(),
            version: NODE_VERSION.to_string(),
            header: self.ingestor.head().map(|h| h.header),
            peers,
        })
    }

    pub fn send_all_tips(&self) -> Result<()> {
        let tip = PeerMessage::Tip(self.get_tip()?);
        for link in self.get_links() {
            link.write_message(&tip);
        }
        Ok(())
    }

    /// Sends `tx` on every link except the one named by `except`
    pub fn broadcast_transaction(&self, tx: &Transaction, except: Option<&str>) {
        let msg = PeerMessage::Tx(tx.clone());
        for link in self.get_links() {
            if Some(link.link_id()) != except {
                link.write_message(&msg);
            }
        }
    }

    pub fn request_height_from_links(&self, block_height: u32) {
        let msg = PeerMessage::ReqHeader { block_height };
        for link in self.get_links() {
            link.write_message(&msg);
        }
    }

    /// Follow-up once the chain tip moved: the mempool is re-clustered on
    /// the new UTXO root, every link hears the new tip and gets asked for the
    /// height after it.
    pub fn tip_advanced(&self) -> Result<()> {
        if let Some(head) = self.ingestor.head() {
            self.mempool.rebuild_priority_map(&head.header.utxo_root_hash)?;
            self.send_all_tips()?;
            self.request_height_from_links(head.get_height() + 1);
        }
        Ok(())
    }

    /// Adds or merges a rumor. Expired and insane records are dropped.
    pub fn learn_peer(&self, info: PeerInfo) -> Result<()> {
        let now = current_timestamp()?;
        if info.learned + PEER_EXPIRE_MS < now {
            return Ok(());
        }
        if !info.is_sane(now, self.params().max_clock_skew_ms) {
            return Ok(());
        }
        if info.node_id == self.node_id {
            return Ok(());
        }

        let key = info.address();
        let mut rumors = self.rumors.lock()?;
        let merged = match rumors.get(&key) {
            Some(existing) => merge_peers(&info, existing),
            None => {
                if rumors.len() >= MAX_RUMORS {
                    let oldest = rumors
                        .iter()
                        .min_by_key(|(_, r)| r.learned)
                        .map(|(k, r)| (k.clone(), r.learned));
                    match oldest {
                        Some((_, learned)) if learned > info.learned => return Ok(()),
                        Some((oldest_key, _)) => {
                            debug!("Rumor list full, forgetting {oldest_key}");
                            rumors.remove(&oldest_key);
                        }
                        None => {}
                    }
                }
                info
            }
        };
        rumors.insert(key, merged);
        Ok(())
    }

    pub fn close_all(&self) {
        for link in self.get_links() {
            link.close();
        }
    }

    /// One maintenance pass: prune, connect, announce, save
    pub fn run_maintenance(self: &Arc<Self>) -> Result<()> {
        let now = current_timestamp()?;
        self.prune_links(now)?;
        self.connect_to_peers(now)?;
        self.send_all_tips()?;
        if let Some(tx) = self.mempool.get_random_transaction() {
            self.broadcast_transaction(&tx, None);
        }
        self.save_peers(now, false)?;
        Ok(())
    }

    /// Runs [`Peerage::run_maintenance`] every [`MAINTENANCE_INTERVAL`]
    pub fn start_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        info!("Starting peerage");
        thread::spawn(move || loop {
            thread::sleep(MAINTENANCE_INTERVAL);
            if let Err(e) = self.run_maintenance() {
                warn!("Peerage maintenance failed: {e}");
            }
        })
    }

    fn prune_links(&self, now: i64) -> Result<()> {
        let mut links = self.links.lock()?;
        links.retain(|id, link| {
            if link.is_alive(now) {
                return true;
            }
            let direction = if link.is_outbound() { "outbound" } else { "inbound" };
            info!("Dropping {direction} link {id}");
            link.close();
            false
        });
        Ok(())
    }

    fn connect_to_peers(self: &Arc<Self>, now: i64) -> Result<()> {
        let links = self.get_links();
        if links.len() >= self.peer_count {
            return Ok(());
        }
        let needed = self.peer_count - links.len();
        let connected: HashSet<String> = links
            .iter()
            .filter_map(|l| l.remote_info())
            .map(|info| info.address())
            .collect();

        let candidates: Vec<PeerInfo> = {
            let mut rumors = self.rumors.lock()?;
            let mut picked: Vec<PeerInfo> = rumors
                .values()
                .filter(|info| !connected.contains(&info.address()))
                .filter(|info| now - info.last_checked >= RECONNECT_MS)
                .cloned()
                .collect();
            picked.shuffle(&mut rand::thread_rng());
            picked.truncate(needed);
            for info in &picked {
                if let Some(r) = rumors.get_mut(&info.address()) {
                    r.last_checked = now;
                }
            }
            if rumors.is_empty() {
                picked = self
                    .seeds
                    .iter()
                    .map(|(host, port)| PeerInfo::new(host, *port, now))
                    .filter(|info| !connected.contains(&info.address()))
                    .take(needed)
                    .collect();
            }
            picked
        };

        for info in candidates {
            debug!("Attempting connection to peer {}", info.address());
            if let Err(e) = connect_peer(self, info.clone()) {
                info!("Error with peer {}: {e}", info.address());
            }
        }
        Ok(())
    }

    /// Writes the rumor list at most once per minute unless `force` is set
    pub fn save_peers(&self, now: i64, force: bool) -> Result<()> {
        let mut last_save = self.last_save.lock()?;
        if !force && now - *last_save < SAVE_PEERS_MS {
            return Ok(());
        }
        *last_save = now;

        let peers: Vec<PeerInfo> = self
            .get_rumors()
            .into_iter()
            .filter(|p| p.learned + PEER_EXPIRE_MS >= now)
            .collect();
        self.ingestor
            .store()
            .put_special(PEERLIST_KEY, &serialize(&peers)?)
    }
}

/// `host:port`, or a bare host on `default_port`
fn parse_seed(seed: &str, default_port: u16) -> Option<(String, u16)> {
    let seed = seed.trim();
    if seed.is_empty() {
        return None;
    }
    match seed.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) if !host.is_empty() => Some((host.to_string(), port)),
            _ => {
                warn!("Ignoring malformed seed {seed}");
                None
            }
        },
        None => Some((seed.to_string(), default_port)),
    }
}
