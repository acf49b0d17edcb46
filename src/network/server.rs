use crate::error::{BlockchainError, Result};
use crate::network::message::{PeerInfo, PeerMessage};
use crate::network::peer_link::PeerLink;
use crate::network::peerage::Peerage;
use log::{debug, error, info};
use serde_json::Deserializer;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TCP_CONNECT_TIMEOUT: u64 = 5000;
const TCP_WRITE_TIMEOUT: u64 = 5000;

/// Accepts inbound peer connections
pub struct Server {
    listener: TcpListener,
    peerage: Arc<Peerage>,
}

impl Server {
    /// Binds on all interfaces. Port 0 picks a free port.
    pub fn bind(peerage: Arc<Peerage>, port: u16) -> Result<Server> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        Ok(Server { listener, peerage })
    }

    pub fn local_port(&self) -> Result<u16> {
        let addr = self
            .listener
            .local_addr()
            .map_err(|e| BlockchainError::Network(format!("Failed to read local address: {e}")))?;
        Ok(addr.port())
    }

    /// Accepts connections until the listener fails
    pub fn run(&self) {
        if let Ok(port) = self.local_port() {
            info!("Server listening on port {port}");
        }
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let peer_addr = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    match accept_link(&self.peerage, stream) {
                        Ok(link) => info!("Peer {peer_addr} connected as link {}", link.link_id()),
                        Err(e) => error!("Error handling connection from {peer_addr}: {e}"),
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }
}

/// Opens an outbound link to `info.host:info.port` and registers it
pub fn connect_peer(peerage: &Arc<Peerage>, info: PeerInfo) -> Result<Arc<PeerLink>> {
    let target = info.address();
    let addr = resolve(&target)?;
    let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(TCP_CONNECT_TIMEOUT))
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {target}: {e}")))?;
    prepare_stream(&stream)?;

    let writer = clone_stream(&stream)?;
    let link = Arc::new(PeerLink::outbound(Box::new(writer), info));
    start_link(peerage, link.clone(), stream)?;
    info!("Connected to peer {target} as link {}", link.link_id());
    Ok(link)
}

fn accept_link(peerage: &Arc<Peerage>, stream: TcpStream) -> Result<Arc<PeerLink>> {
    prepare_stream(&stream)?;
    let writer = clone_stream(&stream)?;
    let link = Arc::new(PeerLink::inbound(Box::new(writer)));
    start_link(peerage, link.clone(), stream)?;
    Ok(link)
}

/// Wires two peerages in the same process together with channels instead
/// of sockets. Returns the link as seen from `a`, then from `b`.
pub fn link_in_process(
    a: &Arc<Peerage>,
    b: &Arc<Peerage>,
) -> Result<(Arc<PeerLink>, Arc<PeerLink>)> {
    let (to_b, from_a) = channel();
    let (to_a, from_b) = channel();
    let link_a = Arc::new(PeerLink::inbound(Box::new(to_b)));
    let link_b = Arc::new(PeerLink::inbound(Box::new(to_a)));

    spawn_handler(a, link_a.clone(), from_b);
    spawn_handler(b, link_b.clone(), from_a);
    a.register(link_a.clone())?;
    b.register(link_b.clone())?;
    Ok((link_a, link_b))
}

fn resolve(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {target}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("No address found for {target}")))
}

fn prepare_stream(stream: &TcpStream) -> Result<()> {
    stream
        .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
        .map_err(|e| BlockchainError::Network(format!("Failed to set write timeout: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| BlockchainError::Network(format!("Failed to set nodelay: {e}")))
}

fn clone_stream(stream: &TcpStream) -> Result<TcpStream> {
    stream
        .try_clone()
        .map_err(|e| BlockchainError::Network(format!("Failed to clone stream: {e}")))
}

/// Reader thread decoding the JSON stream into the handler channel, then
/// registration so the remote side gets our tip.
fn start_link(peerage: &Arc<Peerage>, link: Arc<PeerLink>, stream: TcpStream) -> Result<()> {
    let (sender, receiver) = channel();
    let reader_link = link.clone();
    thread::spawn(move || {
        let reader = BufReader::new(&stream);
        for msg in Deserializer::from_reader(reader).into_iter::<PeerMessage>() {
            match msg {
                Ok(msg) => {
                    if sender.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Link {} stream ended: {e}", reader_link.link_id());
                    break;
                }
            }
        }
        reader_link.close();
    });

    spawn_handler(peerage, link.clone(), receiver);
    peerage.register(link)
}

fn spawn_handler(peerage: &Arc<Peerage>, link: Arc<PeerLink>, receiver: Receiver<PeerMessage>) {
    let peerage = peerage.clone();
    thread::spawn(move || {
        for msg in receiver {
            if !link.is_open() {
                break;
            }
            link.handle_message(&peerage, msg);
        }
        link.close();
        info!("Link {} disconnected", link.link_id());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::core::ingestor::BlockIngestor;
    use crate::storage::memory_pool::MemPool;
    use crate::testnet::{build_block, open_test_ingestor};
    use std::time::Instant;

    fn peerage_with(ingestor: BlockIngestor) -> Arc<Peerage> {
        let ingestor = Arc::new(ingestor);
        let mempool = Arc::new(MemPool::new(ingestor.trie().clone(), ingestor.clone(), 60_000));
        Arc::new(Peerage::new(ingestor, mempool, &NodeConfig::default()).unwrap())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_tcp_peers_sync_chain() {
        let (source, _src_dir) = open_test_ingestor().unwrap();
        for i in 0..3 {
            let block =
                build_block(&source, &source.head_or_start(), 1_000_000 + i * 1000, vec![]).unwrap();
            source.ingest_block(&block).unwrap();
        }
        let tip = source.head().unwrap().get_hash();
        let serving = peerage_with(source);

        let server = Server::bind(serving.clone(), 0).unwrap();
        let port = server.local_port().unwrap();
        server.spawn();

        let (empty, _dir) = open_test_ingestor().unwrap();
        let syncing = peerage_with(empty);
        connect_peer(&syncing, PeerInfo::new("127.0.0.1", port, 1)).unwrap();

        assert!(wait_for(|| syncing
            .ingestor()
            .head()
            .map(|h| h.get_hash() == tip)
            .unwrap_or(false)));
        assert_eq!(serving.link_count(), 1);
    }

    #[test]
    fn test_connect_refused() {
        let (ingestor, _dir) = open_test_ingestor().unwrap();
        let peerage = peerage_with(ingestor);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(connect_peer(&peerage, PeerInfo::new("127.0.0.1", port, 1)).is_err());
    }

    #[test]
    fn test_in_process_link_relays_new_blocks() {
        let (a_ingestor, _a_dir) = open_test_ingestor().unwrap();
        let (b_ingestor, _b_dir) = open_test_ingestor().unwrap();
        let a = peerage_with(a_ingestor);
        let b = peerage_with(b_ingestor);
        link_in_process(&a, &b).unwrap();

        let block = build_block(a.ingestor(), &a.ingestor().head_or_start(), 1_000_000, vec![])
            .unwrap();
        a.ingestor().ingest_block(&block).unwrap();
        a.tip_advanced().unwrap();

        assert!(wait_for(|| b.ingestor().has_block(&block.get_hash()).unwrap()));
    }
}
