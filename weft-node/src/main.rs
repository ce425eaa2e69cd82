use async_std::net::{TcpListener, TcpStream};
use async_std::sync::Mutex;
use async_std::task;
use async_trait::async_trait;
use async_tungstenite::accept_async;
use async_tungstenite::tungstenite::protocol::Message;
use debug_print::*;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use weft::store::HashMapBlockStore;
use weft::types::*;
use weft::utils::generate_keypair;
use weft_net::errors::*;
use weft_replica::config::ReplicaConfig;
use weft_replica::replica::SharedLog;
use weft_stream::stream::{DirectStream, StreamConfig};
use weft_stream::transport::{Transport, TransportEvent};

/// WebSocket-backed transport: every accepted connection announces
/// its peer key in the first binary frame, then carries raw message
/// frames both ways
struct WsTransport {
    outbound: Arc<RwLock<HashMap<PeerId, async_channel::Sender<Vec<u8>>>>>,
    events_s: async_channel::Sender<TransportEvent>,
    events_r: async_channel::Receiver<TransportEvent>,
}

impl WsTransport {
    fn new() -> WsTransport {
        let (events_s, events_r) = async_channel::unbounded();
        WsTransport {
            outbound: Arc::new(RwLock::new(HashMap::new())),
            events_s,
            events_r,
        }
    }

    fn register(&self, peer: PeerId) -> async_channel::Receiver<Vec<u8>> {
        let (s, r) = async_channel::unbounded();
        let mut map = self.outbound.write().expect("RwLock poisoned");
        map.insert(peer, s);
        let _ = self.events_s.try_send(TransportEvent::PeerUp(peer));
        r
    }

    fn unregister(&self, peer: &PeerId) {
        let mut map = self.outbound.write().expect("RwLock poisoned");
        if map.remove(peer).is_some() {
            let _ = self.events_s.try_send(TransportEvent::PeerDown(*peer));
        }
    }

    fn incoming(&self, peer: PeerId, frame: Vec<u8>) {
        let _ = self.events_s.try_send(TransportEvent::Frame(peer, frame));
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, to: &PeerId, frame: Vec<u8>) -> Result<(), ProtocolError> {
        let sender = {
            let map = self.outbound.read().expect("RwLock poisoned");
            map.get(to).cloned().ok_or(ProtocolError::CannotSend)?
        };
        sender
            .send(frame)
            .await
            .map_err(|_e| ProtocolError::CannotSend)
    }

    async fn dial(&self, _to: &PeerId) -> Result<(), ProtocolError> {
        // the daemon only accepts; peers dial us
        Err(ProtocolError::NoRoute)
    }

    fn neighbors(&self) -> Vec<PeerId> {
        let map = self.outbound.read().expect("RwLock poisoned");
        let mut peers: Vec<PeerId> = map.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn events(&self) -> async_channel::Receiver<TransportEvent> {
        self.events_r.clone()
    }
}

async fn connection_loop(tcp: TcpStream, transport: Arc<WsTransport>) -> std::io::Result<()> {
    let ws = accept_async(tcp).await.unwrap();
    let (tx, mut rx) = ws.split();
    let tx_mutex = Arc::new(Mutex::new(tx));

    // the first frame announces the peer key
    let peer: PeerId = loop {
        match rx.next().await {
            Some(Ok(msg)) if msg.is_binary() => {
                match serde_bare::from_slice::<PeerId>(&msg.into_data()) {
                    Ok(peer) => break peer,
                    Err(_e) => {
                        debug_println!("bad peer announcement, closing");
                        return Ok(());
                    }
                }
            }
            Some(Ok(msg)) if msg.is_close() => return Ok(()),
            Some(Ok(_msg)) => continue,
            Some(Err(e)) => {
                debug_println!("error before announcement: {:?}", e);
                return Ok(());
            }
            None => return Ok(()),
        }
    };
    debug_println!("peer connected: {}", peer);

    let frames = transport.register(peer);
    let ws_in_task = Arc::clone(&tx_mutex);
    task::spawn(async move {
        while let Ok(frame) = frames.recv().await {
            if ws_in_task
                .lock()
                .await
                .send(Message::binary(frame))
                .await
                .is_err()
            {
                break;
            }
        }
        debug_println!("end of outbound frames loop");
        let mut lock = ws_in_task.lock().await;
        let _ = lock.send(Message::Close(None)).await;
    });

    while let Some(msg) = rx.next().await {
        let msg = match msg {
            Err(e) => {
                debug_println!("error on peer stream: {:?}", e);
                break;
            }
            Ok(m) => m,
        };
        if msg.is_close() {
            debug_println!("CLOSE from peer {}", peer);
            break;
        } else if msg.is_binary() {
            transport.incoming(peer, msg.into_data());
        }
    }

    transport.unregister(&peer);
    let mut lock = tx_mutex.lock().await;
    let _ = lock.send(Message::Close(None)).await;
    debug_println!("end of read loop for {}", peer);
    Ok(())
}

#[async_std::main]
async fn main() -> std::io::Result<()> {
    println!("Starting weft node daemon...");

    let identity = generate_keypair();
    println!("peer id: {}", identity.1);

    let log_id: LogId = Digest::Blake3Digest32(*blake3::hash(b"weft default log").as_bytes());

    let transport = Arc::new(WsTransport::new());
    let stream = DirectStream::start(
        identity,
        Arc::clone(&transport) as Arc<dyn Transport>,
        StreamConfig::default(),
    );
    let shared = SharedLog::open(
        log_id,
        identity,
        Box::new(HashMapBlockStore::new()),
        stream,
        ReplicaConfig::default(),
    );
    println!("serving log {}", shared.log_id());

    let socket = TcpListener::bind("127.0.0.1:3012").await?;
    let mut connections = socket.incoming();
    while let Some(tcp) = connections.next().await {
        let _handle = task::spawn(connection_loop(tcp.unwrap(), Arc::clone(&transport)));
    }
    Ok(())
}
