//! kothawoc — a federated, identity-authenticated news node.
//!
//! Each node is a per-user NNTP server whose peers are reachable only
//! through an anonymous overlay. Every article is signed by the ed25519
//! identity that created it; the node id is the v3 onion address of that
//! identity. [`Node::start`] wires the pieces together: the single-writer
//! article store, the overlay transport, the peering engine and the NNTP
//! session facade, plus a loopback TCP listener and an in-process client.

pub mod control;
pub mod db;
pub mod error;
pub mod keys;
pub mod message;
pub mod nntp;
pub mod peering;
pub mod session;
pub mod store;
pub mod transport;

pub use error::{Error, ErrorKind};
pub use keys::NodeKey;
pub use message::Message;
pub use nntp::PostingStatus;
pub use session::{ConnMode, Session};

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error as ThisError;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::keys::onion_from_pubkey;
use crate::nntp::{Client, IdGenerator, NodeIdGen, Server};
use crate::peering::Peers;
use crate::session::NntpBackend;
use crate::store::{GroupPermissions, PermEntry, Store, StoreError, DEVICE_KEY};
use crate::transport::{server_handshake, TorCon};

/// Virtual port the onion service listens on.
const OVERLAY_PORT: u16 = 119;

#[derive(Debug, ThisError)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error(transparent)]
    Key(#[from] keys::KeyError),
    #[error(transparent)]
    Codec(#[from] message::CodecError),
    #[error(transparent)]
    Peering(#[from] peering::PeeringError),
    #[error("local client: {0}")]
    Client(#[from] nntp::ClientError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored device key is corrupt")]
    BadDeviceKey,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data root holding the databases, article blobs and daemon state.
    pub data_dir: PathBuf,
    /// Loopback TCP port for local readers.
    pub port: u16,
    /// Onion daemon control port.
    pub control_addr: String,
    /// Onion daemon SOCKS5 port.
    pub socks_addr: String,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>, port: u16) -> NodeConfig {
        NodeConfig {
            data_dir: data_dir.into(),
            port,
            control_addr: "127.0.0.1:9051".to_string(),
            socks_addr: "127.0.0.1:9050".to_string(),
        }
    }
}

/// A running node. Dropping it stops accepting new sessions; spawned session
/// tasks end when their streams close.
pub struct Node {
    store: Store,
    peers: Peers,
    key: NodeKey,
    id: String,
    idgen: Arc<NodeIdGen>,
    client: Mutex<Client<tokio::io::DuplexStream>>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let store = Store::open(&config.data_dir).await?;
        let key = load_or_create_identity(&store).await?;
        let id = key.node_id();
        info!("starting node {id}");

        let tc = TorCon::connect(
            &config.control_addr,
            &config.socks_addr,
            Some(&config.data_dir.join("data")),
        )
        .await?;

        let peers = Peers::spawn(tc.clone(), key.clone(), store.clone());
        peers.connect().await?;

        let backend = Arc::new(NntpBackend::new(store.clone(), peers.clone(), key.clone()));
        let idgen = Arc::new(NodeIdGen { node_name: id.clone() });
        let idgen_dyn: Arc<dyn IdGenerator> = idgen.clone();
        let server = Server::new(backend, idgen_dyn);

        // Loopback listener for local readers.
        let tcp = TcpListener::bind(("127.0.0.1", config.port)).await?;
        info!("listening for readers on 127.0.0.1:{}", config.port);
        {
            let server = server.clone();
            let id = id.clone();
            let pubkey = key.public_key();
            tokio::spawn(async move {
                loop {
                    match tcp.accept().await {
                        Ok((stream, addr)) => {
                            debug!("reader session from {addr}");
                            let server = server.clone();
                            let session = Session::tcp(&id, pubkey);
                            tokio::spawn(async move { server.process(stream, session).await });
                        }
                        Err(err) => warn!("tcp accept failed: {err}"),
                    }
                }
            });
        }

        // Overlay listener: handshake gated on the peers table, then an NNTP
        // session bound to the proven remote identity.
        let onion = tc.listen(OVERLAY_PORT, &key).await?;
        {
            let server = server.clone();
            let store = store.clone();
            let my_key = key.clone();
            tokio::spawn(async move {
                loop {
                    let mut stream = match onion.accept().await {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!("overlay accept failed: {err}");
                            continue;
                        }
                    };
                    let server = server.clone();
                    let store = store.clone();
                    let my_key = my_key.clone();
                    tokio::spawn(async move {
                        let auth_store = store.clone();
                        let handshake = server_handshake(&mut stream, &my_key, |pubkey| {
                            let store = auth_store.clone();
                            async move {
                                let id = onion_from_pubkey(&pubkey);
                                store
                                    .get_peer_list()
                                    .await
                                    .map(|peers| peers.contains(&id))
                                    .unwrap_or(false)
                            }
                        })
                        .await;
                        match handshake {
                            Ok(peer_pubkey) => {
                                let peer_id = onion_from_pubkey(&peer_pubkey);
                                info!("peer session from {peer_id}");
                                let session = Session::peer(&peer_id, peer_pubkey);
                                server.process(stream, session).await;
                                debug!("peer session from {peer_id} ended");
                            }
                            Err(err) => {
                                let err = Error::with(ErrorKind::HandshakeFailed, err);
                                info!("inbound session rejected: {err}");
                            }
                        }
                    });
                }
            });
        }

        // In-process pipe session driving the node's own client.
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        {
            let server = server.clone();
            let session = Session::local(&id, key.public_key());
            tokio::spawn(async move { server.process(server_end, session).await });
        }
        let mut client = Client::connect(client_end).await?;
        client.authenticate("local", "local").await?;

        Ok(Node { store, peers, key, id, idgen, client: Mutex::new(client) })
    }

    /// This node's onion id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Create `<self>.<name>` with open read/reply/post defaults.
    pub async fn create_group(
        &self,
        name: &str,
        description: &str,
        posting: PostingStatus,
    ) -> Result<(), NodeError> {
        let perms = [PermEntry {
            torid: "group".to_string(),
            perms: GroupPermissions { read: true, reply: true, post: true, cancel: false, supersede: false },
        }];
        let wire = control::create_newsgroup_mail(
            &self.key,
            self.idgen.as_ref(),
            name,
            description,
            posting,
            &perms,
        )?;
        self.post_wire(&wire).await
    }

    /// Establish peering with `torid`: creates the pair-group and starts the
    /// outbound worker.
    pub async fn add_peer(&self, torid: &str) -> Result<(), NodeError> {
        let wire = control::create_peer_group_mail(&self.key, self.idgen.as_ref(), torid)?;
        self.post_wire(&wire).await
    }

    /// Tell `torid` which groups to feed us.
    pub async fn send_subscriptions(
        &self,
        torid: &str,
        subscriptions: &[String],
        control_messages: bool,
        feed: &[String],
    ) -> Result<(), NodeError> {
        let wire = control::create_sendme_mail(
            &self.key,
            self.idgen.as_ref(),
            torid,
            subscriptions,
            control_messages,
            feed,
        )?;
        self.post_wire(&wire).await
    }

    /// Stamp a message-id, sign and post a locally composed article.
    pub async fn post(&self, msg: &mut Message) -> Result<(), NodeError> {
        msg.headers.set("Message-Id", self.idgen.gen_id());
        let wire = msg.sign(&self.key)?;
        self.post_wire(&wire).await
    }

    async fn post_wire(&self, wire: &str) -> Result<(), NodeError> {
        let mut client = self.client.lock().await;
        client.post(wire).await?;
        Ok(())
    }

    pub async fn config_set(&self, key: &str, val: impl Into<store::ConfigValue>) -> Result<(), NodeError> {
        Ok(self.store.config_set(key, val).await?)
    }

    pub async fn config_get_string(&self, key: &str) -> Result<String, NodeError> {
        Ok(self.store.config_get_string(key).await?)
    }

    pub async fn config_get_i64(&self, key: &str) -> Result<i64, NodeError> {
        Ok(self.store.config_get_i64(key).await?)
    }
}

/// Load the device key, generating and persisting it on first start.
async fn load_or_create_identity(store: &Store) -> Result<NodeKey, NodeError> {
    match store.config_get_bytes(DEVICE_KEY).await {
        Ok(bytes) => {
            let bytes: [u8; 64] =
                bytes.as_slice().try_into().map_err(|_| NodeError::BadDeviceKey)?;
            Ok(NodeKey::from_onion_private(&bytes))
        }
        Err(StoreError::NotFound) => {
            let key = NodeKey::generate();
            store.config_set(DEVICE_KEY, key.onion_private_bytes()?.to_vec()).await?;
            info!("generated device key for {}", key.node_id());
            Ok(key)
        }
        Err(err) => Err(err.into()),
    }
}
