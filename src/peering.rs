//! Peering engine: a supervisor task plus one long-lived worker per peer.
//!
//! Each worker owns its outbound connection. A five-second tick drives
//! reconnection and feed progress; commands from the supervisor (distribute
//! nudges, subscription updates, exit) arrive on a bounded queue. Articles
//! flow to a peer strictly in store-id order from the peer's cursor, with
//! loop suppression and permission/subscription filtering applied before
//! every send. The cursor only moves forward.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_socks::tcp::Socks5Stream;

use crate::keys::NodeKey;
use crate::message::Message;
use crate::nntp::Client;
use crate::store::{Store, StoreError};
use crate::transport::{client_handshake, TorCon};

const TICK: Duration = Duration::from_secs(5);
const QUEUE_DEPTH: usize = 10;

/// Pair-group config key holding the peer's feed cursor.
const LAST_MESSAGE: &str = "LastMessage";

#[derive(Debug, Error)]
pub enum PeeringError {
    #[error("refusing to peer with this node itself")]
    SelfPeer,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("peering task is gone")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── Supervisor ───────────────────────────────────────────────────────────────

enum PeersCommand {
    Connect,
    AddPeer { torid: String, reply: oneshot::Sender<Result<(), PeeringError>> },
    RemovePeer { torid: String, reply: oneshot::Sender<Result<(), PeeringError>> },
    Distribute(Box<Message>),
    Sendme {
        torid: String,
        list: Vec<String>,
        options: Vec<(String, String)>,
        reply: oneshot::Sender<Result<(), PeeringError>>,
    },
    Exit,
}

/// Clonable handle to the peering supervisor.
#[derive(Clone)]
pub struct Peers {
    tx: mpsc::Sender<PeersCommand>,
}

impl Peers {
    pub fn spawn(tc: TorCon, my_key: NodeKey, store: Store) -> Peers {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = PeersTask { tc, my_key, store, workers: HashMap::new() };
        tokio::spawn(task.run(rx));
        Peers { tx }
    }

    /// Spawn a worker for every peer row; called once at startup.
    pub async fn connect(&self) -> Result<(), PeeringError> {
        self.tx.send(PeersCommand::Connect).await.map_err(|_| PeeringError::Closed)
    }

    /// Start a worker for a peer whose store row already exists.
    pub async fn add_peer(&self, torid: &str) -> Result<(), PeeringError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PeersCommand::AddPeer { torid: torid.to_string(), reply })
            .await
            .map_err(|_| PeeringError::Closed)?;
        rx.await.map_err(|_| PeeringError::Closed)?
    }

    /// Stop the worker and delete the peer row.
    pub async fn remove_peer(&self, torid: &str) -> Result<(), PeeringError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PeersCommand::RemovePeer { torid: torid.to_string(), reply })
            .await
            .map_err(|_| PeeringError::Closed)?;
        rx.await.map_err(|_| PeeringError::Closed)?
    }

    /// Nudge every worker to feed a freshly stored article.
    pub async fn distribute(&self, msg: &Message) -> Result<(), PeeringError> {
        self.tx
            .send(PeersCommand::Distribute(Box::new(msg.clone())))
            .await
            .map_err(|_| PeeringError::Closed)
    }

    /// Forward a subscription update to one worker.
    pub async fn sendme(
        &self,
        torid: &str,
        list: Vec<String>,
        options: Vec<(String, String)>,
    ) -> Result<(), PeeringError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PeersCommand::Sendme { torid: torid.to_string(), list, options, reply })
            .await
            .map_err(|_| PeeringError::Closed)?;
        rx.await.map_err(|_| PeeringError::Closed)?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(PeersCommand::Exit).await;
    }
}

struct PeersTask {
    tc: TorCon,
    my_key: NodeKey,
    store: Store,
    workers: HashMap<String, mpsc::Sender<PeerCommand>>,
}

impl PeersTask {
    async fn run(mut self, mut rx: mpsc::Receiver<PeersCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                PeersCommand::Connect => match self.store.get_peer_list().await {
                    Ok(peers) => {
                        for torid in peers {
                            self.spawn_worker(&torid);
                        }
                    }
                    Err(err) => warn!("cannot load peer list: {err}"),
                },
                PeersCommand::AddPeer { torid, reply } => {
                    let _ = reply.send(self.add_peer(&torid));
                }
                PeersCommand::RemovePeer { torid, reply } => {
                    let _ = reply.send(self.remove_peer(&torid).await);
                }
                PeersCommand::Distribute(msg) => {
                    debug!(
                        "distributing {} to {} workers",
                        msg.headers.get("Message-Id").unwrap_or("<?>"),
                        self.workers.len(),
                    );
                    for worker in self.workers.values() {
                        // A full queue means the worker is already busy
                        // feeding; the tick will pick the article up.
                        let _ = worker.try_send(PeerCommand::Wake);
                    }
                }
                PeersCommand::Sendme { torid, list, options, reply } => {
                    let result = match self.workers.get(&torid) {
                        Some(worker) => worker
                            .send(PeerCommand::Sendme { list, options })
                            .await
                            .map_err(|_| PeeringError::Closed),
                        None => Err(PeeringError::UnknownPeer(torid)),
                    };
                    let _ = reply.send(result);
                }
                PeersCommand::Exit => break,
            }
        }
        for (_, worker) in self.workers.drain() {
            let _ = worker.send(PeerCommand::Exit).await;
        }
    }

    fn add_peer(&mut self, torid: &str) -> Result<(), PeeringError> {
        if torid == self.my_key.node_id() {
            return Err(PeeringError::SelfPeer);
        }
        if !self.workers.contains_key(torid) {
            self.spawn_worker(torid);
        }
        Ok(())
    }

    async fn remove_peer(&mut self, torid: &str) -> Result<(), PeeringError> {
        if let Some(worker) = self.workers.remove(torid) {
            let _ = worker.send(PeerCommand::Exit).await;
        }
        self.store.remove_peer_row(torid).await?;
        Ok(())
    }

    fn spawn_worker(&mut self, torid: &str) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let my_id = self.my_key.node_id();
        let worker = PeerWorker {
            tc: self.tc.clone(),
            store: self.store.clone(),
            my_key: self.my_key.clone(),
            peer_id: torid.to_string(),
            group_name: format!("{my_id}.peers.{torid}"),
            client: None,
        };
        tokio::spawn(worker.run(rx));
        self.workers.insert(torid.to_string(), tx);
        info!("peer worker started for {torid}");
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

enum PeerCommand {
    Wake,
    Sendme { list: Vec<String>, options: Vec<(String, String)> },
    Exit,
}

type PeerStream = Socks5Stream<TcpStream>;

struct PeerWorker {
    tc: TorCon,
    store: Store,
    my_key: NodeKey,
    peer_id: String,
    group_name: String,
    client: Option<Client<PeerStream>>,
}

impl PeerWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<PeerCommand>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(PeerCommand::Exit) => {
                        info!("peer worker for {} exiting", self.peer_id);
                        return;
                    }
                    Some(PeerCommand::Wake) => (),
                    Some(PeerCommand::Sendme { list, options }) => {
                        self.apply_sendme(list, options).await;
                    }
                },
                _ = tick.tick() => (),
            }
            self.connect().await;
            self.feed().await;
        }
    }

    async fn apply_sendme(&mut self, list: Vec<String>, options: Vec<(String, String)>) {
        for (key, val) in options {
            match key.as_str() {
                "ControlMessages" | "Feed" => {
                    if let Err(err) = self.store.group_config_set(&self.group_name, &key, val.as_str()).await {
                        warn!("sendme config {key} failed for {}: {err}", self.group_name);
                    }
                }
                other => debug!("ignoring newsfeed option {other}"),
            }
        }
        if let Err(err) = self.store.group_update_subscriptions(&self.group_name, list).await {
            warn!("sendme subscriptions failed for {}: {err}", self.group_name);
        }
    }

    async fn connect(&mut self) {
        if self.client.is_some() {
            return;
        }
        let addr = format!("{}.onion:119", self.peer_id);
        let mut stream = match self.tc.dial(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("dial {addr} failed: {err}");
                return;
            }
        };
        if let Err(err) = client_handshake(&mut stream, &self.my_key, &self.peer_id).await {
            info!("handshake with {} failed: {err}", self.peer_id);
            return;
        }
        let mut client = match Client::connect(stream).await {
            Ok(client) => client,
            Err(err) => {
                info!("nntp greeting from {} failed: {err}", self.peer_id);
                return;
            }
        };
        // Placeholder credentials: the overlay handshake is the real auth.
        if let Err(err) = client.authenticate("peer", "peer").await {
            info!("nntp auth with {} failed: {err}", self.peer_id);
            return;
        }
        info!("connected to peer {}", self.peer_id);
        self.client = Some(client);
    }

    /// Drain the feed while connected: send every article past the cursor
    /// that survives filtering, advancing the cursor after each one.
    async fn feed(&mut self) {
        while self.client.is_some() {
            let Some((num, msg)) = self.next_sendable().await else { return };
            let client = self.client.as_mut().expect("connection checked by loop");
            match client.post(&msg.to_wire()).await {
                Ok(()) => self.advance(num).await,
                Err(err) if err.is_transport() => {
                    info!("post to {} failed, will reconnect: {err}", self.peer_id);
                    self.client = None;
                }
                Err(err) => {
                    // The peer refused the article (typically a duplicate);
                    // it will not want this one again.
                    debug!("peer {} rejected article {num}: {err}", self.peer_id);
                    self.advance(num).await;
                }
            }
        }
    }

    /// Walk from the cursor to the first article this peer should receive.
    /// Filtered articles advance the cursor immediately; the returned one
    /// does not, so a transport failure retries it.
    async fn next_sendable(&mut self) -> Option<(i64, Message)> {
        loop {
            let last = match self.store.group_config_get_i64(&self.group_name, LAST_MESSAGE).await {
                Ok(last) => last,
                Err(err) => {
                    warn!("no feed cursor for {}: {err}", self.group_name);
                    return None;
                }
            };
            let (num, article) = match self.store.get_next_article(last).await {
                Ok(Some(next)) => next,
                Ok(None) => return None,
                Err(err) => {
                    warn!("feed lookup after {last} failed: {err}");
                    return None;
                }
            };
            let msg = match Message::from_headers_body(article.headers.clone(), &article.body) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("stored article {num} does not parse: {err}");
                    self.advance(num).await;
                    continue;
                }
            };

            if self.path_contains_peer(&msg) {
                self.advance(num).await;
                continue;
            }
            if !self.peer_can_read(&msg).await {
                self.advance(num).await;
                continue;
            }
            if !self.subscribed(&msg).await {
                self.advance(num).await;
                continue;
            }
            return Some((num, msg));
        }
    }

    async fn advance(&self, num: i64) {
        if let Err(err) = self.store.group_config_set(&self.group_name, LAST_MESSAGE, num).await {
            warn!("failed to advance cursor for {}: {err}", self.group_name);
        }
    }

    /// Loop suppression: never send an article back along its Path.
    fn path_contains_peer(&self, msg: &Message) -> bool {
        msg.headers
            .get("Path")
            .map(|path| path.split('!').any(|hop| hop == self.peer_id))
            .unwrap_or(false)
    }

    async fn peer_can_read(&self, msg: &Message) -> bool {
        for group in msg.newsgroups() {
            if let Some(perms) = self.store.get_perms(&self.peer_id, &group).await {
                if perms.read {
                    return true;
                }
            }
        }
        false
    }

    /// Subscription filter. An empty set means the peer has not sent a
    /// `sendme` yet and receives everything it can read.
    async fn subscribed(&self, msg: &Message) -> bool {
        let subs = match self.store.group_subscriptions(&self.group_name).await {
            Ok(subs) => subs,
            Err(_) => return true,
        };
        if subs.is_empty() {
            return true;
        }
        let groups = msg.newsgroups();
        subs.iter().any(|sub| groups.iter().any(|group| group == sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupPermissions, PermEntry};

    fn readable_perms() -> Vec<PermEntry> {
        vec![PermEntry {
            torid: "group".into(),
            perms: GroupPermissions { read: true, reply: true, post: true, cancel: false, supersede: false },
        }]
    }

    fn unreadable_perms() -> Vec<PermEntry> {
        vec![PermEntry { torid: "group".into(), perms: GroupPermissions::default() }]
    }

    struct Rig {
        worker: PeerWorker,
        store: Store,
        my_key: NodeKey,
        _dir: tempfile::TempDir,
    }

    /// A worker wired to a real store and a never-connecting transport.
    async fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let my_key = NodeKey::generate();
        let peer_id = NodeKey::generate().node_id();
        let group_name = format!("{}.peers.{}", my_key.node_id(), peer_id);

        store.new_group(&group_name, "peering", "n", readable_perms()).await.unwrap();
        store.group_config_set(&group_name, LAST_MESSAGE, 0i64).await.unwrap();

        let worker = PeerWorker {
            tc: TorCon::new("127.0.0.1:1", "127.0.0.1:1"),
            store: store.clone(),
            my_key: my_key.clone(),
            peer_id,
            group_name,
            client: None,
        };
        Rig { worker, store, my_key, _dir: dir }
    }

    async fn post_article(rig: &Rig, groups: &str, msgid: &str, path: Option<&str>) -> i64 {
        let mut msg = Message::new();
        msg.headers.set("Newsgroups", groups);
        msg.headers.set("Subject", "feed test");
        msg.headers.set("Message-Id", msgid);
        if let Some(path) = path {
            msg.headers.set("Path", path);
        }
        msg.preamble = "body".into();
        msg.sign(&rig.my_key).unwrap();
        let id = rig.store.store_article(&msg).await.unwrap();
        for group in msg.newsgroups() {
            let _ = rig.store.add_article_to_group(&group, msgid, id).await;
        }
        id
    }

    async fn cursor(rig: &Rig) -> i64 {
        rig.store.group_config_get_i64(&rig.worker.group_name, LAST_MESSAGE).await.unwrap()
    }

    #[tokio::test]
    async fn loop_suppression_skips_and_advances() {
        let mut r = rig().await;
        let my_id = r.my_key.node_id();
        let readable = format!("{my_id}.open");
        r.store.new_group(&readable, "", "y", readable_perms()).await.unwrap();

        // Path already contains the peer: must never be sent, cursor moves on.
        let peer_id = r.worker.peer_id.clone();
        let id = post_article(&r, &readable, "<looped@x>", Some(&format!("{peer_id}!{my_id}!.POSTED"))).await;

        assert!(r.worker.next_sendable().await.is_none());
        assert_eq!(cursor(&r).await, id);
    }

    #[tokio::test]
    async fn unreadable_articles_are_skipped() {
        let mut r = rig().await;
        let my_id = r.my_key.node_id();
        let hidden = format!("{my_id}.hidden");
        r.store.new_group(&hidden, "", "y", unreadable_perms()).await.unwrap();

        let id = post_article(&r, &hidden, "<secret@x>", Some(&format!("{my_id}!.POSTED"))).await;
        assert!(r.worker.next_sendable().await.is_none());
        assert_eq!(cursor(&r).await, id);
    }

    #[tokio::test]
    async fn sendable_article_is_returned_without_advancing() {
        let mut r = rig().await;
        let my_id = r.my_key.node_id();
        let open = format!("{my_id}.open");
        r.store.new_group(&open, "", "y", readable_perms()).await.unwrap();

        let id = post_article(&r, &open, "<fresh@x>", Some(&format!("{my_id}!.POSTED"))).await;

        let (num, msg) = r.worker.next_sendable().await.expect("article should be sendable");
        assert_eq!(num, id);
        assert_eq!(msg.headers.get("Message-Id"), Some("<fresh@x>"));
        // Not sent yet, so the cursor must not have moved: at-least-once.
        assert_eq!(cursor(&r).await, 0);

        // Repeated calls yield the same article until the send succeeds.
        let (again, _) = r.worker.next_sendable().await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn subscription_filter_applies_when_nonempty() {
        let mut r = rig().await;
        let my_id = r.my_key.node_id();
        let wanted = format!("{my_id}.wanted");
        let unwanted = format!("{my_id}.unwanted");
        r.store.new_group(&wanted, "", "y", readable_perms()).await.unwrap();
        r.store.new_group(&unwanted, "", "y", readable_perms()).await.unwrap();

        r.worker
            .apply_sendme(vec![wanted.clone()], vec![("ControlMessages".into(), "true".into())])
            .await;

        let skipped = post_article(&r, &unwanted, "<skip@x>", Some(&format!("{my_id}!.POSTED"))).await;
        let sent = post_article(&r, &wanted, "<want@x>", Some(&format!("{my_id}!.POSTED"))).await;

        let (num, _) = r.worker.next_sendable().await.expect("subscribed article comes through");
        assert_eq!(num, sent);
        // The unsubscribed article was passed over and the cursor recorded it.
        assert!(cursor(&r).await >= skipped);
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let mut r = rig().await;
        let my_id = r.my_key.node_id();
        let open = format!("{my_id}.open");
        r.store.new_group(&open, "", "y", unreadable_perms()).await.unwrap();

        let mut highest = 0;
        for n in 0..4 {
            let id = post_article(&r, &open, &format!("<m{n}@x>"), Some(&format!("{my_id}!.POSTED"))).await;
            assert!(r.worker.next_sendable().await.is_none());
            let now = cursor(&r).await;
            assert!(now >= highest, "cursor moved backwards: {now} < {highest}");
            assert_eq!(now, id);
            highest = now;
        }
    }

    #[tokio::test]
    async fn supervisor_rejects_self_peering() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let my_key = NodeKey::generate();
        let my_id = my_key.node_id();
        let peers = Peers::spawn(TorCon::new("127.0.0.1:1", "127.0.0.1:1"), my_key, store);

        assert!(matches!(peers.add_peer(&my_id).await, Err(PeeringError::SelfPeer)));

        let other = NodeKey::generate().node_id();
        peers.add_peer(&other).await.unwrap();
        // Sendme for an unknown peer is an error; for a known one it lands.
        assert!(matches!(
            peers.sendme("unknownpeer", vec![], vec![]).await,
            Err(PeeringError::UnknownPeer(_))
        ));
        peers.shutdown().await;
    }
}
