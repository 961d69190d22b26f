//! Session facade: the NNTP backend the server loop drives.
//!
//! Every connection is classified by how it was established (the in-process
//! pipe, plain loopback TCP, or an authenticated overlay stream) and carries
//! the connected identity's node id. The facade enforces permissions, signs
//! and verifies articles, stamps the Path header and routes accepted posts
//! through the control interpreter, the store and the peering engine.

use ed25519_dalek::VerifyingKey;
use log::{info, warn};

use crate::control::{apply_control, ControlHandlers};
use crate::error::{Error, ErrorKind};
use crate::keys::NodeKey;
use crate::message::{date_now, Message, SIGNATURE_HEADER};
use crate::nntp::{Article, Backend, Group};
use crate::peering::Peers;
use crate::store::{Store, StoreError};

/// How a session reached this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// In-process pipe from this node's own client.
    Local,
    /// Plain loopback TCP reader.
    Tcp,
    /// Arrived over the overlay, mutually authenticated.
    Peer,
}

/// Typed per-connection state handed to every backend call.
#[derive(Debug, Clone)]
pub struct Session {
    /// Node id of the connected identity: self for Local/Tcp, the remote
    /// peer for Peer sessions.
    pub id: String,
    pub pubkey: Option<VerifyingKey>,
    pub mode: ConnMode,
    pub authenticated: bool,
}

impl Session {
    pub fn local(id: &str, pubkey: VerifyingKey) -> Session {
        Session { id: id.to_string(), pubkey: Some(pubkey), mode: ConnMode::Local, authenticated: false }
    }

    pub fn tcp(id: &str, pubkey: VerifyingKey) -> Session {
        Session { id: id.to_string(), pubkey: Some(pubkey), mode: ConnMode::Tcp, authenticated: false }
    }

    pub fn peer(id: &str, pubkey: VerifyingKey) -> Session {
        Session { id: id.to_string(), pubkey: Some(pubkey), mode: ConnMode::Peer, authenticated: false }
    }
}

/// The node's NNTP backend.
pub struct NntpBackend {
    store: Store,
    peers: Peers,
    my_key: NodeKey,
    my_id: String,
}

impl NntpBackend {
    pub fn new(store: Store, peers: Peers, my_key: NodeKey) -> NntpBackend {
        let my_id = my_key.node_id();
        NntpBackend { store, peers, my_key, my_id }
    }

    fn handlers(&self) -> ControlHandlers {
        ControlHandlers {
            store: self.store.clone(),
            peers: self.peers.clone(),
            my_id: self.my_id.clone(),
        }
    }

    async fn require_read(&self, session: &Session, group: &str) -> Result<(), Error> {
        match self.store.get_perms(&session.id, group).await {
            Some(perms) if perms.read => Ok(()),
            _ => Err(Error::new(ErrorKind::InvalidArticleNumber)),
        }
    }

    async fn handle_post(&self, session: &Session, article: Article) -> Result<(), Error> {
        let mut msg = Message::from_headers_body(article.headers.clone(), &article.body)
            .map_err(|err| Error::with(ErrorKind::PostingFailed, err))?;

        // Articles from local readers get signed here, once, with the node's
        // identity; articles from peers must already carry a signature.
        if matches!(session.mode, ConnMode::Local | ConnMode::Tcp)
            && msg.headers.get(SIGNATURE_HEADER).is_none()
        {
            if msg.headers.get("Date").is_none() {
                msg.headers.set("Date", date_now());
            }
            msg.sign(&self.my_key).map_err(|err| Error::with(ErrorKind::PostingFailed, err))?;
        }

        if !msg.verify() {
            return Err(Error::new(ErrorKind::PostingNotPermitted));
        }

        let path = msg.headers.get("Path").unwrap_or("").to_string();
        let stamped = match (session.mode, path.is_empty()) {
            (ConnMode::Local | ConnMode::Tcp, true) => format!("{}!.POSTED", self.my_id),
            (ConnMode::Local | ConnMode::Tcp, false) => format!("{}!.POSTED!{path}", self.my_id),
            (ConnMode::Peer, true) => {
                return Err(Error::with(
                    ErrorKind::PostingNotPermitted,
                    "peer article arrived without a Path header",
                ))
            }
            (ConnMode::Peer, false) => format!("{}!{path}", self.my_id),
        };
        msg.headers.set("Path", stamped);

        if let Err(err) = apply_control(&msg, &self.handlers()).await {
            let err = Error::with(ErrorKind::ControlFailed, err);
            info!("control handling failed: {err}");
            return Err(err.surface_as(ErrorKind::PostingFailed));
        }

        // Groups named in the article that exist here and accept posts from
        // this identity.
        let mut postable = Vec::new();
        for group in msg.newsgroups() {
            match self.store.get_perms(&session.id, &group).await {
                Some(perms) if perms.post => (),
                _ => continue,
            }
            match self.store.get_group_number(&group).await {
                Ok(id) if id != 0 => postable.push(group),
                _ => continue,
            }
        }
        if postable.is_empty() {
            return Err(Error::new(ErrorKind::PostingFailed));
        }

        let msgid = msg.headers.get("Message-Id").unwrap_or_default().to_string();
        let article_id = match self.store.store_article(&msg).await {
            Ok(id) => id,
            Err(StoreError::AlreadyExists) => return Err(Error::new(ErrorKind::AlreadyExists)),
            Err(err) => return Err(Error::with(ErrorKind::PostingFailed, err)),
        };
        for group in &postable {
            if let Err(err) = self.store.add_article_to_group(group, &msgid, article_id).await {
                warn!("indexing {msgid} into {group} failed: {err}");
                return Err(Error::with(ErrorKind::PostingFailed, err));
            }
        }

        if let Err(err) = self.peers.distribute(&msg).await {
            warn!("distributing {msgid} failed: {err}");
        }
        info!("accepted post {msgid} into {}", postable.join(","));
        Ok(())
    }
}

impl Backend for NntpBackend {
    async fn list_groups(&self, session: &Session) -> Result<Vec<Group>, Error> {
        self.store.list_groups(&session.id).await.map_err(|err| {
            Error::with(ErrorKind::Internal, err).surface_as(ErrorKind::InvalidArticleNumber)
        })
    }

    async fn get_group(&self, session: &Session, name: &str) -> Result<Group, Error> {
        match self.store.get_group(&session.id, name).await {
            Ok(group) => Ok(group),
            Err(StoreError::NotFound) => Err(Error::new(ErrorKind::NoSuchGroup)),
            Err(err) => Err(Error::with(ErrorKind::NoSuchGroup, err)),
        }
    }

    async fn get_article(
        &self,
        session: &Session,
        group: Option<&str>,
        id: &str,
    ) -> Result<Article, Error> {
        if let Some(group) = group {
            self.require_read(session, group).await?;
        }
        match self.store.get_article_by_id(id).await {
            Ok(article) => Ok(article),
            Err(StoreError::NotFound) => Err(Error::new(ErrorKind::InvalidArticleNumber)),
            Err(err) => Err(Error::with(ErrorKind::InvalidArticleNumber, err)),
        }
    }

    async fn list_article_numbers(
        &self,
        session: &Session,
        group: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<i64>, Error> {
        self.require_read(session, group).await?;
        self.store
            .list_articles(group, from, to)
            .await
            .map_err(|err| Error::with(ErrorKind::InvalidArticleNumber, err))
    }

    async fn authenticate(&self, _session: &Session, _user: &str, _pass: &str) -> Result<bool, Error> {
        // Placeholder credentials: locality or the overlay handshake already
        // authenticated the connection.
        Ok(true)
    }

    fn allow_post(&self, _session: &Session) -> bool {
        true
    }

    async fn post(&self, session: &Session, article: Article) -> Result<(), Error> {
        self.handle_post(session, article).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{create_newsgroup_mail, create_peer_group_mail};
    use crate::nntp::{IdGenerator, NodeIdGen, PostingStatus};
    use crate::store::{GroupPermissions, PermEntry, DEVICE_KEY};
    use crate::transport::TorCon;

    struct Rig {
        backend: NntpBackend,
        store: Store,
        key: NodeKey,
        my_id: String,
        idgen: NodeIdGen,
        _dir: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let key = NodeKey::generate();
        let my_id = key.node_id();
        store
            .config_set(DEVICE_KEY, key.onion_private_bytes().unwrap().to_vec())
            .await
            .unwrap();
        let peers = Peers::spawn(TorCon::new("127.0.0.1:1", "127.0.0.1:1"), key.clone(), store.clone());
        let backend = NntpBackend::new(store.clone(), peers, key.clone());
        let idgen = NodeIdGen { node_name: my_id.clone() };
        Rig { backend, store, key, my_id, idgen, _dir: dir }
    }

    fn local_session(rig: &Rig) -> Session {
        let mut session = Session::local(&rig.my_id, rig.key.public_key());
        session.authenticated = true;
        session
    }

    fn default_perms() -> Vec<PermEntry> {
        vec![PermEntry {
            torid: "group".into(),
            perms: GroupPermissions { read: true, reply: true, post: true, cancel: false, supersede: false },
        }]
    }

    async fn create_group(rig: &Rig, name: &str) -> String {
        let wire = create_newsgroup_mail(&rig.key, &rig.idgen, name, "a test group", PostingStatus::Permitted, &default_perms())
            .unwrap();
        rig.backend
            .post(&local_session(rig), Article::parse(&wire).unwrap())
            .await
            .unwrap();
        format!("{}.{name}", rig.my_id)
    }

    #[tokio::test]
    async fn newsgroup_control_creates_listable_group() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;
        let session = local_session(&r);

        let groups = r.backend.list_groups(&session).await.unwrap();
        assert!(groups.iter().any(|g| g.name == group));

        let stats = r.backend.get_group(&session, &group).await.unwrap();
        assert_eq!((stats.count, stats.low, stats.high), (1, 1, 1));
        assert_eq!(stats.posting, PostingStatus::Permitted);
        assert_eq!(stats.description, "a test group");
    }

    #[tokio::test]
    async fn local_post_is_signed_and_path_stamped() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;
        let session = local_session(&r);

        let mut headers = crate::message::Headers::new();
        headers.set("Newsgroups", &group);
        headers.set("Subject", "first post");
        headers.set("Message-Id", r.idgen.gen_id());
        let unsigned = Article { headers, body: "hello federation\r\n".into() };
        r.backend.post(&session, unsigned).await.unwrap();

        let stats = r.backend.get_group(&session, &group).await.unwrap();
        assert_eq!(stats.count, 2);

        let fetched = r.backend.get_article(&session, Some(&group), &stats.high.to_string()).await.unwrap();
        assert_eq!(fetched.headers.get("From"), Some(r.my_id.as_str()));
        assert!(fetched.headers.get(SIGNATURE_HEADER).is_some());
        assert!(fetched
            .headers
            .get("Path")
            .unwrap()
            .starts_with(&format!("{}!.POSTED", r.my_id)));

        let msg = Message::from_headers_body(fetched.headers.clone(), &fetched.body).unwrap();
        assert!(msg.verify());
    }

    #[tokio::test]
    async fn peer_post_without_path_is_rejected() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;

        let peer_key = NodeKey::generate();
        let mut session = Session::peer(&peer_key.node_id(), peer_key.public_key());
        session.authenticated = true;

        let mut msg = Message::new();
        msg.headers.set("Newsgroups", &group);
        msg.headers.set("Subject", "from a peer");
        msg.headers.set("Message-Id", r.idgen.gen_id());
        let wire = msg.sign(&peer_key).unwrap();

        let err = r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PostingNotPermitted);
    }

    #[tokio::test]
    async fn peer_post_gets_path_prefixed() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;

        let peer_key = NodeKey::generate();
        let peer_id = peer_key.node_id();
        let mut session = Session::peer(&peer_id, peer_key.public_key());
        session.authenticated = true;

        let mut msg = Message::new();
        msg.headers.set("Newsgroups", &group);
        msg.headers.set("Subject", "fed across");
        msg.headers.set("Message-Id", "<fed-1@x>");
        msg.headers.set("Path", format!("{peer_id}!.POSTED"));
        let wire = msg.sign(&peer_key).unwrap();

        r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap();

        let reader = local_session(&r);
        let fetched = r.backend.get_article(&reader, None, "<fed-1@x>").await.unwrap();
        assert_eq!(
            fetched.headers.get("Path"),
            Some(format!("{}!{peer_id}!.POSTED", r.my_id).as_str())
        );
    }

    #[tokio::test]
    async fn tampered_article_is_not_permitted() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;
        let session = local_session(&r);

        let mut msg = Message::new();
        msg.headers.set("Newsgroups", &group);
        msg.headers.set("Subject", "pristine");
        msg.headers.set("Message-Id", r.idgen.gen_id());
        let wire = msg.sign(&r.key).unwrap();
        let tampered = wire.replace("pristine", "defaced");

        let err = r.backend.post(&session, Article::parse(&tampered).unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PostingNotPermitted);
    }

    #[tokio::test]
    async fn post_to_unknown_group_fails() {
        let r = rig().await;
        let session = local_session(&r);

        let mut headers = crate::message::Headers::new();
        headers.set("Newsgroups", "no.such.group");
        headers.set("Subject", "lost");
        headers.set("Message-Id", r.idgen.gen_id());
        let err = r
            .backend
            .post(&session, Article { headers, body: String::new() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PostingFailed);
    }

    #[tokio::test]
    async fn duplicate_post_reports_already_exists() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;
        let session = local_session(&r);

        let mut msg = Message::new();
        msg.headers.set("Newsgroups", &group);
        msg.headers.set("Subject", "one of a kind");
        msg.headers.set("Message-Id", "<unique@x>");
        let wire = msg.sign(&r.key).unwrap();

        r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap();
        let err = r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn cancel_control_removes_article() {
        let r = rig().await;
        let group = create_group(&r, "test.alpha").await;
        let session = local_session(&r);

        let mut msg = Message::new();
        msg.headers.set("Newsgroups", &group);
        msg.headers.set("Subject", "short lived");
        msg.headers.set("Message-Id", "<doomed@x>");
        let wire = msg.sign(&r.key).unwrap();
        r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap();
        assert!(r.backend.get_article(&session, None, "<doomed@x>").await.is_ok());

        let mut cancel = Message::new();
        cancel.headers.set("Newsgroups", &group);
        cancel.headers.set("Subject", "cmsg cancel <doomed@x>");
        cancel.headers.set("Control", "cancel <doomed@x>");
        cancel.headers.set("Message-Id", r.idgen.gen_id());
        let wire = cancel.sign(&r.key).unwrap();
        r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap();

        let err = r.backend.get_article(&session, None, "<doomed@x>").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArticleNumber);
    }

    #[tokio::test]
    async fn peer_group_control_persists_peer_and_cursor() {
        let r = rig().await;
        let session = local_session(&r);
        let peer_id = NodeKey::generate().node_id();

        let wire = create_peer_group_mail(&r.key, &r.idgen, &peer_id).unwrap();
        r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap();

        assert_eq!(r.store.get_peer_list().await.unwrap(), vec![peer_id.clone()]);
        let pair_group = format!("{}.peers.{peer_id}", r.my_id);
        assert_eq!(r.store.group_config_get_i64(&pair_group, "LastMessage").await.unwrap(), 0);

        // The peer itself may read its pair-group; a stranger may not.
        let peer_perms = r.store.get_perms(&peer_id, &pair_group).await.unwrap();
        assert!(peer_perms.read && peer_perms.post);
        let stranger = r.store.get_perms("stranger", &pair_group).await.unwrap();
        assert!(!stranger.read);
    }

    #[tokio::test]
    async fn groups_invisible_without_read_permission() {
        let r = rig().await;
        let session = local_session(&r);

        // A locked-down group: default gives nothing.
        let wire = create_newsgroup_mail(
            &r.key,
            &r.idgen,
            "test.closed",
            "members only",
            PostingStatus::Permitted,
            &[PermEntry { torid: "group".into(), perms: GroupPermissions::default() }],
        )
        .unwrap();
        r.backend.post(&session, Article::parse(&wire).unwrap()).await.unwrap();
        let group = format!("{}.test.closed", r.my_id);

        // The owner still sees it.
        assert!(r.backend.get_group(&session, &group).await.is_ok());

        // A stranger does not.
        let stranger_key = NodeKey::generate();
        let mut stranger = Session::peer(&stranger_key.node_id(), stranger_key.public_key());
        stranger.authenticated = true;
        let err = r.backend.get_group(&stranger, &group).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchGroup);
        let listed = r.backend.list_groups(&stranger).await.unwrap();
        assert!(!listed.iter().any(|g| g.name == group));
    }
}
