//! Control-message interpreter and the builders for outbound control mail.
//!
//! Control articles carry group creation, peering setup/teardown, cancels and
//! subscription updates in their `Control` header. Interpretation happens on
//! every accepted post, before the article is stored, so a control message
//! that fails its handler rejects the whole post.

use log::{info, warn};
use regex::Regex;
use thiserror::Error;

use crate::keys::NodeKey;
use crate::message::{parse_content_type, Message, MimePart};
use crate::nntp::{IdGenerator, PostingStatus};
use crate::peering::{PeeringError, Peers};
use crate::store::{GroupPermissions, PermEntry, Store, StoreError};

const GROUPINFO_TYPE: &str = "application/news-groupinfo";
const VCARD_TYPE: &str = "text/x-vcard";
const NEWSFEED_TYPE: &str = "application/newsfeed";
const PLAIN_TYPE: &str = "text/plain";

/// Dotted, lowercase group names only. The first component is an onion id;
/// later components are plain labels.
const GROUP_NAME_PATTERN: &str = r"^[a-z0-9][a-z0-9_-]*(\.[a-z0-9][a-z0-9_-]*)+$";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Peering(#[from] PeeringError),
}

/// The side effects a control message may trigger.
pub struct ControlHandlers {
    pub store: Store,
    pub peers: Peers,
    pub my_id: String,
}

/// Interpret the `Control` header of an accepted article, if present.
pub async fn apply_control(msg: &Message, handlers: &ControlHandlers) -> Result<(), ControlError> {
    let Some(ctrl) = msg.headers.get("Control") else {
        return Ok(());
    };
    let ctrl = ctrl.to_string();
    let mut words = ctrl.split_whitespace();
    let verb = words.next().unwrap_or("");
    let arg = words.next().unwrap_or("").to_string();
    let extra = words.next().map(|w| w.to_string());

    match verb {
        "newsgroup" => handle_newsgroup(msg, handlers, &arg, extra.as_deref()).await,
        "cancel" => {
            let from = msg.headers.get("From").unwrap_or_default().to_string();
            let removed = handlers.store.cancel_message(&from, &arg, msg.newsgroups()).await?;
            for peer in removed {
                handlers.peers.remove_peer(&peer).await?;
            }
            Ok(())
        }
        "checkgroups" => {
            // Reserved: records the sending peer's group knowledge, nothing
            // else changes.
            info!("checkgroups from {arg} noted");
            Ok(())
        }
        "sendme" => handle_sendme(msg, handlers, &arg).await,
        "AddPeer" => add_peer(handlers, &arg).await,
        "RemovePeer" => {
            handlers.peers.remove_peer(&arg).await?;
            Ok(())
        }
        "rmgroup" | "Subscribe" | "UnSubscribe" | "SetPerms" => {
            info!("reserved control {verb} ignored");
            Ok(())
        }
        other => {
            warn!("unknown control {other} ignored");
            Ok(())
        }
    }
}

async fn handle_newsgroup(
    msg: &Message,
    handlers: &ControlHandlers,
    group: &str,
    extra: Option<&str>,
) -> Result<(), ControlError> {
    let name_re = Regex::new(GROUP_NAME_PATTERN).expect("pattern is valid");
    if !name_re.is_match(group) {
        return Err(ControlError::Rejected(format!("bad group name {group}")));
    }
    let owner = group.split('.').next().unwrap_or_default();
    if msg.headers.get("From") != Some(owner) {
        return Err(ControlError::Rejected(format!(
            "newsgroup {group} not signed by its owner"
        )));
    }

    let moderated = extra == Some("moderated");
    let flags = if moderated { "m" } else { "y" };
    let description = extract_description(msg, group, moderated);
    let perms = extract_vcard_perms(msg);

    match handlers.store.new_group(group, &description, flags, perms).await {
        Ok(()) => (),
        // A replayed creation is not an error worth failing the post for.
        Err(StoreError::AlreadyExists) => info!("group {group} already exists"),
        Err(err) => return Err(err.into()),
    }

    // Creating our own pair-group is what establishes the peering.
    let parts: Vec<&str> = group.split('.').collect();
    if parts.len() == 3 && parts[0] == handlers.my_id && parts[1] == "peers" {
        add_peer(handlers, parts[2]).await?;
    }
    Ok(())
}

async fn add_peer(handlers: &ControlHandlers, torid: &str) -> Result<(), ControlError> {
    handlers.store.add_peer(torid).await?;
    handlers.peers.add_peer(torid).await?;
    Ok(())
}

async fn handle_sendme(
    msg: &Message,
    handlers: &ControlHandlers,
    peer: &str,
) -> Result<(), ControlError> {
    // Only a peer may rewrite its own feed.
    if msg.headers.get("From") != Some(peer) {
        return Err(ControlError::Rejected(format!("sendme for {peer} not sent by that peer")));
    }

    let list_source = part_of_type(msg, PLAIN_TYPE)
        .map(|p| String::from_utf8_lossy(&p.content).into_owned())
        .unwrap_or_else(|| msg.preamble.clone());
    let list: Vec<String> = list_source
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let mut options = Vec::new();
    if let Some(feed_part) = part_of_type(msg, NEWSFEED_TYPE) {
        let content = String::from_utf8_lossy(&feed_part.content);
        for line in content.lines() {
            if let Some((key, val)) = line.split_once(':') {
                options.push((key.trim().to_string(), val.trim().to_string()));
            }
        }
    }

    handlers.peers.sendme(peer, list, options).await?;
    Ok(())
}

// ─── Article part helpers ─────────────────────────────────────────────────────

fn part_of_type<'a>(msg: &'a Message, mediatype: &str) -> Option<&'a MimePart> {
    msg.parts.iter().find(|p| {
        p.headers
            .get("Content-Type")
            .map(|ct| parse_content_type(ct).0 == mediatype)
            .unwrap_or(false)
    })
}

/// Pull the one-line description out of the news-groupinfo part:
/// `For your newsgroups file:` followed by `<group> <description> [moderated]`.
fn extract_description(msg: &Message, group: &str, moderated: bool) -> String {
    let Some(part) = part_of_type(msg, GROUPINFO_TYPE) else {
        return String::new();
    };
    let content = String::from_utf8_lossy(&part.content);
    let line = content.lines().nth(1).unwrap_or_default();
    let line = line.strip_prefix(group).unwrap_or(line).trim_start();
    let line = if moderated {
        line.strip_suffix("moderated").unwrap_or(line).trim_end()
    } else {
        line
    };
    line.to_string()
}

/// Parse `X-KW-PERMS;READ=true;...:torid` properties out of the vCard part.
fn extract_vcard_perms(msg: &Message) -> Vec<PermEntry> {
    let Some(part) = part_of_type(msg, VCARD_TYPE) else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    let content = String::from_utf8_lossy(&part.content);
    for line in content.lines() {
        let line = line.trim();
        if !line.to_uppercase().starts_with("X-KW-PERMS") {
            continue;
        }
        let Some((props, torid)) = line.split_once(':') else { continue };
        let mut perms = GroupPermissions::default();
        for param in props.split(';').skip(1) {
            let Some((key, val)) = param.split_once('=') else { continue };
            let on = val.trim().eq_ignore_ascii_case("true");
            match key.trim().to_uppercase().as_str() {
                "READ" => perms.read = on,
                "REPLY" => perms.reply = on,
                "POST" => perms.post = on,
                "CANCEL" => perms.cancel = on,
                "SUPERSEDE" => perms.supersede = on,
                _ => (),
            }
        }
        entries.push(PermEntry { torid: torid.trim().to_string(), perms });
    }
    entries
}

fn vcard_part(entries: &[PermEntry]) -> MimePart {
    let mut content = String::from("BEGIN:VCARD\nVERSION:4.0\n");
    for entry in entries {
        content.push_str(&format!(
            "X-KW-PERMS;READ={};REPLY={};POST={};CANCEL={};SUPERSEDE={}:{}\n",
            entry.perms.read,
            entry.perms.reply,
            entry.perms.post,
            entry.perms.cancel,
            entry.perms.supersede,
            entry.torid,
        ));
    }
    content.push_str("END:VCARD");
    let mut part = MimePart::default();
    part.headers.set("Content-Type", "text/x-vcard;charset=UTF-8");
    part.content = content.into_bytes();
    part
}

// ─── Outbound control mail builders ───────────────────────────────────────────

const BOUNDARY: &str = "nxtprt";

fn control_message(subject: &str, control: &str, newsgroups: &str, idgen: &dyn IdGenerator) -> Message {
    let mut msg = Message::new();
    msg.headers.set("Subject", subject);
    msg.headers.set("Control", control);
    msg.headers.set("Message-Id", idgen.gen_id());
    msg.headers.set("Newsgroups", newsgroups);
    msg.headers.set("Mime-Version", "1.0");
    msg.headers.set("Content-Type", format!("multipart/mixed; boundary=\"{BOUNDARY}\""));
    msg.headers.set("Content-Transfer-Encoding", "8bit");
    msg.preamble = "This is a MIME control message.".to_string();
    msg
}

fn groupinfo_part(banner_line: &str) -> MimePart {
    let mut part = MimePart::default();
    part.headers.set("Content-Type", "application/news-groupinfo;charset=UTF-8");
    part.content = format!("For your newsgroups file:\n{banner_line}").into_bytes();
    part
}

fn plain_part(text: impl Into<String>) -> MimePart {
    let mut part = MimePart::default();
    part.headers.set("Content-Type", "text/plain;charset=UTF-8");
    part.content = text.into().into_bytes();
    part
}

/// Signed `newsgroup` control creating `<self>.<name>`.
pub fn create_newsgroup_mail(
    key: &NodeKey,
    idgen: &dyn IdGenerator,
    name: &str,
    description: &str,
    posting: PostingStatus,
    perms: &[PermEntry],
) -> Result<String, crate::message::CodecError> {
    let owner = key.node_id();
    let group = format!("{owner}.{name}");
    let mod_suffix = match posting {
        PostingStatus::Moderated => " moderated",
        _ => "",
    };

    let mut msg = control_message(
        &format!("cmsg newsgroup {group}{mod_suffix}"),
        &format!("newsgroup {group}{mod_suffix}"),
        &group,
        idgen,
    );
    msg.parts.push(groupinfo_part(&format!("{group} {description}{mod_suffix}")));
    msg.parts.push(vcard_part(perms));
    msg.parts.push(plain_part(format!(
        "This is a system control message to create the newsgroup {group}.\n"
    )));
    msg.sign(key)
}

/// Signed pair-group creation for `<self>.peers.<peer>`; applying it locally
/// also runs AddPeer. The peer is granted read/reply/post on the pair-group
/// so control traffic can flow back; everyone else gets nothing.
pub fn create_peer_group_mail(
    key: &NodeKey,
    idgen: &dyn IdGenerator,
    peer_id: &str,
) -> Result<String, crate::message::CodecError> {
    let owner = key.node_id();
    let group = format!("{owner}.peers.{peer_id}");

    let mut msg = control_message(
        &format!("cmsg newsgroup {group}"),
        &format!("newsgroup {group}"),
        &group,
        idgen,
    );
    let perms = [
        PermEntry { torid: "group".to_string(), perms: GroupPermissions::default() },
        PermEntry {
            torid: peer_id.to_string(),
            perms: GroupPermissions { read: true, reply: true, post: true, cancel: false, supersede: false },
        },
    ];
    msg.parts.push(groupinfo_part(&format!("{group} peering control group")));
    msg.parts.push(vcard_part(&perms));
    msg.parts.push(plain_part(format!(
        "This is a system control message to add the peer {peer_id}.\n"
    )));
    msg.sign(key)
}

/// Signed `sendme` telling `peer_id` which of our subscriptions to feed.
/// Posted into our own pair-group for that peer, which the peer reads.
pub fn create_sendme_mail(
    key: &NodeKey,
    idgen: &dyn IdGenerator,
    peer_id: &str,
    subscriptions: &[String],
    control_messages: bool,
    feed: &[String],
) -> Result<String, crate::message::CodecError> {
    let owner = key.node_id();
    let group = format!("{owner}.peers.{peer_id}");

    let mut msg = control_message(
        &format!("cmsg sendme {owner}"),
        &format!("sendme {owner}"),
        &group,
        idgen,
    );
    let mut feed_part = MimePart::default();
    feed_part.headers.set("Content-Type", "application/newsfeed;charset=UTF-8");
    feed_part.content = format!(
        "ControlMessages: {control_messages}\nFeed: {}",
        feed.join(","),
    )
    .into_bytes();
    msg.parts.push(feed_part);
    msg.parts.push(plain_part(subscriptions.join("\n")));
    msg.sign(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nntp::NodeIdGen;

    fn idgen() -> NodeIdGen {
        NodeIdGen { node_name: "testnode".into() }
    }

    #[test]
    fn newsgroup_mail_roundtrips_description_and_perms() {
        let key = NodeKey::generate();
        let owner = key.node_id();
        let perms = [PermEntry {
            torid: "group".into(),
            perms: GroupPermissions { read: true, reply: false, post: true, cancel: false, supersede: false },
        }];
        let wire = create_newsgroup_mail(&key, &idgen(), "test.alpha", "an alpha group", PostingStatus::Permitted, &perms)
            .unwrap();

        let msg = Message::parse(&wire).unwrap();
        assert!(msg.verify());
        assert_eq!(msg.headers.get("Control"), Some(format!("newsgroup {owner}.test.alpha").as_str()));

        let group = format!("{owner}.test.alpha");
        assert_eq!(extract_description(&msg, &group, false), "an alpha group");

        let parsed = extract_vcard_perms(&msg);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].torid, "group");
        assert!(parsed[0].perms.read && parsed[0].perms.post);
        assert!(!parsed[0].perms.reply && !parsed[0].perms.cancel);
    }

    #[test]
    fn moderated_newsgroup_mail_carries_flag() {
        let key = NodeKey::generate();
        let owner = key.node_id();
        let wire = create_newsgroup_mail(&key, &idgen(), "mod.group", "a moderated one", PostingStatus::Moderated, &[])
            .unwrap();
        let msg = Message::parse(&wire).unwrap();
        assert_eq!(
            msg.headers.get("Control"),
            Some(format!("newsgroup {owner}.mod.group moderated").as_str())
        );
        let group = format!("{owner}.mod.group");
        assert_eq!(extract_description(&msg, &group, true), "a moderated one");
    }

    #[test]
    fn peer_group_mail_grants_peer_access() {
        let key = NodeKey::generate();
        let peer = NodeKey::generate().node_id();
        let wire = create_peer_group_mail(&key, &idgen(), &peer).unwrap();
        let msg = Message::parse(&wire).unwrap();
        assert!(msg.verify());

        let perms = extract_vcard_perms(&msg);
        let peer_entry = perms.iter().find(|e| e.torid == peer).expect("peer perms present");
        assert!(peer_entry.perms.read && peer_entry.perms.post);
        let default_entry = perms.iter().find(|e| e.torid == "group").expect("default perms present");
        assert_eq!(default_entry.perms, GroupPermissions::default());
    }

    #[test]
    fn sendme_mail_parses_back_into_feed_and_list() {
        let key = NodeKey::generate();
        let me = key.node_id();
        let peer = NodeKey::generate().node_id();
        let subs = vec![format!("{me}.test.alpha"), format!("{me}.test.beta")];
        let wire = create_sendme_mail(&key, &idgen(), &peer, &subs, true, &[peer.clone()]).unwrap();

        let msg = Message::parse(&wire).unwrap();
        assert!(msg.verify());
        assert_eq!(msg.headers.get("Control"), Some(format!("sendme {me}").as_str()));

        let plain = part_of_type(&msg, PLAIN_TYPE).unwrap();
        let list: Vec<String> = String::from_utf8_lossy(&plain.content)
            .lines()
            .map(|l| l.trim().to_string())
            .collect();
        assert_eq!(list, subs);

        let feed = part_of_type(&msg, NEWSFEED_TYPE).unwrap();
        let feed_text = String::from_utf8_lossy(&feed.content);
        assert!(feed_text.contains("ControlMessages: true"));
        assert!(feed_text.contains(&format!("Feed: {peer}")));
    }

    #[test]
    fn group_name_validation() {
        let re = Regex::new(GROUP_NAME_PATTERN).unwrap();
        assert!(re.is_match("abcdef.test.alpha"));
        assert!(re.is_match("abcdef.peers.ghijkl"));
        assert!(!re.is_match("single"));
        assert!(!re.is_match("UPPER.case"));
        assert!(!re.is_match("bad..dots"));
        assert!(!re.is_match("spaces in.name"));
        assert!(!re.is_match(".leading.dot"));
    }
}
