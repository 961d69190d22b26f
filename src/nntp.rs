//! Minimal NNTP surface: the article/group types, the backend trait the
//! session facade implements, a server command loop and a small client.
//!
//! Only the commands the node actually exchanges are spoken: `LIST`,
//! `GROUP`, `LISTGROUP`, `ARTICLE`/`HEAD`/`BODY`/`STAT`, `POST`,
//! `AUTHINFO USER/PASS`, `MODE READER`, `CAPABILITIES`, `QUIT`. Everything
//! runs over any async byte stream, so the same loop serves loopback TCP,
//! the in-process pipe and authenticated overlay streams.

use std::future::Future;
use std::sync::Arc;

use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::error::{Error, ErrorKind};
use crate::message::Headers;
use crate::session::Session;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingStatus {
    Unknown,
    Permitted,
    NotPermitted,
    Moderated,
}

impl PostingStatus {
    pub fn flag(&self) -> char {
        match self {
            PostingStatus::Permitted | PostingStatus::Unknown => 'y',
            PostingStatus::NotPermitted => 'n',
            PostingStatus::Moderated => 'm',
        }
    }

    pub fn from_flag(flag: &str) -> Self {
        match flag {
            "n" => PostingStatus::NotPermitted,
            "m" => PostingStatus::Moderated,
            "y" => PostingStatus::Permitted,
            _ => PostingStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub description: String,
    pub count: i64,
    pub low: i64,
    pub high: i64,
    pub posting: PostingStatus,
}

#[derive(Debug, Clone)]
pub struct Article {
    pub headers: Headers,
    pub body: String,
}

impl Article {
    /// Split a raw wire article into headers and body.
    pub fn parse(raw: &str) -> Result<Self, crate::message::CodecError> {
        let (head, body) = match raw.find("\r\n\r\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 4..]),
            None => match raw.find("\n\n") {
                Some(idx) => (&raw[..idx], &raw[idx + 2..]),
                None => (raw, ""),
            },
        };
        Ok(Article { headers: Headers::parse(head)?, body: body.to_string() })
    }

    /// Re-emit headers + body as they arrived.
    pub fn to_wire(&self) -> String {
        let mut buf = String::new();
        for (name, value) in self.headers.iter() {
            buf.push_str(name);
            buf.push_str(": ");
            buf.push_str(value);
            buf.push_str("\r\n");
        }
        buf.push_str("\r\n");
        buf.push_str(&self.body);
        buf
    }
}

#[derive(Debug, Clone)]
pub struct NumberedArticle {
    pub num: i64,
    pub article: Article,
}

// ─── Message-id generation ────────────────────────────────────────────────────

pub trait IdGenerator: Send + Sync {
    fn gen_id(&self) -> String;
}

/// `<base32(now_unix)-base32(rand80)@node-id>`, lowercased.
pub struct NodeIdGen {
    pub node_name: String,
}

impl IdGenerator for NodeIdGen {
    fn gen_id(&self) -> String {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let stamp = BASE32_NOPAD.encode(&now.to_be_bytes()).to_lowercase();
        let mut entropy = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut entropy);
        let tail = BASE32_NOPAD.encode(&entropy).to_lowercase();
        format!("<{}-{}@{}>", stamp, tail, self.node_name)
    }
}

// ─── Backend trait ────────────────────────────────────────────────────────────

/// What a news server needs from its storage and policy layer. Implemented by
/// the session facade.
pub trait Backend: Send + Sync + 'static {
    fn list_groups(&self, session: &Session) -> impl Future<Output = Result<Vec<Group>, Error>> + Send;

    fn get_group(&self, session: &Session, name: &str) -> impl Future<Output = Result<Group, Error>> + Send;

    /// Fetch by global article number or by message-id. `group` is the
    /// session's currently selected group, when one is needed for the
    /// permission check.
    fn get_article(
        &self,
        session: &Session,
        group: Option<&str>,
        id: &str,
    ) -> impl Future<Output = Result<Article, Error>> + Send;

    fn list_article_numbers(
        &self,
        session: &Session,
        group: &str,
        from: i64,
        to: i64,
    ) -> impl Future<Output = Result<Vec<i64>, Error>> + Send;

    fn authenticate(
        &self,
        session: &Session,
        user: &str,
        pass: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    fn allow_post(&self, session: &Session) -> bool;

    fn post(&self, session: &Session, article: Article) -> impl Future<Output = Result<(), Error>> + Send;
}

// ─── Server ───────────────────────────────────────────────────────────────────

pub struct Server<B: Backend> {
    backend: Arc<B>,
    idgen: Arc<dyn IdGenerator>,
}

impl<B: Backend> Clone for Server<B> {
    fn clone(&self) -> Self {
        Server { backend: self.backend.clone(), idgen: self.idgen.clone() }
    }
}

impl<B: Backend> Server<B> {
    pub fn new(backend: Arc<B>, idgen: Arc<dyn IdGenerator>) -> Self {
        Server { backend, idgen }
    }

    /// Drive one session over `stream` until the client quits or the stream
    /// closes. Errors end the session and are logged, never propagated.
    pub async fn process<S>(&self, stream: S, session: Session)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(err) = self.run(stream, session).await {
            log::debug!("nntp session ended: {err}");
        }
    }

    async fn run<S>(&self, stream: S, mut session: Session) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        send_line(&mut writer, "200 kothawoc news server ready - posting allowed").await?;

        let mut current_group: Option<Group> = None;
        let mut pending_user: Option<String> = None;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (cmd, rest) = match line.split_once(' ') {
                Some((c, r)) => (c.to_uppercase(), r.trim()),
                None => (line.to_uppercase(), ""),
            };
            log::trace!("nntp <- {cmd} {rest}");

            match cmd.as_str() {
                "CAPABILITIES" => {
                    send_line(&mut writer, "101 Capability list:").await?;
                    for cap in ["VERSION 2", "READER", "POST", "AUTHINFO USER", "LIST ACTIVE NEWSGROUPS", "."] {
                        send_line(&mut writer, cap).await?;
                    }
                }
                "MODE" => send_line(&mut writer, "200 reader mode, posting allowed").await?,
                "QUIT" => {
                    send_line(&mut writer, "205 bye").await?;
                    return Ok(());
                }
                "AUTHINFO" => {
                    self.handle_authinfo(&mut writer, &mut session, &mut pending_user, rest).await?;
                }
                _ if !session.authenticated => {
                    send_error(&mut writer, &Error::new(ErrorKind::NotAuthenticated)).await?;
                }
                "LIST" => self.handle_list(&mut writer, &session, rest).await?,
                "GROUP" => {
                    match self.backend.get_group(&session, rest).await {
                        Ok(group) => {
                            let reply = format!(
                                "211 {} {} {} {}",
                                group.count, group.low, group.high, group.name
                            );
                            current_group = Some(group);
                            send_line(&mut writer, &reply).await?;
                        }
                        Err(err) => send_error(&mut writer, &err).await?,
                    }
                }
                "LISTGROUP" => {
                    let name = if rest.is_empty() {
                        current_group.as_ref().map(|g| g.name.clone())
                    } else {
                        Some(rest.to_string())
                    };
                    match name {
                        Some(name) => self.handle_listgroup(&mut writer, &session, &name).await?,
                        None => send_line(&mut writer, "412 no newsgroup selected").await?,
                    }
                }
                "ARTICLE" | "HEAD" | "BODY" | "STAT" => {
                    self.handle_article(&mut writer, &session, current_group.as_ref(), &cmd, rest)
                        .await?;
                }
                "POST" => self.handle_post(&mut reader, &mut writer, &session).await?,
                _ => send_line(&mut writer, "500 unknown command").await?,
            }
        }
    }

    async fn handle_authinfo<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        session: &mut Session,
        pending_user: &mut Option<String>,
        rest: &str,
    ) -> std::io::Result<()> {
        let (kind, value) = match rest.split_once(' ') {
            Some((k, v)) => (k.to_uppercase(), v.trim().to_string()),
            None => (rest.to_uppercase(), String::new()),
        };
        match kind.as_str() {
            "USER" => {
                *pending_user = Some(value);
                send_line(writer, "381 PASS required").await
            }
            "PASS" => {
                let user = pending_user.take().unwrap_or_default();
                match self.backend.authenticate(session, &user, &value).await {
                    Ok(true) => {
                        session.authenticated = true;
                        send_line(writer, "281 authentication accepted").await
                    }
                    Ok(false) => send_line(writer, "481 authentication failed").await,
                    Err(err) => send_error(writer, &err).await,
                }
            }
            _ => send_line(writer, "501 AUTHINFO USER or AUTHINFO PASS").await,
        }
    }

    async fn handle_list<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        session: &Session,
        rest: &str,
    ) -> std::io::Result<()> {
        let variant = rest.split_whitespace().next().unwrap_or("ACTIVE").to_uppercase();
        let groups = match self.backend.list_groups(session).await {
            Ok(groups) => groups,
            Err(err) => return send_error(writer, &err).await,
        };
        match variant.as_str() {
            "NEWSGROUPS" => {
                send_line(writer, "215 descriptions follow").await?;
                for group in &groups {
                    send_line(writer, &format!("{} {}", group.name, group.description)).await?;
                }
            }
            _ => {
                send_line(writer, "215 list of newsgroups follows").await?;
                for group in &groups {
                    send_line(
                        writer,
                        &format!("{} {} {} {}", group.name, group.high, group.low, group.posting.flag()),
                    )
                    .await?;
                }
            }
        }
        send_line(writer, ".").await
    }

    async fn handle_listgroup<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        session: &Session,
        name: &str,
    ) -> std::io::Result<()> {
        let group = match self.backend.get_group(session, name).await {
            Ok(group) => group,
            Err(err) => return send_error(writer, &err).await,
        };
        let numbers = match self
            .backend
            .list_article_numbers(session, name, group.low, group.high)
            .await
        {
            Ok(numbers) => numbers,
            Err(err) => return send_error(writer, &err).await,
        };
        send_line(
            writer,
            &format!("211 {} {} {} {} list follows", group.count, group.low, group.high, group.name),
        )
        .await?;
        for num in numbers {
            send_line(writer, &num.to_string()).await?;
        }
        send_line(writer, ".").await
    }

    async fn handle_article<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        session: &Session,
        current_group: Option<&Group>,
        cmd: &str,
        id: &str,
    ) -> std::io::Result<()> {
        if id.is_empty() {
            return send_line(writer, "501 article number or message-id required").await;
        }
        let group_name = current_group.map(|g| g.name.as_str());
        let article = match self.backend.get_article(session, group_name, id).await {
            Ok(article) => article,
            Err(err) => return send_error(writer, &err).await,
        };
        let num: i64 = id.parse().unwrap_or(0);
        let msgid = article.headers.get("Message-Id").unwrap_or("<0>").to_string();

        match cmd {
            "STAT" => send_line(writer, &format!("223 {num} {msgid}")).await,
            "HEAD" => {
                send_line(writer, &format!("221 {num} {msgid} headers follow")).await?;
                for (name, value) in article.headers.iter() {
                    send_line(writer, &format!("{name}: {value}")).await?;
                }
                send_line(writer, ".").await
            }
            "BODY" => {
                send_line(writer, &format!("222 {num} {msgid} body follows")).await?;
                write_dotstuffed(writer, &article.body).await
            }
            _ => {
                send_line(writer, &format!("220 {num} {msgid} article follows")).await?;
                for (name, value) in article.headers.iter() {
                    send_line(writer, &format!("{name}: {value}")).await?;
                }
                send_line(writer, "").await?;
                write_dotstuffed(writer, &article.body).await
            }
        }
    }

    async fn handle_post<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        session: &Session,
    ) -> std::io::Result<()>
    where
        R: AsyncBufReadExt + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !self.backend.allow_post(session) {
            return send_line(writer, "440 posting not allowed").await;
        }
        send_line(writer, "340 go ahead, end with <CR-LF>.<CR-LF>").await?;
        let raw = read_dotstuffed(reader).await?;
        let mut article = match Article::parse(&raw) {
            Ok(article) => article,
            Err(_) => return send_line(writer, "441 malformed article").await,
        };
        if article.headers.get("Message-Id").is_none() {
            article.headers.set("Message-Id", self.idgen.gen_id());
        }
        match self.backend.post(session, article).await {
            Ok(()) => send_line(writer, "240 article received").await,
            Err(err) => send_error(writer, &err).await,
        }
    }
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    log::trace!("nntp -> {line}");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, err: &Error) -> std::io::Result<()> {
    log::info!("nntp error reply: {err}");
    send_line(writer, &format!("{} {}", err.code(), err.reason())).await
}

/// Write a body terminated by a lone dot, doubling any leading dots.
async fn write_dotstuffed<W: AsyncWrite + Unpin>(writer: &mut W, body: &str) -> std::io::Result<()> {
    for line in body.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with('.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    writer.flush().await
}

/// Read a dot-terminated block, undoing dot-stuffing. Lines come back
/// CRLF-terminated.
async fn read_dotstuffed<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut out = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed inside multiline block",
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "." {
            return Ok(out);
        }
        out.push_str(line.strip_prefix('.').unwrap_or(line));
        out.push_str("\r\n");
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("server rejected command: {0} {1}")]
    Rejected(u16, String),
    #[error("unexpected server response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// True when the failure is the transport, not a server policy decision.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol(_))
    }
}

pub struct Client<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Wrap an open stream and consume the server greeting.
    pub async fn connect(stream: S) -> Result<Self, ClientError> {
        let (read_half, writer) = tokio::io::split(stream);
        let mut client = Client { reader: BufReader::new(read_half), writer };
        let (code, text) = client.read_response().await?;
        if code != 200 && code != 201 {
            return Err(ClientError::Rejected(code, text));
        }
        Ok(client)
    }

    async fn read_response(&mut self) -> Result<(u16, String), ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed connection",
            )));
        }
        let line = line.trim_end();
        let (code, text) = line.split_at(line.len().min(3));
        let code: u16 = code.parse().map_err(|_| ClientError::Protocol(line.to_string()))?;
        Ok((code, text.trim().to_string()))
    }

    async fn command(&mut self, cmd: &str) -> Result<(u16, String), ClientError> {
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_response().await
    }

    pub async fn authenticate(&mut self, user: &str, pass: &str) -> Result<(), ClientError> {
        let (code, text) = self.command(&format!("AUTHINFO USER {user}")).await?;
        if code != 381 && code != 281 {
            return Err(ClientError::Rejected(code, text));
        }
        if code == 381 {
            let (code, text) = self.command(&format!("AUTHINFO PASS {pass}")).await?;
            if code != 281 {
                return Err(ClientError::Rejected(code, text));
            }
        }
        Ok(())
    }

    /// POST a raw wire article. A 4xx/5xx response comes back as
    /// [`ClientError::Rejected`]; I/O faults as [`ClientError::Io`].
    pub async fn post(&mut self, article: &str) -> Result<(), ClientError> {
        let (code, text) = self.command("POST").await?;
        if code != 340 {
            return Err(ClientError::Rejected(code, text));
        }
        for line in article.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.starts_with('.') {
                self.writer.write_all(b".").await?;
            }
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.write_all(b".\r\n").await?;
        self.writer.flush().await?;
        let (code, text) = self.read_response().await?;
        if code != 240 {
            return Err(ClientError::Rejected(code, text));
        }
        Ok(())
    }

    /// Select a group; returns `(count, low, high)`.
    pub async fn group(&mut self, name: &str) -> Result<(i64, i64, i64), ClientError> {
        let (code, text) = self.command(&format!("GROUP {name}")).await?;
        if code != 211 {
            return Err(ClientError::Rejected(code, text));
        }
        let mut fields = text.split_whitespace();
        let parse = |f: Option<&str>| f.and_then(|v| v.parse::<i64>().ok());
        match (parse(fields.next()), parse(fields.next()), parse(fields.next())) {
            (Some(count), Some(low), Some(high)) => Ok((count, low, high)),
            _ => Err(ClientError::Protocol(text)),
        }
    }

    /// Fetch a raw article by number or message-id.
    pub async fn article(&mut self, id: &str) -> Result<String, ClientError> {
        let (code, text) = self.command(&format!("ARTICLE {id}")).await?;
        if code != 220 {
            return Err(ClientError::Rejected(code, text));
        }
        let raw = read_dotstuffed(&mut self.reader).await?;
        Ok(raw)
    }

    pub async fn quit(&mut self) -> Result<(), ClientError> {
        let _ = self.command("QUIT").await?;
        Ok(())
    }
}
