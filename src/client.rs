//! NNTP session: connection lifecycle and the reader/poster command set
//! ([RFC 3977 §5–§6](https://datatracker.ietf.org/doc/html/rfc3977#section-5)).

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::cancel::{Deadline, DeadlineGuard, OpContext, with_deadline};
use crate::error::NntpError;
use crate::model::{Expect, Group, MalformedLinePolicy, NntpResponse, PostingStatus};
use crate::transport::{BodyReader, LineTransport, NntpIo};

/// One NNTP session over one connection.
///
/// Exactly one command is in flight at a time; every operation takes
/// `&mut self`, and the handles returned by [`article`](Self::article) and
/// friends borrow the session, so their body streams must be consumed (or
/// dropped) before the next command is issued.
pub struct Client {
    transport: LineTransport,
    deadline: watch::Sender<Deadline>,
}

/// A fetched article: its number, the free text from the status line
/// (message-id and description), and the streaming body.
pub struct ArticleHandle<'a> {
    pub number: u64,
    pub message: String,
    pub body: BodyReader<'a>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ArticleHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArticleHandle")
            .field("number", &self.number)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect over plain TCP and read the greeting
    /// ([RFC 3977 §5.1](https://datatracker.ietf.org/doc/html/rfc3977#section-5.1)).
    ///
    /// Only a 200 greeting (service available, posting allowed) is accepted.
    /// On any failure the connection is dropped and no session exists.
    pub async fn connect(ctx: &OpContext, addr: &str) -> Result<Self, NntpError> {
        debug!("connecting to {}", addr);
        let (tx, mut rx) = watch::channel(Deadline::None);
        let guard = DeadlineGuard::bind(tx.clone(), ctx);
        let result = async {
            let tcp = with_deadline(&mut rx, TcpStream::connect(addr)).await?;
            Self::greet(LineTransport::new(Box::new(tcp), rx)).await
        }
        .await;
        guard.release().await;
        Ok(Self {
            transport: result?,
            deadline: tx,
        })
    }

    /// Connect with implicit TLS ([RFC 8143](https://datatracker.ietf.org/doc/html/rfc8143))
    /// using the webpki root store, then read the greeting.
    pub async fn connect_tls(ctx: &OpContext, host: &str, port: u16) -> Result<Self, NntpError> {
        Self::connect_tls_with_config(ctx, host, port, build_tls_config()?).await
    }

    /// Connect with implicit TLS, reusing a pre-built [`ClientConfig`].
    ///
    /// rustls stores session tickets inside the config, so sharing one
    /// `Arc<ClientConfig>` across connections to the same server lets later
    /// handshakes resume ([RFC 8446 §2.2](https://datatracker.ietf.org/doc/html/rfc8446#section-2.2)).
    pub async fn connect_tls_with_config(
        ctx: &OpContext,
        host: &str,
        port: u16,
        tls_config: Arc<ClientConfig>,
    ) -> Result<Self, NntpError> {
        debug!("connecting to {}:{} (tls)", host, port);
        let (tx, mut rx) = watch::channel(Deadline::None);
        let guard = DeadlineGuard::bind(tx.clone(), ctx);
        let result = async {
            let tcp = with_deadline(&mut rx, TcpStream::connect((host, port))).await?;
            let connector = TlsConnector::from(tls_config);
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| NntpError::Tls(format!("invalid hostname: {host}")))?;
            let tls = with_deadline(&mut rx, connector.connect(server_name, tcp))
                .await
                .map_err(|e| match e {
                    NntpError::Io(err) => NntpError::Tls(err.to_string()),
                    other => other,
                })?;
            Self::greet(LineTransport::new(Box::new(tls), rx)).await
        }
        .await;
        guard.release().await;
        Ok(Self {
            transport: result?,
            deadline: tx,
        })
    }

    /// Run the greeting handshake over a caller-provided stream.
    ///
    /// The seam for custom transports and tests.
    pub async fn from_stream(ctx: &OpContext, io: Box<dyn NntpIo>) -> Result<Self, NntpError> {
        let (tx, rx) = watch::channel(Deadline::None);
        let guard = DeadlineGuard::bind(tx.clone(), ctx);
        let result = Self::greet(LineTransport::new(io, rx)).await;
        guard.release().await;
        Ok(Self {
            transport: result?,
            deadline: tx,
        })
    }

    async fn greet(mut transport: LineTransport) -> Result<LineTransport, NntpError> {
        let greeting = transport.read_status_line(Expect::Exact(200)).await?;
        debug!("greeting: {} {}", greeting.code, greeting.message);
        Ok(transport)
    }

    /// Shut down the connection. Any subsequent use is prevented statically.
    pub async fn close(mut self) -> Result<(), NntpError> {
        debug!("closing connection");
        self.transport.shutdown().await
    }

    /// Send QUIT ([RFC 3977 §5.4](https://datatracker.ietf.org/doc/html/rfc3977#section-5.4))
    /// best-effort, then close the connection.
    pub async fn quit(mut self, ctx: &OpContext) -> Result<(), NntpError> {
        let guard = self.bind(ctx);
        let _ = self.transport.write_line("QUIT").await;
        let _ = self.transport.read_status_line(Expect::Exact(205)).await;
        guard.release().await;
        self.close().await
    }

    /// Authenticate with AUTHINFO USER/PASS
    /// ([RFC 4643 §2.3](https://datatracker.ietf.org/doc/html/rfc4643#section-2.3)),
    /// returning the server's acceptance message.
    pub async fn authenticate(
        &mut self,
        ctx: &OpContext,
        user: &str,
        pass: &str,
    ) -> Result<String, NntpError> {
        let guard = self.bind(ctx);
        let result = self.authenticate_inner(user, pass).await;
        guard.release().await;
        result
    }

    async fn authenticate_inner(&mut self, user: &str, pass: &str) -> Result<String, NntpError> {
        debug!("authenticating as {}", user);
        self.exec(&format!("AUTHINFO USER {user}"), Expect::Exact(381))
            .await?;
        let resp = self
            .exec(&format!("AUTHINFO PASS {pass}"), Expect::Exact(281))
            .await?;
        debug!("authentication accepted");
        Ok(resp.message)
    }

    /// List newsgroups matching `wildmat` (all groups when empty), dropping
    /// unparseable lines ([RFC 3977 §7.6.3](https://datatracker.ietf.org/doc/html/rfc3977#section-7.6.3)).
    pub async fn list(&mut self, ctx: &OpContext, wildmat: &str) -> Result<Vec<Group>, NntpError> {
        self.list_with_policy(ctx, wildmat, MalformedLinePolicy::Skip)
            .await
    }

    /// List newsgroups with an explicit policy for unparseable lines.
    pub async fn list_with_policy(
        &mut self,
        ctx: &OpContext,
        wildmat: &str,
        policy: MalformedLinePolicy,
    ) -> Result<Vec<Group>, NntpError> {
        let guard = self.bind(ctx);
        let result = self.list_inner(wildmat, policy).await;
        guard.release().await;
        result
    }

    async fn list_inner(
        &mut self,
        wildmat: &str,
        policy: MalformedLinePolicy,
    ) -> Result<Vec<Group>, NntpError> {
        let cmd = if wildmat.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {wildmat}")
        };
        self.exec(&cmd, Expect::Exact(215)).await?;

        let mut groups = Vec::new();
        let mut skipped = 0usize;
        let mut lines = self.transport.read_body();
        while let Some(raw) = lines.read_line().await? {
            let line = String::from_utf8_lossy(&raw);
            match parse_list_line(&line) {
                Some(group) => groups.push(group),
                None if policy == MalformedLinePolicy::Fail => {
                    return Err(NntpError::MalformedResponse(format!(
                        "bad LIST line: {line}"
                    )));
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("ignored {} malformed LIST lines", skipped);
        }
        debug!("LIST returned {} groups", groups.len());
        Ok(groups)
    }

    /// Select a newsgroup ([RFC 3977 §6.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.1.1)).
    pub async fn group(&mut self, ctx: &OpContext, name: &str) -> Result<Group, NntpError> {
        let guard = self.bind(ctx);
        let result = self.group_inner(name).await;
        guard.release().await;
        result
    }

    async fn group_inner(&mut self, name: &str) -> Result<Group, NntpError> {
        let resp = self
            .exec(&format!("GROUP {name}"), Expect::Exact(211))
            .await?;
        let group = parse_group_response(&resp.message)?;
        debug!(
            "group {}: {} articles ({}-{})",
            group.name, group.count, group.low, group.high
        );
        Ok(group)
    }

    /// Fetch a whole article ([RFC 3977 §6.2.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.1)).
    ///
    /// The specifier is an article number or a `<message-id>`. The returned
    /// handle's body must be consumed before the next command.
    pub async fn article(
        &mut self,
        ctx: &OpContext,
        specifier: &str,
    ) -> Result<ArticleHandle<'_>, NntpError> {
        self.fetch(ctx, "ARTICLE", specifier, Expect::Exact(220))
            .await
    }

    /// Fetch the headers of an article ([RFC 3977 §6.2.2](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.2)).
    pub async fn head(
        &mut self,
        ctx: &OpContext,
        specifier: &str,
    ) -> Result<ArticleHandle<'_>, NntpError> {
        self.fetch(ctx, "HEAD", specifier, Expect::Exact(221)).await
    }

    /// Fetch the body of an article ([RFC 3977 §6.2.3](https://datatracker.ietf.org/doc/html/rfc3977#section-6.2.3)).
    pub async fn body(
        &mut self,
        ctx: &OpContext,
        specifier: &str,
    ) -> Result<ArticleHandle<'_>, NntpError> {
        self.fetch(ctx, "BODY", specifier, Expect::Exact(222)).await
    }

    async fn fetch(
        &mut self,
        ctx: &OpContext,
        verb: &str,
        specifier: &str,
        expect: Expect,
    ) -> Result<ArticleHandle<'_>, NntpError> {
        let guard = self.bind(ctx);
        let result = self.exec(&format!("{verb} {specifier}"), expect).await;
        guard.release().await;
        let resp = result?;
        let (number, message) = parse_article_response(&resp.message)?;
        debug!("{} {}: article {}", verb, specifier, number);
        Ok(ArticleHandle {
            number,
            message,
            body: self.transport.read_body(),
        })
    }

    /// Post an article ([RFC 3977 §6.3.1](https://datatracker.ietf.org/doc/html/rfc3977#section-6.3.1)).
    ///
    /// `article` must be a complete RFC-822-style message (headers, blank
    /// line, body); no validation is performed. A failure while streaming
    /// leaves the block unterminated on the wire, so the session must be
    /// discarded, not retried.
    pub async fn post<R>(&mut self, ctx: &OpContext, article: R) -> Result<(), NntpError>
    where
        R: AsyncRead + Unpin,
    {
        let guard = self.bind(ctx);
        let result = self.post_inner(article).await;
        guard.release().await;
        result
    }

    async fn post_inner<R>(&mut self, article: R) -> Result<(), NntpError>
    where
        R: AsyncRead + Unpin,
    {
        self.exec("POST", Expect::Exact(340)).await?;
        self.transport.write_body(article).await?;
        self.transport.read_status_line(Expect::Exact(240)).await?;
        debug!("article posted");
        Ok(())
    }

    /// Send a raw command line and validate the response code against
    /// `expect`, the escape hatch for commands outside the modeled subset.
    ///
    /// No body handling; extensions whose response carries a dot-block
    /// should call [`read_body`](Self::read_body) afterwards.
    pub async fn command(
        &mut self,
        ctx: &OpContext,
        cmd: &str,
        expect: Expect,
    ) -> Result<NntpResponse, NntpError> {
        let guard = self.bind(ctx);
        let result = self.exec(cmd, expect).await;
        guard.release().await;
        result
    }

    /// Read a dot-terminated block from the current transport position.
    pub fn read_body(&mut self) -> BodyReader<'_> {
        self.transport.read_body()
    }

    /// Direct access to the line transport for protocol extensions.
    pub fn transport_mut(&mut self) -> &mut LineTransport {
        &mut self.transport
    }

    async fn exec(&mut self, cmd: &str, expect: Expect) -> Result<NntpResponse, NntpError> {
        self.transport.write_line(cmd).await?;
        self.transport.read_status_line(expect).await
    }

    fn bind(&self, ctx: &OpContext) -> DeadlineGuard {
        DeadlineGuard::bind(self.deadline.clone(), ctx)
    }
}

/// Build a shared TLS [`ClientConfig`] suitable for reuse across
/// connections, validating against the webpki root store.
pub fn build_tls_config() -> Result<Arc<ClientConfig>, NntpError> {
    let provider = tokio_rustls::rustls::crypto::ring::default_provider();
    let _ = provider.install_default();

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn parse_list_line(line: &str) -> Option<Group> {
    let mut fields = line.split(' ');
    let name = fields.next()?;
    let high = fields.next()?.parse().ok()?;
    let low = fields.next()?.parse().ok()?;
    let flag = fields.next()?;
    if name.is_empty() || fields.next().is_some() {
        return None;
    }
    Some(Group {
        name: name.to_string(),
        low,
        high,
        count: 0,
        posting: PostingStatus::from_flag(flag),
    })
}

// GROUP reply: "<count> <low> <high> <name>"
// (RFC 3977 §6.1.1; the posting flag is not part of this response).
fn parse_group_response(message: &str) -> Result<Group, NntpError> {
    let fields: Vec<&str> = message.split(' ').collect();
    if fields.len() != 4 {
        return Err(NntpError::MalformedResponse(format!(
            "bad GROUP response: {message}"
        )));
    }
    let count = parse_number(fields[0], message)?;
    let low = parse_number(fields[1], message)?;
    let high = parse_number(fields[2], message)?;
    Ok(Group {
        name: fields[3].to_string(),
        low,
        high,
        count,
        posting: PostingStatus::NotPermitted,
    })
}

fn parse_article_response(message: &str) -> Result<(u64, String), NntpError> {
    let (number, rest) = match message.split_once(' ') {
        Some((number, rest)) => (number, rest),
        None => (message, ""),
    };
    let number = parse_number(number, message)?;
    Ok((number, rest.to_string()))
}

fn parse_number(field: &str, message: &str) -> Result<u64, NntpError> {
    field.parse().map_err(|_| {
        NntpError::MalformedResponse(format!("bad numeric field {field:?} in: {message}"))
    })
}
