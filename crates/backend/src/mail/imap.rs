//! IMAP transport
//!
//! Speaks the small subset of IMAP4rev1 the collector needs: LOGIN or SASL
//! XOAUTH2, EXAMINE, UID SEARCH and UID FETCH BODY.PEEK[]. Connections are
//! opened lazily, kept in a small idle pool, and discarded after any error so
//! the next call reconnects.

use std::{
  io,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
  net::TcpStream,
};
use tokio_rustls::{
  TlsConnector,
  rustls::{self, ClientConfig, RootCertStore, pki_types::ServerName},
};
use tracing::{debug, trace, warn};

use super::{
  Credentials, MailTransport, MessageId,
  error::{ProviderError, ProviderErrorKind},
};
use crate::domain::config::{AuthMode, SecurityMode};

/// Largest literal accepted from the server
const MAX_LITERAL_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// Streams
// ============================================================================

pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ImapStream for T {}

pub type BoxedStream = Box<dyn ImapStream>;

/// Opens the raw byte stream to the server
#[async_trait]
pub trait StreamConnector: Send + Sync {
  async fn open(&self, hostname: &str, port: u16) -> io::Result<BoxedStream>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
  async fn open(&self, hostname: &str, port: u16) -> io::Result<BoxedStream> {
    let stream = TcpStream::connect((hostname, port)).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
  }
}

fn tls_connector() -> Result<TlsConnector, rustls::Error> {
  let mut roots = RootCertStore::empty();
  roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
  Ok(TlsConnector::from(Arc::new(config)))
}

fn io_error(e: io::Error) -> ProviderError {
  let kind = match e.kind() {
    io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
      ProviderErrorKind::Connection
    }
    _ => ProviderErrorKind::Network,
  };
  ProviderError::new(kind, e.to_string())
}

fn tls_error(e: io::Error) -> ProviderError {
  let kind = match e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
    Some(rustls::Error::InvalidCertificate(_)) => ProviderErrorKind::Certificate,
    _ => ProviderErrorKind::TlsNegotiation,
  };
  ProviderError::new(kind, e.to_string())
}

/// Classify a NO or BAD completion from its response text
fn classify_rejection(text: &str, fallback: ProviderErrorKind) -> ProviderError {
  let lower = text.to_ascii_lowercase();
  let kind = if lower.contains("disabled") || lower.contains("not enabled") {
    ProviderErrorKind::ProtocolDisabled
  } else if lower.contains("[throttled]") || lower.contains("[limit]") || lower.contains("too many") {
    ProviderErrorKind::Throttled
  } else if lower.contains("[authenticationfailed]") || lower.contains("[authorizationfailed]") {
    ProviderErrorKind::Authentication
  } else if lower.contains("[nonexistent]") {
    ProviderErrorKind::NoSuchFolder
  } else {
    fallback
  };
  ProviderError::new(kind, text)
}

/// IMAP quoted string
fn quote(value: &str) -> Result<String, ProviderError> {
  if value.contains(['\r', '\n']) {
    return Err(ProviderError::new(
      ProviderErrorKind::Parse,
      "quoted strings cannot contain line breaks",
    ));
  }
  Ok(format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\"")))
}

/// IMAP date (`1-Mar-2024`)
fn imap_date(date: DateTime<Utc>) -> String {
  date.format("%-d-%b-%Y").to_string()
}

/// Split `prefix {123}` into the prefix and the announced literal size
fn literal_length(line: &str) -> Option<(&str, usize)> {
  let body = line.strip_suffix('}')?;
  let open = body.rfind('{')?;
  let digits = &body[open + 1..];
  if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  Some((&line[..open], digits.parse().ok()?))
}

/// UID reported in an untagged FETCH response line
fn fetch_uid(text: &str) -> Option<MessageId> {
  let mut tokens = text
    .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
    .filter(|t| !t.is_empty());
  if !tokens.by_ref().nth(1)?.eq_ignore_ascii_case("FETCH") {
    return None;
  }
  while let Some(token) = tokens.next() {
    if token.eq_ignore_ascii_case("UID") {
      return tokens.next()?.parse().ok();
    }
  }
  None
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
  Ok,
  No,
  Bad,
}

/// One server line, with any literals it carried read out of band
#[derive(Debug, Default)]
struct ResponseLine {
  text: String,
  literals: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Response {
  status: Status,
  text: String,
  untagged: Vec<ResponseLine>,
}

impl Response {
  fn ensure_ok(self, fallback: ProviderErrorKind) -> Result<Self, ProviderError> {
    match self.status {
      Status::Ok => Ok(self),
      Status::No | Status::Bad => Err(classify_rejection(&self.text, fallback)),
    }
  }
}

struct Session {
  stream: BufReader<BoxedStream>,
  next_tag: u32,
  selected: Option<String>,
  timeout: Duration,
}

impl Session {
  fn new(stream: BoxedStream, timeout: Duration) -> Self {
    Self {
      stream: BufReader::new(stream),
      next_tag: 1,
      selected: None,
      timeout,
    }
  }

  fn into_stream(self) -> BoxedStream {
    self.stream.into_inner()
  }

  fn timed_out(&self) -> ProviderError {
    ProviderError::new(
      ProviderErrorKind::Connection,
      format!("no response within {}s", self.timeout.as_secs()),
    )
  }

  async fn read_line(&mut self) -> Result<ResponseLine, ProviderError> {
    let mut line = ResponseLine::default();
    loop {
      let mut raw = Vec::new();
      let read = self.stream.read_until(b'\n', &mut raw).await.map_err(io_error)?;
      if read == 0 {
        return Err(ProviderError::new(
          ProviderErrorKind::Connection,
          "connection closed by server",
        ));
      }
      let text = String::from_utf8_lossy(&raw);
      let text = text.trim_end_matches(['\r', '\n']);

      let Some((prefix, len)) = literal_length(text) else {
        line.text.push_str(text);
        return Ok(line);
      };
      if len > MAX_LITERAL_BYTES {
        return Err(ProviderError::new(
          ProviderErrorKind::Parse,
          format!("literal of {len} bytes exceeds limit"),
        ));
      }
      line.text.push_str(prefix);
      let mut literal = vec![0; len];
      self.stream.read_exact(&mut literal).await.map_err(io_error)?;
      line.literals.push(literal);
    }
  }

  /// Returns whether the server pre-authenticated the connection
  async fn read_greeting(&mut self) -> Result<bool, ProviderError> {
    let greeting = tokio::time::timeout(self.timeout, self.read_line())
      .await
      .map_err(|_| self.timed_out())??;
    let text = greeting.text.as_str();
    if text.starts_with("* OK") {
      Ok(false)
    } else if text.starts_with("* PREAUTH") {
      Ok(true)
    } else if text.starts_with("* BYE") {
      Err(ProviderError::new(ProviderErrorKind::Connection, text))
    } else {
      Err(ProviderError::new(
        ProviderErrorKind::Parse,
        format!("unexpected greeting: {text}"),
      ))
    }
  }

  async fn command(&mut self, command: &str) -> Result<Response, ProviderError> {
    let tag = format!("A{:04}", self.next_tag);
    self.next_tag += 1;
    tokio::time::timeout(self.timeout, self.exchange(&tag, command))
      .await
      .map_err(|_| self.timed_out())?
  }

  async fn exchange(&mut self, tag: &str, command: &str) -> Result<Response, ProviderError> {
    // Never log arguments: LOGIN and AUTHENTICATE carry secrets
    trace!(tag, verb = command.split(' ').next().unwrap_or_default(), "IMAP command");
    self
      .stream
      .write_all(format!("{tag} {command}\r\n").as_bytes())
      .await
      .map_err(io_error)?;
    self.stream.flush().await.map_err(io_error)?;

    let mut untagged = Vec::new();
    loop {
      let mut line = self.read_line().await?;

      if let Some(rest) = line.text.strip_prefix("* ") {
        line.text = rest.to_string();
        untagged.push(line);
        continue;
      }

      if line.text.starts_with('+') {
        // A challenge here is a SASL failure report; an empty reply ends the exchange
        self.stream.write_all(b"\r\n").await.map_err(io_error)?;
        self.stream.flush().await.map_err(io_error)?;
        continue;
      }

      let Some(rest) = line.text.strip_prefix(tag).and_then(|rest| rest.strip_prefix(' ')) else {
        return Err(ProviderError::new(
          ProviderErrorKind::Parse,
          format!("unexpected response line: {}", line.text),
        ));
      };
      let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
      let status = match status.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        other => {
          return Err(ProviderError::new(
            ProviderErrorKind::Parse,
            format!("unknown completion status {other}"),
          ));
        }
      };
      return Ok(Response {
        status,
        text: text.to_string(),
        untagged,
      });
    }
  }

  async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), ProviderError> {
    let command = match credentials.auth {
      AuthMode::Password => format!(
        "LOGIN {} {}",
        quote(&credentials.username)?,
        quote(credentials.secret())?
      ),
      AuthMode::OAuth2 => {
        let payload = format!(
          "user={}\x01auth=Bearer {}\x01\x01",
          credentials.username,
          credentials.secret()
        );
        format!("AUTHENTICATE XOAUTH2 {}", STANDARD.encode(payload))
      }
    };
    self
      .command(&command)
      .await?
      .ensure_ok(ProviderErrorKind::Authentication)?;
    Ok(())
  }

  async fn examine(&mut self, folder: &str) -> Result<(), ProviderError> {
    if self.selected.as_deref() == Some(folder) {
      return Ok(());
    }
    self.selected = None;
    self
      .command(&format!("EXAMINE {}", quote(folder)?))
      .await?
      .ensure_ok(ProviderErrorKind::NoSuchFolder)?;
    self.selected = Some(folder.to_string());
    Ok(())
  }

  async fn search(&mut self, folder: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<MessageId>, ProviderError> {
    self.examine(folder).await?;
    // BEFORE is exclusive, so the day after `until` keeps it in range
    let command = format!(
      "UID SEARCH SINCE {} BEFORE {}",
      imap_date(since),
      imap_date(until + chrono::Duration::days(1))
    );
    let response = self.command(&command).await?.ensure_ok(ProviderErrorKind::Other)?;

    let mut ids = Vec::new();
    for line in &response.untagged {
      let mut tokens = line.text.split_whitespace();
      if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("SEARCH")) {
        continue;
      }
      for token in tokens {
        let id = token
          .parse::<MessageId>()
          .map_err(|_| ProviderError::new(ProviderErrorKind::Parse, format!("invalid UID in search: {token}")))?;
        ids.push(id);
      }
    }
    Ok(ids)
  }

  async fn fetch(&mut self, folder: &str, id: MessageId) -> Result<Vec<u8>, ProviderError> {
    self.examine(folder).await?;
    let response = self
      .command(&format!("UID FETCH {id} BODY.PEEK[]"))
      .await?
      .ensure_ok(ProviderErrorKind::Fetch)?;

    let body = response
      .untagged
      .into_iter()
      .filter(|line| fetch_uid(&line.text) == Some(id))
      .find_map(|mut line| (!line.literals.is_empty()).then(|| line.literals.swap_remove(0)));
    Ok(body.unwrap_or_default())
  }
}

// ============================================================================
// ImapTransport
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImapSettings {
  pub hostname: String,
  pub port: u16,
  pub security: SecurityMode,
  /// Applies to connecting and to each command round-trip
  pub timeout: Duration,
  pub max_idle_connections: usize,
}

pub struct ImapTransport {
  settings: ImapSettings,
  credentials: Credentials,
  connector: Arc<dyn StreamConnector>,
  tls: Option<TlsConnector>,
  idle: Mutex<Vec<Session>>,
}

impl ImapTransport {
  pub fn new(settings: ImapSettings, credentials: Credentials) -> Self {
    Self::with_connector(settings, credentials, Arc::new(TcpConnector))
  }

  pub fn with_connector(settings: ImapSettings, credentials: Credentials, connector: Arc<dyn StreamConnector>) -> Self {
    let tls = if settings.security == SecurityMode::Plain {
      None
    } else {
      tls_connector()
        .inspect_err(|e| warn!(host = %settings.hostname, err = %e, "Failed to build TLS configuration"))
        .ok()
    };
    Self {
      settings,
      credentials,
      connector,
      tls,
      idle: Mutex::new(Vec::new()),
    }
  }

  fn idle(&self) -> MutexGuard<'_, Vec<Session>> {
    self.idle.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Number of pooled connections ready for reuse
  pub fn idle_connections(&self) -> usize {
    self.idle().len()
  }

  async fn session(&self) -> Result<Session, ProviderError> {
    let pooled = self.idle().pop();
    if let Some(session) = pooled {
      return Ok(session);
    }
    self.connect().await
  }

  /// Return a session to the pool after success; drop it after any failure
  fn release<T>(&self, session: Session, result: &Result<T, ProviderError>) {
    if result.is_err() {
      debug!(host = %self.settings.hostname, "Discarding connection after error");
      return;
    }
    let mut idle = self.idle();
    if idle.len() < self.settings.max_idle_connections {
      idle.push(session);
    }
  }

  async fn connect(&self) -> Result<Session, ProviderError> {
    let settings = &self.settings;
    let stream = tokio::time::timeout(settings.timeout, self.connector.open(&settings.hostname, settings.port))
      .await
      .map_err(|_| {
        ProviderError::new(
          ProviderErrorKind::Connection,
          format!("connect to {}:{} timed out", settings.hostname, settings.port),
        )
      })?
      .map_err(|e| {
        ProviderError::new(
          ProviderErrorKind::Connection,
          format!("connect to {}:{} failed: {e}", settings.hostname, settings.port),
        )
      })?;

    let stream = match settings.security {
      SecurityMode::Tls => self.start_tls(stream).await?,
      SecurityMode::StartTls | SecurityMode::Plain => stream,
    };

    let mut session = Session::new(stream, settings.timeout);
    let preauthenticated = session.read_greeting().await?;

    if settings.security == SecurityMode::StartTls {
      session
        .command("STARTTLS")
        .await?
        .ensure_ok(ProviderErrorKind::TlsNegotiation)?;
      let upgraded = self.start_tls(session.into_stream()).await?;
      session = Session::new(upgraded, settings.timeout);
    }

    if !preauthenticated {
      session.authenticate(&self.credentials).await?;
    }

    debug!(
      host = %settings.hostname,
      port = settings.port,
      security = ?settings.security,
      "IMAP session established"
    );
    Ok(session)
  }

  async fn start_tls(&self, stream: BoxedStream) -> Result<BoxedStream, ProviderError> {
    let connector = self
      .tls
      .as_ref()
      .ok_or_else(|| ProviderError::new(ProviderErrorKind::TlsNegotiation, "TLS is unavailable"))?;
    let server_name = ServerName::try_from(self.settings.hostname.clone()).map_err(|e| {
      ProviderError::new(
        ProviderErrorKind::Certificate,
        format!("invalid server name {}: {e}", self.settings.hostname),
      )
    })?;

    let tls = tokio::time::timeout(self.settings.timeout, connector.connect(server_name, stream))
      .await
      .map_err(|_| ProviderError::new(ProviderErrorKind::TlsNegotiation, "TLS handshake timed out"))?
      .map_err(tls_error)?;
    Ok(Box::new(tls))
  }
}

#[async_trait]
impl MailTransport for ImapTransport {
  async fn search(&self, folder: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<MessageId>, ProviderError> {
    let mut session = self.session().await?;
    let result = session.search(folder, since, until).await;
    self.release(session, &result);
    result
  }

  async fn fetch(&self, folder: &str, id: MessageId) -> Result<Vec<u8>, ProviderError> {
    let mut session = self.session().await?;
    let result = session.fetch(folder, id).await;
    self.release(session, &result);
    result
  }
}
