/*! Connection setup: URI parsing, transport connect and optional AUTH. */

use std::{future::Future, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    channel::Connection,
    config::Config,
    error::{ChannelError, Result},
    resp::format_command,
};

pub const DEFAULT_PORT: u16 = 6379;

pub type TcpConnection = Connection<TcpStream>;
pub type TlsConnection = Connection<TlsStream<TcpStream>>;

/**
 * Where to connect and how to authenticate, parsed from `redis://` or `rediss://`
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisUri {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl RedisUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|err| ChannelError::InvalidUri(format!("{}: {}", uri, err)))?;

        let tls = match url.scheme() {
            "redis" => false,
            "rediss" => true,
            scheme => return Err(ChannelError::InvalidUri(format!("unsupported scheme '{}'", scheme))),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ChannelError::InvalidUri(format!("{}: missing host", uri)))?
            .to_owned();

        let user = Some(url.username()).filter(|user| !user.is_empty()).map(str::to_owned);
        let password = url.password().filter(|pass| !pass.is_empty()).map(str::to_owned);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            tls,
            user,
            password,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /**
     * `AUTH <user> <pass>` with both credentials, `AUTH <token>` with only one
     */
    pub fn auth_command(&self) -> Result<Option<String>> {
        let command = match (&self.user, &self.password) {
            (Some(user), Some(pass)) => format_command("AUTH {0} {1}", &[user, pass])?,
            (Some(token), None) | (None, Some(token)) => format_command("AUTH {0}", &[token])?,
            (None, None) => return Ok(None),
        };
        Ok(Some(command))
    }
}

/**
 * Opens a plain TCP connection and authenticates if the URI carries credentials
 */
pub async fn connect(uri: &str, config: &Config) -> Result<TcpConnection> {
    let target = RedisUri::parse(uri)?;
    let stream = tcp_connect(&target, config).await?;

    authenticate(Connection::new(stream, config.clone()), &target).await
}

/**
 * Same as [`connect`] over TLS, verified against the webpki root store
 */
pub async fn connect_tls(uri: &str, config: &Config) -> Result<TlsConnection> {
    let target = RedisUri::parse(uri)?;
    let stream = tcp_connect(&target, config).await?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let domain = ServerName::try_from(target.host.as_str())
        .map_err(|_| ChannelError::Tls(format!("invalid TLS domain name '{}'", target.host)))?
        .to_owned();

    debug!(addr = %target.addr(), "starting TLS handshake");
    let stream = with_deadline(config, connector.connect(domain, stream))
        .await?
        .map_err(|err| ChannelError::Tls(format!("handshake failed: {}", err)))?;

    authenticate(Connection::new(stream, config.clone()), &target).await
}

async fn tcp_connect(target: &RedisUri, config: &Config) -> Result<TcpStream> {
    let addr = target.addr();
    debug!(%addr, "connecting");

    let stream = with_deadline(config, TcpStream::connect(&addr)).await??;
    stream.set_nodelay(true)?;

    info!(%addr, tls = target.tls, "connected");
    Ok(stream)
}

async fn with_deadline<F: Future>(config: &Config, future: F) -> Result<F::Output> {
    timeout(config.connect_timeout, future)
        .await
        .map_err(|_| ChannelError::Timeout(config.connect_timeout))
}

async fn authenticate<T>(connection: Connection<T>, target: &RedisUri) -> Result<Connection<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(auth) = target.auth_command()? {
        connection.exec(&auth, |_| {}).await?;
        debug!("authenticated");
    }
    Ok(connection)
}
