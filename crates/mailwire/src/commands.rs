//! Sub-command implementations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mailwire_client::{Dialect, Imap, MailConfig, MailConnection, Pop3, Security, Smtp};
use mailwire_milter::{CachedDirectory, Directory, MilterService, StaticDirectory};
use mailwire_server::{Record, Server, ServerHandle, ShutdownReport, TlsContext, parse_records};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::admin::{AdminService, AdminState, END_OF_LISTING};
use crate::config::Config;

/// Timeout for each admin channel read.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the milter and admin listeners until SIGINT or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let tls = match &config.tls {
        Some(tls) => Some(Arc::new(
            TlsContext::from_pem_files(&tls.cert, &tls.key, &tls.excluded_ciphers)
                .context("failed to set up TLS")?,
        )),
        None => None,
    };

    let directory = Arc::new(CachedDirectory::new(StaticDirectory::new(
        config.groups.iter().cloned(),
    )));
    info!(groups = directory.inner().len(), "Group directory loaded");
    let state = Arc::new(AdminState::new(Arc::clone(&directory)));

    let milter = MilterService::new(Arc::clone(&directory) as Arc<dyn Directory>)
        .bind(config.milter.to_server_config("milter")?, tls.clone())
        .await
        .context("failed to start the milter listener")?;
    let admin = Server::bind(
        config.admin.to_server_config("admin")?,
        AdminService::new(Arc::clone(&state)),
        tls,
    )
    .await
    .context("failed to start the admin listener")?;

    let handles: Vec<ServerHandle> = vec![milter.handle(), admin.handle()];
    for handle in &handles {
        state.watch(handle.registry().clone());
    }
    let milter_task = tokio::spawn(milter.run());
    let admin_task = tokio::spawn(admin.run());

    shutdown_signal().await?;
    info!("Shutdown requested");
    for handle in &handles {
        handle.shutdown();
    }

    let (milter_report, admin_report) = tokio::join!(milter_task, admin_task);
    log_report("milter", milter_report.context("milter listener panicked")??);
    log_report("admin", admin_report.context("admin listener panicked")??);
    Ok(())
}

fn log_report(listener: &str, report: ShutdownReport) {
    if report.forced > 0 || report.undrained > 0 {
        warn!(
            listener,
            forced = report.forced,
            undrained = report.undrained,
            "Listener did not stop cleanly"
        );
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Client side of the admin channel.
pub struct AdminClient {
    stream: BufReader<TcpStream>,
}

impl AdminClient {
    /// Connects and checks the greeting.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(ADMIN_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        let greeting = client.read_line().await?;
        if !greeting.starts_with("OK") {
            bail!("unexpected admin greeting: {greeting}");
        }
        Ok(client)
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(ADMIN_TIMEOUT, self.stream.read_line(&mut line))
            .await
            .context("timed out waiting for the admin channel")??;
        if n == 0 {
            bail!("admin channel closed");
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn expect_ok(&mut self) -> Result<String> {
        let reply = self.read_line().await?;
        match reply.strip_prefix("OK") {
            Some(rest) => Ok(rest.trim().to_string()),
            None => bail!("admin command failed: {reply}"),
        }
    }

    /// Fetches the session listing.
    pub async fn status(&mut self) -> Result<Vec<Record>> {
        self.send("STATUS").await?;
        let mut listing = String::new();
        loop {
            let line = self.read_line().await?;
            if line == END_OF_LISTING {
                break;
            }
            if line.starts_with("ERR") {
                bail!("admin command failed: {line}");
            }
            listing.push_str(&line);
            listing.push('\n');
        }
        let mut records = Vec::new();
        parse_records(&listing, "id", |record| records.push(record));
        Ok(records)
    }

    /// Clears the directory cache, returning how many entries were dropped.
    pub async fn flush_cache(&mut self) -> Result<usize> {
        self.send("FLUSH CACHE").await?;
        let reply = self.expect_ok().await?;
        reply
            .strip_prefix("flushed")
            .and_then(|n| n.trim().parse().ok())
            .with_context(|| format!("unexpected reply: OK {reply}"))
    }

    /// Ends the session.
    pub async fn quit(mut self) -> Result<()> {
        self.send("QUIT").await?;
        self.expect_ok().await?;
        Ok(())
    }
}

/// Prints the sessions of a running daemon.
pub async fn status(addr: SocketAddr) -> Result<()> {
    let mut client = AdminClient::connect(addr).await?;
    let records = client.status().await?;
    client.quit().await?;

    println!(
        "{:>6}  {:<8}  {:<24}  {:<20}  {:>8}  {:>8}  TLS",
        "ID", "PROTOCOL", "PEER", "STARTED", "FRAMES", "PENDING"
    );
    for record in &records {
        let field = |key| record.get(key).unwrap_or("-");
        println!(
            "{:>6}  {:<8}  {:<24}  {:<20}  {:>8}  {:>8}  {}",
            field("id"),
            field("protocol"),
            field("peer"),
            field("started"),
            field("frames"),
            field("pending"),
            field("tls"),
        );
    }
    println!("{} session(s)", records.len());
    Ok(())
}

/// Clears the daemon's directory cache.
pub async fn flush_cache(addr: SocketAddr) -> Result<()> {
    let mut client = AdminClient::connect(addr).await?;
    let flushed = client.flush_cache().await?;
    client.quit().await?;
    println!("Flushed {flushed} cached directory entries");
    Ok(())
}

/// Protocol to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CheckProtocol {
    Imap,
    Pop3,
    Smtp,
}

/// Security mode for the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CheckSecurity {
    None,
    Ssl,
    Tls,
    TlsIfAvailable,
}

impl From<CheckSecurity> for Security {
    fn from(security: CheckSecurity) -> Self {
        match security {
            CheckSecurity::None => Self::None,
            CheckSecurity::Ssl => Self::Ssl,
            CheckSecurity::Tls => Self::Tls,
            CheckSecurity::TlsIfAvailable => Self::TlsIfAvailable,
        }
    }
}

/// What to check and how.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub protocol: CheckProtocol,
    pub host: String,
    pub port: Option<u16>,
    pub security: CheckSecurity,
    pub user: Option<String>,
    pub mechanism: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// Connects to a mail server, optionally authenticates, and logs out.
pub async fn check(options: CheckOptions) -> Result<()> {
    let mut builder = MailConfig::builder(&options.host)
        .security(options.security.into())
        .connect_timeout(options.timeout)
        .read_timeout(options.timeout);
    if let Some(port) = options.port {
        builder = builder.port(port);
    }
    if let Some(user) = &options.user {
        builder = builder.authentication_id(user);
    }
    if let Some(mechanism) = &options.mechanism {
        builder = builder.mechanism(mechanism);
    }
    let config = builder.build().context("invalid check settings")?;
    let password = options.password.as_deref();

    match options.protocol {
        CheckProtocol::Imap => check_with::<Imap>(config, password).await,
        CheckProtocol::Pop3 => check_with::<Pop3>(config, password).await,
        CheckProtocol::Smtp => check_with::<Smtp>(config, password).await,
    }
}

async fn check_with<D: Dialect>(config: MailConfig, password: Option<&str>) -> Result<()> {
    let mut conn = MailConnection::<D>::new(config);
    let target = format!("{}:{}", conn.config().host, conn.port());
    conn.connect()
        .await
        .with_context(|| format!("{} connection to {target} failed", D::NAME))?;
    println!("Connected to {target} ({})", D::NAME);
    println!("Greeting: {}", conn.greeting().unwrap_or(""));
    println!("TLS: {}", if conn.is_tls() { "yes" } else { "no" });
    println!("State: {}", conn.state());

    if let Some(password) = password {
        if let Err(e) = conn.authenticate(password).await {
            conn.close().await;
            return Err(e).context("authentication failed");
        }
        println!("Authenticated; state: {}", conn.state());
        if let Some(qop) = conn.qop() {
            println!("Security layer: {qop:?}");
        }
    }

    conn.logout().await.context("logout failed")?;
    println!("Logged out");
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use mailwire_milter::{Group, GroupEntry, GroupResolver};
    use mailwire_server::ServerConfig;

    use super::*;

    async fn admin_server() -> (SocketAddr, ServerHandle, Arc<CachedDirectory<StaticDirectory>>) {
        let directory = Arc::new(CachedDirectory::new(StaticDirectory::new([GroupEntry {
            group: Group::new("staff@example.com"),
            allowed_senders: Vec::new(),
        }])));
        let state = Arc::new(AdminState::new(Arc::clone(&directory)));
        let config = ServerConfig::builder("admin", "127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();
        let server = Server::bind(config, AdminService::new(Arc::clone(&state)), None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        state.watch(handle.registry().clone());
        tokio::spawn(server.run());
        (addr, handle, directory)
    }

    #[tokio::test]
    async fn test_admin_client_round_trip() {
        let (addr, handle, directory) = admin_server().await;

        let mut client = AdminClient::connect(addr).await.unwrap();
        let records = client.status().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("protocol"), Some("admin"));
        assert_eq!(records[0].get("tls"), Some("false"));

        directory.resolve_group("staff@example.com").unwrap();
        assert_eq!(client.flush_cache().await.unwrap(), 1);
        assert_eq!(directory.cached(), 0);
        client.quit().await.unwrap();

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_admin_client_refuses_bad_greeting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 not an admin channel\r\n").await.unwrap();
        });
        let err = AdminClient::connect(addr).await.err().unwrap();
        assert!(err.to_string().contains("unexpected admin greeting"));
    }

    #[test]
    fn test_security_mapping() {
        assert_eq!(Security::from(CheckSecurity::Ssl), Security::Ssl);
        assert_eq!(
            Security::from(CheckSecurity::TlsIfAvailable),
            Security::TlsIfAvailable
        );
    }
}
