//! TCP server for flag submissions.
//!
//! Accepts connections, resolves the submitting team and runs a session per
//! connection against the shared validator.
//!
//! The connection limit is enforced before `accept`: once every slot is
//! taken the server stops accepting, and new clients wait in the kernel's
//! listen backlog until a slot frees up.

use crate::config::Config;
use crate::protocol::Response;
use crate::session::{handle_connection, SessionContext};
use crate::storage::FlagStore;
use crate::validator::Validator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

type ServerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server instance
pub struct Server {
    config: Config,
    store: Arc<dyn FlagStore>,
    context: Arc<SessionContext>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, store: Arc<dyn FlagStore>) -> Self {
        let validator = Validator::new(
            Arc::clone(&store),
            config.flag_format(),
            config.valid_ticks,
        );

        let context = SessionContext {
            validator: Arc::new(validator),
            teams: Arc::new(config.team_resolver()),
            banner: Response::banner(&config.banner),
            idle_timeout: config.idle_timeout(),
            max_line_length: config.max_line_length,
            max_pending: config.max_pending,
        };

        Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            context: Arc::new(context),
            store,
            config,
        }
    }

    /// Bind the listener and serve until an unrecoverable error
    pub async fn run(&self) -> ServerResult {
        let addr = self.config.listen_addr();
        let listener = create_listener(addr, self.config.backlog)?;
        info!(address = %addr, max_connections = self.config.max_connections, "Server listening");

        if self.config.stats_interval > 0 {
            let context = Arc::clone(&self.context);
            let interval = self.config.stats_interval;
            tokio::spawn(async move {
                stats_task(context, interval).await;
            });
        }

        if self.config.reload_interval > 0 {
            let store = Arc::clone(&self.store);
            let interval = self.config.reload_interval;
            tokio::spawn(async move {
                reload_task(store, interval).await;
            });
        }

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> ServerResult {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let context = Arc::clone(&self.context);

                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        match handle_connection(reader, writer, addr, context).await {
                            Ok(state) => debug!(peer = %addr, ?state, "Connection closed"),
                            Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Connection slots currently free
    #[cfg(test)]
    pub fn available_connections(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get a reference to the session context for testing
    #[cfg(test)]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }
}

/// Create a non-blocking listener with an explicit accept backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // Accept IPv4-mapped peers on a wildcard IPv6 listener
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Background task logging submission counters
async fn stats_task(context: Arc<SessionContext>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let stats = context.validator.stats().snapshot();
        info!(
            ok = stats.ok,
            dup = stats.dup,
            own = stats.own,
            old = stats.old,
            inv = stats.inv,
            err = stats.err,
            "Submission statistics"
        );
    }
}

/// Background task pulling newly issued flags
async fn reload_task(store: Arc<dyn FlagStore>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.tick().await;

    loop {
        interval.tick().await;
        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || store.refresh()).await {
            Ok(Ok(count)) => debug!(flags = count, "Flag store refreshed"),
            // Keep serving from the previous data
            Ok(Err(e)) => warn!(error = %e, "Failed to refresh flag store"),
            Err(e) => warn!(error = %e, "Flag store refresh panicked"),
        }
    }
}
