use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::broadcast::BroadcastDispatcher;
use crate::defs::ACCEPT_TICK_PERIOD_MSEC;
use crate::errors::ServerError;
use crate::market::Market;
use crate::registry::SessionRegistry;
use crate::session;

/// The broker server: accepts client connections, spawns a session per
/// connection, and owns the session registry, the broadcast dispatcher,
/// and the market's expiry sweeper.
pub struct MarketServer {
    listener: TcpListener,
    market: Arc<Market>,
    registry: Arc<SessionRegistry>,
    dispatcher: BroadcastDispatcher,
    running: Arc<AtomicBool>,
}

impl MarketServer {
    /// Binds the listener and starts the background machinery (broadcast
    /// dispatcher and expiry sweeper). Connections are not accepted until
    /// [`start`](Self::start) runs.
    pub fn new(addr: &str, market: Arc<Market>) -> Result<Self, ServerError> {
        log::info!("Binding market broker to address: {}", addr);
        let listener = TcpListener::bind(addr).map_err(|e| ServerError::Bind(e.to_string()))?;
        // Non-blocking accept lets the loop observe shutdown.
        listener
            .set_nonblocking(true)
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        log::info!("Market broker successfully bound to: {}", addr);

        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = BroadcastDispatcher::start(Arc::clone(&market), Arc::clone(&registry));
        market.start(dispatcher.sender());

        Ok(Self {
            listener,
            market,
            registry,
            dispatcher,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The address the listener is bound to. Useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Bind(e.to_string()))
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Each accepted connection gets its own session thread; a session
    /// failure never affects the loop or other sessions.
    pub fn start(&self) -> Result<(), ServerError> {
        log::info!("Market broker accepting connections");
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("New TCP connection from: {}", addr);
                    if let Err(e) = stream.set_nonblocking(false) {
                        log::warn!("Failed to configure socket for {}: {}", addr, e);
                        continue;
                    }
                    let market = Arc::clone(&self.market);
                    let registry = Arc::clone(&self.registry);
                    let events = self.dispatcher.sender();
                    let running = Arc::clone(&self.running);
                    thread::spawn(move || {
                        if let Err(e) = session::handle_connection(
                            stream, addr, market, registry, events, running,
                        ) {
                            log::warn!("Session for {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(ACCEPT_TICK_PERIOD_MSEC));
                }
                Err(e) => {
                    log::error!("Failed to accept TCP connection: {}", e);
                    return Err(ServerError::Accept(e.to_string()));
                }
            }
        }
        log::info!("Accept loop stopped");
        Ok(())
    }

    /// Stops accepting, drains the broadcast queue, stops the expiry
    /// sweeper, and closes every session. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down market broker");
        self.dispatcher.shutdown();
        self.registry.drain();
        self.market.shutdown();
        log::info!("Market broker shutdown complete");
    }
}

impl Drop for MarketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
