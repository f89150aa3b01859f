pub mod analyzer;
pub mod model;
pub mod settings;
pub mod telemetry;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    signal,
};

use crate::{
    analyzer::{
        Consumer, Conntracker,
        network::NetworkAnalyzer,
        tcpconnect::{CONSUMABLE_EVENTS, TcpConnectAnalyzer, TcpConnectHandle},
    },
    model::RawEvent,
    settings::Settings,
};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Wires a stream of raw events into both analyzers.
pub struct NetBeeEngine {
    pub settings: Settings,
    network: Arc<NetworkAnalyzer>,
    consumers: Vec<Arc<dyn Consumer>>,
    conntracker: Option<Arc<dyn Conntracker>>,
}

impl NetBeeEngine {
    pub fn new(
        settings: Settings,
        consumers: Vec<Arc<dyn Consumer>>,
        conntracker: Option<Arc<dyn Conntracker>>,
    ) -> Self {
        let network = Arc::new(NetworkAnalyzer::new(
            settings.network.clone(),
            consumers.clone(),
            conntracker.clone(),
        ));
        Self {
            settings,
            network,
            consumers,
            conntracker,
        }
    }

    pub fn network(&self) -> &Arc<NetworkAnalyzer> {
        &self.network
    }

    /// Consume newline-delimited JSON events until the input ends or Ctrl-C.
    ///
    /// On exit every pending dialog is flushed so nothing buffered is lost.
    /// The shutdown flag is cleared on entry, so an engine can run again
    /// after an earlier run in the same process has stopped.
    pub async fn run<R>(self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        SHUTDOWN.store(false, Ordering::Relaxed);
        let shutdown = shutdown_flag();
        let reaper = self.network.spawn_idle_reaper(shutdown)?;
        let (tcp_connect, tcp_task) = TcpConnectAnalyzer::new(
            self.settings.tcp_connect.clone(),
            self.consumers.clone(),
            self.conntracker.clone(),
        )
        .start();

        info!("Monitoring active. Press Ctrl-C to exit.");

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut lines = input.lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line.context("Failed to read event stream")? {
                    Some(line) => self.feed(&tcp_connect, &line).await,
                    None => {
                        info!("Event stream closed");
                        break;
                    }
                },
                res = &mut ctrl_c => {
                    res?;
                    info!("Exiting...");
                    break;
                }
            }
        }

        request_shutdown();
        drop(tcp_connect);
        tcp_task.await.context("TCP connect analyzer panicked")?;

        tokio::task::spawn_blocking(move || reaper.join())
            .await?
            .map_err(|_| anyhow!("Idle reaper panicked"))?;

        let flushed = self.network.reap_idle(u64::MAX);
        if flushed > 0 {
            info!("Flushed {} pending message pairs", flushed);
        }
        Ok(())
    }

    async fn feed(&self, tcp_connect: &TcpConnectHandle, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let evt: RawEvent = match serde_json::from_str(line) {
            Ok(evt) => evt,
            Err(e) => {
                warn!("Skipping malformed event: {}", e);
                return;
            }
        };

        if CONSUMABLE_EVENTS.contains(&evt.name.as_str()) {
            if let Err(e) = tcp_connect.consume_event(evt.clone()).await {
                warn!("Failed to forward {} event: {:#}", evt.name, e);
            }
        }
        if let Err(e) = self.network.consume_event(evt) {
            debug!("Network analyzer rejected event: {:#}", e);
        }
    }
}
