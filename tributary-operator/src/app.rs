//! The operator application.
//!
//! The application owns two long-running tasks: the health & metrics HTTP server, and the K8s
//! controller. A termination signal, an explicit shutdown, or either task exiting on its own
//! begins a graceful shutdown of everything else.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::server::spawn_http_server;

/// A long-running task of the application, by name.
type AppTask = (&'static str, JoinHandle<Result<()>>);

/// The application object for when the Tributary operator is running.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    tasks: Vec<AppTask>,
}

impl App {
    /// Create a new instance, spawning the HTTP server & controller.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let server = spawn_http_server(&config, metrics, shutdown_tx.subscribe());
        let controller = Controller::new(client, config, shutdown_tx.clone())?.spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            tasks: vec![("http server", server), ("k8s controller", controller)],
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        let exited = tokio::select! {
            Some((_, sig)) = signals.next() => {
                tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                None
            }
            _ = self.shutdown_rx.next() => None,
            (res, idx, _) = futures::future::select_all(self.tasks.iter_mut().map(|(_, task)| task)) => Some((idx, res)),
        };
        let _ = self.shutdown_tx.send(());

        // A task which already exited must not be awaited again.
        if let Some((idx, res)) = exited {
            let (name, _) = self.tasks.remove(idx);
            tracing::warn!(task = name, "task exited before shutdown was requested");
            log_task_exit(name, res);
        }

        tracing::debug!("Tributary Operator is shutting down");
        for (name, task) in self.tasks.drain(..) {
            log_task_exit(name, task.await);
        }
        tracing::debug!("Tributary Operator shutdown complete");
        Ok(())
    }
}

fn log_task_exit(name: &str, res: Result<Result<()>, JoinError>) {
    match res.with_context(|| format!("error joining {} handle", name)).and_then(|res| res) {
        Ok(()) => tracing::debug!(task = name, "task shut down"),
        Err(err) => tracing::error!(task = name, error = ?err, "error shutting down task"),
    }
}
