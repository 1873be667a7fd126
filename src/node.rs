use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;

use crate::{
    config::Config,
    discovery::DiscoveryStrategy,
    raft::{
        ConsensusEngine, RealRaft,
        http_rpc::{RaftRpcState, build_raft_rpc_router},
        network_http::HttpNetworkFactory,
        raft_node_id,
        runtime::{RaftSettings, start_raft},
    },
    rpc::DemoryService,
    store::Store,
};

/// A started node: raft transport, gRPC surface and discovery all running.
pub struct RunningNode {
    pub raft: RealRaft,
    pub store: Store,
    pub grpc_addr: SocketAddr,
    pub raft_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn start(config: &Config) -> anyhow::Result<RunningNode> {
    config.validate()?;

    let store = Store::new(config.cache_capacity());
    let node_id = raft_node_id(&config.node_id);
    let raft = start_raft(
        &config.data_dir,
        node_id,
        store.clone(),
        RaftSettings {
            snapshot_logs: config.snapshot_logs,
            ..RaftSettings::default()
        },
        HttpNetworkFactory::new()?,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let raft_listener = TcpListener::bind(config.raft_bind)
        .await
        .with_context(|| format!("bind raft rpc {}", config.raft_bind))?;
    let raft_addr = raft_listener.local_addr()?;
    let router = build_raft_rpc_router(RaftRpcState { raft: raft.raft() });
    let raft_shutdown = wait_for_shutdown(shutdown_rx.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(err) = axum::serve(raft_listener, router)
            .with_graceful_shutdown(raft_shutdown)
            .await
        {
            tracing::error!(error = %err, "raft rpc server failed");
        }
    }));
    tracing::info!(%raft_addr, "raft rpc listening");

    // Clients are only served once the bootstrap decision is made.
    let engine: Arc<dyn ConsensusEngine> = Arc::new(raft.clone());
    let discovery = match DiscoveryStrategy::from_config(config, engine.clone()).await {
        Ok(discovery) => discovery,
        Err(err) => {
            stop(&shutdown_tx, tasks, &raft).await;
            return Err(err.context("configure discovery"));
        }
    };
    if let Err(err) = discovery.bootstrap().await {
        stop(&shutdown_tx, tasks, &raft).await;
        return Err(err.into());
    }

    let grpc_listener = match TcpListener::bind(config.grpc_bind()).await {
        Ok(listener) => listener,
        Err(err) => {
            stop(&shutdown_tx, tasks, &raft).await;
            return Err(
                anyhow::Error::new(err).context(format!("bind grpc {}", config.grpc_bind()))
            );
        }
    };
    let grpc_addr = grpc_listener.local_addr()?;
    let service = DemoryService::new(
        engine,
        store.clone(),
        config.write_timeout(),
        config.membership_timeout(),
    );
    let grpc_shutdown = wait_for_shutdown(shutdown_rx.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(err) = tonic::transport::Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming_shutdown(TcpListenerStream::new(grpc_listener), grpc_shutdown)
            .await
        {
            tracing::error!(error = %err, "grpc server failed");
        }
    }));
    tracing::info!(%grpc_addr, "grpc listening");

    // Bootstrap already ran above; this only starts the periodic scan.
    match discovery
        .discover(config.discovery_interval(), shutdown_rx)
        .await
    {
        Ok(handle) => tasks.push(handle),
        Err(err) => {
            stop(&shutdown_tx, tasks, &raft).await;
            return Err(err.into());
        }
    }
    tracing::info!(
        node_id = %config.node_id,
        strategy = ?config.discovery_strategy,
        "node started"
    );

    Ok(RunningNode {
        raft,
        store,
        grpc_addr,
        raft_addr,
        shutdown_tx,
        tasks,
    })
}

impl RunningNode {
    /// Serves until `signal` resolves, then shuts down.
    pub async fn run_until(self, signal: impl Future<Output = ()>) {
        signal.await;
        tracing::info!("shutdown requested");
        self.shutdown().await;
    }

    pub async fn shutdown(self) {
        stop(&self.shutdown_tx, self.tasks, &self.raft).await;
    }
}

async fn stop(shutdown_tx: &watch::Sender<bool>, tasks: Vec<JoinHandle<()>>, raft: &RealRaft) {
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "node task panicked");
        }
    }
    if let Err(err) = raft.raft().shutdown().await {
        tracing::warn!(error = %err, "raft shutdown failed");
    }
    tracing::info!("node stopped");
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
