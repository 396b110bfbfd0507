//! Entrypoint: parses configuration, starts one node, and serves incoming
//! connections until the process is killed.

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tsmesh::config::{Cli, Config};
use tsmesh::dispatcher;
use tsmesh::ids::NodeId;
use tsmesh::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let connect = cli.connect.or_else(|| config.bootstrap.as_ref().map(|b| format!("{}:{}", b.addr, b.port)));

    let allow_list = config.allow_list().context("parsing peer allow-list")?;
    let listener = TcpListener::bind((config.bind.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.bind, config.port))?;
    let local_addr = listener.local_addr()?;

    let node = match &connect {
        None => {
            tracing::info!(addr = %local_addr, "founding a new mesh as node 1");
            Node::new(NodeId::FOUNDER)
        }
        Some(addr) => {
            tracing::info!(addr, "joining an existing mesh");
            let mut stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
            let (my_id, bootstrap_id) =
                tsmesh::mesh::Mesh::handshake_join(&mut stream, config.port).await?;
            tracing::info!(node = %my_id, bootstrap = %bootstrap_id, "assigned node id");
            let node = Node::new(my_id);
            node.observe_node_id(bootstrap_id);
            let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
            let mux = node.mesh.adopt_connection(stream, bootstrap_id, inbound_tx);
            tokio::spawn(dispatcher::run_peer_inbound_loop(node.clone(), mux, inbound_rx));
            node
        }
    };

    node.mesh.set_my_addr(format!("{}:{}", config.bind, config.port));
    tracing::info!(node = %node.id, addr = %local_addr, "listening");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let node = node.clone();
        let allow_list = allow_list.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatcher::run_connection(node, stream, peer_addr, &allow_list).await {
                tracing::warn!(peer = %peer_addr, error = %err, "connection ended with an error");
            }
        });
    }
}
