use clap::Parser;
use nimbus_core::error::IntoNimbusError;
use nimbus_node::cli::Cli;
use nimbus_node::config::NodeConfig;
use nimbus_node::error::exit_code_for;
use nimbus_node::host;
use nimbus_node::observability::init_tracing;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let overrides = cli.into_overrides();
    let config = match NodeConfig::load(overrides) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    let join_target = config.join;
    let node = match host::build(config).await {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "failed to build node");
            let kind = err.into_nimbus_error().kind();
            std::process::exit(exit_code_for(kind));
        }
    };

    let node_id = node.raft.id().clone();
    let node_config = node.config.clone();
    if let Some(target) = join_target {
        if let Err(err) = host::request_join(target, &node_config, &node_id).await {
            error!(%err, "failed to join the cluster through {target}");
            std::process::exit(3);
        }
    }

    let shutdown = host::spawn_raft_driver(node.raft);

    let listener = match tokio::net::TcpListener::bind(node_config.http_bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "failed to bind http listener");
            shutdown.cancel();
            std::process::exit(1);
        }
    };

    info!(http = %node_config.http_bind, rpc = %node_config.rpc_bind, node = %node_id, "nimbusd ready");

    let serve_result = axum::serve(listener, node.router).with_graceful_shutdown(shutdown_signal()).await;
    shutdown.cancel();

    if let Err(err) = serve_result {
        error!(%err, "http server exited with an error");
        std::process::exit(1);
    }

    let _ = node.quic;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
