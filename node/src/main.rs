use chordal_node::{api, spawn_key_migration, ChordNode, Config};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    let node = match ChordNode::from_config(&config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            std::process::exit(2);
        }
    };

    let _migration = spawn_key_migration(node.clone());
    node.start_maintenance(config.maintenance_interval);

    if let Some(port) = config.api_port {
        let api_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run(api_node, port).await {
                error!("API server failed: {}", e);
            }
        });
    }

    let server_node = node.clone();
    let bind_address = config.bind_address.clone();
    let server = tokio::spawn(async move { server_node.serve(&bind_address).await });

    match &config.bootstrap_address {
        Some(bootstrap) => {
            if let Err(e) = node.join(bootstrap).await {
                error!("Failed to join via {}: {}", bootstrap, e);
                node.stop_maintenance();
                std::process::exit(1);
            }
        }
        None => node.start_new_network(),
    }

    tokio::select! {
        result = server => match result {
            Ok(Ok(())) => info!("Server stopped"),
            Ok(Err(e)) => error!("Server failed: {}", e),
            Err(e) => error!("Server task panicked: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            node.leave().await;
        }
    }
}
