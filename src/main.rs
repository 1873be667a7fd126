use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use demory::config::{ClientArgs, ClientOp, Cli, Command, Config};

const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_node(cli.config).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_node(config: Config) -> Result<()> {
    tracing::info!(
        version = demory::version::VERSION,
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        "starting demory"
    );
    let node = demory::node::start(&config).await?;
    node.run_until(shutdown_signal()).await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let mut client = demory::rpc::connect(&args.target, CLIENT_CONNECT_TIMEOUT).await?;

    match args.op {
        ClientOp::MapPut { name, key, value } => {
            client.map_put(&name, &key, value.into_bytes()).await?;
            println!("ok");
        }
        ClientOp::MapGet { name, key } => print_value(client.map_get(&name, &key).await?),
        ClientOp::MapPutIfAbsent { name, key, value } => {
            client
                .map_put_if_absent(&name, &key, value.into_bytes())
                .await?;
            println!("ok");
        }
        ClientOp::MapRemove { name, key } => {
            client.map_remove(&name, &key).await?;
            println!("ok");
        }
        ClientOp::MapClear { name } => {
            client.map_clear(&name).await?;
            println!("ok");
        }
        ClientOp::CachePut { name, key, value } => {
            client.cache_put(&name, &key, value.into_bytes()).await?;
            println!("ok");
        }
        ClientOp::CacheGet { name, key } => print_value(client.cache_get(&name, &key).await?),
        ClientOp::CacheRemove { name, key } => {
            client.cache_remove(&name, &key).await?;
            println!("ok");
        }
        ClientOp::CacheClear { name } => {
            client.cache_clear(&name).await?;
            println!("ok");
        }
    }
    Ok(())
}

fn print_value(value: Option<Vec<u8>>) {
    match value {
        Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        None => println!("(not found)"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
