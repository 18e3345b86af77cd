mod keys;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use umbra_core::{Config, RouterContact};
use umbra_crypto::CryptoProvider;
use umbra_flow::EndpointConfig;
use umbra_router::{AppEvent, Router};

#[derive(Parser, Debug)]
#[command(name = "umbrad", about = "umbra overlay daemon")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Contact files (msgpack router contacts) to seed the store with.
    #[arg(long)]
    bootstrap: Vec<PathBuf>,
    /// Also run a hidden-service endpoint from this data dir.
    #[arg(long, default_value_t = false)]
    serve: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let crypto = CryptoProvider::new();
    let data_dir = config.data_dir.clone();
    let router_keys =
        keys::load_or_create_router(&crypto, &data_dir.join("router_keys.dat"))?;

    let (router, mut events) = Router::spawn(config, router_keys).await?;
    log::info!(
        "umbrad: router {} listening on {}",
        router.our_rc().router_id,
        router.local_addr()?
    );

    // persist the freshly signed contact so peers can bootstrap from it
    let rc_bytes = rmp_serde::to_vec(router.our_rc()).context("encoding our contact")?;
    std::fs::write(data_dir.join("self.rc"), rc_bytes).context("writing self.rc")?;

    for path in &args.bootstrap {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let rc: RouterContact = rmp_serde::from_slice(&bytes)
            .with_context(|| format!("decoding contact {}", path.display()))?;
        let router_id = rc.router_id;
        match router.add_contact(rc).await {
            Ok(()) => log::info!("umbrad: bootstrap contact {router_id}"),
            Err(err) => log::warn!("umbrad: rejected contact {router_id}: {err}"),
        }
    }

    if args.serve {
        let identity =
            keys::load_or_create_service(&crypto, &data_dir.join("service_keys.dat"))?;
        let address = router
            .add_endpoint(identity, EndpointConfig::default())
            .await;
        log::info!("umbrad: hidden service {address}");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Some(AppEvent::PathEstablished { outer }) => {
                        log::info!("umbrad: path {outer} established");
                    }
                    Some(AppEvent::PathDead { outer }) => {
                        log::info!("umbrad: path {outer} died");
                    }
                    Some(AppEvent::FlowEstablished { service, tag }) => {
                        log::info!("umbrad: flow {tag} up on {service}");
                    }
                    Some(AppEvent::FlowRejected { service, tag }) => {
                        log::info!("umbrad: flow {tag} rejected on {service}");
                    }
                    Some(AppEvent::FlowData { service, tag, data }) => {
                        log::info!(
                            "umbrad: {} bytes on {tag} for {service}",
                            data.len()
                        );
                    }
                    Some(AppEvent::IntroSetResolved { service, result }) => {
                        log::info!(
                            "umbrad: introset for {service}: {}",
                            if result.is_some() { "found" } else { "not found" }
                        );
                    }
                    None => break,
                }
            }
        }
    }

    log::info!("umbrad: shutting down");
    router.shutdown().await;
    Ok(())
}
