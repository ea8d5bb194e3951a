use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use geotile_rs::config::{ConfigOverrides, GeoTileConfig, ServerOverrides};
use geotile_rs::grpc::MapGrpcService;
use geotile_rs::model::PlayerProfile;
use geotile_rs::persistence::{PersistentOpenOptions, PersistentStore};
use geotile_rs::{InMemoryProfiles, MapService, MemoryStore, SystemClock};
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sweeps run back to back while a sweep reports leftover work.
const MAX_RETENTION_PASSES: usize = 20;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    println!(
        "geotile_server\n\n\
         Usage: geotile_server [OPTIONS]\n\n\
         Options:\n\
         \x20 --config <path>     TOML configuration file\n\
         \x20 --listen <addr>     gRPC listen address (default 127.0.0.1:50070)\n\
         \x20 --data-dir <path>   RocksDB directory; in-memory store when omitted\n\
         \x20 --profiles <path>   JSON array of player profiles\n\
         \x20 --repair            Repair the RocksDB directory before opening\n\
         \x20 --help              Print this help\n\n\
         Environment: GEOTILE_<SECTION>__<KEY>, e.g. GEOTILE_INDEX__TILE_PRECISION=6"
    );
}

fn load_profiles(path: Option<String>) -> anyhow::Result<InMemoryProfiles> {
    let profiles = InMemoryProfiles::new();
    if let Some(path) = path {
        let raw = fs::read_to_string(path)?;
        let entries: Vec<PlayerProfile> = serde_json::from_str(&raw)?;
        for profile in entries {
            profiles.insert(profile);
        }
    }
    Ok(profiles)
}

fn build_service(config: &GeoTileConfig, profiles: InMemoryProfiles) -> anyhow::Result<MapService> {
    let profiles = Arc::new(profiles);
    let clock = Arc::new(SystemClock);
    match &config.server.data_dir {
        Some(dir) => {
            let store = PersistentStore::open_with_options(
                dir,
                PersistentOpenOptions {
                    repair: config.server.repair,
                    cache_capacity: config.storage.tile_cache_entries,
                },
            )?;
            info!(data_dir = %dir.display(), "opened persistent store");
            Ok(MapService::new(Arc::new(store), profiles, clock, config))
        }
        None => {
            warn!("no data directory configured, using the in-memory store");
            Ok(MapService::new(
                Arc::new(MemoryStore::new()),
                profiles,
                clock,
                config,
            ))
        }
    }
}

fn spawn_retention(service: MapService, config: &GeoTileConfig) {
    let period = config.retention.interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for _ in 0..MAX_RETENTION_PASSES {
                match service.run_retention().await {
                    Ok(report) if report.has_more => continue,
                    Ok(_) => break,
                    Err(err) => {
                        warn!(error = %err, "retention sweep failed");
                        break;
                    }
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen = parse_arg("--listen")
        .map(|value| value.parse::<SocketAddr>())
        .transpose()?;
    let overrides = ConfigOverrides {
        server: Some(ServerOverrides {
            listen,
            data_dir: parse_arg("--data-dir").map(PathBuf::from),
            repair: has_flag("--repair").then_some(true),
        }),
    };
    let config_path = parse_arg("--config");
    let config = GeoTileConfig::load(config_path.as_deref(), overrides)?;

    let profiles = load_profiles(parse_arg("--profiles"))?;
    let service = build_service(&config, profiles)?;
    spawn_retention(service.clone(), &config);

    let addr = config.server.listen;
    info!(%addr, tile_precision = config.index.tile_precision, "geotile server listening");
    Server::builder()
        .add_service(MapGrpcService::new(service).into_server())
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
