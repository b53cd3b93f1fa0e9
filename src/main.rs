#[macro_use]
extern crate log;

fn main() {
    pretty_env_logger::init();

    info!("Loading config");
    let config = match storage_authority::Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to get config: {}", e);
            std::process::exit(1);
        }
    };
    let options = match config.sa_options() {
        Ok(o) => o,
        Err(e) => {
            error!("Invalid config: {}", e);
            std::process::exit(1);
        }
    };

    info!("Setting up runtime");
    let rt = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to setup Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    info!("Running migrations");
    if let Err(e) = storage_authority::run_migrations(&config.database_url) {
        error!("{}", e);
        std::process::exit(1);
    }

    let db_pool = storage_authority::build_pool(&config.database_url, config.max_open_conns);
    let sa = match storage_authority::StorageAuthority::new(db_pool, options) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to setup storage authority: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(sa.ping()) {
        error!("Storage authority is not usable: {}", e);
        std::process::exit(1);
    }
    info!(
        "Storage authority ready: {} open connection(s) max, {} parallel count(s) per call, unused challenge deletion {}",
        config.max_open_conns, options.parallelism_per_rpc,
        if options.delete_unused_challenges { "on" } else { "off" }
    );
}
