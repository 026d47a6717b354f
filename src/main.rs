use blockmeta_indexer::{
    config::Config, db, driver::Driver, opts::Opts, prelude::*, util::Shutdown,
};
use clap::Parser;
use std::env;

fn run() -> Result<()> {
    let opts = Opts::parse();

    match &opts.env_file {
        Some(path) => {
            dotenv::from_path(path)
                .with_context(|| format!("loading env file {}", path.display()))?;
        }
        None => {
            dotenv::dotenv().ok();
        }
    }

    if opts.wipe_db {
        let url = match &opts.overrides.database_url {
            Some(url) => url.clone(),
            None => env::var("DATABASE_URL").context("DATABASE_URL")?,
        };
        db::pg::PgStore::wipe(&url)?;
        return Ok(());
    }

    let config = Config::from_env(&opts.overrides)?;
    debug!("{:?}", config);

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Received interrupt; finishing in-flight heights");
            shutdown.trigger();
        })
        .context("installing Ctrl-C handler")?;
    }

    let mut driver = Driver::from_config(&config, shutdown)?;
    if opts.once {
        let report = driver.run_until_idle()?;
        info!("Caught up: {}", report);
    } else {
        driver.run()?;
    }

    Ok(())
}

fn main() {
    // Best-effort initialize logger so top-level errors are visible even if run() fails early.
    let _ = env_logger::try_init();
    if let Err(e) = run() {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
