use clap::Parser;
use crawl_core::{Engine, EngineConfig, Result};
use std::path::Path;
use std::time::Duration;

mod args;
use args::{Args, Command, build_request};

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            ::log::error!("Failed to load configuration: {}", e);
            return;
        }
    };

    if config.job_store_path.is_none() && !matches!(args.command, Command::Crawl { .. }) {
        ::log::warn!("No job_store_path configured, jobs will not outlive this process");
    }

    let engine = match Engine::builder(config).build().await {
        Ok(engine) => engine,
        Err(e) => {
            ::log::error!("Failed to start engine: {}", e);
            return;
        }
    };

    if let Err(e) = run(&engine, args.command).await {
        ::log::error!("{}", e);
    }

    if let Err(e) = engine.shutdown().await {
        ::log::warn!("Shutdown did not complete cleanly: {}", e);
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides())
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Crawl {
            url,
            mode,
            options,
            client,
        } => {
            println!("Note: crawling requires a WebDriver server (e.g., ChromeDriver).");
            println!(
                "Set WEBDRIVER_URL environment variable if not using the default {}",
                engine.config().webdriver_url
            );
            let request = build_request(&url, mode, options.as_deref())?;
            let result = engine.crawl_now(&client, &client, request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Serve {
            maintenance_interval,
        } => serve(engine, Duration::from_secs(maintenance_interval.max(1))).await?,
        Command::AddJob {
            id,
            url,
            schedule,
            mode,
            options,
            owner,
        } => {
            let request = build_request(&url, mode, options.as_deref())?;
            let job = engine
                .scheduler()
                .add_job(&id, &owner, request, &schedule)
                .await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::ListJobs => {
            for job in engine.scheduler().list_jobs().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{:?}",
                    job.id,
                    job.schedule,
                    job.request.url,
                    if job.enabled { "enabled" } else { "disabled" },
                    job.status
                );
            }
        }
        Command::RemoveJob { id } => {
            if engine.scheduler().remove_job(&id).await? {
                println!("Removed job {}", id);
            } else {
                println!("No job named {}", id);
            }
        }
    }
    Ok(())
}

async fn serve(engine: &Engine, maintenance_interval: Duration) -> Result<()> {
    engine.scheduler().start().await?;
    ::log::info!("Serving scheduled jobs, press Ctrl-C to stop");

    let mut maintenance = tokio::time::interval(maintenance_interval);
    // The first tick completes immediately
    maintenance.tick().await;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                ::log::info!("Interrupt received, stopping scheduler");
                return Ok(());
            }
            _ = maintenance.tick() => {
                engine.maintain().await;
            }
        }
    }
}
