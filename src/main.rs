use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use storefront_images::config::{self, ServiceConfig};
use storefront_images::imaging::RustBackend;
use storefront_images::service::ImageService;
use storefront_images::{http, seed};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn version_string() -> &'static str {
    let build = env!("STOREFRONT_BUILD_ID");
    if build.is_empty() {
        env!("CARGO_PKG_VERSION")
    } else {
        // Leaked once at startup
        Box::leak(format!("{} ({build})", env!("CARGO_PKG_VERSION")).into_boxed_str())
    }
}

#[derive(Parser)]
#[command(name = "storefront-images")]
#[command(about = "Image upload, resize and derivative caching for a storefront")]
#[command(long_about = "\
Image upload, resize and derivative caching for a storefront

Originals are stored under <root>/public/images and resized variants under
<root>/public/cache. Variants are rendered on first request and served from
the cache afterwards.

  GET    /images                       list originals
  GET    /images/{file}?width=&height=&format=&quality=&fit=&position=
  POST   /images/upload                multipart 'image' (admin)
  DELETE /images/{file}                original + derivatives (admin)
  GET    /images/cache/stats           cache counters (admin)

Run 'storefront-images gen-config' to generate a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file (missing file = stock defaults)
    #[arg(long, default_value = "config.toml", global = true, env = "STOREFRONT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Download the demo product images before serving
        #[arg(long)]
        seed: bool,
    },
    /// Download the demo product images into the store
    Seed,
    /// Validate the configuration and storage layout without serving
    Check,
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn load(cli: &Cli) -> Result<ServiceConfig, config::ConfigError> {
    let mut config = config::load_config(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn open_service(config: &ServiceConfig) -> Result<ImageService, Box<dyn std::error::Error>> {
    Ok(ImageService::open(config, Arc::new(RustBackend::new())).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { seed: with_seed } => {
            let config = load(&cli)?;
            let service = open_service(&config).await?;
            if with_seed {
                let report = seed::seed_product_images(&service).await?;
                info!(%report, "demo images ready");
            }
            http::serve(&config, service).await?;
        }
        Command::Seed => {
            let config = load(&cli)?;
            let service = open_service(&config).await?;
            let report = seed::seed_product_images(&service).await?;
            println!("Seed: {report}");
            for (name, error) in &report.failed {
                println!("  {name}: {error}");
            }
        }
        Command::Check => {
            let config = load(&cli)?;
            println!("==> Config OK ({})", cli.config.display());
            let service = open_service(&config).await?;
            let originals = service.list().await?;
            println!("==> {} originals in {}", originals.len(), config.images_dir().display());
            let stats = service.cache_stats().await;
            println!(
                "==> {} cached derivatives ({} bytes) in {}",
                stats.entries,
                stats.bytes,
                config.cache_dir().display()
            );
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}
