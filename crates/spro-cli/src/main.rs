use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use spro_catalog::{CatalogConfig, CatalogService, CatalogSource, HttpCatalogSource, StaticCatalogSource};
use spro_store::DocumentStore;

#[derive(Debug, Parser)]
#[command(name = "spro-cli")]
#[command(about = "Service procurement workflow command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API.
    Serve,
    /// Re-sync the agreement catalog cache from its source.
    SyncCatalog,
    /// Print the known master agreements and their role details.
    ShowCatalog,
}

fn catalog_from_env() -> Result<CatalogService> {
    let config = CatalogConfig::from_env();
    let source: Arc<dyn CatalogSource> = if std::env::var("SPRO_CATALOG_URL").is_ok() {
        Arc::new(HttpCatalogSource::new(&config)?)
    } else {
        Arc::new(StaticCatalogSource::seeded())
    };
    Ok(CatalogService::new(source, Arc::new(DocumentStore::new())))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spro=info,spro_web=info,spro_catalog=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            spro_web::serve_from_env().await?;
        }
        Commands::SyncCatalog => {
            let catalog = catalog_from_env()?;
            let refreshed = catalog.refresh_all().await?;
            println!("catalog sync complete: {refreshed} agreements refreshed");
        }
        Commands::ShowCatalog => {
            let catalog = catalog_from_env()?;
            for agreement in catalog.agreements().await? {
                println!("{} {}", agreement.agreement_id, agreement.name);
                for group in catalog.details(agreement.agreement_id).await? {
                    println!("  domain {} ({})", group.domain_id, group.domain_name);
                    for role in group.role_details {
                        println!(
                            "    [{}] {} / {} / {}: {} @ {:.2} ({})",
                            role.role_id,
                            role.role,
                            role.level,
                            role.technology_level,
                            role.provider_name,
                            role.price,
                            role.cycle
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
