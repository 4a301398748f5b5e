mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, GdprAction, StackAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::Serve { addr, database_url, s3, bucket, service_id } => {
            commands::serve::run(&addr, database_url.as_deref(), s3, &bucket, &service_id).await?;
        }
        Commands::Stack { action } => match action {
            StackAction::Validate { file } => commands::stack::validate(&file)?,
            StackAction::Deploy { file } => commands::stack::deploy(&file).await?,
            StackAction::Stop { name } => commands::stack::stop(&name).await?,
            StackAction::Remove { name, volumes } => {
                commands::stack::remove(&name, volumes).await?;
            }
        },
        Commands::Gdpr { action } => match action {
            GdprAction::Erase { database_url, subject, correlation, delete_objects, user } => {
                commands::gdpr::erase(
                    &database_url,
                    subject.as_deref(),
                    correlation.as_deref(),
                    delete_objects,
                    &user,
                )
                .await?;
            }
            GdprAction::Export { database_url, subject, user } => {
                commands::gdpr::export(&database_url, &subject, &user).await?;
            }
            GdprAction::Pseudonymize { database_url, subject, user } => {
                commands::gdpr::pseudonymize(&database_url, &subject, &user).await?;
            }
        },
        Commands::Sweep { database_url } => commands::sweep::run(&database_url).await?,
    }

    Ok(())
}
