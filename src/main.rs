mod cli;
mod commands;

use clap::Parser;
use cli::{AgentAction, Cli, Commands};
use kubedoor::config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Coordinator => {
            let config = config::CoordinatorConfig::from_env()?;
            commands::coordinator::serve(config).await?;
        }
        Commands::Agent { action } => match action {
            AgentAction::Serve => {
                let config = config::AgentConfig::from_env()?;
                commands::agent::serve(config).await?;
            }
            AgentAction::CertGenerate { service_name, namespace, output_dir } => {
                cli::generate_certs(&service_name, &namespace, &output_dir)?;
            }
        },
    }

    Ok(())
}
