use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use faultline_config::{MetadataResolver, WatchSettings};
use faultline_core::CommandId;
use tracing::info;

use super::{default_metadata, load_source, SIMULATED_COMMAND};

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Command to resolve, as <group>.<command>
    #[arg(long, default_value = SIMULATED_COMMAND)]
    pub command: CommandId,

    /// Resolve the asynchronous variant of the command
    #[arg(long = "async")]
    pub asynchronous: bool,
}

pub fn execute(args: InspectArgs) -> Result<()> {
    let source = load_source(args.config.as_deref())?;

    let defaults = default_metadata(args.command, args.asynchronous);
    let metadata = MetadataResolver::new(&source)
        .resolve(&defaults)
        .with_context(|| format!("Invalid configuration for {}", defaults.command))?;

    let watch = WatchSettings::from_source(&source)?;
    info!(
        enabled = watch.enabled,
        properties = ?watch.properties,
        "Configuration watch settings"
    );

    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
