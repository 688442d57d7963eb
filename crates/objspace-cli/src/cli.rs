use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "objspace",
    about = "ObjectSpace storage file inspector",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// TOML storage configuration; the page size always comes from the
    /// file header.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the file header and, for object spaces, the containers
    Info(FileArgs),
    /// Check the Merkle root and every container tree
    Verify(FileArgs),
    /// Report sector and stream usage
    Sectors(SectorArgs),
}

#[derive(Args)]
pub struct FileArgs {
    pub file: PathBuf,
}

#[derive(Args)]
pub struct SectorArgs {
    pub file: PathBuf,
    /// Sector payload size the file was created with.
    #[arg(long)]
    pub cluster_size: Option<usize>,
}
