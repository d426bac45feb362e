use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "autoscribe")]
#[command(about = "Batch transcription queue and calendar-driven meeting recorder", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print version information
    Version,
    /// List recent batch transcription jobs
    Jobs(ListCliArgs),
    /// List recent recording sessions
    Sessions(ListCliArgs),
}

#[derive(ClapArgs, Debug)]
pub struct ListCliArgs {
    /// Maximum number of results to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}
