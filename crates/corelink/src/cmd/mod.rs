use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod decode;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scripted connect/disconnect between two simulated cores.
    Simulate(SimulateArgs),
    /// Decode a protocol message payload and print it.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Simulate(args) => simulate::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of synchronized transforms to connect.
    #[arg(long, default_value = "1")]
    pub transforms: u16,
    /// Negotiate a metadata companion channel.
    #[arg(long)]
    pub metadata: bool,
    /// Tear the transforms down again after connecting.
    #[arg(long)]
    pub disconnect: bool,
    /// Shared buffer size in octets.
    #[arg(long, default_value = "1024")]
    pub buffer_size: usize,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// JSON message payload. Reads stdin when omitted.
    pub payload: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}
