//! Tuning Fork simulator entry point.

use tuningfork::cli::{self, Cli};
use tuningfork::core::Result;

fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = Cli::parse_args();

    // Run the simulation
    cli::execute(cli)
}
