use achievements_cli::{init_tracing, run_cli, Cli};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level());
    run_cli(cli)
}
