use anyhow::Result;
use clap::Parser;
use env_logger::Env;

mod cli;
mod console;
mod lifecycle;
mod loopback;

fn main() -> Result<()> {
    env_logger::init_from_env(Env::new().default_filter_or("info"));
    let args = cli::Cli::parse();
    match args.cmd {
        cli::Cmd::Lifecycle(opts) => lifecycle::run(opts),
        cli::Cmd::Loopback(opts) => loopback::run(opts),
    }
}
