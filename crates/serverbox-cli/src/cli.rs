use clap::Parser;

/// All runtime configuration is read from the environment by
/// `serverbox_config::ProxyConfig::from_env`; this struct exists so
/// `--help`/`--version` behave like any other `clap` binary.
#[derive(Debug, Parser)]
#[command(
    name = "serverbox",
    about = "Reverse proxy and lifecycle orchestrator for ephemeral sandboxed compute instances",
    version
)]
pub struct Cli {}
