//! sfs3 - bulk transfer of file trees between a local filesystem and S3

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = cli::Cli::parse();

    // Priority: RUST_LOG > -d count > default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match args.debug {
        0 => EnvFilter::new("sfs3=warn"),
        1 => EnvFilter::new("sfs3=debug"),
        _ => EnvFilter::new("sfs3=trace"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("sfs3: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(cli::run(args));
    std::process::exit(code);
}
