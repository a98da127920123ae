use clap::Parser;
use nestegg::api::cli::{Cli, CliError, Command};

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Serve { port } => nestegg::api::run_http_server(port)
            .await
            .map_err(CliError::from),
        Command::Offline(command) => nestegg::api::cli::run(command),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
