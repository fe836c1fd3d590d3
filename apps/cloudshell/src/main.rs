use clap::Parser;
use cloudshell::cli::Cli;

#[tokio::main]
async fn main() {
    if let Err(err) = cloudshell::app::run(Cli::parse()).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
