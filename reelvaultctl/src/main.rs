use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = reelvaultctl::Cli::parse();
    if let Err(err) = reelvaultctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
