use clap::Parser;
use skilldeck_cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Exit explicitly: an unanswered checkpoint prompt would otherwise keep
    // the runtime waiting on its blocking thread.
    match cli.run().await {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(e) => {
            eprintln!("❌ Error: {e}");
            std::process::exit(1);
        }
    }
}
