use clap::{Parser, Subcommand};
use tracing::info;
use upvote::{config::Config, init_tracing, refresh_once, start_server};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the upvote API (default).
    Serve,

    /// Rebuild the popular pages snapshot once and exit, for cron.
    Refresh,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = Config::load()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => start_server(config).await,
        Command::Refresh => {
            let snapshot = refresh_once(config).await?;
            info!(
                "Popular pages refreshed: {} items at {}",
                snapshot.items.len(),
                snapshot.generated_at
            );

            Ok(())
        }
    }
}
