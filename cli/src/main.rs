//! Command line entry point for `ostree-container`.

use anyhow::Result;

async fn run() -> Result<()> {
    ostree_container::cli::run_from_iter(std::env::args()).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(ostree_container::error::exit_code(&e));
    }
}
