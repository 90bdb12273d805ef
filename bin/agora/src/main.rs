//! Agora node binary.
//!
//! This is the main entry point for the Agora agent network node.

mod cli;

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    cli::run().await
}
