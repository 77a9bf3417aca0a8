use hookrs::{Config, Launcher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Launcher::new(Config::default()).start().await?;
    Ok(())
}
