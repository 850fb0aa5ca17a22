use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    battery_bridge::run().await
}
