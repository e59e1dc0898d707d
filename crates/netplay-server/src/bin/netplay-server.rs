#[tokio::main]
async fn main() -> anyhow::Result<()> {
    netplay_server::server::run().await
}
