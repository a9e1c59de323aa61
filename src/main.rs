#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ouro_validator::run().await
}
