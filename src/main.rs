#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sight_match::run().await
}
