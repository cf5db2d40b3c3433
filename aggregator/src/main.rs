mod aggregator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aggregator::run().await
}
