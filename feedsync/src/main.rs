#[tokio::main]
async fn main() -> anyhow::Result<()> {
    feedsync::run_cli().await
}
