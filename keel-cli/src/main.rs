#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_cli::run_app().await
}
