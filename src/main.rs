#[tokio::main]
async fn main() {
    let code = pubsub_dispatch::app::startup::startup().await;
    std::process::exit(code);
}
