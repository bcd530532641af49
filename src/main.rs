mod app;
mod inbound;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
