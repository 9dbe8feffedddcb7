mod app;
mod baserow;
mod broadcast;
mod config;
mod evolution;
mod intent;
mod kv;
mod openai;
mod prompting;
mod scheduling;
mod scoring;
mod sdr;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
