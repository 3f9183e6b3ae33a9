use demo_worker::{application::Application, settings::AppSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = AppSettings::new().expect("failed to load application settings");
    let app = Application::build(settings);

    tracing::info!(port = app.port(), "demo-worker starting");

    app.run()?.await
}
