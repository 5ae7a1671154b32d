use ember_gateway::config::GatewaySettings;
use ember_gateway::service::GatewayBuilder;
use ember_im_core::load_config;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let app_config = load_config(Some("config"));
    let settings = GatewaySettings::from_app_config(&app_config);

    info!(
        node_id = %settings.node_id,
        tcp = ?settings.tcp_bind,
        ws = ?settings.ws_bind,
        "Starting Ember Gateway"
    );

    let server = GatewayBuilder::new(settings).build()?;

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    server.run().await?;
    info!("Ember Gateway stopped");
    Ok(())
}
