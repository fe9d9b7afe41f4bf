mod ui;

use std::sync::Arc;

use chat_sync::api::client::ApiClient;
use chat_sync::sync::transport::NetworkConnector;
use chat_sync::{
    AppConfig, ChatError, ChatSession, ConnectionManager, ReconnectPolicy, Result, SessionSettings,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run().await {
        log::error!("{}", e);
        if let ChatError::Config(_) = e {
            if let Some(path) = AppConfig::toml_path() {
                eprintln!("set base_url, token and user in {}", path.display());
            }
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = AppConfig::load();
    if config.base_url.trim().is_empty() {
        return Err(ChatError::Config("no base_url configured".into()));
    }
    let base_url = chat_sync::utils::parse_base_url(&config.base_url)?;
    let identity = config.identity()?;

    let client = Arc::new(ApiClient::new(base_url.clone(), identity.token.clone()));
    let connection = ConnectionManager::new(
        ReconnectPolicy::from(&config.connection),
        Arc::new(NetworkConnector::new(base_url)),
    );
    let (session, handle, notices) = ChatSession::new(
        identity.clone(),
        client.clone(),
        connection.clone(),
        SessionSettings::from(&config),
    );
    let session_task = tokio::spawn(session.run());

    let result = ui::main_window::run(handle, notices, client, identity).await;

    if let Err(e) = session_task.await {
        log::warn!("session task ended abnormally: {}", e);
    }
    connection.shutdown().await;
    result
}
