pub mod agent;
pub mod cli;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;

use agent::RelayAgent;
use cli::Args;
use history::initialize_history_store;
use llm::chat::new_client as new_chat_client;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr());
    info!("Chat Model: {}", args.chat_model);
    info!("Chat Base URL: {}", args.chat_base_url.as_deref().unwrap_or("client default"));
    info!("System Prompt Enabled: {}", !args.system_prompt.trim().is_empty());
    info!("Stream Delay: {}ms", args.stream_delay_ms);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let chat_client = new_chat_client(&args.llm_config())?;
    info!(
        "Chat client configured: Model={}, BaseURL={:?}",
        chat_client.get_model(),
        chat_client.get_base_url()
    );

    let history_store = initialize_history_store();
    let agent = Arc::new(RelayAgent::new(chat_client, history_store, args.relay_options()));

    let addr = args.server_addr();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, agent, args.clone());
    server.run().await?;

    Ok(())
}
