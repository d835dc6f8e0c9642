pub mod api;

use crate::agent::RelayAgent;
use crate::cli::Args;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    agent: Arc<RelayAgent>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, agent: Arc<RelayAgent>, args: Args) -> Self {
        Self { addr, agent, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let app = api::build_router(Arc::clone(&self.agent));
        api::start_http_server(&self.addr, app, &self.args).await
    }
}
