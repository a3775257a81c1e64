use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use gatewire::{
    setup_tracing, AgentLifecycle, AppConfig, AppResult, Gate, GateAgent, JsonProcessor,
    NamedMessage, RoutedMessage, Shutdown, UserData,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::{runtime, signal};
use tracing::{error, info, trace};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

impl NamedMessage for Ping {
    const NAME: &'static str = "Ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    seq: u64,
}

impl NamedMessage for Pong {
    const NAME: &'static str = "Pong";
}

#[derive(Debug, Serialize, Deserialize)]
struct Chat {
    text: String,
}

impl NamedMessage for Chat {
    const NAME: &'static str = "Chat";
}

/// Live agents by connection id. The id is also stored as each agent's user data.
#[derive(Default)]
struct Players {
    agents: Mutex<HashMap<u64, Arc<GateAgent>>>,
}

impl Players {
    fn get(&self, user_data: &UserData) -> Option<Arc<GateAgent>> {
        let id = user_data.as_ref()?.downcast_ref::<u64>()?;
        self.agents.lock().get(id).cloned()
    }

    fn all(&self) -> Vec<Arc<GateAgent>> {
        self.agents.lock().values().cloned().collect()
    }
}

#[async_trait]
impl AgentLifecycle for Players {
    fn new_agent(&self, agent: Arc<GateAgent>) {
        info!("player {} joined from {}", agent.id(), agent.remote_addr());
        agent.set_user_data(Some(Arc::new(agent.id())));
        self.agents.lock().insert(agent.id(), agent);
    }

    async fn close_agent(&self, agent: &GateAgent) -> AppResult<()> {
        self.agents.lock().remove(&agent.id());
        info!("player {} left", agent.id());
        Ok(())
    }
}

fn build_processor(players: &Arc<Players>, mailbox: async_channel::Sender<RoutedMessage>) -> AppResult<JsonProcessor> {
    let mut processor = JsonProcessor::new();
    processor.register::<Ping>()?;
    processor.register::<Pong>()?;
    processor.register::<Chat>()?;

    let lookup = players.clone();
    processor.set_handler::<Ping, _>(move |ping: &Ping, user_data: &UserData| {
        if let Some(agent) = lookup.get(user_data) {
            let _ = agent.write_msg(&Pong { seq: ping.seq });
        }
    })?;
    processor.set_router::<Chat>(Arc::new(mailbox))?;
    Ok(processor)
}

/// Broadcasts every chat message to all players.
async fn chat_room(players: Arc<Players>, mailbox: async_channel::Receiver<RoutedMessage>) {
    while let Ok(routed) = mailbox.recv().await {
        let from = routed
            .user_data
            .as_ref()
            .and_then(|user_data| user_data.downcast_ref::<u64>().copied());
        trace!("chat from player {:?}", from);
        for agent in players.all() {
            let _ = agent.write_msg(&*routed.msg);
        }
    }
}

async fn serve(config: AppConfig) -> AppResult<()> {
    let players = Arc::new(Players::default());
    let (mailbox_tx, mailbox_rx) = async_channel::bounded(1024);
    let processor = build_processor(&players, mailbox_tx)?;
    let chat = tokio::spawn(chat_room(players.clone(), mailbox_rx));

    let gate = Gate::new(config.gate, Arc::new(processor), Some(players));
    let (notify_shutdown, _) = broadcast::channel(1);
    let shutdown = Shutdown::subscribe(&notify_shutdown);
    let notifier = notify_shutdown.clone();
    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("listen for shutdown signal error: {}", err);
            return;
        }
        info!("get shutdown signal");
        notifier.send(()).ok();
    });

    let res = gate.run(shutdown).await;
    ctrl_c.abort();
    chat.abort();
    res
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("conf");
            path.push("gatewire.toml");
            path
        },
        PathBuf::from,
    );
    let config = AppConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _guard = setup_tracing(&config.log, commandline.verbose)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    if let Err(err) = rt.block_on(serve(config)) {
        error!("gatewire exited with error: {}", err);
        return Err(err);
    }
    info!("gatewire shutdown complete");
    Ok(())
}
