use anyhow::Result;
use chatrelay::cli::{Cli, Commands};
use chatrelay::{
    build_handler, init_tracing, utils, ConversationStorage, Relay, Settings, TelegramTransport,
};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::new()?;
    init_tracing(&settings);

    match cli.command {
        Commands::Run => run_bot(settings).await,
        Commands::Chat { text, user_id } => handle_chat(settings, text, user_id).await,
        Commands::Interactive { user_id } => handle_interactive(settings, user_id).await,
    }
}

async fn run_bot(settings: Settings) -> Result<()> {
    let bot_token = Settings::bot_token()?;
    let api_key = Settings::api_key()?;

    let handler = Arc::new(build_handler(&settings, api_key)?);
    let transport = Arc::new(TelegramTransport::new(bot_token, settings.telegram.clone()));

    let me = transport.get_me().await?;
    tracing::info!(
        bot_id = me.id,
        username = me.username.as_deref().unwrap_or("<none>"),
        "Bot started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = Relay::new(handler, transport, &settings);
    let mut running = tokio::spawn(relay.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Ctrl+C received, stopping");
            let _ = shutdown_tx.send(true);
            running.await?;
        }
        finished = &mut running => {
            finished?;
        }
    }

    tracing::info!("Bot stopped");
    Ok(())
}

async fn handle_chat(settings: Settings, text: String, user_id: i64) -> Result<()> {
    let handler = build_handler(&settings, Settings::api_key()?)?;
    let reply = handler.handle(user_id, &text).await;
    println!("{}", reply);
    Ok(())
}

async fn handle_interactive(settings: Settings, user_id: i64) -> Result<()> {
    let handler = build_handler(&settings, Settings::api_key()?)?;

    utils::print_banner("Interactive relay", &settings.llm.model);
    utils::print_notice("Type your messages, /reset to forget, /quit or Ctrl+D to exit\n");

    let mut reader = BufReader::new(io::stdin());

    loop {
        utils::print_prompt("You:");
        let mut input = String::new();
        if reader.read_line(&mut input).await? == 0 {
            break;
        }

        let input = input.trim_end_matches(['\r', '\n']);
        if matches!(input.trim(), "/quit" | "/exit") {
            break;
        }

        let reply = handler.handle(user_id, input).await;
        utils::print_reply("Bot:", &reply);
    }

    let remembered = handler.store().get_history(user_id).await.len();
    utils::print_notice(&format!("Session ended ({} turns remembered)", remembered));
    Ok(())
}
