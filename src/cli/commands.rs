use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(author, version, about = "Relay Telegram messages to an LLM with short per-user memory", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Telegram bot (long polling until Ctrl+C)
    Run,

    /// Send a single message through the relay pipeline and print the reply
    Chat {
        text: String,

        /// User id the message is recorded under
        #[arg(short, long, default_value = "0")]
        user_id: i64,
    },

    /// Chat with the relay from the terminal, without Telegram
    Interactive {
        /// User id the conversation is recorded under
        #[arg(short, long, default_value = "0")]
        user_id: i64,
    },
}
