use colored::*;
use std::io::{self, Write};

pub fn print_banner(title: &str, model: &str) {
    println!("\n{}", title.bright_cyan().bold());
    println!("{}", "=".repeat(title.chars().count()).bright_cyan());
    println!("{} {}", "model:".dimmed(), model);
}

pub fn print_notice(text: &str) {
    println!("{}", text.blue());
}

/// Prompt without a trailing newline; flushed so it shows before input.
pub fn print_prompt(label: &str) {
    print!("{} ", label.yellow().bold());
    let _ = io::stdout().flush();
}

pub fn print_reply(label: &str, text: &str) {
    println!("{} {}\n", label.green().bold(), text);
}
