use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::load_settings, dispatcher::SubmitOutcome, ChatClient, ClientEvent,
};
use shared::domain::UserId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Chat page url, e.g. http://127.0.0.1:8000/communications/chats/42/
    #[arg(long)]
    page_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long)]
    session_cookie: Option<String>,
    #[arg(long)]
    csrf_token: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(page_url) = args.page_url {
        settings.page_url = page_url;
    }
    if let Some(user_id) = args.user_id {
        settings.current_user_id = Some(UserId(user_id));
    }
    if args.session_cookie.is_some() {
        settings.session_cookie = args.session_cookie;
    }
    if args.csrf_token.is_some() {
        settings.csrf_token = args.csrf_token;
    }

    let client = ChatClient::new(&settings)?;
    let events = client.subscribe_events();
    tokio::spawn(print_events(events));
    client.start().await;
    println!("Joined chat session '{}'", client.session_id());

    let mut form = client.compose_form();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if let Some(path) = line.strip_prefix("/attach ") {
            form.select_file(path.trim());
            println!("Attached {}", form.file_name_display());
        } else if line == "/detach" {
            form.clear_file();
        } else if line == "/typing" || line == "/idle" {
            if let Err(err) = client.set_typing(line == "/typing").await {
                warn!(error = %err, "typing notice not sent");
            }
        } else if !line.is_empty() || form.attachment().is_some() {
            form.set_content(line);
            match client.submit(&mut form).await {
                Ok(SubmitOutcome::Published(_)) => {}
                Ok(SubmitOutcome::PersistedOnly { .. }) => {
                    println!("Saved, but peers will only see it after a reload");
                }
                Err(_) => println!("Not sent; your text and attachment were kept"),
            }
        }
    }

    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::MessageRendered(message)) => {
                let who = message
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| format!("user {}", message.sender_id));
                match &message.attachment_href {
                    Some(href) => println!(
                        "[{}] {who}: {} ({href})",
                        message.time_label, message.content
                    ),
                    None => println!("[{}] {who}: {}", message.time_label, message.content),
                }
            }
            Ok(ClientEvent::NoticeRendered(text)) => println!("! {text}"),
            Ok(ClientEvent::TypingChanged(users)) if users.is_empty() => {}
            Ok(ClientEvent::TypingChanged(users)) => {
                let users: Vec<String> = users.iter().map(ToString::to_string).collect();
                println!("... {} typing", users.join(", "));
            }
            Ok(ClientEvent::ConnectionStateChanged(state)) => println!("* connection {state:?}"),
            Ok(ClientEvent::Error(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
