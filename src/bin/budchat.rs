use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use budchat::{
    BackendConfig, BudChat, BudChatConfig, ChatSession, InMemoryBackend, MessageId, Profile,
    UserId, ViewUpdate,
};

/// Terminal client for a BudChat room
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application data
    #[clap(long, value_name = "PATH", required = true)]
    data_dir: PathBuf,

    /// Directory for application logs
    #[clap(long, value_name = "PATH", required = true)]
    logs_dir: PathBuf,

    /// Backend credentials file; environment variables override it
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signed-in member id
    #[clap(long, value_name = "ID")]
    user: Option<String>,

    /// Run against an in-process backend instead of the hosted one
    #[clap(long)]
    offline: bool,
}

const HELP: &str = "commands: /reply <id> <text>, /edit <id> <text>, /delete <id>, /status <text>, /who, /quit";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let user = args.user.as_deref().map(UserId::new);

    let offline_chat;
    let chat: &BudChat = if args.offline {
        let memory = InMemoryBackend::new();
        if let Some(user) = &user {
            memory.add_profile(Profile::new(user.clone(), user.as_str()));
        }
        let config = BudChatConfig::new(&args.data_dir, &args.logs_dir, BackendConfig::default());
        std::fs::create_dir_all(&config.logs_dir)?;
        budchat::init_tracing(&config.logs_dir);
        offline_chat = BudChat::with_capabilities(config, memory.capabilities());
        &offline_chat
    } else {
        let backend = match BackendConfig::load(args.config.as_deref()) {
            Ok(backend) => backend,
            Err(err) => {
                eprintln!("Failed to load backend configuration: {}", err);
                std::process::exit(1);
            }
        };
        let config = BudChatConfig::new(&args.data_dir, &args.logs_dir, backend);
        match BudChat::initialize_budchat(config).await {
            Ok(chat) => chat,
            Err(err) => {
                eprintln!("Failed to initialize BudChat: {}", err);
                std::process::exit(1);
            }
        }
    };

    let mut session = match ChatSession::mount(chat, user.clone()).await {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Failed to load messages: {}", err);
            std::process::exit(1);
        }
    };

    for message in session.messages().iter() {
        println!("[{}] {}: {}", message.id, message.author_name, message.content);
    }
    println!("{HELP}");

    let mut view = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            update = view.updates.recv() => match update {
                Ok(update) => render(&session, update),
                Err(RecvError::Lagged(skipped)) => eprintln!("(skipped {skipped} updates)"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&mut session, user.as_ref(), line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => eprintln!("error: {}", err),
                }
            }
        }
    }

    session.unmount();
    Ok(())
}

fn render(session: &ChatSession, update: ViewUpdate) {
    match update {
        ViewUpdate::Feed {
            trigger,
            message: Some(message),
        } => {
            let reply = session
                .reply_preview(&message)
                .map(|preview| format!(" (re {}: {})", preview.author_name, preview.content))
                .unwrap_or_default();
            println!(
                "{:?} [{}] {}{}: {}",
                trigger, message.id, message.author_name, reply, message.content
            );
        }
        ViewUpdate::Feed { .. } => {}
        ViewUpdate::Roster => print_roster(session),
        ViewUpdate::PresenceUnavailable { reason } => {
            println!("presence unavailable: {reason}")
        }
        ViewUpdate::Toast(toast) => println!("** {}: {}", toast.title, toast.body),
        ViewUpdate::Status(status) => println!("status: {:?}", status),
    }
}

fn print_roster(session: &ChatSession) {
    let roster = session.roster();
    for entry in roster.iter() {
        let status = if entry.status.is_online() { "online" } else { "offline" };
        match session.status_preview(entry) {
            Some(preview) => println!("  {} ({}) - {}", entry.display_name(), status, preview),
            None => println!("  {} ({})", entry.display_name(), status),
        }
    }
}

/// Returns `false` when the user asked to quit.
async fn run_command(
    session: &mut ChatSession,
    user: Option<&UserId>,
    line: &str,
) -> budchat::Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let Some(command) = line.strip_prefix('/') else {
        let composer = session.composer();
        composer.set_draft(line);
        composer.submit().await?;
        return Ok(true);
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    match name {
        "quit" => return Ok(false),
        "who" => print_roster(session),
        "reply" => {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            if text.trim().is_empty() {
                return Err(budchat::ValidationError::EmptyContent.into());
            }
            let composer = session.composer();
            composer.select_reply_target(&MessageId::new(id))?;
            composer.set_draft(text);
            if let Err(err) = composer.submit().await {
                composer.cancel_reply();
                return Err(err);
            }
        }
        "edit" => {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            session.composer().edit(&MessageId::new(id), text).await?;
        }
        "delete" => {
            session.composer().delete(&MessageId::new(rest.trim())).await?;
        }
        "status" => {
            let Some(user) = user else {
                return Err(budchat::ValidationError::MissingIdentity.into());
            };
            session.set_personal_message(user, rest).await?;
        }
        _ => println!("{HELP}"),
    }
    Ok(true)
}
