//! Nova Chat - terminal client for the Nova document analysis backend
//!
//! Upload PDFs and CSVs or scrape web pages, then chat with the analysis
//! agent about them. Replies stream into the terminal as they arrive.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod backend;
mod config;
mod conversation;
mod engine;

use backend::{BackendClient, FeatureType, NewSession, SourceKind, UploadedSource};
use config::Config;
use conversation::{Message, Role};
use engine::{PollOutcome, SendOutcome, SessionContext, TranscriptReducer};

#[derive(Parser, Debug)]
#[command(name = "nova-chat", version, about = "Chat with the Nova analysis agent about your documents")]
struct Args {
    /// Session to resume; a new general session is started when omitted
    session_id: Option<String>,

    /// Base URL of the analysis backend
    #[arg(long, env = "NOVA_BACKEND_URL", default_value = "http://localhost:8000")]
    backend_url: String,

    /// Identity sent as the `user-id` header
    #[arg(long, env = "NOVA_USER_ID")]
    user_id: String,

    /// TOML file with endpoint, limit and polling overrides
    #[arg(long, env = "NOVA_CONFIG")]
    config: Option<PathBuf>,
}

const HELP: &str = "\
Commands:
  /pdf PATH     upload a PDF and start a chat about it
  /csv PATH     upload a CSV and start a chat about it
  /web URL      scrape a web page and start a chat about it
  /sessions     list your chat sessions
  /delete ID    delete a chat session and its messages
  /history      reprint the current transcript
  /status       show the current session and reply state
  /quit         exit
Anything else is sent to the agent.";

/// Live conversation view: one reducer plus its render and notice tasks
struct ChatView {
    reducer: TranscriptReducer,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ChatView {
    fn mount(session_id: String, source_id: Option<String>, history: Vec<Message>) -> Self {
        let mut reducer =
            TranscriptReducer::with_history(SessionContext::new(session_id, source_id), history);

        // History already on screen is not rendered again
        let seen = reducer.snapshot().into_iter().map(|m| m.id).collect();
        let mut tasks = vec![tokio::spawn(render(reducer.subscribe(), seen))];
        if let Some(mut notices) = reducer.take_notifications() {
            tasks.push(tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    eprintln!("\n[!] {}", notice.text);
                }
            }));
        }

        Self { reducer, tasks }
    }
}

impl Drop for ChatView {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Print agent replies incrementally as snapshots arrive
async fn render(mut snapshots: watch::Receiver<Vec<Message>>, seen: Vec<String>) {
    let mut current: Option<String> = None;
    let mut shown = String::new();
    let mut finished = false;

    while snapshots.changed().await.is_ok() {
        let latest = snapshots.borrow_and_update().last().cloned();
        let Some(last) = latest.filter(|m| m.role == Role::Agent && !seen.contains(&m.id)) else {
            continue;
        };

        if current.as_deref() != Some(last.id.as_str()) {
            current = Some(last.id.clone());
            shown.clear();
            finished = false;
            print!("agent> ");
        }
        if finished {
            continue;
        }

        if let Some(tail) = last.content.strip_prefix(shown.as_str()) {
            print!("{}", tail);
        } else {
            // failed replies are rewritten wholesale
            print!("\n{}", last.content);
        }
        shown = last.content;

        if !last.pending {
            finished = true;
            println!();
        }
        let _ = std::io::stdout().flush();
    }
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        let who = match message.role {
            Role::User => "you",
            Role::Agent => "agent",
        };
        println!(
            "[{}] {}> {}",
            message.timestamp.format("%H:%M"),
            who,
            message.content
        );
    }
}

fn print_status(reducer: &TranscriptReducer) {
    let context = reducer.context();
    println!("session  {}", context.session_id);
    println!("source   {}", context.source_id.as_deref().unwrap_or("-"));
    println!("messages {}", reducer.snapshot().len());
    println!("state    {:?}", reducer.state());
    if let Some(outcome) = reducer.last_outcome() {
        println!("last     {:?}", outcome);
    }
}

/// Open a session on a fresh source and load it into a new view
async fn open_source(client: &BackendClient, source: &UploadedSource) -> anyhow::Result<ChatView> {
    let source_id = source
        .id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("backend did not return an id for the source"))?;

    let session = client
        .create_session(&NewSession::for_source(source, &source_id))
        .await?;
    println!("Started session {} on {} ({})", session.id, source.kind.label(), source.url);

    Ok(ChatView::mount(session.id, Some(source_id), Vec::new()))
}

async fn upload(client: &BackendClient, kind: SourceKind, path: &str) -> anyhow::Result<ChatView> {
    let source = client.upload_path(kind, Path::new(path)).await?;
    open_source(client, &source).await
}

async fn scrape(client: &BackendClient, config: &Config, url: &str) -> anyhow::Result<ChatView> {
    let source = client.scrape(url).await?;
    if let Some(id) = &source.id {
        println!("Processing {} ...", source.url);
        match client
            .wait_until_processed(SourceKind::Web, id, &config.client.polling)
            .await
        {
            PollOutcome::Completed => println!("Page processed."),
            PollOutcome::Failed => anyhow::bail!("the backend failed to process {}", source.url),
            PollOutcome::TimedOut { attempts } => {
                anyhow::bail!("gave up on {} after {} status checks", source.url, attempts)
            }
        }
    }
    open_source(client, &source).await
}

/// Resume the given session, or start an empty general one
async fn initial_view(client: &BackendClient, session_id: Option<String>) -> anyhow::Result<ChatView> {
    match session_id {
        Some(id) => {
            let session = client.get_session(&id).await?;
            let history = client.session_history(&id).await?;
            println!("Resumed \"{}\" ({} messages)", session.title, history.len());
            print_transcript(&history);
            Ok(ChatView::mount(session.id, session.source_id, history))
        }
        None => {
            let session = client
                .create_session(&NewSession {
                    title: "New chat".to_string(),
                    feature_type: FeatureType::Multi,
                    source_id: String::new(),
                })
                .await?;
            println!("Started session {}", session.id);
            Ok(ChatView::mount(session.id, None, Vec::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nova_chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(args.backend_url, args.user_id, args.config.as_deref())?;
    let client = BackendClient::new(&config)?;
    tracing::info!(backend = %config.backend_url, "connecting");

    let mut view = initial_view(&client, args.session_id).await?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line
            .split_once(char::is_whitespace)
            .map(|(c, a)| (c, a.trim()))
            .unwrap_or((line, ""));

        let next = match command {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => {
                println!("{}", HELP);
                continue;
            }
            "/history" => {
                print_transcript(&view.reducer.snapshot());
                continue;
            }
            "/sessions" => {
                match client.list_sessions(None).await {
                    Ok(sessions) => {
                        for s in sessions {
                            println!(
                                "{}  {:<6} {}  {}",
                                s.id,
                                s.feature_type.as_str(),
                                s.created_at.as_deref().unwrap_or("-"),
                                s.title
                            );
                        }
                    }
                    Err(err) => eprintln!("[!] {}", err),
                }
                continue;
            }
            "/status" => {
                print_status(&view.reducer);
                continue;
            }
            "/delete" if arg.is_empty() => {
                eprintln!("Usage: /delete ID");
                continue;
            }
            "/delete" => {
                if arg == view.reducer.context().session_id {
                    eprintln!("[!] cannot delete the session you are in");
                } else if let Err(err) = client.delete_session(arg).await {
                    eprintln!("[!] {}", err);
                } else {
                    println!("Deleted session {}", arg);
                }
                continue;
            }
            "/pdf" => upload(&client, SourceKind::Pdf, arg).await,
            "/csv" => upload(&client, SourceKind::Csv, arg).await,
            "/web" => scrape(&client, &config, arg).await,
            unknown if unknown.starts_with('/') => {
                eprintln!("Unknown command {}, try /help", unknown);
                continue;
            }
            _ => {
                match view.reducer.send(&client, line).await {
                    Ok(SendOutcome::Ignored) => eprintln!("[!] still waiting for the previous reply"),
                    Ok(_) => {}
                    Err(err) => eprintln!("[!] {}", err),
                }
                continue;
            }
        };

        match next {
            Ok(mounted) => view = mounted,
            Err(err) => eprintln!("[!] {}", err),
        }
    }

    Ok(())
}
