use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use localchat_core::models::conversation_list::time_ago;
use localchat_core::repositories::{InMemoryMessageStore, MessageStore, SqliteMessageStore};
use localchat_core::services::{InferenceService, RigInferenceService};
use localchat_core::settings::{
    GeneralSettings, GeneralSettingsJsonRepository, GeneralSettingsRepository, InferenceSettings,
    ProviderKind, Theme,
};
use localchat_core::{ConversationSyncEngine, EngineEvent, TurnStatus};

use commands::{Command, MessageRef};

#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
enum Provider {
    /// vLLM or any OpenAI-compatible server
    Openai,
    Ollama,
}

impl From<Provider> for ProviderKind {
    fn from(p: Provider) -> Self {
        match p {
            Provider::Openai => ProviderKind::OpenAiCompatible,
            Provider::Ollama => ProviderKind::Ollama,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with a locally hosted language model", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value_t = Provider::Openai)]
    provider: Provider,

    /// Model server base URL (overrides VLLM_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Model name (overrides VLLM_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// API key (overrides VLLM_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    system_prompt: Option<String>,

    /// Upper bound on one whole request, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// SQLite database path. Defaults to the platform config directory.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Keep conversations in memory only
    #[arg(long, conflicts_with = "db")]
    ephemeral: bool,

    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn inference_settings(&self) -> InferenceSettings {
        let mut settings = InferenceSettings::from_env();
        settings.provider = self.provider.into();
        if let Some(url) = &self.base_url {
            settings.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(key) = &self.api_key {
            settings.api_key = key.clone();
        }
        if let Some(prompt) = &self.system_prompt {
            settings.system_prompt = prompt.clone();
        }
        if let Some(secs) = self.timeout_secs {
            settings.request_timeout = Duration::from_secs(secs);
        }
        settings
    }
}

// Slash command parsing
mod commands {
    /// A message addressed by its 1-based position in the selected
    /// conversation, or by id.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MessageRef {
        Index(usize),
        Id(String),
    }

    impl MessageRef {
        fn parse(s: &str) -> Self {
            match s.parse::<usize>() {
                Ok(n) => MessageRef::Index(n),
                Err(_) => MessageRef::Id(s.to_string()),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        Submit(String),
        New,
        List,
        Search(String),
        Select(String),
        Show,
        Edit(MessageRef, String),
        Resend(MessageRef),
        Pause,
        Pin(Option<String>),
        Rename(String),
        Delete(Option<String>),
        Retry,
        Dismiss,
        Theme(Option<String>),
        Help,
        Quit,
    }

    impl Command {
        pub fn parse(input: &str) -> Result<Self, String> {
            let input = input.trim();
            let Some(rest) = input.strip_prefix('/') else {
                return Ok(Command::Submit(input.to_string()));
            };

            let (name, args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());

            match name {
                "new" => Ok(Command::New),
                "list" | "ls" => Ok(Command::List),
                "search" => Ok(Command::Search(args.to_string())),
                "select" | "open" if !args.is_empty() => Ok(Command::Select(args.to_string())),
                "show" => Ok(Command::Show),
                "edit" => {
                    let (target, text) = args
                        .split_once(char::is_whitespace)
                        .ok_or("Usage: /edit <message> <new text>")?;
                    Ok(Command::Edit(MessageRef::parse(target), text.trim().to_string()))
                }
                "resend" if !args.is_empty() => Ok(Command::Resend(MessageRef::parse(args))),
                "pause" | "stop" => Ok(Command::Pause),
                "pin" => Ok(Command::Pin(optional(args))),
                "rename" if !args.is_empty() => Ok(Command::Rename(args.to_string())),
                "delete" | "rm" => Ok(Command::Delete(optional(args))),
                "retry" => Ok(Command::Retry),
                "dismiss" => Ok(Command::Dismiss),
                "theme" => Ok(Command::Theme(optional(args))),
                "help" => Ok(Command::Help),
                "quit" | "exit" => Ok(Command::Quit),
                "select" | "open" | "resend" | "rename" => {
                    Err(format!("/{} needs an argument", name))
                }
                other => Err(format!("Unknown command: /{}", other)),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_plain_text_is_submit() {
            assert_eq!(
                Command::parse("  Hello there "),
                Ok(Command::Submit("Hello there".to_string()))
            );
        }

        #[test]
        fn test_edit_with_index_and_id() {
            assert_eq!(
                Command::parse("/edit 2 new words"),
                Ok(Command::Edit(MessageRef::Index(2), "new words".to_string()))
            );
            assert_eq!(
                Command::parse("/edit msg_1_abc fixed"),
                Ok(Command::Edit(MessageRef::Id("msg_1_abc".to_string()), "fixed".to_string()))
            );
            assert!(Command::parse("/edit 2").is_err());
        }

        #[test]
        fn test_optional_arguments() {
            assert_eq!(Command::parse("/pin"), Ok(Command::Pin(None)));
            assert_eq!(
                Command::parse("/delete conv_1_a"),
                Ok(Command::Delete(Some("conv_1_a".to_string())))
            );
            assert_eq!(Command::parse("/theme dark"), Ok(Command::Theme(Some("dark".to_string()))));
        }

        #[test]
        fn test_missing_required_argument() {
            assert!(Command::parse("/select").is_err());
            assert!(Command::parse("/rename   ").is_err());
            assert!(Command::parse("/bogus").is_err());
        }
    }
}

struct App {
    engine: ConversationSyncEngine,
    settings_repo: Option<GeneralSettingsJsonRepository>,
    settings: GeneralSettings,
    /// Conversation ids in the order of the last printed list.
    listed: Vec<String>,
}

impl App {
    fn resolve_conversation(&self, arg: &str) -> String {
        match arg.parse::<usize>() {
            Ok(n) if n >= 1 && n <= self.listed.len() => self.listed[n - 1].clone(),
            _ => arg.to_string(),
        }
    }

    fn target_conversation(&self, arg: Option<&str>) -> Result<String> {
        match arg {
            Some(arg) => Ok(self.resolve_conversation(arg)),
            None => self.engine.selected_id().context("No conversation selected"),
        }
    }

    fn resolve_message(&self, target: &MessageRef) -> Result<String> {
        match target {
            MessageRef::Id(id) => Ok(id.clone()),
            MessageRef::Index(n) => {
                let conv_id = self.engine.selected_id().context("No conversation selected")?;
                let conv = self
                    .engine
                    .conversation(&conv_id)
                    .context("Selected conversation disappeared")?;
                conv.messages()
                    .get(n.wrapping_sub(1))
                    .map(|m| m.id.clone())
                    .with_context(|| format!("No message #{}", n))
            }
        }
    }

    fn print_list(&mut self, query: &str) {
        let list = self.engine.list_conversations_filtered(query);
        let now = Utc::now();
        self.listed.clear();

        let sections = [("Pinned", &list.pinned), ("Recent", &list.recent)];
        for (label, items) in sections {
            if items.is_empty() {
                continue;
            }
            println!("{}", label);
            for item in items {
                self.listed.push(item.id.clone());
                println!(
                    "  {:>2}. {} ({} messages, {})\n      {}",
                    self.listed.len(),
                    item.title,
                    item.message_count,
                    time_ago(Some(item.updated_at), now),
                    item.preview
                );
            }
        }
        if self.listed.is_empty() {
            println!("No conversations.");
        }
    }

    fn print_selected(&self) {
        let Some(conv) = self.engine.snapshot().selected else {
            println!("No conversation selected.");
            return;
        };
        println!("# {} [{}]", conv.title(), conv.id());
        for (i, message) in conv.messages().iter().enumerate() {
            let edited = if message.is_edited() { " (edited)" } else { "" };
            println!("{:>3}. {}{}: {}", i + 1, message.role, edited, message.text());
        }
    }

    async fn save_settings(&self) {
        if let Some(repo) = &self.settings_repo
            && let Err(e) = repo.save(self.settings.clone()).await
        {
            warn!(error = ?e, "Failed to save general settings");
        }
    }

    /// Returns false when the REPL should exit.
    async fn handle(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Submit(text) => {
                if text.is_empty() {
                    return Ok(true);
                }
                self.engine.submit_to_selected(&text).await?;
            }
            Command::New => {
                let id = self.engine.create_conversation();
                println!("Started {}", id);
            }
            Command::List => self.print_list(""),
            Command::Search(query) => self.print_list(&query),
            Command::Select(arg) => {
                let id = self.resolve_conversation(&arg);
                self.engine.select_conversation(&id).await?;
                self.print_selected();
            }
            Command::Show => self.print_selected(),
            Command::Edit(target, text) => {
                let message_id = self.resolve_message(&target)?;
                if !self.engine.edit_selected_message(&message_id, &text).await? {
                    println!("No such message, nothing edited.");
                }
            }
            Command::Resend(target) => {
                let message_id = self.resolve_message(&target)?;
                if self.engine.resend_selected_message(&message_id).await?.is_none() {
                    println!("Nothing to resend.");
                }
            }
            Command::Pause => {
                if !self.engine.pause_selected() {
                    println!("Nothing to pause.");
                }
            }
            Command::Pin(arg) => {
                let id = self.target_conversation(arg.as_deref())?;
                let pinned = self.engine.toggle_pin(&id).await?;
                println!("{}", if pinned { "Pinned." } else { "Unpinned." });
            }
            Command::Rename(title) => {
                let id = self.target_conversation(None)?;
                self.engine.rename_conversation(&id, &title).await?;
            }
            Command::Delete(arg) => {
                let id = self.target_conversation(arg.as_deref())?;
                self.engine.delete_conversation(&id).await?;
                println!("Deleted.");
            }
            Command::Retry => {
                let id = self.target_conversation(None)?;
                let written = self.engine.retry_pending_writes(&id).await?;
                println!("Saved {} pending message(s).", written);
            }
            Command::Dismiss => self.engine.dismiss_error(),
            Command::Theme(arg) => {
                self.settings.theme = match arg {
                    Some(name) => name.parse::<Theme>().map_err(anyhow::Error::msg)?,
                    None => self.settings.theme.toggled(),
                };
                self.save_settings().await;
                println!("Theme: {}", self.settings.theme);
            }
            Command::Help => print_help(),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

fn print_help() {
    println!(
        "Type a message to send it to the selected conversation.\n\
         /new                     start a new chat\n\
         /list, /search <query>   list conversations\n\
         /select <n|id>           open a conversation\n\
         /show                    print the open conversation\n\
         /edit <n|id> <text>      edit a message\n\
         /resend <n|id>           send a message again\n\
         /pause                   stop the current reply\n\
         /pin [n|id]              toggle pinned\n\
         /rename <title>          rename the open conversation\n\
         /delete [n|id]           delete a conversation\n\
         /retry                   save messages that failed to persist\n\
         /dismiss                 clear the last error\n\
         /theme [light|dark]      switch theme\n\
         /quit"
    );
}

/// Print streamed deltas and turn outcomes for the selected conversation.
fn spawn_renderer(engine: ConversationSyncEngine) -> tokio::task::JoinHandle<()> {
    let mut events = engine.events();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Renderer fell behind");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let selected = engine.selected_id();
            let is_selected = |id: &str| selected.as_deref() == Some(id);

            match event {
                EngineEvent::TextDelta {
                    conversation_id,
                    text,
                } if is_selected(&conversation_id) => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                EngineEvent::TurnEnded {
                    conversation_id,
                    status,
                } if is_selected(&conversation_id) => match status {
                    TurnStatus::Done => println!(),
                    TurnStatus::Cancelled => println!("\n[paused]"),
                    TurnStatus::Errored => {
                        let message = engine
                            .snapshot()
                            .last_error
                            .map(|e| e.message().to_string())
                            .unwrap_or_default();
                        println!("\n[error] {} (/resend to try again, /dismiss to clear)", message);
                    }
                    _ => {}
                },
                EngineEvent::PersistenceFailed {
                    conversation_id,
                    operation,
                    ..
                } if is_selected(&conversation_id) => {
                    println!("[warning] {} failed, /retry saves queued messages", operation);
                }
                _ => {}
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    localchat_core::logging::init(args.verbose);

    let inference_settings = args.inference_settings();
    info!(
        provider = inference_settings.provider.display_name(),
        base_url = %inference_settings.base_url,
        model = %inference_settings.model,
        "Starting localchat"
    );

    let store: Arc<dyn MessageStore> = if args.ephemeral {
        Arc::new(InMemoryMessageStore::new())
    } else {
        let path = match &args.db {
            Some(path) => path.clone(),
            None => SqliteMessageStore::default_path()?,
        };
        Arc::new(
            SqliteMessageStore::open(&path)
                .await
                .with_context(|| format!("Failed to open database at {}", path.display()))?,
        )
    };

    let engine_config = inference_settings.engine_config();
    let inference: Arc<dyn InferenceService> = Arc::new(RigInferenceService::new(inference_settings));
    let engine = ConversationSyncEngine::new(store, inference, engine_config);

    if let Err(e) = engine.load_conversations().await {
        warn!(error = ?e, "Failed to load conversations, starting empty");
    }

    let settings_repo = match GeneralSettingsJsonRepository::new() {
        Ok(repo) => Some(repo),
        Err(e) => {
            warn!(error = ?e, "General settings unavailable");
            None
        }
    };
    let settings = match &settings_repo {
        Some(repo) => repo.load().await.unwrap_or_else(|e| {
            warn!(error = ?e, "Failed to load general settings, using defaults");
            GeneralSettings::default()
        }),
        None => GeneralSettings::default(),
    };

    let renderer = spawn_renderer(engine.clone());
    let mut app = App {
        engine: engine.clone(),
        settings_repo,
        settings,
        listed: Vec::new(),
    };

    println!("localchat. Type /help for commands.");
    app.print_list("");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };
        match app.handle(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("[error] {:#}", e),
        }
    }

    let stopped = engine.stop_all();
    if stopped > 0 {
        info!(count = stopped, "Cancelled in-flight replies on exit");
    }
    renderer.abort();
    Ok(())
}
