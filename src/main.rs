use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;

use llama_chat_session::chat::display_transcript;
use llama_chat_session::config::load_config;
use llama_chat_session::logger::init_logging;
use llama_chat_session::models::CHAR_SPEAKER_KEY;
use llama_chat_session::{
    ChatConfig, ChatContext, CompletionTransport, GenerationController, LlamaServerTransport,
    Session, TurnHandle,
};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "llama_chat", about = "Chat with a llama.cpp completion server")]
struct Cli {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Server base url, e.g. http://127.0.0.1:8080
    #[arg(long)]
    server: Option<String>,
    /// Character (assistant) name
    #[arg(long = "char")]
    char_name: Option<String>,
    /// User name
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Answer with canned replies instead of contacting a server
    #[cfg(feature = "mock")]
    #[arg(long)]
    mock: bool,
}

impl Cli {
    fn apply(&self, config: &mut ChatConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(name) = &self.char_name {
            config.session.char = name.clone();
        }
        if let Some(name) = &self.user {
            config.session.user = name.clone();
        }
        if let Some(path) = &self.log_file {
            config.log_file = path.clone();
        }
    }

    #[cfg(feature = "mock")]
    fn mock_transport(&self) -> Option<Arc<dyn CompletionTransport>> {
        self.mock.then(|| {
            info!("Running with the mock transport");
            Arc::new(llama_chat_session::chat_mock::MockTransport::default()) as Arc<dyn CompletionTransport>
        })
    }

    #[cfg(not(feature = "mock"))]
    fn mock_transport(&self) -> Option<Arc<dyn CompletionTransport>> {
        None
    }

    fn transport(&self, config: &ChatConfig) -> anyhow::Result<Arc<dyn CompletionTransport>> {
        if let Some(mock) = self.mock_transport() {
            return Ok(mock);
        }
        let transport = LlamaServerTransport::new(&config.server_url)
            .with_context(|| format!("bad server url '{}'", config.server_url))?;
        Ok(Arc::new(transport))
    }
}

enum Command<'a> {
    Quit,
    Stop,
    Reset,
    Stats,
    ShowConfig,
    Set { name: &'a str, value: &'a str },
    Unknown(&'a str),
    Message(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Command::Message(line));
    };
    let (head, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    Some(match head {
        "quit" | "exit" => Command::Quit,
        "stop" => Command::Stop,
        "reset" => Command::Reset,
        "stats" => Command::Stats,
        "config" => Command::ShowConfig,
        "set" => match rest.trim().split_once(char::is_whitespace) {
            Some((name, value)) => Command::Set {
                name,
                value: value.trim(),
            },
            None => Command::Unknown(line),
        },
        _ => Command::Unknown(line),
    })
}

/// Tracks how much of the streaming reply is already on screen.
#[derive(Debug, Default)]
struct ReplyPrinter {
    /// Speaker key and displayed text of every entry accounted for so far.
    seen: Vec<(String, String)>,
}

impl ReplyPrinter {
    /// Text to print so the terminal catches up with `session`.
    fn catch_up(&mut self, session: &Session) -> String {
        let displayed = display_transcript(session).unwrap_or_else(|e| {
            warn!("Showing transcript unrendered: {e}");
            session
                .transcript
                .iter()
                .map(|entry| (entry.speaker.clone(), entry.message.clone()))
                .collect()
        });
        let current: Vec<(&str, &(String, String))> = session
            .transcript
            .iter()
            .map(|entry| entry.speaker.as_str())
            .zip(&displayed)
            .collect();

        // Entries still matching what was printed; the last one may have grown.
        let mut kept = 0;
        while let (Some((key, text)), Some((new_key, (_, new_text)))) =
            (self.seen.get(kept), current.get(kept))
        {
            let growing = kept + 1 == self.seen.len();
            let same = key == new_key
                && if growing {
                    new_text.starts_with(text.as_str())
                } else {
                    new_text == text
                };
            if !same {
                break;
            }
            kept += 1;
        }
        // Anything past that was replaced, by a reset for instance.
        self.seen.truncate(kept);

        let mut out = String::new();
        if let Some((key, text)) = self.seen.last_mut() {
            let (_, (_, new_text)) = current[kept - 1];
            if key.as_str() == CHAR_SPEAKER_KEY {
                out.push_str(new_text.get(text.len()..).unwrap_or_default());
            }
            *text = new_text.clone();
        }

        for (key, (name, text)) in &current[kept..] {
            if *key == CHAR_SPEAKER_KEY {
                out.push_str(&format!("{name}: {text}"));
            }
            self.seen.push((key.to_string(), text.clone()));
        }
        out
    }
}

fn show(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

struct Repl {
    controller: GenerationController,
    session_rx: watch::Receiver<Session>,
    printer: ReplyPrinter,
    lines: Lines<BufReader<Stdin>>,
}

impl Repl {
    fn context(&self) -> &ChatContext {
        self.controller.context()
    }

    /// Returns `false` when the user asked to quit.
    fn handle(&mut self, command: Command<'_>) -> bool {
        match command {
            Command::Quit => return false,
            Command::Stop => self.controller.cancel_turn(),
            Command::Reset => {
                self.controller.reset_conversation();
                println!("[conversation cleared]");
            }
            Command::Stats => match self.context().telemetry().current_timing() {
                Some(timings) => println!("{timings}"),
                None => println!("[no completion timings yet]"),
            },
            Command::ShowConfig => self.show_config(),
            Command::Set { name, value } => self.set(name, value),
            Command::Unknown(line) => {
                println!("[unknown command {line}; try /stop /reset /set /stats /config /quit]")
            }
            Command::Message(_) => println!("[still generating, /stop first]"),
        }
        true
    }

    fn set(&self, name: &str, value: &str) {
        let outcome = if Session::FIELDS.contains(&name) {
            self.context()
                .update_session_field(name, &value.replace("\\n", "\n"))
                .map_err(|e| e.to_string())
        } else {
            self.context().update_param(name, value).map_err(|e| e.to_string())
        };
        match outcome {
            Ok(()) => println!("[{name} updated]"),
            Err(e) => println!("[{e}]"),
        }
    }

    fn show_config(&self) {
        let session = serde_json::to_string_pretty(&self.context().session());
        let params = serde_json::to_string_pretty(&self.context().params());
        match (session, params) {
            (Ok(session), Ok(params)) => println!("session: {session}\nsampling: {params}"),
            (Err(e), _) | (_, Err(e)) => println!("[cannot show config: {e}]"),
        }
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let line = tokio::select! {
                line = self.lines.next_line() => line.context("reading stdin")?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                return Ok(());
            };
            match parse_command(&line) {
                None => {}
                Some(Command::Message(message)) => {
                    if let Some(turn) = self.controller.submit_turn(message) {
                        if !self.follow(turn).await? {
                            return Ok(());
                        }
                    }
                }
                Some(command) => {
                    if !self.handle(command) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Print the reply as it streams in, until the turn ends.
    async fn follow(&mut self, turn: TurnHandle) -> anyhow::Result<bool> {
        let finished = turn.finished();
        tokio::pin!(finished);
        let mut keep_going = true;

        loop {
            tokio::select! {
                _ = &mut finished => break,
                changed = self.session_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = self.session_rx.borrow_and_update().clone();
                    show(&self.printer.catch_up(&session));
                }
                _ = tokio::signal::ctrl_c() => self.controller.cancel_turn(),
                line = self.lines.next_line() => {
                    match line.context("reading stdin")? {
                        Some(line) => {
                            if let Some(command) = parse_command(&line) {
                                keep_going &= self.handle(command);
                                if !keep_going {
                                    self.controller.cancel_turn();
                                }
                            }
                        }
                        None => {
                            self.controller.cancel_turn();
                            keep_going = false;
                        }
                    }
                }
            }
        }

        let session = self.session_rx.borrow_and_update().clone();
        show(&self.printer.catch_up(&session));
        println!();
        if let Some(fault) = self.context().last_fault() {
            println!("[error: {fault}]");
        }
        Ok(keep_going)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);

    if let Err(e) = init_logging(&config.log_file, &config.log_level) {
        eprintln!("Failed to set up logging: {e}");
    }
    info!("Starting chat against {}", config.server_url);

    let context = Arc::new(ChatContext::from_config(&config));
    let controller = GenerationController::new(Arc::clone(&context), cli.transport(&config)?);

    println!(
        "Chatting as {} with {}. Commands: /stop /reset /set <name> <value> /stats /config /quit",
        config.session.user, config.session.char
    );

    let mut repl = Repl {
        controller: controller.clone(),
        session_rx: context.subscribe_session(),
        printer: ReplyPrinter::default(),
        lines: BufReader::new(tokio::io::stdin()).lines(),
    };
    let outcome = repl.run().await;

    controller.cancel_turn();
    if let Err(e) = &outcome {
        warn!("Chat loop ended with error: {e:#}");
    }
    info!("Goodbye");
    outcome
}
