use crate::app::{self, Settings};
use crate::chat::{Conversation, Reply};
use crate::error::{ChatError, ChatErrorKind};
use crate::provider::ModelInfo;
use crate::transcript::Transcript;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const HELP: &str =
    "Commands: /quit, /clear, /model [number|name], /models, /stream, /stats, /log, /help";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Quit,
    Clear,
    Model(Option<String>),
    Models,
    Stream,
    Stats,
    Log,
    Help,
    Blank,
    Prompt(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Blank;
        }
        let Some(cmd) = line.strip_prefix('/') else {
            return Input::Prompt(line.to_string());
        };

        let (name, rest) = match cmd.split_once(char::is_whitespace) {
            Some((n, r)) => (n, r.trim()),
            None => (cmd, ""),
        };
        match name.to_ascii_lowercase().as_str() {
            "quit" | "exit" => Input::Quit,
            "clear" | "reset" => Input::Clear,
            "model" if rest.is_empty() => Input::Model(None),
            "model" => Input::Model(Some(rest.to_string())),
            "models" => Input::Models,
            "stream" => Input::Stream,
            "stats" => Input::Stats,
            "log" => Input::Log,
            "help" => Input::Help,
            // Unknown commands go to the model verbatim.
            _ => Input::Prompt(line.to_string()),
        }
    }
}

/// Chat-capable models from a discovery result, or the fallback list when
/// discovery failed or found nothing usable.
fn selectable_models(found: Result<Vec<ModelInfo>, ChatError>) -> Vec<ModelInfo> {
    let models = match found {
        Ok(models) => app::chat_models(models),
        Err(e) => {
            tracing::warn!(error = %e, "could not fetch models; using fallback list");
            Vec::new()
        }
    };
    if models.is_empty() {
        return app::fallback_models();
    }
    models
}

/// 1-based pick from the last listing.
fn pick(models: &[ModelInfo], n: usize) -> Option<&str> {
    n.checked_sub(1)
        .and_then(|i| models.get(i))
        .map(|m| m.id.as_str())
}

fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Rough token estimate: four characters per token.
fn estimate_tokens(chars: usize) -> usize {
    chars / 4
}

fn tokens_per_second(chars: usize, elapsed: Duration) -> f64 {
    estimate_tokens(chars) as f64 / elapsed.as_secs_f64().max(0.001)
}

#[derive(Debug, Clone)]
struct ResponseMetrics {
    model: String,
    prompt_chars: usize,
    response_chars: usize,
    words: usize,
    elapsed: Duration,
    first_delta: Option<Duration>,
    at: DateTime<Local>,
}

#[derive(Debug, Default)]
struct SessionStats {
    responses: Vec<ResponseMetrics>,
}

impl SessionStats {
    fn record(&mut self, m: ResponseMetrics) {
        self.responses.push(m);
    }

    fn average(&self) -> Option<Duration> {
        let n = self.responses.len();
        if n == 0 {
            return None;
        }
        Some(self.responses.iter().map(|m| m.elapsed).sum::<Duration>() / n as u32)
    }

    fn summary(&self, now: DateTime<Local>) -> String {
        let (Some(first), Some(avg)) = (self.responses.first(), self.average()) else {
            return "No responses yet.".to_string();
        };
        let n = self.responses.len();
        let total: Duration = self.responses.iter().map(|m| m.elapsed).sum();
        let fastest = self.responses.iter().map(|m| m.elapsed).min().unwrap_or_default();
        let slowest = self.responses.iter().map(|m| m.elapsed).max().unwrap_or_default();
        let chars: usize = self.responses.iter().map(|m| m.response_chars).sum();
        let prompt_chars: usize = self.responses.iter().map(|m| m.prompt_chars).sum();
        let words: usize = self.responses.iter().map(|m| m.words).sum();
        let session = (now - first.at).to_std().unwrap_or_default();

        let mut s = format!(
            "Responses: {n}\nTotal time: {}\nAverage: {}\nFastest: {}\nSlowest: {}\n\
             Characters: {prompt_chars} in, {chars} out\nWords: {words}\nEst. tokens: ~{}\n\
             Session duration: {}",
            format_elapsed(total),
            format_elapsed(avg),
            format_elapsed(fastest),
            format_elapsed(slowest),
            estimate_tokens(chars),
            format_elapsed(session),
        );
        let firsts: Vec<Duration> = self.responses.iter().filter_map(|m| m.first_delta).collect();
        if !firsts.is_empty() {
            let avg_first = firsts.iter().sum::<Duration>() / firsts.len() as u32;
            s.push_str(&format!("\nAverage first delta: {}", format_elapsed(avg_first)));
        }

        let mut per_model: BTreeMap<&str, (u32, Duration)> = BTreeMap::new();
        for m in &self.responses {
            let e = per_model.entry(m.model.as_str()).or_default();
            e.0 += 1;
            e.1 += m.elapsed;
        }
        let mut usage: Vec<_> = per_model.into_iter().collect();
        usage.sort_by(|a, b| b.1 .0.cmp(&a.1 .0));
        s.push_str("\nModels used:");
        for (model, (count, time)) in usage {
            let avg = (time / count).as_secs_f64();
            s.push_str(&format!("\n  {model}: {count} requests (avg {avg:.2}s)"));
        }

        if let Some(last) = self.responses.last() {
            s.push_str(&format!(
                "\nLast: {} at {}",
                last.model,
                last.at.format("%H:%M:%S")
            ));
        }
        s
    }
}

fn format_elapsed(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

pub struct Repl {
    conv: Conversation,
    model: String,
    stream: bool,
    transcript: Option<Transcript>,
    stats: SessionStats,
    /// Last model listing; `/model <N>` picks from it.
    models: Vec<ModelInfo>,
}

impl Repl {
    pub fn new(conv: Conversation, settings: &Settings, transcript: Option<Transcript>) -> Self {
        Self {
            conv,
            model: settings.model.clone(),
            stream: settings.stream,
            transcript,
            stats: SessionStats::default(),
            models: Vec::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Some(t) = &self.transcript {
            println!("Conversation log: {}", t.path().display());
        }
        println!("Model: {}. {HELP}", self.model);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let mode = if self.stream { "on" } else { "off" };
            if self.conv.depth() > 0 {
                println!("(context: {} turns, streaming {mode})", self.conv.depth());
            }
            print!("> ");
            std::io::stdout().flush().ok();

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                break;
            };

            match Input::parse(&line) {
                Input::Quit => {
                    self.command("/quit");
                    break;
                }
                Input::Blank => println!("Prompt cannot be empty."),
                Input::Clear => {
                    self.command("/clear");
                    self.conv.reset();
                    println!("Conversation context cleared. Starting fresh.");
                }
                Input::Model(Some(arg)) => {
                    if let Some(picked) = self.choose_model(&arg).await {
                        self.command(&format!("/model {picked}"));
                        println!("Model set to: {picked}");
                    }
                }
                Input::Model(None) => {
                    println!("Current model: {}", self.model);
                    self.list_models().await;
                    println!("Select with /model <number> or /model <name>.");
                }
                Input::Models => self.list_models().await,
                Input::Stream => {
                    self.stream = !self.stream;
                    let state = if self.stream { "enabled" } else { "disabled" };
                    self.command(&format!("/stream ({state})"));
                    println!("Streaming {state}");
                }
                Input::Stats => {
                    self.command("/stats");
                    self.print_stats();
                }
                Input::Log => match &self.transcript {
                    Some(t) => println!("Conversation log: {}", t.path().display()),
                    None => println!("Transcript is disabled."),
                },
                Input::Help => println!("{HELP}"),
                Input::Prompt(prompt) => self.ask(&prompt).await,
            }
        }

        if !self.stats.responses.is_empty() {
            self.print_stats();
        }
        Ok(())
    }

    fn command(&mut self, cmd: &str) {
        if let Some(t) = self.transcript.as_mut() {
            t.log_command(cmd);
        }
    }

    fn print_stats(&self) {
        println!("{}", self.stats.summary(Local::now()));
        let mode = if self.stream { "enabled" } else { "disabled" };
        println!("Streaming: {mode}\nContext depth: {} turns", self.conv.depth());
    }

    async fn refresh_models(&mut self) {
        let found = self.conv.provider().list_models().await;
        self.models = selectable_models(found);
    }

    async fn list_models(&mut self) {
        self.refresh_models().await;
        for (i, m) in self.models.iter().enumerate() {
            let about = m
                .description
                .as_deref()
                .or(m.display_name.as_deref())
                .unwrap_or("");
            let current = if m.id == self.model { " (current)" } else { "" };
            println!("  [{}] {}{current}  {}", i + 1, m.id, app::truncate(about, 60));
        }
    }

    /// Switch to a model by listing number or by name. Returns the new model,
    /// or `None` after reporting an invalid number.
    async fn choose_model(&mut self, arg: &str) -> Option<String> {
        let Ok(n) = arg.parse::<usize>() else {
            self.model = arg.to_string();
            return Some(self.model.clone());
        };
        if self.models.is_empty() {
            self.refresh_models().await;
        }
        match pick(&self.models, n) {
            Some(id) => {
                self.model = id.to_string();
                Some(self.model.clone())
            }
            None => {
                println!(
                    "Invalid selection. Choose a number between 1 and {}.",
                    self.models.len()
                );
                None
            }
        }
    }

    async fn ask(&mut self, prompt: &str) {
        if let Some(t) = self.transcript.as_mut() {
            t.log_prompt(prompt, &self.model, self.stream);
        }

        let cancel = CancellationToken::new();
        let watcher = app::cancel_on_ctrl_c(&cancel);
        let started = Instant::now();
        let mut first_delta = None;

        let result = if self.stream {
            let mut out = std::io::stdout();
            let r = self
                .conv
                .send_streaming(&self.model, prompt, &cancel, |delta| {
                    first_delta.get_or_insert_with(|| started.elapsed());
                    print!("{delta}");
                    out.flush().ok();
                })
                .await;
            println!();
            r
        } else {
            self.conv.send(&self.model, prompt, &cancel).await
        };
        watcher.abort();
        let elapsed = started.elapsed();

        match result {
            Ok(Reply::Text(text)) => {
                if !self.stream {
                    println!("{text}");
                }
                let chars = text.chars().count();
                let words = count_words(&text);
                let first = first_delta
                    .map(|d| format!(", first delta after {}", format_elapsed(d)))
                    .unwrap_or_default();
                println!(
                    "({words} words, {chars} chars, ~{} tokens in {}, {:.1} tokens/s{first})",
                    estimate_tokens(chars),
                    format_elapsed(elapsed),
                    tokens_per_second(chars, elapsed),
                );
                if let Some(avg) = self.stats.average() {
                    let pace = if elapsed < avg { "faster" } else { "slower" };
                    println!("(session average {}, this one {pace})", format_elapsed(avg));
                }

                if let Some(t) = self.transcript.as_mut() {
                    t.log_response(&text, elapsed, &self.model);
                }
                self.stats.record(ResponseMetrics {
                    model: self.model.clone(),
                    prompt_chars: prompt.chars().count(),
                    response_chars: chars,
                    words,
                    elapsed,
                    first_delta,
                    at: Local::now(),
                });
            }
            Ok(Reply::Empty) => {
                println!("No response received (took {}).", format_elapsed(elapsed));
                if let Some(t) = self.transcript.as_mut() {
                    t.log_empty(elapsed, &self.model);
                }
            }
            Err(e) => {
                self.report(&e);
                if let Some(t) = self.transcript.as_mut() {
                    t.log_error(&e, &self.model, prompt);
                }
            }
        }
    }

    fn report(&self, e: &ChatError) {
        match e.kind {
            ChatErrorKind::Cancelled => println!("(cancelled; the prompt was not kept)"),
            ChatErrorKind::Validation => println!("{e}"),
            ChatErrorKind::Transport if e.is_server_error() => {
                tracing::error!(error = %e, "server error from Gemini API");
                println!("Server error: the model '{}' is experiencing issues.", self.model);
                println!("Tip: try a different model with /model <name>.");
            }
            ChatErrorKind::Transport => {
                tracing::error!(error = %e, "transport error during content generation");
                println!("Network error: {e}");
            }
            ChatErrorKind::Decode => {
                tracing::error!(error = %e, "undecodable response");
                println!("Unexpected response: {e}");
            }
        }
    }
}
