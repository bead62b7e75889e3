#![cfg(feature = "tui")]

use crate::app::Settings;
use crate::chat::{Conversation, Reply};
use crate::error::ChatError;
use anyhow::Context;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct ChatLine {
    role: &'static str,
    text: String,
}

enum StreamMsg {
    Delta(String),
    /// The call is over; the conversation comes back with its outcome.
    Finished(Conversation, Result<Reply, ChatError>),
}

/// A call in flight owns the conversation until it reports back.
struct Active {
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    cancel: CancellationToken,
}

struct State {
    model: String,
    input: String,
    lines: Vec<ChatLine>,
    conv: Option<Conversation>,
    active: Option<Active>,
}

pub async fn run_tui(conv: Conversation, settings: &Settings) -> anyhow::Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while let Ok(ev) = crossterm::event::read() {
            if ev_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let mut state = State {
        model: settings.model.clone(),
        input: String::new(),
        lines: vec![ChatLine {
            role: "system",
            text: "Type a message and press Enter. Esc cancels a response. Commands: /quit, /clear, /model <name>"
                .to_string(),
        }],
        conv: Some(conv),
        active: None,
    };

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));

    let res = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = draw(&mut terminal, &state) {
                    break Err(e);
                }
            }
            Some(ev) = ev_rx.recv() => {
                if let Event::Key(key) = ev {
                    if handle_key(key, &mut state) {
                        break Ok(());
                    }
                }
            }
            Some(msg) = async {
                match &mut state.active {
                    Some(a) => a.rx.recv().await,
                    None => None,
                }
            } => {
                handle_stream(msg, &mut state);
            }
        }
    };

    if let Some(a) = &state.active {
        a.cancel.cancel();
    }
    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    res
}

fn handle_stream(msg: StreamMsg, state: &mut State) {
    match msg {
        StreamMsg::Delta(t) => {
            if let Some(last) = state.lines.last_mut() {
                if last.role == "model" {
                    last.text.push_str(&t);
                }
            }
        }
        StreamMsg::Finished(conv, result) => {
            state.conv = Some(conv);
            state.active = None;
            match result {
                Ok(Reply::Text(_)) => {}
                Ok(Reply::Empty) => {
                    drop_pending_lines(&mut state.lines);
                    state.lines.push(ChatLine {
                        role: "system",
                        text: "(no response received)".to_string(),
                    });
                }
                Err(e) => {
                    drop_pending_lines(&mut state.lines);
                    let role = if e.is_cancelled() { "system" } else { "error" };
                    state.lines.push(ChatLine {
                        role,
                        text: e.to_string(),
                    });
                }
            }
        }
    }
}

/// The engine discarded the prompt, so the screen does too.
fn drop_pending_lines(lines: &mut Vec<ChatLine>) {
    if lines.last().is_some_and(|l| l.role == "model") {
        lines.pop();
    }
    if lines.last().is_some_and(|l| l.role == "user") {
        lines.pop();
    }
}

fn handle_key(key: KeyEvent, state: &mut State) -> bool {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return true;
    }

    match key.code {
        KeyCode::Esc => match &state.active {
            Some(a) => a.cancel.cancel(),
            None => return true,
        },
        KeyCode::Char(c) => state.input.push(c),
        KeyCode::Backspace => {
            state.input.pop();
        }
        KeyCode::Enter => {
            let msg = state.input.trim().to_string();
            state.input.clear();
            if msg.is_empty() {
                return false;
            }

            if msg == "/quit" {
                return true;
            }
            if let Some(rest) = msg.strip_prefix("/model ") {
                state.model = rest.trim().to_string();
                state.lines.push(ChatLine {
                    role: "system",
                    text: format!("model set to: {}", state.model),
                });
                return false;
            }

            let Some(mut conv) = state.conv.take() else {
                state.lines.push(ChatLine {
                    role: "system",
                    text: "(streaming in progress; wait for completion or press Esc)".to_string(),
                });
                return false;
            };

            if msg == "/clear" {
                conv.reset();
                state.conv = Some(conv);
                state.lines.clear();
                return false;
            }

            state.lines.push(ChatLine {
                role: "user",
                text: msg.clone(),
            });
            state.lines.push(ChatLine {
                role: "model",
                text: String::new(),
            });

            let (tx, rx) = mpsc::unbounded_channel::<StreamMsg>();
            let cancel = CancellationToken::new();
            state.active = Some(Active {
                rx,
                cancel: cancel.clone(),
            });

            let model = state.model.clone();
            tokio::spawn(async move {
                let deltas = tx.clone();
                let result = conv
                    .send_streaming(&model, &msg, &cancel, |d| {
                        let _ = deltas.send(StreamMsg::Delta(d.to_string()));
                    })
                    .await;
                let _ = tx.send(StreamMsg::Finished(conv, result));
            });
        }
        _ => {}
    }

    false
}

fn draw(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, state: &State) -> anyhow::Result<()> {
    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(3)])
            .split(f.area());

        let mut text = Text::default();
        for l in &state.lines {
            let role = format!("{}: ", l.role);
            let style = match l.role {
                "user" | "error" => Style::default().add_modifier(Modifier::BOLD),
                _ => Style::default(),
            };
            text.lines.push(Line::styled(role, style));
            text.lines.extend(Text::from(l.text.clone()).lines);
            text.lines.push(Line::from(""));
        }

        let depth = state.conv.as_ref().map(|c| c.depth());
        let title = match depth {
            Some(d) => format!("gemini-chat - model: {} - context: {d} turns", state.model),
            None => format!("gemini-chat - model: {} - streaming...", state.model),
        };
        let chat = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(title))
            .wrap(Wrap { trim: false });

        let input_w = Paragraph::new(state.input.clone())
            .block(Block::default().borders(Borders::ALL).title("input"));

        f.render_widget(chat, chunks[0]);
        f.render_widget(input_w, chunks[1]);

        let x = chunks[1].x + 1 + state.input.chars().count() as u16;
        let y = chunks[1].y + 1;
        f.set_cursor_position((x.min(chunks[1].x + chunks[1].width.saturating_sub(2)), y));
    })?;
    Ok(())
}
