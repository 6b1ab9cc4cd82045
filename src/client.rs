use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel as channel;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Terminal,
};

use crate::cli::Chat;
use crate::message::is_exit;
use crate::metrics::ThroughputAverager;

const HISTORY: usize = 200;

/// Outbound frame for one typed line: `"<username>: <line>\n"`.
pub fn compose_line(username: &str, input: &str) -> Vec<u8> {
    format!("{username}: {input}\n").into_bytes()
}

/// Appends `chunk` to `pending` and returns every completed line.
/// The stream has no framing, so a line may arrive over several reads.
pub fn split_lines(pending: &mut String, chunk: &[u8]) -> Vec<String> {
    pending.push_str(&String::from_utf8_lossy(chunk));
    let mut lines = Vec::new();
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        lines.push(line.trim_end_matches(['\r', '\n']).to_string());
    }
    lines
}

pub fn run_chat(chat: Chat) -> Result<()> {
    let stream = TcpStream::connect(chat.host)
        .with_context(|| format!("Connecting to chat server at {}", chat.host))?;
    let _ = stream.set_nodelay(true);
    let mut writer = stream.try_clone().context("Cloning TCP stream (writer)")?;

    let stop = Arc::new(AtomicBool::new(false));
    let rx_bytes = Arc::new(AtomicU64::new(0));
    let tx_bytes = Arc::new(AtomicU64::new(0));
    let (log_tx, log_rx) = channel::unbounded::<String>();

    // Reader thread
    {
        let stop = stop.clone();
        let rx_b = rx_bytes.clone();
        let log_tx = log_tx.clone();
        let mut reader = stream;
        thread::Builder::new()
            .name("chat-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                let mut pending = String::new();
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            if !stop.load(Ordering::Relaxed) {
                                let _ = log_tx.send("! server closed the connection".to_string());
                            }
                            break;
                        }
                        Ok(n) => {
                            rx_b.fetch_add(n as u64, Ordering::Relaxed);
                            for line in split_lines(&mut pending, &buf[..n]) {
                                let _ = log_tx.send(line);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            if !stop.load(Ordering::Relaxed) {
                                let _ = log_tx.send(format!("! read error: {e}"));
                            }
                            break;
                        }
                    }
                }
            })
            .context("Spawning reader thread")?;
    }

    // UI setup
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut logs: Vec<String> = Vec::new();
    let mut input = String::new();
    let mut last_rx = 0u64;
    let mut last_tx = 0u64;
    let mut avg_in = ThroughputAverager::new(5.0);
    let mut avg_out = ThroughputAverager::new(5.0);
    let mut last_time = Instant::now();

    let result = (|| -> Result<()> {
        loop {
            while let Ok(line) = log_rx.try_recv() {
                logs.push(line);
                if logs.len() > HISTORY {
                    logs.remove(0);
                }
            }

            let now = Instant::now();
            let dt = now.duration_since(last_time).as_secs_f64().max(0.001);
            let rx = rx_bytes.load(Ordering::Relaxed);
            let tx = tx_bytes.load(Ordering::Relaxed);
            let inbound = avg_in.update(rx - last_rx, dt) as u64;
            let outbound = avg_out.update(tx - last_tx, dt) as u64;
            last_rx = rx;
            last_tx = tx;
            last_time = now;

            terminal.draw(|f| {
                let chunks = Layout::default()
                    .direction(Direction::Vertical)
                    .constraints([
                        Constraint::Length(1),
                        Constraint::Min(3),
                        Constraint::Length(3),
                    ])
                    .split(f.size());

                let header = Paragraph::new(format!(
                    "{} @ {} | In: {} B/s Out: {} B/s",
                    chat.username, chat.host, inbound, outbound
                ));
                f.render_widget(header, chunks[0]);

                // Auto-scroll: render only the last lines that fit
                let viewport = chunks[1].height.saturating_sub(2) as usize;
                let start = logs.len().saturating_sub(viewport);
                let lines: Vec<Line> = logs.iter().skip(start).map(|l| Line::from(Span::raw(l.clone()))).collect();
                let para = Paragraph::new(lines)
                    .wrap(Wrap { trim: false })
                    .block(Block::default().title("Chatroom").borders(Borders::ALL));
                f.render_widget(para, chunks[1]);

                let input_box = Paragraph::new(input.clone()).block(
                    Block::default()
                        .title("Input (Enter to send, \"exit\" or Ctrl+C to quit)")
                        .borders(Borders::ALL),
                );
                f.render_widget(input_box, chunks[2]);
            })?;

            if !event::poll(Duration::from_millis(50))? {
                continue;
            }
            let Event::Key(k) = event::read()? else {
                continue;
            };
            match k.code {
                KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => return Ok(()),
                KeyCode::Char(c) => input.push(c),
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Esc => input.clear(),
                KeyCode::Enter if !input.is_empty() => {
                    if is_exit(input.as_bytes()) {
                        let _ = writer.write_all(b"exit\n");
                        return Ok(());
                    }
                    let frame = compose_line(&chat.username, &input);
                    match writer.write_all(&frame) {
                        Ok(()) => {
                            tx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            let _ = log_tx.send(format!("! write error: {e}"));
                        }
                    }
                    input.clear();
                }
                _ => {}
            }
        }
    })();

    stop.store(true, Ordering::Relaxed);
    let _ = writer.shutdown(Shutdown::Both);
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}
