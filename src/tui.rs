//! Owns the terminal for the lifetime of the dashboard.
//!
//! A background task merges three sources into one channel the event loop in
//! `app` drains: crossterm input, a slow tick and a fast frame clock. Ticks
//! drive work that is due on a timer (revalidating visible listings, expiring
//! toasts, spinning loaders). Frames only redraw the navigation stack, status
//! bar and toasts from state the loop already holds.

use std::io::Stdout;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use crossterm::cursor;
use crossterm::event::{Event as CrosstermEvent, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen};
use futures::{FutureExt, StreamExt};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long the input task gets to notice cancellation before it is aborted.
const ABORT_AFTER: Duration = Duration::from_millis(500);
/// Past this, restoring the terminal gives up on the task entirely.
const GIVE_UP_AFTER: Duration = Duration::from_secs(2);

pub type Backend = CrosstermBackend<Stdout>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Ctrl+C or SIGTERM.
    Quit,
    /// The input stream failed; shown as an error toast.
    Error(String),
    /// Timer work: due revalidations, toast expiry, spinners.
    Tick,
    /// Redraw the current screen.
    Render,
    Key(KeyEvent),
    Resize(u16, u16),
}

/// Maps raw terminal input to dashboard events. `None` means the input is
/// of no interest (mouse, focus, paste, key releases and repeats).
pub fn translate(event: CrosstermEvent) -> Option<Event> {
    match event {
        CrosstermEvent::Key(key) if key.kind == KeyEventKind::Press => {
            if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                Some(Event::Quit)
            } else {
                Some(Event::Key(key))
            }
        }
        CrosstermEvent::Resize(width, height) => Some(Event::Resize(width, height)),
        CrosstermEvent::Key(_)
        | CrosstermEvent::Mouse(_)
        | CrosstermEvent::Paste(_)
        | CrosstermEvent::FocusGained
        | CrosstermEvent::FocusLost => None,
    }
}

pub struct Tui {
    terminal: Terminal<Backend>,
    input: JoinHandle<()>,
    stop: CancellationToken,
    events: UnboundedReceiver<Event>,
    sender: UnboundedSender<Event>,
    frame_period: Duration,
    tick_period: Duration,
}

impl Tui {
    /// Rates are per second. The terminal is left alone until [`Tui::enter`].
    pub fn new(frame_rate: f64, tick_rate: f64) -> color_eyre::Result<Self> {
        let (sender, events) = mpsc::unbounded_channel();
        Ok(Self {
            terminal: Terminal::new(Backend::new(std::io::stdout()))?,
            input: tokio::spawn(async {}),
            stop: CancellationToken::new(),
            events,
            sender,
            frame_period: Duration::from_secs_f64(1.0 / frame_rate),
            tick_period: Duration::from_secs_f64(1.0 / tick_rate),
        })
    }

    pub fn enter(&mut self) -> color_eyre::Result<()> {
        crossterm::terminal::enable_raw_mode()?;
        crossterm::execute!(std::io::stdout(), EnterAlternateScreen, cursor::Hide)?;
        self.spawn_input();
        Ok(())
    }

    /// Restores the shell's terminal. Calling it twice is harmless.
    pub fn exit(&mut self) -> color_eyre::Result<()> {
        self.join_input()?;
        if crossterm::terminal::is_raw_mode_enabled()? {
            self.flush()?;
            crossterm::execute!(std::io::stdout(), LeaveAlternateScreen, cursor::Show)?;
            crossterm::terminal::disable_raw_mode()?;
        }
        Ok(())
    }

    /// Ctrl+Z: gives the terminal back and stops the process until `fg`.
    pub fn suspend(&mut self) -> color_eyre::Result<()> {
        self.exit()?;
        #[cfg(not(windows))]
        signal_hook::low_level::raise(signal_hook::consts::SIGTSTP)?;
        Ok(())
    }

    pub fn resume(&mut self) -> color_eyre::Result<()> {
        self.enter()?;
        self.clear()?;
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    fn spawn_input(&mut self) {
        self.stop.cancel();
        self.stop = CancellationToken::new();
        self.input = tokio::spawn(pump(
            self.sender.clone(),
            self.stop.clone(),
            self.tick_period,
            self.frame_period,
        ));
    }

    fn join_input(&mut self) -> color_eyre::Result<()> {
        self.stop.cancel();
        let started = Instant::now();
        while !self.input.is_finished() {
            let waited = started.elapsed();
            if waited >= GIVE_UP_AFTER {
                return Err(color_eyre::eyre::eyre!("Input task did not stop"));
            }
            if waited >= ABORT_AFTER {
                self.input.abort();
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

/// Feeds `sender` until `stop` fires or the receiver is gone.
async fn pump(sender: UnboundedSender<Event>, stop: CancellationToken, tick_period: Duration, frame_period: Duration) {
    let mut input = EventStream::new();
    let mut ticks = interval(tick_period);
    let mut frames = interval(frame_period);
    // A stalled loop should not be answered with a burst of redraws.
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    #[cfg(unix)]
    forward_sigterm(&sender);

    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            _ = ticks.tick() => Event::Tick,
            _ = frames.tick() => Event::Render,
            next = input.next().fuse() => match next {
                Some(Ok(raw)) => match translate(raw) {
                    Some(event) => event,
                    None => continue,
                },
                Some(Err(err)) => Event::Error(err.to_string()),
                None => break,
            },
        };
        if sender.send(event).is_err() {
            break;
        }
    }
    debug!("Input task stopped");
}

#[cfg(unix)]
fn forward_sigterm(sender: &UnboundedSender<Event>) {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            let sender = sender.clone();
            tokio::spawn(async move {
                if sigterm.recv().await.is_some() {
                    _ = sender.send(Event::Quit);
                }
            });
        }
        Err(err) => warn!(error = %err, "Could not install SIGTERM handler"),
    }
}

impl Deref for Tui {
    type Target = Terminal<Backend>;

    fn deref(&self) -> &Self::Target {
        &self.terminal
    }
}

impl DerefMut for Tui {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.terminal
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        if let Err(err) = self.exit() {
            error!(error = %err, "Failed to restore the terminal");
        }
    }
}
