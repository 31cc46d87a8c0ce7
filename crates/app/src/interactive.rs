//! Line-based menu and control panel. Both talk to the generator only through
//! the [`ControlWorker`] request/event contract.

use std::io::{self, BufRead, Write};

use modal_drive_core::{
    ControlWorker, Direction, Event, ModeCatalog, ModeReport, Request, Result, SessionState,
    StepOutcome,
};

/// What one panel key asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelKey {
    Direction(Direction),
    StartPause,
    StopAll,
    Quit,
}

impl PanelKey {
    /// Interprets one input line. A line holding only spaces is the
    /// start/pause key.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() && line.trim().is_empty() {
            return Some(Self::StartPause);
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "w" => Some(Self::Direction(Direction::Forward)),
            "d" => Some(Self::Direction(Direction::Right)),
            "s" => Some(Self::Direction(Direction::Backward)),
            "a" => Some(Self::Direction(Direction::Left)),
            "p" | "space" => Some(Self::StartPause),
            "x" => Some(Self::StopAll),
            "q" => Some(Self::Quit),
            _ => None,
        }
    }

    pub fn request(self) -> Option<Request> {
        match self {
            Self::Direction(direction) => Some(Request::SelectMode(direction.mode_id())),
            Self::StartPause => Some(Request::Toggle),
            Self::StopAll => Some(Request::Stop),
            Self::Quit => None,
        }
    }
}

/// Menu choice: a mode id, stop, or exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Mode(u8),
    Stop,
    Exit,
}

impl MenuChoice {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "0" | "q" | "exit" => Some(Self::Exit),
            "s" | "stop" => Some(Self::Stop),
            other => other.parse::<u8>().ok().map(Self::Mode),
        }
    }
}

pub fn run_menu(worker: ControlWorker, catalog: &ModeCatalog) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        println!();
        for mode in catalog.modes() {
            println!("  {}. {}", mode.id, mode.name);
        }
        println!("  s. Stop output");
        println!("  0. Exit");
        print_status(&worker);
        prompt("Select mode: ")?;

        let Some(line) = lines.next() else { break };
        let request = match MenuChoice::parse(&line?) {
            Some(MenuChoice::Exit) => break,
            Some(MenuChoice::Stop) => Request::Stop,
            Some(MenuChoice::Mode(id)) => Request::SelectMode(id),
            None => {
                println!("Unknown choice.");
                continue;
            }
        };
        worker.send(request)?;
        await_outcome(&worker);
    }

    worker.shutdown();
    println!("Device closed.");
    Ok(())
}

pub fn run_panel(worker: ControlWorker) -> Result<()> {
    println!("Direction control panel");
    println!("  w forward   d right   s backward   a left");
    println!("  <space> start/pause   x stop all   q quit");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        prompt("> ")?;
        let Some(line) = lines.next() else { break };
        let Some(key) = PanelKey::parse(&line?) else {
            println!("Unknown key.");
            continue;
        };
        let Some(request) = key.request() else { break };
        worker.send(request)?;
        await_outcome(&worker);
        print_status(&worker);
    }

    worker.shutdown();
    println!("Device closed.");
    Ok(())
}

fn prompt(text: &str) -> Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "{text}")?;
    stdout.flush()?;
    Ok(())
}

/// Blocks until the worker reports how the last request ended.
fn await_outcome(worker: &ControlWorker) {
    while let Some(event) = worker.recv() {
        match event {
            Event::Configuring { mode_id } => println!("Configuring mode {mode_id}..."),
            Event::ModeReady(report) => {
                print_report(&report);
                return;
            }
            Event::OutputChanged { running } => {
                println!("{}", if running { "Output running." } else { "Output paused." });
                return;
            }
            Event::Stopped(steps) => {
                print_stopped(&steps);
                return;
            }
            Event::Failed { request, error } => {
                println!("{request:?} failed: {error}");
                return;
            }
            Event::Closed => return,
        }
    }
}

pub fn print_report(report: &ModeReport) {
    println!(
        "{} running at {:.3} Hz ({} points, {:.1} Sa/s)",
        report.mode, report.frequency, report.point_count, report.sample_rate
    );
    for (channel, normalization) in report.normalization.iter().enumerate() {
        if normalization.is_skipped() {
            println!("  warning: channel {} is all zero", channel + 1);
        }
    }
    for line in step_warnings(report.degraded()) {
        println!("{line}");
    }
    if report.tracking_confirmed == Some(false) {
        println!("  warning: channel tracking is not reported as on");
    }
}

pub fn print_stopped(steps: &[StepOutcome]) {
    println!("Output stopped.");
    for line in step_warnings(steps.iter().filter(|outcome| outcome.is_failed())) {
        println!("{line}");
    }
}

fn step_warnings<'a>(outcomes: impl Iterator<Item = &'a StepOutcome>) -> Vec<String> {
    outcomes
        .map(|outcome| format!("  warning: {} {:?}", outcome.step, outcome.status))
        .collect()
}

fn print_status(worker: &ControlWorker) {
    let Some(status) = worker.status() else { return };
    let mode = status
        .mode_name
        .map(|name| format!(" / {name}"))
        .unwrap_or_default();
    let output = match status.state {
        SessionState::OutputEnabled => "running",
        SessionState::Paused => "paused",
        _ => "off",
    };
    println!("[{}{} / output {}]", status.state, mode, output);
}
