use std::env;
use std::io;

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph};
use ratatui::Terminal;

use pda_relay::simulation::{
    run_simulation_scenario, run_simulation_scenario_with_progress, RollingLatencySnapshot,
    SimulationReport, SimulationScenarioConfig, SimulationStepUpdate,
};

const USAGE: &str = "usage: simulation [--quiet] [--tui] <path-to-scenario.toml>";

fn main() -> Result<(), String> {
    let mut use_tui = false;
    let mut quiet = false;
    let mut path = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--tui" => use_tui = true,
            "--quiet" => quiet = true,
            _ if path.is_none() => path = Some(arg),
            _ => return Err(USAGE.to_string()),
        }
    }
    let path = path.ok_or_else(|| USAGE.to_string())?;
    let scenario = SimulationScenarioConfig::load(&path).map_err(|err| err.to_string())?;

    if quiet || use_tui {
        pda_relay::logging::set_writer(Box::new(io::sink()));
    } else {
        pda_relay::logging::init();
    }

    let report = if use_tui {
        run_with_tui(scenario)?
    } else {
        run_simulation_scenario(scenario).map_err(|err| err.to_string())?
    };
    let output = serde_json::to_string_pretty(&report).map_err(|err| err.to_string())?;
    println!("{output}");
    Ok(())
}

fn run_with_tui(scenario: SimulationScenarioConfig) -> Result<SimulationReport, String> {
    enable_raw_mode().map_err(|err| err.to_string())?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).map_err(|err| err.to_string())?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).map_err(|err| err.to_string())?;

    let mut render_error: Option<io::Error> = None;
    let result = run_simulation_scenario_with_progress(scenario, |update| {
        if render_error.is_some() {
            return;
        }
        if let Err(err) = render(&mut terminal, &update) {
            render_error = Some(err);
        }
    });

    disable_raw_mode().map_err(|err| err.to_string())?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).map_err(|err| err.to_string())?;
    terminal.show_cursor().map_err(|err| err.to_string())?;

    if let Some(err) = render_error {
        return Err(err.to_string());
    }
    result.map_err(|err| err.to_string())
}

fn render(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    update: &SimulationStepUpdate,
) -> io::Result<()> {
    terminal
        .draw(|frame| {
            let size = frame.size();
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .margin(1)
                .constraints([
                    Constraint::Length(3),
                    Constraint::Length(7),
                    Constraint::Min(3),
                ])
                .split(size);

            let progress = update.step as f64 / update.total_steps.max(1) as f64;
            let progress_gauge = Gauge::default()
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title("Simulation Progress"),
                )
                .gauge_style(Style::default().fg(Color::Cyan))
                .ratio(progress.clamp(0.0, 1.0))
                .label(format!(
                    "Step {}/{} (t+{:.1}s)",
                    update.step, update.total_steps, update.simulated_seconds
                ));
            frame.render_widget(progress_gauge, chunks[0]);

            let metrics_lines = vec![
                Line::from(Span::raw(format!(
                    "Groups with an active relay: {}",
                    update.active_relays
                ))),
                Line::from(Span::raw(format!(
                    "Messages queued at relays: {}",
                    update.queued_at_relays
                ))),
                Line::from(Span::raw(format!("Submitted (step): {}", update.submitted))),
                Line::from(Span::raw(format!("Delivered (step): {}", update.delivered))),
                Line::from(Span::raw(format!(
                    "Rolling latency (last {}): {}",
                    update.rolling_latency.window,
                    format_latency(&update.rolling_latency)
                ))),
            ];
            let metrics_block = Paragraph::new(metrics_lines)
                .block(Block::default().borders(Borders::ALL).title("Step Metrics"));
            frame.render_widget(metrics_block, chunks[1]);

            let hint = Paragraph::new("Simulation running. Terminal will exit on completion.")
                .block(Block::default().borders(Borders::ALL).title("Status"));
            frame.render_widget(hint, chunks[2]);
        })
        .map(|_| ())
}

fn format_latency(snapshot: &RollingLatencySnapshot) -> String {
    if snapshot.samples == 0 {
        return "no samples yet".to_string();
    }
    let min = snapshot.min.unwrap_or(0);
    let max = snapshot.max.unwrap_or(0);
    let avg = snapshot.average.unwrap_or(0.0);
    format!(
        "min {min} ms / avg {avg:.1} ms / max {max} ms ({} samples)",
        snapshot.samples
    )
}
