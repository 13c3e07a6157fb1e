//! Lesson Trainer - Spaced-repetition language drills in the terminal.

mod app;
mod config;
mod import;
mod ui;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use app::App;
use config::Config;
use crossterm::{
    event::{self, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::prelude::*;
use review_engine::Database;

const USAGE: &str = "usage: lesson-trainer [import <items.json>]";

/// Logs go to a file; the terminal belongs to the UI.
fn init_logging(config: &Config) -> Result<()> {
    let Some(path) = Config::log_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn open_database() -> Result<Database> {
    let db_path = Config::db_path().unwrap_or_else(|| PathBuf::from("lessons.db"));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config)?;
    if Config::config_path().is_some_and(|p| !p.exists()) {
        // First run: write the defaults so they can be edited
        if let Err(e) = config.save() {
            tracing::warn!(error = %e, "could not write default config");
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [cmd, file] if cmd == "import" => {
            let db = open_database()?;
            let count = import::import_file(&db, &config.learner, Path::new(file))?;
            println!("Imported {count} items for {}", config.learner);
            return Ok(());
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    let db = Arc::new(open_database()?);
    let mut app = App::new(config, db).await?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    app.session.close().await;

    if let Err(e) = result {
        tracing::error!(error = %e, "lesson trainer exited with error");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    let tick_rate = Duration::from_millis(100);

    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if app.handle_key(key).await {
                    return Ok(());
                }
            }
        }

        // Grades settle in the background
        app.poll_events().await?;
    }
}
