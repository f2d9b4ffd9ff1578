use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tracing::{info, warn};

use replay_core::context::RunContext;
use replay_core::interpreter::RunOutcome;
use replay_core::matcher::TemplateMatcher;
use replay_core::ocr::{EngineChoice, Lang, OcrResolver};
use replay_core::platform::{create_platform, hotkey};
use replay_core::resolve::TargetResolver;
use replay_core::runner::{self, Runner, Shared};
use replay_core::settings::Settings;
use replay_core::step::load_macro;
use replay_core::types::{Command, RunState};
use replay_core::{logger, validate};

#[derive(Parser)]
#[command(name = "replay", version, about = "Replay desktop macros driven by screen matching and OCR")]
struct Cli {
    /// Use the in-memory stub platform instead of the real desktop
    #[arg(long, global = true)]
    stub: bool,

    /// Settings file (default: ./settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory for app.log (default: ./logs)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Interactive terminal UI (default)
    Tui { file: Option<PathBuf> },
    /// Run a macro headless and print its progress
    Run { file: PathBuf },
    /// Report block-structure problems in a macro
    Check { file: PathBuf },
    /// List the OCR engines available on this machine
    Engines,
    /// Look for an image on the full screen
    ProbeImage {
        path: PathBuf,
        #[arg(long)]
        confidence: Option<f32>,
    },
    /// Look for text on the full screen
    ProbeText {
        text: String,
        #[arg(long, default_value = "eng")]
        lang: String,
        #[arg(long, default_value = "auto")]
        engine: String,
    },
}

fn cwd_join(name: &str) -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(name)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings.clone().unwrap_or_else(|| cwd_join("settings.json"));
    let log_dir = cli.log_dir.clone().unwrap_or_else(|| cwd_join("logs"));
    logger::init(&log_dir)?;

    let mut settings = Settings::load(&settings_path);

    match cli.command.unwrap_or(Cmd::Tui { file: None }) {
        Cmd::Tui { file } => tui(cli.stub, &mut settings, &settings_path, file),
        Cmd::Run { file } => run_headless(cli.stub, &settings, &file),
        Cmd::Check { file } => check(&file),
        Cmd::Engines => {
            let ocr = OcrResolver::new(&settings.ocr);
            let engines = ocr.available_engines();
            if engines.is_empty() {
                println!("no OCR engines available");
            }
            for e in engines {
                println!("{}", e);
            }
            Ok(())
        }
        Cmd::ProbeImage { path, confidence } => {
            let mut platform = create_platform(cli.stub);
            let matcher = TemplateMatcher::new(&settings.engine);
            let ocr = OcrResolver::new(&settings.ocr);
            let resolver = TargetResolver::new(&matcher, &ocr, &settings.engine);
            let conf = confidence.unwrap_or(settings.engine.default_confidence);
            match resolver.locate_image(platform.as_mut(), &path, conf)? {
                Some(m) => println!("found at {} ({}x{}, score {:.3})", m.center, m.width, m.height, m.score),
                None => println!("not found"),
            }
            Ok(())
        }
        Cmd::ProbeText { text, lang, engine } => {
            let Some(engine) = EngineChoice::parse(&engine) else {
                bail!("unknown OCR engine '{}'", engine);
            };
            let mut platform = create_platform(cli.stub);
            let matcher = TemplateMatcher::new(&settings.engine);
            let ocr = OcrResolver::new(&settings.ocr);
            let resolver = TargetResolver::new(&matcher, &ocr, &settings.engine);
            let mut ctx = RunContext::default();
            let found = resolver.locate_text(platform.as_mut(), &text, Lang::parse_lenient(&lang), engine, &mut ctx)?;
            match found {
                Some(m) => println!("found at {}\n{}", m.point, m.full_text),
                None => println!("not found"),
            }
            Ok(())
        }
    }
}

fn check(file: &Path) -> Result<()> {
    let steps = load_macro(file)?;
    let issues = validate::validate(&steps);
    if issues.is_empty() {
        println!("{}: {} steps, ok", file.display(), steps.len());
        return Ok(());
    }
    for issue in &issues {
        println!("{}", issue);
    }
    bail!("{} issue(s) in {}", issues.len(), file.display())
}

fn run_headless(stub: bool, settings: &Settings, file: &Path) -> Result<()> {
    let steps = load_macro(file)?;
    let mut runner = Runner::new(create_platform(stub), settings);
    runner.start(&steps)?;

    let report = loop {
        for status in runner.poll_status() {
            println!("{}", status);
        }
        if let Some(report) = runner.try_finish() {
            break report;
        }
        thread::sleep(Duration::from_millis(100));
    };
    for status in runner.poll_status() {
        println!("{}", status);
    }
    println!("{}", report.stats);

    if settings.persist_cache_hints && report.steps != steps && !report.steps.is_empty() {
        replay_core::step::save_macro(file, &report.steps)?;
    }

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Stopped => bail!("run stopped"),
        RunOutcome::Failed { step, action, error } => bail!("step {} ({}) failed: {}", step + 1, action, error),
    }
}

fn tui(stub: bool, settings: &mut Settings, settings_path: &Path, file: Option<PathBuf>) -> Result<()> {
    // Fall back to the most recent macro.
    let path = file.or_else(|| settings.recent_files.first().cloned());
    let steps = match &path {
        Some(p) => {
            let steps = load_macro(p).with_context(|| format!("cannot open {}", p.display()))?;
            settings.touch_recent(p);
            if let Err(e) = settings.save(settings_path) {
                warn!("could not save settings: {:#}", e);
            }
            steps
        }
        None => Vec::new(),
    };

    let shared = Arc::new(Mutex::new(Shared { state: RunState::Idle, path, steps, ..Default::default() }));

    let (log_tx, log_rx) = mpsc::channel::<String>();
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();

    logger::set_tui_sender(log_tx);
    info!("replay started, hotkey {}", hotkey::hotkey_label());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = replay_tui::App::new(Arc::clone(&shared), log_rx, cmd_tx, settings.skip_confirm);

    let runner = Runner::new(create_platform(stub), settings);
    let orch_shared = Arc::clone(&shared);
    let persist = settings.persist_cache_hints;
    let orch = thread::spawn(move || runner::orchestrate(orch_shared, runner, cmd_rx, persist));

    let hotkey_flag = Arc::new(AtomicBool::new(false));
    hotkey::start_hotkey_listener(Arc::clone(&hotkey_flag));

    let result = replay_tui::event::run(&mut terminal, &mut app, &hotkey_flag);

    // Dropping the app closes the command channel, which stops the orchestrator.
    drop(app);
    let _ = orch.join();
    logger::clear_tui_sender();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    result
}
