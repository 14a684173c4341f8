use deckflow_core::device::{FakeDeck, FakeDeckLayout};
use deckflow_core::shared::{self, Paths};
use deckflow_core::store::get_settings;
use deckflow_core::ui::UiEvent;
use deckflow_core::{DeckContext, DeckManager};

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use log::LevelFilter;

struct TeeLogger {
    stderr: env_logger::Logger,
    file: Option<std::sync::Mutex<std::fs::File>>,
}

impl log::Log for TeeLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.stderr.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.stderr.matches(record) {
            return;
        }
        self.stderr.log(record);
        let Some(file) = self.file.as_ref() else {
            return;
        };
        let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
        let _ = writeln!(
            file,
            "{:?} {:<5} {} - {}",
            std::time::SystemTime::now(),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        self.stderr.flush();
        if let Some(file) = self.file.as_ref() {
            let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
            let _ = file.flush();
        }
    }
}

/// stderr honours `RUST_LOG` (default `info`); a copy goes to `<data_dir>/logs/deckflow.log`.
fn init_logging(paths: &Paths) {
    let stderr =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();

    let file = (|| {
        let dir = paths.log_dir();
        std::fs::create_dir_all(&dir).ok()?;
        let f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("deckflow.log"))
            .ok()?;
        Some(std::sync::Mutex::new(f))
    })();

    let _ = log::set_boxed_logger(Box::new(TeeLogger { stderr, file }));
    log::set_max_level(LevelFilter::Trace);
}

#[derive(Default)]
struct Args {
    /// `(serial, page)`; a `None` serial applies to every deck.
    pages: Vec<(Option<String>, String)>,
    root: Option<PathBuf>,
    fake_decks: usize,
}

const USAGE: &str = "usage: deckflow [--page [SERIAL=]PAGE]... [--root DIR] [--fake-decks N]";

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .ok_or_else(|| anyhow::anyhow!("{name} needs a value\n{USAGE}"))
        };
        match arg.as_str() {
            "--page" => {
                let page = value("--page")?;
                args.pages.push(match page.split_once('=') {
                    Some((serial, page)) => (Some(serial.to_owned()), page.to_owned()),
                    None => (None, page),
                });
            }
            "--root" => args.root = Some(PathBuf::from(value("--root")?)),
            "--fake-decks" => args.fake_decks = value("--fake-decks")?.parse()?,
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument {other}\n{USAGE}"),
        }
    }
    Ok(args)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let paths = match &args.root {
        Some(root) => Paths::rooted(root),
        None => shared::discover_paths()?,
    };
    init_logging(&paths);
    log::info!(
        "deckflow starting (config={}, data={}, cache={})",
        paths.config_dir.display(),
        paths.data_dir.display(),
        paths.cache_dir.display()
    );

    let settings = get_settings(&paths.config_dir)?.value;
    let context = DeckContext::new(settings, paths);
    let mut ui_events = context.ui.subscribe();
    let manager = DeckManager::new(context);

    if let Err(error) = manager.scan() {
        log::warn!("Failed to enumerate hardware decks: {error:#}");
    }
    for n in 0..args.fake_decks {
        let layout = if n % 2 == 0 {
            FakeDeckLayout::default()
        } else {
            FakeDeckLayout::plus()
        };
        manager.add_deck(Arc::new(FakeDeck::new(&format!("FAKE{n}"), layout)));
    }
    if manager.serials().is_empty() {
        log::warn!("No decks connected");
    }

    for (serial, page) in &args.pages {
        let path = manager.resolve_page_path(page);
        let targets = match serial {
            Some(serial) => vec![serial.clone()],
            None => manager.serials(),
        };
        for serial in targets {
            if let Err(error) = manager.load_page_file(&serial, &path) {
                log::error!("Failed to load page {} on {serial}: {error:#}", path.display());
            }
        }
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    log::error!("Failed to listen for ctrl-c: {error}");
                }
                break;
            }
            event = ui_events.recv() => match event {
                Ok(UiEvent::DeckRemoved { serial }) => log::warn!("Deck {serial} was removed"),
                Ok(UiEvent::ActionUnavailable { serial, identifier, action }) => {
                    log::warn!("Action {action} on {identifier} of {serial} is unavailable")
                }
                Ok(event) => log::debug!("{event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Missed {skipped} UI events")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    log::info!("Shutting down");
    let shutdown = manager.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown()).await?;
    log::logger().flush();
    Ok(())
}
