use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use pdfsift_core::{
    CoordinateTransform, DisplayRect, Match, PageRect, SearchError, SearchOptions, SessionState,
};
use pdfsift_pdfium::{PdfiumTextDocument, PdfiumTextFactory};
use pdfsift_search::{CoordinatorConfig, SearchCoordinator};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "pdfsift",
    version,
    about = "in-document text search for PDF files"
)]
struct Args {
    /// PDF file to search
    file: PathBuf,

    /// Query text to look for
    query: String,

    /// Match case exactly
    #[arg(long)]
    case_sensitive: bool,

    /// Match whole words only
    #[arg(long)]
    whole_word: bool,

    /// Emit the completed session as JSON instead of tab-separated text
    #[arg(long)]
    json: bool,

    /// Also project highlight rectangles to display space at this zoom
    /// scale (text output)
    #[arg(long)]
    scale: Option<f64>,

    /// Device DPI used with --scale
    #[arg(long, default_value_t = 96.0)]
    dpi: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.query.is_empty() {
        return Err(SearchError::EmptyQuery.into());
    }
    if !args.file.exists() {
        bail!("input file {:?} does not exist", args.file);
    }

    let project_dirs = ProjectDirs::from("net", "pdfsift", "pdfsift")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&project_dirs)?;

    let factory = PdfiumTextFactory::new()?;
    let document = factory
        .open_document(&args.file)
        .with_context(|| format!("failed to open {:?}", args.file))?;

    let coordinator = SearchCoordinator::new(Arc::clone(&document) as _, config);
    let mut sessions = coordinator.watch_sessions();

    coordinator.set_options(SearchOptions {
        case_sensitive: args.case_sensitive,
        whole_word: args.whole_word,
    });
    coordinator.set_query(args.query.clone());

    let session = loop {
        sessions.changed().await?;
        let session = sessions.borrow_and_update().clone();
        if session.is_terminal() {
            break session;
        }
    };

    if session.state == SessionState::Failed {
        bail!(
            "search failed: {}",
            session.error.as_deref().unwrap_or("unknown error")
        );
    }

    if !session.skipped_pages.is_empty() {
        warn!(pages = ?session.skipped_pages, "some pages could not be extracted");
        eprintln!(
            "warning: skipped {} unreadable page(s)",
            session.skipped_pages.len()
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(session.as_ref())?);
    } else {
        print_text(&session.matches, &document, args.scale, args.dpi)?;
    }

    let summary = coordinator.summary();
    match summary.current_index {
        Some(index) => eprintln!(
            "{} match(es) for {:?} — match {}/{} selected",
            summary.total,
            summary.query,
            index + 1,
            summary.total
        ),
        None => eprintln!("no matches for {:?}", summary.query),
    }

    Ok(())
}

fn print_text(
    matches: &[Match],
    document: &PdfiumTextDocument,
    scale: Option<f64>,
    dpi: f64,
) -> Result<()> {
    match scale {
        None => {
            println!("page\ttext\tleft\tbottom\tright\ttop");
            for m in matches {
                for rect in &m.rects {
                    println!("{}", doc_row(m, rect));
                }
            }
        }
        Some(scale) => {
            println!("page\ttext\tx\ty\twidth\theight");
            for m in matches {
                let (_, page_height) = document
                    .page_size(m.page_number)
                    .with_context(|| format!("failed to measure page {}", m.page_number))?;
                let transform = CoordinateTransform::for_device_dpi(page_height, scale, dpi);
                for rect in &m.rects {
                    println!("{}", display_row(m, &transform.to_display(*rect)));
                }
            }
        }
    }
    Ok(())
}

fn doc_row(m: &Match, rect: &PageRect) -> String {
    format!(
        "{}\t{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}",
        m.page_number + 1,
        m.text,
        rect.left,
        rect.bottom,
        rect.right,
        rect.top
    )
}

fn display_row(m: &Match, rect: &DisplayRect) -> String {
    format!(
        "{}\t{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}",
        m.page_number + 1,
        m.text,
        rect.x,
        rect.y,
        rect.width,
        rect.height
    )
}

fn load_config(project_dirs: &ProjectDirs) -> Result<CoordinatorConfig> {
    load_config_from(&project_dirs.config_dir().join("pdfsift.toml"))
}

fn load_config_from(path: &Path) -> Result<CoordinatorConfig> {
    if !path.exists() {
        return Ok(CoordinatorConfig::default());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read config file {:?}", path))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file {:?}", path))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pdfsift.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // Keep stdout clean for match output; diagnostics go to stderr.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_match() -> Match {
        Match {
            page_number: 0,
            start_index: 4,
            length: 3,
            text: "pdf".into(),
            rects: vec![PageRect::new(96.0, 700.0, 114.0, 710.0)],
        }
    }

    #[test]
    fn doc_row_uses_one_based_pages_and_doc_coordinates() {
        let m = sample_match();
        assert_eq!(doc_row(&m, &m.rects[0]), "1\tpdf\t96.00\t700.00\t114.00\t710.00");
    }

    #[test]
    fn display_row_projects_through_the_transform() {
        let m = sample_match();
        let transform = CoordinateTransform::for_device_dpi(792.0, 1.0, 72.0);
        let display = transform.to_display(m.rects[0]);
        assert_eq!(display_row(&m, &display), "1\tpdf\t96.00\t82.00\t18.00\t10.00");
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("pdfsift.toml")).unwrap();
        assert_eq!(config.debounce_ms, CoordinatorConfig::default().debounce_ms);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdfsift.toml");
        fs::write(&path, "debounce_ms = 50\nsoft_timeout_ms = 750\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.soft_timeout_ms, 750);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdfsift.toml");
        fs::write(&path, "debounce_ms = \"soon\"\n").unwrap();

        assert!(load_config_from(&path).is_err());
    }
}
