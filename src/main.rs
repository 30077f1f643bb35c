//! # Strata - A Rich-Document Editing Engine
//!
//! Mounts an editor on the in-memory render target, runs a short scripted
//! session and prints the rendered markup.
//!
//! ## Quick Start
//!
//! ```bash
//! # Render three paragraphs
//! cargo run
//!
//! # Right-to-left text, with debug logging
//! cargo run -- --rtl -vv
//!
//! # Use a specific config file
//! cargo run -- --config strata.toml --paragraphs 10
//! ```

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strata_core::{Config, Editor, EditorEvent, EventHandler, MemoryTarget, NodeKey, UpdateOptions};

/// Strata - renders a scripted editing session
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of paragraphs to render
    #[arg(short, long, default_value_t = 3)]
    paragraphs: usize,

    /// Use right-to-left sample text
    #[arg(long)]
    rtl: bool,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// What the session rendered.
#[derive(Debug)]
struct Report {
    mount_html: String,
    mount_writes: usize,
    edit_html: String,
    edit_writes: usize,
    text: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    tracing::info!("Starting Strata v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config(args.config.as_deref())?;

    let mut editor = Editor::with_config(config);
    let mut handler = EventHandler::new(editor.subscribe());
    let commits = tokio::spawn(async move {
        let mut commits = 0usize;
        while let Some(event) = handler.next().await {
            if let EditorEvent::Committed { tags, .. } = &event {
                tracing::debug!("Commit observed (tags: {:?})", tags);
                commits += 1;
            }
        }
        commits
    });

    let report = run_session(&mut editor, args.paragraphs, args.rtl)?;
    // closes the event bus so the counting task finishes
    drop(editor);
    let commits = commits.await?;

    println!("== initial mount ({} render writes)", report.mount_writes);
    println!("{}", report.mount_html);
    println!("== incremental edit ({} render writes)", report.edit_writes);
    println!("{}", report.edit_html);
    println!("== {} commits, {} characters of text", commits, report.text.chars().count());

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true),
        )
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::load_from(path)?),
        None => Ok(Config::load()),
    }
}

/// Mounts `paragraphs` paragraphs, then appends to the middle one.
fn run_session(editor: &mut Editor, paragraphs: usize, rtl: bool) -> anyhow::Result<Report> {
    let dom = MemoryTarget::new();
    let root = dom.create_container("div");
    editor.attach(Box::new(dom.clone()), root)?;
    dom.clear_ops();

    let sample = if rtl { "שלום עולם" } else { "Hello world" };
    let mut texts: Vec<NodeKey> = Vec::with_capacity(paragraphs);
    editor.update(
        |txn| {
            for i in 1..=paragraphs {
                let para = txn.create_paragraph()?;
                txn.append(NodeKey::ROOT, para)?;
                let text = txn.create_text(format!("{sample} {i}"))?;
                txn.append(para, text)?;
                texts.push(text);
            }
            if let Some(last) = texts.last() {
                let len = txn.text_content(*last)?.chars().count();
                txn.select_text(*last, len, len)?;
            }
            Ok(())
        },
        UpdateOptions::default().discrete().with_tag("cli-mount"),
    )?;
    let mount_writes = dom.tree_write_count();
    let mount_html = dom.inner_html(root);
    dom.clear_ops();

    if let Some(&middle) = texts.get(paragraphs / 2) {
        editor.update(
            |txn| {
                let text = txn.text_content(middle)?;
                txn.set_text(middle, format!("{text}!"))?;
                Ok(())
            },
            UpdateOptions::default().with_tag("cli-edit"),
        )?;
        editor.flush()?;
    }

    Ok(Report {
        mount_html,
        mount_writes,
        edit_html: dom.inner_html(root),
        edit_writes: dom.tree_write_count(),
        text: editor.text_content().to_string(),
    })
}
