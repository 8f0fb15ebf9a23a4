mod inject;

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// Add the Google Tag Manager snippets to every static HTML page below a directory
#[derive(Parser, Debug)]
#[command(about)]
struct Opt {
    /// The directory to search for HTML files
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// The tag manager container id to insert
    #[arg(long, default_value = inject::DEFAULT_TAG_ID)]
    tag_id: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let opt = Opt::parse();
    anyhow::ensure!(!opt.tag_id.trim().is_empty(), "--tag-id must not be empty");

    let summary = inject::inject_tree(&opt.root, &opt.tag_id)?;
    info!(
        "Done: {} injected, {} skipped, {} without <head>",
        summary.injected, summary.skipped, summary.warned
    );
    Ok(())
}
