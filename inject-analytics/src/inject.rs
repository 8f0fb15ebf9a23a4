use anyhow::Context;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

pub const DEFAULT_TAG_ID: &str = "GTM-P98Q99WC";

/// Directory names which never contain deployable pages.
const EXCLUDED_DIRS: [&str; 6] = [".git", "node_modules", ".vercel", ".next", "dist", "build"];

#[derive(Debug, PartialEq)]
pub enum Injection {
    Injected(String),
    AlreadyPresent,
    MissingHead,
}

#[derive(Debug, Default, PartialEq)]
pub struct Summary {
    pub injected: usize,
    pub skipped: usize,
    pub warned: usize,
}

/// Inserts the tag manager snippets right after the opening `<head>` and `<body>` tags.
///
/// Pages which already mention `tag_id` come back as [`Injection::AlreadyPresent`], so running
/// this twice is harmless. A page without a `<body>` tag only gets the head snippet.
pub fn inject(html: &str, tag_id: &str) -> Injection {
    if html.contains(tag_id) {
        return Injection::AlreadyPresent;
    }
    let Some(head) = head_tag().find(html) else {
        return Injection::MissingHead;
    };
    let mut insertions = vec![(head.end(), head_snippet(tag_id))];
    if let Some(body) = body_tag().find(html) {
        insertions.push((body.end(), body_snippet(tag_id)));
    }
    insertions.sort_by_key(|(position, _)| *position);

    let mut output = String::with_capacity(
        html.len() + insertions.iter().map(|(_, s)| s.len() + 2).sum::<usize>(),
    );
    let mut copied = 0;
    for (position, snippet) in insertions {
        output.push_str(&html[copied..position]);
        output.push('\n');
        output.push_str(&snippet);
        output.push('\n');
        copied = position;
    }
    output.push_str(&html[copied..]);
    Injection::Injected(output)
}

/// All `*.html` files below `root`, in a stable order.
pub fn find_html_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded_dir(entry))
    {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if entry.file_type().is_file() && has_html_extension(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Rewrites every page below `root` which still lacks the tag.
pub fn inject_tree(root: &Path, tag_id: &str) -> anyhow::Result<Summary> {
    let files = find_html_files(root)?;
    if files.is_empty() {
        info!("No .html files found under {}", root.display());
        return Ok(Summary::default());
    }
    info!(
        "Found {} HTML files, injecting tag {tag_id}",
        files.len()
    );

    let mut summary = Summary::default();
    for file in files {
        let html =
            fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        match inject(&html, tag_id) {
            Injection::Injected(output) => {
                fs::write(&file, output).with_context(|| format!("writing {}", file.display()))?;
                info!("Injected: {}", file.display());
                summary.injected += 1;
            }
            Injection::AlreadyPresent => {
                info!("Skipped, tag already present: {}", file.display());
                summary.skipped += 1;
            }
            Injection::MissingHead => {
                warn!("No <head> tag in {}, skipping", file.display());
                summary.warned += 1;
            }
        }
    }
    Ok(summary)
}

fn is_excluded_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

fn has_html_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("html"))
}

fn head_tag() -> &'static Regex {
    static HEAD_TAG: OnceLock<Regex> = OnceLock::new();
    HEAD_TAG.get_or_init(|| Regex::new(r"(?i)<head(\s[^>]*)?>").expect("valid regex"))
}

fn body_tag() -> &'static Regex {
    static BODY_TAG: OnceLock<Regex> = OnceLock::new();
    BODY_TAG.get_or_init(|| Regex::new(r"(?i)<body(\s[^>]*)?>").expect("valid regex"))
}

fn head_snippet(tag_id: &str) -> String {
    format!(
        r#"<!-- Google Tag Manager -->
<script>(function(w,d,s,l,i){{w[l]=w[l]||[];w[l].push({{'gtm.start':
new Date().getTime(),event:'gtm.js'}});var f=d.getElementsByTagName(s)[0],
j=d.createElement(s),dl=l!='dataLayer'?'&l='+l:'';j.async=true;j.src=
'https://www.googletagmanager.com/gtm.js?id='+i+dl;f.parentNode.insertBefore(j,f);
}})(window,document,'script','dataLayer','{tag_id}');</script>
<!-- End Google Tag Manager -->"#
    )
}

fn body_snippet(tag_id: &str) -> String {
    format!(
        r#"<!-- Google Tag Manager (noscript) -->
<noscript><iframe src="https://www.googletagmanager.com/ns.html?id={tag_id}"
height="0" width="0" style="display:none;visibility:hidden"></iframe></noscript>
<!-- End Google Tag Manager (noscript) -->"#
    )
}
