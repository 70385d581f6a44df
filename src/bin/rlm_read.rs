use anyhow::{bail, Context};
use rlm_reader::init_logging;
use rlm_reader::models::StructureInfo;
use rlm_reader::read_document;
use rlm_reader::services::structure::format_structure_report;
use rlm_reader::services::text_processor::preview;
use rlm_reader::services::{
    analyze_structure, format_run_report, plan_document, AnalysisBackend, AppConfig, ConfigStore,
    DocumentLoader, ProviderBackend, RunError,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const USAGE: &str = "Usage:
  rlm_read <path|url> \"<task>\" [--provider <name[:model]>] [--chunk-size <n>] [--overlap <n>]
           [--concurrency <n>] [--retries <n>] [--timeout <secs>] [--no-hints] [--no-answer]
           [--max-tokens <n>] [--out <json_path>]
  rlm_read <path|url> --structure

Notes:
  - Supported inputs: .pdf, .docx, anything else is read as text.
  - Settings default to the config file; flags override them for this run.
  - Ctrl-C cancels the run; no partial result is printed.";

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_number<T: std::str::FromStr>(args: &[String], key: &str) -> anyhow::Result<Option<T>> {
    match parse_arg_value(args, key) {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} expects a number, got {:?}", key, v)),
        None => Ok(None),
    }
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn load_app_config() -> AppConfig {
    let Some(dir) = ConfigStore::default_config_dir() else {
        return AppConfig::default();
    };
    let store = ConfigStore::new(dir);
    store.load().unwrap_or_else(|e| {
        warn!("Ignoring unreadable config {}: {}", store.config_file().display(), e);
        AppConfig::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || has_flag(&args, "--help") || has_flag(&args, "-h") {
        eprintln!("{}", USAGE);
        return Ok(());
    }

    let _log_file = init_logging();

    let source = args[1].clone();
    let structure_only = has_flag(&args, "--structure");
    let task = args.get(2).filter(|a| !a.starts_with("--")).cloned();
    if task.is_none() && !structure_only {
        bail!("missing task description\n\n{}", USAGE);
    }

    let app_config = load_app_config();
    let mut config = app_config.run_config();
    if let Some(n) = parse_number(&args, "--chunk-size")? {
        config.chunk_size = n;
    }
    if let Some(n) = parse_number(&args, "--overlap")? {
        config.overlap_size = n;
    }
    if let Some(n) = parse_number(&args, "--concurrency")? {
        config.concurrency = n;
    }
    if let Some(n) = parse_number(&args, "--retries")? {
        config.max_retries_per_chunk = n;
    }
    if let Some(secs) = parse_number::<u64>(&args, "--timeout")? {
        config.per_chunk_timeout = Duration::from_secs(secs);
    }
    if has_flag(&args, "--no-hints") {
        config.structure_hints_enabled = false;
    }
    if has_flag(&args, "--no-answer") {
        config.compose_answer = false;
    }
    config.validate().context("invalid run settings")?;
    let out_path = parse_arg_value(&args, "--out");

    let loader = DocumentLoader::new();
    let extracted = if is_url(&source) {
        loader.extract_from_url(&source).await?
    } else {
        loader.extract_from_file(Path::new(&source))?
    };

    if structure_only {
        let info = analyze_structure(&extracted.text);
        let title = Path::new(&source)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source.clone());
        print!("{}", format_structure_report(&title, &info, &preview(&extracted.text, 1000)));
        return Ok(());
    }
    let task = task.unwrap_or_default();

    let provider = parse_arg_value(&args, "--provider").or_else(|| app_config.default_provider.clone());
    let mut backend = ProviderBackend::from_spec(provider.as_deref(), app_config.proxy.as_deref())
        .context("no usable analysis provider (set an API key or pass --provider)")?;
    if let Some(max_tokens) = parse_number::<u32>(&args, "--max-tokens")? {
        backend = backend.with_max_tokens(max_tokens);
    }
    let backend_label = backend.describe();

    let structure: StructureInfo = analyze_structure(&extracted.text);
    let metadata = extracted.metadata.clone();
    let document = extracted.into_document();
    let planned = plan_document(
        &document,
        config.chunk_size,
        config.overlap_size,
        config.structure_hints_enabled,
    )?;

    eprintln!("Source: {}", metadata.source);
    eprintln!(
        "Extracted: {} chars, {} pages, {} section hints",
        metadata.char_count,
        metadata.page_count.unwrap_or(structure.total_pages),
        metadata.detected_sections.as_ref().map_or(0, Vec::len)
    );
    eprintln!("Backend: {}", backend_label);
    eprintln!(
        "Chunks: {} (size={} overlap={} concurrency={})",
        planned.len(),
        config.chunk_size,
        config.overlap_size,
        config.concurrency
    );
    eprintln!();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let result = match read_document(Arc::new(backend), config, &document, &task, &cancel).await {
        Ok(result) => result,
        Err(RunError::Cancelled(e)) => {
            eprintln!("Cancelled: {}", e);
            std::process::exit(130);
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}", format_run_report(&result, &task));

    if let Some(out_path) = out_path {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Output<'a> {
            source: &'a str,
            task: &'a str,
            backend: &'a str,
            extraction: &'a rlm_reader::models::ExtractionMetadata,
            structure: &'a StructureInfo,
            result: &'a rlm_reader::models::SynthesisResult,
        }

        let out = Output {
            source: &source,
            task: &task,
            backend: &backend_label,
            extraction: &metadata,
            structure: &structure,
            result: &result,
        };

        let json = serde_json::to_string_pretty(&out)?;
        std::fs::write(&out_path, json).with_context(|| format!("write {} failed", out_path))?;
        eprintln!("Wrote JSON: {}", out_path);
    }

    Ok(())
}
