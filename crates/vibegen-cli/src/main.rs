use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use vibegen_contracts::events::{new_run_id, now_utc_iso, EventLog};
use vibegen_contracts::request::{example_prompt, GenerationRequest, EXAMPLE_PROMPTS};
use vibegen_contracts::summary::{write_summary, GenerationSummary};
use vibegen_engine::gradio::materialize_file_refs;
use vibegen_engine::{
    Diagnostic, EngineConfig, GradioClient, ImageGenerator, Normalizer, RemoteResult,
    ResolvedImage, SystemImageSource,
};

/// Exit status when the run worked but produced no image.
const EXIT_NO_IMAGE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "vibegen",
    version,
    about = "Text-to-image front-end for hosted Gradio models"
)]
struct Cli {
    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a prompt to the remote model and save the image it returns.
    Generate(GenerateArgs),
    /// Pull an image out of a saved remote result (JSON).
    Resolve(ResolveArgs),
    /// List the built-in example prompts.
    Examples,
}

#[derive(Debug, Args)]
struct EndpointArgs {
    #[arg(long)]
    space: Option<String>,
    #[arg(long)]
    api_name: Option<String>,
    #[arg(long)]
    gradio_url: Option<String>,
}

impl EndpointArgs {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(space) = non_empty(self.space.as_deref()) {
            config.space = space;
        }
        if let Some(api_name) = non_empty(self.api_name.as_deref()) {
            config.api_name = api_name;
        }
        if let Some(url) = non_empty(self.gradio_url.as_deref()) {
            config.gradio_url = Some(url.trim_end_matches('/').to_string());
        }
        config
    }
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    guidance_scale: Option<f64>,
    /// Start from example N (see `vibegen examples`); explicit flags win.
    #[arg(long)]
    example: Option<usize>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    summary: Option<PathBuf>,
    #[command(flatten)]
    endpoint: EndpointArgs,
}

#[derive(Debug, Parser)]
struct ResolveArgs {
    /// JSON file holding the remote result, or `-` for stdin.
    #[arg(long)]
    input: String,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    endpoint: EndpointArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vibegen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Resolve(args) => run_resolve(args),
        Command::Examples => {
            print_examples();
            Ok(0)
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let request = build_request(&args)?;
    let config = args.endpoint.apply(EngineConfig::from_env());
    let run_id = new_run_id();
    let started_at = now_utc_iso();

    let mut generator = ImageGenerator::new(
        GradioClient::new(&config),
        SystemImageSource::new(config.download_timeout),
    );
    if let Some(events_path) = &args.events {
        generator = generator.with_events(EventLog::new(events_path, run_id.clone()));
    }

    tracing::info!(endpoint = %config.endpoint_root(), api = %config.api_name, "generating image");
    let generation = generator.generate(&request);
    for warning in &generation.warnings {
        println!("note: {warning}");
    }
    let saved = finish_image(generation.image.as_ref(), &generation.diagnostics, &args.out)?;

    if let Some(summary_path) = &args.summary {
        let summary = GenerationSummary {
            run_id,
            started_at,
            finished_at: now_utc_iso(),
            request: generation.request.clone(),
            outcome: if saved { "image" } else { "no_image" }.to_string(),
            image_path: saved.then(|| args.out.display().to_string()),
            width: generation.image().map(|image| image.width()),
            height: generation.image().map(|image| image.height()),
            fingerprint: generation.image.as_ref().map(ResolvedImage::fingerprint),
            diagnostics: generation
                .diagnostics
                .iter()
                .map(Diagnostic::to_string)
                .collect(),
        };
        write_summary(summary_path, &summary)?;
    }

    Ok(if saved { 0 } else { EXIT_NO_IMAGE })
}

fn run_resolve(args: ResolveArgs) -> Result<i32> {
    let config = args.endpoint.apply(EngineConfig::from_env());
    let raw = read_input(&args.input)?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.input))?;
    let result = RemoteResult::from_value(materialize_file_refs(value, &config.endpoint_root()));

    let normalizer = Normalizer::new(SystemImageSource::new(config.download_timeout));
    let resolution = normalizer.resolve_image(&result);
    let saved = finish_image(resolution.image.as_ref(), &resolution.diagnostics, &args.out)?;
    Ok(if saved { 0 } else { EXIT_NO_IMAGE })
}

fn build_request(args: &GenerateArgs) -> Result<GenerationRequest> {
    let mut request = match args.example {
        Some(number) => match example_prompt(number) {
            Some(example) => example.to_request(),
            None => bail!(
                "--example must be between 1 and {}",
                EXAMPLE_PROMPTS.len()
            ),
        },
        None => match &args.prompt {
            Some(prompt) => GenerationRequest::new(prompt.clone()),
            None => bail!("either --prompt or --example is required"),
        },
    };
    if let Some(prompt) = &args.prompt {
        request.prompt = prompt.clone();
    }
    if let Some(negative_prompt) = &args.negative_prompt {
        request.negative_prompt = negative_prompt.clone();
    }
    if let Some(guidance_scale) = args.guidance_scale {
        request.guidance_scale = guidance_scale;
    }
    Ok(request)
}

/// Saves the image when there is one; otherwise prints why there is not.
/// Returns whether an image was written.
fn finish_image(
    image: Option<&ResolvedImage>,
    diagnostics: &[Diagnostic],
    out: &Path,
) -> Result<bool> {
    let Some(resolved) = image else {
        println!("No image generated.");
        for note in diagnostics {
            println!("  - {note}");
        }
        return Ok(false);
    };
    save_image(resolved, out)?;
    println!(
        "Saved {}x{} image from {} to {}",
        resolved.image.width(),
        resolved.image.height(),
        resolved.origin,
        out.display()
    );
    Ok(true)
}

fn save_image(resolved: &ResolvedImage, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    resolved
        .image
        .save(out)
        .with_context(|| format!("failed to save {}", out.display()))?;
    Ok(())
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut raw = String::new();
        io::stdin()
            .read_to_string(&mut raw)
            .context("failed reading remote result from stdin")?;
        return Ok(raw);
    }
    fs::read_to_string(input).with_context(|| format!("failed reading {input}"))
}

fn print_examples() {
    for (idx, example) in EXAMPLE_PROMPTS.iter().enumerate() {
        println!("{}. {}", idx + 1, example.prompt);
        println!(
            "   negative: {} | guidance: {}",
            example.negative_prompt, example.guidance_scale
        );
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
