use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vidspec::recorder::{format_elapsed, DEFAULT_DEVICE, DEFAULT_INPUT_FORMAT};
use vidspec::{
    process_video, AnalysisResult, Analyzer, CancellationToken, CaptureDevice, FfmpegBackend,
    FrameSampler, Recorder, Settings, VideoSource,
};

#[derive(Parser)]
#[command(name = "vidspec", version)]
#[command(about = "Turn a video of an app idea into a development-ready specification", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,

    /// Write the generated Markdown to this file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Sample frames from a video file and analyze them
    File { input_file: PathBuf },
    /// Analyze a video by URL, using web search to find out what it shows
    Url { url: String },
    /// Revise a generated specification according to feedback
    Refine {
        #[arg(short, long)]
        prompt_file: PathBuf,
        #[arg(short, long)]
        feedback: String,
    },
    /// Record from a camera, then analyze the recording
    Record {
        #[arg(long, default_value = DEFAULT_DEVICE)]
        device: String,
        #[arg(long, default_value = DEFAULT_INPUT_FORMAT)]
        format: String,
        /// Stop automatically after this many seconds
        #[arg(short, long, default_value_t = 30)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let analyzer = Analyzer::new(&cli.settings.analyzer_config())?;

    let result = match cli.command {
        Command::File { input_file } => {
            if !fs::exists(&input_file)? {
                anyhow::bail!("{} does not exist", input_file.display());
            }
            let sampler = FrameSampler::with_ffmpeg(cli.settings.sampler_options()?)?;
            sample_and_analyze(&sampler, &analyzer, &VideoSource::from_path(input_file)).await?
        }
        Command::Url { url } => analyzer.analyze_video_url(&url).await?,
        Command::Refine {
            prompt_file,
            feedback,
        } => {
            let original = fs::read_to_string(&prompt_file)
                .with_context(|| format!("Failed to read {}", prompt_file.display()))?;
            analyzer.refine(&original, &feedback).await?
        }
        Command::Record {
            device,
            format,
            seconds,
        } => {
            let sampler = FrameSampler::with_ffmpeg(cli.settings.sampler_options()?)?;
            let recording = record(
                CaptureDevice {
                    url: device,
                    format,
                },
                Duration::from_secs(seconds),
            )
            .await?;
            sample_and_analyze(&sampler, &analyzer, &recording).await?
        }
    };

    let document = render(&result);
    match cli.output {
        Some(path) => {
            fs::write(&path, document)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "specification written");
        }
        None => print!("{document}"),
    }

    Ok(())
}

/// Ctrl-C cancels sampling or the pending analysis request; the sampler
/// releases the video before returning. A second Ctrl-C exits immediately.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        handle.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    token
}

async fn sample_and_analyze(
    sampler: &FrameSampler<FfmpegBackend>,
    analyzer: &Analyzer,
    source: &VideoSource,
) -> anyhow::Result<AnalysisResult> {
    let cancel = cancel_on_ctrl_c();
    let status = ProgressBar::new_spinner();
    status.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    status.enable_steady_tick(Duration::from_millis(120));

    let result = process_video(
        sampler,
        analyzer,
        source,
        |stage| status.set_message(stage.to_string()),
        &cancel,
    )
    .await;
    status.finish_and_clear();
    Ok(result?)
}

async fn record(device: CaptureDevice, limit: Duration) -> anyhow::Result<VideoSource> {
    let mut recorder = Recorder::new(device);
    tokio::task::block_in_place(|| recorder.start())?;

    let indicator = ProgressBar::new_spinner();
    indicator.set_style(ProgressStyle::default_spinner().template("{spinner:.red} {msg}")?);
    let deadline = tokio::time::sleep(limit);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupted);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut interrupted => break,
            _ = ticker.tick() => {
                let elapsed = recorder.elapsed().unwrap_or_default();
                indicator.set_message(format!("REC {} (Ctrl-C to stop)", format_elapsed(elapsed)));
                indicator.tick();
            }
        }
    }
    indicator.finish_and_clear();

    Ok(tokio::task::block_in_place(|| recorder.stop())?)
}

fn render(result: &AnalysisResult) -> String {
    let mut document = result.prompt.trim_end().to_owned();
    if !result.sources.is_empty() {
        document.push_str("\n\n---\n\n**Sources**\n\n");
        for source in &result.sources {
            let title = source.title.as_deref().unwrap_or(&source.uri);
            let _ = writeln!(document, "- [{}]({})", title, source.uri);
        }
    }
    if !document.ends_with('\n') {
        document.push('\n');
    }
    document
}
