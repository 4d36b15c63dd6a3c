use chat_export::config::{Config, ExportConfig};
use chat_export::download::DownloaderConfig;
use chat_export::fetch::CHUNK_SIZE;
use chat_export::media::MediaKind;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "chat-export",
    version,
    about = "Chat export media downloader",
    after_help = "Examples:\n  chat-export doctor\n  chat-export doctor --json --no-gifs --size-limit 64\n  chat-export doctor --chat-id me --chat-id 12345 --from-date 01.01.2024 --to-date \"2w ago\""
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Output JSON instead of text")]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print the resolved export configuration")]
    Doctor(ExportArgs),
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long = "chat-id", short = 'c', help = "Chat id or username; repeatable")]
    chat_ids: Vec<String>,

    #[arg(long, short = 'o', help = "Output directory")]
    output: Option<PathBuf>,

    #[arg(long, short = 'l', help = "Media size limit in megabytes")]
    size_limit: Option<u64>,

    #[arg(long, short = 'f', help = "Oldest message date (dd.mm.yyyy, YYYY-MM-DD, \"3d ago\")")]
    from_date: Option<String>,

    #[arg(long, short = 't', help = "Newest message date")]
    to_date: Option<String>,

    #[arg(long, short = 'd', help = "Concurrent media downloads")]
    max_concurrent_downloads: Option<usize>,

    #[command(flatten)]
    media: MediaArgs,
}

#[derive(Args)]
struct MediaArgs {
    #[arg(long = "no-photos", action = ArgAction::SetFalse, help = "Skip photos")]
    photos: bool,
    #[arg(long = "no-videos", action = ArgAction::SetFalse, help = "Skip videos")]
    videos: bool,
    #[arg(long = "no-voice", action = ArgAction::SetFalse, help = "Skip voice messages")]
    voice: bool,
    #[arg(long = "no-video-notes", action = ArgAction::SetFalse, help = "Skip video messages")]
    video_notes: bool,
    #[arg(long = "no-stickers", action = ArgAction::SetFalse, help = "Skip stickers")]
    stickers: bool,
    #[arg(long = "no-gifs", action = ArgAction::SetFalse, help = "Skip gifs")]
    gifs: bool,
    #[arg(long = "no-documents", action = ArgAction::SetFalse, help = "Skip documents")]
    documents: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DoctorOutput {
    config: Config,
    export: ExportConfig,
    excluded_media: Vec<MediaKind>,
    size_limit_bytes: u64,
    downloader: DownloaderSummary,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloaderSummary {
    chunk_size: u64,
    max_concurrent_downloads: usize,
    max_units: usize,
    renew_batch_limit: usize,
    renew_debounce_ms: u128,
    wakeup_timeout_ms: u128,
}

impl From<&DownloaderConfig> for DownloaderSummary {
    fn from(config: &DownloaderConfig) -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_concurrent_downloads: config.max_concurrent_downloads,
            max_units: config.max_units(),
            renew_batch_limit: config.renew_batch_limit,
            renew_debounce_ms: config.renew_debounce.as_millis(),
            wakeup_timeout_ms: config.wakeup_timeout.as_millis(),
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(error) = run().await {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Command::Doctor(args) => {
            let export = export_config(&config, args)?;
            handle_doctor(config, export, cli.json)?;
        }
    }
    Ok(())
}

fn export_config(config: &Config, args: ExportArgs) -> Result<ExportConfig, Box<dyn std::error::Error>> {
    let mut export = ExportConfig::new(config);
    if !args.chat_ids.is_empty() {
        export.chat_ids = args.chat_ids;
    }
    if let Some(output) = args.output {
        export.output_dir = output;
    }
    if let Some(limit) = args.size_limit {
        export.size_limit_mb = limit;
    }
    if let Some(max) = args.max_concurrent_downloads {
        if max == 0 {
            return Err("--max-concurrent-downloads must be at least 1".into());
        }
        export.max_concurrent_downloads = max;
    }
    export.media.photos = args.media.photos;
    export.media.videos = args.media.videos;
    export.media.voice = args.media.voice;
    export.media.video_notes = args.media.video_notes;
    export.media.stickers = args.media.stickers;
    export.media.gifs = args.media.gifs;
    export.media.files = args.media.documents;

    let now = chrono::Utc::now();
    Ok(export.with_dates(args.from_date.as_deref(), args.to_date.as_deref(), now)?)
}

fn handle_doctor(
    config: Config,
    export: ExportConfig,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let downloader = export.downloader();
    let output = DoctorOutput {
        excluded_media: export.excluded_media().into_iter().collect(),
        size_limit_bytes: export.size_limit_bytes(),
        downloader: DownloaderSummary::from(&downloader),
        config,
        export,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Output dir:        {}", output.export.output_dir.display());
    println!("Chats:             {}", output.export.chat_ids.join(", "));
    println!(
        "Date range:        {} .. {}",
        output.export.from_date.format("%Y-%m-%d %H:%M:%S"),
        output.export.to_date.format("%Y-%m-%d %H:%M:%S")
    );
    println!("Size limit:        {} MB", output.export.size_limit_mb);
    let excluded: Vec<&str> = output
        .excluded_media
        .iter()
        .map(|kind| kind.as_str())
        .collect();
    println!(
        "Excluded media:    {}",
        if excluded.is_empty() {
            "none".to_string()
        } else {
            excluded.join(", ")
        }
    );
    println!(
        "Downloads:         {} concurrent, {} units, {} byte chunks",
        output.downloader.max_concurrent_downloads,
        output.downloader.max_units,
        output.downloader.chunk_size
    );
    println!(
        "Renewal:           batches of {}, {} ms debounce",
        output.downloader.renew_batch_limit, output.downloader.renew_debounce_ms
    );
    Ok(())
}
