use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use image_enlarger::{
    CliArgs, DirectoryBatchJob, FitMode, JobKind, JobQueue, JobStatus, QueueNotice,
    SingleImageJob,
};

const POLL: Duration = Duration::from_millis(100);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    if !handle_enlarge(args) {
        std::process::exit(1);
    }
}

fn handle_enlarge(args: Cli) -> bool {
    let cli_args = CliArgs {
        input_path: args.input,
        output_path: args.output,
        save_to: args.save_to,
        zoom_percent: args.zoom,
        width: args.width,
        height: args.height,
        fit: args.fit,
        clip: args.clip,
        sharpness: args.sharp,
        flatness: args.flat,
        denoise: args.denoise,
        pre_sharpen: args.presharp,
        dither: args.dither,
        fractal_noise: args.fractal,
        quality: args.quality,
    };

    let config = match image_enlarger::build_job_config(cli_args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return false;
        }
    };

    let mut queue = JobQueue::new();
    if config.is_batch() {
        match DirectoryBatchJob::from_config(&config) {
            Ok(batch) => {
                queue.add_job(batch);
            }
            Err(err) => {
                eprintln!("error: {err}");
                return false;
            }
        }
    } else {
        queue.add_job(SingleImageJob::from_config(&config));
    }

    let mut last_percent = None;
    loop {
        for notice in queue.take_notices() {
            print_notice(&notice, &mut last_percent);
        }
        if queue.is_idle() {
            break;
        }
        queue.wait_for_events(POLL);
    }
    for notice in queue.take_notices() {
        print_notice(&notice, &mut last_percent);
    }

    let mut ok = true;
    for job in queue.jobs() {
        print!("{}", job.info_string());
        if job.status() == JobStatus::Failed {
            ok = false;
        }
        if let JobKind::Batch(batch) = job.kind() {
            if batch.errors() > 0 {
                ok = false;
            }
        }
    }
    ok
}

fn print_notice(notice: &QueueNotice, last_percent: &mut Option<u8>) {
    match notice {
        QueueNotice::Status { message, .. } => println!("{message}"),
        QueueNotice::Error { message, .. } => eprintln!("error: {message}"),
        QueueNotice::Progress(percent) => {
            // Only every tenth percent reaches the terminal.
            let step = percent / 10;
            if *last_percent != Some(step) {
                *last_percent = Some(step);
                println!("progress: {}%", step * 10);
            }
        }
        QueueNotice::JobCount { ended, total } => println!("jobs: {ended}/{total}"),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "enlarge",
    bin_name = "enlarge",
    version,
    about = "Enlarge images with edge-adaptive resampling.",
    arg_required_else_help = true
)]
struct Cli {
    /// Image file or directory of images
    #[arg(value_name = "INPUT", help_heading = "INPUT & OUTPUT")]
    input: PathBuf,

    #[arg(
        short,
        long,
        value_name = "OUTPUT",
        help_heading = "INPUT & OUTPUT",
        help = "Output file (or directory for a batch) [default: <name>_e beside the source]"
    )]
    output: Option<PathBuf>,

    #[arg(
        long = "saveto",
        value_name = "DIR",
        help_heading = "INPUT & OUTPUT",
        help = "Directory that receives the default-named results"
    )]
    save_to: Option<PathBuf>,

    #[arg(
        long,
        value_name = "Q",
        default_value_t = 90,
        value_parser = parse_percent,
        help_heading = "INPUT & OUTPUT",
        help = "JPEG quality 0-100"
    )]
    quality: u32,

    #[arg(
        long,
        value_name = "PCT",
        default_value = "200",
        value_parser = parse_positive_f64,
        help_heading = "SIZE",
        help = "Zoom in percent (ignored when --width or --height is given)"
    )]
    zoom: f64,

    #[arg(
        long,
        value_name = "PX",
        help_heading = "SIZE",
        help = "Target width in pixels"
    )]
    width: Option<u32>,

    #[arg(
        long,
        value_name = "PX",
        help_heading = "SIZE",
        help = "Target height in pixels"
    )]
    height: Option<u32>,

    #[arg(
        long,
        value_name = "MODE",
        value_enum,
        default_value_t = FitMode::Fit,
        help_heading = "SIZE",
        help = "How a width+height box is honoured"
    )]
    fit: FitMode,

    #[arg(
        long,
        value_name = "X0,Y0:X1,Y1",
        help_heading = "SIZE",
        help = "Crop region in source pixel coords (before zoom)"
    )]
    clip: Option<String>,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 80,
        value_parser = parse_percent,
        help_heading = "LOOK",
        help = "Edge sharpness 0-100"
    )]
    sharp: u32,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 20,
        value_parser = parse_percent,
        help_heading = "LOOK",
        help = "Flatness of smooth areas 0-100"
    )]
    flat: u32,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 20,
        value_parser = parse_percent,
        help_heading = "LOOK",
        help = "Noise reduction 0-100"
    )]
    denoise: u32,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        value_parser = parse_percent,
        help_heading = "LOOK",
        help = "Source sharpening before enlarging 0-100"
    )]
    presharp: u32,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 10,
        value_parser = parse_percent,
        help_heading = "LOOK",
        help = "Dither strength 0-100"
    )]
    dither: u32,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        value_parser = parse_percent,
        help_heading = "LOOK",
        help = "Fractal texture noise 0-100"
    )]
    fractal: u32,
}

fn parse_positive_f64(arg: &str) -> Result<f64, String> {
    let value: f64 = arg
        .parse()
        .map_err(|err| format!("invalid number: {err}"))?;
    if value <= 0.0 {
        Err("value must be greater than 0".into())
    } else {
        Ok(value)
    }
}

fn parse_percent(arg: &str) -> Result<u32, String> {
    let value: u32 = arg
        .parse()
        .map_err(|err| format!("invalid integer: {err}"))?;
    if value > 100 {
        Err("value must lie in 0..=100".into())
    } else {
        Ok(value)
    }
}
