use std::collections::BTreeMap;

use clap::{Parser, Subcommand};
use formats::{UvImage, UvSampler, WindMeta};
use foundation::time::{TimeKey, now_hours};
use streaming::{HttpLoader, Request, SnapshotLoader, TimeSourceConfig};
use tools::{format_time, keys_for, parse_time, sample_series, time_steps};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect wind prediction data")]
struct Args {
    /// Base URL of the wind prediction service
    #[arg(long, env = "WIND_HOST")]
    host: String,

    /// Prediction scope (region) to query
    #[arg(long, default_value = "global")]
    scope: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print grid metadata for the run covering a time
    Meta {
        /// Hours since epoch, RFC 3339 or YYYY-MM-DDTHH:MM (default: six hours ago)
        #[arg(long)]
        at: Option<String>,
    },

    /// Print u/v, speed and direction at a coordinate over a time range
    Sample {
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Start time (same forms as `meta --at`)
        #[arg(long, default_value = "now")]
        from: String,

        /// End time; defaults to the start time
        #[arg(long)]
        to: Option<String>,

        /// Hours between samples
        #[arg(long, default_value_t = 1.0)]
        step: f64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = TimeSourceConfig::new(args.host, args.scope);
    let loader = HttpLoader::new(&config);

    match args.command {
        Command::Meta { at } => {
            let at = match at {
                Some(at) => parse_time(&at)?,
                None => now_hours() - 6.0,
            };
            let meta = fetch_meta(&loader, at).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            println!("speed_max\t{:.2} m/s", meta.speed_max());
        }
        Command::Sample {
            lon,
            lat,
            from,
            to,
            step,
        } => {
            let from = parse_time(&from)?;
            let to = to.as_deref().map(parse_time).transpose()?.unwrap_or(from);
            let times = time_steps(from, to, step)?;
            let meta = fetch_meta(&loader, from).await?;
            let sampler = UvSampler::new(meta.data_size(), &meta.bounds);

            let images = fetch_snapshots(&loader, &keys_for(&times)).await;
            let series = sample_series(&sampler, &images, [lon, lat], &times);
            if series.len() < times.len() {
                warn!(missing = times.len() - series.len(), "some times have no data");
            }
            println!("time\tu\tv\tspeed\tdirection");
            for s in series {
                println!(
                    "{}\t{:.2}\t{:.2}\t{:.2}\t{:.0}",
                    format_time(s.time),
                    s.uv[0],
                    s.uv[1],
                    s.speed(),
                    s.direction()
                );
            }
        }
    }

    Ok(())
}

async fn fetch_meta(
    loader: &HttpLoader,
    at: f64,
) -> Result<WindMeta, Box<dyn std::error::Error>> {
    let bytes = loader.fetch(Request::Meta(at.floor() as TimeKey)).await?;
    let meta = WindMeta::from_json_slice(&bytes)?;
    info!(date = %meta.date, width = meta.width, height = meta.height, "metadata");
    Ok(meta)
}

/// Fetches every key it can; failures are logged and left out.
async fn fetch_snapshots(loader: &HttpLoader, keys: &[TimeKey]) -> BTreeMap<TimeKey, UvImage> {
    let mut images = BTreeMap::new();
    for &key in keys {
        let decoded = match loader.fetch(Request::Snapshot(key)).await {
            Ok(bytes) => UvImage::decode_png(&bytes).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match decoded {
            Ok(image) => {
                images.insert(key, image);
            }
            Err(e) => warn!(key, error = %e, "snapshot unavailable"),
        }
    }
    images
}
