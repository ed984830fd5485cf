use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pacsman::config::Config;
use pacsman::PacsClient;
use serde::Serialize;
use tracing::error;

/// Query and retrieve studies from a DICOM archive
#[derive(Parser, Debug)]
#[command(name = "pacsman")]
#[command(version, about = "Query/retrieve client for DICOM archives")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "pacsman.toml")]
    config: PathBuf,

    /// Serve requests from a directory of DICOM files instead of the archive
    #[arg(long, value_name = "DIR")]
    offline: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// C-ECHO the archive
    Verify,
    /// Patients whose id or name contains QUERY
    SearchPatients {
        query: String,
        /// Extra attribute keywords to return
        #[arg(short, long)]
        extra: Vec<String>,
    },
    /// Series matching KEYWORD=VALUE filters
    SearchSeries {
        #[arg(value_parser = parse_filter)]
        filters: Vec<(String, String)>,
        #[arg(short, long)]
        extra: Vec<String>,
    },
    /// Studies of a patient
    Studies {
        patient_id: String,
        #[arg(short, long)]
        extra: Vec<String>,
    },
    /// Series of a study
    Series {
        study_id: String,
        /// Keep only these modalities
        #[arg(short, long)]
        modality: Vec<String>,
        #[arg(short, long)]
        extra: Vec<String>,
    },
    /// Images of a series
    Images {
        series_id: String,
        #[arg(short = 'n', long)]
        max_count: Option<usize>,
        #[arg(short, long)]
        extra: Vec<String>,
    },
    /// Retrieve a whole series
    FetchSeries { series_id: String },
    /// Retrieve one image
    FetchImage { series_id: String, image_id: String },
    /// Render a PNG thumbnail of a series
    Thumbnail { series_id: String },
    /// Store local DICOM files on the archive
    Send {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn parse_filter(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEYWORD=VALUE, got '{}'", s))
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        Config::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(client: &dyn PacsClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Verify => {
            let ok = client.verify().await?;
            print_json(&ok)?;
            if !ok {
                bail!("archive did not answer C-ECHO with success");
            }
        }
        Command::SearchPatients { query, extra } => {
            print_json(&client.search_patients(&query, &extra).await?)?
        }
        Command::SearchSeries { filters, extra } => {
            let template: BTreeMap<String, String> = filters.into_iter().collect();
            print_json(&client.search_series(&template, &extra).await?)?
        }
        Command::Studies { patient_id, extra } => {
            print_json(&client.studies_for_patient(&patient_id, &extra).await?)?
        }
        Command::Series {
            study_id,
            modality,
            extra,
        } => {
            let filter = (!modality.is_empty()).then_some(modality.as_slice());
            print_json(&client.series_for_study(&study_id, filter, &extra).await?)?
        }
        Command::Images {
            series_id,
            max_count,
            extra,
        } => print_json(
            &client
                .images_for_series(&series_id, &extra, max_count)
                .await?,
        )?,
        Command::FetchSeries { series_id } => {
            print_json(&client.fetch_images_as_files(&series_id).await?)?
        }
        Command::FetchImage {
            series_id,
            image_id,
        } => print_json(&client.fetch_image_as_file(&series_id, &image_id).await?)?,
        Command::Thumbnail { series_id } => {
            print_json(&client.fetch_thumbnail(&series_id).await?)?
        }
        Command::Send { files } => print_json(&client.send_files(&files).await?)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.log_level = level;
    }
    pacsman::logging::init(&config.logging)?;

    let client = pacsman::build_client(&config, cli.offline)?;
    if let Err(e) = run(client.as_ref(), cli.command).await {
        error!("❌ {:#}", e);
        return Err(e);
    }
    Ok(())
}
