//! Taxi Ingest - NYC taxi trip loading tool

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use taxi_common::logging::{init_logging, LogConfig, LogLevel};
use taxi_ingest::config::{IngestConfig, DEFAULT_TABLE_NAME};
use taxi_ingest::dataset::{TaxiColor, TripDataset};
use taxi_ingest::flows;
use taxi_ingest::pipeline::RunReport;
use taxi_ingest::transform::PassengerPolicy;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taxi-ingest")]
#[command(author, version, about = "Load NYC taxi trip data into PostgreSQL or a bucket")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a CSV or Parquet file into a PostgreSQL table
    Postgres {
        #[command(flatten)]
        db: DbArgs,

        /// Name of the table where results will be written
        #[arg(long, default_value = DEFAULT_TABLE_NAME)]
        table_name: String,

        /// URL, s3://bucket/key URI or path of the input file
        #[arg(long)]
        url: String,

        /// Rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// What to do with passenger counts
        #[arg(long, value_enum, default_value_t = PassengerPolicy::Keep)]
        passengers: PassengerPolicy,
    },

    /// Download monthly CSV files and store them in the bucket as Parquet
    WebToBucket {
        #[arg(long, value_enum, default_value_t = TaxiColor::Yellow)]
        color: TaxiColor,

        #[arg(long, default_value_t = 2021)]
        year: i32,

        /// Comma separated months, e.g. 1,2,3
        #[arg(long, value_delimiter = ',', default_value = "1")]
        months: Vec<u32>,
    },

    /// Append one month of Parquet trips from the bucket to PostgreSQL
    BucketToPostgres {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long, value_enum, default_value_t = TaxiColor::Yellow)]
        color: TaxiColor,

        #[arg(long, default_value_t = 2021)]
        year: i32,

        #[arg(long, default_value_t = 1)]
        month: u32,

        #[arg(long, default_value = DEFAULT_TABLE_NAME)]
        table_name: String,
    },

    /// Read a file into memory and report its schema and batches
    Inspect {
        #[arg(long)]
        url: String,

        #[arg(long)]
        batch_size: Option<usize>,
    },
}

impl Command {
    /// Apply the flags that override environment settings
    fn apply_overrides(&self, config: &mut IngestConfig) {
        match self {
            Command::Postgres { db, batch_size, .. } => {
                db.apply(config);
                if let Some(batch_size) = batch_size {
                    config.batch_size = *batch_size;
                }
            },
            Command::BucketToPostgres { db, .. } => db.apply(config),
            Command::Inspect { batch_size, .. } => {
                if let Some(batch_size) = batch_size {
                    config.batch_size = *batch_size;
                }
            },
            Command::WebToBucket { .. } => {},
        }
    }
}

/// Connection flags; anything left out comes from the environment
#[derive(Args, Debug)]
struct DbArgs {
    /// Full connection URL, takes precedence over the other flags
    #[arg(long = "db-url")]
    db_url: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Username for postgres
    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Database name for postgres
    #[arg(long)]
    db: Option<String>,
}

impl DbArgs {
    fn apply(&self, config: &mut IngestConfig) {
        let database = &mut config.database;
        if let Some(url) = &self.db_url {
            database.url = Some(url.clone());
        }
        if let Some(host) = &self.host {
            database.host = host.clone();
        }
        if let Some(port) = self.port {
            database.port = port;
        }
        if let Some(username) = &self.username {
            database.username = username.clone();
        }
        if let Some(password) = &self.password {
            database.password = password.clone();
        }
        if let Some(db) = &self.db {
            database.database = db.clone();
        }
    }
}

fn log_report(report: &RunReport) {
    info!(
        "{}: {} rows in {} batches ({:.3}s)",
        report.target,
        report.total_rows,
        report.batches.len(),
        report.elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("taxi-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    cli.command.apply_overrides(&mut config);
    config.validate()?;

    match cli.command {
        Command::Postgres {
            table_name,
            url,
            passengers,
            ..
        } => {
            let report = flows::ingest_to_postgres(&config, &url, &table_name, passengers).await?;
            log_report(&report);
        },
        Command::WebToBucket {
            color,
            year,
            months,
        } => {
            for report in flows::web_to_bucket_months(&config, color, year, &months).await? {
                log_report(&report);
            }
        },
        Command::BucketToPostgres {
            color,
            year,
            month,
            table_name,
            ..
        } => {
            let dataset = TripDataset::new(color, year, month)?;
            let report = flows::bucket_to_postgres(&config, &dataset, &table_name).await?;
            log_report(&report);
        },
        Command::Inspect { url, .. } => {
            let report = flows::inspect(&config, &url).await?;
            println!("{:<8} {:>12} {:>10}", "batch", "rows", "seconds");
            for batch in &report.batches {
                println!("{:<8} {:>12} {:>10.3}", batch.index, batch.rows, batch.elapsed.as_secs_f64());
            }
            log_report(&report);
        },
    }

    info!("Ingestion complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_postgres_flags() {
        let cli = Cli::try_parse_from([
            "taxi-ingest",
            "postgres",
            "--username",
            "root",
            "--host",
            "pgdatabase",
            "--port",
            "5433",
            "--db",
            "ny_taxi",
            "--table-name",
            "yellow_taxi_trips",
            "--url",
            "https://example.com/yellow.csv.gz",
            "--passengers",
            "drop-zero",
        ])
        .unwrap();

        match cli.command {
            Command::Postgres {
                db,
                table_name,
                passengers,
                ..
            } => {
                let mut config = IngestConfig::default();
                db.apply(&mut config);
                assert_eq!(config.database.host, "pgdatabase");
                assert_eq!(config.database.port, 5433);
                assert_eq!(config.database.password, IngestConfig::default().database.password);
                assert_eq!(table_name, "yellow_taxi_trips");
                assert_eq!(passengers, PassengerPolicy::DropZero);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_month_lists() {
        let cli = Cli::try_parse_from([
            "taxi-ingest",
            "-v",
            "web-to-bucket",
            "--color",
            "green",
            "--year",
            "2020",
            "--months",
            "1,2,3",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Command::WebToBucket {
                color,
                year,
                months,
            } => {
                assert_eq!(color, TaxiColor::Green);
                assert_eq!(year, 2020);
                assert_eq!(months, vec![1, 2, 3]);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_environment_before_validation() {
        let mut config = IngestConfig::from_lookup(|key| match key {
            "BATCH_SIZE" => Some("0".to_string()),
            "PG_HOST" => Some("localhost".to_string()),
            _ => None,
        })
        .unwrap();

        let cli = Cli::try_parse_from([
            "taxi-ingest",
            "postgres",
            "--host",
            "pgdatabase",
            "--url",
            "s3://trips/yellow/2021/yellow_tripdata_2021-01.parquet",
            "--batch-size",
            "5",
        ])
        .unwrap();
        cli.command.apply_overrides(&mut config);

        config.validate().unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.database.host, "pgdatabase");
    }

    #[test]
    fn test_cli_requires_url() {
        assert!(Cli::try_parse_from(["taxi-ingest", "inspect"]).is_err());
    }
}
