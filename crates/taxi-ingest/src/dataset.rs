//! Monthly NYC taxi trip datasets

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Release page hosting the CSV backups
pub const RELEASE_BASE_URL: &str = "https://github.com/DataTalksClub/nyc-tlc-data/releases/download";

/// Prefix of the object keys in the bucket
pub const OBJECT_PREFIX: &str = "data";

/// Taxi fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TaxiColor {
    Yellow,
    Green,
}

impl TaxiColor {
    pub fn as_str(self) -> &'static str {
        match self {
            TaxiColor::Yellow => "yellow",
            TaxiColor::Green => "green",
        }
    }

    /// Prefix of the pickup/dropoff datetime columns
    ///
    /// Yellow cabs use the taximeter (`tpep`), green cabs the livery
    /// passenger enhancement (`lpep`) devices.
    pub fn datetime_prefix(self) -> &'static str {
        match self {
            TaxiColor::Yellow => "tpep",
            TaxiColor::Green => "lpep",
        }
    }
}

impl fmt::Display for TaxiColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxiColor {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yellow" => Ok(TaxiColor::Yellow),
            "green" => Ok(TaxiColor::Green),
            _ => Err(DatasetError::UnknownColor(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error("Unknown taxi color: {0}. Expected yellow or green")]
    UnknownColor(String),

    #[error("Invalid month {0}. Expected 1-12")]
    InvalidMonth(u32),
}

/// One monthly trip file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripDataset {
    pub color: TaxiColor,
    pub year: i32,
    pub month: u32,
}

impl TripDataset {
    pub fn new(color: TaxiColor, year: i32, month: u32) -> Result<Self, DatasetError> {
        if !(1..=12).contains(&month) {
            return Err(DatasetError::InvalidMonth(month));
        }
        Ok(Self { color, year, month })
    }

    /// `yellow_tripdata_2021-01`
    pub fn file_stem(&self) -> String {
        format!("{}_tripdata_{}-{:02}", self.color, self.year, self.month)
    }

    pub fn csv_url(&self) -> String {
        format!("{}/{}/{}.csv.gz", RELEASE_BASE_URL, self.color, self.file_stem())
    }

    /// Key of the Parquet object in the bucket
    pub fn object_key(&self) -> String {
        format!("{}/{}/{}.parquet", OBJECT_PREFIX, self.color, self.file_stem())
    }

    /// Local copy of the Parquet object, mirroring the bucket layout
    pub fn local_path(&self, staging_dir: &Path) -> PathBuf {
        staging_dir.join(self.object_key())
    }

    pub fn pickup_column(&self) -> String {
        format!("{}_pickup_datetime", self.color.datetime_prefix())
    }

    pub fn dropoff_column(&self) -> String {
        format!("{}_dropoff_datetime", self.color.datetime_prefix())
    }

    pub fn datetime_columns(&self) -> [String; 2] {
        [self.pickup_column(), self.dropoff_column()]
    }
}

impl fmt::Display for TripDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}
