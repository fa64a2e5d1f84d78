use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::{Bounds, Cycle, Resolution};
use crate::error::StageError;

pub const SELECTION_VERSION: &str = "wrf-ic-v1";

const VARIABLES: &[&str] = &[
    "HGT", "ICEC", "LAND", "MSLET", "PRES", "PRMSL", "RH", "SNOD", "SOILW", "SPFH", "TMP",
    "TSOIL", "UGRD", "VGRD", "WEASD",
];

const DEFAULT_FILTER_BASE: &str = "https://nomads.ncep.noaa.gov/cgi-bin";
const DEFAULT_DATA_BASE: &str = "https://nomads.ncep.noaa.gov/pub/data/nccf/com/gfs/prod";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForecastFile {
    pub cycle: Cycle,
    pub lead_hour: u32,
    pub resolution: Resolution,
}

impl ForecastFile {
    pub fn new(cycle: Cycle, lead_hour: u32, resolution: Resolution) -> Self {
        Self {
            cycle,
            lead_hour,
            resolution,
        }
    }

    pub fn file_name(&self) -> String {
        let product = match self.resolution {
            Resolution::Medium => "pgrb2full",
            Resolution::Fine | Resolution::Coarse => "pgrb2",
        };
        format!(
            "gfs.t{:02}z.{product}.{}.f{:03}",
            self.cycle.hour(),
            self.resolution.product(),
            self.lead_hour
        )
    }

    fn cycle_dir(&self) -> String {
        format!(
            "/gfs.{}/{:02}/atmos",
            self.cycle.date_stamp(),
            self.cycle.hour()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub filter_base: String,
    pub data_base: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            filter_base: DEFAULT_FILTER_BASE.to_string(),
            data_base: DEFAULT_DATA_BASE.to_string(),
        }
    }
}

impl Endpoint {
    pub fn probe_url(&self, file: &ForecastFile) -> String {
        format!(
            "{}{}/{}",
            self.data_base.trim_end_matches('/'),
            file.cycle_dir(),
            file.file_name()
        )
    }

    pub fn filter_url(&self, file: &ForecastFile, bounds: Option<&Bounds>) -> String {
        let mut url = format!(
            "{}/filter_gfs_{}.pl?dir={}&file={}",
            self.filter_base.trim_end_matches('/'),
            file.resolution.product(),
            encode_dir(&file.cycle_dir()),
            file.file_name()
        );
        for var in VARIABLES {
            url.push_str(&format!("&var_{var}=on"));
        }
        url.push_str("&all_lev=on");
        if let Some(bounds) = bounds {
            url.push_str(&format!(
                "&subregion=&leftlon={:.4}&rightlon={:.4}&toplat={:.4}&bottomlat={:.4}",
                bounds.left, bounds.right, bounds.top, bounds.bottom
            ));
        }
        url
    }
}

fn encode_dir(dir: &str) -> String {
    dir.replace('/', "%2F")
}

pub trait GfsClient: Send + Sync {
    fn probe(&self, url: &str) -> Result<bool, StageError>;
    fn download(&self, url: &str, destination: &Path) -> Result<u64, StageError>;
}

#[derive(Clone)]
pub struct GfsHttpClient {
    client: Client,
}

impl GfsHttpClient {
    pub fn new() -> Result<Self, StageError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gfs-stage/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| StageError::UpstreamHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| StageError::UpstreamHttp(err.to_string()))?;

        Ok(Self { client })
    }
}

impl GfsClient for GfsHttpClient {
    fn probe(&self, url: &str) -> Result<bool, StageError> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|err| StageError::UpstreamHttp(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
            return Ok(false);
        }
        Err(StageError::UpstreamStatus {
            status: status.as_u16(),
            message: format!("probe {url}"),
        })
    }

    fn download(&self, url: &str, destination: &Path) -> Result<u64, StageError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| StageError::UpstreamHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .map(|body| body.chars().take(200).collect())
                .unwrap_or_else(|_| "upstream request failed".to_string());
            return Err(StageError::UpstreamStatus { status, message });
        }

        let mut file =
            File::create(destination).map_err(|err| StageError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| StageError::UpstreamHttp(err.to_string()))
    }
}
