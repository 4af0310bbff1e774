//! Terrain-RGB tiles: slippy addressing, decoding and the HTTP source.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, StatusCode};
use skylane_core::{Coordinate, DeadlineClock, DeadlineExceeded, SampleSpacing};
use thiserror::Error;

/// Web Mercator stops here; the poles are unaddressable.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

/// Position of a coordinate inside its tile, each axis in `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileOffset {
    pub fx: f64,
    pub fy: f64,
}

impl TileKey {
    /// Tile holding `coord` at `zoom`, plus the offset within it.
    pub fn locate(coord: Coordinate, zoom: u8) -> (Self, TileOffset) {
        let n = f64::from(1u32 << zoom.min(30));
        let lat = coord.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        let x = (coord.lon + 180.0) / 360.0 * n;
        let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n;

        let max_index = n - 1.0;
        let tile_x = x.floor().clamp(0.0, max_index);
        let tile_y = y.floor().clamp(0.0, max_index);
        let key = TileKey {
            zoom,
            x: tile_x as u32,
            y: tile_y as u32,
        };
        let offset = TileOffset {
            fx: (x - tile_x).clamp(0.0, 1.0 - f64::EPSILON),
            fy: (y - tile_y).clamp(0.0, 1.0 - f64::EPSILON),
        };
        (key, offset)
    }

    /// Tile an elevation lookup of `coord` reads, `None` if not finite.
    pub fn containing(coord: Coordinate, zoom: u8) -> Option<Self> {
        coord
            .is_finite()
            .then(|| Self::locate(coord.normalized(), zoom).0)
    }
}

/// Every tile the terrain samples of `segments` read at `zoom`.
///
/// Samples interpolate linearly in lon/lat, so a segment whose endpoints
/// share a tile never leaves it and is not sampled. Other segments are
/// sampled both ways round, since a sample on a tile edge may round into
/// either neighbour depending on direction.
pub fn tiles_along(
    segments: impl IntoIterator<Item = (Coordinate, Coordinate)>,
    spacing: &SampleSpacing,
    zoom: u8,
    clock: &mut DeadlineClock,
) -> Result<HashSet<TileKey>, DeadlineExceeded> {
    let mut keys = HashSet::new();
    for (a, b) in segments {
        clock.tick()?;
        let (Some(from), Some(to)) = (TileKey::containing(a, zoom), TileKey::containing(b, zoom))
        else {
            continue;
        };
        keys.insert(from);
        if from == to {
            continue;
        }
        keys.insert(to);
        let samples = spacing.line_samples(a, b).into_iter().chain(spacing.line_samples(b, a));
        keys.extend(samples.filter_map(|sample| TileKey::containing(sample, zoom)));
    }
    Ok(keys)
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// `-10000 + (R * 65536 + G * 256 + B) * 0.1` meters.
pub fn decode_terrain_rgb(r: u8, g: u8, b: u8) -> f64 {
    let packed = u32::from(r) * 65_536 + u32::from(g) * 256 + u32::from(b);
    -10_000.0 + f64::from(packed) * 0.1
}

/// Heights decoded once at fetch time, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRaster {
    width: u32,
    height: u32,
    heights_m: Vec<f32>,
}

impl TileRaster {
    pub fn from_heights(width: u32, height: u32, heights_m: Vec<f32>) -> Result<Self, TileFetchError> {
        if width == 0 || height == 0 || heights_m.len() != (width as usize) * (height as usize) {
            return Err(TileFetchError::Decode(format!(
                "{} heights for a {}x{} raster",
                heights_m.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            heights_m,
        })
    }

    pub fn uniform(width: u32, height: u32, height_m: f32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            heights_m: vec![height_m; (width.max(1) as usize) * (height.max(1) as usize)],
        }
    }

    /// Decode a PNG or WebP terrain-RGB image.
    pub fn decode(bytes: &[u8]) -> Result<Self, TileFetchError> {
        let image = image::load_from_memory(bytes)
            .map_err(|err| TileFetchError::Decode(err.to_string()))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        let heights_m = image
            .pixels()
            .map(|pixel| decode_terrain_rgb(pixel[0], pixel[1], pixel[2]) as f32)
            .collect();
        Self::from_heights(width, height, heights_m)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Nearest-pixel height at a tile offset.
    pub fn sample(&self, offset: TileOffset) -> f64 {
        let col = ((offset.fx * f64::from(self.width)).floor() as u32).min(self.width - 1);
        let row = ((offset.fy * f64::from(self.height)).floor() as u32).min(self.height - 1);
        f64::from(self.heights_m[(row * self.width + col) as usize])
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TileFetchError {
    #[error("tile request failed: {0}")]
    Http(String),
    #[error("tile server returned HTTP {0}")]
    Status(u16),
    #[error("tile decode failed: {0}")]
    Decode(String),
    #[error("tile fetch timed out")]
    Timeout,
}

impl TileFetchError {
    /// Transport errors, timeouts, throttling and 5xx are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            TileFetchError::Http(_) | TileFetchError::Timeout => true,
            TileFetchError::Status(code) => *code == 429 || *code >= 500,
            TileFetchError::Decode(_) => false,
        }
    }
}

/// Where raster tiles come from. Object safe so tests can swap in fakes.
pub trait TileSource: Send + Sync {
    fn fetch(&self, key: TileKey) -> BoxFuture<'static, Result<TileRaster, TileFetchError>>;
}

/// Tiles over HTTP GET from a `{z}/{x}/{y}` URL template.
#[derive(Debug, Clone)]
pub struct HttpTileSource {
    client: Client,
    url_template: String,
    key: Option<String>,
}

impl HttpTileSource {
    pub fn new(url_template: impl Into<String>, key: Option<String>, timeout: Duration) -> Result<Self, TileFetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TileFetchError::Http(err.to_string()))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            key: key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn tile_url(&self, key: TileKey) -> String {
        self.url_template
            .replace("{z}", &key.zoom.to_string())
            .replace("{x}", &key.x.to_string())
            .replace("{y}", &key.y.to_string())
    }
}

impl TileSource for HttpTileSource {
    fn fetch(&self, key: TileKey) -> BoxFuture<'static, Result<TileRaster, TileFetchError>> {
        let mut request = self.client.get(self.tile_url(key));
        if let Some(credential) = &self.key {
            request = request.query(&[("key", credential.as_str())]);
        }

        async move {
            let response = request.send().await.map_err(|err| {
                if err.is_timeout() {
                    TileFetchError::Timeout
                } else {
                    TileFetchError::Http(err.to_string())
                }
            })?;
            let status = response.status();
            if status != StatusCode::OK {
                return Err(TileFetchError::Status(status.as_u16()));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|err| TileFetchError::Http(err.to_string()))?;
            tokio::task::spawn_blocking(move || TileRaster::decode(&bytes))
                .await
                .map_err(|err| TileFetchError::Decode(err.to_string()))?
        }
        .boxed()
    }
}
