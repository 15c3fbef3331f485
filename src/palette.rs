//! Dominant-color extraction via seeded k-means.
//!
//! The image is downscaled with nearest-neighbour sampling, so no blended
//! colors are introduced. Clustering runs over the histogram of distinct
//! colors, weighted by pixel count. The RNG is re-seeded on every call, so
//! identical pixels and parameters always give the identical palette.

use std::collections::BTreeMap;

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const DEFAULT_N_COLORS: usize = 5;
pub const DEFAULT_RESIZE_DIM: u32 = 150;
pub const DEFAULT_RANDOM_SEED: u64 = 42;
const DEFAULT_MAX_ITERATIONS: usize = 300;
const DEFAULT_TOLERANCE: f64 = 1e-4;

/// One dominant color of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorObservation {
    /// Lowercase `#rrggbb`.
    pub hex: String,
    /// Share of pixels in this cluster, in percent.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorProfilerConfig {
    #[serde(default = "default_n_colors")]
    pub n_colors: usize,
    #[serde(default = "default_resize_dim")]
    pub resize_dim: u32,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_n_colors() -> usize {
    DEFAULT_N_COLORS
}
fn default_resize_dim() -> u32 {
    DEFAULT_RESIZE_DIM
}
fn default_random_seed() -> u64 {
    DEFAULT_RANDOM_SEED
}
fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}
fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

impl Default for ColorProfilerConfig {
    fn default() -> Self {
        Self {
            n_colors: DEFAULT_N_COLORS,
            resize_dim: DEFAULT_RESIZE_DIM,
            random_seed: DEFAULT_RANDOM_SEED,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColorAnalysisError {
    #[error("image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("invalid profiler configuration: {0}")]
    InvalidConfig(String),
    #[error("color analysis timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("color analysis worker failed: {0}")]
    Worker(String),
}

impl ColorAnalysisError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyImage { .. } => "empty_image",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Timeout(_) => "timeout",
            Self::Worker(_) => "worker_failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColorProfiler {
    config: ColorProfilerConfig,
}

impl ColorProfiler {
    pub fn new(config: ColorProfilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ColorProfilerConfig {
        &self.config
    }

    /// Dominant colors sorted by weight, highest first.
    ///
    /// Returns `min(n_colors, distinct colors after downscaling)` observations
    /// whose weights sum to 100. Downscaling samples nearest neighbours, so a
    /// color covering only thin lines or isolated pixels of the source can be
    /// missing from the result entirely.
    pub fn profile(&self, image: &RgbImage) -> Result<Vec<ColorObservation>, ColorAnalysisError> {
        let cfg = &self.config;
        if cfg.n_colors == 0 {
            return Err(ColorAnalysisError::InvalidConfig(
                "n_colors must be >= 1".into(),
            ));
        }
        if cfg.resize_dim == 0 {
            return Err(ColorAnalysisError::InvalidConfig(
                "resize_dim must be >= 1".into(),
            ));
        }
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ColorAnalysisError::EmptyImage { width, height });
        }

        let small = imageops::resize(image, cfg.resize_dim, cfg.resize_dim, FilterType::Nearest);
        let points = histogram(&small);
        let total: f64 = points.iter().map(|p| p.count).sum();

        let k = cfg.n_colors.min(points.len());
        let mut rng = StdRng::seed_from_u64(cfg.random_seed);
        let centroids = kmeans(&points, k, cfg.max_iterations, cfg.tolerance, &mut rng);

        let mut counts = vec![0.0f64; centroids.len()];
        for p in &points {
            counts[nearest(&p.rgb, &centroids).0] += p.count;
        }

        let mut observations: Vec<ColorObservation> = centroids
            .iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0.0)
            .map(|(c, count)| ColorObservation {
                hex: to_hex(c),
                weight: count / total * 100.0,
            })
            .collect();

        observations.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.hex.cmp(&b.hex))
        });
        Ok(observations)
    }
}

struct WeightedPoint {
    rgb: [f64; 3],
    count: f64,
}

/// Distinct colors in ascending RGB order with their pixel counts.
fn histogram(image: &RgbImage) -> Vec<WeightedPoint> {
    let mut counts: BTreeMap<[u8; 3], u64> = BTreeMap::new();
    for pixel in image.pixels() {
        *counts.entry(pixel.0).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(rgb, count)| WeightedPoint {
            rgb: [rgb[0] as f64, rgb[1] as f64, rgb[2] as f64],
            count: count as f64,
        })
        .collect()
}

fn dist2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    dr * dr + dg * dg + db * db
}

/// Index of and squared distance to the closest centroid; ties go to the lower index.
fn nearest(p: &[f64; 3], centroids: &[[f64; 3]]) -> (usize, f64) {
    let mut best = (0usize, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = dist2(p, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Weighted k-means++ seeding. Requires `1 <= k <= points.len()`.
fn seed_centroids(points: &[WeightedPoint], k: usize, rng: &mut StdRng) -> Vec<[f64; 3]> {
    let total: f64 = points.iter().map(|p| p.count).sum();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[pick_weighted(points.iter().map(|p| p.count), total, rng)].rgb);

    let mut d2: Vec<f64> = points.iter().map(|p| dist2(&p.rgb, &centroids[0])).collect();
    while centroids.len() < k {
        let mass: f64 = points.iter().zip(&d2).map(|(p, d)| p.count * d).sum();
        let next = if mass > 0.0 {
            pick_weighted(points.iter().zip(&d2).map(|(p, d)| p.count * d), mass, rng)
        } else {
            // All remaining mass sits on existing centroids; take any unused color.
            match d2.iter().position(|d| *d > 0.0) {
                Some(i) => i,
                None => break,
            }
        };
        let c = points[next].rgb;
        centroids.push(c);
        for (d, p) in d2.iter_mut().zip(points) {
            *d = d.min(dist2(&p.rgb, &c));
        }
    }
    centroids
}

fn pick_weighted(weights: impl Iterator<Item = f64>, total: f64, rng: &mut StdRng) -> usize {
    let target = rng.gen::<f64>() * total;
    let mut acc = 0.0;
    let mut last_positive = 0;
    for (i, w) in weights.enumerate() {
        if w <= 0.0 {
            continue;
        }
        acc += w;
        last_positive = i;
        if acc > target {
            return i;
        }
    }
    last_positive
}

fn kmeans(
    points: &[WeightedPoint],
    k: usize,
    max_iterations: usize,
    tolerance: f64,
    rng: &mut StdRng,
) -> Vec<[f64; 3]> {
    let mut centroids = seed_centroids(points, k, rng);
    let k = centroids.len();
    let mut labels = vec![0usize; points.len()];

    for _ in 0..max_iterations {
        let mut sums = vec![[0.0f64; 3]; k];
        let mut weights = vec![0.0f64; k];
        for (label, p) in labels.iter_mut().zip(points) {
            let (i, _) = nearest(&p.rgb, &centroids);
            *label = i;
            for ch in 0..3 {
                sums[i][ch] += p.rgb[ch] * p.count;
            }
            weights[i] += p.count;
        }

        let mut shift = 0.0f64;
        for i in 0..k {
            let updated = if weights[i] > 0.0 {
                [
                    sums[i][0] / weights[i],
                    sums[i][1] / weights[i],
                    sums[i][2] / weights[i],
                ]
            } else {
                // Empty cluster: relocate to the point worst served by its centroid.
                let far = points
                    .iter()
                    .zip(&labels)
                    .map(|(p, l)| (p, dist2(&p.rgb, &centroids[*l])))
                    .filter(|(p, _)| !centroids.contains(&p.rgb))
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                match far {
                    Some((p, _)) => p.rgb,
                    None => centroids[i],
                }
            };
            shift = shift.max(dist2(&centroids[i], &updated));
            centroids[i] = updated;
        }

        if shift <= tolerance {
            break;
        }
    }
    centroids
}

fn to_hex(c: &[f64; 3]) -> String {
    let channel = |v: f64| v.round().clamp(0.0, 255.0) as u8;
    format!(
        "#{:02x}{:02x}{:02x}",
        channel(c[0]),
        channel(c[1]),
        channel(c[2])
    )
}
