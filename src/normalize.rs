//! Adaptive, replayable per-column normalization.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::stats::Sample;
use crate::table::{Cell, Table};

pub const SPEC_VERSION: &str = "v3_exact";

const INTEGER_TOLERANCE: f64 = 1e-9;
const SPARSE_ZERO_FRACTION: f64 = 0.8;
const TANH_SATURATION: f64 = 0.999_999;
const MIN_TANH_DIV: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Identity,
    Log1p,
    AddEps { eps: f64 },
    Power { p: f64 },
    ClipTo { lo_v: f64, hi_v: f64 },
    Minmax01 { a: f64, b: f64 },
    Divide { denom: f64 },
    ArcsinhScale { pre_div: f64, scale: f64 },
    RobustZ { med: f64, scale: f64 },
    TanhDiv { div: f64 },
}

impl Step {
    pub fn forward(&self, y: f64) -> f64 {
        if y.is_nan() {
            return y;
        }
        match *self {
            Self::Identity => y,
            Self::Log1p => y.max(0.0).ln_1p(),
            Self::AddEps { eps } => y + eps,
            Self::Power { p } => y.max(0.0).powf(p),
            Self::ClipTo { lo_v, hi_v } => y.max(lo_v).min(hi_v),
            Self::Minmax01 { a, b } => (y - a) / nonzero_or_one(b - a),
            Self::Divide { denom } => y / positive_or_one(denom),
            Self::ArcsinhScale { pre_div, scale } => (y / nonzero_or_one(scale * pre_div)).asinh(),
            Self::RobustZ { med, scale } => (y - med) / nonzero_or_one(scale),
            Self::TanhDiv { div } => (y / div.max(MIN_TANH_DIV)).tanh(),
        }
    }

    pub fn inverse(&self, y: f64) -> f64 {
        if y.is_nan() {
            return y;
        }
        match *self {
            Self::Identity | Self::ClipTo { .. } => y,
            Self::Log1p => y.max(0.0).exp_m1(),
            Self::AddEps { eps } => y - eps,
            Self::Power { p } => {
                let p_inv = if p != 0.0 { 1.0 / p } else { 1.0 };
                y.max(0.0).powf(p_inv)
            }
            Self::Minmax01 { a, b } => y * nonzero_or_one(b - a) + a,
            Self::Divide { denom } => y * positive_or_one(denom),
            Self::ArcsinhScale { pre_div, scale } => y.sinh() * nonzero_or_one(scale * pre_div),
            Self::RobustZ { med, scale } => y * nonzero_or_one(scale) + med,
            Self::TanhDiv { div } => {
                y.clamp(-TANH_SATURATION, TANH_SATURATION).atanh() * div.max(MIN_TANH_DIV)
            }
        }
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, Self::ClipTo { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostScale {
    None,
    PostZscore { mu: f64, sigma: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub steps: Vec<Step>,
    pub post: PostScale,
    #[serde(default)]
    pub meta: bool,
}

impl ColumnSpec {
    fn passthrough(meta: bool) -> Self {
        Self {
            steps: vec![Step::Identity],
            post: PostScale::None,
            meta,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.meta
            || (self.post == PostScale::None && self.steps.iter().all(|s| *s == Step::Identity))
    }

    pub fn is_exactly_invertible(&self) -> bool {
        !self.steps.iter().any(Step::is_lossy)
    }

    pub fn forward(&self, value: f64) -> f64 {
        let y = self.steps.iter().fold(value, |y, step| step.forward(y));
        match self.post {
            PostScale::None => y,
            PostScale::PostZscore { mu, sigma } => (y - mu) / nonzero_or_one(sigma),
        }
    }

    pub fn inverse(&self, value: f64) -> f64 {
        let y = match self.post {
            PostScale::None => value,
            PostScale::PostZscore { mu, sigma } => value * nonzero_or_one(sigma) + mu,
        };
        self.steps.iter().rev().fold(y, |y, step| step.inverse(y))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSpec {
    pub version: String,
    pub columns: BTreeMap<String, ColumnSpec>,
}

impl Default for NormalizationSpec {
    fn default() -> Self {
        Self {
            version: SPEC_VERSION.to_string(),
            columns: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("spec JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spec version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("spec fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

impl NormalizationSpec {
    pub fn to_json(&self) -> Result<String, SpecError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, SpecError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SpecError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SpecError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn fingerprint(&self) -> Result<String, SpecError> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self)?);
        Ok(hex::encode(hasher.finalize()))
    }
}

pub fn assert_spec_compatible(
    expected_version: &str,
    expected_fingerprint: &str,
    actual: &NormalizationSpec,
) -> Result<(), SpecError> {
    if expected_version != actual.version {
        return Err(SpecError::VersionMismatch {
            expected: expected_version.to_string(),
            actual: actual.version.clone(),
        });
    }

    let fingerprint = actual.fingerprint()?;
    if expected_fingerprint != fingerprint {
        return Err(SpecError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: fingerprint,
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineTemplate {
    Meta,
    Excluded,
    Degenerate,
    Identity,
    SparseCount,
    NonNegative,
    TwoSided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFit {
    pub template: PipelineTemplate,
    pub skew: Option<f64>,
    pub excess_kurtosis: Option<f64>,
    pub severity: Option<f64>,
    pub divisor_fallbacks: u32,
}

impl ColumnFit {
    fn plain(template: PipelineTemplate) -> Self {
        Self {
            template,
            skew: None,
            excess_kurtosis: None,
            severity: None,
            divisor_fallbacks: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub columns: BTreeMap<String, ColumnFit>,
    pub divisor_fallbacks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub heavy_tail_keywords: Vec<String>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            heavy_tail_keywords: ["soil", "precip", "runoff"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColumnTransformer {
    cfg: TransformerConfig,
}

impl ColumnTransformer {
    pub fn new(cfg: TransformerConfig) -> Self {
        Self { cfg }
    }

    pub fn fit<S: AsRef<str>>(
        &self,
        table: &Table,
        meta_columns: &[S],
        excluded_columns: &[S],
    ) -> NormalizationSpec {
        self.fit_with_report(table, meta_columns, excluded_columns).0
    }

    pub fn fit_with_report<S: AsRef<str>>(
        &self,
        table: &Table,
        meta_columns: &[S],
        excluded_columns: &[S],
    ) -> (NormalizationSpec, FitReport) {
        let is_listed = |list: &[S], name: &str| list.iter().any(|c| c.as_ref() == name);

        let mut spec = NormalizationSpec::default();
        let mut report = FitReport::default();

        for (idx, name) in table.columns().iter().enumerate() {
            let (column, fit) = if is_listed(meta_columns, name) {
                (
                    ColumnSpec::passthrough(true),
                    ColumnFit::plain(PipelineTemplate::Meta),
                )
            } else if is_listed(excluded_columns, name) {
                (
                    ColumnSpec::passthrough(false),
                    ColumnFit::plain(PipelineTemplate::Excluded),
                )
            } else {
                let values: Vec<f64> = table
                    .column_cells(idx)
                    .map(|cell| cell.as_f64().unwrap_or(f64::NAN))
                    .collect();
                self.fit_column(name, &values)
            };

            debug!(
                component = "normalize",
                event = "normalize.fit.column",
                column = %name,
                template = ?fit.template,
                severity = ?fit.severity,
                steps = column.steps.len()
            );
            report.divisor_fallbacks += u64::from(fit.divisor_fallbacks);
            report.columns.insert(name.clone(), fit);
            spec.columns.insert(name.clone(), column);
        }

        info!(
            component = "normalize",
            event = "normalize.fit.finish",
            columns = spec.columns.len(),
            rows = table.len(),
            divisor_fallbacks = report.divisor_fallbacks
        );

        (spec, report)
    }

    fn fit_column(&self, name: &str, values: &[f64]) -> (ColumnSpec, ColumnFit) {
        let sample = Sample::finite(values.iter().copied());
        let (Some(skew), Some(kurt)) = (sample.skewness(), sample.excess_kurtosis()) else {
            // Empty, all non-finite, or zero variance.
            return (
                ColumnSpec::passthrough(false),
                ColumnFit::plain(PipelineTemplate::Degenerate),
            );
        };

        let score = severity(skew.abs(), kurt);
        let zero_fraction =
            values.iter().filter(|v| **v == 0.0).count() as f64 / values.len() as f64;
        let template = self.select_template(name, &sample, skew, kurt, zero_fraction);

        let mut fallbacks = FallbackCounter::new(name);
        let steps = match template {
            PipelineTemplate::SparseCount => sparse_count_steps(&sample, score, &mut fallbacks),
            PipelineTemplate::NonNegative => {
                non_negative_steps(&sample, score, skew, kurt, &mut fallbacks)
            }
            PipelineTemplate::TwoSided => two_sided_steps(&sample, score, &mut fallbacks),
            _ => vec![Step::Identity],
        };

        let post = post_zscore(values, &steps, &mut fallbacks);
        let fit = ColumnFit {
            template,
            skew: Some(skew),
            excess_kurtosis: Some(kurt),
            severity: Some(score),
            divisor_fallbacks: fallbacks.count,
        };
        let column = ColumnSpec {
            steps,
            post,
            meta: false,
        };
        (column, fit)
    }

    fn select_template(
        &self,
        name: &str,
        sample: &Sample,
        skew: f64,
        kurt: f64,
        zero_fraction: f64,
    ) -> PipelineTemplate {
        let lowered = name.to_lowercase();
        let keyword = self
            .cfg
            .heavy_tail_keywords
            .iter()
            .any(|k| lowered.contains(&k.to_lowercase()));
        let heavy = (skew.abs() >= 2.0 && kurt >= 5.0) || (skew.abs() < 2.0 && kurt >= 2.5);
        if !(heavy || keyword) {
            return PipelineTemplate::Identity;
        }

        let non_negative = sample.min().is_some_and(|min| min >= 0.0);
        if !non_negative {
            return PipelineTemplate::TwoSided;
        }
        let integer_like = sample
            .values()
            .iter()
            .all(|v| (v - v.round()).abs() <= INTEGER_TOLERANCE);
        if integer_like && zero_fraction >= SPARSE_ZERO_FRACTION {
            PipelineTemplate::SparseCount
        } else {
            PipelineTemplate::NonNegative
        }
    }
}

pub fn severity(abs_skew: f64, excess_kurtosis: f64) -> f64 {
    let skew_term = 1.0 - (-(abs_skew / 3.0).powi(2)).exp();
    let kurt_term = 1.0 - (-(excess_kurtosis.max(0.0) / 10.0)).exp();
    0.6 * skew_term + 0.4 * kurt_term
}

struct FallbackCounter<'a> {
    column: &'a str,
    count: u32,
}

impl<'a> FallbackCounter<'a> {
    fn new(column: &'a str) -> Self {
        Self { column, count: 0 }
    }

    fn record(&mut self, divisor: &'static str, replacement: f64) {
        self.count += 1;
        warn!(
            component = "normalize",
            event = "normalize.fallback.divisor",
            column = self.column,
            divisor,
            replacement
        );
    }
}

fn replay(values: &[f64], steps: &[Step]) -> Vec<f64> {
    values
        .iter()
        .map(|v| steps.iter().fold(*v, |y, step| step.forward(y)))
        .collect()
}

fn sparse_count_steps(
    sample: &Sample,
    severity: f64,
    fallbacks: &mut FallbackCounter,
) -> Vec<Step> {
    let logged = replay(sample.values(), &[Step::Log1p]);
    let positive = Sample::finite(logged.iter().copied().filter(|v| *v > 0.0));

    let q = if severity < 0.7 { 99.0 } else { 95.0 };
    let denom = match positive.percentile(q) {
        Some(d) if d.is_finite() && d > 0.0 => d,
        _ => {
            let max = Sample::finite(logged).max().unwrap_or(0.0);
            let replacement = if max > 0.0 { max } else { 1.0 };
            fallbacks.record("divide.denom", replacement);
            replacement
        }
    };

    vec![
        Step::Log1p,
        Step::Divide { denom },
        Step::ClipTo {
            lo_v: 0.0,
            hi_v: 1.0,
        },
    ]
}

fn non_negative_steps(
    sample: &Sample,
    severity: f64,
    skew: f64,
    kurt: f64,
    fallbacks: &mut FallbackCounter,
) -> Vec<Step> {
    let p = (1.0 / (1.0 + 4.0 * severity)).max(0.12);
    let eps = sample.percentile(0.001).unwrap_or(0.0).max(1e-12);
    let very_severe = severity >= 0.75 || (skew.abs() >= 3.0 && kurt >= 8.0);

    let mut steps = Vec::with_capacity(5);
    if very_severe {
        steps.push(Step::Log1p);
    }
    steps.push(Step::AddEps { eps });
    steps.push(Step::Power { p });

    let powered = Sample::finite(replay(sample.values(), &steps));
    let lo_q = 0.2 + 4.8 * severity;
    let hi_q = 99.8 - 4.8 * severity;
    let (lo_v, hi_v) = clip_bounds(&powered, lo_q, hi_q, fallbacks);
    steps.push(Step::ClipTo { lo_v, hi_v });

    let clipped = Sample::finite(powered.values().iter().map(|v| v.max(lo_v).min(hi_v)));
    let a = clipped.min().unwrap_or(lo_v);
    let mut b = clipped.max().unwrap_or(hi_v);
    if b <= a {
        b = a + 1.0;
        fallbacks.record("minmax01.range", 1.0);
    }
    steps.push(Step::Minmax01 { a, b });
    steps
}

fn two_sided_steps(sample: &Sample, severity: f64, fallbacks: &mut FallbackCounter) -> Vec<Step> {
    let pre_div = 1.0 + 3.0 * severity;

    let scale0 = match sample.mad() {
        Some(mad) if mad > 0.0 => mad,
        _ => std_fallback(sample, "arcsinh_scale.scale", fallbacks),
    };
    let arcsinh = Step::ArcsinhScale {
        pre_div,
        scale: scale0,
    };
    let z_base = Sample::finite(replay(sample.values(), &[arcsinh]));

    let med = z_base.median().unwrap_or(0.0);
    let iqr = match (z_base.percentile(25.0), z_base.percentile(75.0)) {
        (Some(q1), Some(q3)) => q3 - q1,
        _ => 0.0,
    };
    let scale1 = if iqr > 0.0 {
        iqr / 1.349
    } else {
        std_fallback(&z_base, "robust_z.scale", fallbacks)
    };
    let robust = Step::RobustZ { med, scale: scale1 };

    let zt = Sample::finite(z_base.values().iter().map(|v| robust.forward(*v)));
    let lo_q = 0.5 + 4.5 * severity;
    let hi_q = 99.5 - 4.5 * severity;
    let (lo_v, hi_v) = clip_bounds(&zt, lo_q, hi_q, fallbacks);

    vec![
        arcsinh,
        robust,
        Step::ClipTo { lo_v, hi_v },
        Step::TanhDiv {
            div: 3.0 - 2.5 * severity,
        },
    ]
}

fn clip_bounds(
    sample: &Sample,
    lo_q: f64,
    hi_q: f64,
    fallbacks: &mut FallbackCounter,
) -> (f64, f64) {
    if let (Some(lo), Some(hi)) = (sample.percentile(lo_q), sample.percentile(hi_q)) {
        if lo.is_finite() && hi.is_finite() && hi > lo {
            return (lo, hi);
        }
    }
    let lo = sample.min().unwrap_or(0.0);
    let hi = sample.max().unwrap_or(lo);
    let hi = if hi > lo { hi } else { lo + 1.0 };
    fallbacks.record("clip_to.range", hi - lo);
    (lo, hi)
}

fn std_fallback(sample: &Sample, divisor: &'static str, fallbacks: &mut FallbackCounter) -> f64 {
    let replacement = match sample.std() {
        Some(std) if std.is_finite() && std > 0.0 => std,
        _ => 1.0,
    };
    fallbacks.record(divisor, replacement);
    replacement
}

fn post_zscore(values: &[f64], steps: &[Step], fallbacks: &mut FallbackCounter) -> PostScale {
    let transformed = Sample::finite(replay(values, steps));
    let mu = transformed.mean().filter(|m| m.is_finite()).unwrap_or(0.0);
    let sigma = match transformed.std() {
        Some(s) if s.is_finite() && s > 0.0 => s,
        _ => {
            fallbacks.record("post_zscore.sigma", 1.0);
            1.0
        }
    };
    PostScale::PostZscore { mu, sigma }
}

fn nonzero_or_one(d: f64) -> f64 {
    if d.is_finite() && d != 0.0 {
        d
    } else {
        1.0
    }
}

fn positive_or_one(d: f64) -> f64 {
    if d.is_finite() && d > 0.0 {
        d
    } else {
        1.0
    }
}

pub fn apply(table: &Table, spec: &NormalizationSpec) -> Table {
    map_columns(table, spec, ColumnSpec::forward)
}

pub fn invert(table: &Table, spec: &NormalizationSpec) -> Table {
    map_columns(table, spec, ColumnSpec::inverse)
}

pub fn fit_transform<S: AsRef<str>>(
    transformer: &ColumnTransformer,
    table: &Table,
    meta_columns: &[S],
    excluded_columns: &[S],
) -> (Table, NormalizationSpec) {
    let spec = transformer.fit(table, meta_columns, excluded_columns);
    (apply(table, &spec), spec)
}

fn map_columns(table: &Table, spec: &NormalizationSpec, f: fn(&ColumnSpec, f64) -> f64) -> Table {
    let mut out = table.clone();
    for (name, column) in &spec.columns {
        if column.is_passthrough() {
            continue;
        }
        let Some(idx) = out.column_index(name) else {
            continue;
        };
        let values: Vec<Cell> = out
            .column_cells(idx)
            .map(|cell| match cell.as_f64() {
                Some(v) => {
                    let y = f(column, v);
                    if y.is_nan() {
                        Cell::Missing
                    } else {
                        Cell::Float(y)
                    }
                }
                None => Cell::Missing,
            })
            .collect();
        out.replace_column(idx, values);
    }
    out
}
