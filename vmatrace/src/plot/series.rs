// Fractions and seconds are for plotting; precision loss is irrelevant
#![allow(clippy::cast_precision_loss)]

//! Plot series collection
//!
//! [`SeriesCollector`] folds plot events into per-application series and
//! writes one tab-separated file per (plot, application) pair:
//!
//! | Plot | Rows |
//! |---|---|
//! | `vma-count`, `vm-size`, `rss` | `seconds value`, summed over the group |
//! | `page-faults`, `cpu-time` | `seconds cumulative` |
//! | `ops-by-kind` | `op anon file guard libs` |
//! | `ops-by-module` | `module operations bytes` |
//! | `vma-size-cdf`, `vma-lifetime-cdf` | `value fraction` |
//! | `checkpoints` | `seconds name` |

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::event::PlotEvent;
use super::sink::PlotEventSink;
use crate::classification::VmaKind;
use crate::domain::{ExportError, Tgid, Timestamp};
use crate::export::{sanitize_component, write_text};
use crate::vma::VmaOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlotKind {
    VmaCount,
    VmSize,
    Rss,
    PageFaults,
    CpuTime,
    OpsByKind,
    OpsByModule,
    VmaSizeCdf,
    VmaLifetimeCdf,
    Checkpoints,
}

impl PlotKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PlotKind::VmaCount => "vma-count",
            PlotKind::VmSize => "vm-size",
            PlotKind::Rss => "rss",
            PlotKind::PageFaults => "page-faults",
            PlotKind::CpuTime => "cpu-time",
            PlotKind::OpsByKind => "ops-by-kind",
            PlotKind::OpsByModule => "ops-by-module",
            PlotKind::VmaSizeCdf => "vma-size-cdf",
            PlotKind::VmaLifetimeCdf => "vma-lifetime-cdf",
            PlotKind::Checkpoints => "checkpoints",
        }
    }

    const TIME_SERIES: [PlotKind; 5] =
        [PlotKind::VmaCount, PlotKind::VmSize, PlotKind::Rss, PlotKind::PageFaults, PlotKind::CpuTime];
}

#[derive(Debug, Default)]
struct AppSeries {
    /// Latest gauge value per process, and the running group total
    latest: HashMap<(PlotKind, Tgid), u64>,
    totals: HashMap<PlotKind, u64>,
    points: BTreeMap<PlotKind, Vec<(Timestamp, u64)>>,
    ops_by_kind: BTreeMap<VmaOp, [u64; 4]>,
    ops_by_module: BTreeMap<String, (u64, u64)>,
    alloc_sizes: Vec<u64>,
    lifetimes: Vec<u64>,
    checkpoints: Vec<(Timestamp, String)>,
}

impl AppSeries {
    fn gauge(&mut self, kind: PlotKind, tgid: Tgid, timestamp: Timestamp, value: u64) {
        let old = self.latest.insert((kind, tgid), value).unwrap_or(0);
        let total = self.totals.entry(kind).or_default();
        *total = (*total - old.min(*total)) + value;
        let total = *total;
        self.points.entry(kind).or_default().push((timestamp, total));
    }

    fn accumulate(&mut self, kind: PlotKind, timestamp: Timestamp, delta: u64) {
        let total = self.totals.entry(kind).or_default();
        *total += delta;
        let total = *total;
        self.points.entry(kind).or_default().push((timestamp, total));
    }
}

/// Collects plot series for every application
#[derive(Debug, Default)]
pub struct SeriesCollector {
    apps: BTreeMap<String, AppSeries>,
}

impl SeriesCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apps(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    /// Points of a time series plot
    #[must_use]
    pub fn series(&self, app: &str, kind: PlotKind) -> &[(Timestamp, u64)] {
        self.apps
            .get(app)
            .and_then(|a| a.points.get(&kind))
            .map_or(&[], Vec::as_slice)
    }

    /// Write every plot of every application under `dir`
    ///
    /// # Errors
    /// Returns `ExportError::WriteFailed` for the first file that cannot be
    /// written.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
        let mut written = Vec::new();
        for (app, series) in &self.apps {
            let app_part = sanitize_component(app);
            let mut emit = |kind: PlotKind, text: String| -> Result<(), ExportError> {
                if text.is_empty() {
                    return Ok(());
                }
                let path = dir.join(format!("{}-{app_part}.tsv", kind.as_str()));
                write_text(&path, &text)?;
                written.push(path);
                Ok(())
            };

            for kind in PlotKind::TIME_SERIES {
                let mut text = String::new();
                for (ts, value) in series.points.get(&kind).into_iter().flatten() {
                    let _ = writeln!(text, "{ts}\t{value}");
                }
                emit(kind, text)?;
            }

            let mut text = String::new();
            if !series.ops_by_kind.is_empty() {
                let header: Vec<&str> = VmaKind::ALL.iter().map(|k| k.as_str()).collect();
                let _ = writeln!(text, "op\t{}", header.join("\t"));
                for (op, counts) in &series.ops_by_kind {
                    let cols: Vec<String> = counts.iter().map(u64::to_string).collect();
                    let _ = writeln!(text, "{op}\t{}", cols.join("\t"));
                }
            }
            emit(PlotKind::OpsByKind, text)?;

            let mut modules: Vec<_> = series.ops_by_module.iter().collect();
            modules.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let mut text = String::new();
            for (module, (ops, bytes)) in modules {
                let _ = writeln!(text, "{module}\t{ops}\t{bytes}");
            }
            emit(PlotKind::OpsByModule, text)?;

            emit(PlotKind::VmaSizeCdf, cdf_text(&series.alloc_sizes))?;
            emit(PlotKind::VmaLifetimeCdf, cdf_text(&series.lifetimes))?;

            let mut text = String::new();
            for (ts, name) in &series.checkpoints {
                let _ = writeln!(text, "{ts}\t{name}");
            }
            emit(PlotKind::Checkpoints, text)?;
        }
        Ok(written)
    }
}

impl PlotEventSink for SeriesCollector {
    fn consume(&mut self, event: &PlotEvent, tgid: Tgid, appname: &str) {
        let app = self.apps.entry(appname.to_string()).or_default();
        match event {
            PlotEvent::VmaCount { timestamp, count } => {
                app.gauge(PlotKind::VmaCount, tgid, *timestamp, *count as u64);
            }
            PlotEvent::VmSize { timestamp, bytes } => {
                app.gauge(PlotKind::VmSize, tgid, *timestamp, *bytes);
            }
            PlotEvent::Rss { timestamp, pages } => {
                app.gauge(PlotKind::Rss, tgid, *timestamp, pages.iter().sum());
            }
            PlotEvent::PageMapped { timestamp, .. } => {
                app.accumulate(PlotKind::PageFaults, *timestamp, 1);
            }
            PlotEvent::Quantum { start, end, .. } => {
                app.accumulate(PlotKind::CpuTime, *end, end.saturating_since(*start));
            }
            PlotEvent::Operation { op, kind, length, module, .. } => {
                let idx = VmaKind::ALL.iter().position(|k| k == kind).unwrap_or(0);
                app.ops_by_kind.entry(*op).or_default()[idx] += 1;
                if !module.is_empty() {
                    let entry = app.ops_by_module.entry(module.clone()).or_default();
                    entry.0 += 1;
                    entry.1 += length;
                }
                if *op == VmaOp::Alloc {
                    app.alloc_sizes.push(*length);
                }
            }
            PlotEvent::Unmapped { lifetime_ns, op, .. } => {
                if *op == crate::vma::UnmapOp::Free {
                    app.lifetimes.push(*lifetime_ns);
                }
            }
            PlotEvent::Checkpoint { timestamp, name } => {
                if !app.checkpoints.iter().any(|(ts, n)| ts == timestamp && n == name) {
                    app.checkpoints.push((*timestamp, name.clone()));
                }
            }
        }
    }
}

/// `value fraction` rows of the empirical CDF of `values`
fn cdf_text(values: &[u64]) -> String {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len() as f64;
    let mut text = String::new();
    for (i, value) in sorted.iter().enumerate() {
        // one row per distinct value, at its last occurrence
        if sorted.get(i + 1) == Some(value) {
            continue;
        }
        let _ = writeln!(text, "{value}\t{:.6}", (i + 1) as f64 / n);
    }
    text
}
