/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of rustronomy-catchment.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-catchment is a pure-rust implementation of a drain-seeded
//! watershed segmentation. It partitions a (smoothed) elevation field into
//! catchment basins, each rooted at a local minimum, separated by watershed
//! lines where competing basins meet.
//!
//! # How it works
//! The segmentation is carried out in three stages, each of which is also
//! available as a stand-alone function:
//! 1. *minima detection* ([`minima`]): find every pixel that belongs to a local
//! minimum. Flat minima spanning many pixels are detected as a whole.
//! 2. *drain labelling and selection* ([`drains`]): every connected plateau of
//! minimum pixels becomes a numbered *drain*. Optionally, only the lowest drains
//! are kept.
//! 3. *flooding* ([`flood`]): the drains are grown into basins in strict
//! ascending-elevation order. Pixels claimed by two basins become part of a
//! watershed line and are labelled with the [`CONFLICT`] sentinel.
//!
//! # Quickstart
//! To use the latest release of Rustronomy-catchment in a cargo project, add
//! the rustronomy-catchment crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-catchment = "0.1.0"
//! ```
//!
//! ## Short example: segmenting a field with two basins
//! `rustronomy-catchment` uses the "builder pattern" to configure the
//! segmentation before executing it. Create a `TransformBuilder`, set the options
//! you need and call `build()` to get a (`Sync`&`Send`) watershed object.
//! ```rust
//! use ndarray as nd;
//! use rustronomy_catchment::prelude::*;
//!
//! let field = nd::array![
//!   [9.0, 9.0, 9.0, 9.0, 9.0],
//!   [9.0, 1.0, 9.0, 2.0, 9.0],
//!   [9.0, 9.0, 9.0, 9.0, 9.0],
//! ];
//! let watershed = TransformBuilder::new()
//!   .set_connectivity(Connectivity::Four)
//!   .build()
//!   .unwrap();
//! let segmentation = watershed.segment(field.view()).unwrap();
//!
//! assert_eq!(segmentation.drains.len(), 2);
//! assert!(segmentation.labels.iter().all(|&label| label != UNASSIGNED));
//! ```
//!
//! ## Unreachable pockets
//! With 4-connectivity, watershed lines can wall off small pockets of pixels
//! that no basin ever floods. By default this makes `segment()` fail with
//! `WatershedError::UnassignedPixels`. Use
//! `set_pocket_policy(PocketPolicy::Resolve)` to give such pockets to the basin
//! around them (or to the watershed line, if several basins border them).
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! Jemalloc is enabled though usage of the `jemalloc` crate, which increases
//! compile times considerably. To compile `rustronomy-catchment` with the
//! `jemalloc` feature, jemalloc must be installed on the host system.
//! - `progress`: this feature enables a progress bar for the flooding stage.
//! Enabling this feature adds the `indicatif` crate as a dependency.
//! - `debug`: this feature collects timings and counters for every stage and
//! emits them as a performance report through the `log` facade. Enabling this
//! feature does not add additional dependencies.
//!
//! # Logging
//! This crate logs through the [`log`](https://docs.rs/log) facade. It never
//! installs a logger itself.

//Unconditional imports
use std::collections::BTreeMap;

use ndarray as nd;
use num_traits::ToPrimitive;
use rayon::prelude::*;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

pub mod drains;
pub mod error;
pub mod flood;
pub mod minima;

use drains::{Drain, DrainLimit};
use error::{WatershedError, WatershedResult};
use flood::{FloodReport, PocketPolicy};

/// Label of pixels that have not been assigned to anything (yet)
pub const UNASSIGNED: usize = 0;
/// Label of minimum candidates; only used while detecting minima
pub const CANDIDATE: usize = 1;
/// Label of watershed-line pixels, where two basins met. Larger than any
/// valid drain id.
pub const CONFLICT: usize = usize::MAX;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::drains::{Drain, DrainLimit};
  pub use crate::error::{WatershedError, WatershedResult};
  pub use crate::flood::{FloodReport, PocketPolicy};
  pub use crate::{
    Connectivity, Segmentation, Stage, TransformBuilder, Watershed, WatershedUtils, CONFLICT,
    UNASSIGNED,
  };
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
pub(crate) fn set_up_bar(pixels: usize) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] flooded {pos}/{len}{bar:60}";
  let bar = indicatif::ProgressBar::new(pixels as u64);
  if let Ok(style) = indicatif::ProgressStyle::with_template(TEMPLATE) {
    bar.set_style(style);
  }
  bar
}

#[inline]
fn neighbours_8con(index: &(usize, usize), shape: (usize, usize)) -> Vec<(usize, usize)> {
  let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
  let (w, h): (isize, isize) = (shape.0 as isize, shape.1 as isize);
  [
    (x + 1, y),
    (x + 1, y + 1),
    (x + 1, y - 1),
    (x, y + 1),
    (x, y - 1),
    (x - 1, y),
    (x - 1, y + 1),
    (x - 1, y - 1),
  ]
  .iter()
  .filter_map(|&(x, y)| {
    if x < 0 || y < 0 || x >= w || y >= h {
      None
    } else {
      Some((x as usize, y as usize))
    }
  })
  .collect()
}

#[inline]
fn neighbours_4con(index: &(usize, usize), shape: (usize, usize)) -> Vec<(usize, usize)> {
  let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
  let (w, h): (isize, isize) = (shape.0 as isize, shape.1 as isize);
  [(x + 1, y), (x, y + 1), (x, y - 1), (x - 1, y)]
    .iter()
    .filter_map(|&(x, y)| {
      if x < 0 || y < 0 || x >= w || y >= h {
        None
      } else {
        Some((x as usize, y as usize))
      }
    })
    .collect()
}

/// Replaces every label by its entry in the colour map. Labels that fall
/// outside of the map (such as `CONFLICT`) are left alone.
#[inline(always)]
pub(crate) fn recolour(canvas: nd::ArrayViewMut2<usize>, colour_map: &[usize]) {
  canvas.into_par_iter().for_each(|col| {
    if let Some(&new) = colour_map.get(*col) {
      *col = new
    }
  })
}

#[inline(always)]
pub(crate) fn is_basin(label: usize) -> bool {
  label != UNASSIGNED && label != CONFLICT
}

/// Checks that the elevation field can be segmented at all
pub(crate) fn check_field(field: nd::ArrayView2<f64>) -> WatershedResult<()> {
  if field.is_empty() {
    return Err(WatershedError::EmptyField);
  }
  match field.indexed_iter().find(|(_, x)| x.is_nan()) {
    Some(((row, col), _)) => Err(WatershedError::NanElevation { row, col }),
    None => Ok(()),
  }
}

pub(crate) fn check_shapes(
  field: nd::ArrayView2<f64>,
  labels: nd::ArrayView2<usize>,
) -> WatershedResult<()> {
  if field.dim() == labels.dim() {
    Ok(())
  } else {
    Err(WatershedError::ShapeMismatch { field: field.dim(), labels: labels.dim() })
  }
}

/// Which pixels count as neighbours of a pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Connectivity {
  /// Only the pixels sharing an edge
  Four,
  /// Pixels sharing an edge or a corner
  #[default]
  Eight,
}

impl Connectivity {
  /// Returns the in-bounds neighbours of `index` in a grid of size `shape`
  #[inline]
  pub fn neighbours(self, index: &(usize, usize), shape: (usize, usize)) -> Vec<(usize, usize)> {
    match self {
      Connectivity::Four => neighbours_4con(index, shape),
      Connectivity::Eight => neighbours_8con(index, shape),
    }
  }
}

impl TryFrom<u8> for Connectivity {
  type Error = WatershedError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      4 => Ok(Connectivity::Four),
      8 => Ok(Connectivity::Eight),
      other => Err(WatershedError::InvalidConnectivity(other)),
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub minima_ms: usize,
    pub labelling_ms: usize,
    pub selection_ms: usize,
    pub flooding_ms: usize,
    pub minima: usize,
    pub drains_found: usize,
    pub drains_kept: usize,
    pub pops: usize,
    pub conflicts: usize,
    pub pocket_pixels: usize,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn stage_total(&self) -> usize {
      self.minima_ms + self.labelling_ms + self.selection_ms + self.flooding_ms
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  Minima: {}ms ({} px)", self.minima_ms, self.minima)?;
      writeln!(f, ">  Labelling: {}ms ({} drains)", self.labelling_ms, self.drains_found)?;
      writeln!(f, ">  Selection: {}ms ({} drains kept)", self.selection_ms, self.drains_kept)?;
      writeln!(
        f,
        ">  Flooding: {}ms ({} pops, {} conflicts, {} pocket px)",
        self.flooding_ms, self.pops, self.conflicts, self.pocket_pixels
      )?;
      writeln!(f, ">--------------------------------+ total")?;
      writeln!(
        f,
        ">  {}ms with {}ms overhead (Δt)",
        self.total_ms,
        self.total_ms.saturating_sub(self.stage_total())
      )
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                          WATERSHED TRANSFORMS                              //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Default)]
/// Builder for configuring a watershed segmentation.
///
/// Use the `new()` associated function to start configuring a segmentation.
/// Once you have set the desired options, a watershed object can be generated
/// with the `build()` associated function. This returns a trait object of the
/// type `Box<dyn Watershed + Send + Sync>`, which can be shared between threads.
///
/// By default, pixels are 8-way connected, all drains are kept and pixels the
/// flood cannot reach make the segmentation fail.
pub struct TransformBuilder {
  connectivity: Connectivity,
  drain_limit: DrainLimit,
  pocket_policy: PocketPolicy,
}

impl TransformBuilder {
  /// creates a new `TransformBuilder` with the default configuration
  pub fn new() -> Self {
    TransformBuilder::default()
  }

  /// Set which pixels count as neighbours. The same connectivity is used by
  /// every stage of the segmentation.
  pub fn set_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  /// Keep at most `max_drains` drains (the lowest ones) as basin seeds. Setting
  /// this to zero makes `build()` fail.
  pub fn set_max_drains(mut self, max_drains: usize) -> Self {
    self.drain_limit = DrainLimit::AtMost(max_drains);
    self
  }

  /// Use every drain as a basin seed (this is the default).
  pub fn keep_all_drains(mut self) -> Self {
    self.drain_limit = DrainLimit::All;
    self
  }

  /// Set what happens to pockets of pixels that no basin could flood. See
  /// [`PocketPolicy`] for the options.
  pub fn set_pocket_policy(mut self, policy: PocketPolicy) -> Self {
    self.pocket_policy = policy;
    self
  }

  /// Build a `Box<dyn Watershed + Send + Sync>` from the current builder
  /// configuration. Returns an `Err` if the configuration can never yield a
  /// valid segmentation.
  pub fn build(self) -> WatershedResult<Box<dyn Watershed + Send + Sync>> {
    if self.drain_limit == DrainLimit::AtMost(0) {
      return Err(WatershedError::ZeroDrainLimit);
    }
    Ok(Box::new(SegmentingWatershed {
      connectivity: self.connectivity,
      drain_limit: self.drain_limit,
      pocket_policy: self.pocket_policy,
    }))
  }
}

/// This trait contains useful functions for preparing images to be used as input
/// for a watershed segmentation
pub trait WatershedUtils {
  /// The `pre_processor` function converts an array of any numeric data-type
  /// `T` into an `f64` elevation field.
  ///
  /// The segmentation relies on elevations being totally ordered, so values
  /// that cannot be represented as an `f64`, or that are `NaN`, are rejected.
  /// Infinities are fine: they are simply very high (or very low) pixels.
  fn pre_processor<T>(&self, img: nd::ArrayView2<T>) -> WatershedResult<nd::Array2<f64>>
  where
    T: ToPrimitive + Copy,
  {
    let mut field = nd::Array2::<f64>::zeros(img.dim());
    for ((row, col), x) in img.indexed_iter() {
      let float = x.to_f64().ok_or(WatershedError::UnrepresentableValue { row, col })?;
      if float.is_nan() {
        return Err(WatershedError::NanElevation { row, col });
      }
      field[(row, col)] = float;
    }
    Ok(field)
  }

  /// returns a vec of the positions of all the pixels that are part of a local
  /// minimum, in raster order. Pixels of a flat minimum are all returned.
  fn find_local_minima(
    &self,
    img: nd::ArrayView2<f64>,
    connectivity: Connectivity,
  ) -> WatershedResult<Vec<(usize, usize)>> {
    let mask = minima::find_minima(img, connectivity)?;
    Ok(mask.indexed_iter().filter(|&(_, &px)| px == CANDIDATE).map(|(idx, _)| idx).collect())
  }
}

/// Stages of the segmentation, in the order they are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
  /// Minimum pixels marked with `CANDIDATE`
  Minima,
  /// Every minimum plateau labelled with its drain id
  Drains,
  /// Only the selected drains remain, renumbered
  Selected,
  /// Final segmentation
  Flooded,
}

/// Output of a watershed segmentation.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
  /// Basin id of every pixel, or `CONFLICT` for watershed-line pixels
  pub labels: nd::Array2<usize>,
  /// The drains that seeded the basins, by id
  pub drains: BTreeMap<usize, Drain>,
  /// Counters from the flooding stage
  pub report: FloodReport,
}

impl Segmentation {
  /// Number of watershed-line pixels
  pub fn conflict_count(&self) -> usize {
    self.labels.iter().filter(|&&label| label == CONFLICT).count()
  }

  /// Elevation of the drain behind every basin id. Handy for colour-coding.
  pub fn drain_elevations(&self) -> BTreeMap<usize, f64> {
    self.drains.iter().map(|(&id, drain)| (id, drain.elevation)).collect()
  }

  /// Number of pixels in every basin. Every surviving drain is listed, and
  /// watershed-line pixels are not counted.
  pub fn basin_areas(&self) -> BTreeMap<usize, usize> {
    let mut areas: BTreeMap<usize, usize> = self.drains.keys().map(|&id| (id, 0)).collect();
    for label in self.labels.iter() {
      if let Some(area) = areas.get_mut(label) {
        *area += 1;
      }
    }
    areas
  }
}

/// Actual trait for performing the watershed segmentation. This trait is
/// dyn-safe, which means that trait objects may be constructed from it.
pub trait Watershed {
  /// Returns the segmentation of the input elevation field.
  fn segment(&self, field: nd::ArrayView2<f64>) -> WatershedResult<Segmentation>;

  /// Returns a snapshot of the label grid after every stage of the
  /// segmentation.
  ///
  /// **Caution**: this function allocates a full label grid for every stage.
  fn segment_history(
    &self,
    field: nd::ArrayView2<f64>,
  ) -> WatershedResult<Vec<(Stage, nd::Array2<usize>)>>;

  /// Returns the area (in pixels) of every basin, by basin id.
  fn basin_areas(&self, field: nd::ArrayView2<f64>) -> WatershedResult<BTreeMap<usize, usize>> {
    Ok(self.segment(field)?.basin_areas())
  }
}

impl WatershedUtils for dyn Watershed {}
impl WatershedUtils for dyn Watershed + Send + Sync {}

/// Implementation of the drain-seeded segmenting watershed algorithm.
///
/// See crate-level documentation for a general introduction to the algorithm.
///
/// Basins grow from the selected drains in a single global order of ascending
/// elevation. A pixel joins a basin when the basin pixel being processed is
/// where water on that pixel would flow first. When two basins claim the
/// same pixel before it has been processed, it becomes part of a watershed line.
///
/// # Memory usage
/// The segmentation allocates an `Array2<usize>` of the same size as the input
/// field, plus a priority queue and a state table for the flood frontier. One
/// can count on the memory usage being about ~3x the size of the input array.
///
/// # Output
/// Every pixel of the output is labelled with the id of a surviving drain or
/// with `CONFLICT`. Ids run from 1 to the number of surviving drains. Pixels
/// the flood could not reach either fail the segmentation or are settled
/// afterwards, depending on the configured [`PocketPolicy`].
pub struct SegmentingWatershed {
  connectivity: Connectivity,
  drain_limit: DrainLimit,
  pocket_policy: PocketPolicy,
}

impl SegmentingWatershed {
  fn run(
    &self,
    field: nd::ArrayView2<f64>,
    mut snapshot: impl FnMut(Stage, nd::ArrayView2<usize>),
  ) -> WatershedResult<Segmentation> {
    #[cfg(feature = "debug")]
    let mut perf = crate::performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let run_start = std::time::Instant::now();

    //(1) Find all minimum pixels
    #[cfg(feature = "debug")]
    let stage_start = std::time::Instant::now();
    let mut labels = nd::Array2::<usize>::zeros(field.dim());
    let _summary = minima::relax_minima(field, labels.view_mut(), self.connectivity)?;
    snapshot(Stage::Minima, labels.view());
    #[cfg(feature = "debug")]
    {
      perf.minima_ms = stage_start.elapsed().as_millis() as usize;
      perf.minima = _summary.minima;
    }

    //(2) Turn the minima into drains
    #[cfg(feature = "debug")]
    let stage_start = std::time::Instant::now();
    let found = drains::label_drains(field, labels.view_mut(), self.connectivity)?;
    if found.is_empty() {
      //Unreachable for a non-empty, NaN-free field
      return Err(WatershedError::NoMinima);
    }
    snapshot(Stage::Drains, labels.view());
    #[cfg(feature = "debug")]
    {
      perf.labelling_ms = stage_start.elapsed().as_millis() as usize;
      perf.drains_found = found.len();
    }

    //(3) Throw away all but the lowest drains
    #[cfg(feature = "debug")]
    let stage_start = std::time::Instant::now();
    let kept = drains::select_drains(labels.view_mut(), found, self.drain_limit)?;
    snapshot(Stage::Selected, labels.view());
    #[cfg(feature = "debug")]
    {
      perf.selection_ms = stage_start.elapsed().as_millis() as usize;
      perf.drains_kept = kept.len();
    }

    //(4) Flood the basins
    #[cfg(feature = "debug")]
    let stage_start = std::time::Instant::now();
    let report =
      flood::flood_basins(field, labels.view_mut(), self.connectivity, self.pocket_policy)?;
    snapshot(Stage::Flooded, labels.view());
    #[cfg(feature = "debug")]
    {
      perf.flooding_ms = stage_start.elapsed().as_millis() as usize;
      perf.pops = report.pops;
      perf.conflicts = report.conflicts;
      perf.pocket_pixels = report.pocket_pixels;
      perf.total_ms = run_start.elapsed().as_millis() as usize;
      log::debug!("{perf}");
    }

    Ok(Segmentation { labels, drains: kept, report })
  }
}

impl Watershed for SegmentingWatershed {
  fn segment(&self, field: nd::ArrayView2<f64>) -> WatershedResult<Segmentation> {
    self.run(field, |_, _| {})
  }

  fn segment_history(
    &self,
    field: nd::ArrayView2<f64>,
  ) -> WatershedResult<Vec<(Stage, nd::Array2<usize>)>> {
    let mut history = Vec::with_capacity(4);
    self.run(field, |stage, labels| history.push((stage, labels.to_owned())))?;
    Ok(history)
  }
}
