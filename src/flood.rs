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

//! Growing basins out of the surviving drains.
//!
//! Basins grow in a single, global, ascending-elevation order. This is what
//! keeps the flood physically meaningful: the lowest pixel on the boundary of
//! *any* basin always spills over first. Growing basins independently (or in
//! parallel) changes where two basins meet, so this stage is strictly
//! sequential.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use ndarray as nd;
use ordered_float::OrderedFloat;

use crate::error::{WatershedError, WatershedResult};
use crate::{check_field, check_shapes, is_basin, Connectivity, CONFLICT, UNASSIGNED};

/// Counters describing a single flood
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FloodReport {
  /// Number of frontier pixels that were processed
  pub pops: usize,
  /// Number of pixels demoted to `CONFLICT` where two growing basins collided
  pub conflicts: usize,
  /// Number of pixels in enclosed pockets settled after the main flood. Always
  /// zero unless pockets are resolved.
  pub pocket_pixels: usize,
}

/// What to do with pixels the flood could not reach.
///
/// Dropping conflicts from the frontier can wall off pockets of unassigned
/// pixels that no live basin pixel borders anymore. This mostly happens with
/// 4-connectivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PocketPolicy {
  /// Report leftover pixels as [`WatershedError::UnassignedPixels`]
  #[default]
  Fail,
  /// Give each pocket to the single basin bordering it, or turn it into
  /// `CONFLICT` if it borders no basin or several basins
  Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PxState {
  Idle,
  Pending,
  Flooded,
  Removed,
}

/// Worklist of basin pixels that may still spill into their neighbours,
/// ordered by ascending elevation. Pixels of equal elevation come out in
/// insertion order.
///
/// Membership and removal go through a per-pixel state table, so they are
/// O(1). Removed pixels stay in the heap and are discarded when they surface.
struct Frontier {
  heap: BinaryHeap<Reverse<(OrderedFloat<f64>, u64, usize)>>,
  state: Vec<PxState>,
  insertions: u64,
}

impl Frontier {
  fn new(pixels: usize) -> Self {
    Frontier { heap: BinaryHeap::new(), state: vec![PxState::Idle; pixels], insertions: 0 }
  }

  fn push(&mut self, px: usize, elevation: f64) {
    self.heap.push(Reverse((OrderedFloat(elevation), self.insertions, px)));
    self.insertions += 1;
    self.state[px] = PxState::Pending;
  }

  /// Pops the lowest pending pixel. The pixel stays pending until it is
  /// explicitly marked as flooded.
  fn pop(&mut self) -> Option<usize> {
    while let Some(Reverse((_, _, px))) = self.heap.pop() {
      if self.state[px] == PxState::Pending {
        return Some(px);
      }
    }
    None
  }

  fn contains(&self, px: usize) -> bool {
    self.state[px] == PxState::Pending
  }

  fn remove(&mut self, px: usize) {
    if self.contains(px) {
      self.state[px] = PxState::Removed;
    }
  }

  fn mark_flooded(&mut self, px: usize) {
    self.state[px] = PxState::Flooded;
  }

  fn is_flooded(&self, px: usize) -> bool {
    self.state[px] == PxState::Flooded
  }
}

/// Returns true if water at `q` would run towards a pixel at elevation `level`
/// before it runs anywhere else.
///
/// Only neighbours of `q` that still take part in the flood are compared: they
/// carry a drain id and have not been flooded yet. Flooded pixels count as
/// infinitely high; unassigned and `CONFLICT` pixels do not drain anywhere.
fn is_upstream(
  field: nd::ArrayView2<f64>,
  labels: nd::ArrayView2<usize>,
  frontier: &Frontier,
  connectivity: Connectivity,
  q: (usize, usize),
  level: f64,
) -> bool {
  let (shape, cols) = (field.dim(), field.ncols());
  connectivity.neighbours(&q, shape).into_iter().filter(|&r| r != q).all(|r| {
    let competes = is_basin(labels[r]) && !frontier.is_flooded(r.0 * cols + r.1);
    !competes || field[r] >= level
  })
}

/// Grows every drain in `labels` into a full basin.
///
/// On entry `labels` holds drain ids and `UNASSIGNED` pixels (the output of
/// drain selection). On success every pixel holds either a drain id or
/// `CONFLICT`; the latter marks the watershed lines where basins met.
///
/// The frontier starts out as every drain pixel with at least one unassigned
/// neighbour. The lowest frontier pixel `p` is processed first: each neighbour
/// `q` that is upstream of `p` and still up for grabs is either claimed for the
/// basin of `p`, or, if a different basin claimed it earlier but it has not been
/// processed yet, demoted to `CONFLICT` and dropped from the frontier.
///
/// Dropping conflicts can leave pockets of unassigned pixels that no live basin
/// pixel borders anymore. With [`PocketPolicy::Fail`] these are reported as
/// [`WatershedError::UnassignedPixels`]. With [`PocketPolicy::Resolve`] each
/// pocket joins the basin around it if exactly one basin borders it, and
/// becomes part of the watershed line otherwise.
pub fn flood_basins(
  field: nd::ArrayView2<f64>,
  mut labels: nd::ArrayViewMut2<usize>,
  connectivity: Connectivity,
  policy: PocketPolicy,
) -> WatershedResult<FloodReport> {
  check_field(field)?;
  check_shapes(field, labels.view())?;
  if !labels.iter().any(|&label| is_basin(label)) {
    return Err(WatershedError::NoMinima);
  }
  let shape = field.dim();
  let cols = field.ncols();
  let flat = |(row, col): (usize, usize)| row * cols + col;
  let unflat = |px: usize| (px / cols, px % cols);

  //(1) Collect the initial frontier in raster order
  let mut frontier = Frontier::new(field.len());
  let boundary: Vec<(usize, usize)> = labels
    .indexed_iter()
    .filter(|&(idx, &label)| {
      is_basin(label)
        && connectivity.neighbours(&idx, shape).into_iter().any(|n| labels[n] == UNASSIGNED)
    })
    .map(|(idx, _)| idx)
    .collect();
  log::trace!("initial frontier holds {} pixel(s)", boundary.len());

  //Every pixel is popped at most once: either it starts in the frontier or it
  //enters it when claimed
  #[cfg(feature = "progress")]
  let bar = crate::set_up_bar(
    boundary.len() + labels.iter().filter(|&&label| label == UNASSIGNED).count(),
  );

  for idx in boundary {
    frontier.push(flat(idx), field[idx]);
  }

  //(2) Flood, lowest pixel first
  let mut report = FloodReport::default();
  while let Some(px) = frontier.pop() {
    report.pops += 1;
    #[cfg(feature = "progress")]
    bar.inc(1);

    let p = unflat(px);
    let label = labels[p];
    if !is_basin(label) {
      //Lost its label since it was queued; nothing to spill
      frontier.mark_flooded(px);
      continue;
    }
    let level = field[p];

    for q in connectivity.neighbours(&p, shape) {
      let q_px = flat(q);
      let q_label = labels[q];
      let claimable = q_label == UNASSIGNED || (frontier.contains(q_px) && is_basin(q_label));
      if !claimable || !is_upstream(field, labels.view(), &frontier, connectivity, q, level) {
        continue;
      }

      if q_label == UNASSIGNED {
        labels[q] = label;
        frontier.push(q_px, field[q]);
      } else if q_label != label {
        //Two basins reach the same pixel: it becomes part of a watershed line
        labels[q] = CONFLICT;
        frontier.remove(q_px);
        report.conflicts += 1;
      }
    }

    frontier.mark_flooded(px);
  }

  #[cfg(feature = "progress")]
  bar.finish_and_clear();

  //(3) Settle pockets that the flood could not reach, if asked to
  if policy == PocketPolicy::Resolve {
    report.pocket_pixels = resolve_pockets(labels.view_mut(), connectivity);
    if report.pocket_pixels > 0 {
      log::debug!("resolved {} pixel(s) in enclosed pockets", report.pocket_pixels);
    }
  }

  //(4) Every pixel has to be accounted for
  let unassigned = labels.iter().filter(|&&label| label == UNASSIGNED).count();
  if let Some((first, _)) = labels.indexed_iter().find(|&(_, &label)| label == UNASSIGNED) {
    return Err(WatershedError::UnassignedPixels { count: unassigned, first });
  }

  log::debug!("flooded grid with {} pops and {} conflict(s)", report.pops, report.conflicts);
  Ok(report)
}

/// Assigns every connected component of unassigned pixels to the single basin
/// bordering it, or to `CONFLICT` if it borders no basin or several basins.
/// Returns the number of pixels that were assigned.
fn resolve_pockets(mut labels: nd::ArrayViewMut2<usize>, connectivity: Connectivity) -> usize {
  let shape = labels.dim();
  let mut visited = nd::Array2::<bool>::from_elem(shape, false);
  let mut resolved = 0;

  for row in 0..shape.0 {
    for col in 0..shape.1 {
      if labels[(row, col)] != UNASSIGNED || visited[(row, col)] {
        continue;
      }

      //Collect the pocket and the basins around it
      let mut pocket = vec![(row, col)];
      let mut bordering = BTreeSet::new();
      let mut stack = vec![(row, col)];
      visited[(row, col)] = true;
      while let Some(px) = stack.pop() {
        for neighbour in connectivity.neighbours(&px, shape) {
          let label = labels[neighbour];
          if label == UNASSIGNED && !visited[neighbour] {
            visited[neighbour] = true;
            pocket.push(neighbour);
            stack.push(neighbour);
          } else if is_basin(label) {
            bordering.insert(label);
          }
        }
      }

      let fill = match (bordering.len(), bordering.first()) {
        (1, Some(&basin)) => basin,
        _ => CONFLICT,
      };
      log::trace!("pocket of {} pixel(s) at ({row}, {col}) set to {fill}", pocket.len());
      resolved += pocket.len();
      pocket.into_iter().for_each(|px| labels[px] = fill);
    }
  }

  resolved
}
