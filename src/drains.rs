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

//! Turning a minima mask into numbered drains, and pruning them.
//!
//! A *drain* is a connected plateau of minimum pixels. Every drain becomes the
//! seed of exactly one basin during flooding.

use std::collections::BTreeMap;

use ndarray as nd;
use ordered_float::OrderedFloat;

use crate::error::{WatershedError, WatershedResult};
use crate::{check_shapes, recolour, Connectivity, CANDIDATE, UNASSIGNED};

/// A connected plateau of local-minimum pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Drain {
  /// Label of the drain in the label grid. Always positive.
  pub id: usize,
  /// Elevation shared by every pixel of the plateau
  pub elevation: f64,
  /// Number of pixels in the plateau
  pub size: usize,
  /// First pixel of the plateau in raster order
  pub seed: (usize, usize),
}

/// Maximum number of drains that survive selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainLimit {
  /// Keep every drain
  #[default]
  All,
  /// Keep at most this many drains, lowest elevation first
  AtMost(usize),
}

/// Assigns a unique id to every connected component of `CANDIDATE` pixels in
/// `mask`, replacing the candidate value with that id.
///
/// Components are found with a stack-based fill, seeded at the first unvisited
/// candidate in raster order. Ids are handed out in the same order and run
/// from `1` up to and including the number of drains. `mask` must only contain
/// `UNASSIGNED` and `CANDIDATE` values (as produced by `minima::find_minima`).
pub fn label_drains(
  field: nd::ArrayView2<f64>,
  mut mask: nd::ArrayViewMut2<usize>,
  connectivity: Connectivity,
) -> WatershedResult<BTreeMap<usize, Drain>> {
  check_shapes(field, mask.view())?;
  if let Some(((row, col), &label)) =
    mask.indexed_iter().find(|&(_, &px)| px != UNASSIGNED && px != CANDIDATE)
  {
    return Err(WatershedError::NotAMinimaMask { row, col, label });
  }
  let shape = field.dim();

  /*
    Ids are written straight into the mask, so they must not collide with the
    CANDIDATE value of pixels we have not visited yet. We therefore start
    counting at CANDIDATE + 1 and shift everything down once we're done.
  */
  let mut next_id = CANDIDATE + 1;
  let mut drains = BTreeMap::new();

  for row in 0..shape.0 {
    for col in 0..shape.1 {
      if mask[(row, col)] != CANDIDATE {
        continue;
      }
      let tmp_id = next_id;
      next_id += 1;

      //Grow the plateau
      mask[(row, col)] = tmp_id;
      let mut stack = vec![(row, col)];
      let mut size = 0;
      while let Some(px) = stack.pop() {
        size += 1;
        for neighbour in connectivity.neighbours(&px, shape) {
          if mask[neighbour] == CANDIDATE {
            mask[neighbour] = tmp_id;
            stack.push(neighbour);
          }
        }
      }

      let id = tmp_id - CANDIDATE;
      drains.insert(id, Drain { id, elevation: field[(row, col)], size, seed: (row, col) });
    }
  }

  //Shift temporary ids down to 1..=n. UNASSIGNED maps onto itself.
  let colour_map: Vec<usize> =
    (0..next_id).map(|tmp| if tmp == UNASSIGNED { UNASSIGNED } else { tmp - CANDIDATE }).collect();
  recolour(mask, &colour_map);

  log::debug!("labelled {} drain(s)", drains.len());
  Ok(drains)
}

/// Keeps only the lowest drains, as configured by `limit`.
///
/// Drains are ranked by elevation; drains at the same elevation are ranked by
/// their original id (i.e. raster order). Pixels of discarded drains are reset
/// to `UNASSIGNED`. The survivors are renumbered to `1..=k`, keeping the
/// relative order of their original ids, both in `labels` and in the returned
/// map.
///
/// Selection never creates or merges drains and is idempotent: selecting again
/// with the same limit leaves grid and map untouched. A limit of zero is an
/// error, unless there are no drains at all.
pub fn select_drains(
  labels: nd::ArrayViewMut2<usize>,
  drains: BTreeMap<usize, Drain>,
  limit: DrainLimit,
) -> WatershedResult<BTreeMap<usize, Drain>> {
  let max = match limit {
    DrainLimit::All => drains.len(),
    DrainLimit::AtMost(0) if !drains.is_empty() => return Err(WatershedError::ZeroDrainLimit),
    DrainLimit::AtMost(max) => max,
  };

  //Rank the drains, lowest first
  let mut ranked: Vec<&Drain> = drains.values().collect();
  ranked.sort_by_key(|drain| (OrderedFloat(drain.elevation), drain.id));
  ranked.truncate(max);

  let mut survivors: Vec<usize> = ranked.into_iter().map(|drain| drain.id).collect();
  survivors.sort_unstable();

  /*
    Build a colour map from old to new ids. Everything not mentioned in the map
    (i.e. discarded drains) is mapped to UNASSIGNED.
  */
  let top = drains.keys().next_back().copied().unwrap_or(UNASSIGNED);
  let mut colour_map = vec![UNASSIGNED; top + 1];
  let mut kept = BTreeMap::new();
  for (new_id, old_id) in survivors.into_iter().enumerate().map(|(idx, old)| (idx + 1, old)) {
    colour_map[old_id] = new_id;
    if let Some(drain) = drains.get(&old_id) {
      kept.insert(new_id, Drain { id: new_id, ..drain.clone() });
    }
  }

  //Identity maps happen a lot (nothing pruned, ids already dense)
  if colour_map.iter().enumerate().any(|(old, &new)| old != new) {
    recolour(labels, &colour_map);
  }

  log::debug!("kept {} of {} drain(s)", kept.len(), drains.len());
  Ok(kept)
}
