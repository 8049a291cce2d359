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

//! Detection of local minima, including flat minima that span many pixels.
//!
//! A pixel belongs to a local minimum if none of its neighbours is strictly
//! lower *and* none of the pixels it is connected to through a chain of equal
//! values has a strictly lower neighbour. Conceptually this is a relaxation:
//! start with every pixel marked as a candidate and keep demoting candidates
//! until nothing changes anymore.

use ndarray as nd;

use crate::error::WatershedResult;
use crate::{check_field, check_shapes, Connectivity, CANDIDATE, UNASSIGNED};

/// Counters describing a single run of the minima relaxation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MinimaSummary {
  /// Number of pixels that ended up marked as `CANDIDATE`
  pub minima: usize,
  /// Pixels demoted in the parallel pass because they have a lower neighbour
  pub seeded: usize,
  /// Pixels demoted afterwards because an equal neighbour had been demoted
  pub propagated: usize,
}

/// Returns a mask with the same shape as `field` where every pixel that is part
/// of a local minimum is set to `CANDIDATE` (1) and all other pixels are set to
/// `UNASSIGNED` (0).
pub fn find_minima(
  field: nd::ArrayView2<f64>,
  connectivity: Connectivity,
) -> WatershedResult<nd::Array2<usize>> {
  let mut mask = nd::Array2::<usize>::zeros(field.dim());
  relax_minima(field, mask.view_mut(), connectivity)?;
  Ok(mask)
}

/// In-place version of [`find_minima`]. Whatever `mask` contained before is
/// overwritten.
///
/// The relaxation is carried out in two steps:
/// 1. a parallel pass demotes every pixel that has a strictly lower neighbour.
///    Each pixel only writes to itself and only reads the (immutable) field, so
///    this pass can be done concurrently without a second buffer.
/// 2. demotions are then propagated over plateaus with a work stack. A candidate
///    next to an equal-valued demoted pixel is demoted and pushed in turn. This
///    yields exactly the fixpoint of repeated full passes, without having to
///    sweep the whole grid once for every pixel of the widest plateau.
pub fn relax_minima(
  field: nd::ArrayView2<f64>,
  mut mask: nd::ArrayViewMut2<usize>,
  connectivity: Connectivity,
) -> WatershedResult<MinimaSummary> {
  check_field(field)?;
  check_shapes(field, mask.view())?;
  let shape = field.dim();

  //(1) Seed: everything with a strictly lower neighbour is no minimum
  nd::Zip::indexed(&mut mask).par_for_each(|idx, px| {
    let here = field[idx];
    let has_lower = connectivity.neighbours(&idx, shape).into_iter().any(|n| field[n] < here);
    *px = if has_lower { UNASSIGNED } else { CANDIDATE };
  });

  let mut stack: Vec<(usize, usize)> =
    mask.indexed_iter().filter(|&(_, &px)| px == UNASSIGNED).map(|(idx, _)| idx).collect();
  let seeded = stack.len();
  log::trace!("minima relaxation: {seeded} pixels have a lower neighbour");

  //(2) Propagate non-minimality across plateaus
  let mut propagated = 0;
  while let Some(idx) = stack.pop() {
    let here = field[idx];
    for neighbour in connectivity.neighbours(&idx, shape) {
      if mask[neighbour] == CANDIDATE && field[neighbour] == here {
        mask[neighbour] = UNASSIGNED;
        propagated += 1;
        stack.push(neighbour);
      }
    }
  }

  let minima = mask.len() - seeded - propagated;
  log::debug!(
    "found {minima} minimum pixel(s) ({propagated} plateau pixel(s) demoted by propagation)"
  );
  Ok(MinimaSummary { minima, seeded, propagated })
}
