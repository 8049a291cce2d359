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

use ndarray as nd;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rustronomy_catchment::{drains, flood, minima, prelude::*};

const X: usize = CONFLICT;
const CONNECTIVITIES: [Connectivity; 2] = [Connectivity::Four, Connectivity::Eight];

/// Random field with few distinct values, so that there are plenty of plateaus
fn plateau_field() -> nd::Array2<f64> {
  nd::Array2::<u8>::random((40, 50), Uniform::new(0, 4)).mapv(f64::from)
}

fn five_drains() -> nd::Array2<f64> {
  let mut field = nd::Array2::<f64>::from_elem((3, 11), 30.);
  for (col, depth) in [(1, 10.), (3, 12.), (5, 12.), (7, 15.), (9, 20.)] {
    field[(1, col)] = depth;
  }
  field
}

////////////////////////////////////////////////////////////////////////////////
//                                  MINIMA                                    //
////////////////////////////////////////////////////////////////////////////////

#[test]
fn test_minima_plateau_closure() {
  let field = plateau_field();
  for connectivity in CONNECTIVITIES {
    let mask = minima::find_minima(field.view(), connectivity).unwrap();
    for (idx, &px) in mask.indexed_iter() {
      assert!(px == 0 || px == 1);
      let neighbours = connectivity.neighbours(&idx, field.dim());
      if px == 1 {
        //No lower neighbour, and no equal neighbour that is not a minimum
        assert!(neighbours.iter().all(|&n| field[n] >= field[idx]));
        assert!(neighbours.iter().all(|&n| field[n] != field[idx] || mask[n] == 1));
      } else {
        //Either a lower neighbour, or an equal neighbour that is not a minimum
        assert!(neighbours
          .iter()
          .any(|&n| field[n] < field[idx] || (field[n] == field[idx] && mask[n] == 0)));
      }
    }
  }
}

/// Slow reference: demote candidates one full sweep at a time until nothing
/// changes anymore
fn minima_by_sweeping(field: &nd::Array2<f64>, connectivity: Connectivity) -> nd::Array2<usize> {
  let mut mask = nd::Array2::<usize>::ones(field.dim());
  let mut changed = true;
  while changed {
    changed = false;
    for row in 0..field.nrows() {
      for col in 0..field.ncols() {
        let here = field[(row, col)];
        let demote = mask[(row, col)] == 1
          && connectivity
            .neighbours(&(row, col), field.dim())
            .into_iter()
            .any(|n| field[n] < here || (field[n] == here && mask[n] == 0));
        if demote {
          mask[(row, col)] = 0;
          changed = true;
        }
      }
    }
  }
  mask
}

#[test]
fn test_minima_match_sweeping() {
  for _ in 0..8 {
    let field = plateau_field();
    for connectivity in CONNECTIVITIES {
      let mask = minima::find_minima(field.view(), connectivity).unwrap();
      assert_eq!(mask, minima_by_sweeping(&field, connectivity));
    }
  }
}

#[test]
fn test_minima_keep_flat_minimum() {
  let field = nd::array![[5., 5., 5., 5.], [5., 2., 2., 5.], [5., 5., 5., 1.]];

  //The plateau at 2 only touches the 1 diagonally
  let four = minima::find_minima(field.view(), Connectivity::Four).unwrap();
  assert_eq!(four, nd::array![[0, 0, 0, 0], [0, 1, 1, 0], [0, 0, 0, 1]]);
  let eight = minima::find_minima(field.view(), Connectivity::Eight).unwrap();
  assert_eq!(eight, nd::array![[0, 0, 0, 0], [0, 0, 0, 0], [0, 0, 0, 1]]);
}

#[test]
fn test_minima_flat_propagation() {
  let field = nd::array![[3., 3., 3., 3., 1.]];
  let mut mask = nd::Array2::<usize>::ones((1, 5));
  let summary = minima::relax_minima(field.view(), mask.view_mut(), Connectivity::Four).unwrap();

  assert_eq!(mask, nd::array![[0, 0, 0, 0, 1]]);
  assert_eq!(summary, minima::MinimaSummary { minima: 1, seeded: 1, propagated: 3 });
}

#[test]
fn test_minima_shape_mismatch() {
  let field = nd::Array2::<f64>::zeros((3, 3));
  let mut mask = nd::Array2::<usize>::zeros((3, 4));
  assert_eq!(
    minima::relax_minima(field.view(), mask.view_mut(), Connectivity::Four),
    Err(WatershedError::ShapeMismatch { field: (3, 3), labels: (3, 4) })
  );
}

////////////////////////////////////////////////////////////////////////////////
//                                  DRAINS                                    //
////////////////////////////////////////////////////////////////////////////////

#[test]
fn test_diagonal_drains() {
  let field = nd::array![[1., 9.], [9., 1.]];

  let mut four = minima::find_minima(field.view(), Connectivity::Four).unwrap();
  let found = drains::label_drains(field.view(), four.view_mut(), Connectivity::Four).unwrap();
  assert_eq!(found.len(), 2);
  assert_eq!(four, nd::array![[1, 0], [0, 2]]);

  let mut eight = minima::find_minima(field.view(), Connectivity::Eight).unwrap();
  let found = drains::label_drains(field.view(), eight.view_mut(), Connectivity::Eight).unwrap();
  assert_eq!(found.len(), 1);
  assert_eq!(found[&1], Drain { id: 1, elevation: 1., size: 2, seed: (0, 0) });
  assert_eq!(eight, nd::array![[1, 0], [0, 1]]);
}

#[test]
fn test_drains_are_components() {
  let field = plateau_field();
  for connectivity in CONNECTIVITIES {
    let mask = minima::find_minima(field.view(), connectivity).unwrap();
    let mut labels = mask.clone();
    let found = drains::label_drains(field.view(), labels.view_mut(), connectivity).unwrap();

    //Ids are dense and every id is used
    assert_eq!(found.keys().copied().collect::<Vec<_>>(), (1..=found.len()).collect::<Vec<_>>());
    assert_eq!(labels.iter().max().copied().unwrap_or(0), found.len());

    //Minimum pixels got an id, everything else stayed unassigned
    for (idx, &label) in labels.indexed_iter() {
      assert_eq!(label == UNASSIGNED, mask[idx] == 0);
      //Neighbouring minimum pixels share their id
      for n in connectivity.neighbours(&idx, field.dim()) {
        if label != UNASSIGNED && labels[n] != UNASSIGNED {
          assert_eq!(label, labels[n]);
        }
      }
    }

    //Drain bookkeeping matches the grid
    for (id, drain) in found.iter() {
      assert_eq!(labels[drain.seed], *id);
      assert_eq!(field[drain.seed], drain.elevation);
      assert_eq!(labels.iter().filter(|&&label| label == *id).count(), drain.size);
    }
  }
}

#[test]
fn test_label_drains_needs_a_mask() {
  let field = nd::Array2::<f64>::zeros((2, 2));
  let mut labels = nd::array![[0, 1], [7, 1]];
  assert_eq!(
    drains::label_drains(field.view(), labels.view_mut(), Connectivity::Four),
    Err(WatershedError::NotAMinimaMask { row: 1, col: 0, label: 7 })
  );
}

#[test]
fn test_select_lowest_drain() {
  let field = five_drains();
  let mut labels = minima::find_minima(field.view(), Connectivity::Four).unwrap();
  let found = drains::label_drains(field.view(), labels.view_mut(), Connectivity::Four).unwrap();
  let elevations: Vec<f64> = found.values().map(|drain| drain.elevation).collect();
  assert_eq!(elevations, vec![10., 12., 12., 15., 20.]);

  let kept = drains::select_drains(labels.view_mut(), found, DrainLimit::AtMost(1)).unwrap();
  assert_eq!(kept.len(), 1);
  assert_eq!(kept[&1].elevation, 10.);
  assert_eq!(labels.iter().filter(|&&label| label != UNASSIGNED).count(), 1);
  assert_eq!(labels[(1, 1)], 1);
}

#[test]
fn test_select_breaks_ties_by_id() {
  let field = five_drains();
  let mut labels = minima::find_minima(field.view(), Connectivity::Four).unwrap();
  let found = drains::label_drains(field.view(), labels.view_mut(), Connectivity::Four).unwrap();

  let kept = drains::select_drains(labels.view_mut(), found, DrainLimit::AtMost(2)).unwrap();
  assert_eq!(kept[&1].seed, (1, 1));
  assert_eq!(kept[&2].seed, (1, 3));
  assert_eq!(labels.row(1), nd::array![0, 1, 0, 2, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_select_is_idempotent() {
  let field = plateau_field();
  let mut labels = minima::find_minima(field.view(), Connectivity::Four).unwrap();
  let found = drains::label_drains(field.view(), labels.view_mut(), Connectivity::Four).unwrap();
  let total = found.len();

  let limit = DrainLimit::AtMost(5);
  let once = drains::select_drains(labels.view_mut(), found, limit).unwrap();
  assert_eq!(once.len(), total.min(5));
  let labels_once = labels.clone();

  let twice = drains::select_drains(labels.view_mut(), once.clone(), limit).unwrap();
  assert_eq!(once, twice);
  assert_eq!(labels, labels_once);
}

#[test]
fn test_select_zero_drains() {
  let mut labels = nd::array![[0, 1], [0, 0]];
  let found = [(1, Drain { id: 1, elevation: 0., size: 1, seed: (0, 1) })].into_iter().collect();
  assert_eq!(
    drains::select_drains(labels.view_mut(), found, DrainLimit::AtMost(0)),
    Err(WatershedError::ZeroDrainLimit)
  );

  //Nothing to discard, so nothing to complain about
  let mut empty = nd::Array2::<usize>::zeros((2, 2));
  let kept = drains::select_drains(empty.view_mut(), Default::default(), DrainLimit::AtMost(0));
  assert_eq!(kept, Ok(Default::default()));
}

////////////////////////////////////////////////////////////////////////////////
//                                 FLOODING                                   //
////////////////////////////////////////////////////////////////////////////////

#[test]
fn test_flood_leaves_nothing_unassigned() {
  let field = plateau_field();
  for connectivity in CONNECTIVITIES {
    for limit in [DrainLimit::All, DrainLimit::AtMost(1), DrainLimit::AtMost(7)] {
      let mut labels = minima::find_minima(field.view(), connectivity).unwrap();
      let found = drains::label_drains(field.view(), labels.view_mut(), connectivity).unwrap();
      let kept = drains::select_drains(labels.view_mut(), found, limit).unwrap();
      let resolve = PocketPolicy::Resolve;
      flood::flood_basins(field.view(), labels.view_mut(), connectivity, resolve).unwrap();

      assert!(labels.iter().all(|&label| label == X || kept.contains_key(&label)));
      //Drains keep their own label
      for drain in kept.values() {
        assert_eq!(labels[drain.seed], drain.id);
      }
    }
  }
}

#[test]
fn test_flood_pops_each_pixel_once() {
  let field = plateau_field();
  for connectivity in CONNECTIVITIES {
    let mut labels = minima::find_minima(field.view(), connectivity).unwrap();
    drains::label_drains(field.view(), labels.view_mut(), connectivity).unwrap();

    //Pixels can only be popped if they start on the frontier or get claimed
    let unassigned = labels.iter().filter(|&&label| label == UNASSIGNED).count();
    let boundary = labels
      .indexed_iter()
      .filter(|&(idx, &label)| {
        label != UNASSIGNED
          && connectivity.neighbours(&idx, field.dim()).iter().any(|&n| labels[n] == UNASSIGNED)
      })
      .count();

    let resolve = PocketPolicy::Resolve;
    let report =
      flood::flood_basins(field.view(), labels.view_mut(), connectivity, resolve).unwrap();
    assert!(report.pops <= boundary + unassigned);
    assert!(report.pops + report.pocket_pixels >= unassigned - report.conflicts);
  }
}

#[test]
fn test_flood_enclosed_pocket() {
  /*
    With 4-connectivity, the pixel in the bottom-right corner is only reachable
    through pixels that end up on watershed lines, so the main flood never gets
    to it.
  */
  let field = nd::array![[9., 0., 2.], [2., 2., 7.], [9., 1., 8.], [0., 5., 8.]];
  let mut labels = minima::find_minima(field.view(), Connectivity::Four).unwrap();
  let found = drains::label_drains(field.view(), labels.view_mut(), Connectivity::Four).unwrap();
  assert_eq!(found.len(), 3);

  //By default the unreachable pixel is an error
  let mut failed = labels.clone();
  let fail = PocketPolicy::Fail;
  assert_eq!(
    flood::flood_basins(field.view(), failed.view_mut(), Connectivity::Four, fail),
    Err(WatershedError::UnassignedPixels { count: 1, first: (3, 2) })
  );

  //...unless pockets get resolved: (3, 2) borders no basin, only conflicts
  let resolve = PocketPolicy::Resolve;
  let report =
    flood::flood_basins(field.view(), labels.view_mut(), Connectivity::Four, resolve).unwrap();
  assert_eq!(labels, nd::array![[1, 1, 1], [1, X, 1], [X, 2, X], [3, X, X]]);
  assert_eq!(report.pocket_pixels, 1);
  assert_eq!(report.conflicts, 4);
}

#[test]
fn test_flood_needs_a_drain() {
  let field = nd::Array2::<f64>::zeros((3, 3));
  let mut labels = nd::Array2::<usize>::zeros((3, 3));
  let fail = PocketPolicy::Fail;
  assert_eq!(
    flood::flood_basins(field.view(), labels.view_mut(), Connectivity::Eight, fail),
    Err(WatershedError::NoMinima)
  );

  let mut wrong = nd::Array2::<usize>::ones((2, 3));
  assert_eq!(
    flood::flood_basins(field.view(), wrong.view_mut(), Connectivity::Eight, fail),
    Err(WatershedError::ShapeMismatch { field: (3, 3), labels: (2, 3) })
  );
}
