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

//! Error types for the segmentation engine

use thiserror::Error;

/// Errors that can occur while configuring or running a watershed segmentation.
///
/// Configuration errors are returned by `TransformBuilder::build()` before any
/// grid is touched. All other variants abort the run; no partially segmented
/// grid is ever handed back alongside an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WatershedError {
  /// Connectivity has to be either 4 or 8
  #[error("invalid connectivity: expected 4 or 8, got {0}")]
  InvalidConnectivity(u8),

  /// A drain limit of zero would discard every basin seed
  #[error("the maximum number of drains must be at least 1")]
  ZeroDrainLimit,

  /// The elevation field has no pixels
  #[error("empty elevation field: no pixels to segment")]
  EmptyField,

  /// NaN values have no place in a totally ordered elevation field
  #[error("elevation at ({row}, {col}) is NaN")]
  NanElevation { row: usize, col: usize },

  /// The pre-processor could not convert a value to `f64`
  #[error("value at ({row}, {col}) cannot be represented as an elevation")]
  UnrepresentableValue { row: usize, col: usize },

  /// Label grid and elevation field have different shapes
  #[error("shape mismatch: elevation field is {field:?}, label grid is {labels:?}")]
  ShapeMismatch { field: (usize, usize), labels: (usize, usize) },

  /// The drain labeler was handed something other than a {0, 1} minima mask
  #[error("label {label} at ({row}, {col}) is not part of a minima mask")]
  NotAMinimaMask { row: usize, col: usize, label: usize },

  /// No local minima were found, so there is nothing to flood from
  #[error("elevation field has no local minima")]
  NoMinima,

  /// Flooding finished with pixels that belong to neither a basin nor a
  /// watershed line. This is a bug in the engine.
  #[error("{count} pixel(s) left unassigned after flooding, first at {first:?}")]
  UnassignedPixels { count: usize, first: (usize, usize) },
}

/// Result type for watershed operations
pub type WatershedResult<T> = Result<T, WatershedError>;
