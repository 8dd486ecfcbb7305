//! Column tiling of a layer for fast on-chip memory.
//!
//! A layer's output neurons are split into `n_slab` tiles of `col_blk`
//! columns each. The sparse kernel accumulates one tile at a time in fast
//! memory, so a tile must fit the per-block capacity of the accelerator.

use crate::error::SpindleError;
use crate::Result;

/// Column tile width and tile count for one network shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tiling {
    /// Neuron columns per tile (`COL_BLK`).
    pub col_blk: usize,
    /// Tiles covering every neuron (`N_SLAB`).
    pub n_slab: usize,
}

impl Tiling {
    /// Derive tiling from the accelerator's fast memory per block.
    ///
    /// The whole layer is one tile when it fits. Otherwise divisors
    /// `2, 3, 4, …` of `neurons` are tried in order and the first one whose
    /// tile fits wins, which yields the largest fitting tile width.
    pub fn derive(neurons: usize, shared_mem_bytes: usize, elem_size: usize) -> Result<Self> {
        if neurons == 0 {
            return Err(SpindleError::config("cannot tile a layer with zero neurons"));
        }
        if elem_size == 0 {
            return Err(SpindleError::config("element size must be positive"));
        }
        let budget = shared_mem_bytes / elem_size;
        if neurons <= budget {
            return Ok(Self { col_blk: neurons, n_slab: 1 });
        }

        (2..=neurons)
            .find(|d| neurons % d == 0 && neurons / d <= budget)
            .map(|d| Self { col_blk: neurons / d, n_slab: d })
            .ok_or_else(|| {
                SpindleError::config(format!(
                    "no tile width divides {neurons} neurons within {budget} values \
                     ({shared_mem_bytes} bytes of fast memory)"
                ))
            })
    }

    /// Explicit tiling; `col_blk` must divide `neurons`.
    pub fn with_col_blk(neurons: usize, col_blk: usize) -> Result<Self> {
        if col_blk == 0 || neurons == 0 || neurons % col_blk != 0 {
            return Err(SpindleError::config(format!(
                "tile width {col_blk} does not divide {neurons} neurons"
            )));
        }
        Ok(Self { col_blk, n_slab: neurons / col_blk })
    }

    /// Fast-memory bytes one tile occupies.
    pub fn tile_bytes(&self, elem_size: usize) -> usize {
        self.col_blk * elem_size
    }
}
