//! Weight store: every layer packed into one fixed-stride host region.
//!
//! Each layer is stored slab-major: nonzeros are grouped first by output
//! tile (`slab`), then by input row, so the kernel can accumulate one
//! `COL_BLK`-wide tile at a time. All layers share one byte stride sized for
//! the densest layer, which makes rotating device weight slots uniform.
//!
//! Per-layer layout inside the region:
//! ```text
//! ┌─────────────────────────────────────────────┐ 0
//! │ row offsets: i32 × (neurons · n_slab + 1)   │
//! ├─────────────────────────────────────────────┤ cols_offset
//! │ column indices: i32 × max_nnz               │
//! ├─────────────────────────────────────────────┤ vals_offset (8-aligned)
//! │ values: T × max_nnz                         │
//! ├─────────────────────────────────────────────┤ stride (8-aligned)
//! ```

use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;

use crate::dtype::Element;
use crate::error::SpindleError;
use crate::format::{self, SparseEntry};
use crate::tiling::Tiling;
use crate::Result;

const WORD: usize = std::mem::size_of::<u64>();

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Byte layout shared by every packed layer of one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub neurons: usize,
    pub tiling: Tiling,
    /// Largest nonzero count across all layers.
    pub max_nnz: usize,
    /// Size in bytes of one value.
    pub elem_size: usize,
}

impl PackedLayout {
    pub fn new(neurons: usize, tiling: Tiling, max_nnz: usize, elem_size: usize) -> Self {
        Self { neurons, tiling, max_nnz, elem_size }
    }

    /// Length of the row-offset array.
    pub fn row_offsets_len(&self) -> usize {
        self.neurons * self.tiling.n_slab + 1
    }

    /// Byte offset of the column-index array.
    pub fn cols_offset(&self) -> usize {
        self.row_offsets_len() * 4
    }

    /// Byte offset of the value array.
    pub fn vals_offset(&self) -> usize {
        align_up(self.cols_offset() + self.max_nnz * 4, WORD)
    }

    /// Bytes between consecutive layers.
    pub fn stride_bytes(&self) -> usize {
        align_up(self.vals_offset() + self.max_nnz * self.elem_size, WORD)
    }

    /// 64-bit words between consecutive layers.
    pub fn stride_words(&self) -> usize {
        self.stride_bytes() / WORD
    }

    /// Word range of a layer inside the host region.
    pub fn layer_words(&self, layer: usize) -> std::ops::Range<usize> {
        let stride = self.stride_words();
        layer * stride..(layer + 1) * stride
    }

    /// Typed view of one packed layer.
    ///
    /// `words` must be exactly one layer stride, e.g. a device weight slot
    /// or a slice of the host region.
    pub fn view<'a, T: Element>(&self, words: &'a [u64]) -> PackedWeightLayer<'a, T> {
        debug_assert_eq!(words.len(), self.stride_words());
        let bytes: &[u8] = bytemuck::cast_slice(words);
        let row_offsets = bytemuck::cast_slice(&bytes[..self.cols_offset()]);
        let cols = bytemuck::cast_slice(&bytes[self.cols_offset()..self.cols_offset() + self.max_nnz * 4]);
        let vals_start = self.vals_offset();
        let vals = bytemuck::cast_slice(&bytes[vals_start..vals_start + self.max_nnz * self.elem_size]);
        PackedWeightLayer {
            row_offsets,
            cols,
            vals,
            neurons: self.neurons,
            col_blk: self.tiling.col_blk,
            n_slab: self.tiling.n_slab,
        }
    }

    /// Pack one layer's triples into a zeroed slot of `stride_words()` words.
    fn pack_into<T: Element>(&self, entries: &[SparseEntry<T>], words: &mut [u64], path: &Path) -> Result<()> {
        let neurons = self.neurons;
        let col_blk = self.tiling.col_blk;
        if entries.len() > self.max_nnz {
            return Err(SpindleError::malformed(
                path,
                format!("{} entries exceed the packed capacity {}", entries.len(), self.max_nnz),
            ));
        }

        let mut offsets = vec![0i32; self.row_offsets_len()];
        for (i, e) in entries.iter().enumerate() {
            if e.row < 0 || e.row as usize >= neurons || e.col < 0 || e.col as usize >= neurons {
                return Err(SpindleError::malformed(
                    path,
                    format!("record {i}: ({}, {}) outside a {neurons}x{neurons} layer", e.row, e.col),
                ));
            }
            let slab = e.col as usize / col_blk;
            offsets[slab * neurons + e.row as usize + 1] += 1;
        }
        for i in 1..offsets.len() {
            offsets[i] += offsets[i - 1];
        }

        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words);
        let (head, tail) = bytes.split_at_mut(self.cols_offset());
        let row_offsets: &mut [i32] = bytemuck::cast_slice_mut(head);
        row_offsets.copy_from_slice(&offsets);

        let vals_rel = self.vals_offset() - self.cols_offset();
        let (cols_bytes, vals_bytes) = tail.split_at_mut(vals_rel);
        let cols: &mut [i32] = bytemuck::cast_slice_mut(&mut cols_bytes[..self.max_nnz * 4]);
        let vals: &mut [T] = bytemuck::cast_slice_mut(&mut vals_bytes[..self.max_nnz * self.elem_size]);

        // Stable fill: within a (slab, row) bucket entries keep file order.
        let mut cursor = offsets;
        for e in entries {
            let bucket = (e.col as usize / col_blk) * neurons + e.row as usize;
            let at = cursor[bucket] as usize;
            cols[at] = e.col;
            vals[at] = e.value;
            cursor[bucket] += 1;
        }
        Ok(())
    }
}

/// Read-only view of one packed layer.
#[derive(Debug, Clone, Copy)]
pub struct PackedWeightLayer<'a, T> {
    pub row_offsets: &'a [i32],
    pub cols: &'a [i32],
    pub vals: &'a [T],
    pub neurons: usize,
    pub col_blk: usize,
    pub n_slab: usize,
}

impl<'a, T: Element> PackedWeightLayer<'a, T> {
    /// Nonzeros in this layer (excluding padding).
    pub fn nnz(&self) -> usize {
        self.row_offsets.last().copied().unwrap_or(0) as usize
    }

    /// Range into `cols`/`vals` of input row `row` restricted to tile `slab`.
    pub fn bucket(&self, slab: usize, row: usize) -> std::ops::Range<usize> {
        let i = slab * self.neurons + row;
        self.row_offsets[i] as usize..self.row_offsets[i + 1] as usize
    }

    /// Dense `neurons × neurons` copy, row-major by input row.
    pub fn to_dense(&self) -> Vec<T> {
        let mut dense = vec![T::ZERO; self.neurons * self.neurons];
        for slab in 0..self.n_slab {
            for row in 0..self.neurons {
                for e in self.bucket(slab, row) {
                    dense[row * self.neurons + self.cols[e] as usize] += self.vals[e];
                }
            }
        }
        dense
    }
}

/// Host memory holding every packed layer back to back.
///
/// Allocated once and never mutated after load. The runtime page-locks it
/// for the duration of a run so device copies run at full bandwidth.
#[derive(Debug)]
pub struct HostRegion {
    words: Vec<u64>,
}

impl HostRegion {
    fn zeroed(words: usize) -> Self {
        Self { words: vec![0u64; words] }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD
    }
}

/// Owner of all packed layers of a network.
#[derive(Debug, Clone)]
pub struct WeightStore<T> {
    region: Arc<HostRegion>,
    layout: PackedLayout,
    num_layers: usize,
    nnz: Vec<usize>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Element> WeightStore<T> {
    /// Load `num_layers` binary layer files from `dir`, deriving the tiling
    /// from the accelerator's fast memory per block.
    pub fn load(dir: &Path, num_layers: usize, neurons: usize, shared_mem_bytes: usize) -> Result<Self> {
        let tiling = Tiling::derive(neurons, shared_mem_bytes, std::mem::size_of::<T>())?;
        Self::load_with_tiling(dir, num_layers, neurons, tiling)
    }

    /// Load with an explicit tiling.
    pub fn load_with_tiling(dir: &Path, num_layers: usize, neurons: usize, tiling: Tiling) -> Result<Self> {
        if num_layers == 0 {
            return Err(SpindleError::config("a network needs at least one layer"));
        }
        let paths: Vec<_> = (0..num_layers)
            .map(|layer| format::weight_path(dir, neurons, layer))
            .collect();

        // First pass: headers only, to size the shared stride.
        let max_nnz = paths
            .iter()
            .map(|p| format::read_entry_count(p))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);

        let layout = PackedLayout::new(neurons, tiling, max_nnz, std::mem::size_of::<T>());
        tracing::info!(
            "packing {} layers from {}: neurons={}, col_blk={}, n_slab={}, max_nnz={}, stride={} bytes",
            num_layers,
            dir.display(),
            neurons,
            tiling.col_blk,
            tiling.n_slab,
            max_nnz,
            layout.stride_bytes()
        );

        let mut region = HostRegion::zeroed(layout.stride_words() * num_layers);
        let nnz = region
            .words
            .par_chunks_mut(layout.stride_words().max(1))
            .zip(paths.par_iter())
            .map(|(slot, path)| {
                let entries = format::read_entries::<T>(path)?;
                layout.pack_into(&entries, slot, path)?;
                Ok(entries.len())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::assemble(region, layout, nnz))
    }

    /// Build from in-memory triples, one vector per layer.
    pub fn from_entries(layers: &[Vec<SparseEntry<T>>], neurons: usize, tiling: Tiling) -> Result<Self> {
        if layers.is_empty() {
            return Err(SpindleError::config("a network needs at least one layer"));
        }
        let max_nnz = layers.iter().map(Vec::len).max().unwrap_or(0);
        let layout = PackedLayout::new(neurons, tiling, max_nnz, std::mem::size_of::<T>());
        let mut region = HostRegion::zeroed(layout.stride_words() * layers.len());
        let origin = Path::new("<memory>");
        for (slot, entries) in region.words.chunks_mut(layout.stride_words()).zip(layers) {
            layout.pack_into(entries, slot, origin)?;
        }
        let nnz = layers.iter().map(Vec::len).collect();
        Ok(Self::assemble(region, layout, nnz))
    }

    fn assemble(region: HostRegion, layout: PackedLayout, nnz: Vec<usize>) -> Self {
        Self {
            num_layers: nnz.len(),
            region: Arc::new(region),
            layout,
            nnz,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn neurons(&self) -> usize {
        self.layout.neurons
    }

    pub fn tiling(&self) -> Tiling {
        self.layout.tiling
    }

    pub fn layout(&self) -> &PackedLayout {
        &self.layout
    }

    /// Shared handle to the packed host region.
    pub fn region(&self) -> &Arc<HostRegion> {
        &self.region
    }

    /// Nonzeros of each layer.
    pub fn nnz(&self) -> &[usize] {
        &self.nnz
    }

    /// View of one packed layer.
    pub fn layer(&self, layer: usize) -> PackedWeightLayer<'_, T> {
        self.layout.view(&self.region.words[self.layout.layer_words(layer)])
    }

    /// Views of every layer in order.
    pub fn layers(&self) -> impl Iterator<Item = PackedWeightLayer<'_, T>> + '_ {
        (0..self.num_layers).map(move |l| self.layer(l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::write_entries;

    fn identity(n: usize) -> Vec<SparseEntry<f32>> {
        (0..n as i32).map(|i| SparseEntry::new(i, i, 1.0)).collect()
    }

    #[test]
    fn test_layout_alignment() {
        let layout = PackedLayout::new(8, Tiling::with_col_blk(8, 4).unwrap(), 5, 8);
        assert_eq!(layout.row_offsets_len(), 17);
        assert_eq!(layout.cols_offset(), 68);
        assert_eq!(layout.vals_offset(), 88);
        assert_eq!(layout.stride_bytes(), 128);
        assert_eq!(layout.stride_words(), 16);
        assert_eq!(layout.layer_words(2), 32..48);
    }

    #[test]
    fn test_identity_single_slab() {
        let store = WeightStore::from_entries(&[identity(8)], 8, Tiling::with_col_blk(8, 8).unwrap())
            .unwrap();
        let layer = store.layer(0);
        assert_eq!(layer.nnz(), 8);
        assert_eq!(layer.row_offsets, &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(layer.cols, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let dense = layer.to_dense();
        for r in 0..8 {
            for c in 0..8 {
                assert_eq!(dense[r * 8 + c], if r == c { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_slab_major_grouping() {
        // Row 0 hits columns in both slabs; row 1 only slab 1.
        let entries = vec![
            SparseEntry::new(0, 3, 0.5f32),
            SparseEntry::new(1, 2, 2.0),
            SparseEntry::new(0, 0, 1.5),
        ];
        let store =
            WeightStore::from_entries(&[entries], 4, Tiling::with_col_blk(4, 2).unwrap()).unwrap();
        let layer = store.layer(0);
        assert_eq!(layer.row_offsets, &[0, 1, 1, 1, 1, 2, 3, 3, 3]);
        assert_eq!(layer.bucket(0, 0), 0..1);
        assert_eq!((layer.cols[0], layer.vals[0]), (0, 1.5));
        assert_eq!(layer.bucket(1, 0), 1..2);
        assert_eq!((layer.cols[1], layer.vals[1]), (3, 0.5));
        assert_eq!(layer.bucket(1, 1), 2..3);
        assert!(layer.row_offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_uniform_stride_and_padding() {
        let sparse = vec![SparseEntry::new(2, 1, 0.25f64)];
        let dense: Vec<_> = (0..4).flat_map(|r| (0..4).map(move |c| SparseEntry::new(r, c, 1.0f64))).collect();
        let store = WeightStore::from_entries(&[sparse, dense], 4, Tiling::with_col_blk(4, 4).unwrap())
            .unwrap();
        assert_eq!(store.layout().max_nnz, 16);
        assert_eq!(store.nnz(), &[1, 16]);
        assert_eq!(store.region().words().len(), 2 * store.layout().stride_words());

        let first = store.layer(0);
        assert_eq!(first.nnz(), 1);
        assert!(first.vals[1..].iter().all(|&v| v == 0.0));
        assert_eq!(store.layers().map(|l| l.nnz()).collect::<Vec<_>>(), vec![1, 16]);
    }

    #[test]
    fn test_out_of_range_entry() {
        let bad = vec![SparseEntry::new(0, 9, 1.0f32)];
        let err = WeightStore::from_entries(&[bad], 8, Tiling::with_col_blk(8, 8).unwrap()).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = std::env::temp_dir().join(format!("spindle_weights_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_entries(&format::weight_path(&dir, 8, 0), &identity(8)).unwrap();
        write_entries(&format::weight_path(&dir, 8, 1), &identity(8)[..3]).unwrap();

        // 16 bytes of fast memory hold 4 f32 values → two slabs of 4.
        let store = WeightStore::<f32>::load(&dir, 2, 8, 16).unwrap();
        assert_eq!(store.tiling(), Tiling { col_blk: 4, n_slab: 2 });
        assert_eq!(store.nnz(), &[8, 3]);
        assert_eq!(store.layer(1).nnz(), 3);

        let err = WeightStore::<f32>::load(&dir, 3, 8, 16).unwrap_err();
        assert!(matches!(err, SpindleError::Io { .. }), "{err}");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
