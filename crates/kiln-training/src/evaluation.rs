//! Qualitative comparison grids and reduced-precision exports.
//!
//! Neither operation touches existing checkpoints; both only add files.

use crate::checkpoint::{CheckpointRef, CheckpointStore, WriteMode};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::CheckpointLayout;
use crate::snapshot::{CheckpointFile, StorageDtype};
use kiln_abstraction::{Tensor, TrainableModel};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use tracing::info;

/// Cells in the comparison grid.
pub const GRID_CELLS: usize = 4;
const GRID_SIDE: usize = 2;

/// Puts a model in inference mode and returns it to training mode on drop.
struct EvalMode<'a, M: TrainableModel + ?Sized> {
    model: &'a mut M,
}

impl<'a, M: TrainableModel + ?Sized> EvalMode<'a, M> {
    fn enter(model: &'a mut M) -> Self {
        model.set_eval_mode();
        Self { model }
    }
}

impl<M: TrainableModel + ?Sized> Deref for EvalMode<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: TrainableModel + ?Sized> DerefMut for EvalMode<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut *self.model
    }
}

impl<M: TrainableModel + ?Sized> Drop for EvalMode<'_, M> {
    fn drop(&mut self) {
        self.model.set_train_mode();
    }
}

/// Generates outputs for up to four `samples` and writes them as a 2×2 grid to
/// the comparison path under `layout`, replacing any previous grid.
///
/// Samples past the fourth are ignored. The model is back in training mode
/// when this returns, whether generation succeeded or not.
pub fn compare<M>(
    model: &mut M,
    samples: &[Tensor],
    layout: &CheckpointLayout,
) -> TrainingResult<PathBuf>
where
    M: TrainableModel + ?Sized,
{
    if samples.is_empty() {
        return Err(TrainingError::Render("at least one sample is required".to_string()));
    }

    let outputs = {
        let mut model = EvalMode::enter(model);
        samples
            .iter()
            .take(GRID_CELLS)
            .enumerate()
            .map(|(i, sample)| {
                model
                    .generate(sample)
                    .map_err(|e| TrainingError::Render(format!("sample {i}: {e}")))
            })
            .collect::<TrainingResult<Vec<_>>>()?
    };

    let image = render_grid(&outputs)?;
    let path = layout.comparison_path();
    write_atomic(layout, &path, &image.to_ppm())?;
    info!(path = %path.display(), samples = outputs.len(), "Wrote comparison grid");
    Ok(path)
}

/// An RGB raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[u8; 3]>,
}

impl Image {
    fn black(width: usize, height: usize) -> Self {
        Self { width, height, pixels: vec![[0; 3]; width * height] }
    }

    /// Binary PPM (P6) encoding.
    #[must_use]
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.pixels.len() * 3);
        for px in &self.pixels {
            out.extend_from_slice(px);
        }
        out
    }
}

/// Tile geometry of a generated output: `(height, width, channels)`.
fn tile_shape(t: &Tensor) -> TrainingResult<(usize, usize, usize)> {
    match *t.shape() {
        [w] => Ok((1, w, 1)),
        [h, w] => Ok((h, w, 1)),
        [h, w, c @ (1 | 3)] => Ok((h, w, c)),
        ref other => {
            Err(TrainingError::Render(format!("cannot render output of shape {other:?}")))
        }
    }
}

fn to_byte(v: f32) -> u8 {
    if v.is_nan() {
        return 0;
    }
    ((v.clamp(-1.0, 1.0) + 1.0) * 127.5).round() as u8
}

/// Lays out up to four equally shaped outputs row-major in a 2×2 grid.
/// Values in `[-1, 1]` map to `0..=255`; unused cells stay black.
pub fn render_grid(outputs: &[Tensor]) -> TrainingResult<Image> {
    let first = outputs
        .first()
        .ok_or_else(|| TrainingError::Render("nothing to render".to_string()))?;
    let (h, w, c) = tile_shape(first)?;
    if h == 0 || w == 0 {
        return Err(TrainingError::Render("generated output is empty".to_string()));
    }

    let mut image = Image::black(w * GRID_SIDE, h * GRID_SIDE);
    for (cell, tile) in outputs.iter().take(GRID_CELLS).enumerate() {
        if tile_shape(tile)? != (h, w, c) {
            return Err(TrainingError::Render(format!(
                "output {cell} has shape {:?}, expected {:?}",
                tile.shape(),
                first.shape()
            )));
        }
        let (oy, ox) = ((cell / GRID_SIDE) * h, (cell % GRID_SIDE) * w);
        let data = tile.data();
        for y in 0..h {
            for x in 0..w {
                let base = (y * w + x) * c;
                let px = if c == 3 {
                    [to_byte(data[base]), to_byte(data[base + 1]), to_byte(data[base + 2])]
                } else {
                    [to_byte(data[base]); 3]
                };
                image.pixels[(oy + y) * image.width + ox + x] = px;
            }
        }
    }
    Ok(image)
}

fn write_atomic(
    layout: &CheckpointLayout,
    path: &std::path::Path,
    bytes: &[u8],
) -> TrainingResult<()> {
    let staging = layout.staging_path(path);
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&staging, path)
    };
    write().map_err(|e| {
        let _ = std::fs::remove_file(&staging);
        TrainingError::storage(path, e)
    })
}

/// Writes an IEEE half-precision copy of `ckpt` next to it, with an `_fp16`
/// suffix.
///
/// The copy keeps the source's sequence number and creation time, so
/// exporting the same checkpoint twice yields byte-identical files and the
/// second export replaces the first. The source is not modified.
pub fn export_reduced_precision(
    store: &CheckpointStore,
    ckpt: &CheckpointRef,
) -> TrainingResult<CheckpointRef> {
    let source = store.read_file(ckpt)?;
    let state = source
        .decode()
        .map_err(|reason| TrainingError::corrupt(&ckpt.label.to_string(), reason))?;

    let reduced =
        CheckpointFile::encode(ckpt.label, ckpt.seq, &state, StorageDtype::F16, source.created_at);
    let path = store.layout().reduced_path(ckpt.seq, &ckpt.label);
    store.write_file(&path, &reduced, WriteMode::Replace)?;
    info!(label = %ckpt.label, path = %path.display(), "Exported reduced-precision checkpoint");

    Ok(CheckpointRef { seq: ckpt.seq, label: ckpt.label, path, dtype: StorageDtype::F16 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_mapping() {
        assert_eq!(to_byte(-1.0), 0);
        assert_eq!(to_byte(1.0), 255);
        assert_eq!(to_byte(0.0), 128);
        assert_eq!(to_byte(7.0), 255);
        assert_eq!(to_byte(f32::NAN), 0);
    }

    #[test]
    fn test_grid_places_tiles_and_leaves_empty_cells_black() {
        let white = Tensor::new(vec![2, 2], vec![1.0; 4]).unwrap();
        let image = render_grid(&[white.clone(), white]).unwrap();
        assert_eq!((image.width, image.height), (4, 4));
        // top row is two white tiles, bottom row is empty
        assert!(image.pixels[..8].iter().all(|px| *px == [255; 3]));
        assert!(image.pixels[8..].iter().all(|px| *px == [0; 3]));
    }

    #[test]
    fn test_rgb_tiles() {
        let red = Tensor::new(vec![1, 1, 3], vec![1.0, -1.0, -1.0]).unwrap();
        let image = render_grid(&[red]).unwrap();
        assert_eq!(image.pixels[0], [255, 0, 0]);
    }

    #[test]
    fn test_mismatched_tiles_rejected() {
        let a = Tensor::zeros(vec![2, 2]);
        let b = Tensor::zeros(vec![3, 3]);
        assert!(matches!(render_grid(&[a, b]), Err(TrainingError::Render(_))));
    }

    #[test]
    fn test_ppm_header() {
        let image = Image::black(3, 2);
        let ppm = image.to_ppm();
        assert!(ppm.starts_with(b"P6\n3 2\n255\n"));
        assert_eq!(ppm.len(), b"P6\n3 2\n255\n".len() + 18);
    }
}
