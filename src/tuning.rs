//! Previously tuned tiling factors for convolution kernels, keyed by shape signature.

use crate::common::DimSize;

use itertools::Itertools;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum TuningError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode tuned parameters: {0}")]
    Serde(#[from] bincode::Error),
    #[error("Malformed entry for {signature:?}: {reason}")]
    Malformed { signature: String, reason: String },
}

/// The lookup key for a kernel's tuned parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeSignature(String);

impl ShapeSignature {
    /// The key of a direct convolution: padded input, weight, and output shapes in that order.
    pub fn conv(input_pad: &[DimSize], weights: &[DimSize], output: &[DimSize]) -> Self {
        let dims = input_pad
            .iter()
            .chain(weights)
            .chain(output)
            .map(|d| d.get())
            .join(" ");
        ShapeSignature(format!("CudaDirectConvSchedule {dims}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split factors for each axis of a direct convolution, outermost first.
///
/// The first factor of each list stands in for the `-1` (inferred) split slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvFactors {
    pub x: [i32; 4],
    pub y: [i32; 4],
    pub f: [i32; 4],
    pub rx: [i32; 2],
    pub ry: [i32; 2],
    pub rc: [i32; 2],
}

/// Signature to axis name to factor list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunedParams {
    entries: HashMap<ShapeSignature, BTreeMap<String, Vec<i32>>>,
}

impl TunedParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table compiled into the crate. It holds the ResNet-50 stem convolution.
    pub fn builtin() -> Self {
        let mut params = TunedParams::new();
        params.insert(
            ShapeSignature::conv(
                &crate::shape![1, 3, 230, 230],
                &crate::shape![64, 3, 7, 7],
                &crate::shape![1, 64, 112, 112],
            ),
            [
                ("x", vec![1, 7, 16, 1]),
                ("y", vec![112, 1, 1, 1]),
                ("f", vec![1, 4, 8, 2]),
                ("rx", vec![1, 7]),
                ("ry", vec![7, 1]),
                ("rc", vec![3, 1]),
            ]
            .into_iter()
            .map(|(axis, factors)| (axis.to_owned(), factors))
            .collect(),
        );
        params
    }

    pub fn get(&self, signature: &ShapeSignature) -> Option<&BTreeMap<String, Vec<i32>>> {
        self.entries.get(signature)
    }

    pub fn contains(&self, signature: &ShapeSignature) -> bool {
        self.entries.contains_key(signature)
    }

    pub fn insert(&mut self, signature: ShapeSignature, axes: BTreeMap<String, Vec<i32>>) {
        self.entries.insert(signature, axes);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the convolution factors for `signature`, or `None` when it was never tuned.
    ///
    /// An entry that exists but lacks an axis, has the wrong number of factors, or has a
    /// non-positive factor is an error.
    pub fn conv_factors(
        &self,
        signature: &ShapeSignature,
    ) -> Result<Option<ConvFactors>, TuningError> {
        let Some(axes) = self.entries.get(signature) else {
            return Ok(None);
        };
        fn axis<const N: usize>(
            signature: &ShapeSignature,
            axes: &BTreeMap<String, Vec<i32>>,
            name: &str,
        ) -> Result<[i32; N], TuningError> {
            let malformed = |reason: String| TuningError::Malformed {
                signature: signature.to_string(),
                reason,
            };
            let factors = axes
                .get(name)
                .ok_or_else(|| malformed(format!("missing axis {name}")))?;
            if factors.iter().any(|&f| f <= 0) {
                return Err(malformed(format!(
                    "axis {name} has non-positive factors {factors:?}"
                )));
            }
            <[i32; N]>::try_from(factors.as_slice()).map_err(|_| {
                malformed(format!(
                    "axis {name} has {} factors, expected {N}",
                    factors.len()
                ))
            })
        }
        Ok(Some(ConvFactors {
            x: axis(signature, axes, "x")?,
            y: axis(signature, axes, "y")?,
            f: axis(signature, axes, "f")?,
            rx: axis(signature, axes, "rx")?,
            ry: axis(signature, axes, "ry")?,
            rc: axis(signature, axes, "rc")?,
        }))
    }

    pub fn load(path: &Path) -> Result<Self, TuningError> {
        let start = Instant::now();
        let file = std::fs::File::open(path)?;
        let decoder = snap::read::FrameDecoder::new(file);
        let params: TunedParams = bincode::deserialize_from(decoder)?;
        log::info!(
            "Loaded {} tuned entries from {} in {:?}",
            params.len(),
            path.display(),
            start.elapsed()
        );
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<(), TuningError> {
        let file = std::fs::File::create(path)?;
        let encoder = snap::write::FrameEncoder::new(file);
        bincode::serialize_into(encoder, self)?;
        log::debug!("Saved {} tuned entries to {}", self.len(), path.display());
        Ok(())
    }
}

/// Process-wide tuned parameters, initialized at most once and read-only afterwards.
///
/// Concurrent first callers race to initialize; exactly one initializer runs and every caller
/// observes its result.
pub struct TunedParamCache {
    cell: OnceCell<TunedParams>,
}

impl TunedParamCache {
    pub const fn new() -> Self {
        TunedParamCache {
            cell: OnceCell::new(),
        }
    }

    /// The parameters, if already initialized.
    pub fn get(&self) -> Option<&TunedParams> {
        self.cell.get()
    }

    pub fn get_or_init(&self, init: impl FnOnce() -> TunedParams) -> &TunedParams {
        self.cell.get_or_init(init)
    }

    /// Like [TunedParamCache::get_or_init], but a failed initializer leaves the cache empty.
    pub fn get_or_try_init(
        &self,
        init: impl FnOnce() -> Result<TunedParams, TuningError>,
    ) -> Result<&TunedParams, TuningError> {
        self.cell.get_or_try_init(init)
    }
}

impl Default for TunedParamCache {
    fn default() -> Self {
        Self::new()
    }
}

pub static CUDA_CONV_PARAMS: TunedParamCache = TunedParamCache::new();
