//! Tensor memory accelerator
//!
//! Descriptors are opaque handles into a table owned by the device. Each
//! entry keeps the encoding loads currently see and, after an out-of-band
//! replacement, the encoding that becomes visible at the next fence.
//!
//! Loads gather their box when issued and land in shared memory when the
//! device makes progress; landing completes the box bytes on the barrier.
//! Stores are written through immediately and clip at the source bounds.
//! Swizzle, interleave and L2 promotion affect only the physical layout, so
//! they are carried but not applied.

use super::mbarrier::MBarrierGroup;
use super::memory::{MemRef, indices};
use super::{SimError, SimResult, Stats, lock};
use crate::diagnostics::VerifyError;
use crate::ir::{OobFill, TensorMapType};
use crate::verify::rules;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Opaque tensor-map handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorMapDescriptor(u64);

impl fmt::Display for TensorMapDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensormap#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Encoding {
    source: MemRef,
    ty: TensorMapType,
}

#[derive(Debug)]
struct TensorMapEntry {
    active: Encoding,
    /// Replacement not yet made visible by a fence
    pending: Option<Encoding>,
    prefetched: bool,
}

#[derive(Debug)]
struct InflightLoad {
    descriptor: TensorMapDescriptor,
    dst: MemRef,
    data: Vec<f64>,
    barriers: MBarrierGroup,
    barrier: usize,
    bytes: u64,
}

/// Descriptor table and in-flight transfers of one block
#[derive(Debug)]
pub struct TmaUnit {
    maps: Mutex<FxHashMap<TensorMapDescriptor, TensorMapEntry>>,
    next: AtomicU64,
    inflight: Mutex<VecDeque<InflightLoad>>,
    cluster_size: usize,
    cta_rank: usize,
    stats: Arc<Stats>,
}

impl TmaUnit {
    pub fn new(cluster_size: usize, cta_rank: usize, stats: Arc<Stats>) -> Self {
        Self {
            maps: Mutex::new(FxHashMap::default()),
            next: AtomicU64::new(0),
            inflight: Mutex::new(VecDeque::new()),
            cluster_size,
            cta_rank,
            stats,
        }
    }

    /// Encode a tiled view of `source` with box dimensions `box_dims`
    pub fn create_descriptor(
        &self,
        source: &MemRef,
        box_dims: &[i64],
        ty: &TensorMapType,
    ) -> SimResult<TensorMapDescriptor> {
        let statics: Vec<Option<i64>> = box_dims.iter().copied().map(Some).collect();
        rules::check_create_descriptor(ty, source.ty(), &statics)?;
        check_source(source, ty)?;

        let descriptor = TensorMapDescriptor(self.next.fetch_add(1, Ordering::Relaxed));
        let encoding = Encoding {
            source: source.clone(),
            ty: ty.clone(),
        };
        lock(&self.maps).insert(
            descriptor,
            TensorMapEntry {
                active: encoding,
                pending: None,
                prefetched: false,
            },
        );
        debug!(%descriptor, box_dims = ?box_dims, source = ?source.shape(), "create tensor map");
        Ok(descriptor)
    }

    /// Element type and box of a descriptor
    pub fn descriptor_type(&self, descriptor: TensorMapDescriptor) -> SimResult<TensorMapType> {
        let maps = lock(&self.maps);
        let entry = maps
            .get(&descriptor)
            .ok_or(SimError::UnknownDescriptor(descriptor.0))?;
        Ok(entry.active.ty.clone())
    }

    /// Point the descriptor at a new source region out of band
    ///
    /// Loads keep reading the previous region until the descriptor is fenced.
    pub fn replace_source(&self, descriptor: TensorMapDescriptor, source: &MemRef) -> SimResult<()> {
        let mut maps = lock(&self.maps);
        let entry = maps
            .get_mut(&descriptor)
            .ok_or(SimError::UnknownDescriptor(descriptor.0))?;
        let ty = entry.active.ty.clone();
        if source.elem() != ty.tensor.elem {
            return Err(VerifyError::TypeMismatch(format!(
                "replacement source holds {}, descriptor holds {}",
                source.elem(),
                ty.tensor.elem
            ))
            .into());
        }
        check_source(source, &ty)?;
        entry.pending = Some(Encoding {
            source: source.clone(),
            ty,
        });
        debug!(%descriptor, "tensor map replaced out of band");
        Ok(())
    }

    /// Make an out-of-band replacement visible to later loads
    pub fn fence(&self, descriptor: TensorMapDescriptor) -> SimResult<()> {
        let mut maps = lock(&self.maps);
        let entry = maps
            .get_mut(&descriptor)
            .ok_or(SimError::UnknownDescriptor(descriptor.0))?;
        if let Some(encoding) = entry.pending.take() {
            entry.active = encoding;
            entry.prefetched = false;
        }
        trace!(%descriptor, "tensor map fence");
        Ok(())
    }

    /// Cache hint; a false predicate does nothing
    pub fn prefetch(&self, descriptor: TensorMapDescriptor, predicate: bool) -> SimResult<()> {
        if !predicate {
            return Ok(());
        }
        let mut maps = lock(&self.maps);
        let entry = maps
            .get_mut(&descriptor)
            .ok_or(SimError::UnknownDescriptor(descriptor.0))?;
        entry.prefetched = true;
        trace!(%descriptor, "tensor map prefetch");
        Ok(())
    }

    pub fn is_prefetched(&self, descriptor: TensorMapDescriptor) -> SimResult<bool> {
        let maps = lock(&self.maps);
        maps.get(&descriptor)
            .map(|entry| entry.prefetched)
            .ok_or(SimError::UnknownDescriptor(descriptor.0))
    }

    /// Encoding a transfer issued now would use
    fn visible_encoding(&self, descriptor: TensorMapDescriptor, what: &str) -> SimResult<Encoding> {
        let maps = lock(&self.maps);
        let entry = maps
            .get(&descriptor)
            .ok_or(SimError::UnknownDescriptor(descriptor.0))?;
        if entry.pending.is_some() {
            warn!(%descriptor, "{} through a tensor map replaced without a fence", what);
            Stats::bump(&self.stats.hazards, 1);
        }
        Ok(entry.active.clone())
    }

    /// Start a bulk tiled load of the box at `coordinates` into `dst`
    ///
    /// Completion is reported to barrier `barrier` of `barriers` as the box
    /// byte count. With a multicast mask, the box is written to every CTA
    /// whose bit is set; only the local CTA is simulated.
    #[allow(clippy::too_many_arguments)]
    pub fn async_load(
        &self,
        descriptor: TensorMapDescriptor,
        coordinates: &[i64],
        barriers: &MBarrierGroup,
        barrier: usize,
        dst: &MemRef,
        multicast_mask: Option<u64>,
        predicate: bool,
    ) -> SimResult<()> {
        if !predicate {
            return Ok(());
        }
        let encoding = self.visible_encoding(descriptor, "load")?;
        rules::check_tma_load(&encoding.ty, coordinates.len(), dst.ty())?;
        if !barriers.is_initialized(barrier)? {
            return Err(SimError::UninitializedBarrier(barrier));
        }

        let write_local = match multicast_mask {
            None => true,
            Some(mask) => {
                if self.cluster_size < 64 && mask >> self.cluster_size != 0 {
                    return Err(SimError::InvalidValue(format!(
                        "multicast mask {:#x} names CTAs outside a cluster of {}",
                        mask, self.cluster_size
                    )));
                }
                let local = mask & (1 << self.cta_rank) != 0;
                let remote = mask.count_ones() as u64 - local as u64;
                Stats::bump(&self.stats.multicast_remote_writes, remote);
                local
            }
        };

        let data = gather(&encoding, coordinates);
        let bytes = dst.size_bytes() as u64;
        Stats::bump(&self.stats.tma_loads, 1);
        debug!(%descriptor, coordinates = ?coordinates, barrier, bytes, write_local, "issue tma load");
        if write_local {
            lock(&self.inflight).push_back(InflightLoad {
                descriptor,
                dst: dst.clone(),
                data,
                barriers: barriers.clone(),
                barrier,
                bytes,
            });
        }
        Ok(())
    }

    /// Land every in-flight load; returns how many landed
    pub fn progress(&self) -> SimResult<usize> {
        let landed: Vec<InflightLoad> = lock(&self.inflight).drain(..).collect();
        let count = landed.len();
        for load in landed {
            load.dst.write_linear(0, &load.data)?;
            load.barriers.complete_tx(load.barrier, load.bytes)?;
            trace!(descriptor = %load.descriptor, bytes = load.bytes, "tma load landed");
        }
        Ok(count)
    }

    pub fn inflight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Write the box in `src` to the source region at `coordinates`
    pub fn async_store(
        &self,
        src: &MemRef,
        descriptor: TensorMapDescriptor,
        coordinates: &[i64],
        predicate: bool,
    ) -> SimResult<()> {
        if !predicate {
            return Ok(());
        }
        let encoding = self.visible_encoding(descriptor, "store")?;
        rules::check_tma_store(&encoding.ty, coordinates.len(), src.ty())?;

        let values = src.to_vec();
        let mut clipped = 0usize;
        for (value, index) in values.iter().zip(indices(src.shape())) {
            match global_index(&encoding, coordinates, &index) {
                Some(target) => encoding.source.store(&target, *value)?,
                None => clipped += 1,
            }
        }
        Stats::bump(&self.stats.tma_stores, 1);
        debug!(%descriptor, coordinates = ?coordinates, clipped, "tma store");
        Ok(())
    }
}

/// The source region must have the rank of the box
fn check_source(source: &MemRef, ty: &TensorMapType) -> SimResult<()> {
    if source.shape().len() != ty.rank() {
        return Err(VerifyError::RankMismatch {
            what: "tensor-map source".to_string(),
            expected: ty.rank(),
            found: source.shape().len(),
        }
        .into());
    }
    Ok(())
}

/// Source index of box element `index` when the box starts at `coordinates`
fn global_index(encoding: &Encoding, coordinates: &[i64], index: &[usize]) -> Option<Vec<i64>> {
    let shape = encoding.source.shape();
    let mut target = Vec::with_capacity(index.len());
    for ((start, offset), dim) in coordinates.iter().zip(index).zip(shape) {
        let coord = start + *offset as i64;
        if coord < 0 || coord >= *dim as i64 {
            return None;
        }
        target.push(coord);
    }
    Some(target)
}

/// Read the box at `coordinates`, filling elements outside the source
fn gather(encoding: &Encoding, coordinates: &[i64]) -> Vec<f64> {
    let fill = match encoding.ty.oob {
        OobFill::Zero => 0.0,
        OobFill::Nan => f64::NAN,
    };
    let source = encoding.source.to_vec();
    let shape = encoding.source.shape();
    let box_shape = encoding.ty.tensor.shape.clone().unwrap_or_default();
    indices(&box_shape)
        .map(|index| match global_index(encoding, coordinates, &index) {
            Some(target) => {
                let offset = target
                    .iter()
                    .zip(shape)
                    .fold(0usize, |acc, (i, dim)| acc * dim + *i as usize);
                source[offset]
            }
            None => fill,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AllocInit, ElemType, MemRefType, MemorySpace};

    fn setup() -> (TmaUnit, MemRef, TensorMapType) {
        let unit = TmaUnit::new(1, 0, Arc::new(Stats::default()));
        let global = MemRef::alloc(
            &MemRefType::ranked(vec![4, 8], ElemType::F32, MemorySpace::Global),
            AllocInit::Iota,
        )
        .unwrap()
        .cast(&MemRefType::unranked(ElemType::F32, MemorySpace::Global))
        .unwrap();
        let ty = TensorMapType::new(MemRefType::ranked(
            vec![2, 4],
            ElemType::F32,
            MemorySpace::Shared,
        ));
        (unit, global, ty)
    }

    #[test]
    fn test_gather_with_oob_fill() {
        let (unit, global, ty) = setup();
        let desc = unit.create_descriptor(&global, &[2, 4], &ty).unwrap();
        let barriers = MBarrierGroup::new(MemorySpace::Shared, 1).unwrap();
        barriers.init(0, 1, true).unwrap();
        barriers.expect_tx(0, 32).unwrap();
        let dst = MemRef::alloc(&ty.tensor, AllocInit::Zero).unwrap();

        unit.async_load(desc, &[3, 6], &barriers, 0, &dst, None, true).unwrap();
        assert_eq!(dst.to_vec(), vec![0.0; 8]);
        assert_eq!(unit.progress().unwrap(), 1);
        assert_eq!(
            dst.to_vec(),
            vec![30.0, 31.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(barriers.tx_count(0).unwrap(), 0);
    }

    #[test]
    fn test_box_rank_mismatch() {
        let (unit, global, ty) = setup();
        let err = unit.create_descriptor(&global, &[2], &ty).unwrap_err();
        assert!(matches!(
            err,
            SimError::Verify(VerifyError::RankMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_store_clips() {
        let (unit, global, ty) = setup();
        let desc = unit.create_descriptor(&global, &[2, 4], &ty).unwrap();
        let src = MemRef::alloc(&ty.tensor, AllocInit::Fill(-1.0)).unwrap();
        unit.async_store(&src, desc, &[3, 0], true).unwrap();
        let data = global.to_vec();
        assert_eq!(data[24..28], [-1.0; 4]);
        assert_eq!(data[28], 28.0);
    }
}
