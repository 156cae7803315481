//! Device memory and kernel primitives.
//!
//! The engine never touches field data directly. Everything it needs from a
//! compute device goes through [`Device`]: allocation, copies, a handful of
//! kernels launched over 1D (per element) or 3D (per cell vector) ranges, and
//! a stream barrier. Launches are ordered on a single stream, so a kernel
//! always observes the results of every kernel launched before it.

use crate::error::{Result, SolverError};
use nalgebra::Vector3;
use rayon::prelude::*;

/// Opaque handle to one device allocation of `f32` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub(crate) usize);

/// Multi-component field descriptor: `ncomp` device arrays of `len` elements.
///
/// A `Slice` does not own its memory. Long-lived slices come from
/// [`crate::gpu::Gpu::new_slice`], temporaries from [`crate::gpu::Gpu::buffer`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Slice {
    ptrs: Vec<DevicePtr>,
    len: usize,
}

impl Slice {
    pub(crate) fn from_ptrs(ptrs: Vec<DevicePtr>, len: usize) -> Self {
        Self { ptrs, len }
    }

    pub(crate) fn into_ptrs(self) -> Vec<DevicePtr> {
        self.ptrs
    }

    pub fn ncomp(&self) -> usize {
        self.ptrs.len()
    }

    /// Number of elements per component.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty() || self.len == 0
    }

    pub fn ptr(&self, comp: usize) -> DevicePtr {
        self.ptrs[comp]
    }

    /// The three component pointers of a vector field.
    pub fn vector(&self) -> [DevicePtr; 3] {
        assert_eq!(self.ncomp(), 3, "expected a 3-component field");
        [self.ptrs[0], self.ptrs[1], self.ptrs[2]]
    }
}

/// Primitives a compute backend provides to the engine.
pub trait Device {
    /// Allocates `len` `f32` elements.
    fn alloc(&mut self, len: usize) -> Result<DevicePtr>;

    fn free(&mut self, ptr: DevicePtr);

    fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize);

    /// `dst[i] = Σ factor_k · src_k[i]` over `len` elements. `dst` may appear among the sources.
    fn madd(&mut self, dst: DevicePtr, terms: &[(DevicePtr, f32)], len: usize);

    /// Largest per-cell vector norm.
    fn max_vec_norm(&mut self, v: [DevicePtr; 3], len: usize) -> f32;

    /// Largest per-cell norm of `a - b`.
    fn max_vec_diff(&mut self, a: [DevicePtr; 3], b: [DevicePtr; 3], len: usize) -> f32;

    /// Sum over all cells of the dot product `a · b`.
    fn dot(&mut self, a: [DevicePtr; 3], b: [DevicePtr; 3], len: usize) -> f32;

    /// Scales every non-zero cell vector to unit length.
    fn normalize(&mut self, v: [DevicePtr; 3], len: usize);

    fn upload(&mut self, dst: DevicePtr, data: &[f32]);

    fn download(&mut self, src: DevicePtr, out: &mut [f32]);

    /// Blocks until all launched work has completed.
    fn sync(&mut self);
}

/// Reference backend keeping device memory in host vectors.
///
/// Kernels run data-parallel on the rayon pool and complete before they
/// return, so `sync` is a no-op.
#[derive(Debug, Default)]
pub struct HostDevice {
    mem: Vec<Option<Vec<f32>>>,
    allocations: usize,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `alloc` calls served so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.mem.iter().filter(|slot| slot.is_some()).count()
    }

    fn get(&self, ptr: DevicePtr) -> &[f32] {
        match self.mem.get(ptr.0) {
            Some(Some(data)) => data,
            _ => panic!("use of invalid or freed device pointer {:?}", ptr),
        }
    }

    fn take(&mut self, ptr: DevicePtr) -> Vec<f32> {
        match self.mem.get_mut(ptr.0) {
            Some(Some(data)) => std::mem::take(data),
            _ => panic!("use of invalid or freed device pointer {:?}", ptr),
        }
    }

    fn put(&mut self, ptr: DevicePtr, data: Vec<f32>) {
        self.mem[ptr.0] = Some(data);
    }
}

impl Device for HostDevice {
    fn alloc(&mut self, len: usize) -> Result<DevicePtr> {
        if len == 0 {
            return Err(SolverError::Device("zero-length allocation".into()));
        }
        self.allocations += 1;
        let ptr = match self.mem.iter().position(Option::is_none) {
            Some(idx) => {
                self.mem[idx] = Some(vec![0.0; len]);
                idx
            }
            None => {
                self.mem.push(Some(vec![0.0; len]));
                self.mem.len() - 1
            }
        };
        Ok(DevicePtr(ptr))
    }

    fn free(&mut self, ptr: DevicePtr) {
        match self.mem.get_mut(ptr.0) {
            Some(slot @ Some(_)) => *slot = None,
            _ => panic!("double free of device pointer {:?}", ptr),
        }
    }

    fn copy(&mut self, dst: DevicePtr, src: DevicePtr, len: usize) {
        if dst == src {
            return;
        }
        let mut out = self.take(dst);
        out[..len].copy_from_slice(&self.get(src)[..len]);
        self.put(dst, out);
    }

    fn madd(&mut self, dst: DevicePtr, terms: &[(DevicePtr, f32)], len: usize) {
        let mut out = self.take(dst);
        {
            // `None` marks a term that reads the destination itself.
            let sources: Vec<(Option<&[f32]>, f32)> = terms
                .iter()
                .map(|&(ptr, factor)| {
                    if ptr == dst {
                        (None, factor)
                    } else {
                        (Some(&self.get(ptr)[..len]), factor)
                    }
                })
                .collect();
            out[..len].par_iter_mut().enumerate().for_each(|(i, o)| {
                let mut acc = 0.0f32;
                for (src, factor) in &sources {
                    let value = match src {
                        Some(data) => data[i],
                        None => *o,
                    };
                    acc += factor * value;
                }
                *o = acc;
            });
        }
        self.put(dst, out);
    }

    fn max_vec_norm(&mut self, v: [DevicePtr; 3], len: usize) -> f32 {
        let (x, y, z) = (self.get(v[0]), self.get(v[1]), self.get(v[2]));
        let max2 = (0..len)
            .into_par_iter()
            .map(|i| Vector3::new(x[i], y[i], z[i]).norm_squared())
            .reduce(|| 0.0f32, f32::max);
        max2.sqrt()
    }

    fn max_vec_diff(&mut self, a: [DevicePtr; 3], b: [DevicePtr; 3], len: usize) -> f32 {
        let (ax, ay, az) = (self.get(a[0]), self.get(a[1]), self.get(a[2]));
        let (bx, by, bz) = (self.get(b[0]), self.get(b[1]), self.get(b[2]));
        let max2 = (0..len)
            .into_par_iter()
            .map(|i| {
                let d = Vector3::new(ax[i], ay[i], az[i]) - Vector3::new(bx[i], by[i], bz[i]);
                d.norm_squared()
            })
            .reduce(|| 0.0f32, f32::max);
        max2.sqrt()
    }

    fn dot(&mut self, a: [DevicePtr; 3], b: [DevicePtr; 3], len: usize) -> f32 {
        let (ax, ay, az) = (self.get(a[0]), self.get(a[1]), self.get(a[2]));
        let (bx, by, bz) = (self.get(b[0]), self.get(b[1]), self.get(b[2]));
        let sum: f64 = (0..len)
            .into_par_iter()
            .map(|i| {
                let d = Vector3::new(ax[i], ay[i], az[i]).dot(&Vector3::new(bx[i], by[i], bz[i]));
                d as f64
            })
            .sum();
        sum as f32
    }

    fn normalize(&mut self, v: [DevicePtr; 3], len: usize) {
        let mut x = self.take(v[0]);
        let mut y = self.take(v[1]);
        let mut z = self.take(v[2]);
        x[..len]
            .par_iter_mut()
            .zip(y[..len].par_iter_mut())
            .zip(z[..len].par_iter_mut())
            .for_each(|((x, y), z)| {
                let n = Vector3::new(*x, *y, *z).norm();
                if n != 0.0 {
                    *x /= n;
                    *y /= n;
                    *z /= n;
                }
            });
        self.put(v[0], x);
        self.put(v[1], y);
        self.put(v[2], z);
    }

    fn upload(&mut self, dst: DevicePtr, data: &[f32]) {
        let mut out = self.take(dst);
        out[..data.len()].copy_from_slice(data);
        self.put(dst, out);
    }

    fn download(&mut self, src: DevicePtr, out: &mut [f32]) {
        let len = out.len();
        out.copy_from_slice(&self.get(src)[..len]);
    }

    fn sync(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::{Device, HostDevice};

    fn upload(dev: &mut HostDevice, data: &[f32]) -> super::DevicePtr {
        let ptr = dev.alloc(data.len()).expect("alloc should succeed");
        dev.upload(ptr, data);
        ptr
    }

    fn read(dev: &mut HostDevice, ptr: super::DevicePtr, len: usize) -> Vec<f32> {
        let mut out = vec![0.0; len];
        dev.download(ptr, &mut out);
        out
    }

    #[test]
    fn madd_accepts_destination_as_source() {
        let mut dev = HostDevice::new();
        let a = upload(&mut dev, &[1.0, 2.0, 3.0]);
        let b = upload(&mut dev, &[10.0, 20.0, 30.0]);
        dev.madd(a, &[(a, 2.0), (b, 0.5)], 3);
        assert_eq!(read(&mut dev, a, 3), vec![7.0, 14.0, 21.0]);
    }

    #[test]
    fn normalize_leaves_zero_cells_alone() {
        let mut dev = HostDevice::new();
        let x = upload(&mut dev, &[3.0, 0.0]);
        let y = upload(&mut dev, &[4.0, 0.0]);
        let z = upload(&mut dev, &[0.0, 0.0]);
        dev.normalize([x, y, z], 2);
        assert_eq!(read(&mut dev, x, 2), vec![0.6, 0.0]);
        assert_eq!(read(&mut dev, y, 2), vec![0.8, 0.0]);
        assert!((dev.max_vec_norm([x, y, z], 2) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn max_vec_diff_takes_largest_cell() {
        let mut dev = HostDevice::new();
        let ax = upload(&mut dev, &[1.0, 0.0]);
        let ay = upload(&mut dev, &[0.0, 0.0]);
        let az = upload(&mut dev, &[0.0, 0.0]);
        let bx = upload(&mut dev, &[1.0, 3.0]);
        let by = upload(&mut dev, &[0.0, 4.0]);
        let bz = upload(&mut dev, &[0.0, 0.0]);
        let diff = dev.max_vec_diff([ax, ay, az], [bx, by, bz], 2);
        assert!((diff - 5.0).abs() < 1e-6);
    }

    #[test]
    fn dot_sums_over_cells() {
        let mut dev = HostDevice::new();
        let ax = upload(&mut dev, &[1.0, 2.0, 0.0]);
        let ay = upload(&mut dev, &[0.0, 1.0, 0.0]);
        let az = upload(&mut dev, &[0.0, 0.0, 3.0]);
        let bx = upload(&mut dev, &[2.0, 1.0, 5.0]);
        let by = upload(&mut dev, &[7.0, -4.0, 0.0]);
        let bz = upload(&mut dev, &[0.0, 0.0, 0.5]);
        let dot = dev.dot([ax, ay, az], [bx, by, bz], 3);
        assert!((dot - 1.5).abs() < 1e-6, "dot = {dot}");
    }

    #[test]
    fn freed_slots_are_reused_and_counted() {
        let mut dev = HostDevice::new();
        let a = dev.alloc(4).expect("alloc should succeed");
        dev.free(a);
        let b = dev.alloc(4).expect("alloc should succeed");
        assert_eq!(a, b);
        assert_eq!(dev.allocations(), 2);
        assert_eq!(dev.live_allocations(), 1);
    }

    #[test]
    #[should_panic(expected = "freed device pointer")]
    fn reading_freed_memory_fails_fast() {
        let mut dev = HostDevice::new();
        let a = dev.alloc(2).expect("alloc should succeed");
        dev.free(a);
        let mut out = vec![0.0; 2];
        dev.download(a, &mut out);
    }
}
