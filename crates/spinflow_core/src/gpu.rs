//! Device context shared by all steppers: the device, its buffer arena and
//! typed wrappers around the kernels the integrators launch.

use crate::arena::{BufferArena, BufferToken};
use crate::device::{Device, Slice};
use crate::error::Result;
use std::cell::{Ref, RefCell};
use std::ops::Deref;

/// A compute device together with its pool of scratch buffers.
///
/// There is exactly one stepping context, so the device and arena sit behind
/// `RefCell`s and every method takes `&self`. Scratch buffers borrow the
/// context, which keeps [`Gpu::free_buffers`] (`&mut self`) from running while
/// any of them is alive.
pub struct Gpu<D: Device> {
    device: RefCell<D>,
    arena: RefCell<BufferArena>,
    synchronous: bool,
}

impl<D: Device> Gpu<D> {
    pub fn new(device: D, max_live_buffers: usize) -> Self {
        Self {
            device: RefCell::new(device),
            arena: RefCell::new(BufferArena::new(max_live_buffers)),
            synchronous: false,
        }
    }

    /// Synchronous mode puts a device barrier around every buffer hand-out and
    /// recycle, for debugging asynchronous reuse.
    pub fn set_synchronous(&mut self, synchronous: bool) {
        self.synchronous = synchronous;
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Returns a scratch field of `ncomp` components, recycled when dropped.
    pub fn buffer(&self, ncomp: usize, len: usize) -> Result<Buffer<'_, D>> {
        if self.synchronous {
            self.sync();
        }
        let mut device = self.device.borrow_mut();
        let (ptrs, tokens) = self.arena.borrow_mut().acquire(&mut *device, ncomp, len)?;
        Ok(Buffer {
            gpu: self,
            slice: Slice::from_ptrs(ptrs, len),
            tokens,
        })
    }

    fn recycle(&self, tokens: Vec<BufferToken>) -> Result<()> {
        if self.synchronous {
            self.sync();
        }
        self.arena.borrow_mut().release(tokens)
    }

    /// Allocates a field outside the arena. Must be handed back with [`Gpu::free_slice`].
    pub fn new_slice(&self, ncomp: usize, len: usize) -> Result<Slice> {
        let mut device = self.device.borrow_mut();
        let mut ptrs = Vec::with_capacity(ncomp);
        for _ in 0..ncomp {
            match device.alloc(len) {
                Ok(ptr) => ptrs.push(ptr),
                Err(err) => {
                    for ptr in ptrs {
                        device.free(ptr);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Slice::from_ptrs(ptrs, len))
    }

    pub fn free_slice(&self, slice: Slice) {
        let mut device = self.device.borrow_mut();
        for ptr in slice.into_ptrs() {
            device.free(ptr);
        }
    }

    /// Frees every pooled buffer. Needed after a resize, when no cached size fits.
    pub fn free_buffers(&mut self) {
        let device = self.device.get_mut();
        self.arena.get_mut().release_all(device);
    }

    pub fn copy(&self, dst: &Slice, src: &Slice) {
        assert_eq!(dst.ncomp(), src.ncomp(), "copy: component mismatch");
        assert_eq!(dst.len(), src.len(), "copy: length mismatch");
        let mut device = self.device.borrow_mut();
        for c in 0..dst.ncomp() {
            device.copy(dst.ptr(c), src.ptr(c), dst.len());
        }
    }

    /// `dst = Σ factor_k · src_k`, component by component.
    pub fn madd(&self, dst: &Slice, terms: &[(&Slice, f32)]) {
        for (src, _) in terms {
            assert_eq!(src.ncomp(), dst.ncomp(), "madd: component mismatch");
            assert_eq!(src.len(), dst.len(), "madd: length mismatch");
        }
        let mut device = self.device.borrow_mut();
        let mut launch = Vec::with_capacity(terms.len());
        for c in 0..dst.ncomp() {
            launch.clear();
            launch.extend(terms.iter().map(|(src, factor)| (src.ptr(c), *factor)));
            device.madd(dst.ptr(c), &launch, dst.len());
        }
    }

    pub fn madd2(&self, dst: &Slice, src1: &Slice, src2: &Slice, f1: f32, f2: f32) {
        self.madd(dst, &[(src1, f1), (src2, f2)]);
    }

    pub fn madd3(&self, dst: &Slice, src: [&Slice; 3], f: [f32; 3]) {
        self.madd(dst, &[(src[0], f[0]), (src[1], f[1]), (src[2], f[2])]);
    }

    pub fn madd4(&self, dst: &Slice, src: [&Slice; 4], f: [f32; 4]) {
        self.madd(
            dst,
            &[(src[0], f[0]), (src[1], f[1]), (src[2], f[2]), (src[3], f[3])],
        );
    }

    pub fn madd5(&self, dst: &Slice, src: [&Slice; 5], f: [f32; 5]) {
        let terms: Vec<(&Slice, f32)> = src.into_iter().zip(f).collect();
        self.madd(dst, &terms);
    }

    pub fn madd6(&self, dst: &Slice, src: [&Slice; 6], f: [f32; 6]) {
        let terms: Vec<(&Slice, f32)> = src.into_iter().zip(f).collect();
        self.madd(dst, &terms);
    }

    pub fn madd7(&self, dst: &Slice, src: [&Slice; 7], f: [f32; 7]) {
        let terms: Vec<(&Slice, f32)> = src.into_iter().zip(f).collect();
        self.madd(dst, &terms);
    }

    /// Largest per-cell vector norm of a 3-component field.
    pub fn max_vec_norm(&self, v: &Slice) -> f64 {
        let mut device = self.device.borrow_mut();
        device.max_vec_norm(v.vector(), v.len()) as f64
    }

    /// Largest per-cell norm of `a - b`.
    pub fn max_vec_diff(&self, a: &Slice, b: &Slice) -> f64 {
        assert_eq!(a.len(), b.len(), "max_vec_diff: length mismatch");
        let mut device = self.device.borrow_mut();
        device.max_vec_diff(a.vector(), b.vector(), a.len()) as f64
    }

    /// Sum over all cells of `a · b`.
    pub fn dot(&self, a: &Slice, b: &Slice) -> f64 {
        assert_eq!(a.len(), b.len(), "dot: length mismatch");
        let mut device = self.device.borrow_mut();
        device.dot(a.vector(), b.vector(), a.len()) as f64
    }

    pub fn normalize(&self, v: &Slice) {
        let mut device = self.device.borrow_mut();
        device.normalize(v.vector(), v.len());
    }

    pub fn upload(&self, dst: &Slice, comp: usize, data: &[f32]) {
        assert_eq!(data.len(), dst.len(), "upload: length mismatch");
        self.device.borrow_mut().upload(dst.ptr(comp), data);
    }

    /// Copies a field back to the host, one vector per component.
    pub fn download(&self, src: &Slice) -> Vec<Vec<f32>> {
        let mut device = self.device.borrow_mut();
        device.sync();
        (0..src.ncomp())
            .map(|c| {
                let mut out = vec![0.0; src.len()];
                device.download(src.ptr(c), &mut out);
                out
            })
            .collect()
    }

    pub fn sync(&self) {
        self.device.borrow_mut().sync();
    }

    pub fn arena(&self) -> Ref<'_, BufferArena> {
        self.arena.borrow()
    }

    pub fn device(&self) -> Ref<'_, D> {
        self.device.borrow()
    }
}

impl<D: Device> Drop for Gpu<D> {
    fn drop(&mut self) {
        self.free_buffers();
    }
}

/// Scratch field lent by the arena. Goes back to the pool when dropped, on
/// every exit path of the code that acquired it.
pub struct Buffer<'a, D: Device> {
    gpu: &'a Gpu<D>,
    slice: Slice,
    tokens: Vec<BufferToken>,
}

impl<D: Device> Buffer<'_, D> {
    /// Returns the buffer to the pool now, reporting a provenance failure
    /// instead of only logging it.
    pub fn recycle(mut self) -> Result<()> {
        let tokens = std::mem::take(&mut self.tokens);
        self.gpu.recycle(tokens)
    }
}

impl<D: Device> Deref for Buffer<'_, D> {
    type Target = Slice;

    fn deref(&self) -> &Slice {
        &self.slice
    }
}

impl<D: Device> Drop for Buffer<'_, D> {
    fn drop(&mut self) {
        if self.tokens.is_empty() {
            return;
        }
        let tokens = std::mem::take(&mut self.tokens);
        if let Err(err) = self.gpu.recycle(tokens) {
            log::error!("failed to recycle scratch buffer: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Gpu;
    use crate::device::HostDevice;
    use crate::error::SolverError;

    #[test]
    fn dropped_buffers_return_to_the_pool() {
        let gpu = Gpu::new(HostDevice::new(), 100);
        {
            let a = gpu.buffer(3, 10).expect("buffer should be available");
            let _b = gpu.buffer(3, 10).expect("buffer should be available");
            assert_eq!(gpu.arena().live(10), 6);
            a.recycle().expect("recycle should succeed");
            assert_eq!(gpu.arena().live(10), 3);
        }
        assert_eq!(gpu.arena().live(10), 0);
        assert_eq!(gpu.arena().pooled(10), 6);

        let _c = gpu.buffer(3, 10).expect("buffer should be available");
        assert_eq!(gpu.arena().allocations(), 6);
    }

    #[test]
    fn early_return_still_recycles() {
        fn fails_halfway(gpu: &Gpu<HostDevice>) -> Result<(), SolverError> {
            let _scratch = gpu.buffer(3, 4)?;
            Err(SolverError::TimeStepUnderflow)
        }

        let gpu = Gpu::new(HostDevice::new(), 100);
        assert!(fails_halfway(&gpu).is_err());
        assert_eq!(gpu.arena().live(4), 0);
        assert_eq!(gpu.arena().pooled(4), 3);
    }

    #[test]
    fn leaking_buffers_hits_the_ceiling() {
        let gpu = Gpu::new(HostDevice::new(), 9);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(gpu.buffer(3, 2).expect("buffer should be available"));
        }
        let err = gpu.buffer(3, 2).err().expect("ceiling should trip");
        assert!(matches!(err, SolverError::BufferLeak { .. }));
    }

    #[test]
    fn free_buffers_returns_memory_to_the_device() {
        let mut gpu = Gpu::new(HostDevice::new(), 100);
        drop(gpu.buffer(3, 8).expect("buffer should be available"));
        assert_eq!(gpu.device().live_allocations(), 3);
        gpu.free_buffers();
        assert_eq!(gpu.device().live_allocations(), 0);
        assert_eq!(gpu.arena().pooled(8), 0);
    }

    #[test]
    fn madd_and_reductions_act_per_component() {
        let gpu = Gpu::new(HostDevice::new(), 100);
        let a = gpu.new_slice(3, 2).expect("slice should allocate");
        let b = gpu.buffer(3, 2).expect("buffer should be available");
        gpu.upload(&a, 0, &[1.0, 0.0]);
        gpu.upload(&a, 1, &[0.0, 2.0]);
        gpu.upload(&a, 2, &[0.0, 0.0]);
        gpu.madd2(&b, &a, &a, 1.0, 0.5);
        assert!((gpu.max_vec_norm(&b) - 3.0).abs() < 1e-6);
        assert!((gpu.max_vec_diff(&a, &b) - 1.0).abs() < 1e-6);

        gpu.normalize(&b);
        let host = gpu.download(&b);
        assert_eq!(host[0], vec![1.0, 0.0]);
        assert_eq!(host[1], vec![0.0, 1.0]);
        drop(b);
        gpu.free_slice(a);
    }

    #[test]
    fn synchronous_mode_is_opt_in() {
        let mut gpu = Gpu::new(HostDevice::new(), 100);
        assert!(!gpu.is_synchronous());
        gpu.set_synchronous(true);
        let buf = gpu.buffer(1, 3).expect("buffer should be available");
        assert_eq!(buf.ncomp(), 1);
        assert_eq!(buf.len(), 3);
    }
}
