use std::cell::UnsafeCell;

/// Interior-mutable cell for buffers that are owned by exactly one realtime
/// thread at a time.
///
/// Port buffers are shared between registry snapshots through `Arc`, but only
/// the process thread ever touches their contents, so no lock is taken.
/// Callers uphold that contract; the registry's copy-on-write discipline
/// never hands the same buffer to two writers.
#[derive(Debug, Default)]
pub struct UnsafeMutex<T> {
    data: UnsafeCell<T>,
}

impl<T> UnsafeMutex<T> {
    pub fn new(data: T) -> Self {
        UnsafeMutex {
            data: UnsafeCell::new(data),
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn lock(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

unsafe impl<T: Send> Send for UnsafeMutex<T> {}
unsafe impl<T: Send> Sync for UnsafeMutex<T> {}
