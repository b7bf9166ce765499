//! Literal garbage.

/// An object to be destroyed eventually.
///
/// Garbage refers to objects which are waiting to be destroyed, at some
/// point after every reader that could still reach them has left its read
/// section. When the garbage is dropped, its destructor runs.
pub struct Garbage {
    /// The pointer to the object.
    ptr: *mut u8,
    /// The destructor of the object.
    ///
    /// The argument given when called is the `self.ptr` field.
    dtor: unsafe fn(*mut u8),
}

// The destructor may run on whatever thread performs the collection.
unsafe impl Send for Garbage {}

impl Garbage {
    /// Create a new garbage item given its parameters.
    ///
    /// # Safety
    ///
    /// `dtor` will be called exactly once with `ptr`, possibly on another
    /// thread; the pair must be valid for that call.
    pub unsafe fn new(ptr: *mut u8, dtor: unsafe fn(*mut u8)) -> Garbage {
        debug_assert!(!ptr.is_null(), "creating garbage with a null pointer");

        Garbage { ptr, dtor }
    }

    /// Create a garbage item deallocating and dropping a box.
    ///
    /// Assuming `item` is a pointer obtained from `Box::into_raw`, this
    /// creates a garbage item whose destructor drops and deallocates that
    /// box.
    ///
    /// # Safety
    ///
    /// There is no way to verify that `item` is indeed an unaliased box, so
    /// the caller must guarantee it, and that no one dereferences it after
    /// the last covering read section ends.
    pub unsafe fn new_box<T>(item: *mut T) -> Garbage {
        unsafe fn dtor<T>(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut T));
        }

        Garbage::new(item as *mut u8, dtor::<T>)
    }

    /// The pointer this garbage holds.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for Garbage {
    fn drop(&mut self) {
        unsafe {
            (self.dtor)(self.ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn dtor_runs_on_drop() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let item = Box::into_raw(Box::new(Counted(drops.clone())));
        let g = unsafe { Garbage::new_box(item) };
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(g);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
