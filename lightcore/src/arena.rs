// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A bounded scratch arena.
//!
//! The allocator of a crashed process may be corrupted, so everything the
//! session needs past the crash point is carved out of one anonymous mapping
//! reserved up-front. Allocation bumps an offset and never frees; the mapping
//! is released when the arena is dropped.

use crate::CoreError;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;

// Every allocation is aligned relative to the block start, so the block
// itself must satisfy the strictest alignment handed out.
const BLOCK_ALIGN: usize = 16;

/// Fixed-capacity bump allocator over an anonymous private mapping.
pub struct ScratchArena {
    base: NonNull<u8>,
    capacity: usize,
    used: Cell<usize>,
}

impl ScratchArena {
    /// Maps `capacity` zeroed bytes. Neither this nor any later allocation
    /// goes through the general allocator.
    pub fn with_capacity(capacity: usize) -> Result<Self, CoreError> {
        let capacity = capacity.max(BLOCK_ALIGN);
        let length = NonZeroUsize::new(capacity).ok_or(CoreError::InternalError(
            "scratch arena of zero bytes",
        ))?;

        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }?;
        let base = NonNull::new(ptr as *mut u8).ok_or(CoreError::InternalError(
            "mmap returned a null mapping",
        ))?;

        Ok(Self {
            base,
            capacity,
            used: Cell::new(0),
        })
    }

    /// Total bytes reserved
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available, ignoring alignment losses
    pub fn available(&self) -> usize {
        self.capacity - self.used.get()
    }

    /// Hands out room for `count` values of `T`.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_uninit<T>(&self, count: usize) -> Result<&mut [MaybeUninit<T>], CoreError> {
        let align = std::mem::align_of::<T>();
        debug_assert!(align <= BLOCK_ALIGN);

        let size = std::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(CoreError::ArenaExhausted {
                requested: usize::MAX,
                available: self.available(),
            })?;

        let start = (self.used.get() + align - 1) & !(align - 1);
        let end = match start.checked_add(size) {
            Some(end) if end <= self.capacity => end,
            _ => {
                return Err(CoreError::ArenaExhausted {
                    requested: size,
                    available: self.available(),
                })
            }
        };
        self.used.set(end);

        // SAFETY: [start, end) lies inside the block, is aligned for T and has
        // never been handed out before, so the returned slice aliases nothing.
        Ok(unsafe {
            slice::from_raw_parts_mut(
                self.base.as_ptr().add(start) as *mut MaybeUninit<T>,
                count,
            )
        })
    }

    /// Hands out `len` zeroed bytes.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_bytes(&self, len: usize) -> Result<&mut [u8], CoreError> {
        let bytes = self.alloc_uninit::<u8>(len)?;
        for b in bytes.iter_mut() {
            b.write(0);
        }

        // SAFETY: every byte has just been initialized.
        Ok(unsafe { &mut *(bytes as *mut [MaybeUninit<u8>] as *mut [u8]) })
    }

    /// Copies `data` into the arena.
    pub fn alloc_copy(&self, data: &[u8]) -> Result<&[u8], CoreError> {
        let bytes = self.alloc_bytes(data.len())?;
        bytes.copy_from_slice(data);
        Ok(bytes)
    }

    /// Moves `value` into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T>(&self, value: T) -> Result<&mut T, CoreError> {
        let slot = self.alloc_uninit::<T>(1)?;
        Ok(slot[0].write(value))
    }

    /// A vector of at most `capacity` elements backed by this arena.
    pub fn vec<T: Copy>(&self, capacity: usize) -> Result<ArenaVec<'_, T>, CoreError> {
        Ok(ArenaVec {
            slots: self.alloc_uninit::<T>(capacity)?,
            len: 0,
        })
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        // SAFETY: base and capacity describe the mapping made in with_capacity,
        // and every borrow handed out is bound to the arena's lifetime.
        if let Err(e) = unsafe { munmap(self.base.as_ptr().cast(), self.capacity) } {
            tracing::warn!("Unmapping the scratch arena failed: {}", e);
        }
    }
}

impl std::fmt::Debug for ScratchArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchArena")
            .field("capacity", &self.capacity)
            .field("used", &self.used.get())
            .finish()
    }
}

/// Fixed-capacity vector living in a [`ScratchArena`].
///
/// Pushing past the capacity fails instead of reallocating.
pub struct ArenaVec<'a, T: Copy> {
    slots: &'a mut [MaybeUninit<T>],
    len: usize,
}

impl<'a, T: Copy> ArenaVec<'a, T> {
    /// Appends `value`, fails when the vector is full.
    pub fn push(&mut self, value: T) -> Result<(), CoreError> {
        match self.slots.get_mut(self.len) {
            Some(slot) => {
                slot.write(value);
                self.len += 1;
                Ok(())
            }
            None => Err(CoreError::ArenaExhausted {
                requested: std::mem::size_of::<T>(),
                available: 0,
            }),
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing has been pushed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of elements
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The pushed elements
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { &*(&self.slots[..self.len] as *const [MaybeUninit<T>] as *const [T]) }
    }

    /// The pushed elements, mutably
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { &mut *(&mut self.slots[..self.len] as *mut [MaybeUninit<T>] as *mut [T]) }
    }

    /// Iterates over the pushed elements
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T: Copy> std::ops::Deref for ArenaVec<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for ArenaVec<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Fixed-capacity vector owning its own mapping.
///
/// Used for tables that outlive a single allocation scope. Pushing past the
/// capacity fails instead of reallocating.
pub(crate) struct MappedVec<T: Copy> {
    block: ScratchArena,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> MappedVec<T> {
    pub fn with_capacity(capacity: usize) -> Result<Self, CoreError> {
        debug_assert!(std::mem::align_of::<T>() <= BLOCK_ALIGN);

        let size = std::mem::size_of::<T>()
            .checked_mul(capacity)
            .ok_or(CoreError::ArenaExhausted {
                requested: usize::MAX,
                available: 0,
            })?;

        Ok(Self {
            block: ScratchArena::with_capacity(size)?,
            len: 0,
            capacity,
            _marker: PhantomData,
        })
    }

    fn slots(&self) -> *mut T {
        self.block.base.as_ptr().cast()
    }

    pub fn push(&mut self, value: T) -> Result<(), CoreError> {
        if self.len == self.capacity {
            return Err(CoreError::ArenaExhausted {
                requested: std::mem::size_of::<T>(),
                available: 0,
            });
        }

        // SAFETY: len < capacity, and the block holds capacity values of T.
        unsafe { self.slots().add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { slice::from_raw_parts(self.slots(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: the first `len` slots are initialized and borrowed through self.
        unsafe { slice::from_raw_parts_mut(self.slots(), self.len) }
    }
}

impl<T: Copy> std::ops::Deref for MappedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for MappedVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
