use std::{collections::VecDeque, sync::Arc, sync::Mutex};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("failed to allocate {0} bytes")]
    OutOfMemory(usize),
    #[error("allocation of {size} bytes exceeds the device limit of {limit} bytes")]
    Limit { size: usize, limit: usize },
    #[error("cannot allocate an empty buffer")]
    Empty,
}

/// Hands out device memory by byte size and takes it back when the last handle is gone.
pub trait Allocator: Send + Sync {
    type Memory: Send + Sync + 'static;

    fn alloc(&self, size: usize) -> Result<Self::Memory, AllocError>;

    /// Returns memory of `size` bytes, previously obtained from [`Allocator::alloc`].
    fn free(&self, memory: Self::Memory, size: usize);
}

/// Wraps an allocator with free lists keyed by byte size, so released memory is recycled for
/// the next request of the same size instead of going back to the device.
pub struct PoolAllocator<A: Allocator> {
    inner: A,
    free: Mutex<HashMap<usize, VecDeque<A::Memory>>>,
}

impl<A: Allocator> PoolAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            free: Default::default(),
        }
    }

    /// Total number of bytes sitting in the free lists.
    pub fn cached(&self) -> usize {
        let free = self.free.lock().expect("failed to lock");
        free.iter().map(|(size, list)| size * list.len()).sum()
    }

    /// Hands every cached allocation back to the inner allocator.
    pub fn clear(&self) {
        let free = std::mem::take(&mut *self.free.lock().expect("failed to lock"));
        for (size, list) in free {
            list.into_iter().for_each(|memory| self.inner.free(memory, size));
        }
    }
}

impl<A: Allocator> Allocator for PoolAllocator<A> {
    type Memory = A::Memory;

    fn alloc(&self, size: usize) -> Result<Self::Memory, AllocError> {
        let reused = self
            .free
            .lock()
            .expect("failed to lock")
            .get_mut(&size)
            .and_then(|list| list.pop_front());
        match reused {
            Some(memory) => {
                log::trace!("reuse {size} bytes");
                Ok(memory)
            }
            None => self.inner.alloc(size),
        }
    }

    fn free(&self, memory: Self::Memory, size: usize) {
        let mut free = self.free.lock().expect("failed to lock");
        free.entry(size).or_default().push_back(memory);
    }
}

struct Storage<M: Send + Sync + 'static> {
    memory: Option<M>,
    size: usize,
    allocator: Arc<dyn Allocator<Memory = M>>,
}

impl<M: Send + Sync + 'static> Drop for Storage<M> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.allocator.free(memory, self.size);
        }
    }
}

/// A device buffer handle. A root buffer owns its memory; aliases share it and never free it
/// on their own. The memory goes back to the allocator once the last handle is dropped.
pub struct Buffer<M: Send + Sync + 'static> {
    storage: Arc<Storage<M>>,
    root: bool,
}

impl<M: Send + Sync + 'static> std::fmt::Debug for Buffer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("root", &self.root)
            .finish()
    }
}

impl<M: Send + Sync + 'static> Buffer<M> {
    pub fn root(memory: M, size: usize, allocator: Arc<dyn Allocator<Memory = M>>) -> Self {
        let storage = Storage {
            memory: Some(memory),
            size,
            allocator,
        };
        Self {
            storage: Arc::new(storage),
            root: true,
        }
    }

    /// A non-owning handle to the same memory.
    #[inline]
    pub fn alias(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            root: false,
        }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Size of the memory in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.storage.size
    }

    #[inline]
    pub fn memory(&self) -> &M {
        self.storage
            .memory
            .as_ref()
            .expect("memory is only released on drop")
    }

    /// Returns `true` if both handles refer to the same memory.
    #[inline]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}
