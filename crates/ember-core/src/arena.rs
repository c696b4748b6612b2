// SPDX-License-Identifier: CEPL-1.0
//! Fixed-capacity bump allocator for arrays of plain driver handles.
//!
//! An [`Arena`] hands out typed, contiguous, zero-initialised arrays as
//! [`Span`]s. Spans are plain indices, so several can be alive at once and
//! the arena can be borrowed independently to read or fill them.
//!
//! Freeing is strictly LIFO: only the most recent live allocation can be
//! returned with [`Arena::deallocate`]. [`Arena::clear`] drops everything at
//! once and bumps a generation counter so spans from before the clear are
//! rejected instead of aliasing newer data.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};

use bytemuck::Pod;
use thiserror::Error;

use crate::error::{EngineError, Origin, Severity};

/// Alignment of the backing words; element types may not exceed it.
const WORD: usize = size_of::<u64>();

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena `{arena}` out of memory: need {requested} bytes, {remaining} left")]
    OutOfMemory {
        arena: &'static str,
        requested: usize,
        remaining: usize,
    },
    #[error("arena `{arena}`: deallocation is not the most recent allocation")]
    OutOfOrder { arena: &'static str },
    #[error("arena `{arena}`: span outlived a clear()")]
    StaleSpan { arena: &'static str },
    #[error("arena `{arena}`: alignment {align} exceeds the 8-byte word")]
    Misaligned { arena: &'static str, align: usize },
}

impl ArenaError {
    pub fn origin(&self) -> Origin {
        match self {
            ArenaError::OutOfMemory { .. } => Origin::ArenaOutOfMemory,
            ArenaError::OutOfOrder { .. } | ArenaError::Misaligned { .. } => {
                Origin::IndexOutOfBounds
            }
            ArenaError::StaleSpan { .. } => Origin::NullDereference,
        }
    }

    pub fn into_engine(self, severity: Severity) -> EngineError {
        EngineError::new(severity, self.origin(), self.to_string())
    }
}

/// Typed handle to an array living inside an [`Arena`].
pub struct Span<T> {
    start: usize,
    len: usize,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Span<T> {
    /// A zero-length span that every arena accepts.
    pub const EMPTY: Span<T> = Span {
        start: 0,
        len: 0,
        generation: u32::MAX,
        _marker: PhantomData,
    };

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn end(&self) -> usize {
        self.start + self.len * size_of::<T>()
    }

    /// Extends `self` by a span allocated right behind it.
    ///
    /// Returns `None` when `next` is not adjacent (another allocation of a
    /// different type sits between them, or a clear happened).
    pub fn join(self, next: Span<T>) -> Option<Span<T>> {
        if self.is_empty() {
            return Some(next);
        }
        if next.generation != self.generation || next.start != self.end() {
            return None;
        }
        Some(Span {
            len: self.len + next.len,
            ..self
        })
    }
}

impl<T> Clone for Span<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Span<T> {}

impl<T> PartialEq for Span<T> {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.len == other.len && self.generation == other.generation
    }
}

impl<T> Eq for Span<T> {}

impl<T> Default for Span<T> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<T> fmt::Debug for Span<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("generation", &self.generation)
            .finish()
    }
}

pub struct Arena {
    name: &'static str,
    words: Box<[u64]>,
    capacity: usize,
    used: usize,
    /// `(used before, start)` of each live allocation, innermost last.
    marks: Vec<(usize, usize)>,
    generation: u32,
}

impl Arena {
    /// Reserves `capacity` bytes up front; nothing is allocated afterwards.
    ///
    /// A zero capacity is a configuration error. It is logged here and the
    /// first allocation then fails with [`ArenaError::OutOfMemory`].
    pub fn new(name: &'static str, capacity: usize) -> Self {
        if capacity == 0 {
            tracing::error!(arena = name, "arena constructed without a backing buffer");
        }
        Self {
            name,
            words: vec![0u64; capacity.div_ceil(WORD)].into_boxed_slice(),
            capacity,
            used: 0,
            marks: Vec::with_capacity(16),
            generation: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    /// Number of live allocations.
    #[inline]
    pub fn live(&self) -> usize {
        self.marks.len()
    }

    /// Allocates `count` zeroed elements of `T`.
    ///
    /// Fails without changing any state when the request (plus alignment
    /// padding) does not fit.
    pub fn allocate<T: Pod>(&mut self, count: usize) -> Result<Span<T>, ArenaError> {
        let align = align_of::<T>();
        if align > WORD {
            return Err(ArenaError::Misaligned {
                arena: self.name,
                align,
            });
        }

        let start = self.used.next_multiple_of(align);
        let end = size_of::<T>()
            .checked_mul(count)
            .and_then(|bytes| start.checked_add(bytes))
            .filter(|&end| end <= self.capacity)
            .ok_or(ArenaError::OutOfMemory {
                arena: self.name,
                requested: (start - self.used).saturating_add(size_of::<T>().saturating_mul(count)),
                remaining: self.remaining(),
            })?;

        self.bytes_mut()[start..end].fill(0);
        self.marks.push((self.used, start));
        self.used = end;

        Ok(Span {
            start,
            len: count,
            generation: self.generation,
            _marker: PhantomData,
        })
    }

    /// Returns the most recent live allocation to the arena.
    pub fn deallocate<T: Pod>(&mut self, span: Span<T>) -> Result<(), ArenaError> {
        if span.generation == u32::MAX && span.is_empty() {
            return Ok(());
        }
        self.check(&span)?;
        match self.marks.last() {
            Some(&(mark, start)) if span.start == start && span.end() == self.used => {
                self.used = mark;
                self.marks.pop();
                Ok(())
            }
            _ => Err(ArenaError::OutOfOrder { arena: self.name }),
        }
    }

    /// Drops every allocation. Elements are plain data and are not visited.
    pub fn clear(&mut self) {
        self.used = 0;
        self.marks.clear();
        self.generation = self.generation.wrapping_add(1) % u32::MAX;
    }

    pub fn get<T: Pod>(&self, span: Span<T>) -> Result<&[T], ArenaError> {
        if span.is_empty() {
            return Ok(Default::default());
        }
        self.check(&span)?;
        let bytes = &bytemuck::cast_slice::<u64, u8>(&self.words)[span.start..span.end()];
        bytemuck::try_cast_slice(bytes).map_err(|_| ArenaError::Misaligned {
            arena: self.name,
            align: align_of::<T>(),
        })
    }

    pub fn get_mut<T: Pod>(&mut self, span: Span<T>) -> Result<&mut [T], ArenaError> {
        if span.is_empty() {
            return Ok(Default::default());
        }
        self.check(&span)?;
        let name = self.name;
        let bytes = &mut self.bytes_mut()[span.start..span.end()];
        bytemuck::try_cast_slice_mut(bytes).map_err(|_| ArenaError::Misaligned {
            arena: name,
            align: align_of::<T>(),
        })
    }

    fn check<T>(&self, span: &Span<T>) -> Result<(), ArenaError> {
        if span.generation != self.generation || span.end() > self.used {
            return Err(ArenaError::StaleSpan { arena: self.name });
        }
        Ok(())
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..capacity]
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("used", &self.used)
            .field("capacity", &self.capacity)
            .field("live", &self.marks.len())
            .finish()
    }
}
