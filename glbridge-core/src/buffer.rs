//! Typed buffer exchange between script-owned arrays and native memory.
//!
//! ```text
//!  ScriptBuffer (runtime-owned)          native side
//!  ┌──────────────────────────┐
//!  │ ArrayStorage  [bytes...] │──as_native_view()──► BufferView<'call>
//!  └──────────────────────────┘                          │
//!              ▲                                         │ copy_out()
//!              │ write_back()                            ▼
//!              └────────────────────────────────── OwnedBuffer ──► render thread
//! ```
//!
//! A [`BufferView`] borrows the script storage for the duration of the
//! originating call; its lifetime ties it to the handle, so it can never be
//! carried into a command. Anything that runs on the render thread works on
//! an [`OwnedBuffer`] allocated through the runtime's [`HostAllocator`].
//!
//! At most one exchange is in flight per backing storage: a second
//! `as_native_view` on any handle sharing that storage fails with
//! `InvalidBuffer` until the first view is dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BridgeError, BridgeResult};

// ───────────────────────────────────────────────────────────────────
// Element types
// ───────────────────────────────────────────────────────────────────

/// Numeric element types the bridge accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::Uint8 | ElementType::Uint8Clamped => 1,
            ElementType::Int16 | ElementType::Uint16 => 2,
            ElementType::Int32 | ElementType::Uint32 | ElementType::Float32 => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Int8 => "Int8Array",
            ElementType::Uint8 => "Uint8Array",
            ElementType::Uint8Clamped => "Uint8ClampedArray",
            ElementType::Int16 => "Int16Array",
            ElementType::Uint16 => "Uint16Array",
            ElementType::Int32 => "Int32Array",
            ElementType::Uint32 => "Uint32Array",
            ElementType::Float32 => "Float32Array",
        }
    }

    /// Whether arrays of this type are plain byte arrays.
    pub const fn is_bytes(self) -> bool {
        matches!(self, ElementType::Uint8 | ElementType::Uint8Clamped)
    }
}

/// Array kind as reported by the scripting runtime.
///
/// Only `Typed` kinds are exchangeable; the others exist so the runtime can
/// hand over whatever it has and get a precise rejection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    Typed(ElementType),
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl ArrayKind {
    pub const fn element_size(self) -> usize {
        match self {
            ArrayKind::Typed(e) => e.size(),
            ArrayKind::Float64 | ArrayKind::BigInt64 | ArrayKind::BigUint64 => 8,
            ArrayKind::DataView => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ArrayKind::Typed(e) => e.name(),
            ArrayKind::Float64 => "Float64Array",
            ArrayKind::BigInt64 => "BigInt64Array",
            ArrayKind::BigUint64 => "BigUint64Array",
            ArrayKind::DataView => "DataView",
        }
    }
}

/// Rust scalar types that map onto an [`ElementType`].
pub trait Element: bytemuck::Pod {
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;
        })*
    };
}

impl_element!(
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    f32 => Float32,
);

fn decode_elements<T: Element>(element: ElementType, bytes: &[u8]) -> BridgeResult<Vec<T>> {
    let compatible = T::TYPE == element || (T::TYPE.is_bytes() && element.is_bytes());
    if !compatible {
        return Err(BridgeError::UnsupportedElementType(format!(
            "cannot read {} as {}",
            element.name(),
            T::TYPE.name()
        )));
    }
    Ok(bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

// ───────────────────────────────────────────────────────────────────
// Host allocator
// ───────────────────────────────────────────────────────────────────

/// Allocation callbacks supplied by the scripting runtime's memory model.
///
/// Owned copies are carved out of `allocate` and handed back to `release`
/// when the bridge is done with them.
pub trait HostAllocator: Send + Sync {
    /// Return zero-filled storage of exactly `byte_len` bytes.
    fn allocate(&self, byte_len: usize) -> Vec<u8>;
    fn release(&self, storage: Vec<u8>);
}

/// Allocator backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl HostAllocator for SystemAllocator {
    fn allocate(&self, byte_len: usize) -> Vec<u8> {
        vec![0; byte_len]
    }

    fn release(&self, storage: Vec<u8>) {
        drop(storage);
    }
}

pub fn system_allocator() -> Arc<dyn HostAllocator> {
    Arc::new(SystemAllocator)
}

// ───────────────────────────────────────────────────────────────────
// Script-side handles
// ───────────────────────────────────────────────────────────────────

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

struct ArrayStorage {
    id: u64,
    bytes: Mutex<Vec<u8>>,
    resizable: bool,
    detached: AtomicBool,
    /// Set while a `BufferView` over this storage is alive.
    exchanging: AtomicBool,
}

impl ArrayStorage {
    fn new(bytes: Vec<u8>, resizable: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            bytes: Mutex::new(bytes),
            resizable,
            detached: AtomicBool::new(false),
            exchanging: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A script-visible binary array: a typed window over runtime-owned storage.
///
/// Cloning a handle (or taking a `subarray`) shares the backing storage,
/// exactly like typed arrays sharing one `ArrayBuffer`.
#[derive(Clone)]
pub struct ScriptBuffer {
    storage: Arc<ArrayStorage>,
    kind: ArrayKind,
    byte_offset: usize,
    length: usize,
}

impl ScriptBuffer {
    /// Zero-filled array of `length` elements.
    pub fn new(kind: ArrayKind, length: usize) -> Self {
        Self::from_bytes(kind, vec![0; length * kind.element_size()])
    }

    /// Array over `bytes`; trailing bytes that do not form a whole element
    /// stay in the storage but outside the view.
    pub fn from_bytes(kind: ArrayKind, bytes: Vec<u8>) -> Self {
        let length = bytes.len() / kind.element_size();
        Self {
            storage: ArrayStorage::new(bytes, false),
            kind,
            byte_offset: 0,
            length,
        }
    }

    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self::from_bytes(
            ArrayKind::Typed(T::TYPE),
            bytemuck::cast_slice::<T, u8>(data).to_vec(),
        )
    }

    /// Array backed by growable storage; never exchangeable.
    pub fn resizable(kind: ArrayKind, bytes: Vec<u8>) -> Self {
        let length = bytes.len() / kind.element_size();
        Self {
            storage: ArrayStorage::new(bytes, true),
            kind,
            byte_offset: 0,
            length,
        }
    }

    /// View over elements `start..end` sharing this array's storage.
    pub fn subarray(&self, start: usize, end: usize) -> BridgeResult<ScriptBuffer> {
        if start > end || end > self.length {
            return Err(BridgeError::invalid_argument(format!(
                "subarray {start}..{end} outside array of {} elements",
                self.length
            )));
        }
        Ok(Self {
            storage: self.storage.clone(),
            kind: self.kind,
            byte_offset: self.byte_offset + start * self.kind.element_size(),
            length: end - start,
        })
    }

    /// Detach the backing storage (transfer or collection by the runtime).
    pub fn detach(&self) {
        let mut bytes = self.storage.lock();
        self.storage.detached.store(true, Ordering::Release);
        bytes.clear();
        bytes.shrink_to_fit();
    }

    /// Script-side write at `byte_index` within this array.
    pub fn write_bytes(&self, byte_index: usize, data: &[u8]) -> BridgeResult<()> {
        let end = byte_index
            .checked_add(data.len())
            .filter(|end| *end <= self.byte_len())
            .ok_or_else(|| BridgeError::invalid_argument("write outside array bounds"))?;
        let mut bytes = self.storage.lock();
        if self.storage.detached.load(Ordering::Acquire) {
            return Err(BridgeError::invalid_buffer("storage is detached"));
        }
        let start = self.byte_offset + byte_index;
        bytes[start..self.byte_offset + end].copy_from_slice(data);
        Ok(())
    }

    /// Script-side snapshot of this array's bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bytes = self.storage.lock();
        bytes
            .get(self.byte_offset..self.byte_offset + self.byte_len())
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn storage_id(&self) -> u64 {
        self.storage.id
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn byte_len(&self) -> usize {
        self.length * self.kind.element_size()
    }

    pub fn is_detached(&self) -> bool {
        self.storage.detached.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ScriptBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptBuffer")
            .field("storage", &self.storage.id)
            .field("kind", &self.kind.name())
            .field("byte_offset", &self.byte_offset)
            .field("length", &self.length)
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// Borrowed views
// ───────────────────────────────────────────────────────────────────

struct ExchangeGuard<'a> {
    storage: &'a ArrayStorage,
}

impl<'a> ExchangeGuard<'a> {
    fn acquire(storage: &'a ArrayStorage) -> BridgeResult<Self> {
        storage
            .exchanging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                BridgeError::invalid_buffer(format!(
                    "an exchange is already in flight for storage #{}",
                    storage.id
                ))
            })?;
        Ok(Self { storage })
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.storage.exchanging.store(false, Ordering::Release);
    }
}

/// Borrowed native window over a script array, valid for the current call.
pub struct BufferView<'a> {
    bytes: MutexGuard<'a, Vec<u8>>,
    _exchange: ExchangeGuard<'a>,
    byte_offset: usize,
    byte_len: usize,
    element: ElementType,
}

impl<'a> BufferView<'a> {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[self.byte_offset..self.byte_offset + self.byte_len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let range = self.byte_offset..self.byte_offset + self.byte_len;
        &mut self.bytes[range]
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.byte_len / self.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len == 0
    }

    pub fn elements<T: Element>(&self) -> BridgeResult<Vec<T>> {
        decode_elements(self.element, self.bytes())
    }

    /// Copy the whole view into bridge-owned memory.
    pub fn copy_out(&self, allocator: &Arc<dyn HostAllocator>) -> OwnedBuffer {
        log::trace!("copying {} bytes out of a {}", self.byte_len, self.element.name());
        OwnedBuffer::from_slice_in(allocator, self.element, self.bytes())
    }

    /// Copy `byte_len` bytes starting at `byte_start` (relative to the view).
    pub fn copy_range_out(
        &self,
        allocator: &Arc<dyn HostAllocator>,
        byte_start: usize,
        byte_len: usize,
    ) -> BridgeResult<OwnedBuffer> {
        let end = byte_start
            .checked_add(byte_len)
            .filter(|end| *end <= self.byte_len)
            .ok_or_else(|| {
                BridgeError::invalid_argument(format!(
                    "range {byte_start}+{byte_len} outside view of {} bytes",
                    self.byte_len
                ))
            })?;
        Ok(OwnedBuffer::from_slice_in(
            allocator,
            self.element,
            &self.bytes()[byte_start..end],
        ))
    }
}

impl fmt::Debug for BufferView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("element", &self.element)
            .field("byte_offset", &self.byte_offset)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

/// Borrow a native view over `handle`.
///
/// Fails with `UnsupportedElementType` for non-numeric or 64-bit arrays and
/// with `InvalidBuffer` for resizable, detached, busy or out-of-bounds
/// storage.
pub fn as_native_view(handle: &ScriptBuffer) -> BridgeResult<BufferView<'_>> {
    let element = match handle.kind {
        ArrayKind::Typed(element) => element,
        other => return Err(BridgeError::UnsupportedElementType(other.name().to_string())),
    };
    let storage = &*handle.storage;
    if storage.resizable {
        return Err(BridgeError::invalid_buffer(format!(
            "{} is backed by resizable storage",
            element.name()
        )));
    }

    let exchange = ExchangeGuard::acquire(storage)?;
    let bytes = storage.lock();
    if storage.detached.load(Ordering::Acquire) {
        return Err(BridgeError::invalid_buffer("storage is detached"));
    }

    let byte_len = handle.length * element.size();
    handle
        .byte_offset
        .checked_add(byte_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| BridgeError::invalid_buffer("view extends past its storage"))?;

    Ok(BufferView {
        bytes,
        _exchange: exchange,
        byte_offset: handle.byte_offset,
        byte_len,
        element,
    })
}

/// Copy a borrowed view into bridge-owned memory.
pub fn copy_out(view: &BufferView<'_>, allocator: &Arc<dyn HostAllocator>) -> OwnedBuffer {
    view.copy_out(allocator)
}

/// Copy `owned` into the front of the script array behind `handle`.
pub fn write_back(owned: &OwnedBuffer, handle: &ScriptBuffer) -> BridgeResult<()> {
    let mut view = as_native_view(handle)?;
    let needed = owned.byte_len();
    if needed > view.byte_len() {
        return Err(BridgeError::invalid_argument(format!(
            "destination holds {} bytes, {needed} required",
            view.byte_len()
        )));
    }
    view.bytes_mut()[..needed].copy_from_slice(owned.bytes());
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Owned copies
// ───────────────────────────────────────────────────────────────────

/// Bridge-owned bytes, independent of any script storage lifetime.
///
/// Storage comes from a [`HostAllocator`] and is returned to it on drop.
pub struct OwnedBuffer {
    bytes: Vec<u8>,
    element: ElementType,
    allocator: Arc<dyn HostAllocator>,
}

impl OwnedBuffer {
    pub fn zeroed_in(allocator: &Arc<dyn HostAllocator>, element: ElementType, byte_len: usize) -> Self {
        let mut bytes = allocator.allocate(byte_len);
        bytes.resize(byte_len, 0);
        Self {
            bytes,
            element,
            allocator: allocator.clone(),
        }
    }

    pub fn from_slice_in(allocator: &Arc<dyn HostAllocator>, element: ElementType, data: &[u8]) -> Self {
        let mut owned = Self::zeroed_in(allocator, element, data.len());
        owned.bytes.copy_from_slice(data);
        owned
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn elements<T: Element>(&self) -> BridgeResult<Vec<T>> {
        decode_elements(self.element, &self.bytes)
    }
}

impl Clone for OwnedBuffer {
    fn clone(&self) -> Self {
        Self::from_slice_in(&self.allocator, self.element, &self.bytes)
    }
}

impl PartialEq for OwnedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element && self.bytes == other.bytes
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("element", &self.element)
            .field("byte_len", &self.bytes.len())
            .finish()
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        self.allocator.release(std::mem::take(&mut self.bytes));
    }
}

// ===================================================================
// Tests
// ===================================================================
