use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::descriptor::Descriptor;
use crate::globals::ALLOCATION_GRANULARITY;
use crate::util::align_up;

// Object layout
//
// +-----------+--------------------------------------------------------+
// | word 0    | &'static VTable | PINNED | FORWARDED                    |
// |           | or destination address | FORWARDED once evacuated      |
// +-----------+--------------------------------------------------------+
// | word 1    | element count (vectors only)                           |
// +-----------+--------------------------------------------------------+
// | ...       | payload                                                |
// +-----------+--------------------------------------------------------+
//
// A free slot keeps the intrusive free-list link in word 0. That link is either
// null or points into the slot's own block, which a vtable address never does.

pub const FORWARDED_BIT: usize = 0b01;
pub const PINNED_BIT: usize = 0b10;
pub const HEADER_TAG_MASK: usize = FORWARDED_BIT | PINNED_BIT;

pub const VECTOR_LENGTH_WORD: usize = 1;
pub const VECTOR_DATA_WORD: usize = 2;

/// Per-type metadata every object header points to.
#[derive(Debug)]
pub struct VTable {
    pub name: &'static str,
    pub descriptor: Descriptor,
    /// Size in bytes of non-vector instances, header included.
    pub instance_size: usize,
    /// Size in bytes of one vector element.
    pub element_size: usize,
}

impl VTable {
    pub const fn new(name: &'static str, descriptor: Descriptor, instance_size: usize) -> Self {
        Self {
            name,
            descriptor,
            instance_size,
            element_size: 0,
        }
    }

    pub const fn vector(
        name: &'static str,
        elements: crate::descriptor::VectorElements,
        element_size: usize,
    ) -> Self {
        Self::vector_of(name, Descriptor::Vector(elements), element_size)
    }

    pub const fn vector_of(name: &'static str, descriptor: Descriptor, element_size: usize) -> Self {
        Self {
            name,
            descriptor,
            instance_size: VECTOR_DATA_WORD * size_of::<usize>(),
            element_size,
        }
    }

    #[inline]
    pub fn is_vector(&self) -> bool {
        matches!(
            self.descriptor,
            Descriptor::Vector(_) | Descriptor::ComplexArray(_)
        )
    }

    #[inline]
    pub fn has_references(&self) -> bool {
        self.descriptor.has_references()
    }

    /// Allocation size of an instance, `length` is ignored for non-vectors.
    pub fn object_size(&self, length: usize) -> usize {
        self.checked_object_size(length).unwrap_or(usize::MAX)
    }

    /// Like [`object_size`](Self::object_size), `None` if the size overflows.
    pub fn checked_object_size(&self, length: usize) -> Option<usize> {
        let size = if self.is_vector() {
            length
                .checked_mul(self.element_size)?
                .checked_add(self.instance_size)?
        } else {
            self.instance_size
        };
        let size = size.max(size_of::<usize>());
        size.checked_add(ALLOCATION_GRANULARITY - 1)?;
        Some(align_up(size, ALLOCATION_GRANULARITY))
    }
}

/// Reference to an object header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjRef(NonNull<AtomicUsize>);

unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:p})", self.0.as_ptr())
    }
}

impl ObjRef {
    /// # Safety
    /// `addr` must be zero or the address of an initialized object.
    #[inline]
    pub unsafe fn from_address(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut AtomicUsize).map(Self)
    }

    /// Reads a reference out of `slot`.
    #[inline]
    pub fn load(slot: &AtomicUsize) -> Option<Self> {
        unsafe { Self::from_address(slot.load(Ordering::Relaxed)) }
    }

    #[inline]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline]
    pub(crate) fn header(&self) -> &AtomicUsize {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub fn header_word(self) -> usize {
        self.header().load(Ordering::Acquire)
    }

    /// Word `index` of the object, word 0 being the header.
    #[inline]
    pub fn slot(&self, index: usize) -> &AtomicUsize {
        unsafe { &*self.0.as_ptr().add(index) }
    }

    #[inline]
    pub fn vtable(self) -> &'static VTable {
        let word = self.header_word();
        debug_assert_eq!(word & FORWARDED_BIT, 0, "vtable of a forwarded object");
        unsafe { &*((word & !HEADER_TAG_MASK) as *const VTable) }
    }

    #[inline]
    pub fn forwarded(self) -> Option<ObjRef> {
        decode_forwarding(self.header_word())
    }

    /// Destination encoded in a header word, if the word is a forwarding pointer.
    #[inline]
    pub fn decode_forwarding(word: usize) -> Option<ObjRef> {
        decode_forwarding(word)
    }

    #[inline]
    pub fn is_pinned(self) -> bool {
        self.header_word() & PINNED_BIT != 0
    }

    /// Sets the pinned bit, returns true if it was clear.
    pub fn set_pinned(self) -> bool {
        self.header().fetch_or(PINNED_BIT, Ordering::AcqRel) & PINNED_BIT == 0
    }

    #[inline]
    pub fn length(self) -> usize {
        self.slot(VECTOR_LENGTH_WORD).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn size(self) -> usize {
        self.vtable().object_size(self.length_if_vector())
    }

    #[inline]
    fn length_if_vector(self) -> usize {
        if self.vtable().is_vector() {
            self.length()
        } else {
            0
        }
    }

    pub fn field(self, index: usize) -> Option<ObjRef> {
        Self::load(self.slot(index))
    }

    /// Plain store; the caller is responsible for the write barrier.
    pub fn set_field(self, index: usize, value: Option<ObjRef>) {
        self.slot(index)
            .store(value.map_or(0, ObjRef::address), Ordering::Relaxed);
    }

    /// Writes the header (and the length of vectors) into freshly allocated memory.
    ///
    /// # Safety
    /// `at` must point to at least `vtable.object_size(length)` writable bytes.
    pub unsafe fn initialize(at: *mut u8, vtable: &'static VTable, length: usize) -> ObjRef {
        let obj = ObjRef(NonNull::new_unchecked(at.cast()));
        if vtable.is_vector() {
            obj.slot(VECTOR_LENGTH_WORD)
                .store(length, Ordering::Relaxed);
        }
        obj.header()
            .store(vtable as *const VTable as usize, Ordering::Release);
        obj
    }

    /// Writes the header of an evacuated copy whose payload is already in place.
    pub(crate) unsafe fn initialize_header(at: usize, header: usize) -> ObjRef {
        let obj = ObjRef(NonNull::new_unchecked(at as *mut AtomicUsize));
        obj.header()
            .store(header & !HEADER_TAG_MASK, Ordering::Relaxed);
        obj
    }

    /// Publishes `dest` as the new location of this object. The caller must
    /// have made the contents of `dest` visible beforehand. On failure returns the
    /// header word found instead of `expected`.
    pub(crate) fn try_forward(self, expected: usize, dest: ObjRef) -> Result<(), usize> {
        debug_assert_eq!(expected & FORWARDED_BIT, 0);
        self.header()
            .compare_exchange(
                expected,
                dest.address() | FORWARDED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
    }

    /// Single-threaded variant of [`ObjRef::try_forward`].
    pub(crate) fn forward_unsync(self, dest: ObjRef) {
        self.header()
            .store(dest.address() | FORWARDED_BIT, Ordering::Release);
    }
}

#[inline]
fn decode_forwarding(word: usize) -> Option<ObjRef> {
    if word & FORWARDED_BIT != 0 {
        unsafe { ObjRef::from_address(word & !HEADER_TAG_MASK) }
    } else {
        None
    }
}
