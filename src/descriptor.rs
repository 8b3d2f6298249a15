//! Object layout descriptors.
//!
//! A descriptor tells the scanner where the references of an object live. Offsets
//! and bitmaps are expressed in words from the start of the object, word 0 being
//! the header, so bit 0 of a bitmap is never set.

use std::sync::atomic::AtomicUsize;

use crate::object::{ObjRef, VECTOR_DATA_WORD};

const BITS_PER_WORD: usize = usize::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// `count` consecutive references starting at word `first`.
    RunLength { first: u16, count: u16 },
    /// Small object without references.
    SmallPtrFree,
    /// Bit `i` set means word `i` holds a reference.
    Bitmap(usize),
    /// Like [`Descriptor::Bitmap`] for objects larger than a machine word of bits.
    Complex(&'static [usize]),
    /// Length-prefixed array, see [`VectorElements`].
    Vector(VectorElements),
    /// Array of multi-word value types. Bit `i` of the bitmap refers to word `i` of
    /// every element.
    ComplexArray(&'static [usize]),
    /// Object without references that is too big to be described as small.
    ComplexPtrFree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorElements {
    Refs,
    PtrFree,
    /// Value type elements, bit `i` set means word `i` of each element is a reference.
    ValueType(usize),
}

impl Descriptor {
    pub fn has_references(&self) -> bool {
        match *self {
            Descriptor::RunLength { count, .. } => count != 0,
            Descriptor::SmallPtrFree | Descriptor::ComplexPtrFree => false,
            Descriptor::Bitmap(bits) => bits != 0,
            Descriptor::Complex(bitmap) | Descriptor::ComplexArray(bitmap) => {
                bitmap.iter().any(|w| *w != 0)
            }
            Descriptor::Vector(VectorElements::PtrFree) => false,
            Descriptor::Vector(VectorElements::ValueType(bits)) => bits != 0,
            Descriptor::Vector(VectorElements::Refs) => true,
        }
    }

    /// Calls `visit` with every reference slot of `obj`.
    ///
    /// `element_size` is only consulted for vectors.
    pub fn for_each_slot(&self, obj: ObjRef, element_size: usize, mut visit: impl FnMut(&AtomicUsize)) {
        match *self {
            Descriptor::SmallPtrFree | Descriptor::ComplexPtrFree => {}
            Descriptor::RunLength { first, count } => {
                for i in first as usize..first as usize + count as usize {
                    visit(obj.slot(i));
                }
            }
            Descriptor::Bitmap(bits) => visit_bits(bits, 0, |i| visit(obj.slot(i))),
            Descriptor::Complex(bitmap) => {
                for (w, bits) in bitmap.iter().enumerate() {
                    visit_bits(*bits, w * BITS_PER_WORD, |i| visit(obj.slot(i)));
                }
            }
            Descriptor::Vector(elements) => {
                let length = obj.length();
                match elements {
                    VectorElements::PtrFree => {}
                    VectorElements::Refs => {
                        for i in 0..length {
                            visit(obj.slot(VECTOR_DATA_WORD + i));
                        }
                    }
                    VectorElements::ValueType(bits) => {
                        let element_words = element_size / core::mem::size_of::<usize>();
                        for e in 0..length {
                            let base = VECTOR_DATA_WORD + e * element_words;
                            visit_bits(bits, base, |i| visit(obj.slot(i)));
                        }
                    }
                }
            }
            Descriptor::ComplexArray(bitmap) => {
                let element_words = element_size / core::mem::size_of::<usize>();
                for e in 0..obj.length() {
                    let base = VECTOR_DATA_WORD + e * element_words;
                    for (w, bits) in bitmap.iter().enumerate() {
                        visit_bits(*bits, base + w * BITS_PER_WORD, |i| visit(obj.slot(i)));
                    }
                }
            }
        }
    }
}

#[inline]
fn visit_bits(mut bits: usize, base: usize, mut visit: impl FnMut(usize)) {
    while bits != 0 {
        let shift = bits.trailing_zeros() as usize;
        visit(base + shift);
        bits &= bits - 1;
    }
}
