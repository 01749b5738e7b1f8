//! Element types a kernel signature can be instantiated over.

use core::fmt::Debug;
use core::ops::{Add, Div, Mul, Sub};

/// A floating-point element stored in device buffers.
///
/// Implemented for `f32` and `f64`. GPU candidates only exist for
/// [`SHADER_NATIVE`](Element::SHADER_NATIVE) types and stage through
/// [`Element::to_f32`] / [`Element::from_f32`].
pub trait Element:
    Copy
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    /// Short type name used in op signatures (`"f32"`, `"f64"`).
    const NAME: &'static str;

    /// Whether WGSL compute shaders store and compute this type natively.
    const SHADER_NATIVE: bool;

    fn sqrt(self) -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl Element for f32 {
    const NAME: &'static str = "f32";
    const SHADER_NATIVE: bool = true;

    #[inline]
    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f64 {
    const NAME: &'static str = "f64";
    const SHADER_NATIVE: bool = false;

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        v as f64
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
}
