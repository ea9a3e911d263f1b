//! # FIR tap vectors and sample history
//!
//! The adaptive equalizer is a bank of short FIR filters. Each
//! filter output is the inner product of a tap vector
//! [`FilterCoeff`] with a [`Window`] of recent input samples.
//!
//! Sample history is ordered oldest-first:
//!
//! ```txt
//! // the sample L is the youngest sample, and O is the oldest
//! // [ O | N | M | L ]
//! ```
//!
//! and tap `h[0]` multiplies the *youngest* sample. The output is
//!
//! ```txt
//! out = Σ h[i] · history[len - 1 - i]
//! ```
//!
//! ## Zero-delay taps
//!
//! A filter of `len` taps whose only non-zero coefficient sits at
//! the [centre tap](centre_tap) reproduces its input delayed by
//! exactly that many samples. Stages which want outputs aligned
//! with their inputs (no group delay) emit the output for input
//! sample `n` once sample `n + centre_tap(len)` has been pushed.

use std::collections::VecDeque;
use std::convert::AsRef;

use nalgebra::base::Scalar;
use nalgebra::DVector;
use num_traits::{One, Zero};

/// Index of the centre tap of a `len`-tap filter
///
/// For odd lengths this is the middle tap. For even lengths it
/// is the tap just before the middle. Returns 0 for `len` of
/// zero or one.
#[inline]
pub fn centre_tap(len: usize) -> usize {
    ((len + 1) / 2).saturating_sub(1)
}

/// FIR filter coefficients
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCoeff<T>(DVector<T>)
where
    T: Copy + Scalar + One + Zero;

impl<T> FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    /// Create from slice
    ///
    /// `h[0]` multiplies the most recent sample.
    pub fn from_slice<S>(h: S) -> Self
    where
        S: AsRef<[T]>,
    {
        let inp = h.as_ref();
        FilterCoeff(DVector::from_iterator(inp.len(), inp.iter().copied()))
    }

    /// All-zero filter of `len` taps
    pub fn zeros(len: usize) -> Self {
        FilterCoeff(DVector::from_element(len, T::zero()))
    }

    /// Zero-delay identity filter
    ///
    /// A unit spike at [`centre_tap(len)`](centre_tap). An empty
    /// filter is returned for `len == 0`.
    pub fn from_centre_spike(len: usize) -> Self {
        let mut out = Self::zeros(len);
        if len > 0 {
            out.0[centre_tap(len)] = T::one();
        }
        out
    }

    /// Number of filter coefficients
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no coefficients
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Perform FIR filtering with the given sample history
    ///
    /// `history` outputs the oldest sample first and the newest
    /// sample last. The newest sample is multiplied by `h[0]`.
    /// A short history is treated as zero-padded; excess
    /// history is ignored.
    pub fn filter<W, In, Out>(&self, history: W) -> Out
    where
        W: IntoIterator<Item = In>,
        W::IntoIter: DoubleEndedIterator,
        In: Copy + Scalar + std::ops::Mul<T, Output = Out>,
        Out: Copy + Scalar + Zero + std::ops::AddAssign,
    {
        multiply_accumulate(history, self.as_ref())
    }

    /// Return filter coefficients as slice
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        self.0.as_slice()
    }

    /// Return filter coefficients as mutable slice
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.0.as_mut_slice()
    }

    /// Obtain filter coefficients
    #[inline]
    pub fn inner(&self) -> &DVector<T> {
        &self.0
    }
}

impl<T> AsRef<[T]> for FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    #[inline]
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> AsMut<[T]> for FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    #[inline]
    fn as_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> std::ops::Index<usize> for FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    type Output = T;

    #[inline]
    fn index(&self, ind: usize) -> &T {
        self.0.index(ind)
    }
}

impl<T> std::ops::IndexMut<usize> for FilterCoeff<T>
where
    T: Copy + Scalar + One + Zero,
{
    #[inline]
    fn index_mut(&mut self, ind: usize) -> &mut T {
        self.0.index_mut(ind)
    }
}

/// Sample history
///
/// A fixed-size lookback window. New samples enter on the
/// right and the oldest samples age off the left. A new
/// window is full of zeros.
#[derive(Clone, Debug, PartialEq)]
pub struct Window<T>(VecDeque<T>)
where
    T: Copy + Scalar + Zero;

impl<T> Window<T>
where
    T: Copy + Scalar + Zero,
{
    /// Create a zero-filled window of `len` samples
    pub fn new(len: usize) -> Self {
        let mut q = VecDeque::with_capacity(len);
        q.resize(len, T::zero());
        Self(q)
    }

    /// Window length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the window holds no samples at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one sample
    ///
    /// Returns the sample which aged off, or zero if the
    /// window is empty.
    #[inline]
    pub fn push_scalar(&mut self, input: T) -> T {
        if self.0.is_empty() {
            return T::zero();
        }
        let out = self.0.pop_front().unwrap_or(T::zero());
        self.0.push_back(input);
        out
    }

    /// Iterator over window contents, oldest first
    pub fn iter(&self) -> <&Window<T> as IntoIterator>::IntoIter {
        self.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Window<T>
where
    T: Copy + Scalar + Zero,
{
    type Item = T;

    type IntoIter = std::iter::Copied<std::collections::vec_deque::Iter<'a, T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

// Multiply-accumulate
//
// ```txt
// out = Σ history[N - 1 - i] * coeff[i]
// ```
//
// The most recent sample is `history[N-1]`. The two inputs
// need not be the same length; missing history is zero.
fn multiply_accumulate<W, In, Coeff, Out>(history: W, coeff: &[Coeff]) -> Out
where
    W: IntoIterator<Item = In>,
    W::IntoIter: DoubleEndedIterator,
    In: Copy + Scalar + std::ops::Mul<Coeff, Output = Out>,
    Coeff: Copy + Scalar,
    Out: Copy + Scalar + Zero + std::ops::AddAssign,
{
    let mut out = Out::zero();
    for (hi, co) in history.into_iter().rev().zip(coeff.iter()) {
        out += hi * *co;
    }
    out
}
