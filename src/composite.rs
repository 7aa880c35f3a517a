//! Composite (multi-attribute) keys.
//!
//! A [`CompositeKey`] wraps a tuple of components and orders lexicographically:
//! the first differing component decides. Component access and prefix
//! equality are resolved at compile time through per-arity trait impls
//! (tuples of one to four components are supported).
//!
//! ```
//! use bpindex::CompositeKey;
//!
//! let a = CompositeKey::new(("smith".to_string(), 32));
//! let b = CompositeKey::new(("smith".to_string(), 40));
//! assert!(a < b);
//! assert!(a.matches_prefix::<1>(&b));
//! assert_eq!(*a.get::<1>(), 32);
//! ```

/// A tuple key with lexicographic order and positional component access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompositeKey<T>(T);

impl<T> CompositeKey<T> {
    pub fn new(components: T) -> Self {
        CompositeKey(components)
    }

    pub fn components(&self) -> &T {
        &self.0
    }

    pub fn into_components(self) -> T {
        self.0
    }

    /// Reference to component `I`.
    pub fn get<const I: usize>(&self) -> &<T as TupleGet<I>>::Output
    where
        T: TupleGet<I>,
    {
        self.0.get()
    }

    /// True iff the first `N` components of both keys are equal.
    pub fn matches_prefix<const N: usize>(&self, other: &Self) -> bool
    where
        T: TuplePrefix<N>,
    {
        self.0.prefix_eq(&other.0)
    }
}

/// Positional access into a component tuple.
pub trait TupleGet<const I: usize> {
    type Output;

    fn get(&self) -> &Self::Output;
}

/// Equality over the first `N` components of a tuple.
pub trait TuplePrefix<const N: usize> {
    fn prefix_eq(&self, other: &Self) -> bool;
}

macro_rules! impl_tuple_get {
    ($(($($t:ident),+ ; $i:tt => $o:ident))+) => {
        $(
            impl<$($t),+> TupleGet<$i> for ($($t,)+) {
                type Output = $o;

                #[inline]
                fn get(&self) -> &$o {
                    &self.$i
                }
            }
        )+
    };
}

impl_tuple_get! {
    (A; 0 => A)
    (A, B; 0 => A)
    (A, B; 1 => B)
    (A, B, C; 0 => A)
    (A, B, C; 1 => B)
    (A, B, C; 2 => C)
    (A, B, C, D; 0 => A)
    (A, B, C, D; 1 => B)
    (A, B, C, D; 2 => C)
    (A, B, C, D; 3 => D)
}

macro_rules! impl_tuple_prefix {
    ($(($($t:ident),+ ; $n:literal => ($($j:tt),*)))+) => {
        $(
            impl<$($t: PartialEq),+> TuplePrefix<$n> for ($($t,)+) {
                #[inline]
                fn prefix_eq(&self, other: &Self) -> bool {
                    true $(&& self.$j == other.$j)*
                }
            }
        )+
    };
}

impl_tuple_prefix! {
    (A; 0 => ())
    (A; 1 => (0))
    (A, B; 0 => ())
    (A, B; 1 => (0))
    (A, B; 2 => (0, 1))
    (A, B, C; 0 => ())
    (A, B, C; 1 => (0))
    (A, B, C; 2 => (0, 1))
    (A, B, C; 3 => (0, 1, 2))
    (A, B, C, D; 0 => ())
    (A, B, C, D; 1 => (0))
    (A, B, C, D; 2 => (0, 1))
    (A, B, C, D; 3 => (0, 1, 2))
    (A, B, C, D; 4 => (0, 1, 2, 3))
}
