use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// An atomic cell with an `u8` storage and typed access through conversion
/// traits, used for the small state enums in this crate.
///
/// `Acquire` ordering is used for loads and `Release` for stores; the
/// compare-and-swap uses `AcqRel`. The mutex/condvar handshake in the
/// worker provides the stronger ordering where it is needed.
#[derive(Debug)]
pub(crate) struct AtomicEnum<T>(AtomicU8, PhantomData<T>)
where
    T: From<u8> + Into<u8> + Copy;

impl<T> AtomicEnum<T>
where
    T: From<u8> + Into<u8> + Copy,
{
    pub const fn new(value: u8) -> Self {
        Self(AtomicU8::new(value), PhantomData)
    }

    pub fn get(&self) -> T {
        self.0.load(Ordering::Acquire).into()
    }

    pub fn set(&self, value: T) {
        self.0.store(value.into(), Ordering::Release)
    }

    /// Transition from `current` to `new`. On failure, returns the value
    /// actually observed.
    pub fn cas(&self, current: T, new: T) -> Result<(), T> {
        match self.0.compare_exchange(
            current.into(),
            new.into(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(actual) => Err(actual.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    enum Tri {
        A,
        B,
        C,
    }
    impl From<u8> for Tri {
        fn from(value: u8) -> Self {
            match value {
                0 => Self::A,
                1 => Self::B,
                _ => Self::C,
            }
        }
    }
    impl From<Tri> for u8 {
        fn from(value: Tri) -> Self {
            value as Self
        }
    }

    #[test]
    fn get_set_cas() {
        let x: AtomicEnum<Tri> = AtomicEnum::new(Tri::A as u8);
        assert_eq!(x.get(), Tri::A);
        x.set(Tri::B);
        assert_eq!(x.get(), Tri::B);
        assert_eq!(x.cas(Tri::B, Tri::C), Ok(()));
        assert_eq!(x.cas(Tri::B, Tri::A), Err(Tri::C));
        assert_eq!(x.get(), Tri::C);
    }
}
