//! The `Set<T>` trait and its implementations allow a single generic, overloaded `set<T>()` for
//! all supported item types.

use crate::error::Error;
use crate::platform::Platform;
use crate::{ItemInit, Nv};

pub trait Set<T> {
    fn set(&mut self, id: u16, value: T) -> Result<(), Error>;
}

impl<T, S: Set<T>> Set<T> for &mut S {
    fn set(&mut self, id: u16, value: T) -> Result<(), Error> {
        (*self).set(id, value)
    }
}

impl<T: Platform> Set<bool> for Nv<T> {
    fn set(&mut self, id: u16, value: bool) -> Result<(), Error> {
        self.set_bytes(id, &[value as u8])
    }
}

impl<T: Platform> Set<u8> for Nv<T> {
    fn set(&mut self, id: u16, value: u8) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<u16> for Nv<T> {
    fn set(&mut self, id: u16, value: u16) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<u32> for Nv<T> {
    fn set(&mut self, id: u16, value: u32) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<u64> for Nv<T> {
    fn set(&mut self, id: u16, value: u64) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<i8> for Nv<T> {
    fn set(&mut self, id: u16, value: i8) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<i16> for Nv<T> {
    fn set(&mut self, id: u16, value: i16) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<i32> for Nv<T> {
    fn set(&mut self, id: u16, value: i32) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<i64> for Nv<T> {
    fn set(&mut self, id: u16, value: i64) -> Result<(), Error> {
        self.set_bytes(id, &value.to_le_bytes())
    }
}

impl<T: Platform> Set<&[u8]> for Nv<T> {
    fn set(&mut self, id: u16, value: &[u8]) -> Result<(), Error> {
        self.set_bytes(id, value)
    }
}

impl<T: Platform> Nv<T> {
    /// Creates the item with `value` as initial content or rewrites an existing item of the same
    /// length.
    fn set_bytes(&mut self, id: u16, value: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(value.len()).map_err(|_| Error::InvalidLength)?;
        match self.init_item(id, len, Some(value))? {
            ItemInit::Created => Ok(()),
            ItemInit::AlreadyExists => {
                if self.item_length(id)? != len {
                    return Err(Error::LengthMismatch);
                }
                self.update_item(id, 0, value)
            }
        }
    }
}
