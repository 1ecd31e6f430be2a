//! The `Get<T>` trait and its implementations allow a single generic, overloaded `get<T>()` for
//! all supported item types.

use crate::Nv;
use crate::error::Error;
use crate::platform::Platform;
use alloc::vec;
use alloc::vec::Vec;

pub trait Get<T> {
    fn get(&mut self, id: u16) -> Result<T, Error>;
}

impl<T, G: Get<T>> Get<T> for &mut G {
    fn get(&mut self, id: u16) -> Result<T, Error> {
        (*self).get(id)
    }
}

impl<T: Platform> Get<bool> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<bool, Error> {
        let [value] = self.get_array::<1>(id)?;
        Ok(value != 0)
    }
}

impl<T: Platform> Get<u8> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<u8, Error> {
        Ok(u8::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<u16> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<u32> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<u64> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<i8> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<i8, Error> {
        Ok(i8::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<i16> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<i16, Error> {
        Ok(i16::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<i32> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<i64> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.get_array(id)?))
    }
}

impl<T: Platform> Get<Vec<u8>> for Nv<T> {
    fn get(&mut self, id: u16) -> Result<Vec<u8>, Error> {
        let len = self.item_length(id)?;
        if len == 0 {
            return Err(Error::ItemNotFound);
        }
        let mut buf = vec![0u8; len as usize];
        self.read_item(id, 0, &mut buf)?;
        Ok(buf)
    }
}

impl<T: Platform> Nv<T> {
    /// Reads an item that has to be exactly `N` bytes long.
    fn get_array<const N: usize>(&mut self, id: u16) -> Result<[u8; N], Error> {
        match self.item_length(id)? {
            0 => Err(Error::ItemNotFound),
            len if len as usize != N => Err(Error::LengthMismatch),
            _ => {
                let mut buf = [0u8; N];
                self.read_item(id, 0, &mut buf)?;
                Ok(buf)
            }
        }
    }
}
