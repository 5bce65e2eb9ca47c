//! Virtual register table: a device's register file mapped onto one flat buffer.

use bitmaps::Bitmap;
use heapless::Vec;

use crate::transport::{
    LinkError,
    config::{MAX_BURST_REGISTERS, REGISTER_COUNT},
};

/// Sizes of consecutive registers covered by one burst transfer.
pub type BurstSizes = Vec<u16, MAX_BURST_REGISTERS>;

/// Generates little-endian typed getters and setters for one width.
macro_rules! impl_typed_register {
    ($type:ty, $width:literal) => {
        paste::paste! {
            #[doc = "Reads the register as a little-endian `" $type "`."]
            #[doc = ""]
            #[doc = "# Errors"]
            #[doc = "* [`LinkError::InvalidRegister`] - register is not defined"]
            #[doc = "* [`LinkError::SizeMismatch`] - declared size is not " $width " bytes"]
            pub fn [<reg_ $type>](&self, addr: u8) -> Result<$type, LinkError> {
                let width = check_width(self.size(addr), addr, $width)?;
                let bytes = self.at(addr)?;
                let mut raw = [0u8; $width];
                raw[..width].copy_from_slice(&bytes[..width]);
                Ok(<$type>::from_le_bytes(raw))
            }

            #[doc = "Writes a little-endian `" $type "` into the register buffer."]
            pub fn [<set_reg_ $type>](&mut self, addr: u8, value: $type) -> Result<(), LinkError> {
                let width = check_width(self.size(addr), addr, $width)?;
                let raw = value.to_le_bytes();
                self.at_mut(addr)?.copy_from_slice(&raw[..width]);
                Ok(())
            }
        }
    };
}

/// Register file of one device.
///
/// Built once from a 256-entry size table. Each register with a non-zero
/// size owns a fixed slice of the backing buffer; offsets are the cumulative
/// sum of the sizes before it, so the shape never changes after construction.
///
/// Every register starts out stale. It turns fresh when a transfer stores a
/// value into it and stale again on [`RegisterTable::invalidate`], which links
/// call when the device reports that it reset.
///
/// # Const Generics
/// - `N`: Backing buffer capacity in bytes
pub struct RegisterTable<const N: usize> {
    sizes: [u16; REGISTER_COUNT],
    offsets: [usize; REGISTER_COUNT],
    valid: Bitmap<256>,
    stale: Bitmap<256>,
    used: usize,
    bytes: [u8; N],
}

impl<const N: usize> RegisterTable<N> {
    /// Builds the offset table.
    ///
    /// # Errors
    /// * [`LinkError::MalformedSizeTable`] - `sizes` is not exactly 256 entries
    ///   long or the registers do not fit in `N` bytes
    pub fn new(sizes: &[u16]) -> Result<Self, LinkError> {
        if sizes.len() != REGISTER_COUNT {
            return Err(LinkError::MalformedSizeTable);
        }

        let mut table = Self {
            sizes: [0; REGISTER_COUNT],
            offsets: [0; REGISTER_COUNT],
            valid: Bitmap::new(),
            stale: Bitmap::new(),
            used: 0,
            bytes: [0; N],
        };

        let mut offset = 0usize;
        for (addr, &size) in sizes.iter().enumerate() {
            table.offsets[addr] = offset;
            if size == 0 {
                continue;
            }
            offset += size as usize;
            if offset > N {
                return Err(LinkError::MalformedSizeTable);
            }
            table.sizes[addr] = size;
            table.valid.set(addr, true);
            table.stale.set(addr, true);
        }
        table.used = offset;

        Ok(table)
    }

    /// Declared size of a register, 0 if undefined.
    #[inline]
    pub fn size(&self, addr: u8) -> usize {
        self.sizes[addr as usize] as usize
    }

    #[inline]
    pub fn is_valid(&self, addr: u8) -> bool {
        self.valid.get(addr as usize)
    }

    /// Bytes of the backing buffer in use.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn offset(&self, addr: u8) -> Result<usize, LinkError> {
        self.span(addr).map(|(offset, _)| offset)
    }

    /// Bytes of a register.
    ///
    /// The returned slice always points at the same place in the backing
    /// buffer for the lifetime of the table.
    pub fn at(&self, addr: u8) -> Result<&[u8], LinkError> {
        let (offset, end) = self.span(addr)?;
        Ok(&self.bytes[offset..end])
    }

    pub fn at_mut(&mut self, addr: u8) -> Result<&mut [u8], LinkError> {
        let (offset, end) = self.span(addr)?;
        Ok(&mut self.bytes[offset..end])
    }

    impl_typed_register!(u8, 1);
    impl_typed_register!(u16, 2);
    impl_typed_register!(u32, 4);

    /// Sizes of `count` consecutive registers starting at `first`.
    ///
    /// # Errors
    /// * [`LinkError::ZeroLength`] - `count` is 0
    /// * [`LinkError::TooLong`] - more registers than one burst can carry
    /// * [`LinkError::RegisterRange`] - the range runs past register 0xff
    /// * [`LinkError::InvalidRegister`] - any register in the range is undefined
    pub fn burst_sizes(&self, first: u8, count: usize) -> Result<BurstSizes, LinkError> {
        if count == 0 {
            return Err(LinkError::ZeroLength);
        }
        if count > MAX_BURST_REGISTERS {
            return Err(LinkError::TooLong);
        }
        if first as usize + count > REGISTER_COUNT {
            return Err(LinkError::RegisterRange);
        }

        let mut sizes = BurstSizes::new();
        for addr in first as usize..first as usize + count {
            let size = self.sizes[addr];
            if size == 0 {
                return Err(LinkError::InvalidRegister(addr as u8));
            }
            sizes.push(size).map_err(|_| LinkError::TooLong)?;
        }
        Ok(sizes)
    }

    /// Stores a value received from (or acknowledged by) the device.
    ///
    /// `bytes` must be exactly the register size. Clears the stale mark.
    pub fn store(&mut self, addr: u8, bytes: &[u8]) -> Result<(), LinkError> {
        let size = self.size(addr);
        if size == 0 {
            return Err(LinkError::InvalidRegister(addr));
        }
        if bytes.len() != size {
            return Err(LinkError::SizeMismatch {
                register: addr,
                expected: size,
                actual: bytes.len(),
            });
        }
        self.at_mut(addr)?.copy_from_slice(bytes);
        self.stale.set(addr as usize, false);
        Ok(())
    }

    /// Marks every register stale.
    pub fn invalidate(&mut self) {
        self.stale = self.valid;
    }

    pub fn is_stale(&self, addr: u8) -> bool {
        self.stale.get(addr as usize)
    }

    pub fn any_stale(&self) -> bool {
        !self.stale.is_empty()
    }

    /// Visits every stale register in address order.
    pub fn iter_stale<F>(&self, mut f: F)
    where
        F: FnMut(u8),
    {
        let mut idx = self.stale.first_index();
        while let Some(addr) = idx {
            f(addr as u8);
            idx = self.stale.next_index(addr);
        }
    }

    fn span(&self, addr: u8) -> Result<(usize, usize), LinkError> {
        let size = self.size(addr);
        if size == 0 {
            return Err(LinkError::InvalidRegister(addr));
        }
        let offset = self.offsets[addr as usize];
        Ok((offset, offset + size))
    }
}

/// Checks that a register of `size` bytes can be accessed as a `width`-byte
/// integer and returns how many bytes to copy.
///
/// A 3-byte register is accepted by the 4-byte accessor and zero-extended.
pub(crate) fn check_width(size: usize, addr: u8, width: usize) -> Result<usize, LinkError> {
    if size == 0 {
        return Err(LinkError::InvalidRegister(addr));
    }
    if size == width || (width == 4 && size == 3) {
        Ok(size)
    } else {
        Err(LinkError::SizeMismatch {
            register: addr,
            expected: width,
            actual: size,
        })
    }
}

/// Little-endian value of a 1..=4 byte payload, 0 for anything longer.
pub(crate) fn scalar(bytes: &[u8]) -> u32 {
    if bytes.is_empty() || bytes.len() > 4 {
        return 0;
    }
    let mut raw = [0u8; 4];
    raw[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}
