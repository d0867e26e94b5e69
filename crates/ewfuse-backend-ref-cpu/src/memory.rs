use std::collections::BTreeMap;

use ewfuse::{DType, DevicePtr, FuseError, FuseResult};

const BASE_ADDRESS: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;

/// Host-side address space handing out synthetic device pointers.
///
/// Allocations are separated by a guard gap so an out-of-bounds access never
/// silently lands in a neighbouring buffer.
pub(crate) struct Memory {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next: BASE_ADDRESS,
        }
    }
}

impl Memory {
    pub(crate) fn alloc(&mut self, bytes: usize) -> DevicePtr {
        let base = self.next;
        let span = (bytes as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        self.next = base + span + ALIGNMENT;
        self.blocks.insert(base, vec![0; bytes]);
        DevicePtr(base)
    }

    pub(crate) fn free(&mut self, ptr: DevicePtr) -> FuseResult<()> {
        self.blocks
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or_else(|| FuseError::device(format!("free of unknown pointer {ptr}")))
    }

    fn locate(&self, addr: u64, len: usize) -> FuseResult<(u64, usize)> {
        let (&base, block) = self
            .blocks
            .range(..=addr)
            .next_back()
            .ok_or_else(|| FuseError::device(format!("access to unmapped address {addr:#x}")))?;
        let offset = (addr - base) as usize;
        if offset + len > block.len() {
            return Err(FuseError::device(format!(
                "access of {len} bytes at {addr:#x} overruns a {}-byte allocation",
                block.len()
            )));
        }
        Ok((base, offset))
    }

    pub(crate) fn read(&self, addr: u64, len: usize) -> FuseResult<&[u8]> {
        let (base, offset) = self.locate(addr, len)?;
        let block = self
            .blocks
            .get(&base)
            .ok_or_else(|| FuseError::device("allocation vanished"))?;
        Ok(&block[offset..offset + len])
    }

    pub(crate) fn write(&mut self, addr: u64, bytes: &[u8]) -> FuseResult<()> {
        let (base, offset) = self.locate(addr, bytes.len())?;
        let block = self
            .blocks
            .get_mut(&base)
            .ok_or_else(|| FuseError::device("allocation vanished"))?;
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn read_u32(&self, addr: u64) -> FuseResult<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.read(addr, 4)?);
        Ok(u32::from_le_bytes(word))
    }

    pub(crate) fn write_u32(&mut self, addr: u64, value: u32) -> FuseResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub(crate) fn read_i32(&self, addr: u64) -> FuseResult<i32> {
        self.read_u32(addr).map(|w| w as i32)
    }

    /// Loads one element and widens it to a float register.
    pub(crate) fn load(&self, addr: u64, dtype: DType) -> FuseResult<f32> {
        let raw = self.read(addr, dtype.size_in_bytes())?;
        let mut word = [0u8; 4];
        word[..raw.len()].copy_from_slice(raw);
        let bits = u32::from_le_bytes(word);
        Ok(match dtype {
            DType::F32 => f32::from_bits(bits),
            DType::F16 => half::f16::from_bits(bits as u16).to_f32(),
            DType::Si32 => bits as i32 as f32,
            DType::Ui32 => bits as f32,
            DType::Si16 => bits as u16 as i16 as f32,
            DType::Ui16 => bits as u16 as f32,
            DType::Si8 => bits as u8 as i8 as f32,
            DType::Ui8 => bits as u8 as f32,
        })
    }

    /// Stores the low `dtype.size_in_bytes()` bytes of `bits`.
    pub(crate) fn store(&mut self, addr: u64, dtype: DType, bits: u32) -> FuseResult<()> {
        let bytes = bits.to_le_bytes();
        self.write(addr, &bytes[..dtype.size_in_bytes()])
    }
}

/// Byte address of element `elem` of a `dtype` buffer at `base`.
pub(crate) fn element_address(base: DevicePtr, elem: i64, dtype: DType) -> FuseResult<u64> {
    let addr = base.0 as i64 + elem * dtype.size_in_bytes() as i64;
    u64::try_from(addr)
        .map_err(|_| FuseError::device(format!("negative element offset {elem} from {base}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_zeroed_and_bounded() {
        let mut mem = Memory::default();
        let a = mem.alloc(8);
        let b = mem.alloc(8);
        assert!(b.0 >= a.0 + 2 * ALIGNMENT);
        assert_eq!(mem.read(a.0, 8).unwrap(), &[0; 8]);
        assert!(mem.read(a.0 + 4, 8).is_err());
        assert!(mem.read(a.0 + 300, 1).is_err());
        mem.free(a).unwrap();
        assert!(mem.read(a.0, 1).is_err());
    }

    #[test]
    fn narrow_types_sign_extend_on_load() {
        let mut mem = Memory::default();
        let p = mem.alloc(4);
        mem.store(p.0, DType::Si16, (-3i16) as u16 as u32).unwrap();
        assert_eq!(mem.load(p.0, DType::Si16).unwrap(), -3.0);
        assert_eq!(mem.load(p.0, DType::Ui16).unwrap(), 65533.0);
        mem.store(p.0, DType::F16, half::f16::from_f32(1.5).to_bits() as u32)
            .unwrap();
        assert_eq!(mem.load(p.0, DType::F16).unwrap(), 1.5);
    }
}
