use alloc::vec::Vec;

/// A file pages can be loaded from.
///
/// The loader hands these out; the virtual-memory subsystem only ever reads
/// through them, under the file system lock held by [`crate::system::VmSystem`].
pub trait VmFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// were read. Fewer bytes than requested means the file ended.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VmFile for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let Some(src) = self.get(start..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }
}

impl VmFile for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        self.as_slice().read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }
}

impl VmFile for &'static [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn reads_are_clamped_to_the_file() {
        let file = vec![1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(3, &mut buf), 2);
        assert_eq!(buf, [4, 5, 0, 0]);
        assert_eq!(file.read_at(5, &mut buf), 0);
        assert_eq!(file.read_at(u64::MAX, &mut buf), 0);
        assert_eq!(VmFile::len(&file), 5);
    }
}
