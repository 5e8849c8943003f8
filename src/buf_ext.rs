use anyhow::bail;

// `BufMut::put_*` panics on overflow - these variants refuse to write instead, leaving the
//  buffer unchanged

macro_rules! put_try_impl {
    ($try_putter: ident, $ty:ty, $putter: ident) => {
        fn $try_putter(&mut self, value: $ty) -> anyhow::Result<()> {
            if self.remaining_mut() < size_of::<$ty>() {
                bail!("buffer overflow");
            }
            self.$putter(value);
            Ok(())
        }
    }
}

pub trait BufMutExt: bytes::BufMut {
    put_try_impl!(try_put_u8, u8, put_u8);
    put_try_impl!(try_put_u16_le, u16, put_u16_le);
    put_try_impl!(try_put_u32_le, u32, put_u32_le);

    fn try_put_slice(&mut self, src: &[u8]) -> anyhow::Result<()> {
        if self.remaining_mut() < src.len() {
            bail!("buffer overflow: {} bytes do not fit into the remaining {}", src.len(), self.remaining_mut());
        }
        self.put_slice(src);
        Ok(())
    }
}

impl <T: bytes::BufMut> BufMutExt for T {
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fits(4, true, vec![1,0,0,0])]
    #[case::exact_overflow(3, false, vec![])]
    #[case::empty(0, false, vec![])]
    fn test_try_put_u32(#[case] capacity: usize, #[case] expected_ok: bool, #[case] expected: Vec<u8>) {
        let mut backing = vec![0u8; capacity];
        let mut buf: &mut [u8] = &mut backing;
        assert_eq!(buf.try_put_u32_le(1).is_ok(), expected_ok);
        let written = capacity - buf.len();
        assert_eq!(&backing[..written], expected.as_slice());
    }

    #[test]
    fn test_try_put_slice_leaves_buffer_unchanged() {
        let mut backing = vec![9u8; 2];
        let mut buf: &mut [u8] = &mut backing;
        assert!(buf.try_put_slice(&[1, 2, 3]).is_err());
        assert_eq!(buf.len(), 2);
        buf.try_put_slice(&[1, 2]).unwrap();
        assert_eq!(backing, vec![1, 2]);
    }
}
