//! Reference-counted views into packet memory. Their main purpose is to let received and sent
//!  data be sliced, shared and queued without copying.
//!
//! Their salient points are:
//!
//! * a view is an `(offset, len)` range in a shared backing buffer, which is either a page of a
//!   [crate::buffers::buffer_pool::PacketPool] or a standalone buffer for oversized data
//! * cloning a view shares the backing buffer, dropping the last view releases it - for pool
//!   pages this is what makes a page reusable
//! * views never grow, and sub-views are always contained in their parent's range
//! * reading is done through `bytes::Buf` on the borrowed bytes, writing through a
//!   [PacketWriter] that implements `BufMut`
//! * borrowing is per backing buffer: while any view's bytes are borrowed, no view into the
//!   same buffer can be written. Creating a writer fails rather than panics in that case.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::rc::Rc;
use anyhow::{anyhow, bail};
use bytes::buf::UninitSlice;

/// Shared backing memory of packet views. The strong count is the live-reference counter: a
///  page is in use as long as any view (or the pool itself) holds it.
pub(crate) type Storage = Rc<RefCell<Box<[u8]>>>;

pub(crate) fn new_storage(len: usize) -> Storage {
    Rc::new(RefCell::new(vec![0u8; len].into_boxed_slice()))
}

#[derive(Clone, Default)]
pub struct PacketView {
    storage: Option<Storage>,
    offset: usize,
    len: usize,
}

impl PacketView {
    /// the 'no packet' view
    pub fn empty() -> PacketView {
        PacketView::default()
    }

    pub(crate) fn new(storage: Storage, offset: usize, len: usize) -> PacketView {
        debug_assert!(offset + len <= storage.borrow().len());
        PacketView {
            storage: Some(storage),
            offset,
            len,
        }
    }

    /// a view over a standalone copy of `data`, not backed by any pool
    pub fn standalone(data: &[u8]) -> PacketView {
        if data.is_empty() {
            return PacketView::empty();
        }
        let storage = new_storage(data.len());
        storage.borrow_mut().copy_from_slice(data);
        PacketView::new(storage, 0, data.len())
    }

    /// An empty view carries no buffer. This is different from a view of length zero
    ///  (which can only be created as a sub-view)
    pub fn is_empty(&self) -> bool {
        self.storage.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn bytes(&self) -> PacketBytes<'_> {
        PacketBytes {
            inner: self.storage.as_ref().map(|s| s.borrow()),
            offset: self.offset,
            len: self.len,
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// A sequential writer starting at the beginning of this view. This fails if the backing
    ///  buffer is currently borrowed through [PacketView::bytes].
    pub fn writer(&self) -> anyhow::Result<PacketWriter<'_>> {
        PacketWriter::new(self.storage.as_ref(), self.offset, self.offset + self.len)
    }

    /// A view on a sub-range of this view, sharing the same buffer
    pub fn subpacket(&self, start: usize, len: usize) -> anyhow::Result<PacketView> {
        if start + len > self.len {
            bail!("sub-packet {}..{} exceeds packet length {}", start, start + len, self.len);
        }
        Ok(PacketView {
            storage: self.storage.clone(),
            offset: self.offset + start,
            len,
        })
    }

    /// Copies `src` into this view, starting at `offset`. This works when both views share the
    ///  same buffer as long as the ranges are disjoint.
    pub fn copy_from(&self, offset: usize, src: &PacketView) -> anyhow::Result<()> {
        let mut writer = self.writer()?;
        writer.skip(offset)?;
        writer.try_put_view(src)
    }

    fn shares_storage_with(&self, storage: Option<&Storage>) -> bool {
        match (&self.storage, storage) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn storage_ptr(&self) -> Option<*const RefCell<Box<[u8]>>> {
        self.storage.as_ref().map(Rc::as_ptr)
    }
}

impl PartialEq for PacketView {
    fn eq(&self, other: &Self) -> bool {
        self.is_empty() == other.is_empty() && *self.bytes() == *other.bytes()
    }
}

impl Debug for PacketView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "PacketView(empty)")
        }
        else {
            write!(f, "PacketView({:?})", &*self.bytes())
        }
    }
}


/// Borrowed bytes of a [PacketView]
pub struct PacketBytes<'a> {
    inner: Option<Ref<'a, Box<[u8]>>>,
    offset: usize,
    len: usize,
}

impl Deref for PacketBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            Some(buf) => &buf[self.offset..self.offset + self.len],
            None => &[],
        }
    }
}


/// A sequential writer over a fixed range of a packet buffer
pub struct PacketWriter<'a> {
    storage: Option<&'a Storage>,
    buf: Option<RefMut<'a, Box<[u8]>>>,
    start: usize,
    pos: usize,
    end: usize,
}

impl<'a> PacketWriter<'a> {
    pub(crate) fn new(storage: Option<&'a Storage>, start: usize, end: usize) -> anyhow::Result<PacketWriter<'a>> {
        let buf = match storage {
            Some(s) => Some(s.try_borrow_mut()
                .map_err(|_| anyhow!("packet buffer is borrowed for reading"))?),
            None => None,
        };
        Ok(PacketWriter {
            storage,
            buf,
            start,
            pos: start,
            end,
        })
    }

    /// number of bytes written so far
    pub fn written(&self) -> usize {
        self.pos - self.start
    }

    pub fn skip(&mut self, n: usize) -> anyhow::Result<()> {
        if n > self.end - self.pos {
            bail!("cannot skip {} bytes, only {} remaining", n, self.end - self.pos);
        }
        self.pos += n;
        Ok(())
    }

    /// Appends the contents of another view
    pub fn try_put_view(&mut self, src: &PacketView) -> anyhow::Result<()> {
        if src.len() > self.end - self.pos {
            bail!("buffer overflow: {} bytes do not fit into the remaining {}", src.len(), self.end - self.pos);
        }
        let Some(buf) = self.buf.as_mut() else {
            // nothing to copy: only a zero-length source fits into an empty writer
            return Ok(());
        };

        if src.shares_storage_with(self.storage) {
            // the source is borrowed through this writer already
            buf.copy_within(src.offset..src.offset + src.len, self.pos);
        }
        else {
            buf[self.pos..self.pos + src.len].copy_from_slice(&src.bytes());
        }
        self.pos += src.len;
        Ok(())
    }
}

unsafe impl bytes::BufMut for PacketWriter<'_> {
    fn remaining_mut(&self) -> usize {
        self.end - self.pos
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.pos + cnt <= self.end);
        self.pos += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        match self.buf.as_mut() {
            Some(buf) => UninitSlice::new(&mut buf[self.pos..self.end]),
            None => UninitSlice::new(&mut []),
        }
    }
}
