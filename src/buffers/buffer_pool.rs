use std::rc::Rc;
use anyhow::bail;
use tracing::{debug, trace};
use crate::buffers::packet_view::{new_storage, PacketView, PacketWriter, Storage};

/// A bump allocator for packet buffers, handing out [PacketView]s into fixed-size pages.
///
/// Allocation is strictly sequential within the current page. Once the current page has less
///  than one maximum-size packet of room left, allocation moves on to a page that has no live
///  views any more, or to a new page if there is none. Memory is reclaimed in whole pages
///  only - there is no free list and no compaction.
///
/// The number of pages is bounded: if all pages are in use, allocation fails rather than
///  growing without limit.
///
/// A page whose bytes are borrowed through a view at the time of allocation can not be written,
///  so allocation leaves it for another page as if it were full. This is what allows e.g. sending
///  a copy of a received message while reading it.
///
/// NB: Pages are reference counted, so a view keeps its page alive even if it outlives the pool
pub struct PacketPool {
    pages: Vec<Storage>,
    alloc_page: usize,
    alloc_ptr: usize,
    page_size: usize,
    packet_size: usize,
    max_pages: usize,
}

impl PacketPool {
    pub const PACKETS_PER_PAGE: usize = 10;

    pub fn new(packet_size: usize, max_pages: usize) -> PacketPool {
        assert!(packet_size > 0);
        assert!(max_pages > 0);

        let page_size = packet_size * Self::PACKETS_PER_PAGE;
        PacketPool {
            pages: vec![new_storage(page_size)],
            alloc_page: 0,
            alloc_ptr: 0,
            page_size,
            packet_size,
            max_pages,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// number of live views into a page
    pub fn live_refs(&self, page: usize) -> usize {
        Rc::strong_count(&self.pages[page]) - 1
    }

    /// Allocates a zero-initialized view of `size` bytes. A size of zero returns the empty view.
    ///
    /// Sizes above the pool's packet size are served from a standalone buffer outside the pool.
    pub fn allocate(&mut self, size: usize) -> anyhow::Result<PacketView> {
        if size == 0 {
            return Ok(PacketView::empty());
        }
        if size > self.packet_size {
            trace!("allocating standalone buffer of {} bytes", size);
            return Ok(PacketView::new(new_storage(size), 0, size));
        }

        self.ensure_room()?;

        let page = self.pages[self.alloc_page].clone();
        page.try_borrow_mut()?[self.alloc_ptr..self.alloc_ptr + size].fill(0);
        let result = PacketView::new(page, self.alloc_ptr, size);
        self.alloc_ptr += size;
        Ok(result)
    }

    /// Allocates a zero-initialized buffer of `size` bytes that shares its memory with no other
    ///  view. Reassembly buffers are allocated this way: they are written to piecemeal while
    ///  other views into the pool may be borrowed by the application.
    pub fn allocate_exclusive(&self, size: usize) -> PacketView {
        if size == 0 {
            return PacketView::empty();
        }
        trace!("allocating exclusive buffer of {} bytes", size);
        PacketView::new(new_storage(size), 0, size)
    }

    /// Allocates a view holding a copy of `data`
    pub fn allocate_from(&mut self, data: &[u8]) -> anyhow::Result<PacketView> {
        let result = self.allocate(data.len())?;
        if !result.is_empty() {
            let mut writer = result.writer()?;
            bytes::BufMut::put_slice(&mut writer, data);
        }
        Ok(result)
    }

    /// Lets `f` write up to one maximum-size packet directly at the allocation position, and
    ///  allocates exactly the bytes that were written. If `f` fails, nothing is allocated.
    pub fn allocate_with<F>(&mut self, f: F) -> anyhow::Result<PacketView>
    where F: FnOnce(&mut PacketWriter) -> anyhow::Result<()>
    {
        self.ensure_room()?;

        let page = self.pages[self.alloc_page].clone();
        let written = {
            let mut writer = PacketWriter::new(Some(&page), self.alloc_ptr, self.alloc_ptr + self.packet_size)?;
            f(&mut writer)?;
            writer.written()
        };

        if written == 0 {
            return Ok(PacketView::empty());
        }
        let result = PacketView::new(page, self.alloc_ptr, written);
        self.alloc_ptr += written;
        Ok(result)
    }

    fn ensure_room(&mut self) -> anyhow::Result<()> {
        if self.page_size - self.alloc_ptr >= self.packet_size {
            if self.pages[self.alloc_page].try_borrow_mut().is_ok() {
                return Ok(());
            }
            debug!("pool page #{} is borrowed - allocating elsewhere", self.alloc_page);
        }

        // NB: the current page is a candidate as well
        if let Some(free) = (0..self.pages.len()).find(|&i| self.live_refs(i) == 0) {
            trace!("recycling pool page #{}", free);
            self.alloc_page = free;
            self.alloc_ptr = 0;
            return Ok(());
        }

        if self.pages.len() >= self.max_pages {
            bail!("packet pool exhausted: all {} pages are in use", self.pages.len());
        }

        debug!("all pool pages in use - adding page #{}", self.pages.len());
        self.pages.push(new_storage(self.page_size));
        self.alloc_page = self.pages.len() - 1;
        self.alloc_ptr = 0;
        Ok(())
    }
}
