//! On-chip flash (ROM) and internal SRAM.
//!
//! Both expose their backing bytes through a shared handle so the bus can
//! register them as fast-path regions.

use crate::bus::{read_le, write_le, Device, Width};
use std::cell::RefCell;
use std::rc::Rc;

/// Flash ROM. Writes are ignored.
pub struct Flash {
    data: Rc<RefCell<Vec<u8>>>,
}

impl Flash {
    pub fn new(size: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0; size])),
        }
    }

    /// Copy a firmware image into flash starting at offset 0; bytes beyond
    /// the flash size are truncated.
    pub fn load(&mut self, image: &[u8]) {
        let mut data = self.data.borrow_mut();
        let len = image.len().min(data.len());
        data[..len].copy_from_slice(&image[..len]);
    }

    pub fn size(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn bytes(&self) -> Rc<RefCell<Vec<u8>>> {
        self.data.clone()
    }
}

impl Device for Flash {
    fn read(&mut self, offset: u32, width: Width) -> u32 {
        read_le(&self.data.borrow(), offset, width)
    }

    fn write(&mut self, _offset: u32, _width: Width, _val: u32) {
        // ROM
    }
}

/// Internal SRAM.
pub struct Sram {
    data: Rc<RefCell<Vec<u8>>>,
}

impl Sram {
    pub fn new(size: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0; size])),
        }
    }

    pub fn bytes(&self) -> Rc<RefCell<Vec<u8>>> {
        self.data.clone()
    }
}

impl Device for Sram {
    fn read(&mut self, offset: u32, width: Width) -> u32 {
        read_le(&self.data.borrow(), offset, width)
    }

    fn write(&mut self, offset: u32, width: Width, val: u32) {
        write_le(&mut self.data.borrow_mut(), offset, width, val);
    }
}
