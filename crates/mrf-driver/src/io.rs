//! Register window and volatile I/O primitives.
//!
//! All hardware access funnels through [`RegIo`]: a bounds-checked,
//! width-explicit register interface. [`MmioWindow`] is the real
//! implementation over a bus-mapped pointer; the simulated card in
//! [`crate::sim`] implements the same trait so the full driver stack runs
//! without hardware.
//!
//! Read-modify-write sequences that can race the interrupt handler go
//! through [`RegWindow::lock_irq`], the card's ISR-shared critical section.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Byte ordering of 32-bit accesses through a window.
///
/// PCI bridges for these cards perform per-32-bit-word byte reversal, so a
/// little-endian host already sees natural values (`Native`). Buses that do
/// not reverse (VME) need the window to swap in software (`Swapped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEndian {
    /// The bus already presents natural host values.
    Native,
    /// The window byte-swaps every 32-bit access.
    Swapped,
}

/// Width-explicit register access.
///
/// Out-of-range offsets are a programming error and panic. 32-bit values
/// are natural host values; any per-word byte reversal happens inside the
/// implementation, never in callers.
pub trait RegIo: Send + Sync {
    /// Read an 8-bit register.
    fn read8(&self, offset: usize) -> u8;
    /// Write an 8-bit register.
    fn write8(&self, offset: usize, value: u8);
    /// Read a 16-bit register.
    fn read16(&self, offset: usize) -> u16;
    /// Write a 16-bit register.
    fn write16(&self, offset: usize, value: u16);
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;
    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);
    /// Size of the window in bytes.
    fn len(&self) -> usize;
    /// Whether the window is zero-sized (never true for a real card).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Memory-mapped register window over a bus-provided base pointer.
///
/// The bus-discovery layer owns the mapping; this type only performs
/// volatile, endianness-corrected accesses inside it.
pub struct MmioWindow {
    ptr: *mut u8,
    len: usize,
    endian: BusEndian,
}

impl std::fmt::Debug for MmioWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioWindow")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("endian", &self.endian)
            .finish()
    }
}

// SAFETY: Send - the window owns no thread-local state; the mapping is
// process-wide and remains valid wherever the value moves.
unsafe impl Send for MmioWindow {}

// SAFETY: Sync - all accesses are volatile loads/stores of naturally
// aligned device registers; concurrent access ordering is the hardware's
// contract, arbitrated by RegWindow's critical section where it matters.
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// Wrap a mapped register region.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a device mapping of at least `len` bytes that
    /// outlives the window, and nothing else may unmap it while the window
    /// is alive.
    #[must_use]
    pub unsafe fn new(ptr: *mut u8, len: usize, endian: BusEndian) -> Self {
        Self { ptr, len, endian }
    }

    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset + width <= self.len,
            "register offset {offset:#x}+{width} out of bounds ({:#x})",
            self.len
        );
    }
}

impl RegIo for MmioWindow {
    fn read8(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        // SAFETY: offset is in bounds per check(); the pointer is valid for
        // the window's length per the constructor contract. Volatile is
        // required: the device mutates registers behind the compiler's back.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset)) }
    }

    fn write8(&self, offset: usize, value: u8) {
        self.check(offset, 1);
        // SAFETY: as read8; volatile write triggers device side effects.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset), value) }
    }

    fn read16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        // SAFETY: in bounds, naturally aligned device register.
        let v = unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u16>()) };
        match self.endian {
            BusEndian::Native => v,
            BusEndian::Swapped => v.swap_bytes(),
        }
    }

    fn write16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        let v = match self.endian {
            BusEndian::Native => value,
            BusEndian::Swapped => value.swap_bytes(),
        };
        // SAFETY: in bounds, naturally aligned device register.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u16>(), v) }
    }

    fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: in bounds, naturally aligned device register.
        let v = unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) };
        match self.endian {
            BusEndian::Native => v,
            BusEndian::Swapped => v.swap_bytes(),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        let v = match self.endian {
            BusEndian::Native => value,
            BusEndian::Swapped => value.swap_bytes(),
        };
        // SAFETY: in bounds, naturally aligned device register.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), v) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// The card's ISR-shared critical section.
///
/// On the target platforms the interrupt arrives on a dedicated thread
/// (UIO read loop or bridge dispatch), so a mutex gives the same mutual
/// exclusion the original interrupt-mask discipline did. Register
/// read-modify-write that can race the ISR must hold the guard.
#[derive(Debug, Default)]
pub struct IrqLock {
    inner: Mutex<()>,
}

/// Guard returned by [`IrqLock::lock_irq`].
pub type IrqGuard<'a> = MutexGuard<'a, ()>;

impl IrqLock {
    /// Enter the critical section.
    pub fn lock_irq(&self) -> IrqGuard<'_> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Typed register handle shared by a card and its sub-units.
///
/// Cheap to clone; all clones alias the same window and the same IRQ
/// critical section.
#[derive(Clone)]
pub struct RegWindow {
    io: Arc<dyn RegIo>,
    irq: Arc<IrqLock>,
}

impl std::fmt::Debug for RegWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegWindow")
            .field("len", &self.io.len())
            .finish()
    }
}

impl RegWindow {
    /// Build a window over any register implementation.
    #[must_use]
    pub fn new(io: Arc<dyn RegIo>) -> Self {
        Self {
            io,
            irq: Arc::new(IrqLock::default()),
        }
    }

    /// Read an 8-bit register.
    #[must_use]
    pub fn read8(&self, offset: usize) -> u8 {
        self.io.read8(offset)
    }

    /// Write an 8-bit register.
    pub fn write8(&self, offset: usize, value: u8) {
        self.io.write8(offset, value);
    }

    /// Read a 16-bit register.
    #[must_use]
    pub fn read16(&self, offset: usize) -> u16 {
        self.io.read16(offset)
    }

    /// Write a 16-bit register.
    pub fn write16(&self, offset: usize, value: u16) {
        self.io.write16(offset, value);
    }

    /// Read a 32-bit register.
    #[must_use]
    pub fn read32(&self, offset: usize) -> u32 {
        self.io.read32(offset)
    }

    /// Write a 32-bit register.
    pub fn write32(&self, offset: usize, value: u32) {
        self.io.write32(offset, value);
    }

    /// Set `mask` bits of a 32-bit register; read and write form one
    /// critical section with the ISR.
    pub fn bit_set32(&self, offset: usize, mask: u32) {
        let _irq = self.lock_irq();
        let v = self.io.read32(offset);
        self.io.write32(offset, v | mask);
    }

    /// Clear `mask` bits of a 32-bit register under the critical section.
    pub fn bit_clr32(&self, offset: usize, mask: u32) {
        let _irq = self.lock_irq();
        let v = self.io.read32(offset);
        self.io.write32(offset, v & !mask);
    }

    /// Enter the ISR-shared critical section for a compound update.
    pub fn lock_irq(&self) -> IrqGuard<'_> {
        self.irq.lock_irq()
    }

    /// Window length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.io.len()
    }

    /// Whether the window is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.io.is_empty()
    }
}
