//! GDT descriptor parsing needed to reload the host task register.

use bit_field::BitField;
use x86::segmentation::{SegmentSelector, SystemDescriptorTypes64};

use super::cross_page::Dtr;

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SegmentError {
    #[error("`{selector:?}` points to the null descriptor")]
    NullDescriptor { selector: SegmentSelector },

    #[error("`{selector:?}` points to LDT")]
    LdtAccess { selector: SegmentSelector },

    #[error("`{index}` points to outside GDT")]
    OutOfGdtAccess { index: usize },

    #[error("`{index}` points to `{entry:#x}`, which is not a TSS descriptor")]
    NotTss { index: usize, entry: u64 },
}

/// Reads the GDT entry `index`.
///
/// # Safety
///
/// `gdtr` must describe a readable GDT and `index` must be within it.
pub(crate) unsafe fn gdt_entry(gdtr: &Dtr, index: usize) -> u64 {
    debug_assert!(index < gdtr.entries());
    unsafe { (gdtr.base as *const u64).add(index).read_volatile() }
}

/// Writes the GDT entry `index`.
///
/// # Safety
///
/// `gdtr` must describe a writable GDT and `index` must be within it.
pub(crate) unsafe fn set_gdt_entry(gdtr: &Dtr, index: usize, value: u64) {
    debug_assert!(index < gdtr.entries());
    unsafe { (gdtr.base as *mut u64).add(index).write_volatile(value) };
}

/// The 16-byte system descriptor of a 64-bit TSS, as found in a GDT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TssDescriptor {
    pub(crate) index: usize,
    low64: DescriptorLow,
    pub(crate) high64: u64,
}

impl TssDescriptor {
    /// Locates the TSS descriptor `selector` refers to in the GDT `gdtr`.
    pub(crate) fn try_from_gdtr(gdtr: &Dtr, selector: u16) -> Result<Self, SegmentError> {
        let selector = SegmentSelector::from_raw(selector);
        if selector.contains(SegmentSelector::TI_LDT) {
            return Err(SegmentError::LdtAccess { selector });
        }

        let index = selector.index() as usize;
        if index == 0 {
            return Err(SegmentError::NullDescriptor { selector });
        }
        if index + 1 >= gdtr.entries() {
            return Err(SegmentError::OutOfGdtAccess { index: index + 1 });
        }

        // Safety: both entries are within the limit of the live GDT.
        let (low, high) = unsafe { (gdt_entry(gdtr, index), gdt_entry(gdtr, index + 1)) };
        let low64 = DescriptorLow::from(low);
        if !low64.is_tss() {
            return Err(SegmentError::NotTss { index, entry: low });
        }
        Ok(Self {
            index,
            low64,
            high64: high,
        })
    }

    pub(crate) fn base(&self) -> u64 {
        u64::from(self.low64.base()) | (self.high64.get_bits(0..32) << 32)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.low64.type_() == SystemDescriptorTypes64::TssBusy as u8
    }

    /// The low 8 bytes of the descriptor with the busy bit cleared.
    pub(crate) fn low64_available(&self) -> u64 {
        let mut raw = self.low64.raw;
        let _ = raw.set_bits(40..44, u64::from(SystemDescriptorTypes64::TssAvailable as u8));
        raw
    }
}

/// The first 8 bytes of a GDT entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DescriptorLow {
    raw: u64,
}

impl DescriptorLow {
    fn type_(&self) -> u8 {
        self.raw.get_bits(40..44) as u8
    }

    /// A system descriptor (S clear) of type available or busy 64-bit TSS.
    fn is_tss(&self) -> bool {
        if self.raw.get_bit(44) {
            return false;
        }
        [SystemDescriptorTypes64::TssAvailable, SystemDescriptorTypes64::TssBusy]
            .into_iter()
            .any(|ty| ty as u8 == self.type_())
    }

    /// Base bits 0 to 31, split across bytes 2-4 and 7.
    fn base(&self) -> u32 {
        let low = self.raw.get_bits(16..40);
        let high = self.raw.get_bits(56..64);
        (low | (high << 24)) as u32
    }
}

impl From<u64> for DescriptorLow {
    fn from(raw: u64) -> Self {
        Self { raw }
    }
}
